//! Minimal HTTP/1.1 request parsing and response framing
//!
//! Sans-IO: the parser looks at a byte buffer and either produces a request
//! or asks for more data. The server only ever needs GET with a handful of
//! headers, so this stays deliberately small; anything outside that shape
//! is rejected before routing.

use bytes::{BufMut, BytesMut};

/// Upper bound on request head size (request line + headers)
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

/// Multipart boundary token used by `/stream`
pub const STREAM_BOUNDARY: &str = "boundarydonotcross";

/// Parse failures that end the connection with a 4xx
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("malformed request line")]
    BadRequestLine,

    #[error("malformed header")]
    BadHeader,

    #[error("unsupported version '{0}'")]
    BadVersion(String),

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,
}

/// A parsed request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    /// Path with any query string stripped
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl Request {
    /// Try to parse a complete request head from `buf`
    ///
    /// Returns `Ok(None)` if the head is still incomplete, otherwise the
    /// request plus the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Result<Option<(Request, usize)>, HttpError> {
        let Some(head_end) = find_head_end(buf) else {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(HttpError::HeadTooLarge);
            }
            return Ok(None);
        };
        if head_end > MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }

        let head = std::str::from_utf8(&buf[..head_end]).map_err(|_| HttpError::BadHeader)?;
        let mut lines = head.split("\r\n");

        let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(HttpError::BadRequestLine)?;
        let target = parts.next().ok_or(HttpError::BadRequestLine)?;
        let version = parts.next().ok_or(HttpError::BadRequestLine)?;
        if parts.next().is_some() || method.is_empty() || target.is_empty() {
            return Err(HttpError::BadRequestLine);
        }
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(HttpError::BadVersion(version.into()));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(HttpError::BadHeader)?;
            if name.is_empty() || name.contains(' ') {
                return Err(HttpError::BadHeader);
            }
            headers.push((name.to_ascii_lowercase(), value.trim().to_string()));
        }

        let path = target.split('?').next().unwrap_or(target).to_string();

        Ok(Some((
            Request {
                method: method.to_string(),
                path,
                headers,
            },
            head_end + 4,
        )))
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Response head builder writing exact wire bytes
#[derive(Debug)]
pub struct ResponseHead {
    status: u16,
    reason: &'static str,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: vec![
                ("Server".into(), concat!("mjpeg-rs/", env!("CARGO_PKG_VERSION")).into()),
                ("Connection".into(), "close".into()),
            ],
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// CORS header, added only when an origin is configured
    pub fn allow_origin(mut self, origin: &str) -> Self {
        if !origin.is_empty() {
            self.headers
                .push(("Access-Control-Allow-Origin".into(), origin.into()));
        }
        self
    }

    /// Serialize the head including the terminating blank line
    pub fn write_to(&self, out: &mut BytesMut) {
        out.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());
        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }
        out.put_slice(b"\r\n");
    }
}

/// Serialize one multipart part head for `/stream`
///
/// `X-Timestamp` carries the grab timestamp with six fractional digits.
pub fn write_part_head(out: &mut BytesMut, payload_len: usize, grab_ts: f64, online: bool) {
    out.put_slice(b"--");
    out.put_slice(STREAM_BOUNDARY.as_bytes());
    out.put_slice(b"\r\nContent-Type: image/jpeg\r\n");
    out.put_slice(format!("Content-Length: {payload_len}\r\n").as_bytes());
    out.put_slice(format!("X-Timestamp: {grab_ts:.6}\r\n").as_bytes());
    out.put_slice(format!("X-UStreamer-Online: {}\r\n", if online { 1 } else { 0 }).as_bytes());
    out.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let raw = b"GET /stream HTTP/1.1\r\nHost: cam.local\r\nAccept: */*\r\n\r\n";
        let (request, consumed) = Request::parse(raw).unwrap().unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.path, "/stream");
        assert_eq!(request.header("host"), Some("cam.local"));
        assert_eq!(request.header("HOST"), Some("cam.local"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_strips_query_string() {
        let raw = b"GET /snapshot?t=123 HTTP/1.1\r\n\r\n";
        let (request, _) = Request::parse(raw).unwrap().unwrap();
        assert_eq!(request.path, "/snapshot");
    }

    #[test]
    fn test_incomplete_head_asks_for_more() {
        let raw = b"GET /stream HTTP/1.1\r\nHost: cam";
        assert_eq!(Request::parse(raw).unwrap(), None);
    }

    #[test]
    fn test_bad_request_line_rejected() {
        assert_eq!(
            Request::parse(b"GET/streamHTTP/1.1\r\n\r\n"),
            Err(HttpError::BadRequestLine)
        );
        assert_eq!(
            Request::parse(b"GET /stream HTTP/1.1 extra\r\n\r\n"),
            Err(HttpError::BadRequestLine)
        );
    }

    #[test]
    fn test_unsupported_version_rejected() {
        assert!(matches!(
            Request::parse(b"GET / HTTP/0.9\r\n\r\n"),
            Err(HttpError::BadVersion(_))
        ));
    }

    #[test]
    fn test_oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        assert_eq!(Request::parse(&raw), Err(HttpError::HeadTooLarge));
    }

    #[test]
    fn test_response_head_wire_format() {
        let mut out = BytesMut::new();
        ResponseHead::new(503, "Service Unavailable")
            .header("X-UStreamer-Online", "false")
            .allow_origin("*")
            .write_to(&mut out);

        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("X-UStreamer-Online: false\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_allow_origin_empty_omitted() {
        let mut out = BytesMut::new();
        ResponseHead::new(200, "OK").allow_origin("").write_to(&mut out);
        assert!(!std::str::from_utf8(&out).unwrap().contains("Access-Control"));
    }

    #[test]
    fn test_part_head_wire_format() {
        let mut out = BytesMut::new();
        write_part_head(&mut out, 1234, 12.5, true);
        let text = std::str::from_utf8(&out).unwrap();
        assert_eq!(
            text,
            "--boundarydonotcross\r\nContent-Type: image/jpeg\r\nContent-Length: 1234\r\nX-Timestamp: 12.500000\r\nX-UStreamer-Online: 1\r\n\r\n"
        );
    }

    #[test]
    fn test_part_head_offline_flag() {
        let mut out = BytesMut::new();
        write_part_head(&mut out, 10, 0.0, false);
        assert!(std::str::from_utf8(&out)
            .unwrap()
            .contains("X-UStreamer-Online: 0\r\n"));
    }
}
