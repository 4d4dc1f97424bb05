//! Per-connection request handling
//!
//! Each accepted socket gets one task running this module: parse the
//! request head, route it, and for `/stream` run the multipart session
//! until the client leaves, falls too far behind, or the pipeline shuts
//! down.
//!
//! The stream path never uses blocking writes: parts are queued into a
//! per-connection buffer and drained with `try_write` whenever the socket
//! is ready. A client whose unsent backlog would exceed
//! `stream_client_buffer` is disconnected on the spot, so one stalled
//! reader cannot pin memory or delay the broadcast for anyone else.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::time::Instant;

use crate::server::config::ServerConfig;
use crate::server::context::ServerContext;
use crate::server::http::{self, HttpError, Request, ResponseHead};
use crate::server::state::StateSnapshot;
use crate::stream::Subscriber;

/// How long a client may take to deliver its request head
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Built-in landing page
const INDEX_HTML: &str = "<!DOCTYPE html>\n<html>\n<head><title>mjpeg-rs</title></head>\n<body>\n<h1>mjpeg-rs</h1>\n<ul>\n<li><a href=\"/stream\">/stream</a> &mdash; live MJPEG stream</li>\n<li><a href=\"/snapshot\">/snapshot</a> &mdash; current frame</li>\n<li><a href=\"/state\">/state</a> &mdash; server state</li>\n</ul>\n<img src=\"/stream\" alt=\"stream\" />\n</body>\n</html>\n";

/// Accepted socket, TCP or Unix
pub enum ClientSocket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ClientSocket {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            ClientSocket::Tcp(s) => s.read_buf(buf).await,
            #[cfg(unix)]
            ClientSocket::Unix(s) => s.read_buf(buf).await,
        }
    }

    async fn writable(&self) -> io::Result<()> {
        match self {
            ClientSocket::Tcp(s) => s.writable().await,
            #[cfg(unix)]
            ClientSocket::Unix(s) => s.writable().await,
        }
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientSocket::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            ClientSocket::Unix(s) => s.try_write(buf),
        }
    }
}

/// One accepted connection
pub struct Connection {
    session_id: u64,
    socket: ClientSocket,
    peer_addr: SocketAddr,
    config: ServerConfig,
    ctx: Arc<ServerContext>,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: ClientSocket,
        peer_addr: SocketAddr,
        config: ServerConfig,
        ctx: Arc<ServerContext>,
    ) -> Self {
        Self {
            session_id,
            socket,
            peer_addr,
            config,
            ctx,
        }
    }

    /// Handle the connection to completion
    pub async fn run(mut self) -> io::Result<()> {
        let request = match self.read_request().await {
            Ok(request) => request,
            Err(ReadError::Http(e)) => {
                tracing::debug!(session_id = self.session_id, error = %e, "bad request");
                return self.send_simple(400, "Bad Request", "text/plain", b"bad request").await;
            }
            Err(ReadError::Timeout) => return Ok(()),
            Err(ReadError::Closed) => return Ok(()),
            Err(ReadError::Io(e)) => return Err(e),
        };

        if request.method != "GET" {
            return self
                .send_simple(405, "Method Not Allowed", "text/plain", b"method not allowed")
                .await;
        }

        if !self.authorized(&request) {
            let mut out = BytesMut::new();
            ResponseHead::new(401, "Unauthorized")
                .header("WWW-Authenticate", "Basic realm=\"mjpeg-rs\"")
                .header("Content-Length", "0")
                .write_to(&mut out);
            return self.write_all(&out).await;
        }

        tracing::debug!(
            session_id = self.session_id,
            peer = %self.peer_addr,
            path = %request.path,
            "request"
        );

        match request.path.as_str() {
            "/stream" => self.handle_stream().await,
            "/snapshot" => self.handle_snapshot().await,
            "/state" => self.handle_state().await,
            path => self.handle_static(path).await,
        }
    }

    async fn read_request(&mut self) -> Result<Request, ReadError> {
        let mut buf = BytesMut::with_capacity(1024);
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            if let Some((request, _consumed)) = Request::parse(&buf)? {
                return Ok(request);
            }
            let read = tokio::time::timeout_at(deadline, self.socket.read_buf(&mut buf))
                .await
                .map_err(|_| ReadError::Timeout)??;
            if read == 0 {
                return Err(ReadError::Closed);
            }
        }
    }

    fn authorized(&self, request: &Request) -> bool {
        let (Some(user), Some(passwd)) = (&self.config.user, &self.config.passwd) else {
            return true;
        };
        let Some(value) = request.header("authorization") else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return false;
        };
        decoded == format!("{user}:{passwd}").into_bytes()
    }

    /// `GET /state`
    async fn handle_state(&mut self) -> io::Result<()> {
        let snapshot = StateSnapshot::collect(&self.ctx);
        let body = serde_json::to_vec(&snapshot).unwrap_or_else(|_| b"{}".to_vec());

        let mut out = BytesMut::new();
        ResponseHead::new(200, "OK")
            .header("Content-Type", "application/json")
            .header("Content-Length", body.len().to_string())
            .allow_origin(&self.config.allow_origin)
            .write_to(&mut out);
        out.put_slice(&body);
        self.write_all(&out).await
    }

    /// `GET /snapshot`: the current frame, or 503 before the first publish
    async fn handle_snapshot(&mut self) -> io::Result<()> {
        let Some(frame) = self.ctx.broadcaster.current() else {
            let mut out = BytesMut::new();
            ResponseHead::new(503, "Service Unavailable")
                .header("X-UStreamer-Online", "false")
                .header("Content-Length", "0")
                .allow_origin(&self.config.allow_origin)
                .write_to(&mut out);
            return self.write_all(&out).await;
        };

        let mut out = BytesMut::with_capacity(frame.data.len() + 256);
        ResponseHead::new(200, "OK")
            .header("Content-Type", "image/jpeg")
            .header("Content-Length", frame.data.len().to_string())
            .header("X-UStreamer-Online", if frame.online { "true" } else { "false" })
            .header("X-Timestamp", format!("{:.6}", frame.grab_ts))
            .allow_origin(&self.config.allow_origin)
            .write_to(&mut out);
        out.put_slice(&frame.data);
        self.write_all(&out).await
    }

    /// `GET /` and static files
    async fn handle_static(&mut self, path: &str) -> io::Result<()> {
        if !path.starts_with('/') {
            return self.send_simple(404, "Not Found", "text/plain", b"not found").await;
        }
        if let Some(dir) = self.config.static_dir.clone() {
            let rel = if path == "/" { "index.html" } else { &path[1..] };
            // No parent traversal, ever
            if rel.split('/').any(|seg| seg == "..") {
                return self.send_simple(404, "Not Found", "text/plain", b"not found").await;
            }
            return match tokio::fs::read(dir.join(rel)).await {
                Ok(body) => {
                    self.send_simple(200, "OK", content_type_for(rel), &body).await
                }
                Err(_) => self.send_simple(404, "Not Found", "text/plain", b"not found").await,
            };
        }

        if path == "/" {
            self.send_simple(200, "OK", "text/html; charset=utf-8", INDEX_HTML.as_bytes())
                .await
        } else {
            self.send_simple(404, "Not Found", "text/plain", b"not found").await
        }
    }

    /// `GET /stream`: the multipart session
    async fn handle_stream(&mut self) -> io::Result<()> {
        let subscriber = self.ctx.broadcaster.subscribe();
        let client_id = self.ctx.clients.register(self.peer_addr);
        tracing::info!(
            session_id = self.session_id,
            peer = %self.peer_addr,
            clients = self.ctx.clients.count(),
            "stream client connected"
        );

        let result = self.stream_session(subscriber, client_id).await;

        self.ctx.clients.unregister(client_id);
        tracing::info!(
            session_id = self.session_id,
            peer = %self.peer_addr,
            clients = self.ctx.clients.count(),
            "stream client disconnected"
        );
        result
    }

    async fn stream_session(&mut self, mut subscriber: Subscriber, client_id: u64) -> io::Result<()> {
        let mut pending = BytesMut::with_capacity(64 * 1024);

        // Response head with the multipart content type; parts follow as
        // frames arrive. The head echoes the stream geometry and online
        // flag, from the negotiated format or the configured fallback when
        // the source has not probed yet
        let online = self.ctx.broadcaster.current().map(|f| f.online).unwrap_or(false);
        let (width, height) = self
            .ctx
            .capture
            .applied_format()
            .map(|a| (a.width, a.height))
            .unwrap_or(self.ctx.fallback_resolution);
        ResponseHead::new(200, "OK")
            .header(
                "Content-Type",
                format!("multipart/x-mixed-replace;boundary={}", http::STREAM_BOUNDARY),
            )
            .header("Cache-Control", "no-cache, no-store, must-revalidate")
            .header("Pragma", "no-cache")
            .header("X-UStreamer-Width", width.to_string())
            .header("X-UStreamer-Height", height.to_string())
            .header("X-UStreamer-Online", if online { "true" } else { "false" })
            .allow_origin(&self.config.allow_origin)
            .write_to(&mut pending);

        let mut last_part_at: Option<Instant> = None;

        loop {
            // Interframe pacing: sleeping here means the mailbox keeps
            // collapsing to the newest frame, so after the pause we ship
            // the freshest one instead of a backlog
            if let (Some(last), false) = (last_part_at, self.config.stream_interval.is_zero()) {
                tokio::time::sleep_until(last + self.config.stream_interval).await;
            }

            // Await the next frame while draining whatever is still queued
            let frame = loop {
                if pending.is_empty() {
                    match subscriber.next().await {
                        Some(frame) => break Some(frame),
                        None => break None,
                    }
                }
                tokio::select! {
                    next = subscriber.next() => break next,
                    ready = self.socket.writable() => {
                        ready?;
                        self.drain_pending(&mut pending)?;
                    }
                }
            };

            let Some(frame) = frame else {
                // Pipeline shutdown: best-effort flush, then close
                let _ = self.flush_all(&mut pending).await;
                return Ok(());
            };

            // Slow-client cap: the backlog plus this part must fit
            let part_overhead = 128 + frame.data.len() + 2;
            if pending.len() + part_overhead > self.config.stream_client_buffer {
                tracing::warn!(
                    session_id = self.session_id,
                    peer = %self.peer_addr,
                    pending = pending.len(),
                    "client too slow, dropping connection"
                );
                return Ok(());
            }

            http::write_part_head(&mut pending, frame.data.len(), frame.grab_ts, frame.online);
            pending.put_slice(&frame.data);
            pending.put_slice(b"\r\n");
            self.ctx.clients.record_delivery(client_id, frame.data.len() as u64);
            last_part_at = Some(Instant::now());

            // Opportunistic drain so fast clients never wait for the next
            // frame to see this one
            self.drain_pending(&mut pending)?;
        }
    }

    /// Write as much of `pending` as the socket accepts right now
    fn drain_pending(&self, pending: &mut BytesMut) -> io::Result<()> {
        while !pending.is_empty() {
            match self.socket.try_write(pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    let _ = pending.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drain `pending` completely, waiting for socket readiness
    async fn flush_all(&mut self, pending: &mut BytesMut) -> io::Result<()> {
        while !pending.is_empty() {
            self.socket.writable().await?;
            self.drain_pending(pending)?;
        }
        Ok(())
    }

    async fn send_simple(
        &mut self,
        status: u16,
        reason: &'static str,
        content_type: &str,
        body: &[u8],
    ) -> io::Result<()> {
        let mut out = BytesMut::with_capacity(body.len() + 256);
        ResponseHead::new(status, reason)
            .header("Content-Type", content_type)
            .header("Content-Length", body.len().to_string())
            .write_to(&mut out);
        out.put_slice(body);
        self.write_all(&out).await
    }

    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buf = BytesMut::from(data);
        self.flush_all(&mut buf).await
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

enum ReadError {
    Http(HttpError),
    Timeout,
    Closed,
    Io(io::Error),
}

impl From<HttpError> for ReadError {
    fn from(e: HttpError) -> Self {
        ReadError::Http(e)
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}
