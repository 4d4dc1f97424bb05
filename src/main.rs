//! mjpeg-rs binary
//!
//! Wires CLI flags into the pipeline and HTTP server, then supervises both
//! until a termination signal or a fatal pipeline error. Exit codes: 0
//! clean shutdown, 1 fatal pipeline error, 2 bad configuration, 3 bind
//! failure.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mjpeg_rs::capture::{CaptureConfig, CaptureSource, DvTimings, PixelFormat, TestPatternSource};
use mjpeg_rs::encode::EncoderKind;
use mjpeg_rs::error::{ConfigError, Error};
use mjpeg_rs::pipeline::{Pipeline, PipelineConfig};
use mjpeg_rs::server::{ServerConfig, ServerContext, StreamServer};
use mjpeg_rs::stats::ClientRegistry;
use mjpeg_rs::stream::StreamConfig;

#[derive(Parser, Debug)]
#[command(name = "mjpeg-rs")]
#[command(about = "Lightweight MJPEG-over-HTTP streaming server")]
#[command(version)]
struct Cli {
    /// Capture device (use "test" for the built-in pattern source)
    #[arg(long, default_value = "/dev/video0")]
    device: String,

    /// Input connector index
    #[arg(long, default_value_t = 0)]
    input: u32,

    /// Pixel format to request (YUYV, UYVY, RGB24, BGR24, MJPEG, GREY, ...)
    #[arg(long, default_value = "YUYV")]
    format: String,

    /// Requested resolution as WxH
    #[arg(long, default_value = "640x480")]
    resolution: String,

    /// Requested frame rate (0 = driver default)
    #[arg(long, default_value_t = 0)]
    desired_fps: u32,

    /// DV timings: none, query, or a fixed WxH
    #[arg(long, default_value = "none")]
    dv_timings: String,

    /// Keep retrying when the device disappears instead of exiting
    #[arg(long)]
    persistent: bool,

    /// Raw ring depth (>= 2)
    #[arg(long, default_value_t = 4)]
    buffers: u32,

    /// Encode worker count hint
    #[arg(long, default_value_t = 1)]
    workers: u32,

    /// Encoder backend
    #[arg(long, default_value = "cpu")]
    encoder: String,

    /// JPEG quality 1..100
    #[arg(long, default_value_t = 80)]
    quality: u8,

    /// Suppress up to N consecutive identical frames (0 = off)
    #[arg(long, default_value_t = 0)]
    drop_same_frames: u32,

    /// Minimum interval between stream parts per client, in milliseconds
    #[arg(long, default_value_t = 0)]
    stream_interval_ms: u64,

    /// How long after the last frame the stream still counts as online
    #[arg(long, default_value_t = 1000)]
    online_window_ms: u64,

    /// Offline placeholder refresh interval, in milliseconds
    #[arg(long, default_value_t = 1000)]
    offline_refresh_ms: u64,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Listen on a unix socket instead of TCP
    #[arg(long, value_name = "PATH")]
    unix: Option<PathBuf>,

    /// Basic-auth user
    #[arg(long)]
    user: Option<String>,

    /// Basic-auth password
    #[arg(long)]
    passwd: Option<String>,

    /// Serve static files from this directory on /
    #[arg(long = "static", value_name = "DIR")]
    static_dir: Option<PathBuf>,

    /// Access-Control-Allow-Origin value (empty = no CORS header)
    #[arg(long, default_value = "")]
    allow_origin: String,

    /// Unsent bytes a stream client may accumulate before being dropped
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    stream_client_buffer: usize,

    /// Maximum concurrent connections (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    max_clients: usize,

    /// Log level: error, info, verbose or debug
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Identifier reported in /state (default: derived from the PID)
    #[arg(long)]
    instance_id: Option<String>,

    /// Reveal the process command line in /state
    #[arg(long)]
    expose_cmdline: bool,

    /// Reveal the device path in /state
    #[arg(long)]
    expose_path: bool,

    /// Report this WxH in /state instead of the real resolution
    #[arg(long, value_name = "WxH")]
    fake_resolution: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("error: {e}");
        return ExitCode::from(2);
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn init_logging(level: &str) -> Result<(), ConfigError> {
    let filter = match level {
        "error" => "error",
        "info" => "info",
        "verbose" => "debug",
        "debug" => "trace",
        other => {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{other}', expected error|info|verbose|debug"
            )))
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Error> {
    let (pipeline_config, server_config) = build_configs(&cli)?;
    let source = build_source(&cli, &pipeline_config.capture)?;

    tracing::info!(
        device = %cli.device,
        resolution = %cli.resolution,
        encoder = %pipeline_config.encoder,
        quality = pipeline_config.quality,
        "starting"
    );

    let pipeline = Pipeline::start(source, pipeline_config.clone());

    let ctx = Arc::new(ServerContext {
        broadcaster: pipeline.broadcaster(),
        stats: pipeline.stats(),
        clients: ClientRegistry::default(),
        capture: pipeline.capture_view(),
        encoder_kind: pipeline_config.encoder,
        quality: pipeline_config.quality,
        desired_fps: cli.desired_fps,
        instance_id: cli
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("mjpeg-rs-{}", std::process::id())),
        cmdline: cli
            .expose_cmdline
            .then(|| std::env::args().collect::<Vec<_>>().join(" ")),
        device_path: cli.expose_path.then(|| cli.device.clone()),
        fake_resolution: server_config.fake_resolution,
        fallback_resolution: (
            pipeline_config.stream.fallback_width,
            pipeline_config.stream.fallback_height,
        ),
    });

    let server = match StreamServer::bind(server_config, ctx).await {
        Ok(server) => server,
        Err(e) => {
            pipeline.shutdown().await;
            return Err(e);
        }
    };

    let result = tokio::select! {
        result = server.run_until(shutdown_signal()) => result,
        fatal = pipeline.fatal() => Err(fatal),
    };

    pipeline.shutdown().await;
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn build_configs(cli: &Cli) -> Result<(PipelineConfig, ServerConfig), Error> {
    if cli.quality == 0 || cli.quality > 100 {
        return Err(ConfigError::InvalidQuality(cli.quality).into());
    }
    if cli.drop_same_frames > 30 {
        return Err(ConfigError::InvalidDropSame(cli.drop_same_frames).into());
    }

    let (width, height) = parse_resolution(&cli.resolution)?;
    let format = PixelFormat::parse(&cli.format)
        .ok_or_else(|| ConfigError::UnknownFormat(cli.format.clone()))?;
    let encoder = EncoderKind::parse(&cli.encoder)
        .ok_or_else(|| ConfigError::UnknownEncoder(cli.encoder.clone()))?;

    let dv_timings = match cli.dv_timings.as_str() {
        "none" => DvTimings::None,
        "query" => DvTimings::Query,
        fixed => {
            let (w, h) = parse_resolution(fixed)?;
            DvTimings::Fixed {
                width: w,
                height: h,
            }
        }
    };

    let mut capture = CaptureConfig::with_device(cli.device.clone())
        .resolution(width, height)
        .format(format)
        .fps(cli.desired_fps)
        .buffers(cli.buffers)
        .workers(cli.workers)
        .persistent(cli.persistent);
    capture.input_index = cli.input;
    capture.dv_timings = dv_timings;
    capture.validate()?;

    let stream = StreamConfig {
        drop_same_frames: cli.drop_same_frames,
        online_window: Duration::from_millis(cli.online_window_ms),
        offline_refresh: Duration::from_millis(cli.offline_refresh_ms.max(10)),
        quality: cli.quality,
        fallback_width: width,
        fallback_height: height,
    };

    let bind_addr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid host '{}'", cli.host)))?;

    let mut server = ServerConfig::with_addr(bind_addr)
        .max_clients(cli.max_clients)
        .allow_origin(cli.allow_origin.clone())
        .stream_client_buffer(cli.stream_client_buffer)
        .stream_interval(Duration::from_millis(cli.stream_interval_ms));
    server.unix_path = cli.unix.clone();
    server.static_dir = cli.static_dir.clone();
    server.user = cli.user.clone();
    server.passwd = cli.passwd.clone();
    server.fake_resolution = cli
        .fake_resolution
        .as_deref()
        .map(parse_resolution)
        .transpose()?;

    let pipeline = PipelineConfig {
        capture,
        stream,
        encoder,
        quality: cli.quality,
    };

    Ok((pipeline, server))
}

/// Build the capture source for the configured device
///
/// Platform camera drivers implement `CaptureSource` and are wired in by
/// the host build; this binary ships with the deterministic test pattern
/// source for bring-up and demos.
fn build_source(cli: &Cli, capture: &CaptureConfig) -> Result<Box<dyn CaptureSource>, Error> {
    if cli.device == "test" || cli.device.starts_with("test:") {
        let fps = if capture.desired_fps > 0 {
            capture.desired_fps
        } else {
            30
        };
        return Ok(Box::new(TestPatternSource::new(
            capture.desired_width,
            capture.desired_height,
            capture.desired_format,
            fps,
        )));
    }
    Err(ConfigError::Invalid(format!(
        "no capture driver for '{}' in this build; use --device test or link a platform driver",
        cli.device
    ))
    .into())
}

fn parse_resolution(s: &str) -> Result<(u32, u32), ConfigError> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| ConfigError::InvalidResolution(s.into()))?;
    let width = w
        .parse()
        .map_err(|_| ConfigError::InvalidResolution(s.into()))?;
    let height = h
        .parse()
        .map_err(|_| ConfigError::InvalidResolution(s.into()))?;
    if width == 0 || height == 0 {
        return Err(ConfigError::InvalidResolution(s.into()));
    }
    Ok((width, height))
}
