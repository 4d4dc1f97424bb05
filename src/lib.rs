//! # mjpeg-rs
//!
//! Lightweight MJPEG-over-HTTP streaming server.
//!
//! Raw frames come from a [`capture::CaptureSource`] (platform camera
//! drivers plug in through that trait), flow through a bounded slot ring
//! into a pool of JPEG encode workers, and the coordinator publishes the
//! results as a strictly ordered stream that HTTP sessions and auxiliary
//! sinks subscribe to.
//!
//! ```text
//!  CaptureSource -> Capturer -> RawRing -> Workers -> Coordinator
//!                                                         |
//!                                    Broadcaster (latest-wins mailboxes)
//!                                       |            |           |
//!                                   /stream      /snapshot     sinks
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mjpeg_rs::capture::{PixelFormat, TestPatternSource};
//! use mjpeg_rs::pipeline::{Pipeline, PipelineConfig};
//! use mjpeg_rs::server::{ServerConfig, ServerContext, StreamServer};
//! use mjpeg_rs::stats::ClientRegistry;
//!
//! #[tokio::main]
//! async fn main() -> mjpeg_rs::Result<()> {
//!     let source = TestPatternSource::new(640, 480, PixelFormat::Yuyv, 30);
//!     let pipeline = Pipeline::start(Box::new(source), PipelineConfig::default());
//!
//!     let ctx = Arc::new(ServerContext {
//!         broadcaster: pipeline.broadcaster(),
//!         stats: pipeline.stats(),
//!         clients: ClientRegistry::default(),
//!         capture: pipeline.capture_view(),
//!         encoder_kind: mjpeg_rs::encode::EncoderKind::Cpu,
//!         quality: 80,
//!         desired_fps: 30,
//!         instance_id: "cam0".into(),
//!         cmdline: None,
//!         device_path: None,
//!         fake_resolution: None,
//!         fallback_resolution: (640, 480),
//!     });
//!
//!     let server = StreamServer::bind(ServerConfig::default(), ctx).await?;
//!     server.run_until(async { tokio::signal::ctrl_c().await.ok(); }).await?;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod capture;
pub mod encode;
pub mod error;
pub mod pipeline;
pub mod ring;
pub mod server;
pub mod stats;
pub mod stream;

pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineConfig};
pub use server::{ServerConfig, StreamServer};
