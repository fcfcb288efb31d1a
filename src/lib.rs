//! # Pipekit
//!
//! Drive blocking hardware video codecs from a frame loop without stalling it.
//!
//! Pipekit wraps a native codec behind sessions and an explicit task scheduler.
//! Synchronous encode and decode calls work on CPU buffers; asynchronous texture
//! encodes return a task handle immediately and are advanced once per host
//! frame.
//!
//! ## Features
//!
//! - `codec`: Sessions, the task scheduler and the in-process software engine.
//! - `nvpipe`: The NVIDIA NvPipe engine binding (links against `NvPipe`).
//!
//! Use the `full` feature to enable everything.
//!
//! ## Example
//!
//! ```toml
//! [dependencies]
//! pipekit = { version = "0.1", features = ["codec"] }
//! ```
//!
//! ```rust
//! # #[cfg(feature = "codec")]
//! # fn main() -> pipekit::codec::Result<()> {
//! use std::sync::Arc;
//! use pipekit::codec::sys::SoftwareEngine;
//! use pipekit::codec::{Decoder, DecoderConfig, Encoder, EncoderConfig, Scheduler, SchedulerConfig};
//!
//! let scheduler = Scheduler::new(Arc::new(SoftwareEngine::new()), SchedulerConfig::default());
//! let config = EncoderConfig::new(64, 64);
//! let mut encoder = Encoder::new(&scheduler, config.clone())?;
//! let mut decoder = Decoder::new(&scheduler, DecoderConfig::from(&config))?;
//!
//! let frame = vec![0x40; config.frame_size()];
//! let mut packet = vec![0; config.frame_size() * 2];
//! let size = encoder.encode(&frame, &mut packet, false)?;
//!
//! let mut restored = vec![0; config.frame_size()];
//! decoder.decode(&packet[..size], &mut restored)?;
//! assert_eq!(restored, frame);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "codec"))]
//! # fn main() {}
//! ```

#[cfg(feature = "codec")]
pub use pipekit_codec as codec;
