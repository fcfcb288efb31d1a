//! Non-blocking scheduling for hardware video codecs.
//!
//! This crate lets a frame-driven host (a game loop, a render loop, a capture
//! pipeline) hand frames to a blocking native codec without stalling its
//! per-frame update. It is organised around four pieces:
//! - **Sessions**: [`Encoder`] and [`Decoder`] each own one native codec handle.
//! - **Scheduler**: [`Scheduler`] owns every asynchronous task and advances them
//!   once per host tick.
//! - **Task handles**: [`TaskHandle`] is a cheap reference used to query status,
//!   read the encoded bytes and dispose the task.
//! - **Engines**: [`sys::NativeEngine`] is the narrow boundary to the codec
//!   itself. [`sys::SoftwareEngine`] runs in-process; `NvPipeEngine` binds the
//!   NVIDIA NvPipe plugin when the `nvpipe` feature is enabled.
//!
//! ```no_run
//! # #[cfg(feature = "soft")]
//! # fn main() -> pipekit_codec::Result<()> {
//! use std::sync::Arc;
//! use pipekit_codec::sys::SoftwareEngine;
//! use pipekit_codec::{Encoder, EncoderConfig, Scheduler, SchedulerConfig, TextureRef};
//!
//! let engine = Arc::new(SoftwareEngine::new());
//! let scheduler = Scheduler::new(engine.clone(), SchedulerConfig::default());
//! let mut encoder = Encoder::new(&scheduler, EncoderConfig::new(64, 64).with_texture_input(true))?;
//!
//! let texture = TextureRef::rgba32(1, 64, 64);
//! engine.upload_texture(&texture, vec![0x80; 64 * 64 * 4])?;
//! let task = encoder.encode_texture_async(&texture, false)?;
//!
//! // Once per host frame.
//! scheduler.tick();
//! if task.is_done() {
//!     if let Ok(bytes) = task.data() {
//!         println!("encoded {} bytes", bytes.len());
//!     }
//!     task.dispose();
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "soft"))]
//! # fn main() {}
//! ```

#![warn(missing_docs)]

mod config;
mod scheduler;
mod session;
mod task;
mod texture;

/// Native codec engines.
pub mod sys;

pub use config::{DEFAULT_MAX_IN_FLIGHT, DecoderConfig, EncoderConfig, PollStrategy, SchedulerConfig};
pub use scheduler::{PollReport, Scheduler};
pub use session::{Decoder, Encoder};
pub use task::{TaskHandle, TaskId, TaskStatus};
pub use texture::TextureRef;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common error type for synchronous codec operations.
///
/// Failures of asynchronous tasks are never returned through this type; they are
/// recorded on the task and read back with [`TaskHandle::error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The native engine could not allocate a codec handle.
    #[error("failed to create codec session: {0}")]
    Creation(String),
    /// The session was already closed.
    #[error("codec session is closed")]
    Closed,
    /// A synchronous native call reported a failure.
    #[error("native codec call failed: {0}")]
    Call(String),
    /// The session does not support the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    /// A texture or buffer uses a different pixel format than the session.
    #[error("pixel format mismatch: session uses {expected:?}, got {actual:?}")]
    FormatMismatch {
        /// Format the session was created with.
        expected: PixelFormat,
        /// Format that was supplied.
        actual: PixelFormat,
    },
    /// A texture has different dimensions than the session.
    #[error("dimension mismatch: session is {expected:?}, got {actual:?}")]
    DimensionMismatch {
        /// Width and height the session was created with.
        expected: (u32, u32),
        /// Width and height that were supplied.
        actual: (u32, u32),
    },
    /// A caller supplied buffer has the wrong size.
    #[error("{what} must be {expected} bytes, got {actual}")]
    BufferSize {
        /// Which buffer was rejected.
        what: &'static str,
        /// Required size in bytes.
        expected: usize,
        /// Supplied size in bytes.
        actual: usize,
    },
    /// A task was used in a state that does not allow the operation.
    #[error("invalid task state: {0}")]
    InvalidState(String),
    /// Too many tasks are outstanding on the scheduler.
    #[error("maximum number of in-flight tasks ({0}) reached; dispose finished tasks or tick the scheduler")]
    QueueFull(usize),
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Supported codec types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CodecType {
    /// H.264 (AVC)
    #[default]
    H264,
    /// H.265 (HEVC)
    Hevc,
}

/// Compression mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Compression {
    /// Bitrate targeted lossy compression.
    #[default]
    Lossy,
    /// Lossless compression; bitrate is ignored.
    Lossless,
}

/// Pixel format of uncompressed frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    /// RGBA, 8 bits per channel.
    #[default]
    Rgba32,
    /// Single channel, 4 bits per pixel.
    Uint4,
    /// Single channel, 8 bits per pixel.
    Uint8,
    /// Single channel, 16 bits per pixel.
    Uint16,
    /// Single channel, 32 bits per pixel.
    Uint32,
}

impl PixelFormat {
    /// Bits used by one pixel.
    #[must_use]
    pub const fn bits_per_pixel(self) -> usize {
        match self {
            Self::Rgba32 | Self::Uint32 => 32,
            Self::Uint4 => 4,
            Self::Uint8 => 8,
            Self::Uint16 => 16,
        }
    }

    /// Bytes in one tightly packed row of `width` pixels.
    ///
    /// Sub-byte formats round up to a whole byte.
    #[must_use]
    pub const fn row_pitch(self, width: u32) -> usize {
        (width as usize * self.bits_per_pixel()).div_ceil(8)
    }

    /// Bytes in a tightly packed `width` x `height` frame.
    #[must_use]
    pub const fn frame_size(self, width: u32, height: u32) -> usize {
        self.row_pitch(width) * height as usize
    }
}
