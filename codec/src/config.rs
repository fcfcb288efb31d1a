use serde::{Deserialize, Serialize};

use crate::{CodecType, Compression, PixelFormat};

/// Default cap on outstanding asynchronous tasks.
///
/// Matches the NvPipe task ring, which has 20 slots and keeps one of them free.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 19;

/// Parameters fixed for the lifetime of an encoder session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Output codec.
    pub codec: CodecType,
    /// Format of the uncompressed input.
    pub format: PixelFormat,
    /// Compression mode.
    pub compression: Compression,
    /// Target bitrate in bits per second. Ignored for lossless compression.
    pub bitrate: u64,
    /// Target frame rate.
    pub target_fps: u32,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Create the native variant that accepts GPU textures asynchronously.
    pub texture_input: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H264,
            format: PixelFormat::Rgba32,
            compression: Compression::Lossy,
            bitrate: 10_000_000,
            target_fps: 30,
            width: 0,
            height: 0,
            texture_input: false,
        }
    }
}

impl EncoderConfig {
    /// Creates a lossy H.264 RGBA configuration for the given frame size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Sets the output codec.
    #[must_use]
    pub const fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the input pixel format.
    #[must_use]
    pub const fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the compression mode.
    #[must_use]
    pub const fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the target bitrate in megabits per second and the target frame rate.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "bitrates are small positive values"
    )]
    pub fn with_bitrate_mbps(mut self, mbps: f32, target_fps: u32) -> Self {
        self.bitrate = (f64::from(mbps.max(0.0)) * 1_000_000.0) as u64;
        self.target_fps = target_fps;
        self
    }

    /// Selects the asynchronous texture input variant.
    #[must_use]
    pub const fn with_texture_input(mut self, texture_input: bool) -> Self {
        self.texture_input = texture_input;
        self
    }

    /// Bytes in one input row.
    #[must_use]
    pub const fn pitch(&self) -> usize {
        self.format.row_pitch(self.width)
    }

    /// Bytes in one uncompressed input frame.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

/// Parameters fixed for the lifetime of a decoder session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Input codec.
    pub codec: CodecType,
    /// Format of the decoded output.
    pub format: PixelFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            codec: CodecType::H264,
            format: PixelFormat::Rgba32,
            width: 0,
            height: 0,
        }
    }
}

impl DecoderConfig {
    /// Creates an H.264 RGBA configuration for the given frame size.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    /// Sets the input codec.
    #[must_use]
    pub const fn with_codec(mut self, codec: CodecType) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the output pixel format.
    #[must_use]
    pub const fn with_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Bytes in one output row.
    #[must_use]
    pub const fn pitch(&self) -> usize {
        self.format.row_pitch(self.width)
    }

    /// Bytes in one decoded output frame.
    #[must_use]
    pub const fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}

impl From<&EncoderConfig> for DecoderConfig {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            codec: config.codec,
            format: config.format,
            width: config.width,
            height: config.height,
        }
    }
}

/// How the scheduler walks its pending queue on each poll pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PollStrategy {
    /// Inspect only the head of the queue and stop at the first pending task.
    ///
    /// Completions become visible in submission order. Relies on the engine
    /// finishing work in the order it was submitted.
    #[default]
    InOrder,
    /// Inspect every queued task on every pass.
    ///
    /// Tolerates engines that complete out of order, at the cost of a linear
    /// scan per tick.
    FullScan,
}

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks that may be queued but not yet resolved.
    pub max_in_flight: usize,
    /// Queue traversal strategy.
    pub strategy: PollStrategy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            strategy: PollStrategy::InOrder,
        }
    }
}
