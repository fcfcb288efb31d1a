use crate::PixelFormat;

/// Reference to a GPU texture owned by the host.
///
/// Only the native engine dereferences `id`; this crate checks the described
/// format and size against the session before anything is submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureRef {
    /// Native texture name (an OpenGL texture id for NvPipe).
    pub id: u32,
    /// Pixel format of the texture contents.
    pub format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl TextureRef {
    /// Describes a texture.
    #[must_use]
    pub const fn new(id: u32, format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            id,
            format,
            width,
            height,
        }
    }

    /// Describes an RGBA32 texture.
    #[must_use]
    pub const fn rgba32(id: u32, width: u32, height: u32) -> Self {
        Self::new(id, PixelFormat::Rgba32, width, height)
    }

    /// Bytes in the tightly packed texture contents.
    #[must_use]
    pub const fn byte_len(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }
}
