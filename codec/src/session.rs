//! Codec sessions: one native handle each, with fixed frame parameters.

use log::{info, warn};

use crate::scheduler::{Scheduler, SessionToken};
use crate::sys::{self, NativeEngine, NativeHandle};
use crate::{CodecError, DecoderConfig, EncoderConfig, Result, TaskHandle, TextureRef};

/// Native handle ownership shared by encoders and decoders.
#[derive(Debug)]
struct Session {
    scheduler: Scheduler,
    token: SessionToken,
    handle: Option<NativeHandle>,
    kind: &'static str,
}

impl Session {
    fn open(
        scheduler: &Scheduler,
        kind: &'static str,
        create: impl FnOnce(&dyn NativeEngine) -> Option<NativeHandle>,
    ) -> Result<Self> {
        let engine = scheduler.engine().as_ref();
        let handle = create(engine);
        if let Some(message) = sys::take_error(engine, None) {
            if let Some(handle) = handle {
                engine.destroy(handle);
            }
            return Err(CodecError::Creation(message));
        }
        let handle = handle.ok_or_else(|| {
            CodecError::Creation(format!("engine returned no {kind} handle"))
        })?;

        Ok(Self {
            scheduler: scheduler.clone(),
            token: scheduler.register_session(),
            handle: Some(handle),
            kind,
        })
    }

    fn engine(&self) -> &dyn NativeEngine {
        self.scheduler.engine().as_ref()
    }

    fn handle(&self) -> Result<NativeHandle> {
        self.handle.ok_or(CodecError::Closed)
    }

    /// Runs a native call and turns a message left on the error channel into an error.
    fn call<T>(&self, call: impl FnOnce(&dyn NativeEngine, NativeHandle) -> T) -> Result<T> {
        let handle = self.handle()?;
        let engine = self.engine();
        let value = call(engine, handle);
        match sys::take_error(engine, Some(handle)) {
            Some(message) => Err(CodecError::Call(message)),
            None => Ok(value),
        }
    }

    fn close(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.scheduler.close_session(&self.token);
        let engine = self.scheduler.engine().as_ref();
        if let Some(message) = sys::take_error(engine, Some(handle)) {
            warn!("{} closed with an unread error: {message}", self.kind);
        }
        engine.destroy(handle);
        info!("{} session {} destroyed", self.kind, handle);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// A hardware encoder session.
///
/// Frames can be encoded synchronously from a CPU buffer with
/// [`encode`](Self::encode), or asynchronously from a GPU texture with
/// [`encode_texture_async`](Self::encode_texture_async) when the session was
/// created with [`EncoderConfig::texture_input`].
#[derive(Debug)]
pub struct Encoder {
    session: Session,
    config: EncoderConfig,
}

impl Encoder {
    /// Creates an encoder.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Creation`] with the engine diagnostic if the native
    /// handle could not be allocated.
    pub fn new(scheduler: &Scheduler, config: EncoderConfig) -> Result<Self> {
        let session = Session::open(scheduler, "encoder", |engine| engine.create_encoder(&config))?;
        info!(
            "encoder created: {:?} {:?} {}x{} {:?}, {} bit/s at {} fps",
            config.codec,
            config.format,
            config.width,
            config.height,
            config.compression,
            config.bitrate,
            config.target_fps
        );
        Ok(Self { session, config })
    }

    /// Returns the session parameters.
    #[must_use]
    pub const fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Returns `true` once the session was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.session.handle.is_none()
    }

    /// Encodes one frame and returns the number of bytes written to `output`.
    ///
    /// `input` must hold exactly one frame (`height` rows of
    /// [`EncoderConfig::pitch`] bytes). `output` bounds the compressed size; an
    /// undersized buffer is reported by the engine.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Closed`] after [`close`](Self::close),
    /// [`CodecError::BufferSize`] for a wrongly sized input and
    /// [`CodecError::Call`] when the engine reports a failure.
    pub fn encode(&mut self, input: &[u8], output: &mut [u8], force_keyframe: bool) -> Result<usize> {
        self.session.handle()?;
        let expected = self.config.frame_size();
        if input.len() != expected {
            return Err(CodecError::BufferSize {
                what: "encoder input",
                expected,
                actual: input.len(),
            });
        }

        let config = &self.config;
        self.session.call(|engine, handle| {
            engine.encode(
                handle,
                input,
                config.pitch(),
                output,
                config.width,
                config.height,
                force_keyframe,
            )
        })
    }

    /// Queues a texture for encoding and returns immediately.
    ///
    /// The returned handle is pending until a later [`Scheduler::tick`] observes
    /// the result.
    ///
    /// # Errors
    ///
    /// Fails without allocating a task if the session is closed, was not created
    /// for texture input, the texture does not match the session format or size,
    /// the scheduler is at capacity, or the engine rejects the submission.
    pub fn encode_texture_async(
        &mut self,
        texture: &TextureRef,
        force_keyframe: bool,
    ) -> Result<TaskHandle> {
        let handle = self.session.handle()?;
        if !self.config.texture_input {
            return Err(CodecError::Unsupported(
                "encoder was not created for texture input".into(),
            ));
        }
        if texture.format != self.config.format {
            return Err(CodecError::FormatMismatch {
                expected: self.config.format,
                actual: texture.format,
            });
        }
        if (texture.width, texture.height) != (self.config.width, self.config.height) {
            return Err(CodecError::DimensionMismatch {
                expected: (self.config.width, self.config.height),
                actual: (texture.width, texture.height),
            });
        }

        self.session
            .scheduler
            .submit(&self.session.token, handle, texture, force_keyframe)
    }

    /// Changes the target bitrate and frame rate.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Closed`] after [`close`](Self::close) and
    /// [`CodecError::Call`] when the engine rejects the change.
    pub fn set_bitrate(&mut self, bitrate: u64, target_fps: u32) -> Result<()> {
        self.session
            .call(|engine, handle| engine.set_bitrate(handle, bitrate, target_fps))?;
        self.config.bitrate = bitrate;
        self.config.target_fps = target_fps;
        Ok(())
    }

    /// Releases the native handle. Pending tasks of this encoder resolve as
    /// closed. Calling it again does nothing.
    pub fn close(&mut self) {
        self.session.close();
    }
}

/// A hardware decoder session.
#[derive(Debug)]
pub struct Decoder {
    session: Session,
    config: DecoderConfig,
}

impl Decoder {
    /// Creates a decoder.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Creation`] with the engine diagnostic if the native
    /// handle could not be allocated.
    pub fn new(scheduler: &Scheduler, config: DecoderConfig) -> Result<Self> {
        let session = Session::open(scheduler, "decoder", |engine| engine.create_decoder(&config))?;
        info!(
            "decoder created: {:?} {:?} {}x{}",
            config.codec, config.format, config.width, config.height
        );
        Ok(Self { session, config })
    }

    /// Returns the session parameters.
    #[must_use]
    pub const fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Returns `true` once the session was closed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.session.handle.is_none()
    }

    /// Decodes one packet into `output` and returns the number of bytes written.
    ///
    /// `output` must hold at least one frame (`height` rows of
    /// [`DecoderConfig::pitch`] bytes).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Closed`] after [`close`](Self::close),
    /// [`CodecError::BufferSize`] for an undersized output and
    /// [`CodecError::Call`] when the engine reports a failure.
    pub fn decode(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        self.session.handle()?;
        let expected = self.config.frame_size();
        if output.len() < expected {
            return Err(CodecError::BufferSize {
                what: "decoder output",
                expected,
                actual: output.len(),
            });
        }

        let config = &self.config;
        self.session.call(|engine, handle| {
            engine.decode(handle, input, output, config.width, config.height)
        })
    }

    /// Releases the native handle. Calling it again does nothing.
    pub fn close(&mut self) {
        self.session.close();
    }
}
