//! The boundary to the native codec engine.
//!
//! [`NativeEngine`] mirrors the engine ABI one call per method, but in safe
//! Rust: buffers are length-checked slices and handles are opaque integers.
//! Errors do not travel through return values. Like the native library, every
//! failing call leaves a message on an error channel scoped to the handle (or
//! to creation when no handle exists yet) which the caller must read and clear
//! before the next call on that scope.

use std::fmt;
use std::num::NonZeroU32;

use crate::{DecoderConfig, EncoderConfig};

cfg_if::cfg_if! {
    if #[cfg(feature = "soft")] {
        mod soft;
        pub use soft::SoftwareEngine;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "nvpipe")] {
        mod nvpipe;
        pub use nvpipe::NvPipeEngine;
    }
}

/// Opaque native codec handle. Zero is reserved for "no handle".
pub type NativeHandle = NonZeroU32;

/// Index of an asynchronous task inside the native engine's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeTaskIndex(pub u32);

impl fmt::Display for NativeTaskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Status of a native asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeTaskStatus {
    /// Not finished yet.
    Pending,
    /// Finished; the engine holds `encoded_size` result bytes until the task is cleared.
    Succeeded {
        /// Number of encoded bytes.
        encoded_size: usize,
    },
    /// Finished with an error.
    Failed(String),
}

/// A native codec engine.
///
/// Implementations are not expected to serialize concurrent calls on the same
/// handle; sessions guarantee a single caller per handle.
pub trait NativeEngine: Send + Sync + fmt::Debug {
    /// Allocates an encoder handle. Returns `None` and reports on the creation
    /// scope if allocation fails.
    fn create_encoder(&self, config: &EncoderConfig) -> Option<NativeHandle>;

    /// Allocates a decoder handle. Returns `None` and reports on the creation
    /// scope if allocation fails.
    fn create_decoder(&self, config: &DecoderConfig) -> Option<NativeHandle>;

    /// Changes the target bitrate of an encoder.
    fn set_bitrate(&self, handle: NativeHandle, bitrate: u64, target_fps: u32);

    /// Encodes one frame synchronously and returns the number of bytes written to `dst`.
    #[allow(clippy::too_many_arguments)]
    fn encode(
        &self,
        handle: NativeHandle,
        src: &[u8],
        src_pitch: usize,
        dst: &mut [u8],
        width: u32,
        height: u32,
        force_keyframe: bool,
    ) -> usize;

    /// Decodes one packet synchronously and returns the number of bytes written to `dst`.
    fn decode(&self, handle: NativeHandle, src: &[u8], dst: &mut [u8], width: u32, height: u32)
    -> usize;

    /// Queues a texture for asynchronous encoding without blocking.
    ///
    /// Returns `None` and reports on the handle scope if the task was rejected.
    fn enqueue_async(
        &self,
        handle: NativeHandle,
        texture: u32,
        width: u32,
        height: u32,
        force_keyframe: bool,
    ) -> Option<NativeTaskIndex>;

    /// Lets the engine make progress on queued work. Must not block.
    fn kick(&self);

    /// Reads the status of an asynchronous task.
    fn query_async(&self, index: NativeTaskIndex) -> NativeTaskStatus;

    /// Copies the result of a succeeded task into `dst` and returns the number of bytes copied.
    fn copy_async_result(&self, index: NativeTaskIndex, dst: &mut [u8]) -> usize;

    /// Releases the engine side resources of a finished task.
    fn clear_async(&self, index: NativeTaskIndex);

    /// Returns the pending message of an error scope, if any.
    fn last_error(&self, scope: Option<NativeHandle>) -> Option<String>;

    /// Clears the message of an error scope.
    fn clear_error(&self, scope: Option<NativeHandle>);

    /// Releases a codec handle.
    fn destroy(&self, handle: NativeHandle);

    /// Most asynchronous tasks the engine can hold at once, if it is bounded.
    fn task_capacity(&self) -> Option<usize> {
        None
    }

    /// Whether finished asynchronous tasks must be cleared in submission order.
    fn clears_in_order(&self) -> bool {
        false
    }
}

/// Reads and clears the error channel of `scope` in one step.
pub(crate) fn take_error(engine: &dyn NativeEngine, scope: Option<NativeHandle>) -> Option<String> {
    let message = engine.last_error(scope).filter(|message| !message.is_empty())?;
    engine.clear_error(scope);
    Some(message)
}
