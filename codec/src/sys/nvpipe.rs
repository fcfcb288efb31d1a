//! Binding to the NVIDIA NvPipe plugin.
//!
//! NvPipe keeps a single process wide ring of asynchronous texture tasks.
//! Tasks must be cleared in submission order, so schedulers over this engine
//! always poll with [`PollStrategy::InOrder`](crate::PollStrategy::InOrder).
//! Texture ids are OpenGL texture names owned by the host, and
//! [`kick`](NativeEngine::kick) must run on the thread owning the GL context.

use std::ffi::{CStr, c_char};
use std::num::NonZeroU32;

use log::{debug, warn};

use super::{NativeEngine, NativeHandle, NativeTaskIndex, NativeTaskStatus};
use crate::{CodecType, Compression, DecoderConfig, EncoderConfig, PixelFormat};

#[link(name = "NvPipe")]
unsafe extern "C" {
    fn NvPipe_CreateEncoder(
        format: u32,
        codec: u32,
        compression: u32,
        bitrate: u64,
        target_fps: u32,
        width: u32,
        height: u32,
    ) -> u32;
    fn NvPipe_CreateTextureAsyncEncoder(
        format: u32,
        codec: u32,
        compression: u32,
        bitrate: u64,
        target_fps: u32,
        width: u32,
        height: u32,
    ) -> u32;
    fn NvPipe_CreateDecoder(format: u32, codec: u32, width: u32, height: u32) -> u32;
    fn NvPipe_SetBitrate(pipe: u64, bitrate: u64, target_fps: u32);
    fn NvPipe_Encode(
        pipe: u32,
        src: *const u8,
        src_pitch: u64,
        dst: *mut u8,
        dst_size: u64,
        width: u32,
        height: u32,
        force_iframe: bool,
    ) -> u64;
    fn NvPipe_Decode(
        pipe: u32,
        src: *const u8,
        src_size: u64,
        dst: *mut u8,
        width: u32,
        height: u32,
    ) -> u64;
    fn NvPipe_QueueEncodeTaskInMainThread(
        pipe: u32,
        texture: u32,
        width: u32,
        height: u32,
        force_iframe: bool,
    ) -> u32;
    fn NvPipe_RenderThreadPoll(event: i32);
    fn NvPipe_EncodeTextureAsyncQuery(
        task: u32,
        is_done: *mut bool,
        is_error: *mut bool,
        data: *mut *const u8,
        size: *mut u64,
        error: *mut *const c_char,
    );
    fn NvPipe_EncodeTextureAsyncClearTask(task: u32);
    fn NvPipe_ResetEncodeTasks();
    fn NvPipe_Destroy(pipe: u32);
    fn NvPipe_GetError(pipe: u32) -> *const c_char;
    fn NvPipe_ClearError(pipe: u32);
}

const fn format_code(format: PixelFormat) -> u32 {
    match format {
        PixelFormat::Rgba32 => 0,
        PixelFormat::Uint4 => 1,
        PixelFormat::Uint8 => 2,
        PixelFormat::Uint16 => 3,
        PixelFormat::Uint32 => 4,
    }
}

const fn codec_code(codec: CodecType) -> u32 {
    match codec {
        CodecType::H264 => 0,
        CodecType::Hevc => 1,
    }
}

const fn compression_code(compression: Compression) -> u32 {
    match compression {
        Compression::Lossy => 0,
        Compression::Lossless => 1,
    }
}

/// Slots in the plugin's task ring. One always stays free to tell a full ring
/// from an empty one.
const RING_SLOTS: usize = 20;

/// Scope 0 is the shared channel used for creation and queue errors.
fn scope_code(scope: Option<NativeHandle>) -> u32 {
    scope.map_or(0, NonZeroU32::get)
}

fn byte_count(size: u64) -> usize {
    usize::try_from(size).unwrap_or(usize::MAX)
}

/// Result of one `NvPipe_EncodeTextureAsyncQuery` call.
struct Query {
    done: bool,
    error: Option<String>,
    data: *const u8,
    size: u64,
}

/// [`NativeEngine`] backed by the NvPipe shared library.
///
/// Only one instance may exist per process: the plugin's task ring is global
/// and is reset on construction and on drop.
#[derive(Debug)]
pub struct NvPipeEngine {
    _private: (),
}

impl NvPipeEngine {
    /// Binds the plugin and clears any task left in its ring.
    #[must_use]
    pub fn new() -> Self {
        // SAFETY: takes no arguments; only resets plugin side bookkeeping.
        unsafe { NvPipe_ResetEncodeTasks() };
        debug!("NvPipe async task ring reset");
        Self { _private: () }
    }

    fn query(&self, index: NativeTaskIndex) -> Query {
        let mut done = false;
        let mut failed = false;
        let mut data: *const u8 = std::ptr::null();
        let mut size = 0_u64;
        let mut error: *const c_char = std::ptr::null();
        // SAFETY: every out pointer refers to a live local of the declared type.
        unsafe {
            NvPipe_EncodeTextureAsyncQuery(
                index.0,
                &raw mut done,
                &raw mut failed,
                &raw mut data,
                &raw mut size,
                &raw mut error,
            );
        }

        if let Some(message) = self.take_shared_error() {
            return Query {
                done: true,
                error: Some(message),
                data: std::ptr::null(),
                size: 0,
            };
        }
        let error = failed.then(|| {
            // SAFETY: the plugin keeps the message alive until the task is cleared.
            unsafe { message_from(error) }.unwrap_or_else(|| "encode task failed".into())
        });
        Query {
            done,
            error,
            data,
            size,
        }
    }

    fn take_shared_error(&self) -> Option<String> {
        let message = self.last_error(None).filter(|message| !message.is_empty())?;
        self.clear_error(None);
        Some(message)
    }
}

impl Default for NvPipeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NvPipeEngine {
    fn drop(&mut self) {
        // SAFETY: see `new`.
        unsafe { NvPipe_ResetEncodeTasks() };
    }
}

/// Copies a NUL terminated plugin string.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL terminated string that stays valid
/// for the duration of the call.
unsafe fn message_from(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller.
    let message = unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned();
    Some(message)
}

impl NativeEngine for NvPipeEngine {
    fn create_encoder(&self, config: &EncoderConfig) -> Option<NativeHandle> {
        let create = if config.texture_input {
            NvPipe_CreateTextureAsyncEncoder
        } else {
            NvPipe_CreateEncoder
        };
        // SAFETY: plain integer arguments.
        let pipe = unsafe {
            create(
                format_code(config.format),
                codec_code(config.codec),
                compression_code(config.compression),
                config.bitrate,
                config.target_fps,
                config.width,
                config.height,
            )
        };
        NonZeroU32::new(pipe)
    }

    fn create_decoder(&self, config: &DecoderConfig) -> Option<NativeHandle> {
        // SAFETY: plain integer arguments.
        let pipe = unsafe {
            NvPipe_CreateDecoder(
                format_code(config.format),
                codec_code(config.codec),
                config.width,
                config.height,
            )
        };
        NonZeroU32::new(pipe)
    }

    fn set_bitrate(&self, handle: NativeHandle, bitrate: u64, target_fps: u32) {
        // SAFETY: plain integer arguments.
        unsafe { NvPipe_SetBitrate(u64::from(handle.get()), bitrate, target_fps) };
    }

    fn encode(
        &self,
        handle: NativeHandle,
        src: &[u8],
        src_pitch: usize,
        dst: &mut [u8],
        width: u32,
        height: u32,
        force_keyframe: bool,
    ) -> usize {
        // SAFETY: the plugin reads at most `height * src_pitch` bytes from `src`,
        // which the session checked, and writes at most `dst.len()` bytes.
        let written = unsafe {
            NvPipe_Encode(
                handle.get(),
                src.as_ptr(),
                src_pitch as u64,
                dst.as_mut_ptr(),
                dst.len() as u64,
                width,
                height,
                force_keyframe,
            )
        };
        byte_count(written).min(dst.len())
    }

    fn decode(
        &self,
        handle: NativeHandle,
        src: &[u8],
        dst: &mut [u8],
        width: u32,
        height: u32,
    ) -> usize {
        // SAFETY: `src` is read within its length; the session checked that
        // `dst` holds a full `width` x `height` frame.
        let written = unsafe {
            NvPipe_Decode(
                handle.get(),
                src.as_ptr(),
                src.len() as u64,
                dst.as_mut_ptr(),
                width,
                height,
            )
        };
        byte_count(written).min(dst.len())
    }

    fn enqueue_async(
        &self,
        handle: NativeHandle,
        texture: u32,
        width: u32,
        height: u32,
        force_keyframe: bool,
    ) -> Option<NativeTaskIndex> {
        // SAFETY: plain integer arguments.
        let index = unsafe {
            NvPipe_QueueEncodeTaskInMainThread(handle.get(), texture, width, height, force_keyframe)
        };
        // Index 0 is both a valid slot and the failure value; only the error
        // channel tells them apart.
        if self
            .last_error(Some(handle))
            .is_some_and(|message| !message.is_empty())
        {
            return None;
        }
        Some(NativeTaskIndex(index))
    }

    fn kick(&self) {
        // SAFETY: the event id is ignored by the plugin.
        unsafe { NvPipe_RenderThreadPoll(0) };
    }

    fn query_async(&self, index: NativeTaskIndex) -> NativeTaskStatus {
        let query = self.query(index);
        match query {
            Query { done: false, .. } => NativeTaskStatus::Pending,
            Query {
                error: Some(message),
                ..
            } => NativeTaskStatus::Failed(message),
            Query { size, .. } => NativeTaskStatus::Succeeded {
                encoded_size: byte_count(size),
            },
        }
    }

    fn copy_async_result(&self, index: NativeTaskIndex, dst: &mut [u8]) -> usize {
        let query = self.query(index);
        if !query.done || query.error.is_some() || query.data.is_null() {
            return 0;
        }
        let len = byte_count(query.size).min(dst.len());
        // SAFETY: the plugin owns `size` bytes at `data` until the task is cleared,
        // and the task is only cleared after this copy.
        let src = unsafe { std::slice::from_raw_parts(query.data, len) };
        dst[..len].copy_from_slice(src);
        len
    }

    fn clear_async(&self, index: NativeTaskIndex) {
        // SAFETY: plain integer argument.
        unsafe { NvPipe_EncodeTextureAsyncClearTask(index.0) };
        if let Some(message) = self.take_shared_error() {
            warn!("failed to clear native task {index}: {message}");
        }
    }

    fn last_error(&self, scope: Option<NativeHandle>) -> Option<String> {
        // SAFETY: the plugin returns null or a string owned by the scope that
        // stays valid until the next call on it.
        unsafe { message_from(NvPipe_GetError(scope_code(scope))) }
    }

    fn clear_error(&self, scope: Option<NativeHandle>) {
        // SAFETY: plain integer argument.
        unsafe { NvPipe_ClearError(scope_code(scope)) };
    }

    fn destroy(&self, handle: NativeHandle) {
        // SAFETY: the session never uses the handle after this call.
        unsafe { NvPipe_Destroy(handle.get()) };
    }

    fn task_capacity(&self) -> Option<usize> {
        Some(RING_SLOTS - 1)
    }

    fn clears_in_order(&self) -> bool {
        true
    }
}
