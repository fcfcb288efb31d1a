//! In-process software engine.
//!
//! Implements the native engine contract without any GPU: textures are host
//! buffers uploaded with [`SoftwareEngine::upload_texture`], and asynchronous
//! work runs on a worker thread that only picks up jobs on [`NativeEngine::kick`].
//! The bitstream is a run-length coded container private to this engine; it
//! exists so hosts and tests can drive the full submit/poll/transfer cycle.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_channel::{Receiver, Sender, unbounded};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error};

use super::{NativeEngine, NativeHandle, NativeTaskIndex, NativeTaskStatus};
use crate::{CodecError, CodecType, Compression, DecoderConfig, EncoderConfig, PixelFormat, TextureRef};

const MAGIC: &[u8; 4] = b"PKv1";
const HEADER_LEN: usize = 16;
const MAX_DIMENSION: u32 = 8192;
const FLAG_KEYFRAME: u8 = 0b01;
const FLAG_LOSSLESS: u8 = 0b10;

/// Frame parameters carried by a bitstream header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameParams {
    codec: CodecType,
    format: PixelFormat,
    compression: Compression,
    width: u32,
    height: u32,
}

impl FrameParams {
    const fn packed_pitch(&self) -> usize {
        self.format.row_pitch(self.width)
    }

    const fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Bytes compared as one unit by the run-length coder.
    const fn pixel_unit(&self) -> usize {
        self.format.bits_per_pixel().div_ceil(8)
    }
}

#[derive(Debug)]
enum SessionKind {
    Encoder { texture_input: bool, frames: u64 },
    Decoder,
}

#[derive(Debug)]
struct SessionState {
    kind: SessionKind,
    params: FrameParams,
    error: String,
}

#[derive(Debug)]
struct Texture {
    format: PixelFormat,
    width: u32,
    height: u32,
    pixels: Arc<Vec<u8>>,
}

#[derive(Debug)]
enum TaskSlot {
    Pending,
    Done(Vec<u8>),
    Failed(String),
}

#[derive(Debug)]
struct Job {
    index: u32,
    handle: u32,
    params: FrameParams,
    pixels: Arc<Vec<u8>>,
    keyframe: bool,
}

#[derive(Debug, Default)]
struct State {
    next_handle: u32,
    next_task: u32,
    creation_error: String,
    sessions: HashMap<u32, SessionState>,
    textures: HashMap<u32, Texture>,
    staged: Vec<Job>,
    tasks: HashMap<u32, TaskSlot>,
}

impl State {
    fn new() -> Self {
        Self {
            next_handle: 1,
            ..Self::default()
        }
    }

    fn allocate_handle(&mut self, state: SessionState) -> NativeHandle {
        loop {
            let raw = self.next_handle;
            self.next_handle = self.next_handle.wrapping_add(1);
            if let Some(handle) = NativeHandle::new(raw) {
                if !self.sessions.contains_key(&raw) {
                    self.sessions.insert(raw, state);
                    return handle;
                }
            }
        }
    }

    fn allocate_task(&mut self) -> u32 {
        loop {
            let index = self.next_task;
            self.next_task = self.next_task.wrapping_add(1);
            if !self.tasks.contains_key(&index) {
                self.tasks.insert(index, TaskSlot::Pending);
                return index;
            }
        }
    }

    fn error_slot(&mut self, scope: Option<NativeHandle>) -> &mut String {
        let creation = &mut self.creation_error;
        match scope.and_then(|handle| self.sessions.get_mut(&handle.get())) {
            Some(session) => &mut session.error,
            None => creation,
        }
    }

    fn fail(&mut self, scope: Option<NativeHandle>, message: impl Into<String>) {
        *self.error_slot(scope) = message.into();
    }
}

#[derive(Debug)]
struct Worker {
    sender: Sender<Job>,
    thread: JoinHandle<()>,
}

/// A software implementation of [`NativeEngine`].
pub struct SoftwareEngine {
    state: Arc<Mutex<State>>,
    worker: Mutex<Option<Worker>>,
    latency: Duration,
}

impl fmt::Debug for SoftwareEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareEngine")
            .field("latency", &self.latency)
            .finish_non_exhaustive()
    }
}

impl Default for SoftwareEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareEngine {
    /// Creates an engine. The worker thread starts on the first kick.
    #[must_use]
    pub fn new() -> Self {
        Self::with_latency(Duration::ZERO)
    }

    /// Creates an engine whose worker spends at least `latency` on every
    /// asynchronous job, to imitate a busy encoder.
    #[must_use]
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::new())),
            worker: Mutex::new(None),
            latency,
        }
    }

    /// Stores host pixels as the contents of `texture`, replacing earlier contents.
    ///
    /// Tasks already submitted against the texture keep the pixels they were
    /// submitted with.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferSize`] if `pixels` does not match the texture size.
    pub fn upload_texture(&self, texture: &TextureRef, pixels: Vec<u8>) -> crate::Result<()> {
        if pixels.len() != texture.byte_len() {
            return Err(CodecError::BufferSize {
                what: "texture contents",
                expected: texture.byte_len(),
                actual: pixels.len(),
            });
        }
        self.state().textures.insert(
            texture.id,
            Texture {
                format: texture.format,
                width: texture.width,
                height: texture.height,
                pixels: Arc::new(pixels),
            },
        );
        Ok(())
    }

    /// Forgets a texture. Returns `true` if it existed.
    pub fn remove_texture(&self, id: u32) -> bool {
        self.state().textures.remove(&id).is_some()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn spawn_worker(&self) -> std::io::Result<Worker> {
        let (sender, receiver) = unbounded();
        let state = Arc::clone(&self.state);
        let latency = self.latency;
        let thread = thread::Builder::new()
            .name("pipekit-soft-engine".into())
            .spawn(move || run_worker(&receiver, &state, latency))?;
        Ok(Worker { sender, thread })
    }
}

impl Drop for SoftwareEngine {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .expect("worker mutex poisoned")
            .take();
        if let Some(worker) = worker {
            worker.sender.close();
            if worker.thread.join().is_err() {
                error!("software engine worker panicked");
            }
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().expect("software engine state mutex poisoned")
}

fn run_worker(receiver: &Receiver<Job>, state: &Mutex<State>, latency: Duration) {
    while let Ok(job) = receiver.recv_blocking() {
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let packet = encode_frame(
            &job.params,
            &job.pixels,
            job.params.packed_pitch(),
            job.keyframe,
        );

        let mut state = lock(state);
        let alive = state.sessions.contains_key(&job.handle);
        if let Some(slot) = state.tasks.get_mut(&job.index) {
            *slot = match packet {
                _ if !alive => TaskSlot::Failed("codec session was destroyed".into()),
                Ok(packet) => TaskSlot::Done(packet),
                Err(err) => TaskSlot::Failed(format!("failed to write packet: {err}")),
            };
        }
    }
    debug!("software engine worker stopped");
}

impl NativeEngine for SoftwareEngine {
    fn create_encoder(&self, config: &EncoderConfig) -> Option<NativeHandle> {
        let mut state = self.state();
        let params = FrameParams {
            codec: config.codec,
            format: config.format,
            compression: config.compression,
            width: config.width,
            height: config.height,
        };
        if let Err(message) = validate(&params).and_then(|()| {
            if config.compression == Compression::Lossy && (config.bitrate == 0 || config.target_fps == 0)
            {
                Err("lossy compression needs a positive bitrate and frame rate".into())
            } else {
                Ok(())
            }
        }) {
            state.fail(None, message);
            return None;
        }

        Some(state.allocate_handle(SessionState {
            kind: SessionKind::Encoder {
                texture_input: config.texture_input,
                frames: 0,
            },
            params,
            error: String::new(),
        }))
    }

    fn create_decoder(&self, config: &DecoderConfig) -> Option<NativeHandle> {
        let mut state = self.state();
        let params = FrameParams {
            codec: config.codec,
            format: config.format,
            compression: Compression::Lossless,
            width: config.width,
            height: config.height,
        };
        if let Err(message) = validate(&params) {
            state.fail(None, message);
            return None;
        }

        Some(state.allocate_handle(SessionState {
            kind: SessionKind::Decoder,
            params,
            error: String::new(),
        }))
    }

    fn set_bitrate(&self, handle: NativeHandle, bitrate: u64, target_fps: u32) {
        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(&handle.get()) else {
            state.fail(None, "invalid codec handle");
            return;
        };
        if !matches!(session.kind, SessionKind::Encoder { .. }) {
            session.error = "invalid encoder".into();
        } else if session.params.compression == Compression::Lossy && (bitrate == 0 || target_fps == 0) {
            session.error = "lossy compression needs a positive bitrate and frame rate".into();
        }
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
        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(&handle.get()) else {
            state.fail(None, "invalid codec handle");
            return 0;
        };
        let SessionKind::Encoder { frames, .. } = &mut session.kind else {
            session.error = "invalid encoder".into();
            return 0;
        };
        let params = session.params;
        if (width, height) != (params.width, params.height) {
            session.error = format!(
                "frame is {width}x{height}, encoder expects {}x{}",
                params.width, params.height
            );
            return 0;
        }
        if src_pitch < params.packed_pitch() || src.len() < src_pitch * height as usize {
            session.error = "input buffer is smaller than one frame".into();
            return 0;
        }

        let keyframe = force_keyframe || *frames == 0;
        *frames += 1;
        let packet = match encode_frame(&params, src, src_pitch, keyframe) {
            Ok(packet) => packet,
            Err(err) => {
                session.error = format!("failed to write packet: {err}");
                return 0;
            }
        };
        if packet.len() > dst.len() {
            session.error = format!(
                "output buffer too small: need {} bytes, have {}",
                packet.len(),
                dst.len()
            );
            return 0;
        }
        dst[..packet.len()].copy_from_slice(&packet);
        packet.len()
    }

    fn decode(&self, handle: NativeHandle, src: &[u8], dst: &mut [u8], width: u32, height: u32) -> usize {
        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(&handle.get()) else {
            state.fail(None, "invalid codec handle");
            return 0;
        };
        if !matches!(session.kind, SessionKind::Decoder) {
            session.error = "invalid decoder".into();
            return 0;
        }
        if (width, height) != (session.params.width, session.params.height) {
            session.error = format!(
                "frame is {width}x{height}, decoder expects {}x{}",
                session.params.width, session.params.height
            );
            return 0;
        }

        match decode_frame(&session.params, src, dst) {
            Ok(written) => written,
            Err(message) => {
                session.error = message;
                0
            }
        }
    }

    fn enqueue_async(
        &self,
        handle: NativeHandle,
        texture: u32,
        width: u32,
        height: u32,
        force_keyframe: bool,
    ) -> Option<NativeTaskIndex> {
        let mut state = self.state();
        let State {
            sessions, textures, ..
        } = &mut *state;

        let Some(session) = sessions.get_mut(&handle.get()) else {
            state.fail(None, "invalid codec handle");
            return None;
        };
        let SessionKind::Encoder {
            texture_input: true,
            frames,
        } = &mut session.kind
        else {
            session.error = "invalid async texture encoder".into();
            return None;
        };
        let params = session.params;
        let Some(source) = textures.get(&texture) else {
            session.error = format!("texture {texture} is not registered");
            return None;
        };
        if source.format != params.format
            || (source.width, source.height) != (width, height)
            || (width, height) != (params.width, params.height)
        {
            session.error = format!(
                "texture {texture} is {:?} {}x{}, encoder expects {:?} {}x{}",
                source.format, source.width, source.height, params.format, params.width, params.height
            );
            return None;
        }

        let keyframe = force_keyframe || *frames == 0;
        *frames += 1;
        let pixels = Arc::clone(&source.pixels);
        let index = state.allocate_task();
        state.staged.push(Job {
            index,
            handle: handle.get(),
            params,
            pixels,
            keyframe,
        });
        Some(NativeTaskIndex(index))
    }

    fn kick(&self) {
        let jobs = std::mem::take(&mut self.state().staged);
        if jobs.is_empty() {
            return;
        }

        let mut worker = self.worker.lock().expect("worker mutex poisoned");
        if worker.is_none() {
            match self.spawn_worker() {
                Ok(spawned) => *worker = Some(spawned),
                Err(err) => {
                    error!("failed to start software engine worker: {err}");
                    let mut state = self.state();
                    for job in jobs {
                        state.tasks.insert(
                            job.index,
                            TaskSlot::Failed(format!("encoder worker unavailable: {err}")),
                        );
                    }
                    return;
                }
            }
        }

        if let Some(worker) = worker.as_ref() {
            for job in jobs {
                let index = job.index;
                if worker.sender.try_send(job).is_err() {
                    self.state()
                        .tasks
                        .insert(index, TaskSlot::Failed("encoder worker stopped".into()));
                }
            }
        }
    }

    fn query_async(&self, index: NativeTaskIndex) -> NativeTaskStatus {
        match self.state().tasks.get(&index.0) {
            Some(TaskSlot::Pending) => NativeTaskStatus::Pending,
            Some(TaskSlot::Done(packet)) => NativeTaskStatus::Succeeded {
                encoded_size: packet.len(),
            },
            Some(TaskSlot::Failed(message)) => NativeTaskStatus::Failed(message.clone()),
            None => NativeTaskStatus::Failed(format!("task {index} does not exist")),
        }
    }

    fn copy_async_result(&self, index: NativeTaskIndex, dst: &mut [u8]) -> usize {
        match self.state().tasks.get(&index.0) {
            Some(TaskSlot::Done(packet)) => {
                let len = packet.len().min(dst.len());
                dst[..len].copy_from_slice(&packet[..len]);
                len
            }
            _ => 0,
        }
    }

    fn clear_async(&self, index: NativeTaskIndex) {
        self.state().tasks.remove(&index.0);
    }

    fn last_error(&self, scope: Option<NativeHandle>) -> Option<String> {
        let mut state = self.state();
        let message = state.error_slot(scope);
        (!message.is_empty()).then(|| message.clone())
    }

    fn clear_error(&self, scope: Option<NativeHandle>) {
        self.state().error_slot(scope).clear();
    }

    fn destroy(&self, handle: NativeHandle) {
        let mut state = self.state();
        if state.sessions.remove(&handle.get()).is_none() {
            return;
        }
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.staged)
            .into_iter()
            .partition(|job| job.handle == handle.get());
        state.staged = kept;
        for job in dropped {
            state.tasks.insert(
                job.index,
                TaskSlot::Failed("codec session was destroyed".into()),
            );
        }
    }
}

fn validate(params: &FrameParams) -> Result<(), String> {
    if params.width == 0 || params.height == 0 {
        return Err(format!(
            "invalid frame size {}x{}",
            params.width, params.height
        ));
    }
    if params.width > MAX_DIMENSION || params.height > MAX_DIMENSION {
        return Err(format!(
            "frame size {}x{} exceeds the {MAX_DIMENSION}x{MAX_DIMENSION} limit",
            params.width, params.height
        ));
    }
    Ok(())
}

const fn codec_tag(codec: CodecType) -> u8 {
    match codec {
        CodecType::H264 => 0,
        CodecType::Hevc => 1,
    }
}

const fn format_tag(format: PixelFormat) -> u8 {
    match format {
        PixelFormat::Rgba32 => 0,
        PixelFormat::Uint4 => 1,
        PixelFormat::Uint8 => 2,
        PixelFormat::Uint16 => 3,
        PixelFormat::Uint32 => 4,
    }
}

/// Packs the rows of `src` and run-length codes whole pixels behind a header.
fn encode_frame(
    params: &FrameParams,
    src: &[u8],
    src_pitch: usize,
    keyframe: bool,
) -> io::Result<Vec<u8>> {
    let pitch = params.packed_pitch();
    let unit = params.pixel_unit();
    let mut payload = Vec::with_capacity(params.frame_size() / 4);
    let mut run: Option<(&[u8], u8)> = None;
    for row in src.chunks(src_pitch).take(params.height as usize) {
        for pixel in row[..pitch].chunks_exact(unit) {
            run = match run {
                Some((value, count)) if value == pixel && count < u8::MAX => Some((value, count + 1)),
                Some((value, count)) => {
                    payload.push(count);
                    payload.extend_from_slice(value);
                    Some((pixel, 1))
                }
                None => Some((pixel, 1)),
            };
        }
    }
    if let Some((value, count)) = run {
        payload.push(count);
        payload.extend_from_slice(value);
    }

    let mut flags = 0;
    if keyframe {
        flags |= FLAG_KEYFRAME;
    }
    if params.compression == Compression::Lossless {
        flags |= FLAG_LOSSLESS;
    }

    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    write_header(&mut packet, params, flags, payload.len())?;
    packet.extend_from_slice(&payload);
    Ok(packet)
}

fn write_header<W: Write>(
    w: &mut W,
    params: &FrameParams,
    flags: u8,
    payload_len: usize,
) -> io::Result<()> {
    let invalid = |_| io::Error::new(io::ErrorKind::InvalidData, "frame does not fit the packet header");
    w.write_all(MAGIC)?;
    w.write_u8(codec_tag(params.codec))?;
    w.write_u8(format_tag(params.format))?;
    w.write_u8(flags)?;
    w.write_u8(0)?; // reserved
    w.write_u16::<BigEndian>(u16::try_from(params.width).map_err(invalid)?)?;
    w.write_u16::<BigEndian>(u16::try_from(params.height).map_err(invalid)?)?;
    w.write_u32::<BigEndian>(u32::try_from(payload_len).map_err(invalid)?)?;
    Ok(())
}

/// Reverses [`encode_frame`] into a tightly packed frame.
fn decode_frame(params: &FrameParams, src: &[u8], dst: &mut [u8]) -> Result<usize, String> {
    let truncated = |_| "truncated packet header".to_string();
    let mut header = Cursor::new(src);
    let mut magic = [0; 4];
    header.read_exact(&mut magic).map_err(truncated)?;
    if &magic != MAGIC {
        return Err("not a pipekit bitstream".into());
    }
    let codec = header.read_u8().map_err(truncated)?;
    let format = header.read_u8().map_err(truncated)?;
    let _flags = header.read_u8().map_err(truncated)?;
    let _reserved = header.read_u8().map_err(truncated)?;
    let width = u32::from(header.read_u16::<BigEndian>().map_err(truncated)?);
    let height = u32::from(header.read_u16::<BigEndian>().map_err(truncated)?);
    let payload_len = header.read_u32::<BigEndian>().map_err(truncated)? as usize;

    if codec != codec_tag(params.codec) {
        return Err(format!("packet codec {codec} does not match decoder"));
    }
    if format != format_tag(params.format) {
        return Err(format!("packet pixel format {format} does not match decoder"));
    }
    if (width, height) != (params.width, params.height) {
        return Err(format!(
            "packet is {width}x{height}, decoder expects {}x{}",
            params.width, params.height
        ));
    }
    let payload = src
        .get(HEADER_LEN..HEADER_LEN + payload_len)
        .ok_or_else(|| "truncated packet payload".to_string())?;
    let unit = params.pixel_unit();
    if payload.len() % (unit + 1) != 0 {
        return Err("corrupt packet payload".into());
    }

    let frame_size = params.frame_size();
    if dst.len() < frame_size {
        return Err(format!(
            "output buffer too small: need {frame_size} bytes, have {}",
            dst.len()
        ));
    }
    let mut written = 0;
    for entry in payload.chunks_exact(unit + 1) {
        let (count, value) = (usize::from(entry[0]) * unit, &entry[1..]);
        if count == 0 || written + count > frame_size {
            return Err("corrupt packet payload".into());
        }
        for pixel in dst[written..written + count].chunks_exact_mut(unit) {
            pixel.copy_from_slice(value);
        }
        written += count;
    }
    if written != frame_size {
        return Err(format!(
            "packet decodes to {written} bytes, expected {frame_size}"
        ));
    }
    Ok(written)
}
