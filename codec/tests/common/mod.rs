//! A native engine whose task completions are driven by the test.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use pipekit_codec::sys::{NativeEngine, NativeHandle, NativeTaskIndex, NativeTaskStatus};
use pipekit_codec::{DecoderConfig, EncoderConfig};

#[derive(Debug)]
enum Slot {
    Pending,
    Done { data: Vec<u8>, reported: usize },
    Failed(String),
}

#[derive(Debug, Default)]
struct Script {
    next_handle: u32,
    next_task: u32,
    errors: HashMap<u32, String>,
    live: Vec<u32>,
    tasks: HashMap<u32, Slot>,
    enqueued: Vec<u32>,
    cleared: Vec<u32>,
    destroyed: Vec<u32>,
    misordered: Vec<u32>,
    kicks: usize,
    fail_next_create: Option<String>,
    warn_next_create: Option<String>,
    reject_next_enqueue: Option<String>,
    fail_next_call: Option<String>,
}

/// Records every call and lets tests decide when and how tasks finish.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    script: Mutex<Script>,
    capacity: Option<usize>,
    in_order: bool,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// An engine with a bounded task ring that must be cleared in submission order.
    pub fn ring(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: Some(capacity),
            in_order: true,
            ..Self::default()
        })
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    /// The next create call fails without a handle.
    pub fn fail_next_create(&self, message: &str) {
        self.script().fail_next_create = Some(message.into());
    }

    /// The next create call returns a handle but also reports an error.
    pub fn warn_next_create(&self, message: &str) {
        self.script().warn_next_create = Some(message.into());
    }

    /// The next enqueue is rejected with `message` on the handle channel.
    pub fn reject_next_enqueue(&self, message: &str) {
        self.script().reject_next_enqueue = Some(message.into());
    }

    /// The next synchronous call reports `message` on the handle channel.
    pub fn fail_next_call(&self, message: &str) {
        self.script().fail_next_call = Some(message.into());
    }

    pub fn complete(&self, index: u32, data: &[u8]) {
        self.complete_with_size(index, data, data.len());
    }

    /// Finishes a task that claims `reported` bytes but only provides `data`.
    pub fn complete_with_size(&self, index: u32, data: &[u8], reported: usize) {
        let mut script = self.script();
        assert!(script.tasks.contains_key(&index), "unknown native task {index}");
        script.tasks.insert(
            index,
            Slot::Done {
                data: data.to_vec(),
                reported,
            },
        );
    }

    pub fn fail(&self, index: u32, message: &str) {
        self.script()
            .tasks
            .insert(index, Slot::Failed(message.into()));
    }

    /// Native indices in enqueue order.
    pub fn enqueued(&self) -> Vec<u32> {
        self.script().enqueued.clone()
    }

    /// Native indices in the order they were cleared.
    pub fn cleared(&self) -> Vec<u32> {
        self.script().cleared.clone()
    }

    /// Native indices cleared while an older task was still uncleared.
    pub fn misordered(&self) -> Vec<u32> {
        self.script().misordered.clone()
    }

    pub fn destroyed(&self) -> Vec<u32> {
        self.script().destroyed.clone()
    }

    pub fn live_handles(&self) -> Vec<u32> {
        self.script().live.clone()
    }

    pub fn native_tasks(&self) -> usize {
        self.script().tasks.len()
    }

    pub fn kicks(&self) -> usize {
        self.script().kicks
    }

    fn create(&self) -> Option<NativeHandle> {
        let mut script = self.script();
        if let Some(message) = script.fail_next_create.take() {
            script.errors.insert(0, message);
            return None;
        }
        script.next_handle += 1;
        let raw = script.next_handle;
        script.live.push(raw);
        if let Some(message) = script.warn_next_create.take() {
            script.errors.insert(0, message);
        }
        NativeHandle::new(raw)
    }

    fn call_fails(&self, handle: NativeHandle) -> bool {
        let mut script = self.script();
        match script.fail_next_call.take() {
            Some(message) => {
                script.errors.insert(handle.get(), message);
                true
            }
            None => false,
        }
    }
}

impl NativeEngine for ScriptedEngine {
    fn create_encoder(&self, _config: &EncoderConfig) -> Option<NativeHandle> {
        self.create()
    }

    fn create_decoder(&self, _config: &DecoderConfig) -> Option<NativeHandle> {
        self.create()
    }

    fn set_bitrate(&self, handle: NativeHandle, _bitrate: u64, _target_fps: u32) {
        self.call_fails(handle);
    }

    fn encode(
        &self,
        handle: NativeHandle,
        src: &[u8],
        _src_pitch: usize,
        dst: &mut [u8],
        _width: u32,
        _height: u32,
        _force_keyframe: bool,
    ) -> usize {
        if self.call_fails(handle) {
            return 0;
        }
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        len
    }

    fn decode(
        &self,
        handle: NativeHandle,
        src: &[u8],
        dst: &mut [u8],
        _width: u32,
        _height: u32,
    ) -> usize {
        if self.call_fails(handle) {
            return 0;
        }
        let len = src.len().min(dst.len());
        dst[..len].copy_from_slice(&src[..len]);
        len
    }

    fn enqueue_async(
        &self,
        handle: NativeHandle,
        _texture: u32,
        _width: u32,
        _height: u32,
        _force_keyframe: bool,
    ) -> Option<NativeTaskIndex> {
        let mut script = self.script();
        if let Some(message) = script.reject_next_enqueue.take() {
            script.errors.insert(handle.get(), message);
            return None;
        }
        let index = script.next_task;
        script.next_task += 1;
        script.tasks.insert(index, Slot::Pending);
        script.enqueued.push(index);
        Some(NativeTaskIndex(index))
    }

    fn kick(&self) {
        self.script().kicks += 1;
    }

    fn query_async(&self, index: NativeTaskIndex) -> NativeTaskStatus {
        match self.script().tasks.get(&index.0) {
            Some(Slot::Pending) => NativeTaskStatus::Pending,
            Some(Slot::Done { reported, .. }) => NativeTaskStatus::Succeeded {
                encoded_size: *reported,
            },
            Some(Slot::Failed(message)) => NativeTaskStatus::Failed(message.clone()),
            None => NativeTaskStatus::Failed(format!("unknown native task {index}")),
        }
    }

    fn copy_async_result(&self, index: NativeTaskIndex, dst: &mut [u8]) -> usize {
        match self.script().tasks.get(&index.0) {
            Some(Slot::Done { data, .. }) => {
                let len = data.len().min(dst.len());
                dst[..len].copy_from_slice(&data[..len]);
                len
            }
            _ => 0,
        }
    }

    fn clear_async(&self, index: NativeTaskIndex) {
        let mut script = self.script();
        let oldest = script.tasks.keys().min().copied();
        if self.in_order && oldest.is_some_and(|oldest| oldest < index.0) {
            script.misordered.push(index.0);
        }
        script.tasks.remove(&index.0);
        script.cleared.push(index.0);
    }

    fn last_error(&self, scope: Option<NativeHandle>) -> Option<String> {
        let key = scope.map_or(0, NativeHandle::get);
        self.script().errors.get(&key).cloned()
    }

    fn clear_error(&self, scope: Option<NativeHandle>) {
        let key = scope.map_or(0, NativeHandle::get);
        self.script().errors.remove(&key);
    }

    fn destroy(&self, handle: NativeHandle) {
        let mut script = self.script();
        script.live.retain(|&raw| raw != handle.get());
        script.destroyed.push(handle.get());
    }

    fn task_capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn clears_in_order(&self) -> bool {
        self.in_order
    }
}
