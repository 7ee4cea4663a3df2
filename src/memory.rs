//! In-memory backing store
//!
//! Executes every request against a `Vec<u8>` at schedule time and queues the
//! result, notifying the device's completion signal. Fault injection hooks
//! make it usable for exercising the error paths of the core.

use crate::backing::{BackingStore, BackingStoreOptions, CommandRef, DeviceHandle, RequestId, RequestResult};
use crate::error::ScsiResult;
use crate::signal::CompletionSignal;
use byteorder::{BigEndian, ByteOrder};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Result code reported for injected failures (EIO)
pub const INJECTED_FAILURE: i32 = -5;

/// UNMAP block descriptor length
const UNMAP_DESCRIPTOR_LEN: usize = 16;

struct MemoryDevice {
    options: BackingStoreOptions,
    data: Vec<u8>,
    block_shift: u32,
    signal: Arc<CompletionSignal>,
    ready: VecDeque<RequestResult>,
    held: VecDeque<RequestResult>,
}

/// Call counters, for asserting how the core drove the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreCalls {
    pub scheduled: usize,
    pub aborts: usize,
    pub fetches: usize,
}

/// Backing store keeping device contents in memory
#[derive(Default)]
pub struct MemoryStore {
    devices: HashMap<u64, MemoryDevice>,
    next_handle: u64,
    next_request: u64,
    fail_next: usize,
    reject_next: usize,
    hold: bool,
    calls: MemoryStoreCalls,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the next `n` requests with a failure result code
    pub fn fail_next(&mut self, n: usize) {
        self.fail_next = n;
    }

    /// Refuse the next `n` schedule calls with the invalid request id
    pub fn reject_next(&mut self, n: usize) {
        self.reject_next = n;
    }

    /// Keep results back until [`MemoryStore::release`] is called
    pub fn hold_completions(&mut self, hold: bool) {
        self.hold = hold;
    }

    /// Publish held results of a device and notify its signal
    pub fn release(&mut self, handle: DeviceHandle) {
        if let Some(dev) = self.devices.get_mut(&handle.0) {
            if dev.held.is_empty() {
                return;
            }
            dev.ready.extend(dev.held.drain(..));
            if let Err(e) = dev.signal.notify() {
                log::warn!("Failed to notify completion signal: {}", e);
            }
        }
    }

    pub fn calls(&self) -> MemoryStoreCalls {
        self.calls
    }

    pub fn is_open(&self, handle: DeviceHandle) -> bool {
        self.devices.contains_key(&handle.0)
    }

    /// Device contents
    pub fn contents(&self, handle: DeviceHandle) -> Option<&[u8]> {
        self.devices.get(&handle.0).map(|dev| dev.data.as_slice())
    }

    pub fn options(&self, handle: DeviceHandle) -> Option<&BackingStoreOptions> {
        self.devices.get(&handle.0).map(|dev| &dev.options)
    }

    /// Run `op` against the device and queue its result
    fn schedule<F>(&mut self, handle: DeviceHandle, command: CommandRef, op: F) -> RequestId
    where
        F: FnOnce(&mut MemoryDevice) -> Option<Vec<u8>>,
    {
        self.calls.scheduled += 1;
        if self.reject_next > 0 {
            self.reject_next -= 1;
            return RequestId::INVALID;
        }
        let dev = match self.devices.get_mut(&handle.0) {
            Some(dev) => dev,
            None => return RequestId::INVALID,
        };

        self.next_request += 1;
        let request_id = RequestId(self.next_request);

        let (result, data) = if self.fail_next > 0 {
            self.fail_next -= 1;
            (INJECTED_FAILURE, Vec::new())
        } else {
            match op(dev) {
                Some(data) => (0, data),
                None => (INJECTED_FAILURE, Vec::new()),
            }
        };

        let done = RequestResult {
            command: Some(command),
            request_id,
            result,
            data,
        };
        if self.hold {
            dev.held.push_back(done);
        } else {
            dev.ready.push_back(done);
            if let Err(e) = dev.signal.notify() {
                log::warn!("Failed to notify completion signal: {}", e);
            }
        }
        request_id
    }
}

fn range(dev: &MemoryDevice, offset: u64, length: u64) -> Option<std::ops::Range<usize>> {
    let end = offset.checked_add(length)?;
    if end > dev.data.len() as u64 {
        return None;
    }
    Some(offset as usize..end as usize)
}

impl BackingStore for MemoryStore {
    fn open(
        &mut self,
        options: &BackingStoreOptions,
        size_bytes: u64,
        block_shift: u32,
        signal: Arc<CompletionSignal>,
    ) -> ScsiResult<DeviceHandle> {
        self.next_handle += 1;
        let handle = DeviceHandle(self.next_handle);
        self.devices.insert(
            handle.0,
            MemoryDevice {
                options: options.clone(),
                data: vec![0u8; size_bytes as usize],
                block_shift,
                signal,
                ready: VecDeque::new(),
                held: VecDeque::new(),
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: DeviceHandle) {
        self.devices.remove(&handle.0);
    }

    fn schedule_read(&mut self, handle: DeviceHandle, command: CommandRef, length: u64, offset: u64) -> RequestId {
        self.schedule(handle, command, |dev| {
            let r = range(dev, offset, length)?;
            Some(dev.data[r].to_vec())
        })
    }

    fn schedule_write(&mut self, handle: DeviceHandle, command: CommandRef, data: &[u8], offset: u64) -> RequestId {
        self.schedule(handle, command, |dev| {
            let r = range(dev, offset, data.len() as u64)?;
            dev.data[r].copy_from_slice(data);
            Some(Vec::new())
        })
    }

    fn schedule_truncate(&mut self, handle: DeviceHandle, command: CommandRef, descriptors: &[u8]) -> RequestId {
        self.schedule(handle, command, |dev| {
            for desc in descriptors.chunks_exact(UNMAP_DESCRIPTOR_LEN) {
                let lba = BigEndian::read_u64(&desc[0..8]);
                let blocks = BigEndian::read_u32(&desc[8..12]) as u64;
                let r = range(dev, lba << dev.block_shift, blocks << dev.block_shift)?;
                dev.data[r].fill(0);
            }
            Some(Vec::new())
        })
    }

    fn schedule_sync_cache(&mut self, handle: DeviceHandle, command: CommandRef, offset: u64, length: u64) -> RequestId {
        self.schedule(handle, command, |dev| {
            range(dev, offset, length)?;
            Some(Vec::new())
        })
    }

    fn schedule_abort(&mut self, handle: DeviceHandle, requests: &[RequestId]) -> i32 {
        self.calls.aborts += 1;
        match self.devices.get_mut(&handle.0) {
            Some(dev) => {
                dev.ready.retain(|r| !requests.contains(&r.request_id));
                dev.held.retain(|r| !requests.contains(&r.request_id));
                0
            }
            None => -libc::ENODEV,
        }
    }

    fn get_complete_requests(&mut self, handle: DeviceHandle, results: &mut [RequestResult]) -> (usize, bool) {
        self.calls.fetches += 1;
        let dev = match self.devices.get_mut(&handle.0) {
            Some(dev) => dev,
            None => return (0, false),
        };
        let mut count = 0;
        for slot in results.iter_mut() {
            match dev.ready.pop_front() {
                Some(result) => {
                    *slot = result;
                    count += 1;
                }
                None => break,
            }
        }
        (count, !dev.ready.is_empty())
    }
}
