//! Backing store contract
//!
//! The backing store is an external asynchronous service. The core schedules
//! requests against an opened device handle and later collects finished
//! requests in batches once the device's completion signal turns readable.

use crate::error::{IscsiError, ScsiResult};
use crate::signal::CompletionSignal;
use std::fmt;
use std::sync::Arc;

/// Opaque request identifier assigned by the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Sentinel returned when a request could not be scheduled
    pub const INVALID: RequestId = RequestId(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

/// Opaque device handle returned by [`BackingStore::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Reference to the command a request belongs to
///
/// Carried through the backing store and resolved against the session
/// registry on completion; never an owning pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandRef {
    pub session_id: u64,
    pub tag: u64,
}

/// One finished request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestResult {
    /// None marks an empty slot
    pub command: Option<CommandRef>,
    pub request_id: RequestId,
    /// 0 on success
    pub result: i32,
    /// Data read from the device, for read requests
    pub data: Vec<u8>,
}

/// Asynchronous backing store
///
/// Schedule calls must not block. Completions are reported only by making
/// the device's [`CompletionSignal`] readable; they are collected on the
/// reactor thread through [`BackingStore::get_complete_requests`].
pub trait BackingStore {
    /// Open a device; `signal` is notified whenever requests finish
    fn open(
        &mut self,
        options: &BackingStoreOptions,
        size_bytes: u64,
        block_shift: u32,
        signal: Arc<CompletionSignal>,
    ) -> ScsiResult<DeviceHandle>;

    fn close(&mut self, handle: DeviceHandle);

    fn schedule_read(&mut self, handle: DeviceHandle, command: CommandRef, length: u64, offset: u64) -> RequestId;

    fn schedule_write(&mut self, handle: DeviceHandle, command: CommandRef, data: &[u8], offset: u64) -> RequestId;

    /// Deallocate the ranges in `descriptors` (UNMAP block descriptors, header stripped)
    fn schedule_truncate(&mut self, handle: DeviceHandle, command: CommandRef, descriptors: &[u8]) -> RequestId;

    fn schedule_sync_cache(&mut self, handle: DeviceHandle, command: CommandRef, offset: u64, length: u64) -> RequestId;

    /// Abort the given in-flight requests; returns 0 on success
    fn schedule_abort(&mut self, handle: DeviceHandle, requests: &[RequestId]) -> i32;

    /// Fill `results` with finished requests
    ///
    /// Returns the number of filled slots and whether more results are
    /// immediately available.
    fn get_complete_requests(&mut self, handle: DeviceHandle, results: &mut [RequestResult]) -> (usize, bool);
}

/// Backing store options of the form `vmid=<id>:vmdkid=<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackingStoreOptions {
    pub vmid: String,
    pub vmdkid: String,
}

impl BackingStoreOptions {
    /// Parse `:`-separated `key=value` tokens; both keys are required
    pub fn parse(options: &str) -> ScsiResult<Self> {
        let mut vmid = None;
        let mut vmdkid = None;

        for token in options.split(':').filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some(("vmid", value)) => vmid = Some(value.to_string()),
                Some(("vmdkid", value)) => vmdkid = Some(value.to_string()),
                _ => log::debug!("Ignoring backing store option: {}", token),
            }
        }

        match (vmid, vmdkid) {
            (Some(vmid), Some(vmdkid)) => Ok(BackingStoreOptions { vmid, vmdkid }),
            (vmid, vmdkid) => {
                let missing: Vec<&str> = [("vmid", vmid.is_none()), ("vmdkid", vmdkid.is_none())]
                    .iter()
                    .filter(|(_, absent)| *absent)
                    .map(|(key, _)| *key)
                    .collect();
                Err(IscsiError::Config(format!(
                    "backing store needs both vmid and vmdkid, missing: {}",
                    missing.join(", ")
                )))
            }
        }
    }
}

impl fmt::Display for BackingStoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vmid={}:vmdkid={}", self.vmid, self.vmdkid)
    }
}
