//! Completion draining
//!
//! When a device's completion signal turns readable the reactor runs
//! [`drain`]: finished requests are fetched in bounded batches, each result
//! is resolved to its in-flight command, and the protocol layer is told
//! through [`CommandCompletion::command_io_done`]. The signal counter is
//! the only authority on whether another pass is needed.

use crate::backing::{BackingStore, BackingStoreOptions, DeviceHandle, RequestResult};
use crate::error::ScsiResult;
use crate::scsi::{scsi_status, IoIntent, ScsiCommand, SenseData};
use crate::session::SessionRegistry;
use crate::signal::CompletionSignal;
use crate::target::IoStats;

/// Protocol-layer callback, invoked exactly once per command from the reactor thread
pub trait CommandCompletion {
    fn command_io_done(&mut self, command: ScsiCommand, status: u8, sense: Option<SenseData>);
}

/// How a single result was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Completed,
    Failed,
    /// No matching in-flight command
    Stale,
}

/// Counters for one drain invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Batch fetch calls issued to the backing store
    pub fetches: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale: usize,
}

/// Drain every available completion of one device
///
/// Never blocks: `get_complete_requests` and the signal read are both
/// non-blocking. Each consumed scratch slot is reset to its default.
pub fn drain<B, F>(
    store: &mut B,
    handle: DeviceHandle,
    signal: &CompletionSignal,
    scratch: &mut [RequestResult],
    mut resolve: F,
) -> ScsiResult<DrainReport>
where
    B: BackingStore + ?Sized,
    F: FnMut(RequestResult) -> Resolution,
{
    let mut report = DrainReport::default();
    let mut has_more = true;

    while has_more {
        let (count, more) = store.get_complete_requests(handle, scratch);
        report.fetches += 1;

        for slot in scratch.iter_mut().take(count) {
            let result = std::mem::take(slot);
            if result.command.is_none() {
                continue;
            }
            match resolve(result) {
                Resolution::Completed => report.completed += 1,
                Resolution::Failed => report.failed += 1,
                Resolution::Stale => report.stale += 1,
            }
        }

        has_more = more;
        if !has_more {
            // A completion may have raced in after the last fetch
            has_more = signal.take()? != 0;
        }
    }

    Ok(report)
}

/// Resolve one finished request against the session registry
pub fn resolve(
    sessions: &mut SessionRegistry,
    observer: &mut dyn CommandCompletion,
    stats: &mut IoStats,
    device: &BackingStoreOptions,
    result: RequestResult,
) -> Resolution {
    let command_ref = match result.command {
        Some(command_ref) => command_ref,
        None => return Resolution::Stale,
    };

    let entry = match sessions.lookup_mut(command_ref.session_id) {
        Some(session)
            if session
                .in_flight()
                .get(command_ref.tag)
                .is_some_and(|e| e.request_id == result.request_id) =>
        {
            session.command_resolve(command_ref.tag)
        }
        _ => None,
    };
    let entry = match entry {
        Some(entry) => entry,
        None => {
            log::debug!(
                "Stale completion for session {:#x} task {} request {:?}",
                command_ref.session_id,
                command_ref.tag,
                result.request_id
            );
            stats.stale += 1;
            return Resolution::Stale;
        }
    };

    stats.total_latency += entry.submitted_at.elapsed();
    let mut command = entry.command;

    if result.result == 0 {
        if entry.intent == IoIntent::Read {
            command.data_in = result.data;
        }
        stats.completed += 1;
        command.set_result(scsi_status::GOOD, None);
        observer.command_io_done(command, scsi_status::GOOD, None);
        Resolution::Completed
    } else {
        log::error!(
            "I/O failed for vmid:{}, vmdkid:{}, op_type:{}, offset:{}, length:{}, result:{}",
            device.vmid,
            device.vmdkid,
            entry.intent.name(),
            entry.offset,
            entry.length,
            result.result
        );
        stats.failed += 1;
        let sense = SenseData::medium_error();
        command.set_result(scsi_status::CHECK_CONDITION, Some(sense.clone()));
        observer.command_io_done(command, scsi_status::CHECK_CONDITION, Some(sense));
        Resolution::Failed
    }
}
