//! Asynchronous command dispatch
//!
//! Turns a classified command into a backing store request. Successful
//! submissions are registered in the owning session's command table and
//! marked async; everything else is answered without a completion round trip.

use crate::backing::{BackingStore, CommandRef, DeviceHandle, RequestId};
use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{
    plan, scsi_status, Geometry, IoIntent, IoRequest, Plan, ScsiCommand, SenseData, UNMAP_HEADER_LEN,
};
use crate::session::{InFlightCommand, Session};
use std::time::Instant;

/// Result of submitting one command
#[derive(Debug)]
pub enum Outcome {
    /// Registered in the session; completion arrives through the drain loop
    Async,
    /// Answered without a completion round trip; status and sense are set
    Immediate(ScsiCommand),
    /// Task management request finished; `victims` were removed from the session
    Aborted {
        command: ScsiCommand,
        victims: Vec<ScsiCommand>,
    },
    /// Backing store refused the request; the command was not registered
    Failed {
        command: ScsiCommand,
        error: IscsiError,
    },
}

/// Hand a request to the backing store
///
/// Returns [`IscsiError::InvalidRequest`] when the backing store answers
/// with the invalid request id.
pub fn schedule<B: BackingStore + ?Sized>(
    store: &mut B,
    handle: DeviceHandle,
    request: &IoRequest,
    command_ref: CommandRef,
    command: &ScsiCommand,
) -> ScsiResult<RequestId> {
    let request_id = match request.intent {
        IoIntent::Read => store.schedule_read(handle, command_ref, request.length, request.offset),
        IoIntent::Write => {
            let data = command
                .data_out
                .get(..request.length as usize)
                .ok_or_else(|| IscsiError::Scsi(format!("write payload shorter than {} bytes", request.length)))?;
            store.schedule_write(handle, command_ref, data, request.offset)
        }
        IoIntent::Truncate => {
            let descriptors = command
                .data_out
                .get(UNMAP_HEADER_LEN..)
                .ok_or_else(|| IscsiError::Scsi("unmap parameter list has no header".to_string()))?;
            store.schedule_truncate(handle, command_ref, descriptors)
        }
        IoIntent::SyncCache => store.schedule_sync_cache(handle, command_ref, request.offset, request.length),
        other => {
            return Err(IscsiError::Scsi(format!("{} requests cannot be scheduled", other.name())));
        }
    };

    if !request_id.is_valid() {
        log::error!(
            "request submission got error invalid request size: {} offset: {} opcode: {:#04x}",
            request.length,
            request.offset,
            command.opcode()
        );
        return Err(IscsiError::InvalidRequest {
            op: request.intent.name(),
            offset: request.offset,
            length: request.length,
        });
    }
    Ok(request_id)
}

/// Classify, validate and submit a command on behalf of `session`
///
/// Fails with [`IscsiError::DuplicateTask`] when the tag is already in
/// flight; the command is dropped in that case.
pub fn submit<B: BackingStore + ?Sized>(
    store: &mut B,
    handle: DeviceHandle,
    geometry: &Geometry,
    session: &mut Session,
    mut command: ScsiCommand,
) -> ScsiResult<Outcome> {
    let request = match plan(&command, geometry) {
        Plan::Complete => {
            command.set_result(scsi_status::GOOD, None);
            return Ok(Outcome::Immediate(command));
        }
        Plan::Reject(sense) => {
            log::debug!(
                "Rejecting task {} opcode {:#04x}, sense {}",
                command.tag,
                command.opcode(),
                hex::encode(sense.to_bytes())
            );
            command.set_result(scsi_status::CHECK_CONDITION, Some(sense));
            return Ok(Outcome::Immediate(command));
        }
        Plan::Abort(intent) => return Ok(abort(store, handle, session, command, intent)),
        Plan::Dispatch(request) => request,
    };

    let tag = command.tag;
    if session.in_flight().contains(tag) {
        return Err(IscsiError::DuplicateTask(tag));
    }

    if request.intent == IoIntent::Write && (command.data_out.len() as u64) < request.length {
        log::warn!(
            "Write data too short on task {}: got {}, need {}",
            tag,
            command.data_out.len(),
            request.length
        );
        command.set_result(scsi_status::CHECK_CONDITION, Some(SenseData::invalid_field()));
        return Ok(Outcome::Immediate(command));
    }

    let command_ref = CommandRef {
        session_id: session.sid,
        tag,
    };
    let request_id = match schedule(store, handle, &request, command_ref, &command) {
        Ok(id) => id,
        Err(error) => {
            command.set_result(scsi_status::CHECK_CONDITION, Some(SenseData::medium_error()));
            return Ok(Outcome::Failed { command, error });
        }
    };

    command.set_async();
    session.command_register(
        tag,
        InFlightCommand {
            command,
            intent: request.intent,
            offset: request.offset,
            length: request.length,
            request_id,
            submitted_at: Instant::now(),
        },
    )?;
    Ok(Outcome::Async)
}

/// ABORT TASK / ABORT TASK SET as a synchronous backing store round trip
fn abort<B: BackingStore + ?Sized>(
    store: &mut B,
    handle: DeviceHandle,
    session: &mut Session,
    mut command: ScsiCommand,
    intent: IoIntent,
) -> Outcome {
    let tags: Vec<u64> = match (intent, command.management) {
        (IoIntent::AbortTask, Some(mgmt)) => vec![mgmt.referenced_tag],
        _ => session.tags_for_lun(command.lun),
    };
    let requests: Vec<RequestId> = tags
        .iter()
        .filter_map(|&tag| session.in_flight().get(tag))
        .map(|entry| entry.request_id)
        .collect();

    let rc = store.schedule_abort(handle, &requests);
    log::info!(
        "{} from task {} covering {} requests returned {}",
        intent.name(),
        command.tag,
        requests.len(),
        rc
    );

    if rc != 0 {
        command.set_result(scsi_status::CHECK_CONDITION, Some(SenseData::aborted_command()));
        return Outcome::Aborted {
            command,
            victims: Vec::new(),
        };
    }

    let victims = tags
        .into_iter()
        .filter_map(|tag| session.command_abort(tag))
        .map(|entry| {
            let mut victim = entry.command;
            victim.set_result(scsi_status::TASK_ABORTED, None);
            victim
        })
        .collect();
    command.set_result(scsi_status::GOOD, None);
    Outcome::Aborted { command, victims }
}
