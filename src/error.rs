//! Error types for the target I/O core

use thiserror::Error;

/// iSCSI target errors
///
/// SCSI-level command failures are not represented here: they travel as a
/// status byte plus sense data through `CommandCompletion::command_io_done`.
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Session {0:#x} already exists")]
    SessionExists(u64),

    #[error("Session {0:#x} not found")]
    SessionNotFound(u64),

    #[error("Session {0:#x} still has connections")]
    SessionBusy(u64),

    #[error("Session {sid:#x}: CmdSN {cmd_sn} outside window [{exp_cmd_sn}, {max_cmd_sn}]")]
    CmdSnOutOfWindow {
        sid: u64,
        cmd_sn: u32,
        exp_cmd_sn: u32,
        max_cmd_sn: u32,
    },

    #[error("Task {0} is already in flight")]
    DuplicateTask(u64),

    #[error("LUN {0} already exists")]
    LunExists(u64),

    #[error("LUN {0} not found")]
    LunNotFound(u64),

    #[error("LUN {0} is busy")]
    LunBusy(u64),

    #[error("Backing store rejected {op} request: length {length}, offset {offset}")]
    InvalidRequest {
        op: &'static str,
        offset: u64,
        length: u64,
    },

    #[error("Scheduled work queue is full ({0} entries)")]
    SchedulerFull(usize),

    #[error("SCSI error: {0}")]
    Scsi(String),
}

/// Result type for target operations
pub type ScsiResult<T> = Result<T, IscsiError>;
