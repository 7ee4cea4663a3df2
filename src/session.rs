//! iSCSI session and in-flight command registry
//!
//! Sessions are owned by a per-target [`SessionRegistry`] and addressed by
//! their 64-bit session id. Each session owns its connection list and a
//! fixed-size hash of in-flight commands keyed by task tag. Parameter
//! negotiation follows RFC 3720: https://datatracker.ietf.org/doc/html/rfc3720

use crate::backing::RequestId;
use crate::error::{IscsiError, ScsiResult};
use crate::scsi::{IoIntent, ScsiCommand};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Instant;

/// Number of buckets in a session's command hash
pub const COMMAND_HASH_SIZE: usize = 1024;

/// Negotiated session parameters (RFC 3720 Section 12)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Maximum data segment length target can receive (default: 8192)
    pub max_recv_data_segment_length: u32,
    /// Maximum data segment length initiator can receive
    pub max_xmit_data_segment_length: u32,
    /// Maximum burst length for unsolicited data (default: 262144)
    pub max_burst_length: u32,
    /// First burst length for unsolicited data (default: 65536)
    pub first_burst_length: u32,
    pub default_time2wait: u16,
    pub default_time2retain: u16,
    pub max_outstanding_r2t: u32,
    pub data_pdu_in_order: bool,
    pub data_sequence_in_order: bool,
    /// Error recovery level (0-2)
    pub error_recovery_level: u8,
    pub immediate_data: bool,
    pub initial_r2t: bool,
    pub header_digest: DigestType,
    pub data_digest: DigestType,
}

/// Digest type for header/data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestType {
    #[default]
    None,
    CRC32C,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            max_recv_data_segment_length: 8192,
            max_xmit_data_segment_length: 8192,
            max_burst_length: 262144,
            first_burst_length: 65536,
            default_time2wait: 2,
            default_time2retain: 20,
            max_outstanding_r2t: 1,
            data_pdu_in_order: true,
            data_sequence_in_order: true,
            error_recovery_level: 0,
            immediate_data: true,
            initial_r2t: false,
            header_digest: DigestType::None,
            data_digest: DigestType::None,
        }
    }
}

impl SessionParams {
    /// Fold one initiator offer into these parameters
    ///
    /// Numeric keys take the minimum (DefaultTime2Wait the maximum),
    /// ImmediateData is a logical AND, InitialR2T and the ordering keys a
    /// logical OR. Returns false for keys this core does not negotiate or
    /// values that do not parse; the parameters are left untouched then.
    pub fn negotiate(&mut self, key: &str, value: &str) -> bool {
        let applied = match key {
            // The initiator's receive limit bounds what we send
            "MaxRecvDataSegmentLength" => declare(&mut self.max_xmit_data_segment_length, value),
            "MaxBurstLength" => lower(&mut self.max_burst_length, value),
            "FirstBurstLength" => lower(&mut self.first_burst_length, value),
            "DefaultTime2Wait" => raise(&mut self.default_time2wait, value),
            "DefaultTime2Retain" => lower(&mut self.default_time2retain, value),
            "MaxOutstandingR2T" => lower(&mut self.max_outstanding_r2t, value),
            "ErrorRecoveryLevel" => lower(&mut self.error_recovery_level, value),
            "ImmediateData" => both(&mut self.immediate_data, value),
            "InitialR2T" => either(&mut self.initial_r2t, value),
            "DataPDUInOrder" => either(&mut self.data_pdu_in_order, value),
            "DataSequenceInOrder" => either(&mut self.data_sequence_in_order, value),
            "HeaderDigest" => pick_digest(&mut self.header_digest, value),
            "DataDigest" => pick_digest(&mut self.data_digest, value),
            _ => false,
        };

        if !applied {
            log::debug!("Not negotiating {}={}", key, value);
        }
        // FirstBurstLength never exceeds MaxBurstLength
        self.first_burst_length = self.first_burst_length.min(self.max_burst_length);
        applied
    }
}

fn declare<T: FromStr>(field: &mut T, value: &str) -> bool {
    value.parse().map(|v| *field = v).is_ok()
}

fn lower<T: FromStr + Ord + Copy>(field: &mut T, value: &str) -> bool {
    value.parse().map(|v: T| *field = v.min(*field)).is_ok()
}

fn raise<T: FromStr + Ord + Copy>(field: &mut T, value: &str) -> bool {
    value.parse().map(|v: T| *field = v.max(*field)).is_ok()
}

fn yes_no(value: &str) -> Option<bool> {
    match value {
        "Yes" => Some(true),
        "No" => Some(false),
        _ => None,
    }
}

fn both(field: &mut bool, value: &str) -> bool {
    yes_no(value).map(|v| *field &= v).is_some()
}

fn either(field: &mut bool, value: &str) -> bool {
    yes_no(value).map(|v| *field |= v).is_some()
}

/// First digest of the initiator's preference list that we support
fn pick_digest(field: &mut DigestType, offer: &str) -> bool {
    let choice = offer.split(',').find_map(|name| match name.trim() {
        "CRC32C" => Some(DigestType::CRC32C),
        "None" => Some(DigestType::None),
        _ => None,
    });
    choice.map(|digest| *field = digest).is_some()
}

/// Connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Free,
    InLogin,
    LoggedIn,
    InLogout,
    Cleanup,
}

/// A TCP connection attached to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IscsiConnection {
    /// Connection ID
    pub cid: u16,
    pub state: ConnectionState,
}

impl IscsiConnection {
    pub fn new(cid: u16) -> Self {
        IscsiConnection {
            cid,
            state: ConnectionState::Free,
        }
    }
}

/// A command submitted to the backing store and awaiting completion
#[derive(Debug)]
pub struct InFlightCommand {
    pub command: ScsiCommand,
    pub intent: IoIntent,
    pub offset: u64,
    pub length: u64,
    pub request_id: RequestId,
    pub submitted_at: Instant,
}

/// Fixed-size hash of in-flight commands, bucket = `tag % COMMAND_HASH_SIZE`
#[derive(Debug)]
pub struct CommandTable {
    buckets: Vec<Vec<InFlightCommand>>,
    len: usize,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        CommandTable {
            buckets: (0..COMMAND_HASH_SIZE).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bucket(tag: u64) -> usize {
        (tag % COMMAND_HASH_SIZE as u64) as usize
    }

    pub fn insert(&mut self, tag: u64, entry: InFlightCommand) -> ScsiResult<()> {
        let bucket = &mut self.buckets[Self::bucket(tag)];
        if bucket.iter().any(|e| e.command.tag == tag) {
            return Err(IscsiError::DuplicateTask(tag));
        }
        let mut entry = entry;
        entry.command.tag = tag;
        bucket.push(entry);
        self.len += 1;
        Ok(())
    }

    pub fn remove(&mut self, tag: u64) -> Option<InFlightCommand> {
        let bucket = &mut self.buckets[Self::bucket(tag)];
        let pos = bucket.iter().position(|e| e.command.tag == tag)?;
        self.len -= 1;
        Some(bucket.swap_remove(pos))
    }

    pub fn get(&self, tag: u64) -> Option<&InFlightCommand> {
        self.buckets[Self::bucket(tag)].iter().find(|e| e.command.tag == tag)
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.get(tag).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = &InFlightCommand> {
        self.buckets.iter().flatten()
    }
}

/// Position of a CmdSN relative to a session's command window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdSnWindow {
    Expected,
    Ahead,
    Outside,
}

/// Serial number arithmetic (RFC 1982): `a` precedes `b`
fn sn_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 1 << 31
}

/// iSCSI session
#[derive(Debug)]
pub struct Session {
    pub sid: u64,
    /// Owning target id
    pub tid: u32,
    pub params: SessionParams,
    pub max_queued_commands: u32,
    /// Expected command sequence number from initiator
    pub exp_cmd_sn: u32,
    /// Maximum command sequence number initiator can use
    pub max_cmd_sn: u32,
    next_ttt: u32,
    connections: Vec<IscsiConnection>,
    commands: CommandTable,
}

impl Session {
    fn new(tid: u32, sid: u64, params: &SessionParams, max_queued_commands: u32) -> Self {
        Session {
            sid,
            tid,
            params: params.clone(),
            max_queued_commands,
            exp_cmd_sn: 1,
            max_cmd_sn: max_queued_commands.max(1),
            next_ttt: 1,
            connections: Vec::new(),
            commands: CommandTable::new(),
        }
    }

    /// Next target transfer tag; 0 and the reserved 0xFFFFFFFF are skipped
    pub fn next_ttt(&mut self) -> u32 {
        if self.next_ttt == 0 || self.next_ttt == 0xFFFF_FFFF {
            self.next_ttt = 1;
        }
        let ttt = self.next_ttt;
        self.next_ttt = self.next_ttt.wrapping_add(1);
        ttt
    }

    /// Check a CmdSN against the command window `[exp_cmd_sn, max_cmd_sn]`
    ///
    /// The expected number slides the window by one. Numbers ahead of it
    /// are accepted without moving the window.
    pub fn check_cmd_sn(&mut self, cmd_sn: u32) -> CmdSnWindow {
        if sn_lt(cmd_sn, self.exp_cmd_sn) || sn_lt(self.max_cmd_sn, cmd_sn) {
            return CmdSnWindow::Outside;
        }
        if cmd_sn != self.exp_cmd_sn {
            return CmdSnWindow::Ahead;
        }
        self.exp_cmd_sn = self.exp_cmd_sn.wrapping_add(1);
        self.max_cmd_sn = self.max_cmd_sn.wrapping_add(1);
        CmdSnWindow::Expected
    }

    pub fn add_connection(&mut self, cid: u16) -> ScsiResult<()> {
        if self.connections.iter().any(|c| c.cid == cid) {
            return Err(IscsiError::Session(format!(
                "connection {} already attached to session {:#x}",
                cid, self.sid
            )));
        }
        self.connections.push(IscsiConnection::new(cid));
        Ok(())
    }

    pub fn remove_connection(&mut self, cid: u16) -> Option<IscsiConnection> {
        let pos = self.connections.iter().position(|c| c.cid == cid)?;
        Some(self.connections.remove(pos))
    }

    pub fn connections(&self) -> &[IscsiConnection] {
        &self.connections
    }

    pub fn connection_mut(&mut self, cid: u16) -> Option<&mut IscsiConnection> {
        self.connections.iter_mut().find(|c| c.cid == cid)
    }

    pub fn command_register(&mut self, tag: u64, entry: InFlightCommand) -> ScsiResult<()> {
        self.commands.insert(tag, entry)
    }

    /// Remove a command for terminal processing; None for stale completions
    pub fn command_resolve(&mut self, tag: u64) -> Option<InFlightCommand> {
        self.commands.remove(tag)
    }

    /// Remove a command on ABORT TASK / ABORT TASK SET
    pub fn command_abort(&mut self, tag: u64) -> Option<InFlightCommand> {
        self.commands.remove(tag)
    }

    pub fn in_flight(&self) -> &CommandTable {
        &self.commands
    }

    /// Tags of the in-flight commands addressed to `lun`
    pub fn tags_for_lun(&self, lun: u64) -> Vec<u64> {
        self.commands
            .iter()
            .filter(|e| e.command.lun == lun)
            .map(|e| e.command.tag)
            .collect()
    }
}

/// Sessions of one target, keyed by session id
#[derive(Debug)]
pub struct SessionRegistry {
    tid: u32,
    max_queued_commands: u32,
    sessions: HashMap<u64, Session>,
}

impl SessionRegistry {
    pub fn new(tid: u32, max_queued_commands: u32) -> Self {
        SessionRegistry {
            tid,
            max_queued_commands,
            sessions: HashMap::new(),
        }
    }

    /// Create a session with a copy of `params`
    pub fn create(&mut self, sid: u64, params: &SessionParams) -> ScsiResult<&mut Session> {
        if self.sessions.contains_key(&sid) {
            return Err(IscsiError::SessionExists(sid));
        }
        log::debug!("Creating session {:#x} on target {}", sid, self.tid);
        let session = Session::new(self.tid, sid, params, self.max_queued_commands);
        Ok(self.sessions.entry(sid).or_insert(session))
    }

    pub fn lookup(&self, sid: u64) -> Option<&Session> {
        self.sessions.get(&sid)
    }

    pub fn lookup_mut(&mut self, sid: u64) -> Option<&mut Session> {
        self.sessions.get_mut(&sid)
    }

    /// Destroy a session that has no connections left
    ///
    /// # Panics
    ///
    /// Panics if the session still holds in-flight commands: their
    /// completions would be lost.
    pub fn destroy(&mut self, sid: u64) -> ScsiResult<()> {
        let session = self.sessions.get(&sid).ok_or(IscsiError::SessionNotFound(sid))?;

        if !session.connections.is_empty() {
            log::error!("{:#x} still have connections", sid);
            return Err(IscsiError::SessionBusy(sid));
        }

        assert!(
            session.commands.is_empty(),
            "session {:#x} destroyed with {} in-flight commands",
            sid,
            session.commands.len()
        );

        self.sessions.remove(&sid);
        log::debug!("Destroyed session {:#x}", sid);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
