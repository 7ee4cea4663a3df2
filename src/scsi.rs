//! SCSI command records and I/O classification
//!
//! This module holds the protocol-layer command record handed to the core,
//! the SCSI constants needed to build responses, and the classifier that maps
//! a command to the I/O intent submitted to the backing store, per the SCSI
//! Block Commands (SBC) standard.

use byteorder::{BigEndian, ByteOrder};

/// SCSI command opcodes routed to the backing store
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    Read6 = 0x08,
    Write6 = 0x0A,
    Read10 = 0x28,
    Write10 = 0x2A,
    SynchronizeCache10 = 0x35,
    WriteSame10 = 0x41,
    Unmap = 0x42,
    Read16 = 0x88,
    Write16 = 0x8A,
    SynchronizeCache16 = 0x91,
    WriteSame16 = 0x93,
    Read12 = 0xA8,
    Write12 = 0xAA,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x41 => Some(ScsiOpcode::WriteSame10),
            0x42 => Some(ScsiOpcode::Unmap),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x93 => Some(ScsiOpcode::WriteSame16),
            0xA8 => Some(ScsiOpcode::Read12),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }
}

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const BUSY: u8 = 0x08;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const ABORTED_COMMAND: u8 = 0x0B;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
}

/// iSCSI task management function codes (RFC 3720 Section 10.5.1)
pub mod tmf {
    pub const ABORT_TASK: u8 = 1;
    pub const ABORT_TASK_SET: u8 = 2;
    pub const CLEAR_ACA: u8 = 3;
    pub const CLEAR_TASK_SET: u8 = 4;
    pub const LOGICAL_UNIT_RESET: u8 = 5;
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,  // Additional Sense Code
    pub ascq: u8, // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;
        data[2] = self.sense_key & 0x0F;
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length
        data[7] = 10;

        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    pub fn invalid_field() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_FIELD_IN_CDB, 0)
    }

    /// LBA out of range; the information field carries the low 32 bits of the LBA
    pub fn lba_out_of_range(lba: u64) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            .with_info((lba & 0xFFFF_FFFF) as u32)
    }

    pub fn lun_not_supported() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LOGICAL_UNIT_NOT_SUPPORTED, 0)
    }

    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, asc::NO_ADDITIONAL_SENSE, 0)
    }

    pub fn aborted_command() -> Self {
        SenseData::new(sense_key::ABORTED_COMMAND, asc::NO_ADDITIONAL_SENSE, 0)
    }
}

/// Data transfer direction of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataDirection {
    #[default]
    None,
    /// Device to initiator (Data-In)
    Read,
    /// Initiator to device (Data-Out)
    Write,
    Bidirectional,
}

/// Task management request attached to a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskManagement {
    /// Function code, see [`tmf`]
    pub function: u8,
    /// Task tag the function refers to (ABORT TASK)
    pub referenced_tag: u64,
}

/// Lifecycle of a command as seen by the protocol layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandState {
    #[default]
    New,
    /// Submitted to the backing store; completion arrives through the drain loop
    Async,
    Done,
}

/// Protocol-layer SCSI command record
///
/// The record is moved into the session's command table while in flight and
/// handed back by value through `command_io_done`.
#[derive(Debug, Clone, Default)]
pub struct ScsiCommand {
    /// Task tag (ITT) identifying the command within its session
    pub tag: u64,
    pub lun: u64,
    /// CmdSN of the carrying PDU; None for immediate delivery
    pub cmd_sn: Option<u32>,
    pub cdb: Vec<u8>,
    pub direction: DataDirection,
    /// Pre-parsed byte offset of the transfer
    pub offset: u64,
    /// Pre-parsed transfer length in bytes
    pub transfer_length: u64,
    /// Data-Out buffer (write payload, unmap parameter list)
    pub data_out: Vec<u8>,
    /// Data-In buffer, filled on read completion
    pub data_in: Vec<u8>,
    pub management: Option<TaskManagement>,
    pub state: CommandState,
    pub status: u8,
    pub sense: Option<SenseData>,
}

impl ScsiCommand {
    /// Create a command from a CDB
    pub fn new(tag: u64, lun: u64, cdb: &[u8]) -> Self {
        let direction = match cdb.first().copied().and_then(ScsiOpcode::from_u8) {
            Some(ScsiOpcode::Read6 | ScsiOpcode::Read10 | ScsiOpcode::Read12 | ScsiOpcode::Read16) => {
                DataDirection::Read
            }
            Some(
                ScsiOpcode::Write6
                | ScsiOpcode::Write10
                | ScsiOpcode::Write12
                | ScsiOpcode::Write16
                | ScsiOpcode::WriteSame10
                | ScsiOpcode::WriteSame16
                | ScsiOpcode::Unmap,
            ) => DataDirection::Write,
            _ => DataDirection::None,
        };
        ScsiCommand {
            tag,
            lun,
            cdb: cdb.to_vec(),
            direction,
            ..Default::default()
        }
    }

    /// Create a task management request
    pub fn management(tag: u64, lun: u64, function: u8, referenced_tag: u64) -> Self {
        ScsiCommand {
            tag,
            lun,
            management: Some(TaskManagement {
                function,
                referenced_tag,
            }),
            ..Default::default()
        }
    }

    /// Record the CmdSN the command arrived with
    pub fn with_cmd_sn(mut self, cmd_sn: u32) -> Self {
        self.cmd_sn = Some(cmd_sn);
        self
    }

    /// Attach a Data-Out payload
    pub fn with_data_out(mut self, data: Vec<u8>) -> Self {
        self.data_out = data;
        self
    }

    /// Fill `offset`/`transfer_length` from the CDB's logical block fields
    ///
    /// Covers the READ, WRITE and WRITE SAME families. Returns false when the
    /// CDB is not one of those or is too short, and when the extent does not
    /// fit a 64-bit byte offset. An overflowing extent is saturated so that
    /// it fails every range check.
    pub fn parse_extent(&mut self, block_size: u32) -> bool {
        let (lba, blocks) = match parse_lba_and_blocks(&self.cdb) {
            Some(extent) => extent,
            None => return false,
        };
        let block_size = block_size as u64;
        match lba.checked_mul(block_size) {
            Some(offset) => {
                self.offset = offset;
                self.transfer_length = blocks as u64 * block_size;
                true
            }
            None => {
                self.offset = u64::MAX;
                self.transfer_length = (blocks as u64 * block_size).max(1);
                false
            }
        }
    }

    pub fn opcode(&self) -> u8 {
        self.cdb.first().copied().unwrap_or(0)
    }

    pub fn is_async(&self) -> bool {
        self.state == CommandState::Async
    }

    pub fn set_async(&mut self) {
        self.state = CommandState::Async;
    }

    /// Record the final result of the command
    pub fn set_result(&mut self, status: u8, sense: Option<SenseData>) {
        self.status = status;
        self.sense = sense;
        self.state = CommandState::Done;
    }
}

/// Parse LBA and block count from a READ/WRITE/WRITE SAME CDB
fn parse_lba_and_blocks(cdb: &[u8]) -> Option<(u64, u32)> {
    let op = ScsiOpcode::from_u8(*cdb.first()?)?;
    match op {
        ScsiOpcode::Read6 | ScsiOpcode::Write6 => {
            if cdb.len() < 6 {
                return None;
            }
            let lba = ((cdb[1] as u64 & 0x1F) << 16) | ((cdb[2] as u64) << 8) | cdb[3] as u64;
            // A zero transfer length means 256 blocks for the 6-byte variants
            let blocks = if cdb[4] == 0 { 256 } else { cdb[4] as u32 };
            Some((lba, blocks))
        }
        ScsiOpcode::Read10 | ScsiOpcode::Write10 | ScsiOpcode::WriteSame10 => {
            if cdb.len() < 10 {
                return None;
            }
            Some((BigEndian::read_u32(&cdb[2..6]) as u64, BigEndian::read_u16(&cdb[7..9]) as u32))
        }
        ScsiOpcode::Read12 | ScsiOpcode::Write12 => {
            if cdb.len() < 12 {
                return None;
            }
            Some((BigEndian::read_u32(&cdb[2..6]) as u64, BigEndian::read_u32(&cdb[6..10])))
        }
        ScsiOpcode::Read16 | ScsiOpcode::Write16 | ScsiOpcode::WriteSame16 => {
            if cdb.len() < 16 {
                return None;
            }
            Some((BigEndian::read_u64(&cdb[2..10]), BigEndian::read_u32(&cdb[10..14])))
        }
        _ => None,
    }
}

/// Parse LBA and block count directly from a SYNCHRONIZE CACHE CDB
fn parse_sync_cache(cdb: &[u8]) -> Option<(u64, u32)> {
    match ScsiOpcode::from_u8(*cdb.first()?)? {
        ScsiOpcode::SynchronizeCache10 if cdb.len() >= 10 => {
            Some((BigEndian::read_u32(&cdb[2..6]) as u64, BigEndian::read_u16(&cdb[7..9]) as u32))
        }
        ScsiOpcode::SynchronizeCache16 if cdb.len() >= 16 => {
            Some((BigEndian::read_u64(&cdb[2..10]), BigEndian::read_u32(&cdb[10..14])))
        }
        _ => None,
    }
}

// ============================================================================
// Classification
// ============================================================================

/// I/O intent a command maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoIntent {
    Read,
    Write,
    /// UNMAP
    Truncate,
    WriteSame,
    SyncCache,
    AbortTask,
    AbortTaskSet,
    Unknown,
}

impl IoIntent {
    pub fn name(&self) -> &'static str {
        match self {
            IoIntent::Read => "read",
            IoIntent::Write => "write",
            IoIntent::Truncate => "truncate",
            IoIntent::WriteSame => "write-same",
            IoIntent::SyncCache => "sync-cache",
            IoIntent::AbortTask => "abort-task",
            IoIntent::AbortTaskSet => "abort-task-set",
            IoIntent::Unknown => "unknown",
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, IoIntent::AbortTask | IoIntent::AbortTaskSet)
    }
}

/// Classify a command by its management function or opcode
///
/// Management requests take precedence over the CDB.
pub fn classify(command: &ScsiCommand) -> IoIntent {
    if let Some(mgmt) = command.management {
        return match mgmt.function {
            tmf::ABORT_TASK => IoIntent::AbortTask,
            tmf::ABORT_TASK_SET => IoIntent::AbortTaskSet,
            _ => IoIntent::Unknown,
        };
    }

    match command.cdb.first().copied().and_then(ScsiOpcode::from_u8) {
        Some(ScsiOpcode::Read6 | ScsiOpcode::Read10 | ScsiOpcode::Read12 | ScsiOpcode::Read16) => {
            IoIntent::Read
        }
        Some(ScsiOpcode::Write6 | ScsiOpcode::Write10 | ScsiOpcode::Write12 | ScsiOpcode::Write16) => {
            IoIntent::Write
        }
        Some(ScsiOpcode::Unmap) => IoIntent::Truncate,
        Some(ScsiOpcode::WriteSame10 | ScsiOpcode::WriteSame16) => {
            if command.cdb.get(1).is_some_and(|b| b & 0x08 != 0) {
                log::debug!("WRITE SAME with UNMAP bit on task {} is not supported", command.tag);
            }
            IoIntent::WriteSame
        }
        Some(ScsiOpcode::SynchronizeCache10 | ScsiOpcode::SynchronizeCache16) => IoIntent::SyncCache,
        None => {
            log::debug!("Skipped task {} opcode {:#04x}", command.tag, command.opcode());
            IoIntent::Unknown
        }
    }
}

/// Logical unit geometry the classifier validates against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub size_bytes: u64,
    pub block_shift: u32,
    pub thin_provisioning: bool,
}

impl Geometry {
    pub fn blocks(&self) -> u64 {
        self.size_bytes >> self.block_shift
    }

    pub fn block_size(&self) -> u32 {
        1 << self.block_shift
    }
}

/// Byte extent of a request to submit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub intent: IoIntent,
    pub offset: u64,
    pub length: u64,
}

/// Unmap parameter list header skipped before forwarding descriptors
pub const UNMAP_HEADER_LEN: usize = 8;

/// What to do with a classified command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Submit asynchronously to the backing store
    Dispatch(IoRequest),
    /// Synchronous abort round trip
    Abort(IoIntent),
    /// Nothing to do; complete with GOOD status
    Complete,
    /// Fail with CHECK CONDITION before any backing store call
    Reject(SenseData),
}

/// Classify and validate a command against a logical unit
pub fn plan(command: &ScsiCommand, geometry: &Geometry) -> Plan {
    let intent = classify(command);
    match intent {
        IoIntent::AbortTask | IoIntent::AbortTaskSet => Plan::Abort(intent),
        IoIntent::Unknown => Plan::Complete,
        IoIntent::WriteSame => Plan::Reject(SenseData::invalid_command()),
        IoIntent::Read | IoIntent::Write => {
            let (offset, length) = (command.offset, command.transfer_length);
            if length == 0 {
                log::debug!("Zero size {} on task {}, completing from top", intent.name(), command.tag);
                return Plan::Complete;
            }
            if offset.checked_add(length).map_or(true, |end| end > geometry.size_bytes) {
                let lba = parse_lba_and_blocks(&command.cdb).map_or(offset >> geometry.block_shift, |(lba, _)| lba);
                return Plan::Reject(SenseData::lba_out_of_range(lba));
            }
            Plan::Dispatch(IoRequest { intent, offset, length })
        }
        IoIntent::Truncate => {
            if !geometry.thin_provisioning {
                return Plan::Reject(SenseData::invalid_field());
            }
            if command.data_out.len() <= UNMAP_HEADER_LEN {
                return Plan::Complete;
            }
            Plan::Dispatch(IoRequest {
                intent,
                offset: 0,
                length: (command.data_out.len() - UNMAP_HEADER_LEN) as u64,
            })
        }
        IoIntent::SyncCache => plan_sync_cache(command, geometry),
    }
}

fn plan_sync_cache(command: &ScsiCommand, geometry: &Geometry) -> Plan {
    // IMMED is not supported by the device server
    if command.cdb.get(1).is_some_and(|b| b & 0x02 != 0) {
        return Plan::Reject(SenseData::invalid_field());
    }

    let (lba, count) = match parse_sync_cache(&command.cdb) {
        Some(extent) => extent,
        None => return Plan::Reject(SenseData::invalid_field()),
    };

    let blocks = geometry.blocks();
    // Zero blocks means every LBA up to the end of the device
    let count = if count == 0 {
        blocks.saturating_sub(lba)
    } else {
        count as u64
    };

    if lba >= blocks || lba.saturating_add(count) > blocks {
        log::error!("SYNC error LBA out of range: lba {} count {} blocks {}", lba, count, blocks);
        return Plan::Reject(SenseData::lba_out_of_range(lba));
    }

    Plan::Dispatch(IoRequest {
        intent: IoIntent::SyncCache,
        offset: lba << geometry.block_shift,
        length: count << geometry.block_shift,
    })
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(blocks: u64) -> Geometry {
        Geometry {
            size_bytes: blocks * 512,
            block_shift: 9,
            thin_provisioning: false,
        }
    }

    fn sync10(lba: u32, count: u16) -> ScsiCommand {
        let mut cdb = [0u8; 10];
        cdb[0] = 0x35;
        BigEndian::write_u32(&mut cdb[2..6], lba);
        BigEndian::write_u16(&mut cdb[7..9], count);
        ScsiCommand::new(6, 0, &cdb)
    }

    #[test]
    fn test_classify_read_write_families() {
        for op in [0x08u8, 0x28, 0xA8, 0x88] {
            assert_eq!(classify(&ScsiCommand::new(1, 0, &[op, 0, 0, 0, 0, 0])), IoIntent::Read);
        }
        for op in [0x0Au8, 0x2A, 0xAA, 0x8A] {
            assert_eq!(classify(&ScsiCommand::new(1, 0, &[op, 0, 0, 0, 0, 0])), IoIntent::Write);
        }
    }

    #[test]
    fn test_classify_other_intents() {
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x42])), IoIntent::Truncate);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x41])), IoIntent::WriteSame);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x93])), IoIntent::WriteSame);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x35])), IoIntent::SyncCache);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x91])), IoIntent::SyncCache);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[0x12])), IoIntent::Unknown);
        assert_eq!(classify(&ScsiCommand::new(1, 0, &[])), IoIntent::Unknown);
    }

    #[test]
    fn test_management_takes_precedence() {
        let mut cmd = ScsiCommand::management(9, 0, tmf::ABORT_TASK, 5);
        cmd.cdb = vec![0x28, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        assert_eq!(classify(&cmd), IoIntent::AbortTask);

        let cmd = ScsiCommand::management(9, 0, tmf::ABORT_TASK_SET, 0);
        assert_eq!(classify(&cmd), IoIntent::AbortTaskSet);

        let cmd = ScsiCommand::management(9, 0, tmf::LOGICAL_UNIT_RESET, 0);
        assert_eq!(classify(&cmd), IoIntent::Unknown);
    }

    #[test]
    fn test_parse_extent_rw10() {
        let mut cmd = ScsiCommand::new(1, 0, &[0x28, 0, 0, 0, 0, 100, 0, 0, 10, 0]);
        assert!(cmd.parse_extent(512));
        assert_eq!(cmd.offset, 100 * 512);
        assert_eq!(cmd.transfer_length, 10 * 512);
        assert_eq!(cmd.direction, DataDirection::Read);
    }

    #[test]
    fn test_parse_extent_rw16() {
        let cdb = [
            0x8A, 0,
            0, 0, 0, 0, 0, 0, 0, 100, // LBA=100
            0, 0, 0, 10, // length=10
            0, 0,
        ];
        let mut cmd = ScsiCommand::new(1, 0, &cdb);
        assert!(cmd.parse_extent(4096));
        assert_eq!(cmd.offset, 100 * 4096);
        assert_eq!(cmd.transfer_length, 10 * 4096);
        assert_eq!(cmd.direction, DataDirection::Write);
    }

    #[test]
    fn test_parse_extent_rw6_zero_means_256() {
        let mut cmd = ScsiCommand::new(1, 0, &[0x08, 0x01, 0x00, 0x02, 0, 0]);
        assert!(cmd.parse_extent(512));
        assert_eq!(cmd.offset, 0x10002 * 512);
        assert_eq!(cmd.transfer_length, 256 * 512);
    }

    #[test]
    fn test_parse_extent_rejects_short_cdb() {
        let mut cmd = ScsiCommand::new(1, 0, &[0x28, 0, 0]);
        assert!(!cmd.parse_extent(512));
        let mut cmd = ScsiCommand::new(1, 0, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(!cmd.parse_extent(512));
    }

    #[test]
    fn test_huge_lba_rejected_not_wrapped() {
        let lba: u64 = (1 << 55) + 8;
        let mut cdb = [0u8; 16];
        cdb[0] = 0x8A;
        BigEndian::write_u64(&mut cdb[2..10], lba);
        BigEndian::write_u32(&mut cdb[10..14], 1);
        let mut cmd = ScsiCommand::new(1, 0, &cdb).with_data_out(vec![0u8; 512]);

        assert!(!cmd.parse_extent(512));
        assert_eq!(cmd.offset, u64::MAX);

        match plan(&cmd, &geometry(1000)) {
            Plan::Reject(sense) => {
                assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
                assert_eq!(sense.information, (lba & 0xFFFF_FFFF) as u32);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_zero_length_read_write_complete() {
        let read = ScsiCommand::new(1, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(plan(&read, &geometry(1000)), Plan::Complete);
        let write = ScsiCommand::new(2, 0, &[0x2A, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(plan(&write, &geometry(1000)), Plan::Complete);
    }

    #[test]
    fn test_write_dispatch_extent() {
        let mut cmd = ScsiCommand::new(5, 0, &[0x2A, 0, 0, 0, 0, 8, 0, 0, 1, 0]);
        cmd.parse_extent(512);
        assert_eq!(
            plan(&cmd, &geometry(1000)),
            Plan::Dispatch(IoRequest {
                intent: IoIntent::Write,
                offset: 4096,
                length: 512
            })
        );
    }

    #[test]
    fn test_read_past_end_rejected() {
        let mut cmd = ScsiCommand::new(5, 0, &[0x28, 0, 0, 0, 0x03, 0xE7, 0, 0, 2, 0]);
        cmd.parse_extent(512);
        match plan(&cmd, &geometry(1000)) {
            Plan::Reject(sense) => {
                assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
                assert_eq!(sense.information, 999);
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_sync_cache_zero_count_runs_to_end() {
        let plan = plan(&sync10(600, 0), &geometry(1000));
        assert_eq!(
            plan,
            Plan::Dispatch(IoRequest {
                intent: IoIntent::SyncCache,
                offset: 600 * 512,
                length: 400 * 512
            })
        );
    }

    #[test]
    fn test_sync_cache_out_of_range() {
        // 1000 blocks, LBA 999 count 5
        match plan(&sync10(999, 5), &geometry(1000)) {
            Plan::Reject(sense) => {
                assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
                assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert!(matches!(plan(&sync10(1000, 0), &geometry(1000)), Plan::Reject(_)));
        assert!(matches!(plan(&sync10(999, 1), &geometry(1000)), Plan::Dispatch(_)));
    }

    #[test]
    fn test_sync_cache16_extent() {
        let mut cdb = [0u8; 16];
        cdb[0] = 0x91;
        BigEndian::write_u64(&mut cdb[2..10], 10);
        BigEndian::write_u32(&mut cdb[10..14], 20);
        let cmd = ScsiCommand::new(1, 0, &cdb);
        assert_eq!(
            plan(&cmd, &geometry(1000)),
            Plan::Dispatch(IoRequest {
                intent: IoIntent::SyncCache,
                offset: 10 * 512,
                length: 20 * 512
            })
        );
    }

    #[test]
    fn test_sync_cache_immed_rejected() {
        let mut cmd = sync10(0, 1);
        cmd.cdb[1] = 0x02;
        match plan(&cmd, &geometry(1000)) {
            Plan::Reject(sense) => assert_eq!(sense.asc, asc::INVALID_FIELD_IN_CDB),
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_unmap_requires_thin_provisioning() {
        let cmd = ScsiCommand::new(1, 0, &[0x42, 0, 0, 0, 0, 0, 0, 0, 24, 0]).with_data_out(vec![0u8; 24]);
        assert!(matches!(plan(&cmd, &geometry(1000)), Plan::Reject(_)));

        let thin = Geometry {
            thin_provisioning: true,
            ..geometry(1000)
        };
        assert_eq!(
            plan(&cmd, &thin),
            Plan::Dispatch(IoRequest {
                intent: IoIntent::Truncate,
                offset: 0,
                length: 16
            })
        );
    }

    #[test]
    fn test_write_same_rejected_and_unknown_completes() {
        let cmd = ScsiCommand::new(1, 0, &[0x41, 0, 0, 0, 0, 0, 0, 0, 1, 0]);
        match plan(&cmd, &geometry(10)) {
            Plan::Reject(sense) => assert_eq!(sense.asc, asc::INVALID_COMMAND_OPERATION_CODE),
            other => panic!("unexpected plan {:?}", other),
        }
        let cmd = ScsiCommand::new(1, 0, &[0x00, 0, 0, 0, 0, 0]);
        assert_eq!(plan(&cmd, &geometry(10)), Plan::Complete);
    }

    #[test]
    fn test_sense_data_serialization() {
        let sense = SenseData::lba_out_of_range(0x1_0000_0005);
        let data = sense.to_bytes();
        assert_eq!(data.len(), 18);
        assert_eq!(data[0], 0x70); // Current error, fixed format
        assert_eq!(data[2], sense_key::ILLEGAL_REQUEST);
        assert_eq!(BigEndian::read_u32(&data[3..7]), 5);
        assert_eq!(data[12], asc::LBA_OUT_OF_RANGE);
    }

    #[test]
    fn test_command_state_transitions() {
        let mut cmd = ScsiCommand::new(1, 0, &[0x28]);
        assert_eq!(cmd.state, CommandState::New);
        cmd.set_async();
        assert!(cmd.is_async());
        cmd.set_result(scsi_status::CHECK_CONDITION, Some(SenseData::medium_error()));
        assert_eq!(cmd.state, CommandState::Done);
        assert_eq!(cmd.sense.unwrap().sense_key, sense_key::MEDIUM_ERROR);
    }
}
