//! Integration tests for the target I/O core
//!
//! Commands are submitted the way a protocol layer would submit them and
//! completions are driven through a real reactor over the in-memory
//! backing store.

use once_cell::sync::Lazy;
use rand::Rng;
use std::io::{self, Cursor};
use std::time::Duration;
use tgt_core::scsi::{asc, scsi_status, sense_key, tmf};
use tgt_core::session::SessionParams;
use tgt_core::{
    CommandCompletion, InputStream, IscsiError, LunConfig, MemoryStore, OutputStream, Reactor, ScsiCommand,
    SenseData, Submission, Target,
};

// ============================================================================
// Test Harness
// ============================================================================

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

fn init_logging() {
    Lazy::force(&LOGGER);
}

const SESSION: u64 = 0x1001;
const BLOCK_SIZE: u32 = 512;
const WAIT: Option<Duration> = Some(Duration::from_millis(200));

/// Protocol layer stand-in recording every `command_io_done`
#[derive(Default)]
struct Recorder {
    done: Vec<(ScsiCommand, u8, Option<SenseData>)>,
}

impl Recorder {
    fn statuses(&self) -> Vec<(u64, u8)> {
        self.done.iter().map(|(cmd, status, _)| (cmd.tag, *status)).collect()
    }
}

impl CommandCompletion for Recorder {
    fn command_io_done(&mut self, command: ScsiCommand, status: u8, sense: Option<SenseData>) {
        self.done.push((command, status, sense));
    }
}

type TestTarget = Target<MemoryStore, Recorder>;

/// Target with LUN 0 of 1000 blocks attached to a reactor and session 0x1001
fn setup() -> (TestTarget, Reactor<TestTarget>) {
    init_logging();
    let mut target = Target::builder()
        .tid(1)
        .target_name("iqn.2025-12.local:storage.test")
        .completion_batch(2)
        .build(MemoryStore::new(), Recorder::default())
        .expect("target");
    let mut reactor = Reactor::new(64).expect("reactor");

    target
        .add_lun(
            0,
            LunConfig {
                size_bytes: 1000 * BLOCK_SIZE as u64,
                block_size: BLOCK_SIZE,
                thin_provisioning: true,
                bs_options: "vmid=vm-7:vmdkid=disk-3".to_string(),
            },
        )
        .expect("lun");
    target.attach_lun(0, &mut reactor).expect("attach");
    target.create_session(SESSION).expect("session");
    (target, reactor)
}

fn read10(tag: u64, lba: u32, blocks: u16) -> ScsiCommand {
    let lba = lba.to_be_bytes();
    let len = blocks.to_be_bytes();
    let mut cmd = ScsiCommand::new(tag, 0, &[0x28, 0, lba[0], lba[1], lba[2], lba[3], 0, len[0], len[1], 0]);
    cmd.parse_extent(BLOCK_SIZE);
    cmd
}

fn write10(tag: u64, lba: u32, data: Vec<u8>) -> ScsiCommand {
    let lba = lba.to_be_bytes();
    let len = ((data.len() / BLOCK_SIZE as usize) as u16).to_be_bytes();
    let mut cmd = ScsiCommand::new(tag, 0, &[0x2A, 0, lba[0], lba[1], lba[2], lba[3], 0, len[0], len[1], 0])
        .with_data_out(data);
    cmd.parse_extent(BLOCK_SIZE);
    cmd
}

fn sync10(tag: u64, lba: u32, blocks: u16) -> ScsiCommand {
    let lba = lba.to_be_bytes();
    let len = blocks.to_be_bytes();
    ScsiCommand::new(tag, 0, &[0x35, 0, lba[0], lba[1], lba[2], lba[3], 0, len[0], len[1], 0])
}

fn expect_immediate(submission: Submission) -> ScsiCommand {
    match submission {
        Submission::Immediate(cmd) => cmd,
        Submission::Async => panic!("expected an immediate answer"),
    }
}

// ============================================================================
// Command Scenarios
// ============================================================================

#[test]
fn test_write_completes_once_through_reactor() {
    let (mut target, mut reactor) = setup();

    // task 5: 512 bytes at offset 4096
    let cmd = write10(5, 8, vec![0xA5; 512]);
    assert_eq!((cmd.offset, cmd.transfer_length), (4096, 512));
    assert!(matches!(target.submit_command(SESSION, cmd).unwrap(), Submission::Async));
    assert!(target.session(SESSION).unwrap().in_flight().contains(5));

    assert_eq!(reactor.run_once(&mut target, WAIT).unwrap(), 1);

    assert_eq!(target.observer().statuses(), vec![(5, scsi_status::GOOD)]);
    assert!(target.observer().done[0].2.is_none());
    assert!(target.session(SESSION).unwrap().in_flight().get(5).is_none());

    let handle = target.logical_unit(0).unwrap().handle();
    assert_eq!(&target.store().contents(handle).unwrap()[4096..4608], &[0xA5; 512][..]);

    // Nothing further arrives for the same task
    assert_eq!(reactor.run_once(&mut target, Some(Duration::from_millis(10))).unwrap(), 0);
    assert_eq!(target.observer().done.len(), 1);
}

#[test]
fn test_sync_cache_out_of_range_fails_before_dispatch() {
    let (mut target, _reactor) = setup();

    let done = expect_immediate(target.submit_command(SESSION, sync10(6, 999, 5)).unwrap());
    assert_eq!(done.status, scsi_status::CHECK_CONDITION);
    let sense = done.sense.unwrap();
    assert_eq!(sense.sense_key, sense_key::ILLEGAL_REQUEST);
    assert_eq!(sense.asc, asc::LBA_OUT_OF_RANGE);

    assert_eq!(target.store().calls().scheduled, 0);
    assert!(target.session(SESSION).unwrap().in_flight().is_empty());
    assert!(target.observer().done.is_empty());
}

#[test]
fn test_sync_cache_whole_device_goes_async() {
    let (mut target, mut reactor) = setup();

    assert!(matches!(
        target.submit_command(SESSION, sync10(6, 0, 0)).unwrap(),
        Submission::Async
    ));
    reactor.run_once(&mut target, WAIT).unwrap();
    assert_eq!(target.observer().statuses(), vec![(6, scsi_status::GOOD)]);
}

#[test]
fn test_zero_length_transfers_short_circuit() {
    let (mut target, _reactor) = setup();

    let done = expect_immediate(target.submit_command(SESSION, read10(1, 10, 0)).unwrap());
    assert_eq!(done.status, scsi_status::GOOD);
    let done = expect_immediate(target.submit_command(SESSION, write10(2, 10, Vec::new())).unwrap());
    assert_eq!(done.status, scsi_status::GOOD);

    assert_eq!(target.store().calls().scheduled, 0);
    assert!(target.observer().done.is_empty());
}

#[test]
fn test_read_returns_written_data() {
    let (mut target, mut reactor) = setup();
    let pattern: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

    target.submit_command(SESSION, write10(1, 100, pattern.clone())).unwrap();
    reactor.run_once(&mut target, WAIT).unwrap();
    target.submit_command(SESSION, read10(2, 100, 2)).unwrap();
    reactor.run_once(&mut target, WAIT).unwrap();

    let (read, status, _) = &target.observer().done[1];
    assert_eq!(*status, scsi_status::GOOD);
    assert_eq!(read.data_in, pattern);
}

#[test]
fn test_read_past_end_rejected() {
    let (mut target, _reactor) = setup();
    let done = expect_immediate(target.submit_command(SESSION, read10(1, 999, 2)).unwrap());
    assert_eq!(done.sense.unwrap().asc, asc::LBA_OUT_OF_RANGE);
    assert_eq!(target.store().calls().scheduled, 0);
}

#[test]
fn test_unknown_opcode_completes_without_backing_call() {
    let (mut target, _reactor) = setup();
    // TEST UNIT READY
    let done = expect_immediate(target.submit_command(SESSION, ScsiCommand::new(1, 0, &[0x00; 6])).unwrap());
    assert_eq!(done.status, scsi_status::GOOD);
    assert_eq!(target.store().calls().scheduled, 0);
}

#[test]
fn test_unmap_zeroes_blocks() {
    let (mut target, mut reactor) = setup();
    target.submit_command(SESSION, write10(1, 4, vec![0xFF; 1024])).unwrap();
    reactor.run_once(&mut target, WAIT).unwrap();

    // Header, then one descriptor: LBA 5, 1 block
    let mut params = vec![0u8; 8];
    params.extend_from_slice(&5u64.to_be_bytes());
    params.extend_from_slice(&1u32.to_be_bytes());
    params.extend_from_slice(&[0u8; 4]);
    let unmap = ScsiCommand::new(2, 0, &[0x42, 0, 0, 0, 0, 0, 0, 0, 24, 0]).with_data_out(params);
    assert!(matches!(target.submit_command(SESSION, unmap).unwrap(), Submission::Async));
    reactor.run_once(&mut target, WAIT).unwrap();

    assert_eq!(
        target.observer().statuses(),
        vec![(1, scsi_status::GOOD), (2, scsi_status::GOOD)]
    );
    let handle = target.logical_unit(0).unwrap().handle();
    let data = target.store().contents(handle).unwrap();
    assert!(data[2048..2560].iter().all(|&b| b == 0xFF));
    assert!(data[2560..3072].iter().all(|&b| b == 0));
}

// ============================================================================
// Error Paths
// ============================================================================

#[test]
fn test_invalid_request_id_fails_immediately() {
    let (mut target, mut reactor) = setup();
    target.store_mut().reject_next(1);

    let err = target.submit_command(SESSION, write10(5, 8, vec![1; 512])).unwrap_err();
    assert!(matches!(err, IscsiError::InvalidRequest { op: "write", offset: 4096, length: 512 }));

    let (cmd, status, sense) = &target.observer().done[0];
    assert_eq!(cmd.tag, 5);
    assert!(!cmd.is_async());
    assert_eq!(*status, scsi_status::CHECK_CONDITION);
    assert_eq!(sense.as_ref().unwrap().sense_key, sense_key::MEDIUM_ERROR);
    assert!(target.session(SESSION).unwrap().in_flight().is_empty());

    // No completion ever follows
    assert_eq!(reactor.run_once(&mut target, Some(Duration::from_millis(10))).unwrap(), 0);
    assert_eq!(target.observer().done.len(), 1);
    assert_eq!(target.lun_stats(0).unwrap().submit_errors, 1);
}

#[test]
fn test_failed_completion_reports_medium_error() {
    let (mut target, mut reactor) = setup();
    target.store_mut().fail_next(1);

    target.submit_command(SESSION, read10(3, 0, 1)).unwrap();
    reactor.run_once(&mut target, WAIT).unwrap();

    let (_, status, sense) = &target.observer().done[0];
    assert_eq!(*status, scsi_status::CHECK_CONDITION);
    assert_eq!(sense.as_ref().unwrap(), &SenseData::medium_error());
    assert_eq!(target.lun_stats(0).unwrap().failed, 1);
    assert!(target.session(SESSION).unwrap().in_flight().is_empty());
}

#[test]
fn test_duplicate_tag_is_refused() {
    let (mut target, _reactor) = setup();
    target.store_mut().hold_completions(true);
    target.submit_command(SESSION, read10(9, 0, 1)).unwrap();
    assert!(matches!(
        target.submit_command(SESSION, read10(9, 1, 1)),
        Err(IscsiError::DuplicateTask(9))
    ));
    assert_eq!(target.store().calls().scheduled, 1);
}

// ============================================================================
// Completion Draining
// ============================================================================

#[test]
fn test_drain_fetches_batches_until_signal_clear() {
    let (mut target, _reactor) = setup();
    for tag in 0..5 {
        target.submit_command(SESSION, read10(tag, tag as u32, 1)).unwrap();
    }

    // Batches of 2: (2, more) (2, more) (1, done), then one pass for the signal counter
    let report = target.handle_completion(0).unwrap();
    assert_eq!(report.completed, 5);
    assert_eq!(report.fetches, 4);
    assert_eq!(target.store().calls().fetches, 4);

    let report = target.handle_completion(0).unwrap();
    assert_eq!((report.fetches, report.completed), (1, 0));
}

#[test]
fn test_completions_across_reactor_turns() {
    let (mut target, mut reactor) = setup();
    target.store_mut().hold_completions(true);
    for tag in 10..13 {
        target.submit_command(SESSION, read10(tag, 0, 1)).unwrap();
    }
    assert_eq!(reactor.run_once(&mut target, Some(Duration::from_millis(10))).unwrap(), 0);
    assert!(target.observer().done.is_empty());

    let handle = target.logical_unit(0).unwrap().handle();
    target.store_mut().release(handle);
    assert_eq!(reactor.run_once(&mut target, WAIT).unwrap(), 1);
    assert_eq!(
        target.observer().statuses(),
        vec![(10, scsi_status::GOOD), (11, scsi_status::GOOD), (12, scsi_status::GOOD)]
    );
}

// ============================================================================
// Task Management
// ============================================================================

#[test]
fn test_abort_task_reports_victim_once() {
    let (mut target, mut reactor) = setup();
    target.store_mut().hold_completions(true);
    target.submit_command(SESSION, write10(5, 8, vec![1; 512])).unwrap();
    target.submit_command(SESSION, write10(6, 9, vec![2; 512])).unwrap();

    let mgmt = ScsiCommand::management(7, 0, tmf::ABORT_TASK, 5);
    let done = expect_immediate(target.submit_command(SESSION, mgmt).unwrap());
    assert_eq!(done.status, scsi_status::GOOD);
    assert_eq!(target.observer().statuses(), vec![(5, scsi_status::TASK_ABORTED)]);

    let handle = target.logical_unit(0).unwrap().handle();
    target.store_mut().release(handle);
    reactor.run_once(&mut target, WAIT).unwrap();

    assert_eq!(
        target.observer().statuses(),
        vec![(5, scsi_status::TASK_ABORTED), (6, scsi_status::GOOD)]
    );
    assert_eq!(target.lun_stats(0).unwrap().aborted, 1);
}

#[test]
fn test_abort_task_set_empties_lun() {
    let (mut target, _reactor) = setup();
    target.store_mut().hold_completions(true);
    for tag in 1..=3 {
        target.submit_command(SESSION, read10(tag, 0, 1)).unwrap();
    }

    let mgmt = ScsiCommand::management(4, 0, tmf::ABORT_TASK_SET, 0);
    expect_immediate(target.submit_command(SESSION, mgmt).unwrap());

    assert_eq!(target.observer().done.len(), 3);
    assert!(target
        .observer()
        .done
        .iter()
        .all(|(_, status, _)| *status == scsi_status::TASK_ABORTED));
    assert!(target.session(SESSION).unwrap().in_flight().is_empty());
    target.destroy_session(SESSION).unwrap();
}

// ============================================================================
// Sessions and Logical Units
// ============================================================================

#[test]
fn test_session_destroy_refused_with_connections() {
    let (mut target, _reactor) = setup();
    target.session_mut(SESSION).unwrap().add_connection(1).unwrap();

    assert!(matches!(target.destroy_session(SESSION), Err(IscsiError::SessionBusy(SESSION))));
    assert!(target.session(SESSION).is_some());

    target.session_mut(SESSION).unwrap().remove_connection(1);
    target.destroy_session(SESSION).unwrap();
    assert!(target.session(SESSION).is_none());
    assert!(matches!(target.destroy_session(SESSION), Err(IscsiError::SessionNotFound(SESSION))));
}

#[test]
#[should_panic(expected = "in-flight commands")]
fn test_session_destroy_with_in_flight_commands_panics() {
    let (mut target, _reactor) = setup();
    target.store_mut().hold_completions(true);
    target.submit_command(SESSION, read10(1, 0, 1)).unwrap();
    let _ = target.destroy_session(SESSION);
}

#[test]
fn test_session_params_negotiation() {
    let (mut target, _reactor) = setup();
    let mut params = SessionParams::default();
    assert!(params.negotiate("MaxBurstLength", "65536"));
    assert!(params.negotiate("InitialR2T", "Yes"));
    assert!(!params.negotiate("X-com.example.Unknown", "1"));

    let session = target.create_session_with(0x2002, &params).unwrap();
    assert_eq!(session.params.max_burst_length, 65536);
    assert!(session.params.initial_r2t);

    let session = target
        .create_session_negotiated(0x2003, &[("MaxBurstLength", "4096"), ("FirstBurstLength", "65536")])
        .unwrap();
    assert_eq!(session.params.max_burst_length, 4096);
    assert!(session.params.first_burst_length <= 4096);
    assert_eq!(target.sessions().len(), 3);
}

#[test]
fn test_command_outside_cmd_sn_window_never_reaches_store() {
    let (mut target, mut reactor) = setup();

    let stale = read10(1, 0, 1).with_cmd_sn(0);
    assert!(matches!(
        target.submit_command(SESSION, stale),
        Err(IscsiError::CmdSnOutOfWindow { cmd_sn: 0, exp_cmd_sn: 1, .. })
    ));
    assert_eq!(target.store().calls().scheduled, 0);
    assert!(target.session(SESSION).unwrap().in_flight().is_empty());

    let expected = read10(2, 0, 1).with_cmd_sn(1);
    assert!(matches!(target.submit_command(SESSION, expected).unwrap(), Submission::Async));
    reactor.run_once(&mut target, WAIT).unwrap();
    assert_eq!(target.observer().statuses(), vec![(2, scsi_status::GOOD)]);
}

#[test]
fn test_lun_lifecycle() {
    let (mut target, mut reactor) = setup();
    let handle = target.logical_unit(0).unwrap().handle();

    assert!(matches!(target.remove_lun(0), Err(IscsiError::LunBusy(0))));
    target.detach_lun(0, &mut reactor).unwrap();
    assert!(!target.logical_unit(0).unwrap().is_attached());
    target.remove_lun(0).unwrap();
    assert!(!target.store().is_open(handle));

    let done = expect_immediate(target.submit_command(SESSION, read10(1, 0, 1)).unwrap());
    assert_eq!(done.sense.unwrap().asc, asc::LOGICAL_UNIT_NOT_SUPPORTED);
}

// ============================================================================
// Streaming Buffers
// ============================================================================

#[test]
fn test_input_stream_reassembles_any_partition() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let len = rng.gen_range(0..4096);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        let capacity = rng.gen_range(1..512);
        let mut input = InputStream::new(Cursor::new(data.clone()), capacity);

        let mut out = Vec::new();
        loop {
            let mut slice = vec![0u8; rng.gen_range(1..700)];
            let n = input.read_into(&mut slice);
            out.extend_from_slice(&slice[..n]);
            if n == 0 && input.is_closed() {
                break;
            }
        }
        assert_eq!(out, data);
        assert_eq!(input.last_error(), Some(io::ErrorKind::ConnectionReset));
    }
}

#[test]
fn test_output_stream_round_trip() {
    let mut rng = rand::thread_rng();
    for _ in 0..50 {
        let capacity = rng.gen_range(1..2048);
        let mut output = OutputStream::new(Vec::new(), capacity);
        let mut expected = Vec::new();

        loop {
            let remaining = capacity - expected.len();
            if remaining == 0 {
                break;
            }
            let chunk: Vec<u8> = (0..rng.gen_range(1..=remaining)).map(|_| rng.gen()).collect();
            assert_eq!(output.write(&chunk), chunk.len());
            expected.extend_from_slice(&chunk);
            if rng.gen_bool(0.3) {
                break;
            }
        }

        assert!(output.flush());
        assert!(!output.has_data());
        assert_eq!(output.get_ref(), &expected);
    }
}
