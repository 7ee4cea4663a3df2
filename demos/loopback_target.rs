//! Loopback target example with in-memory storage
//!
//! Writes a pattern to an in-memory logical unit, reads it back and flushes
//! the cache, driving every completion through the reactor.

use std::time::Duration;
use tgt_core::{
    CommandCompletion, LunConfig, MemoryStore, Reactor, ScsiCommand, SenseData, Submission, Target,
};

const SESSION_ID: u64 = 0x1001;
const BLOCK_SIZE: u32 = 512;

/// Protocol layer stand-in that prints every finished command
#[derive(Default)]
struct Responder {
    outstanding: usize,
    read_back: Vec<u8>,
}

impl CommandCompletion for Responder {
    fn command_io_done(&mut self, command: ScsiCommand, status: u8, sense: Option<SenseData>) {
        self.outstanding = self.outstanding.saturating_sub(1);
        match sense {
            Some(sense) => println!(
                "task {} done: status {:#04x} sense {}",
                command.tag,
                status,
                hex::encode(sense.to_bytes())
            ),
            None => println!("task {} done: status {:#04x}", command.tag, status),
        }
        if !command.data_in.is_empty() {
            self.read_back = command.data_in;
        }
    }
}

type LoopbackTarget = Target<MemoryStore, Responder>;

fn submit(target: &mut LoopbackTarget, command: ScsiCommand) -> Result<(), Box<dyn std::error::Error>> {
    let tag = command.tag;
    match target.submit_command(SESSION_ID, command)? {
        Submission::Async => target.observer_mut().outstanding += 1,
        Submission::Immediate(done) => println!("task {} answered immediately: status {:#04x}", tag, done.status),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    let mut target = Target::builder()
        .target_name("iqn.2025-12.local:storage.memory-disk")
        .build(MemoryStore::new(), Responder::default())?;
    let mut reactor: Reactor<LoopbackTarget> = Reactor::new(256)?;

    target.add_lun(
        0,
        LunConfig {
            size_bytes: 16 * 1024 * 1024,
            block_size: BLOCK_SIZE,
            thin_provisioning: true,
            bs_options: "vmid=demo-vm:vmdkid=disk0".to_string(),
        },
    )?;
    target.attach_lun(0, &mut reactor)?;
    target.create_session(SESSION_ID)?;

    println!("Target {} serving LUN 0", target.name());

    // WRITE(10) of 8 blocks at LBA 8
    let pattern: Vec<u8> = (0..8 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
    let mut write = ScsiCommand::new(1, 0, &[0x2A, 0, 0, 0, 0, 8, 0, 0, 8, 0]).with_data_out(pattern.clone());
    write.parse_extent(BLOCK_SIZE);
    submit(&mut target, write)?;

    // SYNCHRONIZE CACHE(10) over the whole device
    submit(&mut target, ScsiCommand::new(2, 0, &[0x35, 0, 0, 0, 0, 0, 0, 0, 0, 0]))?;

    // Zero-length READ(10) short-circuits
    let mut empty = ScsiCommand::new(3, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
    empty.parse_extent(BLOCK_SIZE);
    submit(&mut target, empty)?;

    reactor.run(&mut target, Some(Duration::from_millis(100)), |t| t.observer().outstanding > 0)?;

    // READ(10) of the same extent
    let mut read = ScsiCommand::new(4, 0, &[0x28, 0, 0, 0, 0, 8, 0, 0, 8, 0]);
    read.parse_extent(BLOCK_SIZE);
    submit(&mut target, read)?;

    reactor.run(&mut target, Some(Duration::from_millis(100)), |t| t.observer().outstanding > 0)?;

    let matches = target.observer().read_back == pattern;
    println!("Read back {} bytes, pattern intact: {}", target.observer().read_back.len(), matches);

    if let Some(stats) = target.lun_stats(0) {
        println!(
            "LUN 0: submitted {} completed {} failed {} immediate {} mean latency {:?}",
            stats.submitted,
            stats.completed,
            stats.failed,
            stats.immediate,
            stats.mean_latency()
        );
    }

    target.detach_lun(0, &mut reactor)?;
    target.destroy_session(SESSION_ID)?;
    target.remove_lun(0)?;

    if !matches {
        return Err("read back data differs from what was written".into());
    }
    Ok(())
}
