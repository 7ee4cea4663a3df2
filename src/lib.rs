//! I/O execution core of an iSCSI target
//!
//! This library turns SCSI commands received by an iSCSI protocol layer into
//! asynchronous backing store requests, tracks them per session and reports
//! their results back once the backing store signals completion. Everything
//! runs on a single-threaded reactor; nothing blocks on I/O.
//!
//! Users implement [`BackingStore`] for their storage service and
//! [`CommandCompletion`] for the protocol layer that builds SCSI responses.
//!
//! # Example
//!
//! ```no_run
//! use tgt_core::{
//!     CommandCompletion, LunConfig, MemoryStore, Reactor, ScsiCommand, SenseData, Submission,
//!     Target,
//! };
//!
//! struct Responder;
//!
//! impl CommandCompletion for Responder {
//!     fn command_io_done(&mut self, command: ScsiCommand, status: u8, _sense: Option<SenseData>) {
//!         println!("task {} finished with status {:#04x}", command.tag, status);
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut target = Target::builder()
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .build(MemoryStore::new(), Responder)?;
//! let mut reactor: Reactor<Target<MemoryStore, Responder>> = Reactor::new(256)?;
//!
//! target.add_lun(0, LunConfig {
//!     size_bytes: 64 * 1024 * 1024,
//!     block_size: 512,
//!     thin_provisioning: true,
//!     bs_options: "vmid=vm1:vmdkid=disk1".to_string(),
//! })?;
//! target.attach_lun(0, &mut reactor)?;
//! target.create_session(0x1001)?;
//!
//! let mut read = ScsiCommand::new(1, 0, &[0x28, 0, 0, 0, 0, 0, 0, 0, 8, 0]);
//! read.parse_extent(512);
//! if let Submission::Immediate(done) = target.submit_command(0x1001, read)? {
//!     println!("answered immediately: {:#04x}", done.status);
//! }
//! reactor.run_once(&mut target, None)?;
//! # Ok(())
//! # }
//! ```

pub mod backing;
pub mod completion;
pub mod dispatch;
pub mod error;
pub mod memory;
pub mod reactor;
pub mod scsi;
pub mod session;
pub mod signal;
pub mod stream;
pub mod target;

pub use backing::{BackingStore, BackingStoreOptions, CommandRef, DeviceHandle, RequestId, RequestResult};
pub use completion::{CommandCompletion, DrainReport};
pub use error::{IscsiError, ScsiResult};
pub use memory::MemoryStore;
pub use reactor::{Deferred, Reactor, Readiness};
pub use scsi::{classify, plan, IoIntent, ScsiCommand, SenseData};
pub use session::{Session, SessionParams, SessionRegistry};
pub use signal::CompletionSignal;
pub use stream::{InputStream, OutputStream};
pub use target::{IoStats, LunConfig, Submission, Target, TargetBuilder};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
