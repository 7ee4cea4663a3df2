//! iSCSI target I/O core
//!
//! A [`Target`] owns the session registry, its logical units, the backing
//! store and the protocol-layer completion callback. Commands enter through
//! [`Target::submit_command`]; completions come back when a logical unit's
//! signal turns readable and the reactor runs [`Target::handle_completion`].

use crate::backing::{BackingStore, BackingStoreOptions, DeviceHandle, RequestResult};
use crate::completion::{self, CommandCompletion, DrainReport};
use crate::dispatch::{self, Outcome};
use crate::error::{IscsiError, ScsiResult};
use crate::reactor::Reactor;
use crate::scsi::{scsi_status, Geometry, ScsiCommand, SenseData};
use crate::session::{CmdSnWindow, Session, SessionParams, SessionRegistry};
use crate::signal::CompletionSignal;
use mio::{Interest, Token};
use std::collections::HashMap;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_TARGET_NAME: &str = "iqn.2025-12.local:storage.default";
const DEFAULT_QUEUED_COMMANDS: u32 = 128;
const DEFAULT_COMPLETION_BATCH: usize = 32;
const MIN_BLOCK_SIZE: u32 = 512;

/// Per logical unit I/O counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStats {
    /// Requests accepted by the backing store
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Requests the backing store refused at schedule time
    pub submit_errors: u64,
    /// Commands answered GOOD without a backing store round trip
    pub immediate: u64,
    /// Commands answered CHECK CONDITION before dispatch
    pub rejected: u64,
    pub stale: u64,
    pub aborted: u64,
    /// Submission to completion time summed over completed and failed requests
    pub total_latency: Duration,
}

impl IoStats {
    pub fn mean_latency(&self) -> Option<Duration> {
        let finished = self.completed + self.failed;
        if finished == 0 {
            return None;
        }
        let nanos = self.total_latency.as_nanos() / finished as u128;
        Some(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
    }
}

/// Configuration of one logical unit
#[derive(Debug, Clone)]
pub struct LunConfig {
    pub size_bytes: u64,
    pub block_size: u32,
    pub thin_provisioning: bool,
    /// Backing store options, `vmid=<id>:vmdkid=<id>`
    pub bs_options: String,
}

/// An opened logical unit
pub struct LogicalUnit {
    pub lun: u64,
    pub geometry: Geometry,
    pub options: BackingStoreOptions,
    handle: DeviceHandle,
    signal: Arc<CompletionSignal>,
    scratch: Vec<RequestResult>,
    token: Option<Token>,
    stats: IoStats,
}

impl LogicalUnit {
    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    /// Whether the completion signal is registered with a reactor
    pub fn is_attached(&self) -> bool {
        self.token.is_some()
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }
}

/// What [`Target::submit_command`] did with a command
#[derive(Debug)]
pub enum Submission {
    /// In flight; the result arrives through `command_io_done`
    Async,
    /// Finished without a completion round trip; status and sense are set
    Immediate(ScsiCommand),
}

/// iSCSI target I/O core
pub struct Target<B, O> {
    tid: u32,
    name: String,
    params: SessionParams,
    sessions: SessionRegistry,
    luns: HashMap<u64, LogicalUnit>,
    store: B,
    observer: O,
    completion_batch: usize,
}

impl Target<(), ()> {
    /// Create a new builder for configuring a target
    pub fn builder() -> TargetBuilder {
        TargetBuilder::new()
    }
}

impl<B: BackingStore, O: CommandCompletion> Target<B, O> {
    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &SessionParams {
        &self.params
    }

    /// Create a session with the target's default parameters
    pub fn create_session(&mut self, sid: u64) -> ScsiResult<&mut Session> {
        self.sessions.create(sid, &self.params)
    }

    pub fn create_session_with(&mut self, sid: u64, params: &SessionParams) -> ScsiResult<&mut Session> {
        self.sessions.create(sid, params)
    }

    /// Create a session whose parameters are the target defaults folded
    /// with the initiator's login offers
    pub fn create_session_negotiated(&mut self, sid: u64, offers: &[(&str, &str)]) -> ScsiResult<&mut Session> {
        let mut params = self.params.clone();
        let ignored = offers
            .iter()
            .filter(|(key, value)| !params.negotiate(key, value))
            .count();
        if ignored > 0 {
            log::debug!("Session {:#x}: {} login keys left at target defaults", sid, ignored);
        }
        self.sessions.create(sid, &params)
    }

    pub fn session(&self, sid: u64) -> Option<&Session> {
        self.sessions.lookup(sid)
    }

    pub fn session_mut(&mut self, sid: u64) -> Option<&mut Session> {
        self.sessions.lookup_mut(sid)
    }

    /// Destroy a session; see [`SessionRegistry::destroy`]
    pub fn destroy_session(&mut self, sid: u64) -> ScsiResult<()> {
        self.sessions.destroy(sid)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Open a logical unit on the backing store
    pub fn add_lun(&mut self, lun: u64, config: LunConfig) -> ScsiResult<()> {
        if self.luns.contains_key(&lun) {
            return Err(IscsiError::LunExists(lun));
        }
        if !config.block_size.is_power_of_two() || config.block_size < MIN_BLOCK_SIZE {
            return Err(IscsiError::Config(format!(
                "block size {} must be a power of two of at least {}",
                config.block_size, MIN_BLOCK_SIZE
            )));
        }
        if config.size_bytes == 0 || config.size_bytes % config.block_size as u64 != 0 {
            return Err(IscsiError::Config(format!(
                "device size {} is not a non-zero multiple of the block size {}",
                config.size_bytes, config.block_size
            )));
        }

        let options = BackingStoreOptions::parse(&config.bs_options)?;
        let signal = Arc::new(CompletionSignal::new()?);
        let block_shift = config.block_size.trailing_zeros();
        let handle = self
            .store
            .open(&options, config.size_bytes, block_shift, Arc::clone(&signal))?;

        log::info!(
            "Opened LUN {} ({}) size {} block size {} thin {}",
            lun,
            options,
            config.size_bytes,
            config.block_size,
            config.thin_provisioning
        );

        self.luns.insert(
            lun,
            LogicalUnit {
                lun,
                geometry: Geometry {
                    size_bytes: config.size_bytes,
                    block_shift,
                    thin_provisioning: config.thin_provisioning,
                },
                options,
                handle,
                signal,
                scratch: vec![RequestResult::default(); self.completion_batch],
                token: None,
                stats: IoStats::default(),
            },
        );
        Ok(())
    }

    /// Close a logical unit
    ///
    /// Fails with [`IscsiError::LunBusy`] while the unit is attached to a
    /// reactor or any session still has commands in flight on it.
    pub fn remove_lun(&mut self, lun: u64) -> ScsiResult<()> {
        let unit = self.luns.get(&lun).ok_or(IscsiError::LunNotFound(lun))?;
        if unit.is_attached() {
            log::error!("LUN {} is still registered for completions", lun);
            return Err(IscsiError::LunBusy(lun));
        }
        let in_flight: usize = self
            .sessions
            .iter()
            .map(|session| session.tags_for_lun(lun).len())
            .sum();
        if in_flight > 0 {
            log::error!("LUN {} still has {} commands in flight", lun, in_flight);
            return Err(IscsiError::LunBusy(lun));
        }

        if let Some(unit) = self.luns.remove(&lun) {
            self.store.close(unit.handle);
            log::info!("Closed LUN {} ({})", lun, unit.options);
        }
        Ok(())
    }

    pub fn logical_unit(&self, lun: u64) -> Option<&LogicalUnit> {
        self.luns.get(&lun)
    }

    pub fn lun_stats(&self, lun: u64) -> Option<&IoStats> {
        self.luns.get(&lun).map(|unit| &unit.stats)
    }

    pub fn store(&self) -> &B {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut B {
        &mut self.store
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    /// Submit a command on behalf of session `sid`
    ///
    /// A command carrying a CmdSN outside the session's window is dropped
    /// with [`IscsiError::CmdSnOutOfWindow`].
    ///
    /// Returns [`Submission::Async`] once the command is in flight. When the
    /// backing store refuses the request the command is reported through
    /// `command_io_done` with CHECK CONDITION / MEDIUM ERROR and the error is
    /// returned; the command is never registered.
    pub fn submit_command(&mut self, sid: u64, mut command: ScsiCommand) -> ScsiResult<Submission> {
        let session = self
            .sessions
            .lookup_mut(sid)
            .ok_or(IscsiError::SessionNotFound(sid))?;

        if let Some(cmd_sn) = command.cmd_sn {
            if session.check_cmd_sn(cmd_sn) == CmdSnWindow::Outside {
                log::warn!(
                    "Dropping task {} of session {:#x}: CmdSN {} outside [{}, {}]",
                    command.tag,
                    sid,
                    cmd_sn,
                    session.exp_cmd_sn,
                    session.max_cmd_sn
                );
                return Err(IscsiError::CmdSnOutOfWindow {
                    sid,
                    cmd_sn,
                    exp_cmd_sn: session.exp_cmd_sn,
                    max_cmd_sn: session.max_cmd_sn,
                });
            }
        }

        let unit = match self.luns.get_mut(&command.lun) {
            Some(unit) => unit,
            None => {
                log::debug!("Task {} addresses unknown LUN {}", command.tag, command.lun);
                command.set_result(scsi_status::CHECK_CONDITION, Some(SenseData::lun_not_supported()));
                return Ok(Submission::Immediate(command));
            }
        };

        match dispatch::submit(&mut self.store, unit.handle, &unit.geometry, session, command)? {
            Outcome::Async => {
                unit.stats.submitted += 1;
                Ok(Submission::Async)
            }
            Outcome::Immediate(command) => {
                if command.status == scsi_status::GOOD {
                    unit.stats.immediate += 1;
                } else {
                    unit.stats.rejected += 1;
                }
                Ok(Submission::Immediate(command))
            }
            Outcome::Aborted { command, victims } => {
                unit.stats.aborted += victims.len() as u64;
                for victim in victims {
                    let status = victim.status;
                    self.observer.command_io_done(victim, status, None);
                }
                Ok(Submission::Immediate(command))
            }
            Outcome::Failed { command, error } => {
                unit.stats.submit_errors += 1;
                let sense = command.sense.clone();
                self.observer
                    .command_io_done(command, scsi_status::CHECK_CONDITION, sense);
                Err(error)
            }
        }
    }

    /// Drain and resolve every available completion of a logical unit
    pub fn handle_completion(&mut self, lun: u64) -> ScsiResult<DrainReport> {
        let unit = self.luns.get_mut(&lun).ok_or(IscsiError::LunNotFound(lun))?;
        let sessions = &mut self.sessions;
        let observer = &mut self.observer;
        let LogicalUnit {
            handle,
            signal,
            scratch,
            stats,
            options,
            ..
        } = unit;

        let report = completion::drain(&mut self.store, *handle, signal, scratch, |result| {
            completion::resolve(sessions, &mut *observer, stats, options, result)
        })?;

        log::debug!(
            "LUN {} drained: {} fetches, {} completed, {} failed, {} stale",
            lun,
            report.fetches,
            report.completed,
            report.failed,
            report.stale
        );
        Ok(report)
    }
}

impl<B, O> Target<B, O>
where
    B: BackingStore + 'static,
    O: CommandCompletion + 'static,
{
    /// Register a logical unit's completion signal with `reactor`
    pub fn attach_lun(&mut self, lun: u64, reactor: &mut Reactor<Self>) -> ScsiResult<Token> {
        let unit = self.luns.get_mut(&lun).ok_or(IscsiError::LunNotFound(lun))?;
        if unit.is_attached() {
            return Err(IscsiError::LunBusy(lun));
        }

        let token = reactor.register(unit.signal.as_raw_fd(), Interest::READABLE, move |target: &mut Self, _, _| {
            if let Err(e) = target.handle_completion(lun) {
                log::error!("Completion handling failed on LUN {}: {}", lun, e);
            }
        })?;
        unit.token = Some(token);
        Ok(token)
    }

    /// Stop watching a logical unit's completion signal
    pub fn detach_lun(&mut self, lun: u64, reactor: &mut Reactor<Self>) -> ScsiResult<()> {
        let unit = self.luns.get_mut(&lun).ok_or(IscsiError::LunNotFound(lun))?;
        if let Some(token) = unit.token.take() {
            reactor.deregister(token)?;
        }
        Ok(())
    }
}

/// Builder for configuring a [`Target`]
#[derive(Debug, Clone, Default)]
pub struct TargetBuilder {
    tid: Option<u32>,
    target_name: Option<String>,
    params: Option<SessionParams>,
    queued_commands: Option<u32>,
    completion_batch: Option<usize>,
}

impl TargetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target id (default: 1)
    pub fn tid(mut self, tid: u32) -> Self {
        self.tid = Some(tid);
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    /// Parameters copied into every session created with [`Target::create_session`]
    pub fn session_params(mut self, params: SessionParams) -> Self {
        self.params = Some(params);
        self
    }

    /// Queue depth advertised per session (default: 128)
    pub fn queued_commands(mut self, depth: u32) -> Self {
        self.queued_commands = Some(depth);
        self
    }

    /// Results fetched per backing store call while draining (default: 32)
    pub fn completion_batch(mut self, batch: usize) -> Self {
        self.completion_batch = Some(batch);
        self
    }

    /// Build the target around a backing store and a completion callback
    pub fn build<B: BackingStore, O: CommandCompletion>(self, store: B, observer: O) -> ScsiResult<Target<B, O>> {
        let tid = self.tid.unwrap_or(1);
        let name = self
            .target_name
            .unwrap_or_else(|| DEFAULT_TARGET_NAME.to_string());

        // Validate IQN format (basic check)
        if !name.starts_with("iqn.") {
            return Err(IscsiError::Config(
                "target_name must be in IQN format (e.g., iqn.2025-12.local:storage.disk1)".to_string(),
            ));
        }

        let completion_batch = self.completion_batch.unwrap_or(DEFAULT_COMPLETION_BATCH);
        if completion_batch == 0 {
            return Err(IscsiError::Config("completion_batch must be at least 1".to_string()));
        }
        let queued_commands = self.queued_commands.unwrap_or(DEFAULT_QUEUED_COMMANDS);

        log::info!("Target {} ({}) ready", tid, name);

        Ok(Target {
            tid,
            name,
            params: self.params.unwrap_or_default(),
            sessions: SessionRegistry::new(tid, queued_commands),
            luns: HashMap::new(),
            store,
            observer,
            completion_batch,
        })
    }
}
