//! Single-threaded readiness reactor
//!
//! Owns the table of registered descriptors and their handlers plus a bounded
//! FIFO of deferred work. Each turn first runs the work that was queued when
//! the turn started, then waits for readiness and dispatches handlers. Work
//! queued during a turn runs on the next one.

use crate::error::{IscsiError, ScsiResult};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Maximum events fetched per wait
const EVENTS_CAPACITY: usize = 1024;

/// Readiness reported for a registered descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up on either direction
    pub closed: bool,
    pub error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Readiness {
            readable: event.is_readable(),
            writable: event.is_writable(),
            closed: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

/// Deferred unit of work
pub type Work<C> = Box<dyn FnOnce(&mut C, &mut Deferred<C>)>;

/// Handler invoked when a registered descriptor becomes ready
pub type EventHandler<C> = Box<dyn FnMut(&mut C, Readiness, &mut Deferred<C>)>;

/// Bounded FIFO of deferred work
pub struct Deferred<C> {
    queue: VecDeque<Work<C>>,
    capacity: usize,
}

impl<C> Deferred<C> {
    fn new(capacity: usize) -> Self {
        Deferred {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Queue work for a later turn
    pub fn schedule<F>(&mut self, work: F) -> ScsiResult<()>
    where
        F: FnOnce(&mut C, &mut Deferred<C>) + 'static,
    {
        if self.queue.len() >= self.capacity {
            return Err(IscsiError::SchedulerFull(self.capacity));
        }
        self.queue.push_back(Box::new(work));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Registration<C> {
    fd: RawFd,
    handler: EventHandler<C>,
}

/// Readiness event loop over a caller-owned context `C`
pub struct Reactor<C> {
    poll: Poll,
    events: Events,
    handlers: Slab<Registration<C>>,
    deferred: Deferred<C>,
}

impl<C> Reactor<C> {
    /// Create a reactor whose deferred FIFO holds at most `scheduled_capacity` entries
    pub fn new(scheduled_capacity: usize) -> io::Result<Self> {
        Ok(Reactor {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            handlers: Slab::new(),
            deferred: Deferred::new(scheduled_capacity),
        })
    }

    /// Watch `fd` and run `handler` whenever it becomes ready
    ///
    /// Readiness is edge-triggered: handlers must consume until would-block.
    pub fn register<F>(&mut self, fd: RawFd, interest: Interest, handler: F) -> io::Result<Token>
    where
        F: FnMut(&mut C, Readiness, &mut Deferred<C>) + 'static,
    {
        let entry = self.handlers.vacant_entry();
        let token = Token(entry.key());
        self.poll.registry().register(&mut SourceFd(&fd), token, interest)?;
        entry.insert(Registration {
            fd,
            handler: Box::new(handler),
        });
        log::debug!("Registered fd {} as {:?}", fd, token);
        Ok(token)
    }

    pub fn modify(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let reg = self.handlers.get(token.0).ok_or_else(|| not_registered(token))?;
        self.poll.registry().reregister(&mut SourceFd(&reg.fd), token, interest)
    }

    pub fn deregister(&mut self, token: Token) -> io::Result<()> {
        let reg = self.handlers.try_remove(token.0).ok_or_else(|| not_registered(token))?;
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&reg.fd)) {
            log::error!("fail to remove event for fd {}: {}", reg.fd, e);
            return Err(e);
        }
        Ok(())
    }

    pub fn is_registered(&self, token: Token) -> bool {
        self.handlers.contains(token.0)
    }

    pub fn registered(&self) -> usize {
        self.handlers.len()
    }

    /// Queue work for the next turn
    pub fn schedule<F>(&mut self, work: F) -> ScsiResult<()>
    where
        F: FnOnce(&mut C, &mut Deferred<C>) + 'static,
    {
        self.deferred.schedule(work)
    }

    pub fn scheduled(&self) -> usize {
        self.deferred.len()
    }

    /// Run the work queued before this call; true if more work is waiting
    fn run_scheduled(&mut self, ctx: &mut C) -> bool {
        let snapshot = self.deferred.len();
        for _ in 0..snapshot {
            match self.deferred.queue.pop_front() {
                Some(work) => work(ctx, &mut self.deferred),
                None => break,
            }
        }
        !self.deferred.is_empty()
    }

    /// One turn: deferred work, then a wait of at most `timeout`, then handlers
    ///
    /// The wait does not block when deferred work remains. Returns the number
    /// of handlers dispatched.
    pub fn run_once(&mut self, ctx: &mut C, timeout: Option<Duration>) -> io::Result<usize> {
        let work_remains = self.run_scheduled(ctx);
        let timeout = if work_remains { Some(Duration::ZERO) } else { timeout };

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }

        let mut dispatched = 0;
        for event in self.events.iter() {
            if let Some(reg) = self.handlers.get_mut(event.token().0) {
                (reg.handler)(ctx, Readiness::from(event), &mut self.deferred);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Run turns until `keep_running` returns false
    pub fn run<F>(&mut self, ctx: &mut C, tick: Option<Duration>, mut keep_running: F) -> io::Result<()>
    where
        F: FnMut(&C) -> bool,
    {
        while keep_running(ctx) {
            self.run_once(ctx, tick)?;
        }
        Ok(())
    }
}

fn not_registered(token: Token) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{:?} is not registered", token))
}
