// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Restricted-use event loop, one instance per subsystem thread.
//!
//! The maximum number of socket and timer events is fixed at creation so
//! all storage is preallocated. The only socket event type is
//! read-available, and sockets are never removed. Timer resolution is one
//! millisecond, timers are one-shot, and a timer's typed token is its sole
//! identity for deletion. Callers must never schedule two timers with the
//! same token simultaneously.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::logging::{Facility, Logger};
use crate::log_warning;

/// Dispatched event: either a readable socket slot or an expired timer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<T> {
    Readable(usize),
    Timer(T),
}

/// A single timer request made by a dispatch callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerOp<T> {
    Add { millis: u64, token: T },
    Del { token: T },
}

/// Timer operations requested by a dispatch callback, applied by the loop
/// after the callback returns. Within one callback, operations take effect
/// in the order they were requested.
pub struct TimerOps<T> {
    ops: Vec<TimerOp<T>>,
}

impl<T> TimerOps<T> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// Schedule a one-shot timer for monotonic-now plus `millis`
    pub fn add(&mut self, millis: u64, token: T) {
        self.ops.push(TimerOp::Add { millis, token });
    }

    /// Remove any pending timer with a matching token
    pub fn del(&mut self, token: T) {
        self.ops.push(TimerOp::Del { token });
    }

    /// Drain the requested operations, in request order
    pub fn take(&mut self) -> Vec<TimerOp<T>> {
        std::mem::take(&mut self.ops)
    }
}

impl<T> Default for TimerOps<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct TimerEntry<T> {
    deadline: Instant,
    token: T,
}

/// Single-threaded cooperative dispatcher over readable sockets and
/// deadline-ordered one-shot timers.
pub struct EventLoop<T> {
    // Socket slot for each pollfd, handed back on readiness
    slots: Vec<usize>,
    pollfds: Vec<libc::pollfd>,
    socket_limit: usize,
    // Ordered by deadline, soonest first
    timers: Vec<TimerEntry<T>>,
    timer_limit: usize,
    logger: Logger,
}

impl<T: PartialEq + Clone + std::fmt::Debug> EventLoop<T> {
    /// Create an event loop with fixed socket and timer capacities
    pub fn new(max_sockets: usize, max_timers: usize, logger: Logger) -> Self {
        Self {
            slots: Vec::with_capacity(max_sockets),
            pollfds: Vec::with_capacity(max_sockets),
            socket_limit: max_sockets,
            timers: Vec::with_capacity(max_timers),
            timer_limit: max_timers,
            logger,
        }
    }

    /// Register a read-ready socket. There is no removal.
    pub fn add_socket(&mut self, fd: RawFd, slot: usize) -> anyhow::Result<()> {
        if self.pollfds.len() >= self.socket_limit {
            anyhow::bail!("number of sockets ({}) exceeded", self.socket_limit);
        }
        self.slots.push(slot);
        self.pollfds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        Ok(())
    }

    fn add_timer(&mut self, millis: u64, token: T) {
        if self.timers.len() >= self.timer_limit {
            log_warning!(
                self.logger,
                Facility::Event,
                "add_timer: Number of timers ({}) exceeded",
                self.timer_limit
            );
            return;
        }

        let deadline = Instant::now() + Duration::from_millis(millis);

        // The number of timers is expected to be small, so a linear scan
        // for the insertion point is acceptable
        let index = self
            .timers
            .iter()
            .position(|t| deadline < t.deadline)
            .unwrap_or(self.timers.len());
        self.timers.insert(index, TimerEntry { deadline, token });
    }

    fn del_timer(&mut self, token: &T) {
        if let Some(index) = self.timers.iter().position(|t| t.token == *token) {
            self.timers.remove(index);
        }
    }

    /// Apply timer operations requested by a dispatch callback
    pub fn apply(&mut self, ops: &mut TimerOps<T>) {
        for op in ops.take() {
            match op {
                TimerOp::Add { millis, token } => self.add_timer(millis, token),
                TimerOp::Del { token } => self.del_timer(&token),
            }
        }
    }

    /// Pending timer count, for tests and diagnostics
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    // Sleep budget from the head timer: 1 ms floor, unbounded when empty
    fn poll_timeout(&self) -> libc::c_int {
        match self.timers.first() {
            Some(head) => {
                let now = Instant::now();
                if head.deadline <= now {
                    1
                } else {
                    let millis = head.deadline.duration_since(now).as_millis();
                    millis.clamp(1, libc::c_int::MAX as u128) as libc::c_int
                }
            }
            None => -1,
        }
    }

    /// One wait-and-dispatch iteration: wait for readiness or the head
    /// timer, dispatch one callback per ready socket, then drain every
    /// expired timer. Ingress dispatch precedes timer-expiry dispatch.
    pub fn poll_once<F>(&mut self, ops: &mut TimerOps<T>, dispatch: &mut F)
    where
        F: FnMut(Event<T>, &mut TimerOps<T>),
    {
        let timeout = self.poll_timeout();

        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log_warning!(self.logger, Facility::Event, "poll: {}", err);
            }
        }

        // Dispatch IO events
        if rc > 0 {
            for index in 0..self.pollfds.len() {
                if self.pollfds[index].revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP)
                    != 0
                {
                    self.pollfds[index].revents = 0;
                    let slot = self.slots[index];
                    dispatch(Event::Readable(slot), ops);
                    self.apply(ops);
                }
            }
        }

        // Dispatch expired timers
        let now = Instant::now();
        while self
            .timers
            .first()
            .is_some_and(|head| head.deadline <= now)
        {
            let entry = self.timers.remove(0);
            dispatch(Event::Timer(entry.token), ops);
            self.apply(ops);
        }
    }

    /// Run forever
    pub fn run<F>(mut self, mut dispatch: F) -> !
    where
        F: FnMut(Event<T>, &mut TimerOps<T>),
    {
        let mut ops = TimerOps::new();
        loop {
            self.poll_once(&mut ops, &mut dispatch);
        }
    }
}
