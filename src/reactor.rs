// src/reactor.rs
use std::{
    collections::HashMap,
    io,
    os::unix::io::RawFd,
    time::Duration,
};

use mio::{unix::SourceFd, Events, Interest, Poll, Token};

/// One ready descriptor as reported by a wait.
#[derive(Debug, Clone, Copy)]
pub struct Ready {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// Readiness backend over `mio::Poll`. Tokens are the descriptors
/// themselves. The epoll backend is edge-triggered; callers re-register a
/// descriptor that fired but stays watched to recover select-style
/// level-triggered reporting.
pub struct Reactor {
    poll: Poll,
    events: Events,
    registered: HashMap<RawFd, (bool, bool)>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            registered: HashMap::new(),
        })
    }

    /// Bring the registration of `fd` in line with the wanted interest,
    /// registering, re-registering or deregistering as needed.
    pub fn update(&mut self, fd: RawFd, read: bool, write: bool) -> io::Result<()> {
        let current = self.registered.get(&fd).copied();
        match (current, interest_of(read, write)) {
            (None, None) => Ok(()),
            (Some(_), None) => {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                self.registered.remove(&fd);
                Ok(())
            }
            (None, Some(interest)) => {
                self.poll.registry().register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.registered.insert(fd, (read, write));
                Ok(())
            }
            (Some(_), Some(interest)) => {
                // Re-registering also re-arms the edge trigger, so current
                // readiness is reported again.
                self.poll.registry().reregister(&mut SourceFd(&fd), Token(fd as usize), interest)?;
                self.registered.insert(fd, (read, write));
                Ok(())
            }
        }
    }

    /// Wait for readiness on every registered descriptor. `None` blocks
    /// indefinitely. Never reports a descriptor that is not ready.
    pub fn select(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Ready>> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(self
            .events
            .iter()
            .map(|ev| Ready {
                fd: ev.token().0 as RawFd,
                readable: ev.is_readable(),
                writable: ev.is_writable(),
            })
            .collect())
    }
}

fn interest_of(read: bool, write: bool) -> Option<Interest> {
    match (read, write) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}
