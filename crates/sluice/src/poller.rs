use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bitflags::bitflags;
use mio::{unix::SourceFd, Interest, Token};
use once_cell::sync::Lazy;
use sluice_utils::FdMap;

use crate::{
    conn::{Connection, Protocol},
    error::EngineError,
};

bitflags! {
    /// Readiness mask delivered to the event handler.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollerEvents: u8 {
        const READ  = 1;
        const WRITE = 2;
        const ERROR = 4;
        const HUP   = 8;
    }
}

/// Dispatch interface a poller drives: per-event delivery plus hooks before
/// and after each wake (the post hook carries idle scanning).
pub trait EventHandler<P: Protocol> {
    fn on_event(&mut self, conn: &Arc<Connection<P>>, events: PollerEvents);

    fn on_pre(&mut self, _registry: &dyn PollerRegistry<P>) {}

    fn on_post(&mut self, _registry: &dyn PollerRegistry<P>) {}
}

/// Thread-safe registration view of one poller. Separate from the run loop
/// so the accept thread can add descriptors while a worker is blocked in
/// the kernel.
pub trait PollerRegistry<P: Protocol>: Send + Sync {
    /// Registers the connection's descriptor. If the platform call fails the
    /// registry entry is rolled back.
    fn add(&self, conn: &Arc<Connection<P>>, events: PollerEvents) -> io::Result<()>;

    /// Deregisters; returns false if the descriptor was not registered here.
    fn remove(&self, fd: RawFd) -> io::Result<bool>;

    /// Forces the next poll to re-report current readiness. Needed when an
    /// event is skipped (lock contention): the readiness edge is consumed,
    /// so without a re-arm a quiet peer would never be read again.
    fn rearm(&self, fd: RawFd) -> io::Result<bool>;

    fn get(&self, fd: RawFd) -> Option<Arc<Connection<P>>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn for_each(&self, f: &mut dyn FnMut(&Arc<Connection<P>>));
}

/// One platform readiness multiplexer, driven by a single worker thread.
pub trait Poller<P: Protocol>: Send {
    fn registry(&self) -> Arc<dyn PollerRegistry<P>>;

    /// Loops until a fatal poll error. Transient interruptions are retried.
    fn run(&mut self, handler: &mut dyn EventHandler<P>, timeout: Duration) -> io::Result<()>;
}

struct MioRegistry<P: Protocol> {
    registry: mio::Registry,
    fds: Mutex<FdMap<Arc<Connection<P>>>>,
}

impl<P: Protocol> PollerRegistry<P> for MioRegistry<P> {
    fn add(&self, conn: &Arc<Connection<P>>, events: PollerEvents) -> io::Result<()> {
        let fd = conn.fd();
        {
            let mut fds = self.fds.lock().unwrap_or_else(PoisonError::into_inner);
            if !fds.insert(fd, Arc::clone(conn)) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "descriptor already registered",
                ));
            }
        }
        // ERROR and HUP are delivered unconditionally by every platform
        // mechanism; only READ/WRITE translate to an interest.
        let interest = if events.contains(PollerEvents::WRITE) {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if let Err(err) = self.registry.register(&mut SourceFd(&fd), Token(fd as usize), interest) {
            self.fds.lock().unwrap_or_else(PoisonError::into_inner).remove(fd);
            return Err(err);
        }
        Ok(())
    }

    fn remove(&self, fd: RawFd) -> io::Result<bool> {
        let conn = {
            let mut fds = self.fds.lock().unwrap_or_else(PoisonError::into_inner);
            match fds.remove(fd) {
                Some(conn) => conn,
                None => return Ok(false),
            }
        };
        if let Err(err) = self.registry.deregister(&mut SourceFd(&fd)) {
            self.fds.lock().unwrap_or_else(PoisonError::into_inner).insert(fd, conn);
            return Err(err);
        }
        Ok(true)
    }

    fn rearm(&self, fd: RawFd) -> io::Result<bool> {
        if !self.fds.lock().unwrap_or_else(PoisonError::into_inner).contains(fd) {
            return Ok(false);
        }
        self.registry.reregister(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)?;
        Ok(true)
    }

    fn get(&self, fd: RawFd) -> Option<Arc<Connection<P>>> {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner).get(fd).cloned()
    }

    fn len(&self) -> usize {
        self.fds.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&Arc<Connection<P>>)) {
        let fds = self.fds.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, conn) in fds.iter() {
            f(conn);
        }
    }
}

/// Readiness multiplexer over `mio::Poll`, which binds epoll on Linux and
/// kqueue on the BSDs.
pub struct MioPoller<P: Protocol> {
    poll: mio::Poll,
    events: mio::Events,
    shared: Arc<MioRegistry<P>>,
}

impl<P: Protocol> MioPoller<P> {
    pub fn new() -> io::Result<Self> {
        let poll = mio::Poll::new()?;
        let shared =
            Arc::new(MioRegistry { registry: poll.registry().try_clone()?, fds: Mutex::new(FdMap::new()) });
        Ok(Self { poll, events: mio::Events::with_capacity(1024), shared })
    }
}

impl<P: Protocol> Poller<P> for MioPoller<P> {
    fn registry(&self) -> Arc<dyn PollerRegistry<P>> {
        Arc::clone(&self.shared) as Arc<dyn PollerRegistry<P>>
    }

    fn run(&mut self, handler: &mut dyn EventHandler<P>, timeout: Duration) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
            handler.on_pre(&*self.shared);
            for ev in self.events.iter() {
                let fd = ev.token().0 as RawFd;
                // a racing removal may have beaten the event delivery
                let Some(conn) = self.shared.get(fd) else { continue };

                let mut events = PollerEvents::empty();
                if ev.is_readable() {
                    events |= PollerEvents::READ;
                }
                if ev.is_writable() {
                    events |= PollerEvents::WRITE;
                }
                if ev.is_error() {
                    events |= PollerEvents::ERROR;
                }
                if ev.is_read_closed() && ev.is_write_closed() {
                    events |= PollerEvents::HUP;
                }
                handler.on_event(&conn, events);
            }
            handler.on_post(&*self.shared);
        }
    }
}

#[derive(Clone, Copy)]
enum Backend {
    Mio,
}

static BACKENDS: Lazy<Mutex<HashMap<&'static str, Backend>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    // Both names resolve to the mio backend, which selects the matching
    // kernel mechanism per platform.
    map.insert("epoll", Backend::Mio);
    map.insert("kqueue", Backend::Mio);
    Mutex::new(map)
});

pub fn default_poller_name() -> &'static str {
    if cfg!(any(target_os = "macos", target_os = "freebsd", target_os = "netbsd")) {
        "kqueue"
    } else {
        "epoll"
    }
}

pub fn create_poller<P: Protocol>(name: &str) -> Result<Box<dyn Poller<P>>, EngineError> {
    let backend = BACKENDS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .copied()
        .ok_or_else(|| EngineError::UnknownPoller(name.to_string()))?;
    match backend {
        Backend::Mio => Ok(Box::new(MioPoller::new()?)),
    }
}
