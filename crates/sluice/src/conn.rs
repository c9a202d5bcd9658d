use std::{
    net::SocketAddr,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use sluice_utils::unix_now;
use spin::Mutex as SpinMutex;

use crate::{
    lock::ConnLock,
    stream::{InputStream, OutputStream},
};

/// Per-connection protocol state plugged into the engine. Replaces a
/// virtual connection factory: the pipeline asks the protocol for one
/// session per accepted socket.
pub trait Protocol: Send + Sync + 'static {
    type Session: Send + 'static;

    fn new_session(&self) -> Self::Session;

    /// Default idle timeout applied to new connections, seconds. 0 disables
    /// eviction.
    fn idle_timeout(&self) -> u32 {
        0
    }
}

/// Socket-facing stream pair. Touched only while the connection's ownership
/// lock is held, which is why a spin mutex suffices.
pub struct Streams {
    pub input: InputStream,
    pub output: OutputStream,
}

/// One accepted socket travelling through the stage pipeline by reference.
/// Owned by the pipeline's registry; every other holder is transient.
pub struct Connection<P: Protocol> {
    id: u64,
    fd: RawFd,
    peer: SocketAddr,
    /// Reserved for priority scheduling.
    pub prio: i32,

    sock: SpinMutex<Option<OwnedFd>>,
    lock: ConnLock,
    streams: SpinMutex<Streams>,
    session: SpinMutex<P::Session>,

    last_active: AtomicU32,
    timeout: AtomicU32,
    inactive: AtomicBool,
    close_after_finish: AtomicBool,
}

impl<P: Protocol> Connection<P> {
    pub(crate) fn new(id: u64, sock: OwnedFd, peer: SocketAddr, session: P::Session) -> Self {
        let fd = sock.as_raw_fd();
        Self {
            id,
            fd,
            peer,
            prio: 0,
            sock: SpinMutex::new(Some(sock)),
            lock: ConnLock::new(),
            streams: SpinMutex::new(Streams {
                input: InputStream::new(fd),
                output: OutputStream::new(fd),
            }),
            session: SpinMutex::new(session),
            last_active: AtomicU32::new(unix_now()),
            timeout: AtomicU32::new(0),
            inactive: AtomicBool::new(false),
            close_after_finish: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn try_lock(&self) -> bool {
        self.lock.try_lock()
    }

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    pub fn streams(&self) -> spin::MutexGuard<'_, Streams> {
        self.streams.lock()
    }

    pub fn session(&self) -> spin::MutexGuard<'_, P::Session> {
        self.session.lock()
    }

    /// Stamps the idle clock.
    pub fn touch(&self) {
        self.last_active.store(unix_now(), Ordering::Relaxed);
    }

    pub fn set_timeout(&self, secs: u32) {
        self.timeout.store(secs, Ordering::Relaxed);
    }

    /// True when an idle timeout is configured and exceeded.
    pub fn is_expired(&self, now: u32) -> bool {
        let timeout = self.timeout.load(Ordering::Relaxed);
        if timeout == 0 {
            return false;
        }
        now.wrapping_sub(self.last_active.load(Ordering::Relaxed)) > timeout
    }

    /// Marks the connection dead. Returns whether this call made the
    /// transition, so cleanup stays idempotent.
    pub fn set_inactive(&self) -> bool {
        !self.inactive.swap(true, Ordering::AcqRel)
    }

    pub fn is_inactive(&self) -> bool {
        self.inactive.load(Ordering::Acquire)
    }

    pub fn set_close_after_finish(&self) {
        self.close_after_finish.store(true, Ordering::Relaxed);
    }

    pub fn close_after_finish(&self) -> bool {
        self.close_after_finish.load(Ordering::Relaxed)
    }

    /// Half-close both directions without giving the fd number back to the
    /// kernel; the recycle stage closes it once nothing references the
    /// connection.
    pub(crate) fn shutdown(&self) {
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }

    /// Releases the owned descriptor, closing the socket. Recycle-stage
    /// only.
    pub(crate) fn take_socket(&self) -> Option<OwnedFd> {
        self.sock.lock().take()
    }
}

impl<P: Protocol> std::fmt::Debug for Connection<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .field("inactive", &self.is_inactive())
            .finish()
    }
}
