use std::{
    io, mem,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use sluice_utils::{set_socket_blocking, set_socket_io_timeout};
use tracing::{info, warn};

use crate::{
    conn::Protocol,
    error::EngineError,
    pipeline::Pipeline,
};

/// Upper bound on how long a blocking send/recv may park a stage worker.
const SOCKET_IO_TIMEOUT: Duration = Duration::from_millis(500);

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn sockaddr_to(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in>() };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            let sin6 =
                unsafe { &*(storage as *const libc::sockaddr_storage).cast::<libc::sockaddr_in6>() };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Listening socket with an explicit backlog; built from raw calls so the
/// configured listen queue size actually reaches the kernel.
pub struct Listener {
    sock: OwnedFd,
}

impl Listener {
    /// Tries every resolved address until one binds, IPv4 and IPv6 alike.
    pub fn bind(host: &str, port: u16) -> Result<Self, EngineError> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| EngineError::Bind { addr: format!("{host}:{port}"), source })?
            .collect();

        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address resolved");
        for addr in addrs {
            match Self::bind_one(addr) {
                Ok(listener) => return Ok(listener),
                Err(err) => last_err = err,
            }
        }
        Err(EngineError::Bind { addr: format!("{host}:{port}"), source: last_err })
    }

    fn bind_one(addr: SocketAddr) -> io::Result<Self> {
        let family = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&one as *const libc::c_int).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe { libc::bind(fd, (&storage as *const libc::sockaddr_storage).cast::<libc::sockaddr>(), len) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { sock })
    }

    pub fn listen(&self, queue_size: i32) -> io::Result<()> {
        if unsafe { libc::listen(self.sock.as_raw_fd(), queue_size) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.sock.as_raw_fd(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        sockaddr_to(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
    }

    pub fn accept(&self) -> io::Result<(OwnedFd, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.sock.as_raw_fd(),
                (&mut storage as *mut libc::sockaddr_storage).cast::<libc::sockaddr>(),
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };
        let peer = sockaddr_to(&storage)
            .unwrap_or_else(|| SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)));
        Ok((sock, peer))
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

/// Accept loop: turns accepted sockets into pipeline-owned connections and
/// registers them with the ingress stage. Never processes a connection
/// itself.
pub struct Server<P: Protocol> {
    listener: Listener,
    pipeline: Arc<Pipeline<P>>,
    stop: Arc<AtomicBool>,
}

impl<P: Protocol> Server<P> {
    pub fn new(listener: Listener, pipeline: Arc<Pipeline<P>>) -> Self {
        // a peer resetting mid-write must not kill the process
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        Self { listener, pipeline, stop: Arc::new(AtomicBool::new(false)) }
    }

    pub fn listener(&self) -> &Listener {
        &self.listener
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<P>> {
        &self.pipeline
    }

    /// Flag checked between accepts; wire it to a signal handler for
    /// graceful shutdown.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn main_loop(&self) {
        let Some(poll_in) = self.pipeline.poll_in_stage() else {
            warn!("no ingress stage registered, refusing to accept");
            return;
        };
        info!("accepting connections");
        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop requested, leaving accept loop");
                return;
            }
            let (sock, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(%err, "accept failed");
                    continue;
                }
            };

            let conn = self.pipeline.create_connection(sock, peer);
            let fd = conn.fd();
            if let Err(err) = set_socket_blocking(fd, false) {
                warn!(fd, %err, "cannot make socket non-blocking");
            }
            if let Err(err) = set_socket_io_timeout(fd, SOCKET_IO_TIMEOUT) {
                warn!(fd, %err, "cannot set socket io timeout");
            }
            info!(fd, %peer, "accepted connection");

            if !crate::stage::Stage::sched_add(&*poll_in, &conn) {
                warn!(fd, "registration failed, disposing connection");
                let _exclusive = self.pipeline.quiesce().exclusive();
                self.pipeline.dispose_connection(&conn);
            }
        }
    }
}
