use std::{
    collections::HashMap,
    net::SocketAddr,
    os::fd::OwnedFd,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use sluice_utils::set_socket_blocking;
use tracing::debug;

use crate::{
    conn::{Connection, Protocol},
    lock::QuiesceLock,
    stage::Stage,
    stages::PollInStage,
};

/// Process-wide registry of stages and owner of all live connections.
///
/// Every connection handed to a stage is a reference into this registry;
/// `dispose_connection` is the only place a connection dies, and it runs
/// under the exclusive side of the quiesce lock (recycle stage).
pub struct Pipeline<P: Protocol> {
    protocol: P,
    stages: RwLock<Vec<(String, Arc<dyn Stage<P>>)>>,
    conns: Mutex<HashMap<u64, Arc<Connection<P>>>>,
    quiesce: QuiesceLock,
    next_id: AtomicU64,
    poll_in: RwLock<Option<Arc<PollInStage<P>>>>,
}

impl<P: Protocol> Pipeline<P> {
    pub fn new(protocol: P) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            stages: RwLock::new(Vec::new()),
            conns: Mutex::new(HashMap::new()),
            quiesce: QuiesceLock::new(),
            next_id: AtomicU64::new(1),
            poll_in: RwLock::new(None),
        })
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn quiesce(&self) -> &QuiesceLock {
        &self.quiesce
    }

    pub fn add_stage(&self, name: &str, stage: Arc<dyn Stage<P>>) {
        let mut stages = self.stages.write().unwrap_or_else(PoisonError::into_inner);
        stages.push((name.to_string(), stage));
    }

    /// Registers the ingress stage; it is also reachable by name like any
    /// other stage, but poll enable/disable and active close need the typed
    /// handle.
    pub fn set_poll_in_stage(&self, stage: &Arc<PollInStage<P>>) {
        *self.poll_in.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(stage));
        self.add_stage(stage.name(), Arc::clone(stage) as Arc<dyn Stage<P>>);
    }

    pub fn poll_in_stage(&self) -> Option<Arc<PollInStage<P>>> {
        self.poll_in.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn find_stage(&self, name: &str) -> Option<Arc<dyn Stage<P>>> {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        stages.iter().find(|(n, _)| n == name).map(|(_, s)| Arc::clone(s))
    }

    pub fn connection_count(&self) -> usize {
        self.conns.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Builds a connection around an accepted socket and takes ownership of
    /// it.
    pub fn create_connection(&self, sock: OwnedFd, peer: SocketAddr) -> Arc<Connection<P>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, sock, peer, self.protocol.new_session()));
        conn.set_timeout(self.protocol.idle_timeout());
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&conn));
        conn
    }

    /// Tears a connection down: waits for whoever owns it, unhooks it from
    /// every stage, closes the socket, and drops it from the registry.
    /// Callers hold the exclusive quiesce lock (recycle stage).
    pub fn dispose_connection(&self, conn: &Arc<Connection<P>>) {
        debug!(id = conn.id(), fd = conn.fd(), "disposing connection");
        conn.lock();
        {
            let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
            for (_, stage) in stages.iter() {
                stage.sched_remove(conn);
            }
        }
        drop(conn.take_socket());
        conn.unlock();
        self.conns.lock().unwrap_or_else(PoisonError::into_inner).remove(&conn.id());
        debug!(id = conn.id(), "disposed");
    }

    /// Closes the connection from the server side, routed through the
    /// ingress stage's cleanup path so recycling stays single-tracked.
    pub fn active_close(&self, conn: &Arc<Connection<P>>) {
        if let Some(poll_in) = self.poll_in_stage() {
            poll_in.cleanup_connection(conn);
        }
    }

    /// Takes the connection out of the readiness set for a blocking
    /// operation on its socket.
    pub fn disable_poll(&self, conn: &Arc<Connection<P>>) {
        if let Some(poll_in) = self.poll_in_stage() {
            poll_in.sched_remove(conn);
        }
        let _ = set_socket_blocking(conn.fd(), true);
    }

    /// Re-arms readiness after `disable_poll`. Dead connections stay out.
    pub fn enable_poll(&self, conn: &Arc<Connection<P>>) {
        let _ = set_socket_blocking(conn.fd(), false);
        if !conn.is_inactive() {
            if let Some(poll_in) = self.poll_in_stage() {
                poll_in.sched_add(conn);
            }
        }
    }

    /// Kicks every stage's scheduler so workers waiting for a lockable
    /// connection rescan after an unlock.
    pub fn reschedule_all(&self) {
        let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
        for (_, stage) in stages.iter() {
            stage.reschedule();
        }
    }

    pub fn initialize_stages(self: &Arc<Self>) -> Result<(), crate::error::EngineError> {
        let stages: Vec<_> = {
            let stages = self.stages.read().unwrap_or_else(PoisonError::into_inner);
            stages.iter().map(|(_, s)| Arc::clone(s)).collect()
        };
        for stage in stages {
            stage.initialize(self)?;
        }
        Ok(())
    }
}
