use std::{
    io,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use sluice_utils::unix_now;
use tracing::{error, info, warn};

use crate::{
    conn::{Connection, Protocol},
    error::EngineError,
    pipeline::Pipeline,
    poller::{create_poller, default_poller_name, EventHandler, PollerEvents, PollerRegistry},
    stage::Stage,
};

// Also bounds idle-eviction latency: the scan gate only runs when the poll
// call wakes.
const DEFAULT_TIMEOUT_SECS: u32 = 1;

/// Ingress stage: fans readiness events across one poller per worker
/// thread, feeds ready sockets into the parser stage, and evicts idle
/// connections.
pub struct PollInStage<P: Protocol> {
    pollers: Mutex<Vec<Arc<dyn PollerRegistry<P>>>>,
    poller_name: String,
    /// Poll wake interval and idle scan gate, seconds.
    timeout: u32,
    parser_stage: RwLock<Option<Arc<dyn Stage<P>>>>,
    recycle_stage: RwLock<Option<Arc<dyn Stage<P>>>>,
}

impl<P: Protocol> PollInStage<P> {
    pub fn new() -> Arc<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT_SECS)
    }

    pub fn with_timeout(timeout: u32) -> Arc<Self> {
        Arc::new(Self {
            pollers: Mutex::new(Vec::new()),
            poller_name: default_poller_name().to_string(),
            timeout,
            parser_stage: RwLock::new(None),
            recycle_stage: RwLock::new(None),
        })
    }

    /// Worker pollers currently running.
    pub fn poller_count(&self) -> usize {
        self.pollers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Connections registered across all pollers.
    pub fn registered_connections(&self) -> usize {
        let pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        pollers.iter().map(|p| p.len()).sum()
    }

    fn parser_stage(&self) -> Option<Arc<dyn Stage<P>>> {
        self.parser_stage.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn recycle_stage(&self) -> Option<Arc<dyn Stage<P>>> {
        self.recycle_stage.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Shuts the socket down, marks the connection dead, pulls it out of
    /// every poller, and hands it to the recycle stage. Idempotent; the
    /// descriptor itself stays open until recycling so its number cannot be
    /// reused while other stages still reference the connection.
    pub fn cleanup_connection(&self, conn: &Arc<Connection<P>>) {
        if !conn.set_inactive() {
            return;
        }
        conn.shutdown();
        self.sched_remove(conn);
        if let Some(recycle) = self.recycle_stage() {
            recycle.sched_add(conn);
        }
    }

    /// Re-reports readiness for a skipped wake so buffered input is not
    /// stranded behind a consumed edge.
    fn rearm(&self, conn: &Arc<Connection<P>>) {
        let pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        for poller in pollers.iter() {
            if matches!(poller.rearm(conn.fd()), Ok(true)) {
                return;
            }
        }
    }

    fn read_connection(&self, conn: &Arc<Connection<P>>) {
        // another stage owns the connection right now; re-arm so the data is
        // reported again once the lock frees up
        if !conn.try_lock() {
            self.rearm(conn);
            return;
        }
        if conn.is_inactive() {
            conn.unlock();
            return;
        }

        let outcome = {
            let mut streams = conn.streams();
            loop {
                match streams.input.read_into_buffer() {
                    Ok(0) => break ReadOutcome::Disconnected,
                    Ok(_) => conn.touch(),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        break ReadOutcome::WouldBlock;
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        warn!(fd = conn.fd(), %err, "read failed");
                        break ReadOutcome::Disconnected;
                    }
                }
            }
        };
        conn.unlock();

        match outcome {
            ReadOutcome::WouldBlock => {
                if let Some(parser) = self.parser_stage() {
                    parser.sched_add(conn);
                }
            }
            ReadOutcome::Disconnected => self.cleanup_connection(conn),
        }
    }
}

enum ReadOutcome {
    WouldBlock,
    Disconnected,
}

impl<P: Protocol> Stage<P> for PollInStage<P> {
    fn name(&self) -> &'static str {
        "poll_in"
    }

    fn initialize(&self, pipeline: &Arc<Pipeline<P>>) -> Result<(), EngineError> {
        let parser = pipeline
            .find_stage("parser")
            .ok_or_else(|| EngineError::MissingStage("parser".into()))?;
        let recycle = pipeline
            .find_stage("recycle")
            .ok_or_else(|| EngineError::MissingStage("recycle".into()))?;
        *self.parser_stage.write().unwrap_or_else(PoisonError::into_inner) = Some(parser);
        *self.recycle_stage.write().unwrap_or_else(PoisonError::into_inner) = Some(recycle);
        Ok(())
    }

    /// Registers the connection with the least-loaded poller.
    fn sched_add(&self, conn: &Arc<Connection<P>>) -> bool {
        let pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(poller) = pollers.iter().min_by_key(|p| p.len()) else {
            warn!("no pollers running, dropping registration");
            return false;
        };
        match poller.add(conn, PollerEvents::READ | PollerEvents::ERROR | PollerEvents::HUP) {
            Ok(()) => true,
            Err(err) => {
                warn!(fd = conn.fd(), %err, "poller registration failed");
                false
            }
        }
    }

    fn sched_remove(&self, conn: &Arc<Connection<P>>) {
        let pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
        for poller in pollers.iter() {
            match poller.remove(conn.fd()) {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    warn!(fd = conn.fd(), %err, "poller deregistration failed");
                    return;
                }
            }
        }
    }

    fn main_loop(&self, _pipeline: &Arc<Pipeline<P>>) {
        let mut poller = match create_poller::<P>(&self.poller_name) {
            Ok(poller) => poller,
            Err(err) => {
                error!(%err, "cannot create poller");
                return;
            }
        };
        let registry = poller.registry();
        {
            let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
            pollers.push(Arc::clone(&registry));
        }

        let mut driver = PollInDriver { stage: self, scanner: IdleScanner::new(self.timeout) };
        if let Err(err) = poller.run(&mut driver, Duration::from_secs(self.timeout.into())) {
            // fatal to this worker; remaining pollers keep serving
            error!(%err, "poller loop failed");
            let mut pollers = self.pollers.lock().unwrap_or_else(PoisonError::into_inner);
            pollers.retain(|p| !Arc::ptr_eq(p, &registry));
        }
    }
}

struct PollInDriver<'a, P: Protocol> {
    stage: &'a PollInStage<P>,
    scanner: IdleScanner,
}

impl<P: Protocol> EventHandler<P> for PollInDriver<'_, P> {
    fn on_event(&mut self, conn: &Arc<Connection<P>>, events: PollerEvents) {
        if events.intersects(PollerEvents::HUP | PollerEvents::ERROR) {
            self.stage.cleanup_connection(conn);
        } else if events.contains(PollerEvents::READ) {
            self.stage.read_connection(conn);
        }
    }

    fn on_post(&mut self, registry: &dyn PollerRegistry<P>) {
        self.scanner.scan(registry, self.stage);
    }
}

/// Sweeps one poller's connections for idle timeouts, one scanner per
/// poller worker. The guard mutex keeps reentrant sweeps from doubling up;
/// a busy guard means a sweep is already running, so skip.
struct IdleScanner {
    last_scan: Mutex<u32>,
    scan_timeout: u32,
}

impl IdleScanner {
    fn new(scan_timeout: u32) -> Self {
        Self { last_scan: Mutex::new(unix_now()), scan_timeout }
    }

    fn scan<P: Protocol>(&self, registry: &dyn PollerRegistry<P>, stage: &PollInStage<P>) {
        let Ok(mut last_scan) = self.last_scan.try_lock() else {
            return;
        };
        let now = unix_now();
        if now.wrapping_sub(*last_scan) < self.scan_timeout {
            return;
        }

        let mut expired = Vec::new();
        registry.for_each(&mut |conn| {
            if conn.is_expired(now) {
                expired.push(Arc::clone(conn));
            }
        });
        for conn in expired {
            info!(fd = conn.fd(), peer = %conn.peer(), "connection timed out");
            stage.cleanup_connection(&conn);
        }
        *last_scan = now;
    }
}
