use std::{io, sync::Arc, thread::JoinHandle};

use sluice_utils::{spawn_worker, ThreadPriority};
use tracing::info;

use crate::{
    conn::{Connection, Protocol},
    error::EngineError,
    pipeline::Pipeline,
    sched::Scheduler,
};

/// A named unit of the pipeline: one scheduler plus one or more worker
/// threads running `main_loop`.
///
/// The default worker loop picks a connection, processes it, and releases
/// the connection lock unless the stage returned a negative code — the
/// signal that the stage re-queued the connection itself and the lock must
/// travel with it.
pub trait Stage<P: Protocol>: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&self, _pipeline: &Arc<Pipeline<P>>) -> Result<(), EngineError> {
        Ok(())
    }

    fn scheduler(&self) -> Option<&dyn Scheduler<P>> {
        None
    }

    fn sched_add(&self, conn: &Arc<Connection<P>>) -> bool {
        if let Some(sched) = self.scheduler() {
            sched.add_task(conn);
        }
        true
    }

    fn sched_remove(&self, conn: &Arc<Connection<P>>) {
        if let Some(sched) = self.scheduler() {
            sched.remove_task(conn);
        }
    }

    fn reschedule(&self) {
        if let Some(sched) = self.scheduler() {
            sched.reschedule();
        }
    }

    fn process_task(&self, _pipeline: &Arc<Pipeline<P>>, _conn: &Arc<Connection<P>>) -> i32 {
        0
    }

    fn main_loop(&self, pipeline: &Arc<Pipeline<P>>) {
        let Some(sched) = self.scheduler() else { return };
        loop {
            let conn = sched.pick_task(pipeline.quiesce());
            let rc = self.process_task(pipeline, &conn);
            if rc >= 0 {
                conn.unlock();
                pipeline.reschedule_all();
            }
        }
    }
}

/// Spawns one named worker thread driving the stage's main loop.
pub fn start_stage_thread<P: Protocol>(
    stage: &Arc<dyn Stage<P>>,
    pipeline: &Arc<Pipeline<P>>,
    worker_idx: usize,
) -> io::Result<JoinHandle<()>> {
    let stage = Arc::clone(stage);
    let pipeline = Arc::clone(pipeline);
    spawn_worker(
        format!("{}-{worker_idx}", stage.name()),
        None,
        ThreadPriority::OSDefault,
        move || {
            info!(stage = stage.name(), worker_idx, "stage worker running");
            stage.main_loop(&pipeline);
        },
    )
}
