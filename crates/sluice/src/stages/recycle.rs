use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, PoisonError},
};

use tracing::debug;

use crate::{
    conn::{Connection, Protocol},
    pipeline::Pipeline,
    stage::Stage,
};

/// Destroys dead connections in batches.
///
/// Waits until a full batch accumulates, then takes the pipeline's exclusive
/// quiesce lock so no scheduler can hand out a connection mid-destruction.
/// Sockets are closed here, not at cleanup time: the descriptor number must
/// not be reused while other stages may still hold the connection.
pub struct RecycleStage<P: Protocol> {
    queue: Mutex<VecDeque<Arc<Connection<P>>>>,
    cond: Condvar,
    batch_size: usize,
}

impl<P: Protocol> RecycleStage<P> {
    pub fn new(batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            batch_size: batch_size.max(1),
        })
    }
}

impl<P: Protocol> Stage<P> for RecycleStage<P> {
    fn name(&self) -> &'static str {
        "recycle"
    }

    fn sched_add(&self, conn: &Arc<Connection<P>>) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.push_back(Arc::clone(conn));
        if queue.len() >= self.batch_size {
            drop(queue);
            self.cond.notify_one();
        }
        true
    }

    fn sched_remove(&self, _conn: &Arc<Connection<P>>) {}

    fn main_loop(&self, pipeline: &Arc<Pipeline<P>>) {
        loop {
            let batch: Vec<_> = {
                let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
                while queue.len() < self.batch_size {
                    queue = self.cond.wait(queue).unwrap_or_else(PoisonError::into_inner);
                }
                queue.drain(..self.batch_size).collect()
            };

            let _exclusive = pipeline.quiesce().exclusive();
            for conn in &batch {
                pipeline.dispose_connection(conn);
            }
            debug!(count = batch.len(), "recycled connection batch");
        }
    }
}
