use std::{io, sync::Arc};

use sluice_utils::set_socket_blocking;
use tracing::debug;

use crate::{
    conn::{Connection, Protocol},
    pipeline::Pipeline,
    sched::{QueueScheduler, Scheduler},
    stage::Stage,
};

/// Drains each connection's output stream under backpressure.
///
/// Runs its scheduler in suppressed-lock mode: connections arrive here with
/// their ownership lock already held by whoever queued them (the response
/// finalizer), and this stage releases it once the stream is drained.
pub struct WriteBackStage<P: Protocol> {
    sched: QueueScheduler<P>,
}

impl<P: Protocol> WriteBackStage<P> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sched: QueueScheduler::new(true) })
    }
}

impl<P: Protocol> Stage<P> for WriteBackStage<P> {
    fn name(&self) -> &'static str {
        "write_back"
    }

    fn scheduler(&self) -> Option<&dyn Scheduler<P>> {
        Some(&self.sched)
    }

    fn process_task(&self, pipeline: &Arc<Pipeline<P>>, conn: &Arc<Connection<P>>) -> i32 {
        if conn.is_inactive() {
            return 0;
        }
        let fd = conn.fd();

        // One blocking-mode drain per tick: the socket's send timeout bounds
        // the stall, and the poll path never contends because this stage
        // already owns the connection lock.
        let _ = set_socket_blocking(fd, true);
        let (result, done) = {
            let mut streams = conn.streams();
            let result = streams.output.write_into_output();
            let done = streams.output.is_done();
            (result, done)
        };
        let _ = set_socket_blocking(fd, false);

        match result {
            Ok(n) if !done => {
                if n > 0 {
                    conn.touch();
                }
                self.sched_add(conn);
                -1
            }
            Err(err)
                if !done
                    && matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
            {
                // zero progress this tick; keep the lock and retry without
                // refreshing the idle clock so a dead peer still expires
                self.sched_add(conn);
                -1
            }
            result => {
                if let Err(err) = result {
                    debug!(fd, %err, "write-back failed, dropping remaining output");
                }
                if conn.close_after_finish() {
                    debug!(fd, "active close after transfer finished");
                    pipeline.active_close(conn);
                }
                0
            }
        }
    }
}
