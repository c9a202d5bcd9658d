use std::sync::{Arc, PoisonError, RwLock};

use sluice::{Connection, EngineError, Pipeline, QueueScheduler, Scheduler, Stage};
use tracing::{debug, info, warn};

use crate::{
    request::HttpRequest, response::HttpResponse, session::HttpProtocol, status::HttpStatus,
};

type HttpConn = Connection<HttpProtocol>;

/// Fairness bound: pipelined requests handled per scheduler tick before the
/// connection goes to the back of the queue.
pub const MAX_CONSECUTIVE_REQUESTS: usize = 3;

/// Applies the incremental parser to whatever the ingress stage buffered,
/// then hands ready connections to the handler stage.
pub struct HttpParserStage {
    sched: QueueScheduler<HttpProtocol>,
    handler_stage: RwLock<Option<Arc<dyn Stage<HttpProtocol>>>>,
}

impl HttpParserStage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sched: QueueScheduler::new(false), handler_stage: RwLock::new(None) })
    }

    fn handler_stage(&self) -> Option<Arc<dyn Stage<HttpProtocol>>> {
        self.handler_stage.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Stage<HttpProtocol> for HttpParserStage {
    fn name(&self) -> &'static str {
        "parser"
    }

    fn initialize(&self, pipeline: &Arc<Pipeline<HttpProtocol>>) -> Result<(), EngineError> {
        let handler = pipeline
            .find_stage("http_handler")
            .ok_or_else(|| EngineError::MissingStage("http_handler".into()))?;
        *self.handler_stage.write().unwrap_or_else(PoisonError::into_inner) = Some(handler);
        Ok(())
    }

    fn scheduler(&self) -> Option<&dyn Scheduler<HttpProtocol>> {
        Some(&self.sched)
    }

    fn process_task(&self, pipeline: &Arc<Pipeline<HttpProtocol>>, conn: &Arc<HttpConn>) -> i32 {
        let parsed_ok = {
            let mut session = conn.session();
            let mut streams = conn.streams();
            session.do_parse(streams.input.buffer_mut())
        };
        if !parsed_ok {
            warn!(peer = %conn.peer(), "corrupted protocol, closing");
            pipeline.active_close(conn);
            return 0;
        }

        let ready = {
            let session = conn.session();
            let buffered = conn.streams().input.buffer().size();
            session.is_ready(buffered)
        };
        if ready {
            if let Some(handler) = self.handler_stage() {
                handler.sched_add(conn);
            }
        }
        0
    }
}

/// Runs the handler chain for each pending request and drives the response
/// builder.
pub struct HttpHandlerStage {
    sched: QueueScheduler<HttpProtocol>,
}

impl HttpHandlerStage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { sched: QueueScheduler::new(false) })
    }
}

impl Stage<HttpProtocol> for HttpHandlerStage {
    fn name(&self) -> &'static str {
        "http_handler"
    }

    fn scheduler(&self) -> Option<&dyn Scheduler<HttpProtocol>> {
        Some(&self.sched)
    }

    fn process_task(&self, pipeline: &Arc<Pipeline<HttpProtocol>>, conn: &Arc<HttpConn>) -> i32 {
        let mut response = HttpResponse::new(conn, pipeline);
        let mut closing = false;

        for _ in 0..MAX_CONSECUTIVE_REQUESTS {
            let Some(data) = conn.session().pop_request() else { break };
            let keep_alive = data.keep_alive;
            let version_minor = data.version_minor;
            let rule = data.url_rule.clone();
            info!(method = %data.method, uri = %data.uri, peer = %conn.peer(), "dispatching");

            let mut request = HttpRequest::new(conn, pipeline, data);
            match rule {
                None => {
                    response.write_string("This url is not configured.");
                    response.respond(HttpStatus::SERVICE_UNAVAILABLE);
                }
                Some(rule) => {
                    if keep_alive && version_minor == 0 {
                        response.add_header("Connection", "Keep-Alive");
                    }
                    for handler in &rule.chain {
                        handler.handle_request(&mut request, &mut response);
                        if response.is_responded() {
                            break;
                        }
                    }
                    if !response.is_responded() {
                        response.respond(HttpStatus::SERVICE_UNAVAILABLE);
                    }
                }
            }
            response.reset();
            drop(request);

            if !keep_alive {
                debug!(fd = conn.fd(), "closing after transfer finishes");
                conn.set_close_after_finish();
                closing = true;
                break;
            }
        }

        if !closing && conn.session().pending_requests() > 0 {
            self.sched_add(conn);
        }
        response.response_code()
    }
}
