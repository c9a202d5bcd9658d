use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown poller implementation `{0}`")]
    UnknownPoller(String),
    #[error("stage `{0}` is not registered in the pipeline")]
    MissingStage(String),
    #[error("cannot bind {addr}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}
