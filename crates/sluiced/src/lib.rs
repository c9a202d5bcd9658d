//! Assembles the staged engine and the HTTP layer into a runnable web
//! server: stage construction, pool sizing, handler registration, and the
//! accept loop.

use std::{
    io,
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
    time::{Duration, Instant},
};

use anyhow::Context;
use sluice::{
    start_stage_thread, Listener, Pipeline, PollInStage, RecycleStage, Server, Stage,
    WriteBackStage,
};
use sluice_http::{
    HandlerRegistry, HttpHandlerStage, HttpParserStage, HttpProtocol, ServerConfig, VHostConfig,
};

type HttpStage = Arc<dyn Stage<HttpProtocol>>;

/// The fully wired server: listener, pipeline, and every stage with its
/// configured pool size.
pub struct WebServer {
    server: Server<HttpProtocol>,
    poll_in: Arc<PollInStage<HttpProtocol>>,
    stages: Vec<(HttpStage, usize)>,
    read_pool_size: usize,
}

impl WebServer {
    /// Builds stages and binds the listener per the configuration. Handler
    /// instances come from `registry`, which must already know every module
    /// the config names.
    pub fn build(config: &ServerConfig, registry: &HandlerRegistry) -> anyhow::Result<Self> {
        for spec in &config.handlers {
            registry
                .create_instance(&spec.name, &spec.module, &spec.handler_options())
                .with_context(|| format!("instantiating handler `{}`", spec.name))?;
        }
        let vhosts = Arc::new(
            VHostConfig::build(&config.host, registry).context("compiling vhost rules")?,
        );

        let pipeline = Pipeline::new(HttpProtocol::new(vhosts, config.idle_timeout));
        let poll_in = PollInStage::new();
        let write_back = WriteBackStage::new();
        let recycle = RecycleStage::new(config.recycle_threshold);
        let parser = HttpParserStage::new();
        let handler = HttpHandlerStage::new();

        pipeline.set_poll_in_stage(&poll_in);
        pipeline.add_stage("write_back", Arc::clone(&write_back) as HttpStage);
        pipeline.add_stage("recycle", Arc::clone(&recycle) as HttpStage);
        pipeline.add_stage("parser", Arc::clone(&parser) as HttpStage);
        pipeline.add_stage("http_handler", Arc::clone(&handler) as HttpStage);
        pipeline.initialize_stages().context("initializing stages")?;

        let listener = Listener::bind(&config.address, config.port)
            .with_context(|| format!("binding {}:{}", config.address, config.port))?;
        listener.listen(config.listen_queue_size).context("listening")?;

        let stages: Vec<(HttpStage, usize)> = vec![
            (recycle as HttpStage, 1),
            (Arc::clone(&poll_in) as HttpStage, config.read_stage_pool_size.max(1)),
            (write_back as HttpStage, config.write_stage_pool_size.max(1)),
            (parser as HttpStage, 1),
            (handler as HttpStage, config.handler_stage_pool_size.max(1)),
        ];

        Ok(Self {
            server: Server::new(listener, pipeline),
            poll_in,
            stages,
            read_pool_size: config.read_stage_pool_size.max(1),
        })
    }

    /// Spawns every stage's worker pool.
    pub fn start_threads(&self) -> io::Result<()> {
        for (stage, pool_size) in &self.stages {
            for idx in 0..*pool_size {
                start_stage_thread(stage, self.server.pipeline(), idx)?;
            }
        }
        Ok(())
    }

    /// Blocks until the ingress pollers are accepting registrations, so a
    /// caller can connect immediately after.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.poll_in.poller_count() < self.read_pool_size {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.server.listener().local_addr()
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<HttpProtocol>> {
        self.server.pipeline()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.server.stop_flag()
    }

    /// Runs the accept loop on the calling thread.
    pub fn run(&self) {
        self.server.main_loop();
    }
}
