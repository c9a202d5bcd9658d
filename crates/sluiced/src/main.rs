use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use sluice_http::{HandlerRegistry, ServerConfig, StaticFileHandlerFactory};
use sluiced::WebServer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Staged event-driven web server.
#[derive(Parser)]
#[command(name = "sluiced", version)]
struct Args {
    /// Configuration file (YAML).
    #[arg(short = 'c')]
    config: PathBuf,

    /// Directory to load dynamic handler modules from.
    #[arg(short = 'm')]
    module_path: Option<PathBuf>,

    /// Set uid before the server starts.
    #[arg(short = 'u')]
    uid: Option<u32>,
}

/// Logs go to `LOG_FILE` when set, stderr otherwise. The returned guard
/// keeps the file writer alive for the process lifetime.
fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Ok(path) = std::env::var("LOG_FILE") {
        let path = PathBuf::from(path);
        let dir = path.parent().map_or_else(|| PathBuf::from("."), PathBuf::from);
        let file = path.file_name().map_or_else(|| "sluiced.log".into(), |f| f.to_os_string());
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file));
        tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging();

    if let Some(uid) = args.uid {
        if unsafe { libc::setuid(uid) } < 0 {
            bail!("setuid({uid}): {}", std::io::Error::last_os_error());
        }
    }
    if let Some(path) = &args.module_path {
        warn!(path = %path.display(), "dynamic handler modules are not supported; handlers are registered statically");
    }

    let registry = HandlerRegistry::new();
    registry.register_factory(Box::new(StaticFileHandlerFactory));

    let config = ServerConfig::load(&args.config)
        .with_context(|| format!("loading configuration {}", args.config.display()))?;

    let server = WebServer::build(&config, &registry)?;
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, server.stop_flag())
            .context("registering signal handler")?;
    }

    server.start_threads().context("starting stage threads")?;
    let addr = server.local_addr().context("resolving listen address")?;
    info!(%addr, "sluiced listening");
    server.run();
    Ok(())
}
