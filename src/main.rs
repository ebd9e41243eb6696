use clap::Parser;
use mimalloc::MiMalloc;
use nexgate::library::{
    backend::{BackendHandle, EchoApp},
    config::{GatewayConfig, PortConfig},
    error::GatewayResult,
    server::Server,
};
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "nexgate", version, about = "io_uring HTTP/WebSocket/raw TCP gateway")]
struct Args {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Worker threads, overrides the config.
    #[arg(short, long)]
    workers: Option<usize>,
    /// Listening port; repeat for more. Replaces the configured ports.
    #[arg(short, long)]
    port: Vec<u16>,
    #[arg(long)]
    sqpoll: bool,
    /// Start the built-in echo backend and route this URI to it on every port.
    #[arg(long, value_name = "URI")]
    echo_backend: Option<String>,
}

fn bootstrap_logs(level: &str) {
    let filter = EnvFilter::try_from_env("NEXGATE_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    fmt()
        .with_env_filter(filter)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .with_ansi(true)
        .init();
}

fn load_config(args: &Args) -> GatewayResult<GatewayConfig> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if !args.port.is_empty() {
        config.ports = args
            .port
            .iter()
            .map(|&port| PortConfig {
                port,
                ..PortConfig::default()
            })
            .collect();
    }
    config.sqpoll_enabled |= args.sqpoll;
    config.validate()?;
    Ok(config)
}

fn serve(args: Args, config: GatewayConfig) -> GatewayResult<()> {
    let ports: Vec<u16> = config.ports.iter().map(|p| p.port).collect();
    let running = Server::new(config).start()?;
    let mut echo = None;
    if let Some(uri) = args.echo_backend.as_deref() {
        let handle = BackendHandle::start(running.gateway(), Arc::new(EchoApp))?;
        for port in ports.iter() {
            running
                .gateway()
                .register_uri(*port, None, uri, handle.id(), handle.name())?;
            info!("Echo backend answers {} on port {}", uri, port);
        }
        echo = Some(handle);
    }
    let result = running.wait();
    drop(echo);
    result
}

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("nexgate: {}", err);
            return ExitCode::FAILURE;
        }
    };
    bootstrap_logs(&config.log_level);
    info!("Starting {} workers on {} ports", config.workers, config.ports.len());
    match serve(args, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Gateway stopped: {} (code {})", err, err.code());
            ExitCode::FAILURE
        }
    }
}
