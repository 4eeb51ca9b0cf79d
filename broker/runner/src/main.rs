//! Broker daemon: wires the authz client, the worker pool and the IPC
//! endpoint together from one TOML configuration file and runs until a
//! termination signal arrives.

use clap::Parser;
use ferrite::config::BrokerConfig;
use ferrite::logging::{self, Logger};
use osmium::cluster::pool::WorkerPool;
use osmium::cluster::store::MemStore;
use osmium::net::endpoint::Endpoint;
use osmium::remote::security::{SecurityConfig, SecurityModule};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "brokerd", about = "Client-side object storage I/O broker")]
struct Args {
    /// Broker configuration file (TOML).
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    // An unreadable configuration is the only non-zero exit.
    let config = match BrokerConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    let log = logging::root_logger(&config);

    if let Err(err) = run(&config, &log) {
        logging::error!(log, "broker failed"; "error" => %err);
    }

    process::exit(0);
}

fn run(config: &BrokerConfig, log: &Logger) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, shutdown.clone())?;
    }

    let security = SecurityModule::start(
        SecurityConfig {
            server_addr: format!("{}:{}", config.auth_server_ip, config.auth_server_port),
            timeout_ms: config.auth_timeout_ms,
            window_cap: config.auth_window_cap,
        },
        log.new(logging::o!("component" => "security")),
    )?;

    let store = Arc::new(MemStore::default());
    let pool = Arc::new(WorkerPool::new(
        0,
        config.pool_size,
        security.clone(),
        store,
        log.new(logging::o!("component" => "pool")),
    ));

    if !pool.initialize() {
        pool.stop();
        security.stop();
        return Err("worker pool initialization failed".into());
    }

    let mut endpoint = Endpoint::bind(
        config,
        pool.clone(),
        security.clone(),
        log.new(logging::o!("component" => "endpoint")),
    )?;

    logging::info!(log, "broker running"; "workers" => pool.size());

    let result = endpoint.run(&shutdown);

    pool.stop();
    security.stop();

    result.map_err(Into::into)
}
