// halo-ingest: Accepts heartbeat lines from Halo sensors and stores them.
//
// Startup wires together config, allowlist, SQLite store and the TCP
// acceptor, then waits for Ctrl-C or SIGTERM and drains connections.

use clap::{Arg, Command};
use ingest::acceptor::Acceptor;
use ingest::allowlist::Allowlist;
use ingest::config::{IngestConfig, load_config_from_path};
use ingest::handler::ConnectionContext;
use ingest::storage::HeartbeatStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{error, info};

fn cli() -> Command {
    Command::new("Halo Ingest")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Receives Halo sensor heartbeats over TCP and stores them in SQLite")
        .arg(
            Arg::new("config")
                .help("TOML config file. Built-in defaults are used when omitted")
                .short('c')
                .long("config")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("bind")
                .help("Listen address, overriding listen.bind. Eg. 0.0.0.0:9000")
                .long("bind")
                .value_name("addr"),
        )
        .arg(
            Arg::new("allowlist")
                .help("Approved identifier file, overriding allowlist.path")
                .long("allowlist")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("db")
                .help("SQLite database file, overriding storage.sqlite_path")
                .long("db")
                .value_name("path")
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let matches = cli().get_matches();

    info!(version = env!("CARGO_PKG_VERSION"), "halo-ingest starting");

    let mut cfg = match matches.get_one::<PathBuf>("config") {
        Some(path) => match load_config_from_path(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "config loaded");
                cfg
            }
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => IngestConfig::default(),
    };
    if let Some(bind) = matches.get_one::<String>("bind") {
        cfg.listen.bind = bind.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("allowlist") {
        cfg.allowlist.path = path.clone();
    }
    if let Some(path) = matches.get_one::<PathBuf>("db") {
        cfg.storage.sqlite_path = path.clone();
    }

    let allowlist = match Allowlist::load(&cfg.allowlist.path) {
        Ok(list) => {
            info!(
                path = %cfg.allowlist.path.display(),
                approved = list.len(),
                "allowlist loaded"
            );
            list
        }
        Err(e) => {
            eprintln!("FATAL: failed to load allowlist: {}", e);
            std::process::exit(1);
        }
    };

    let store = match HeartbeatStore::open(&cfg.storage.sqlite_path) {
        Ok(store) => {
            info!(path = %cfg.storage.sqlite_path.display(), "heartbeat store opened");
            store
        }
        Err(e) => {
            eprintln!("FATAL: failed to open heartbeat store: {}", e);
            std::process::exit(1);
        }
    };

    if !cfg.sites.is_empty() {
        info!(mapped = cfg.sites.len(), "site map loaded");
    }

    let ctx = ConnectionContext {
        allowlist: Arc::new(allowlist),
        store: Arc::new(Mutex::new(store)),
        sites: Arc::new(cfg.sites),
        limits: cfg.connections,
        write_attempts: cfg.storage.write_attempts,
    };

    let acceptor = match Acceptor::bind(&cfg.listen.bind, ctx).await {
        Ok(a) => a,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let acceptor_task = tokio::spawn(acceptor.run(shutdown_rx));

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
                    _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
                }
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                info!("shutdown: SIGINT received");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }

    shutdown_tx.send(true).ok();

    match acceptor_task.await {
        Ok(stats) => info!(
            accepted = stats.accepted,
            refused = stats.refused,
            forced_closed = stats.forced_closed,
            stored = stats.messages.stored,
            "halo-ingest shutdown complete"
        ),
        Err(e) => error!(error = %e, "acceptor task failed"),
    }
}
