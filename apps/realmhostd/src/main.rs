use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, Level};

use realmproto::worker::WorkerFactory;

mod compile;
mod conn;
mod demo;
mod error;
mod events;
mod host;
mod instance;
mod player;
mod realm;
mod store;

use compile::{Compiler, ExternalCompiler, NoopCompiler};
use host::{Config, Host};

fn usage_and_exit() -> ! {
    eprintln!(
        "realmhostd\n\n\
USAGE:\n  realmhostd [--bind HOST:PORT] [--data-dir DIR]\n\n\
ENV:\n  REALMHOST_BIND              default 0.0.0.0:4000\n  REALMHOST_DATA              default data\n  REALMHOST_START_REALM       default start\n  REALMHOST_ADMIN             account name granted admin on creation/boot\n  REALMHOST_COMPILER          external compiler command (default: built-in no-op)\n  REALMHOST_TXN_TIMEOUT_MS    default 10000\n  REALMHOST_GRACE_MS          default 15000 (watchdog)\n  REALMHOST_COMPILE_MS        default 60000\n  REALMHOST_FAILURES          default 3 (condemnation threshold)\n  REALMHOST_POLL_MS           default 500\n"
    );
    std::process::exit(2);
}

fn parse_args() -> Config {
    let bind = std::env::var("REALMHOST_BIND").unwrap_or_else(|_| "0.0.0.0:4000".to_string());
    let data_dir: PathBuf = std::env::var("REALMHOST_DATA")
        .unwrap_or_else(|_| "data".to_string())
        .into();
    let start_realm =
        std::env::var("REALMHOST_START_REALM").unwrap_or_else(|_| "start".to_string());
    let admin_name = std::env::var("REALMHOST_ADMIN").ok().filter(|s| !s.is_empty());
    let compiler_cmd: Option<PathBuf> = std::env::var("REALMHOST_COMPILER")
        .ok()
        .filter(|s| !s.is_empty())
        .map(Into::into);

    let ms = |var: &str, default: u64, floor: u64| -> Duration {
        Duration::from_millis(
            std::env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
                .max(floor),
        )
    };
    let txn_timeout = ms("REALMHOST_TXN_TIMEOUT_MS", 10_000, 100);
    let watchdog_grace = ms("REALMHOST_GRACE_MS", 15_000, 1_000);
    let compile_timeout = ms("REALMHOST_COMPILE_MS", 60_000, 1_000);
    let poll_interval = ms("REALMHOST_POLL_MS", 500, 50);
    let failure_threshold: u32 = std::env::var("REALMHOST_FAILURES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3)
        .max(1);

    let mut cfg = Config {
        bind,
        data_dir,
        start_realm,
        admin_name,
        txn_timeout,
        watchdog_grace,
        compile_timeout,
        failure_threshold,
        poll_interval,
        compiler_cmd,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                cfg.bind = it.next().unwrap_or_else(|| usage_and_exit());
            }
            "--data-dir" => {
                cfg.data_dir = it.next().unwrap_or_else(|| usage_and_exit()).into();
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    cfg
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,realmhostd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let store = Arc::new(store::Store::open(&cfg.data_dir).context("open data dir")?);

    let compiler: Arc<dyn Compiler> = match &cfg.compiler_cmd {
        Some(program) => Arc::new(ExternalCompiler {
            program: program.clone(),
            timeout: cfg.compile_timeout,
        }),
        None => Arc::new(NoopCompiler),
    };

    let mut factories: HashMap<String, Arc<dyn WorkerFactory>> = HashMap::new();
    factories.insert("echo".to_string(), Arc::new(demo::EchoFactory));

    let (post, commands) = mpsc::unbounded_channel();
    let host = Host::new(cfg, store, compiler, factories, post);
    host.bootstrap().context("bootstrap")?;

    let listener = TcpListener::bind(&host.cfg.bind)
        .await
        .with_context(|| format!("bind {}", host.cfg.bind))?;
    info!(bind = %host.cfg.bind, "realmhostd listening");

    let loop_host = host.clone();
    let mut event_loop = tokio::spawn(events::run_event_loop(loop_host, commands));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept")?;
                info!(peer = %peer, "client connected");
                let host = host.clone();
                tokio::spawn(conn::serve(host, stream, peer.to_string()));
            }
            res = &mut event_loop => {
                // Shutdown command (or loop panic) ends the process.
                res.context("event loop")?;
                break;
            }
        }
    }
    info!("realmhostd stopped");
    Ok(())
}
