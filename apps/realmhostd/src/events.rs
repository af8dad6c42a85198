//! The host event loop.
//!
//! Worker threads and connection tasks never touch instance lifecycle
//! directly; they post [`Command`]s here. The loop also owns the two
//! periodic sweeps: due realm timers and the watchdog scan.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

use realmproto::worker::{TransferSpec, WorkerExit};

use crate::host::Host;
use crate::player::Player;

#[derive(Debug)]
pub enum Command {
    /// A worker asked to move one of its players (`<$b>`).
    Transfer {
        key: String,
        sid: i32,
        spec: TransferSpec,
    },
    /// A worker wrote the `rteinterval` register.
    SetEventInterval { key: String, secs: u32 },
    /// A worker thread finished; `terminated` means the host asked
    /// for it and no restart is wanted.
    InstanceExited {
        key: String,
        abandoned: Vec<Arc<Player>>,
        terminated: bool,
        exit: WorkerExit,
    },
    Shutdown,
}

/// A scheduled `$rtevent` delivery for one instance. Cancellation is
/// by tombstone: rescheduling flags the old entry and lets the sweep
/// skip it, so the priority queue never needs random removal.
#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub key: String,
    pub interval: Duration,
    pub tombstone: Arc<AtomicBool>,
}

pub async fn run_event_loop(host: Arc<Host>, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("event loop started");
    loop {
        let sleep_for = host
            .next_timer_in()
            .unwrap_or(host.cfg.poll_interval)
            .min(host.cfg.poll_interval);

        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => break,
                    Some(cmd) => host.dispatch(cmd).await,
                }
            }
            _ = tokio::time::sleep(sleep_for) => {}
        }

        host.sweep_timers();
        host.sweep_watchdogs().await;
    }
    info!("event loop stopped");
    host.shutdown_all().await;
    debug!("all instances deactivated");
}
