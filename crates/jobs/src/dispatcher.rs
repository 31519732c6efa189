//! Periodic dispatch loop.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

/// Handle to control and join the dispatch thread.
///
/// Dropping the handle stops the loop without waiting for it.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Request graceful shutdown and wait for the loop to stop.
    ///
    /// Returns `false` if the dispatch thread panicked.
    pub fn shutdown(mut self) -> bool {
        let _ = self.shutdown.send(());
        let Some(join) = self.join.take() else {
            return true;
        };
        let name = join.thread().name().unwrap_or("dispatcher").to_string();
        match join.join() {
            Ok(()) => true,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(dispatcher = %name, %reason, "dispatcher thread panicked");
                false
            }
        }
    }
}

/// Cooperative dispatch loop.
///
/// Calls `tick` once per `interval` until shutdown is requested, the handle
/// is dropped, or `tick` returns `false`.
#[derive(Debug)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn spawn<F>(name: &str, interval: Duration, tick: F) -> std::io::Result<DispatcherHandle>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let loop_name = name.to_string();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatch_loop(&loop_name, interval, shutdown_rx, tick))?;

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn dispatch_loop<F>(name: &str, interval: Duration, shutdown_rx: mpsc::Receiver<()>, mut tick: F)
where
    F: FnMut() -> bool,
{
    info!(dispatcher = name, interval_ms = interval.as_millis() as u64, "dispatcher started");

    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        if !tick() {
            debug!(dispatcher = name, "dispatch target dropped");
            break;
        }
    }

    info!(dispatcher = name, "dispatcher stopped");
}
