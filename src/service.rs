//! Background service trait, mirroring the teacher's `JobWorker`/`Service`
//! shape (`kernel/jobs/worker.rs`): own the poll loop, accept a shared
//! `CancellationToken`, shut down gracefully when it fires. The scheduler,
//! update processor, and reaper each implement this trait and are spawned
//! as independent tasks from `bin/server.rs`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[async_trait]
pub trait Service: Send {
    /// Short name used in startup/shutdown log lines.
    fn name(&self) -> &'static str;

    /// Runs until `shutdown` is cancelled. Implementations should check
    /// `shutdown.is_cancelled()` between units of work and use
    /// `tokio::select!` against `shutdown.cancelled()` while sleeping, so a
    /// cancellation is never left waiting out a full poll interval.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Spawns every service as its own task and waits for all of them, the way
/// the teacher's `JobRunner::run_until_shutdown` wires a Ctrl-C listener to
/// its own shutdown flag — generalized here to one shared token across an
/// arbitrary number of services instead of a single `AtomicBool`.
pub async fn run_until_shutdown(services: Vec<Box<dyn Service>>) {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received shutdown signal");
        signal_token.cancel();
    });

    let mut handles = Vec::with_capacity(services.len());
    for service in services {
        let name = service.name();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            tracing::info!(service = name, "starting");
            if let Err(e) = service.run(token).await {
                tracing::error!(service = name, error = %e, "service exited with error");
            } else {
                tracing::info!(service = name, "stopped");
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}
