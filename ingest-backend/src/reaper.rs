//! Reaper (§4.2 "Reaper" / §2 component table): a periodic task that ages
//! out stale assemblies. It never mutates an assembly directly — it only
//! asks the assembly manager to fan a reap check out to each device worker,
//! which is the owner of its own assemblies (§5, §9's in-memory-table note).

use std::sync::Arc;
use std::time::Duration;

use crate::assembly::AssemblyManager;

pub async fn run(
    assembly: Arc<AssemblyManager>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => assembly.tick_reaper().await,
        }
    }
}
