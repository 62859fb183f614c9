use std::sync::Arc;
use std::time::Duration;

use negocia_agent::AgentRuntime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodically evicts contexts idle for longer than `max_age_hours`.
pub fn spawn(runtime: Arc<AgentRuntime>, every: Duration, max_age_hours: u64) -> JoinHandle<()> {
    info!(
        event_name = "system.sweeper.start",
        interval_secs = every.as_secs(),
        max_age_hours,
        "idle context sweeper started"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = runtime.evict_idle_contexts(max_age_hours);
            debug!(
                event_name = "system.sweeper.tick",
                evicted,
                remaining = runtime.active_contexts(),
                "idle context sweep finished"
            );
        }
    })
}
