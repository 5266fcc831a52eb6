//! Idle watchdog task.
//!
//! One per manager at most. Polls the slot every `poll` and exits after it
//! evicts an idle model, on cancellation, or once the manager is gone.

use std::sync::Weak;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::ResidentResource;
use super::manager::{IdleCheck, Inner};

const MIN_POLL: Duration = Duration::from_millis(10);
const MAX_POLL: Duration = Duration::from_secs(24 * 60 * 60);

pub(crate) async fn watch_idle<R: ResidentResource>(
    manager: Weak<Inner<R>>,
    poll: Duration,
    cancel: CancellationToken,
) {
    let poll = poll.clamp(MIN_POLL, MAX_POLL);
    let start = Instant::now().checked_add(poll).unwrap_or_else(Instant::now);
    let mut ticker = tokio::time::interval_at(start, poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Idle watchdog cancelled");
                return;
            }
            _ = ticker.tick() => {}
        }

        let Some(inner) = manager.upgrade() else {
            return;
        };
        match inner.check_idle() {
            IdleCheck::Evicted => {
                tracing::debug!("Idle watchdog exiting after eviction");
                return;
            }
            // Slot may be empty after a forced release; keep watching for the next load.
            IdleCheck::Empty | IdleCheck::Active | IdleCheck::Leased => {}
        }
    }
}
