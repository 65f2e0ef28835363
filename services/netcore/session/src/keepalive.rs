//! Session timers: the periodic pulse and the reconnection delay.
//!
//! Timers are plain tasks that post an event tagged with the connection
//! generation. Aborting the task cancels the timer.

use netcore_wire::SessionId;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::manager::EngineEvent;

/// Post a pulse every `period` until aborted or the engine is gone
pub(crate) fn spawn_pulse(
    id: SessionId,
    generation: u64,
    period: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if events.send(EngineEvent::Pulse { id, generation }).is_err() {
                return;
            }
        }
    })
}

/// Post a single retry event after `delay`
pub(crate) fn spawn_retry_timer(
    id: SessionId,
    generation: u64,
    delay: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = events.send(EngineEvent::ReconnectDue { id, generation });
    })
}
