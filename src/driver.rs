use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info};
use crate::context::TransportContext;

/// Runs periodic maintenance (pings, timeouts, resends, and flushing of queued acks) on a shared
///  context once per `tick`, forever. Acks are sent once the oldest queued ack for a circuit is
///  older than `ack_collect_time`.
///
/// The context is locked for each round, so all other access to it is serialized with
///  maintenance. To stop the loop, abort the task running it.
pub async fn run_maintenance_loop(context: Arc<Mutex<TransportContext>>, tick: Duration, ack_collect_time: Duration) {
    info!("starting circuit maintenance loop, tick {:?}", tick);

    let mut ticks = interval(tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        let removed = context.lock().await
            .process(Instant::now(), ack_collect_time);
        for host in removed {
            debug!("circuit {:?} timed out", host);
        }
    }
}
