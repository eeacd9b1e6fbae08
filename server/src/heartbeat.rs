//! Periodic timestamp broadcast to every WebSocket client.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::{Gateway, Payload};

/// Spawn the heartbeat task. The first tick fires one `period` after the call;
/// ticks missed under load are skipped rather than bursted.
pub fn spawn(gateway: Gateway, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(?period, "Heartbeat started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = gateway.broadcast(Payload::text(timestamp(SystemTime::now()))).await;
                    debug!(delivered = report.delivered, "Heartbeat sent");
                }
            }
        }
        info!("Heartbeat stopped");
    })
}

/// Unix time as `seconds.micros`, e.g. `1760000000.123456`.
pub fn timestamp(now: SystemTime) -> String {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:06}", since_epoch.as_secs(), since_epoch.subsec_micros())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_timestamp_format() {
        let t = UNIX_EPOCH + Duration::new(1_760_000_000, 123_456_789);
        assert_eq!(timestamp(t), "1760000000.123456");
        let t = UNIX_EPOCH + Duration::new(5, 7_000);
        assert_eq!(timestamp(t), "5.000007");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_after_one_period_until_cancelled() {
        let gateway = Gateway::new(Duration::from_millis(100));
        let (tx, mut rx) = mpsc::channel(16);
        let _member = gateway.join(tx);
        let token = CancellationToken::new();
        let start = Instant::now();
        let handle = spawn(gateway.clone(), Duration::from_secs(1), token.clone());

        for n in 1..=3u32 {
            let Some(Payload::Text(text)) = rx.recv().await else {
                panic!("expected a text heartbeat");
            };
            assert!(Instant::now() - start >= Duration::from_secs(n.into()));
            let (secs, micros) = text.as_str().split_once('.').unwrap();
            assert!(secs.parse::<u64>().is_ok());
            assert_eq!(micros.len(), 6);
        }

        token.cancel();
        handle.await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
