//! Client clock used for deadlines and submission timestamps.
//!
//! The wall clock is sampled once and then advanced by the runtime's monotonic
//! clock, so deadline comparisons never jump backwards when the system clock is
//! adjusted, and a paused tokio test runtime moves it forward deterministically.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

static ANCHOR: OnceLock<(i64, Instant)> = OnceLock::new();

fn anchor() -> &'static (i64, Instant) {
    ANCHOR.get_or_init(|| {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        (wall, Instant::now())
    })
}

/// Current client time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    let (wall, started) = anchor();
    let now = Instant::now();
    // A paused runtime created before the anchor may report an earlier instant.
    let ahead = millis_i64(now.saturating_duration_since(*started));
    let behind = millis_i64(started.saturating_duration_since(now));
    wall.saturating_add(ahead).saturating_sub(behind)
}

fn millis_i64(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn now_is_close_to_system_time() {
        let system = chrono::Utc::now().timestamp_millis();
        let client = now_millis();
        assert!((client - system).abs() < 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_runtime_advances_client_time() {
        let before = now_millis();
        tokio::time::sleep(Duration::from_secs(30)).await;
        let after = now_millis();
        assert!(after - before >= 30_000);
    }
}
