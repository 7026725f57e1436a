//! # Calendar Scheduler
//!
//! Drives the periodic notify-and-prune cycle:
//!
//! ```text
//! ┌──────┐  tick   ┌────────────────────────────────────────────┐
//! │ Idle │ ──────► │ due_notifications(now, tick)               │
//! └──────┘ ◄────── │   └─► publish each (log + continue on err) │
//!    │             │ delete_expired(now - retention)            │
//!    │ cancel      └────────────────────────────────────────────┘
//!    ▼
//! Publisher::shutdown() once ──► Stopped
//! ```
//!
//! Cancellation is only observed between ticks; a tick in flight always
//! finishes. A fatal publish error (the broker link gave up) ends the loop
//! after the current tick and is returned from [`Scheduler::run`].

use std::sync::Arc;
use std::time::Duration;

use calendar_core::config::{MAX_TICK_SECS, NotificationsConfig};
use calendar_core::error::{CalendarError, Result};
use calendar_core::traits::{NotificationSource, Publisher};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub due: usize,
    pub published: usize,
    pub failed: usize,
    pub pruned: u64,
    /// First non-recoverable publish error seen during the tick.
    pub fatal: Option<CalendarError>,
}

/// Wall time anchored once, advanced by the runtime's monotonic clock.
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self { wall: Utc::now(), mono: Instant::now() }
    }

    fn now(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.mono.elapsed())
            .ok()
            .and_then(|elapsed| self.wall.checked_add_signed(elapsed))
            .unwrap_or_else(Utc::now)
    }
}

pub struct Scheduler<S: NotificationSource + ?Sized> {
    source: Arc<S>,
    publisher: Arc<dyn Publisher>,
    tick: Duration,
    retention: TimeDelta,
}

impl<S: NotificationSource + ?Sized> Scheduler<S> {
    pub fn new(source: Arc<S>, publisher: Arc<dyn Publisher>, config: &NotificationsConfig) -> Result<Self> {
        if config.tick_secs == 0 {
            return Err(CalendarError::config("notifications.tick_secs must be greater than zero"));
        }
        if config.tick_secs > MAX_TICK_SECS {
            return Err(CalendarError::config(format!(
                "notifications.tick_secs must not exceed {MAX_TICK_SECS}"
            )));
        }
        Ok(Self { source, publisher, tick: config.tick(), retention: config.retention() })
    }

    /// Override the tick period. Zero is ignored.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        if !tick.is_zero() {
            self.tick = tick;
        }
        self
    }

    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    /// Tick immediately, then every period, until `cancel` fires or a fatal
    /// publish error occurs. Shuts the publisher down exactly once on the way
    /// out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!(tick = ?self.tick, retention_secs = self.retention.num_seconds(), "notification scheduler started");
        let clock = Clock::start();
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("scheduler cancelled");
                    break Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.tick(clock.now()).await {
                Ok(report) => {
                    if let Some(e) = report.fatal {
                        tracing::error!(error = %e, "publisher failed permanently, stopping scheduler");
                        break Err(e);
                    }
                }
                Err(e) => tracing::error!(error = %e, "scheduler tick failed"),
            }
        };

        let shutdown = self.publisher.shutdown().await;
        tracing::info!("notification scheduler stopped");
        match (outcome, shutdown) {
            (Err(e), Err(close)) => {
                tracing::error!(error = %close, "publisher shutdown failed");
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), shutdown) => shutdown,
        }
    }

    /// One notify-and-prune pass at `now`.
    ///
    /// Fails only when the due notifications cannot be read. Publish and
    /// prune failures are logged and reflected in the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        // sources clamp an oversized lookahead to the end of time
        let lookahead = TimeDelta::from_std(self.tick).unwrap_or(TimeDelta::MAX);
        let due = self.source.due_notifications(now, lookahead).await?;
        let mut report = TickReport { due: due.len(), ..TickReport::default() };
        tracing::debug!(%now, count = due.len(), "due notifications");

        for notification in &due {
            let result = match notification.to_payload() {
                Ok(payload) => self.publisher.publish(&payload).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    report.published += 1;
                    tracing::info!(id = %notification.id, "notification published");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(id = %notification.id, error = %e, "dropping notification for this tick");
                    if e.is_fatal() && report.fatal.is_none() {
                        report.fatal = Some(e);
                    }
                }
            }
        }

        match now.checked_sub_signed(self.retention) {
            Some(cutoff) => match self.source.delete_expired(cutoff).await {
                Ok(count) => report.pruned = count,
                Err(e) => tracing::error!(error = %e, %cutoff, "failed to delete expired events"),
            },
            None => tracing::debug!("retention window reaches past the calendar, nothing to prune"),
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use calendar_core::traits::EventStorage;
    use calendar_core::{Event, Notification};
    use calendar_storage::MemoryStorage;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct FakePublisher {
        sent: Mutex<Vec<Notification>>,
        calls: AtomicUsize,
        /// 1-based call numbers that fail.
        fail_calls: Vec<usize>,
        fatal: bool,
        shutdowns: AtomicUsize,
    }

    impl FakePublisher {
        fn titles(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|n| n.title.clone()).collect()
        }
    }

    #[async_trait]
    impl Publisher for FakePublisher {
        async fn publish(&self, payload: &[u8]) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fatal {
                return Err(CalendarError::ConnectionExhausted { attempts: 5, reason: "refused".into() });
            }
            if self.fail_calls.contains(&call) {
                return Err(CalendarError::NotAcknowledged);
            }
            self.sent.lock().unwrap().push(Notification::from_payload(payload)?);
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 7, 1, h, m, 0).unwrap()
    }

    fn event(title: &str, start: DateTime<Utc>, minutes: i64) -> Event {
        Event::new(Uuid::new_v4(), Uuid::new_v4(), title, start, start + TimeDelta::minutes(minutes))
    }

    fn config(tick_secs: u64) -> NotificationsConfig {
        NotificationsConfig { tick_secs, retention_secs: 0 }
    }

    #[tokio::test]
    async fn test_tick_publishes_in_start_order_and_prunes() {
        let store = Arc::new(MemoryStorage::new());
        for e in [
            event("second", at(9, 45), 30),
            event("first", at(9, 10), 30),
            event("later", at(12, 0), 30),
            event("ended", at(7, 0), 30),
        ] {
            store.create_event(e).await.unwrap();
        }
        let publisher = Arc::new(FakePublisher::default());
        let scheduler = Scheduler::new(store.clone(), publisher.clone(), &config(3600)).unwrap();

        let report = scheduler.tick(at(9, 0)).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.published, 2);
        assert_eq!(report.pruned, 1);
        assert_eq!(publisher.titles(), vec!["first", "second"]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_abort_tick() {
        let store = Arc::new(MemoryStorage::new());
        for (i, title) in ["a", "b", "c"].iter().enumerate() {
            let start = at(9, 0) + TimeDelta::minutes(10 * i as i64);
            store.create_event(event(title, start, 5)).await.unwrap();
        }
        let publisher = Arc::new(FakePublisher { fail_calls: vec![2], ..FakePublisher::default() });
        let scheduler = Scheduler::new(store.clone(), publisher.clone(), &config(3600)).unwrap();

        let report = scheduler.tick(at(9, 0)).await.unwrap();
        assert_eq!((report.published, report.failed), (2, 1));
        assert!(report.fatal.is_none());
        assert_eq!(publisher.titles(), vec!["a", "c"]);
        // events stay put for the next attempt
        assert_eq!(store.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_until_cancelled() {
        let base = Utc::now();
        let store = Arc::new(MemoryStorage::new());
        store.create_event(event("now", base + TimeDelta::seconds(30), 10)).await.unwrap();
        store.create_event(event("next tick", base + TimeDelta::seconds(90), 10)).await.unwrap();

        let publisher = Arc::new(FakePublisher::default());
        let scheduler = Arc::new(
            Scheduler::new(store.clone(), publisher.clone(), &config(60))
                .unwrap()
                .with_retention(TimeDelta::days(1)),
        );
        let cancel = CancellationToken::new();
        let task = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { scheduler.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(publisher.titles(), vec!["now"]);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(publisher.titles(), vec!["now", "next tick"]);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(publisher.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_publish_stops_after_tick() {
        let base = Utc::now();
        let store = Arc::new(MemoryStorage::new());
        store.create_event(event("one", base + TimeDelta::seconds(10), 1)).await.unwrap();
        store.create_event(event("two", base + TimeDelta::seconds(80), 1)).await.unwrap();

        let publisher = Arc::new(FakePublisher { fatal: true, ..FakePublisher::default() });
        let scheduler = Scheduler::new(store, publisher.clone(), &config(120)).unwrap();

        let err = scheduler.run(CancellationToken::new()).await.unwrap_err();
        assert!(err.is_fatal());
        // the whole tick ran before stopping
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(publisher.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_still_shuts_down() {
        let publisher = Arc::new(FakePublisher::default());
        let scheduler = Scheduler::new(Arc::new(MemoryStorage::new()), publisher.clone(), &config(60)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        scheduler.run(cancel).await.unwrap();
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_tick_rejected() {
        let result = Scheduler::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(FakePublisher::default()),
            &config(0),
        );
        assert!(matches!(result, Err(CalendarError::Config(_))));
    }

    #[tokio::test]
    async fn test_oversized_tick_reaches_every_future_event() {
        let store = Arc::new(MemoryStorage::new());
        store.create_event(event("soon", at(9, 30), 15)).await.unwrap();
        store.create_event(event("far", at(9, 0) + TimeDelta::days(3650), 15)).await.unwrap();
        let publisher = Arc::new(FakePublisher::default());
        let scheduler = Scheduler::new(store, publisher.clone(), &config(60))
            .unwrap()
            .with_tick(Duration::MAX);

        let report = scheduler.tick(at(9, 0)).await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(publisher.titles(), vec!["soon", "far"]);
    }

    #[test]
    fn test_tick_longer_than_a_day_rejected() {
        let store = Arc::new(MemoryStorage::new());
        let publisher = Arc::new(FakePublisher::default());
        let result = Scheduler::new(store, publisher, &config(MAX_TICK_SECS + 1));
        assert!(matches!(result, Err(CalendarError::Config(_))));
    }
}
