use crate::broker::{BrokerClient, MqttBroker};
use crate::config::Config;
use crate::connection::{Backoff, ConnectionManager, ConnectionState};
use crate::format::{format, FormatVariant, Payload};
use crate::http::{self, HttpState};
use crate::queue::{DurableQueue, QueueStorage, StorageError};
use crate::sampler::{Reading, Sampler};
use crate::sensor::{Sensor, W1Thermometer};
use crate::spool::SegmentSpool;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;

/// Process-wide stop flag. Transitions once, from running to stopped.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStatus {
    pub connection: ConnectionState,
    pub queue_depth: u64,
    pub samples_taken: u64,
    pub sensor_errors: u64,
    pub format_errors: u64,
    pub connect_failures: u64,
    pub published_live: u64,
    pub published_from_queue: u64,
    pub spooled: u64,
    pub last_reading: Option<Reading>,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub sampled: bool,
    pub published_live: bool,
    pub spooled: bool,
    pub drained: bool,
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub identity: String,
    pub variant: FormatVariant,
    pub max_payload_bytes: usize,
    pub sample_interval: Duration,
    pub tick_interval: Duration,
}

impl LoopSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            identity: config.device_id.clone(),
            variant: config.payload_format,
            max_payload_bytes: config.max_payload_bytes,
            sample_interval: config.sample_interval,
            tick_interval: config.tick_interval,
        }
    }
}

pub struct DeliveryLoop<S: Sensor, B: BrokerClient, Q: QueueStorage> {
    sampler: Sampler<S>,
    connection: ConnectionManager<B>,
    queue: DurableQueue<Q>,
    settings: LoopSettings,
    last_attempt: Option<Instant>,
    status: DeliveryStatus,
    status_tx: watch::Sender<DeliveryStatus>,
}

impl<S: Sensor, B: BrokerClient, Q: QueueStorage> DeliveryLoop<S, B, Q> {
    pub fn new(
        sampler: Sampler<S>,
        connection: ConnectionManager<B>,
        queue: DurableQueue<Q>,
        settings: LoopSettings,
    ) -> Self {
        let status = DeliveryStatus {
            connection: connection.state(),
            queue_depth: queue.len(),
            ..DeliveryStatus::default()
        };
        let (status_tx, _) = watch::channel(status.clone());
        Self {
            sampler,
            connection,
            queue,
            settings,
            last_attempt: None,
            status,
            status_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DeliveryStatus> {
        self.status_tx.subscribe()
    }

    pub async fn run_until(&mut self, stop: &StopSignal) -> Result<(), StorageError> {
        tracing::info!(
            sample_interval_ms = self.settings.sample_interval.as_millis() as u64,
            tick_ms = self.settings.tick_interval.as_millis() as u64,
            "delivery loop started"
        );
        if !self.queue.is_empty() {
            tracing::info!(queued = self.queue.len(), "backlog from previous run");
        }
        while !stop.is_stopped() {
            let outcome = self.step(Instant::now()).await?;
            if outcome.sampled || outcome.drained {
                tracing::debug!(
                    live = outcome.published_live,
                    spooled = outcome.spooled,
                    drained = outcome.drained,
                    queued = self.queue.len(),
                    "tick"
                );
            }
            tokio::time::sleep(self.settings.tick_interval).await;
        }
        tracing::info!(queued = self.queue.len(), "delivery loop stopped");
        Ok(())
    }

    /// Runs one iteration against the monotonic time `now`.
    pub async fn step(&mut self, now: Instant) -> Result<TickOutcome, StorageError> {
        let mut outcome = TickOutcome::default();
        let fresh = self.sample_if_due(now, &mut outcome);

        if !self.connection.is_connected().await && self.connection.connect_due(now) {
            if let Err(err) = self.connection.connect(now).await {
                self.status.connect_failures += 1;
                self.status.last_error = Some(err.to_string());
            }
        }

        if let Some(payload) = fresh {
            if self.publish(&payload).await {
                outcome.published_live = true;
                self.status.published_live += 1;
            } else {
                run_blocking(|| self.queue.push(&payload))?;
                outcome.spooled = true;
                self.status.spooled += 1;
            }
        }

        if self.connection.state() == ConnectionState::Connected {
            if let Some(payload) = run_blocking(|| self.queue.peek_oldest())? {
                if self.publish(&payload).await {
                    run_blocking(|| self.queue.delete_oldest())?;
                    outcome.drained = true;
                    self.status.published_from_queue += 1;
                }
            }
        }

        self.publish_status();
        Ok(outcome)
    }

    /// Tears down the broker session and hands back the queue storage.
    pub async fn shutdown(mut self) -> Q {
        self.connection.teardown().await;
        self.publish_status();
        self.queue.into_inner()
    }

    fn sample_if_due(&mut self, now: Instant, outcome: &mut TickOutcome) -> Option<Payload> {
        let due = self
            .last_attempt
            .map_or(true, |last| now.saturating_duration_since(last) >= self.settings.sample_interval);
        if !due {
            return None;
        }
        self.last_attempt = Some(now);

        let reading = match run_blocking(|| self.sampler.sample()) {
            Ok(reading) => reading,
            Err(err) => {
                tracing::warn!(error=%err, "sensor read failed");
                self.status.sensor_errors += 1;
                self.status.last_error = Some(err.to_string());
                return None;
            }
        };
        outcome.sampled = true;
        self.status.samples_taken += 1;
        self.status.last_reading = Some(reading);
        tracing::debug!(value = reading.value, "sampled");

        match format(
            &reading,
            &self.settings.identity,
            self.settings.variant,
            self.settings.max_payload_bytes,
        ) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::warn!(error=%err, variant = %self.settings.variant, "dropping reading");
                self.status.format_errors += 1;
                self.status.last_error = Some(err.to_string());
                None
            }
        }
    }

    async fn publish(&mut self, payload: &Payload) -> bool {
        if self.connection.state() != ConnectionState::Connected {
            return false;
        }
        match self.connection.publish(payload).await {
            Ok(()) => true,
            Err(err) => {
                self.status.last_error = Some(err.to_string());
                false
            }
        }
    }

    fn publish_status(&mut self) {
        self.status.connection = self.connection.state();
        self.status.queue_depth = self.queue.len();
        self.status.updated_at = Some(Utc::now());
        self.status_tx.send_replace(self.status.clone());
    }
}

/// Runs a sysfs read or spool fsync. On a multi-threaded runtime the worker hands its other
/// tasks off first so the broker poller and status endpoint keep running.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Wires the shipped sensor, broker and spool together and runs until `stop` is set.
pub async fn run(config: Config, stop: StopSignal) -> Result<()> {
    let spool = SegmentSpool::open(&config.spool_dir, config.segment_roll_bytes)
        .with_context(|| format!("failed to open spool at {}", config.spool_dir.display()))?;
    let connection = ConnectionManager::new(
        MqttBroker,
        config.broker.clone(),
        Backoff::new(config.reconnect_backoff_initial, config.reconnect_backoff_max),
    );
    let mut delivery = DeliveryLoop::new(
        Sampler::new(W1Thermometer::new(&config.w1_devices_dir)),
        connection,
        DurableQueue::new(spool),
        LoopSettings::from_config(&config),
    );

    let http_task = match &config.http_bind {
        Some(bind) => {
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind status endpoint on {bind}"))?;
            tracing::info!(bind = %bind, "status endpoint listening");
            let app = http::router(HttpState {
                status: delivery.subscribe(),
                spool_dir: config.spool_dir.clone(),
            });
            Some(tokio::spawn(async move {
                if let Err(err) = axum::serve(listener, app).await {
                    tracing::warn!(error=%err, "status endpoint stopped");
                }
            }))
        }
        None => None,
    };

    let result = delivery.run_until(&stop).await;
    drop(delivery.shutdown().await);
    if let Some(task) = http_task {
        task.abort();
    }
    result.context("delivery stopped on storage failure")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;
    use crate::testing::{FakeBroker, FakeSensor, MemoryStorage};
    use tempfile::TempDir;

    type TestLoop<Q> = DeliveryLoop<FakeSensor, FakeBroker, Q>;

    fn broker_config() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "test".to_string(),
            username: None,
            password: None,
            topic: "iot/temperature".to_string(),
            keep_alive: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(1),
            publish_timeout: Duration::from_secs(1),
        }
    }

    fn settings(sample_interval_secs: u64) -> LoopSettings {
        LoopSettings {
            identity: "rpi#0001".to_string(),
            variant: FormatVariant::Text,
            max_payload_bytes: 1024,
            sample_interval: Duration::from_secs(sample_interval_secs),
            tick_interval: Duration::from_millis(1),
        }
    }

    fn build<Q: QueueStorage>(
        sensor: FakeSensor,
        broker: &FakeBroker,
        storage: Q,
        settings: LoopSettings,
    ) -> TestLoop<Q> {
        let connection = ConnectionManager::new(
            broker.clone(),
            broker_config(),
            Backoff::new(Duration::ZERO, Duration::ZERO),
        );
        DeliveryLoop::new(Sampler::new(sensor), connection, DurableQueue::new(storage), settings)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn values(entries: &[String]) -> Vec<String> {
        entries
            .iter()
            .map(|e| e.rsplit(',').next().unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn samples_are_spooled_in_order_while_broker_is_down() {
        let broker = FakeBroker::refusing();
        let mut delivery = build(
            FakeSensor::with_values([1.0, 2.0, 3.0]),
            &broker,
            MemoryStorage::default(),
            settings(1),
        );
        let t0 = Instant::now();
        for n in 0..3 {
            let outcome = delivery.step(t0 + secs(n)).await.unwrap();
            assert!(outcome.sampled && outcome.spooled);
        }
        assert_eq!(broker.connect_attempts(), 3);

        let storage = delivery.shutdown().await;
        assert_eq!(values(&storage.entries()), vec!["1.00", "2.00", "3.00"]);
    }

    #[tokio::test]
    async fn fresh_sample_goes_out_before_queue_head() {
        let broker = FakeBroker::accepting();
        let mut storage = MemoryStorage::default();
        storage.append(b"queued").unwrap();
        let mut delivery = build(FakeSensor::with_values([21.5]), &broker, storage, settings(60));

        let outcome = delivery.step(Instant::now()).await.unwrap();
        assert!(outcome.published_live && outcome.drained);
        assert_eq!(values(&broker.published()), vec!["21.50", "queued"]);
        assert!(delivery.shutdown().await.entries().is_empty());
    }

    #[tokio::test]
    async fn outage_backlog_drains_oldest_first_one_per_tick() {
        let broker = FakeBroker::accepting();
        broker.script_connects([false, false, false]);
        let mut delivery = build(
            FakeSensor::with_values([10.0, 11.0]),
            &broker,
            MemoryStorage::default(),
            settings(60),
        );
        let t0 = Instant::now();

        assert!(delivery.step(t0).await.unwrap().spooled);
        assert_eq!(delivery.step(t0 + secs(1)).await.unwrap(), TickOutcome::default());
        assert!(delivery.step(t0 + secs(60)).await.unwrap().spooled);
        assert_eq!(broker.connect_attempts(), 3);
        assert!(broker.published().is_empty());

        let outcome = delivery.step(t0 + secs(61)).await.unwrap();
        assert!(outcome.drained && !outcome.sampled);
        assert_eq!(values(&broker.published()), vec!["10.00"]);

        assert!(delivery.step(t0 + secs(62)).await.unwrap().drained);
        assert_eq!(values(&broker.published()), vec!["10.00", "11.00"]);
        assert_eq!(broker.connect_attempts(), 4);

        let status = delivery.subscribe().borrow().clone();
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.connection, ConnectionState::Connected);
        assert_eq!(status.connect_failures, 3);
        assert_eq!(status.published_from_queue, 2);
    }

    #[tokio::test]
    async fn oversized_reading_is_dropped_without_touching_queue() {
        let broker = FakeBroker::refusing();
        let mut short = settings(60);
        short.max_payload_bytes = 8;
        let mut delivery = build(FakeSensor::with_values([23.0]), &broker, MemoryStorage::default(), short);

        let outcome = delivery.step(Instant::now()).await.unwrap();
        assert!(outcome.sampled && !outcome.spooled && !outcome.published_live);

        let status = delivery.subscribe().borrow().clone();
        assert_eq!(status.format_errors, 1);
        assert_eq!(status.queue_depth, 0);
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn queued_entry_is_kept_until_a_publish_succeeds() {
        let broker = FakeBroker::accepting();
        broker.script_publishes([false, false]);
        let mut storage = MemoryStorage::default();
        storage.append(b"old").unwrap();
        let mut delivery = build(FakeSensor::with_values([5.0]), &broker, storage, settings(60));
        let t0 = Instant::now();

        // Fresh publish fails: spooled behind the old entry, session dropped.
        let outcome = delivery.step(t0).await.unwrap();
        assert!(outcome.spooled && !outcome.drained);

        // Head publish fails: nothing removed.
        assert!(!delivery.step(t0 + secs(1)).await.unwrap().drained);
        assert_eq!(delivery.subscribe().borrow().queue_depth, 2);

        assert!(delivery.step(t0 + secs(2)).await.unwrap().drained);
        assert!(delivery.step(t0 + secs(3)).await.unwrap().drained);
        assert_eq!(values(&broker.published()), vec!["old", "5.00"]);
        assert_eq!(broker.publish_attempts(), 4);
        assert!(delivery.shutdown().await.entries().is_empty());
    }

    #[tokio::test]
    async fn broker_hangup_is_noticed_and_next_sample_spooled() {
        let broker = FakeBroker::accepting();
        let mut delivery = build(
            FakeSensor::with_values([1.0, 2.0]),
            &broker,
            MemoryStorage::default(),
            settings(60),
        );
        let t0 = Instant::now();
        assert!(delivery.step(t0).await.unwrap().published_live);

        broker.drop_session();
        broker.set_accepting(false);
        let outcome = delivery.step(t0 + secs(60)).await.unwrap();
        assert!(outcome.spooled);

        let status = delivery.subscribe().borrow().clone();
        assert_eq!(status.connection, ConnectionState::Disconnected);
        assert_eq!(status.queue_depth, 1);
    }

    #[tokio::test]
    async fn failed_sensor_read_still_advances_the_sampling_gate() {
        let broker = FakeBroker::refusing();
        let mut delivery = build(
            FakeSensor::with_script([None, Some(20.0)]),
            &broker,
            MemoryStorage::default(),
            settings(60),
        );
        let t0 = Instant::now();

        assert!(!delivery.step(t0).await.unwrap().sampled);
        assert!(!delivery.step(t0 + secs(1)).await.unwrap().sampled);
        assert!(!delivery.step(t0 + secs(59)).await.unwrap().sampled);
        assert!(delivery.step(t0 + secs(60)).await.unwrap().sampled);

        let status = delivery.subscribe().borrow().clone();
        assert_eq!(status.sensor_errors, 1);
        assert_eq!(status.samples_taken, 1);
        assert_eq!(values(&delivery.shutdown().await.entries()), vec!["20.00"]);
    }

    #[tokio::test]
    async fn storage_failure_stops_the_loop() {
        let broker = FakeBroker::refusing();
        let mut delivery = build(
            FakeSensor::with_values([1.0]),
            &broker,
            MemoryStorage::failing_appends(),
            settings(60),
        );
        let stop = StopSignal::new();
        let err = delivery.run_until(&stop).await.unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(!stop.is_stopped());
    }

    #[tokio::test]
    async fn stopped_signal_ends_run_without_a_tick() {
        let broker = FakeBroker::accepting();
        let mut delivery = build(FakeSensor::failing(), &broker, MemoryStorage::default(), settings(60));
        let stop = StopSignal::new();
        stop.stop();
        delivery.run_until(&stop).await.unwrap();
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn spooled_backlog_survives_restart() {
        let dir = TempDir::new().unwrap();
        let broker = FakeBroker::refusing();
        let t0 = Instant::now();
        {
            let spool = SegmentSpool::open(dir.path(), 1024 * 1024).unwrap();
            let mut delivery = build(FakeSensor::with_values([7.0, 8.0]), &broker, spool, settings(60));
            delivery.step(t0).await.unwrap();
            delivery.step(t0 + secs(60)).await.unwrap();
            delivery.shutdown().await;
        }

        broker.set_accepting(true);
        let spool = SegmentSpool::open(dir.path(), 1024 * 1024).unwrap();
        let mut delivery = build(FakeSensor::failing(), &broker, spool, settings(60));
        assert_eq!(delivery.subscribe().borrow().queue_depth, 2);
        delivery.step(t0).await.unwrap();
        delivery.step(t0 + secs(1)).await.unwrap();
        assert_eq!(values(&broker.published()), vec!["7.00", "8.00"]);
        assert_eq!(delivery.shutdown().await.pending(), 0);
    }

    #[test]
    fn run_blocking_works_outside_a_runtime() {
        assert_eq!(run_blocking(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn step_on_multi_thread_runtime_spools_to_disk() {
        let dir = TempDir::new().unwrap();
        let broker = FakeBroker::refusing();
        let spool = SegmentSpool::open(dir.path(), 1024 * 1024).unwrap();
        let mut delivery = build(FakeSensor::with_values([4.0]), &broker, spool, settings(60));

        let outcome = delivery.step(Instant::now()).await.unwrap();
        assert!(outcome.sampled && outcome.spooled);

        let mut spool = delivery.shutdown().await;
        let head = spool.read_oldest().unwrap().unwrap();
        assert!(String::from_utf8(head).unwrap().ends_with(",4.00"));
    }
}
