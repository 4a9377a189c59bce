//! Meter polling loop.
//!
//! Owns the serial transport, reads every enabled meter once per cycle and
//! feeds the readings into per-device aggregation windows. Completed windows
//! are persisted; a cancelled loop persists whatever partial windows remain.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fieldgate_core::{
    AggregationBuffer, ClientOptions, MeterClient, SerialTransport, SharedTransport, Transport,
};
use fieldgate_store::DeviceStatus;
use fieldgate_types::{AggregatedRecord, DeviceKind, MeterReading, RawSample};

use crate::config::MeterConfig;
use crate::state::{AppState, SharedStore};
use crate::supervisor::{ServiceError, ServiceResult};

/// Consecutive failures logged at warn level before the poller goes quiet.
const LOUD_FAILURES: u32 = 3;

/// Counters for one poller instance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollerStats {
    pub cycles: u64,
    pub reads: u64,
    pub failures: u64,
    /// Aggregated records written to the store.
    pub records: u64,
    /// Aggregated records lost because the store rejected them.
    pub dropped: u64,
    /// Readings whose power register was replaced with V×I, per device.
    pub substitutions: BTreeMap<String, u64>,
}

struct MeterState<T: Transport> {
    client: MeterClient<T>,
    buffer: AggregationBuffer,
    error_count: u32,
}

/// Polls the registered meters on one shared transport.
pub struct Poller<T: Transport> {
    store: SharedStore,
    bus: SharedTransport<T>,
    options: ClientOptions,
    window: Duration,
    interval: Duration,
    addresses: Vec<u8>,
    meters: BTreeMap<String, MeterState<T>>,
    stats: PollerStats,
    token: CancellationToken,
}

impl<T: Transport + 'static> Poller<T> {
    /// Create a poller that owns `transport`.
    pub fn new(store: SharedStore, transport: T, config: &MeterConfig) -> Self {
        Self {
            store,
            bus: Arc::new(Mutex::new(transport)),
            options: config.client_options(),
            window: config.aggregation_window(),
            interval: config.sampling_interval(),
            addresses: config.addresses.clone(),
            meters: BTreeMap::new(),
            stats: PollerStats::default(),
            token: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> &PollerStats {
        &self.stats
    }

    /// Run until `token` is cancelled, then flush partial windows.
    pub async fn run(mut self, token: CancellationToken) -> ServiceResult {
        self.token = token.clone();
        info!(
            "Starting meter poller (interval: {:?}, window: {:?})",
            self.interval, self.window
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            if let Err(e) = self.poll_cycle().await {
                warn!("Polling cycle failed: {}", e);
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        let flushed = self.flush_all().await;
        info!(
            cycles = self.stats.cycles,
            reads = self.stats.reads,
            failures = self.stats.failures,
            records = self.stats.records,
            dropped = self.stats.dropped,
            "Meter poller stopped, flushed {} partial window(s)",
            flushed
        );
        Ok(())
    }

    /// Poll every enabled meter once. Returns the number of records written.
    pub async fn poll_cycle(&mut self) -> fieldgate_store::Result<usize> {
        self.refresh_devices().await?;
        self.stats.cycles += 1;

        let ids: Vec<String> = self.meters.keys().cloned().collect();
        let mut written = 0;
        for id in ids {
            if self.poll_device(&id).await {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Persist every non-empty window. Returns the number of records written.
    pub async fn flush_all(&mut self) -> usize {
        let mut pending = Vec::new();
        for (id, meter) in self.meters.iter_mut() {
            if let Some(record) = meter.buffer.flush() {
                pending.push((id.clone(), record));
            }
        }

        let mut written = 0;
        for (id, record) in pending {
            if self.persist(&id, &record).await {
                written += 1;
            }
        }
        written
    }

    /// Sync the meter set with the registry.
    ///
    /// With a configured address list each address is looked up in the
    /// registry; otherwise every enabled meter is polled.
    async fn refresh_devices(&mut self) -> fieldgate_store::Result<()> {
        let devices = {
            let store = self.store.lock().await;
            if self.addresses.is_empty() {
                store.list_enabled_devices(Some(DeviceKind::Meter))?
            } else {
                let mut found = Vec::with_capacity(self.addresses.len());
                for &address in &self.addresses {
                    match store.get_device_by_address(address)? {
                        Some(stored)
                            if stored.device.enabled && stored.device.kind == DeviceKind::Meter =>
                        {
                            found.push(stored)
                        }
                        Some(stored) => {
                            debug!(address, "Device {} is not an enabled meter", stored.device.id)
                        }
                        None => debug!(address, "No device registered at address"),
                    }
                }
                found
            }
        };

        let mut wanted = BTreeMap::new();
        for stored in devices {
            let Some(address) = stored.device.address else {
                warn!("Meter {} has no protocol address, skipping", stored.device.id);
                continue;
            };
            wanted.insert(stored.device.id, (address, stored.error_count));
        }

        let removed: Vec<String> = self
            .meters
            .iter()
            .filter(|(id, meter)| {
                wanted
                    .get(*id)
                    .is_none_or(|(address, _)| *address != meter.client.address())
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in removed {
            if let Some(mut meter) = self.meters.remove(&id) {
                info!("Meter {} left the polling set", id);
                if let Some(record) = meter.buffer.flush() {
                    self.persist(&id, &record).await;
                }
            }
        }

        for (id, (address, error_count)) in wanted {
            if self.meters.contains_key(&id) {
                continue;
            }
            info!(device_id = %id, address, "Polling meter");
            self.meters.insert(
                id,
                MeterState {
                    client: MeterClient::with_options(address, Arc::clone(&self.bus), self.options),
                    buffer: AggregationBuffer::new(self.window),
                    error_count,
                },
            );
        }

        Ok(())
    }

    /// Read one meter. Returns whether a record was written.
    async fn poll_device(&mut self, id: &str) -> bool {
        let Some(meter) = self.meters.get_mut(id) else {
            return false;
        };
        let address = meter.client.address();
        self.stats.reads += 1;

        match meter.client.read_meter_until(self.token.cancelled()).await {
            Ok(reading) => {
                meter.error_count = 0;
                if reading.power_substituted {
                    let count = self.stats.substitutions.entry(id.to_string()).or_default();
                    *count += 1;
                    debug!(device_id = %id, address, total = *count, "Power substituted");
                }
                log_reading(id, address, &reading);

                meter.buffer.add_sample(RawSample::new(id, reading));
                let record = if meter.buffer.window_elapsed() {
                    meter.buffer.flush()
                } else {
                    None
                };

                let status = DeviceStatus {
                    online: Some(true),
                    last_seen: Some(OffsetDateTime::now_utc()),
                    error_count: Some(0),
                };
                if let Err(e) = self.store.lock().await.update_device_status(id, &status) {
                    warn!(device_id = %id, "Failed to update device status: {}", e);
                }

                match record {
                    Some(record) => self.persist(id, &record).await,
                    None => false,
                }
            }
            Err(fieldgate_core::Error::Cancelled) => {
                debug!(device_id = %id, address, "Read abandoned on shutdown");
                false
            }
            Err(err) => {
                meter.error_count += 1;
                let failures = meter.error_count;
                self.stats.failures += 1;

                if failures <= LOUD_FAILURES {
                    warn!(
                        device_id = %id,
                        address,
                        "Failed to read meter: {} (attempt {})",
                        err,
                        failures
                    );
                } else if failures == LOUD_FAILURES + 1 {
                    error!(
                        device_id = %id,
                        address,
                        "Failed to read meter after {} attempts, will continue trying silently",
                        failures
                    );
                } else {
                    debug!(device_id = %id, address, "Failed to read meter: {}", err);
                }

                let store = self.store.lock().await;
                let status = DeviceStatus {
                    online: Some(false),
                    error_count: Some(failures),
                    ..Default::default()
                };
                if let Err(e) = store.update_device_status(id, &status) {
                    warn!(device_id = %id, "Failed to update device status: {}", e);
                }
                if let Err(e) = store.log_device_error(
                    id,
                    err.kind(),
                    &err.to_string(),
                    err.exception_code().map(i64::from),
                    Some(&json!({ "address": address })),
                ) {
                    warn!(device_id = %id, "Failed to log device error: {}", e);
                }
                false
            }
        }
    }

    async fn persist(&mut self, id: &str, record: &AggregatedRecord) -> bool {
        match self.store.lock().await.insert_sample(id, record) {
            Ok(record_id) => {
                self.stats.records += 1;
                info!(
                    device_id = %id,
                    record_id,
                    samples = record.sample_count,
                    power_avg = record.power_avg,
                    "Stored aggregated record"
                );
                true
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!(
                    device_id = %id,
                    samples = record.sample_count,
                    "Failed to store aggregated record: {}",
                    e
                );
                false
            }
        }
    }
}

fn log_reading(id: &str, address: u8, reading: &MeterReading) {
    debug!(
        device_id = %id,
        address,
        voltage = reading.voltage,
        current = reading.current,
        power = reading.power,
        energy = reading.energy,
        "Meter reading"
    );
    if reading.alarm_high || reading.alarm_low {
        warn!(
            device_id = %id,
            address,
            high = reading.alarm_high,
            low = reading.alarm_low,
            "Meter voltage alarm raised"
        );
    }
}

/// Supervised entry point: open the serial port and poll until cancelled.
///
/// A port that fails to open is a recoverable failure; an invalid serial
/// configuration is fatal.
pub async fn run_service(state: Arc<AppState>, token: CancellationToken) -> ServiceResult {
    let config = &state.config.meters;
    let transport = match SerialTransport::open(config.serial_config()) {
        Ok(transport) => transport,
        Err(e @ fieldgate_core::Error::InvalidConfig(_)) => return Err(ServiceError::fatal(e)),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("failed to open serial port {}", config.port))
                .into());
        }
    };

    Poller::new(Arc::clone(&state.store), transport, config)
        .run(token)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::MockTransport;
    use fieldgate_core::frame::read_input_registers_response;
    use fieldgate_store::Store;
    use fieldgate_types::Device;

    fn store_with_meters(addresses: &[u8]) -> SharedStore {
        let store = Store::open_in_memory().unwrap();
        for address in addresses {
            store
                .register_device(
                    &Device::new(
                        format!("pv-{:02}", address),
                        DeviceKind::Meter,
                        format!("Meter {}", address),
                    )
                    .with_address(*address),
                )
                .unwrap();
        }
        Arc::new(Mutex::new(store))
    }

    fn config(window_secs: u64) -> MeterConfig {
        MeterConfig {
            aggregation_window_secs: window_secs,
            sampling_interval_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_fill_and_flush_window() {
        let store = store_with_meters(&[1]);
        let mut mock = MockTransport::new();
        mock.push_registers(1, &[1200, 100, 120, 0, 5000, 0, 0, 0])
            .push_registers(1, &[1250, 110, 137, 0, 5000, 0, 0, 0])
            .push_registers(1, &[1300, 120, 156, 0, 5100, 0, 0, 0]);
        let mut poller = Poller::new(Arc::clone(&store), mock, &config(10));

        assert_eq!(poller.poll_cycle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(poller.poll_cycle().await.unwrap(), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(poller.poll_cycle().await.unwrap(), 1);

        let store = store.lock().await;
        let pending = store.list_pending(DeviceKind::Meter, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["sample_count"], 3);
        assert_eq!(pending[0].payload["voltage_avg"], 12.5);
        assert_eq!(pending[0].payload["energy"], 5.1);

        let device = store.get_device("pv-01").unwrap().unwrap();
        assert!(device.online);
        assert!(device.last_seen.is_some());
        assert_eq!(poller.stats().records, 1);
        assert_eq!(poller.stats().cycles, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_meter_does_not_stop_cycle() {
        let store = store_with_meters(&[1, 2]);
        let mut mock = MockTransport::new();
        // pv-01 answers, pv-02 stays silent for every attempt
        mock.push_registers(1, &[1200, 100, 120, 0, 0, 0, 0, 0])
            .push_silence()
            .push_silence()
            .push_silence();
        let mut poller = Poller::new(Arc::clone(&store), mock, &config(60));

        poller.poll_cycle().await.unwrap();

        let store = store.lock().await;
        let good = store.get_device("pv-01").unwrap().unwrap();
        assert!(good.online);
        assert_eq!(good.error_count, 0);

        let bad = store.get_device("pv-02").unwrap().unwrap();
        assert!(!bad.online);
        assert_eq!(bad.error_count, 1);
        assert_eq!(store.count_device_errors("pv-02").unwrap(), 1);

        assert_eq!(poller.stats().reads, 2);
        assert_eq!(poller.stats().failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exception_is_logged_with_code() {
        let store = store_with_meters(&[1]);
        let mut mock = MockTransport::new();
        mock.push_exception(1, 0x04, 0x02);
        let mut poller = Poller::new(Arc::clone(&store), mock, &config(60));

        poller.poll_cycle().await.unwrap();

        // Exceptions are not retried
        assert_eq!(poller.stats().failures, 1);
        let store = store.lock().await;
        assert_eq!(store.get_device("pv-01").unwrap().unwrap().error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_filter() {
        let store = store_with_meters(&[1, 2]);
        let mut mock = MockTransport::new();
        mock.push_registers(2, &[2400, 200, 480, 0, 0, 0, 0, 0]);
        let meters = MeterConfig {
            addresses: vec![2],
            ..config(60)
        };
        let mut poller = Poller::new(Arc::clone(&store), mock, &meters);

        poller.poll_cycle().await.unwrap();

        assert_eq!(poller.stats().reads, 1);
        assert_eq!(poller.stats().failures, 0);
        let store = store.lock().await;
        assert!(store.get_device("pv-02").unwrap().unwrap().online);
        assert!(!store.get_device("pv-01").unwrap().unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_list_uses_registry_lookup() {
        let store = store_with_meters(&[1, 2, 3]);
        {
            let store = store.lock().await;
            let mut device = store.get_device("pv-03").unwrap().unwrap().device;
            device.enabled = false;
            store.register_device(&device).unwrap();
        }
        let mut mock = MockTransport::new();
        mock.push_registers(2, &[2400, 200, 480, 0, 0, 0, 0, 0]);
        let meters = MeterConfig {
            // 3 is disabled and 9 is not registered
            addresses: vec![2, 3, 9],
            ..config(60)
        };
        let mut poller = Poller::new(Arc::clone(&store), mock, &meters);

        poller.poll_cycle().await.unwrap();

        assert_eq!(poller.stats().reads, 1);
        assert_eq!(poller.stats().failures, 0);
        assert!(store.lock().await.get_device("pv-02").unwrap().unwrap().online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_drops_only_that_record() {
        let store = store_with_meters(&[1]);
        let mut poller = Poller::new(Arc::clone(&store), MockTransport::new(), &config(60));
        let reading = MeterReading::from_registers(&[1200, 100, 120, 0, 0, 0, 0, 0]).unwrap();

        let mut buffer = AggregationBuffer::new(Duration::from_secs(60));
        buffer.add_sample(RawSample::new("pv-99", reading));
        let orphan = buffer.flush().unwrap();
        assert!(!poller.persist("pv-99", &orphan).await);

        buffer.add_sample(RawSample::new("pv-01", reading));
        let record = buffer.flush().unwrap();
        assert!(poller.persist("pv-01", &record).await);

        assert_eq!(poller.stats().dropped, 1);
        assert_eq!(poller.stats().records, 1);
        assert_eq!(store.lock().await.count_pending(None).unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_slow_read() {
        let store = store_with_meters(&[1]);
        // a silent meter keeps the line busy through every retry
        let poller = Poller::new(Arc::clone(&store), MockTransport::new(), &config(300));
        let token = CancellationToken::new();

        let task = tokio::spawn(poller.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        let store = store.lock().await;
        // a shutdown is not a device failure
        assert_eq!(store.get_device("pv-01").unwrap().unwrap().error_count, 0);
        assert_eq!(store.count_device_errors("pv-01").unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_substitution_is_counted() {
        let store = store_with_meters(&[1]);
        let mut mock = MockTransport::new();
        mock.push_registers(1, &[1200, 100, 5000, 0, 0, 0, 0, 0]);
        let mut poller = Poller::new(Arc::clone(&store), mock, &config(60));

        poller.poll_cycle().await.unwrap();

        assert_eq!(poller.stats().substitutions.get("pv-01"), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_flushes_partial_window() {
        let store = store_with_meters(&[1]);
        let mut mock = MockTransport::new();
        mock.reply_always(read_input_registers_response(
            1,
            &[1200, 100, 120, 0, 5000, 0, 0, 0],
        ));
        let poller = Poller::new(Arc::clone(&store), mock, &config(300));
        let token = CancellationToken::new();

        let task = tokio::spawn(poller.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        let store = store.lock().await;
        let pending = store.list_pending(DeviceKind::Meter, 10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["sample_count"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_meter_leaves_polling_set() {
        let store = store_with_meters(&[1]);
        let mut mock = MockTransport::new();
        mock.push_registers(1, &[1200, 100, 120, 0, 0, 0, 0, 0]);
        let mut poller = Poller::new(Arc::clone(&store), mock, &config(300));

        poller.poll_cycle().await.unwrap();

        {
            let store = store.lock().await;
            let mut device = store.get_device("pv-01").unwrap().unwrap().device;
            device.enabled = false;
            store.register_device(&device).unwrap();
        }
        poller.poll_cycle().await.unwrap();

        // The partial window was persisted when the meter dropped out
        assert_eq!(poller.stats().reads, 1);
        assert_eq!(poller.stats().records, 1);
    }
}
