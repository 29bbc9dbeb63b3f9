//! # Power Module
//!
//! Powers the receiver hardware up and down in causal order.
//!
//! ```text
//!  power_on:   relay ON ──▶ wait USB present ──▶ settle ──▶ start service ──▶ wait active
//!  power_off:  stop service ──▶ wait inactive ──▶ settle ──▶ relay OFF ──▶ wait USB absent
//!
//!  Unknown / PoweredOff / PoweredOn / Faulted ──[power_on]──▶ PoweringOn ──▶ PoweredOn | Faulted
//!  Unknown / PoweredOff / PoweredOn / Faulted ──[power_off]─▶ PoweringOff ─▶ PoweredOff | Faulted
//! ```
//!
//! The device must be present before the service can start, and the service
//! must be gone before the device disappears. Every wait is bounded; a
//! timeout leaves the sequencer in [`PowerState::Faulted`] and is returned
//! to the caller. Nothing is retried within one call.

pub mod probes;
pub mod relay;

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::config::PowerConfig;
use probes::{DeviceProbes, ServiceStatus};
use relay::{PowerRelay, RelayLevel};

/// Power sequencing failures
#[derive(Debug, Error)]
pub enum PowerError {
    #[error("Service did not stop in time ({0:?})")]
    ServiceStopTimeout(Duration),

    #[error("Device did not disconnect in time ({0:?}), check relay wiring")]
    DeviceDisconnectTimeout(Duration),

    #[error("Device did not connect in time ({0:?})")]
    DeviceConnectTimeout(Duration),

    #[error("Service did not start in time ({0:?})")]
    ServiceStartTimeout(Duration),

    #[error("Relay error: {0}")]
    Relay(#[source] std::io::Error),
}

impl PowerError {
    pub fn is_timeout(&self) -> bool {
        !matches!(self, PowerError::Relay(_))
    }
}

/// State of the receiver hardware as seen by the sequencer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    Unknown,
    PoweredOff,
    PoweringOn,
    PoweredOn,
    PoweringOff,
    Faulted,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PowerState::Unknown => "unknown",
            PowerState::PoweredOff => "powered_off",
            PowerState::PoweringOn => "powering_on",
            PowerState::PoweredOn => "powered_on",
            PowerState::PoweringOff => "powering_off",
            PowerState::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Poll cadence and time budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerTimings {
    pub poll_interval: Duration,
    /// Pause between the service and relay steps
    pub settle: Duration,
    /// Budget for every power-off wait
    pub service_timeout: Duration,
    /// Budget for every power-on wait
    pub device_timeout: Duration,
}

impl Default for PowerTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            settle: Duration::from_millis(200),
            service_timeout: Duration::from_millis(10_000),
            device_timeout: Duration::from_millis(15_000),
        }
    }
}

impl From<&PowerConfig> for PowerTimings {
    fn from(config: &PowerConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            settle: Duration::from_millis(config.settle_ms),
            service_timeout: Duration::from_millis(config.service_timeout_ms),
            device_timeout: Duration::from_millis(config.device_timeout_ms),
        }
    }
}

/// Power sequencing state machine.
///
/// Operations are serialized: a second call waits for the first to finish.
/// [`current_state`](Self::current_state) never waits.
pub struct PowerSequencer {
    probes: Arc<dyn DeviceProbes>,
    relay: Arc<dyn PowerRelay>,
    timings: PowerTimings,
    state: RwLock<PowerState>,
    operation: Mutex<()>,
}

impl fmt::Debug for PowerSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PowerSequencer")
            .field("timings", &self.timings)
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl PowerSequencer {
    pub fn new(
        probes: Arc<dyn DeviceProbes>,
        relay: Arc<dyn PowerRelay>,
        timings: PowerTimings,
    ) -> Self {
        Self {
            probes,
            relay,
            timings,
            state: RwLock::new(PowerState::Unknown),
            operation: Mutex::new(()),
        }
    }

    /// Device probes, for read-only queries such as temperature
    pub fn probes(&self) -> &Arc<dyn DeviceProbes> {
        &self.probes
    }

    pub fn current_state(&self) -> PowerState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: PowerState) {
        let mut current = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            info!("Power state {} -> {}", *current, state);
            *current = state;
        }
    }

    fn fail(&self, error: PowerError) -> Result<(), PowerError> {
        warn!("Power sequence failed: {}", error);
        self.set_state(PowerState::Faulted);
        Err(error)
    }

    /// Resolve [`PowerState::Unknown`] from the probes.
    ///
    /// Only runs when no operation is in flight and both signals agree.
    pub async fn probe_state(&self) -> PowerState {
        let Ok(_guard) = self.operation.try_lock() else {
            return self.current_state();
        };
        if self.current_state() != PowerState::Unknown {
            return self.current_state();
        }

        let present = self.probes.is_device_enumerated().await;
        let status = self.probes.service_status().await;
        match (present, status) {
            (true, ServiceStatus::Active) => self.set_state(PowerState::PoweredOn),
            (false, ServiceStatus::Inactive) => self.set_state(PowerState::PoweredOff),
            _ => {}
        }
        self.current_state()
    }

    /// Stop the service, then cut power to the device
    ///
    /// # Errors
    ///
    /// - `ServiceStopTimeout`: the service stayed up past `service_timeout`
    /// - `DeviceDisconnectTimeout`: the device stayed enumerated after the relay opened
    /// - `Relay`: the relay could not be driven
    pub async fn power_off(&self) -> Result<(), PowerError> {
        let _guard = self.operation.lock().await;
        self.set_state(PowerState::PoweringOff);
        let timeout = self.timings.service_timeout;
        let probes = &self.probes;

        if let Err(e) = probes.stop_service().await {
            warn!("Stop request for the receiver service failed: {}", e);
        }
        let stopped = self
            .wait_for(timeout, || async move {
                probes.service_status().await == ServiceStatus::Inactive
            })
            .await;
        if !stopped {
            return self.fail(PowerError::ServiceStopTimeout(timeout));
        }

        sleep(self.timings.settle).await;

        if let Err(e) = self.relay.set_level(RelayLevel::Off).await {
            return self.fail(PowerError::Relay(e));
        }

        let disconnected = self
            .wait_for(timeout, || async move { !probes.is_device_enumerated().await })
            .await;
        if !disconnected {
            return self.fail(PowerError::DeviceDisconnectTimeout(timeout));
        }

        self.set_state(PowerState::PoweredOff);
        Ok(())
    }

    /// Power the device, then start the service
    ///
    /// # Errors
    ///
    /// - `DeviceConnectTimeout`: the device never enumerated; the service is not touched
    /// - `ServiceStartTimeout`: the service did not become active
    /// - `Relay`: the relay could not be driven
    pub async fn power_on(&self) -> Result<(), PowerError> {
        let _guard = self.operation.lock().await;
        self.set_state(PowerState::PoweringOn);
        let timeout = self.timings.device_timeout;
        let probes = &self.probes;

        if let Err(e) = self.relay.set_level(RelayLevel::On).await {
            return self.fail(PowerError::Relay(e));
        }

        let connected = self
            .wait_for(timeout, || async move { probes.is_device_enumerated().await })
            .await;
        if !connected {
            return self.fail(PowerError::DeviceConnectTimeout(timeout));
        }

        sleep(self.timings.settle).await;

        if let Err(e) = probes.start_service().await {
            warn!("Start request for the receiver service failed: {}", e);
        }
        let started = self
            .wait_for(timeout, || async move {
                probes.service_status().await == ServiceStatus::Active
            })
            .await;
        if !started {
            return self.fail(PowerError::ServiceStartTimeout(timeout));
        }

        self.set_state(PowerState::PoweredOn);
        Ok(())
    }

    /// Poll `check` until it holds or `timeout` elapses.
    ///
    /// The check runs once more at the deadline, so a timeout is never
    /// reported before the full budget has passed.
    async fn wait_for<F, Fut>(&self, timeout: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if check().await {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.timings.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use probes::MockDeviceProbes;
    use relay::MockPowerRelay;
    use std::io;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        StopService,
        StartService,
        Relay(RelayLevel),
        ServiceStatus(ServiceStatus),
        DeviceCheck(bool),
    }

    /// Simulated receiver: the device follows the relay and the service
    /// follows start/stop requests, each after a few polls.
    struct FakeHardware {
        events: StdMutex<Vec<Event>>,
        inner: StdMutex<FakeState>,
        polls_to_settle: u32,
        device_follows_relay: bool,
        service_follows_requests: bool,
    }

    struct FakeState {
        relay_on: bool,
        device_present: bool,
        device_pending: u32,
        service_active: bool,
        service_wanted: bool,
        service_pending: u32,
    }

    impl FakeHardware {
        fn new(powered: bool) -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
                inner: StdMutex::new(FakeState {
                    relay_on: powered,
                    device_present: powered,
                    device_pending: 0,
                    service_active: powered,
                    service_wanted: powered,
                    service_pending: 0,
                }),
                polls_to_settle: 3,
                device_follows_relay: true,
                service_follows_requests: true,
            })
        }

        fn with_stuck_device(powered: bool) -> Arc<Self> {
            let mut fake = Arc::try_unwrap(Self::new(powered)).ok().unwrap();
            fake.device_follows_relay = false;
            Arc::new(fake)
        }

        fn with_stuck_service(powered: bool) -> Arc<Self> {
            let mut fake = Arc::try_unwrap(Self::new(powered)).ok().unwrap();
            fake.service_follows_requests = false;
            Arc::new(fake)
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn record(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn position(&self, event: &Event) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("{:?} never happened", event))
        }
    }

    #[async_trait::async_trait]
    impl DeviceProbes for FakeHardware {
        async fn is_device_enumerated(&self) -> bool {
            let present = {
                let mut s = self.inner.lock().unwrap();
                if self.device_follows_relay && s.device_present != s.relay_on {
                    if s.device_pending == 0 {
                        s.device_present = s.relay_on;
                    } else {
                        s.device_pending -= 1;
                    }
                }
                s.device_present
            };
            self.record(Event::DeviceCheck(present));
            present
        }

        async fn service_status(&self) -> ServiceStatus {
            let status = {
                let mut s = self.inner.lock().unwrap();
                if self.service_follows_requests && s.service_active != s.service_wanted {
                    if s.service_pending == 0 {
                        s.service_active = s.service_wanted;
                    } else {
                        s.service_pending -= 1;
                    }
                }
                if s.service_active {
                    ServiceStatus::Active
                } else {
                    ServiceStatus::Inactive
                }
            };
            self.record(Event::ServiceStatus(status));
            status
        }

        async fn start_service(&self) -> io::Result<()> {
            self.record(Event::StartService);
            let mut s = self.inner.lock().unwrap();
            s.service_wanted = true;
            s.service_pending = self.polls_to_settle;
            Ok(())
        }

        async fn stop_service(&self) -> io::Result<()> {
            self.record(Event::StopService);
            let mut s = self.inner.lock().unwrap();
            s.service_wanted = false;
            s.service_pending = self.polls_to_settle;
            Ok(())
        }

        async fn read_temperature(&self) -> Option<i32> {
            Some(45)
        }

        async fn reboot(&self) -> io::Result<()> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl PowerRelay for FakeHardware {
        async fn set_level(&self, level: RelayLevel) -> io::Result<()> {
            self.record(Event::Relay(level));
            let mut s = self.inner.lock().unwrap();
            s.relay_on = level == RelayLevel::On;
            s.device_pending = self.polls_to_settle;
            Ok(())
        }
    }

    fn sequencer(fake: &Arc<FakeHardware>) -> PowerSequencer {
        PowerSequencer::new(fake.clone(), fake.clone(), PowerTimings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_success() {
        let fake = FakeHardware::new(true);
        let seq = sequencer(&fake);

        seq.power_off().await.unwrap();

        assert_eq!(seq.current_state(), PowerState::PoweredOff);
        assert_eq!(fake.events().last(), Some(&Event::DeviceCheck(false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_stops_service_before_relay() {
        let fake = FakeHardware::new(true);
        let seq = sequencer(&fake);

        seq.power_off().await.unwrap();

        let stop = fake.position(&Event::StopService);
        let relay_off = fake.position(&Event::Relay(RelayLevel::Off));
        let inactive = fake.position(&Event::ServiceStatus(ServiceStatus::Inactive));
        assert!(stop < relay_off);
        assert!(inactive < relay_off, "relay toggled before the service stopped");

        // every status poll before the relay saw the service still up, except the last
        let statuses_before_relay: Vec<_> = fake.events()[..relay_off]
            .iter()
            .filter(|e| matches!(e, Event::ServiceStatus(_)))
            .cloned()
            .collect();
        assert!(statuses_before_relay.len() > 1);
        assert_eq!(
            statuses_before_relay.last(),
            Some(&Event::ServiceStatus(ServiceStatus::Inactive))
        );
        assert!(statuses_before_relay[..statuses_before_relay.len() - 1]
            .iter()
            .all(|e| *e == Event::ServiceStatus(ServiceStatus::Active)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_service_timeout_never_touches_relay() {
        let fake = FakeHardware::with_stuck_service(true);
        let seq = sequencer(&fake);
        let start = Instant::now();

        let err = seq.power_off().await.unwrap_err();

        assert!(matches!(err, PowerError::ServiceStopTimeout(_)));
        assert!(err.to_string().contains("did not stop in time"));
        assert!(start.elapsed() >= Duration::from_millis(10_000));
        assert_eq!(seq.current_state(), PowerState::Faulted);
        assert!(!fake.events().iter().any(|e| matches!(e, Event::Relay(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_device_disconnect_timeout() {
        let fake = FakeHardware::with_stuck_device(true);
        let seq = sequencer(&fake);

        let err = seq.power_off().await.unwrap_err();

        assert!(matches!(err, PowerError::DeviceDisconnectTimeout(_)));
        assert!(err.to_string().contains("check relay wiring"));
        assert_eq!(seq.current_state(), PowerState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_success_order() {
        let fake = FakeHardware::new(false);
        let seq = sequencer(&fake);

        seq.power_on().await.unwrap();

        assert_eq!(seq.current_state(), PowerState::PoweredOn);
        let relay_on = fake.position(&Event::Relay(RelayLevel::On));
        let present = fake.position(&Event::DeviceCheck(true));
        let start = fake.position(&Event::StartService);
        let active = fake.position(&Event::ServiceStatus(ServiceStatus::Active));
        assert!(relay_on < present);
        assert!(present < start);
        assert!(start < active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_device_timeout_with_mocks() {
        let mut probes = MockDeviceProbes::new();
        probes.expect_is_device_enumerated().returning(|| false);
        probes.expect_start_service().never();
        probes.expect_service_status().never();

        let mut relay = MockPowerRelay::new();
        relay
            .expect_set_level()
            .with(eq(RelayLevel::On))
            .times(1)
            .returning(|_| Ok(()));

        let seq = PowerSequencer::new(Arc::new(probes), Arc::new(relay), PowerTimings::default());
        let start = Instant::now();

        let err = seq.power_on().await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, PowerError::DeviceConnectTimeout(_)));
        assert!(err.is_timeout());
        assert!(elapsed >= Duration::from_millis(15_000), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(15_000) + Duration::from_millis(100));
        assert_eq!(seq.current_state(), PowerState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_on_service_start_timeout() {
        let fake = FakeHardware::with_stuck_service(false);
        let seq = sequencer(&fake);

        let err = seq.power_on().await.unwrap_err();

        assert!(matches!(err, PowerError::ServiceStartTimeout(_)));
        assert_eq!(seq.current_state(), PowerState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_failure_faults() {
        let mut probes = MockDeviceProbes::new();
        probes.expect_is_device_enumerated().never();
        let mut relay = MockPowerRelay::new();
        relay
            .expect_set_level()
            .returning(|_| Err(io::Error::new(io::ErrorKind::PermissionDenied, "gpio")));

        let seq = PowerSequencer::new(Arc::new(probes), Arc::new(relay), PowerTimings::default());

        let err = seq.power_on().await.unwrap_err();
        assert!(matches!(err, PowerError::Relay(_)));
        assert!(!err.is_timeout());
        assert_eq!(seq.current_state(), PowerState::Faulted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faulted_is_retryable() {
        let fake = FakeHardware::with_stuck_service(true);
        let seq = sequencer(&fake);
        assert!(seq.power_off().await.is_err());
        assert_eq!(seq.current_state(), PowerState::Faulted);

        // service is still running, so powering on succeeds from Faulted
        seq.power_on().await.unwrap();
        assert_eq!(seq.current_state(), PowerState::PoweredOn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_are_serialized() {
        let fake = FakeHardware::new(true);
        let seq = Arc::new(sequencer(&fake));

        let off = tokio::spawn({
            let seq = seq.clone();
            async move { seq.power_off().await }
        });
        let on = tokio::spawn({
            let seq = seq.clone();
            async move {
                tokio::task::yield_now().await;
                seq.power_on().await
            }
        });
        off.await.unwrap().unwrap();
        on.await.unwrap().unwrap();

        // the second sequence starts only after the first finished
        let relay_off = fake.position(&Event::Relay(RelayLevel::Off));
        let first_absent = fake.position(&Event::DeviceCheck(false));
        let relay_on = fake.position(&Event::Relay(RelayLevel::On));
        let start = fake.position(&Event::StartService);
        assert!(relay_off < first_absent);
        assert!(first_absent < relay_on);
        assert!(relay_on < start);
        assert_eq!(seq.current_state(), PowerState::PoweredOn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_state_resolves_unknown() {
        let fake = FakeHardware::new(true);
        let seq = sequencer(&fake);
        assert_eq!(seq.current_state(), PowerState::Unknown);

        assert_eq!(seq.probe_state().await, PowerState::PoweredOn);

        let fake = FakeHardware::new(false);
        let seq = sequencer(&fake);
        assert_eq!(seq.probe_state().await, PowerState::PoweredOff);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_state_disagreeing_signals_stay_unknown() {
        let mut probes = MockDeviceProbes::new();
        probes.expect_is_device_enumerated().returning(|| true);
        probes.expect_service_status().returning(|| ServiceStatus::Unknown);
        let seq = PowerSequencer::new(
            Arc::new(probes),
            Arc::new(MockPowerRelay::new()),
            PowerTimings::default(),
        );

        assert_eq!(seq.probe_state().await, PowerState::Unknown);
    }

    #[test]
    fn test_timings_from_config() {
        let timings = PowerTimings::from(&PowerConfig::default());
        assert_eq!(timings, PowerTimings::default());
    }

    #[test]
    fn test_state_display_matches_serde() {
        for state in [
            PowerState::Unknown,
            PowerState::PoweredOff,
            PowerState::PoweringOn,
            PowerState::PoweredOn,
            PowerState::PoweringOff,
            PowerState::Faulted,
        ] {
            assert_eq!(
                serde_json::to_value(state).unwrap(),
                serde_json::Value::String(state.to_string())
            );
        }
    }
}
