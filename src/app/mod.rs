//! Application driver
//!
//! Provisions the modem, reacts to its events and sends the periodic
//! uplink. Two states: not joined and joined. Uplinks only go out while
//! joined, either from an elapsed-time check on every loop pass or from the
//! engine's alarm.

pub mod payload;

use tracing::{debug, error, info, warn};

use crate::api::Modem;
use crate::config::{NetworkConfig, UplinkConfig, UplinkTrigger};
use crate::modem::keys::DeviceIdentity;
use crate::modem::{self, Event, EventKind, ModemEngine, TxStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    NotJoined,
    Joined,
}

/// Counters kept by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverStats {
    pub state: NetworkState,
    pub uplinks_sent: u64,
    pub downlinks_received: u64,
}

pub struct AppDriver {
    settings: UplinkConfig,
    state: NetworkState,
    last_send_ms: u64,
    packet_counter: u32,
    uplinks_sent: u64,
    downlinks_received: u64,
}

/// Push the network configuration and credentials, then request a join.
///
/// Setter failures are logged and the sequence carries on, so a refused
/// optional setting never blocks the join. Returns the join request result.
pub fn provision<E: ModemEngine>(
    modem: &mut Modem<E>,
    identity: &DeviceIdentity,
    network: &NetworkConfig,
) -> modem::Result {
    log_step("modem init", modem.init());

    let mut lorawan = modem.lorawan();
    log_step("region", lorawan.set_region(network.region));
    log_step("class", lorawan.set_class(network.class));
    log_step("ADR profile", lorawan.set_adr_profile(&network.adr));
    log_step("LBT", lorawan.set_lbt(&network.lbt));
    log_step("CSMA", lorawan.set_csma(network.csma));
    log_step("DevEUI", lorawan.set_dev_eui(&identity.dev_eui));
    log_step("JoinEUI", lorawan.set_join_eui(&identity.join_eui));
    log_step("AppKey", lorawan.set_app_key(&identity.app_key));
    log_step("NwkKey", lorawan.set_nwk_key(&identity.nwk_key));

    info!("Joining {} network as {:?}", network.region, identity);
    let ret = lorawan.join();
    if let Err(e) = &ret {
        error!("Join request refused: {}", e);
    }
    ret
}

fn log_step(what: &str, ret: modem::Result) {
    if let Err(e) = ret {
        error!("Failed to set {}: {} (code {})", what, e, e.code());
    }
}

impl AppDriver {
    pub fn new(settings: UplinkConfig) -> Self {
        Self {
            settings,
            state: NetworkState::NotJoined,
            last_send_ms: 0,
            packet_counter: 0,
            uplinks_sent: 0,
            downlinks_received: 0,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn state(&self) -> NetworkState {
        self.state
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn packet_counter(&self) -> u32 {
        self.packet_counter
    }

    pub fn stats(&self) -> DriverStats {
        DriverStats {
            state: self.state,
            uplinks_sent: self.uplinks_sent,
            downlinks_received: self.downlinks_received,
        }
    }

    /// React to one engine event observed at `now_ms`
    pub fn handle_event<E: ModemEngine>(
        &mut self,
        modem: &mut Modem<E>,
        event: Event,
        now_ms: u64,
    ) {
        debug!("Event: {} ({} pending)", event.kind, event.pending);

        match event.kind {
            EventKind::Reset { count } => {
                if self.state == NetworkState::Joined {
                    warn!("Modem reset while joined (count={}), session lost", count);
                } else {
                    info!("Modem reset (count={})", count);
                }
                self.state = NetworkState::NotJoined;
            }
            EventKind::Joined => {
                info!("Network joined successfully");
                self.state = NetworkState::Joined;
                self.last_send_ms = now_ms;
                if self.settings.trigger == UplinkTrigger::Alarm {
                    self.arm_alarm(modem, self.settings.first_uplink_delay_s);
                }
            }
            EventKind::JoinFail => {
                // The engine keeps running the join procedure on its own
                warn!("Join attempt failed");
                self.state = NetworkState::NotJoined;
            }
            EventKind::TxDone(TxStatus::NotSent) => {
                warn!("Uplink was not sent");
            }
            EventKind::TxDone(status) => {
                info!("Transmission completed ({:?})", status);
            }
            EventKind::DownlinkData => self.fetch_downlinks(modem),
            EventKind::Alarm => {
                if self.settings.trigger != UplinkTrigger::Alarm {
                    debug!("Ignoring alarm, uplinks are timer driven");
                    return;
                }
                if self.state == NetworkState::Joined {
                    self.send_periodic(modem);
                    self.arm_alarm(modem, self.alarm_interval_s());
                } else {
                    debug!("Alarm while not joined, not re-arming");
                }
            }
        }
    }

    /// Timer-driven uplink check; call once per loop pass
    pub fn tick<E: ModemEngine>(&mut self, modem: &mut Modem<E>, now_ms: u64) {
        if self.settings.trigger != UplinkTrigger::Timer || self.state != NetworkState::Joined {
            return;
        }
        if now_ms.saturating_sub(self.last_send_ms) >= self.settings.interval_ms {
            self.send_periodic(modem);
            self.last_send_ms = now_ms;
        }
    }

    fn send_periodic<E: ModemEngine>(&mut self, modem: &mut Modem<E>) {
        if self.state != NetworkState::Joined {
            info!("Network not joined, skipping data send");
            return;
        }

        let payload = payload::counter_payload(self.packet_counter);
        match modem
            .lorawan()
            .send(&payload, self.settings.port, self.settings.confirmed)
        {
            Ok(()) => {
                info!(
                    "Sent packet #{} on port {}: {}",
                    self.packet_counter,
                    self.settings.port,
                    hex::encode_upper(&payload)
                );
                self.packet_counter = self.packet_counter.wrapping_add(1);
                self.uplinks_sent += 1;
            }
            Err(e) => {
                error!("Failed to send packet #{}: {}", self.packet_counter, e);
            }
        }
    }

    fn fetch_downlinks<E: ModemEngine>(&mut self, modem: &mut Modem<E>) {
        match modem.lorawan().drain_downlinks() {
            Ok(downlinks) => {
                for downlink in downlinks {
                    self.downlinks_received += 1;
                    info!(
                        "Downlink at {}: port={} RSSI={} dBm SNR={} dB window={:?} payload={}",
                        downlink.received_at.format("%H:%M:%S%.3f"),
                        downlink.metadata.fport,
                        downlink.metadata.rssi,
                        downlink.metadata.snr,
                        downlink.metadata.window,
                        hex::encode_upper(&downlink.payload)
                    );
                }
            }
            Err(e) => {
                error!("Failed to get downlink data: {}", e);
            }
        }
    }

    fn arm_alarm<E: ModemEngine>(&self, modem: &mut Modem<E>, seconds: u32) {
        if let Err(e) = modem.lorawan().start_alarm(seconds) {
            error!("Failed to arm uplink alarm: {}", e);
        }
    }

    fn alarm_interval_s(&self) -> u32 {
        self.settings.interval_ms.div_ceil(1000).clamp(1, u32::MAX as u64) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::sim_modem;
    use crate::clock::{Clock, ManualClock};
    use crate::modem::sim::SimulatedModem;
    use crate::modem::{DownlinkMetadata, ModemError, RxWindow};
    use tokio::sync::mpsc;

    struct Harness {
        modem: Modem<SimulatedModem>,
        clock: ManualClock,
        events: mpsc::Receiver<Event>,
        driver: AppDriver,
    }

    impl Harness {
        fn new(settings: UplinkConfig) -> Self {
            let (mut modem, clock) = sim_modem();
            let (tx, events) = mpsc::channel(32);
            modem.set_event_subscriber(Some(tx));
            Self {
                modem,
                clock,
                events,
                driver: AppDriver::new(settings),
            }
        }

        /// One loop pass: pump, dispatch, tick
        fn pass(&mut self) {
            self.modem.run_engine();
            let now = self.clock.now_ms();
            while let Ok(event) = self.events.try_recv() {
                self.driver.handle_event(&mut self.modem, event, now);
            }
            self.driver.tick(&mut self.modem, now);
        }

        /// Advance simulated time in 100 ms loop passes
        fn run_for(&mut self, ms: u64) {
            for _ in 0..ms / 100 {
                self.clock.advance(100);
                self.pass();
            }
        }

        fn uplinks(&self) -> usize {
            self.modem.engine().uplink_count() as usize
        }
    }

    fn metadata() -> DownlinkMetadata {
        DownlinkMetadata {
            rssi: -80,
            snr: 3,
            window: RxWindow::Rx1,
            fport: 2,
        }
    }

    #[test]
    fn test_reset_joined_txdone_then_ten_seconds_sends_once() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Reset { count: 2 });
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.modem
            .engine_mut()
            .push_event(EventKind::TxDone(TxStatus::Sent));
        h.pass();
        assert_eq!(h.driver.state(), NetworkState::Joined);
        assert_eq!(h.uplinks(), 0);

        h.run_for(10_000);
        assert_eq!(h.uplinks(), 1);
        assert_eq!(h.driver.packet_counter(), 1);
        assert_eq!(h.modem.engine().uplinks()[0].payload, payload::counter_payload(0));
        assert_eq!(h.modem.engine().uplinks()[0].fport, 2);
    }

    #[test]
    fn test_no_uplinks_while_not_joined() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.pass();
        h.run_for(30_000);
        assert_eq!(h.driver.state(), NetworkState::NotJoined);
        assert_eq!(h.uplinks(), 0);
    }

    #[test]
    fn test_join_fail_stops_uplinks() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.pass();
        h.run_for(10_000);
        assert_eq!(h.uplinks(), 1);

        h.modem.engine_mut().push_event(EventKind::JoinFail);
        h.pass();
        assert_eq!(h.driver.state(), NetworkState::NotJoined);
        h.run_for(30_000);
        assert_eq!(h.uplinks(), 1);
    }

    #[test]
    fn test_uplink_cancelled_by_leave_is_not_counted_twice() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.pass();
        h.run_for(10_000);
        assert_eq!(h.uplinks(), 1);

        // The uplink is still on air when the session goes away
        h.modem.lorawan().leave().unwrap();
        h.pass();
        assert_eq!(h.driver.stats().uplinks_sent, 1);
        assert_eq!(h.driver.packet_counter(), 1);

        // Sends are refused until the next join; the counter holds
        h.run_for(10_000);
        assert_eq!(h.uplinks(), 1);
        assert_eq!(h.driver.packet_counter(), 1);
    }

    #[test]
    fn test_join_fail_before_join_stays_not_joined() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().push_event(EventKind::JoinFail);
        h.pass();
        assert_eq!(h.driver.state(), NetworkState::NotJoined);
    }

    #[test]
    fn test_counter_advances_only_on_success() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.pass();

        h.clock.advance(10_000);
        h.modem.engine_mut().fail_next(ModemError::Busy);
        h.pass();
        assert_eq!(h.uplinks(), 0);
        assert_eq!(h.driver.packet_counter(), 0);

        // No retry until the next interval elapses
        h.run_for(9_900);
        assert_eq!(h.uplinks(), 0);
        h.run_for(100);
        assert_eq!(h.uplinks(), 1);
        assert_eq!(h.driver.packet_counter(), 1);
        assert_eq!(h.driver.stats().uplinks_sent, 1);
    }

    #[test]
    fn test_downlink_event_drains_queue() {
        let mut h = Harness::new(UplinkConfig::default());
        for i in 0..3u8 {
            h.modem.engine_mut().queue_downlink(&[i], metadata());
        }
        h.modem.engine_mut().push_event(EventKind::DownlinkData);
        h.pass();

        assert_eq!(h.driver.stats().downlinks_received, 3);
        assert_eq!(
            h.modem.lorawan().get_downlink_data(),
            Err(ModemError::Fail)
        );
    }

    #[test]
    fn test_alarm_trigger_sends_and_rearms() {
        let settings = UplinkConfig {
            trigger: UplinkTrigger::Alarm,
            interval_ms: 20_000,
            first_uplink_delay_s: 5,
            ..UplinkConfig::default()
        };
        let mut h = Harness::new(settings);
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.pass();
        assert!(h.modem.engine().alarm_armed());

        h.run_for(5_000);
        assert_eq!(h.uplinks(), 1);
        assert!(h.modem.engine().alarm_armed());

        h.run_for(19_900);
        assert_eq!(h.uplinks(), 1);
        h.run_for(100);
        assert_eq!(h.uplinks(), 2);
    }

    #[test]
    fn test_alarm_ignored_with_timer_trigger() {
        let mut h = Harness::new(UplinkConfig::default());
        h.modem.engine_mut().set_joined(true);
        h.modem.engine_mut().push_event(EventKind::Joined);
        h.modem.engine_mut().push_event(EventKind::Alarm);
        h.pass();
        assert_eq!(h.uplinks(), 0);
        assert!(!h.modem.engine().alarm_armed());
    }

    #[test]
    fn test_provision_then_join_over_the_air() {
        let mut h = Harness::new(UplinkConfig::default());
        let identity = DeviceIdentity {
            dev_eui: [1; 8],
            join_eui: [2; 8],
            app_key: [3; 16],
            nwk_key: [4; 16],
        };
        let network = NetworkConfig {
            region: crate::modem::Region::US915,
            ..NetworkConfig::default()
        };
        tokio_test::assert_ok!(provision(&mut h.modem, &identity, &network));
        assert_eq!(h.modem.engine().region(), crate::modem::Region::US915);
        assert_eq!(h.modem.engine().nwk_key(), Some([4; 16]));

        h.pass();
        assert_eq!(h.driver.state(), NetworkState::NotJoined);
        h.run_for(5_000);
        assert_eq!(h.driver.state(), NetworkState::Joined);
        h.run_for(10_000);
        assert_eq!(h.uplinks(), 1);
    }

    #[test]
    fn test_provision_continues_past_refused_setting() {
        let mut h = Harness::new(UplinkConfig::default());
        let identity = DeviceIdentity {
            dev_eui: [1; 8],
            join_eui: [2; 8],
            app_key: [3; 16],
            nwk_key: [3; 16],
        };
        let network = NetworkConfig {
            lbt: crate::modem::LbtConfig {
                enabled: true,
                listen_duration_ms: 0,
                ..Default::default()
            },
            ..NetworkConfig::default()
        };
        tokio_test::assert_ok!(provision(&mut h.modem, &identity, &network));
        assert_eq!(h.modem.engine().dev_eui(), Some([1; 8]));
    }

    #[test]
    fn test_alarm_interval_rounds_up() {
        let driver = AppDriver::new(UplinkConfig {
            interval_ms: 1_500,
            ..UplinkConfig::default()
        });
        assert_eq!(driver.alarm_interval_s(), 2);
        let driver = AppDriver::new(UplinkConfig {
            interval_ms: 0,
            ..UplinkConfig::default()
        });
        assert_eq!(driver.alarm_interval_s(), 1);
    }
}
