//! Software stand-in for the Basic Modem engine
//!
//! Follows the engine contract closely enough to run the node on a host:
//! credentials are stored, joins complete (or fail) after a configurable
//! delay, uplinks produce a TxDone once their airtime has elapsed, the
//! network may answer with downlinks, and the one-shot alarm fires on time.
//! There is no radio and no MAC; timing comes from the shared [`Clock`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, trace};

use super::keys::{AesKey, Eui};
use super::{
    AdrProfile, DeviceClass, Downlink, DownlinkMetadata, Event, EventKind, LbtConfig, ModemError,
    Region, Result, RxWindow, StatusMask, TxStatus, MAX_DOWNLINK_LEN, MAX_UPLINK_LEN,
};
use crate::clock::Clock;

/// Longest the engine lets its caller sleep when nothing is scheduled
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Accepted uplinks kept for inspection in tests
#[cfg(test)]
const UPLINK_HISTORY: usize = 32;

/// Behaviour knobs for the simulated network
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimSettings {
    /// Time between a join request and its outcome
    pub join_delay_ms: u64,
    /// Join attempts that fail before one is accepted
    pub join_failures: u32,
    /// Airtime of one uplink, until TxDone
    pub tx_duration_ms: u64,
    /// The network answers every Nth uplink with downlinks (0 = never)
    pub downlink_every: u32,
    /// Downlinks queued per answer
    pub downlink_burst: u8,
    pub downlink_fport: u8,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            join_delay_ms: 5_000,
            join_failures: 0,
            tx_duration_ms: 1_500,
            downlink_every: 0,
            downlink_burst: 1,
            downlink_fport: 2,
        }
    }
}

/// Uplink accepted by the simulated engine
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentUplink {
    pub fport: u8,
    pub confirmed: bool,
    pub payload: Vec<u8>,
    pub at_ms: u64,
}

#[derive(Debug, Default)]
struct Credentials {
    dev_eui: Option<Eui>,
    join_eui: Option<Eui>,
    app_key: Option<AesKey>,
    nwk_key: Option<AesKey>,
}

impl Credentials {
    fn complete(&self) -> bool {
        self.dev_eui.is_some()
            && self.join_eui.is_some()
            && self.app_key.is_some()
            && self.nwk_key.is_some()
    }
}

pub struct SimulatedModem {
    clock: Arc<dyn Clock>,
    settings: SimSettings,
    initialised: bool,
    reset_count: u16,
    credentials: Credentials,
    region: Region,
    class: DeviceClass,
    adr: AdrProfile,
    lbt: LbtConfig,
    csma: bool,
    status: StatusMask,
    join_deadline: Option<u64>,
    join_failures_left: u32,
    tx_pending: Option<(u64, bool)>,
    uplink_count: u64,
    #[cfg(test)]
    uplinks: VecDeque<SentUplink>,
    downlinks: VecDeque<(Vec<u8>, DownlinkMetadata)>,
    downlink_seq: u8,
    alarm_deadline: Option<u64>,
    events: VecDeque<EventKind>,
    #[cfg(test)]
    injected: Option<ModemError>,
}

impl SimulatedModem {
    pub fn new(clock: Arc<dyn Clock>, settings: SimSettings) -> Self {
        Self {
            clock,
            join_failures_left: settings.join_failures,
            settings,
            initialised: false,
            reset_count: 0,
            credentials: Credentials::default(),
            region: Region::EU868,
            class: DeviceClass::A,
            adr: AdrProfile::default(),
            lbt: LbtConfig::default(),
            csma: false,
            status: StatusMask::empty(),
            join_deadline: None,
            tx_pending: None,
            uplink_count: 0,
            #[cfg(test)]
            uplinks: VecDeque::with_capacity(UPLINK_HISTORY),
            downlinks: VecDeque::new(),
            downlink_seq: 0,
            alarm_deadline: None,
            events: VecDeque::new(),
            #[cfg(test)]
            injected: None,
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Common gate for every command
    fn command(&mut self) -> Result {
        #[cfg(test)]
        if let Some(err) = self.injected.take() {
            return Err(err);
        }
        if !self.initialised {
            return Err(ModemError::NotInit);
        }
        Ok(())
    }

    /// Gate for settings the engine refuses to change once a session exists
    fn config_command(&mut self) -> Result {
        self.command()?;
        if self
            .status
            .intersects(StatusMask::JOINED | StatusMask::JOINING)
        {
            return Err(ModemError::Busy);
        }
        Ok(())
    }

    fn answer_with_downlinks(&mut self) {
        let window = match self.class {
            DeviceClass::A => RxWindow::Rx1,
            DeviceClass::B => RxWindow::RxB,
            DeviceClass::C => RxWindow::RxC,
        };
        for i in 0..self.settings.downlink_burst {
            self.downlink_seq = self.downlink_seq.wrapping_add(1);
            let metadata = DownlinkMetadata {
                rssi: -60 - i as i16,
                snr: 8,
                window: if i == 0 { window } else { RxWindow::Rx2 },
                fport: self.settings.downlink_fport,
            };
            self.downlinks
                .push_back((vec![0xD0, self.downlink_seq], metadata));
        }
        if self.settings.downlink_burst > 0 {
            self.events.push_back(EventKind::DownlinkData);
        }
    }

    fn next_deadline(&self) -> Option<u64> {
        [
            self.join_deadline,
            self.tx_pending.map(|(at, _)| at),
            self.alarm_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

impl super::ModemEngine for SimulatedModem {
    fn reset(&mut self) -> Result {
        #[cfg(test)]
        if let Some(err) = self.injected.take() {
            return Err(err);
        }
        let reset_count = self.reset_count.wrapping_add(1);
        *self = SimulatedModem::new(self.clock.clone(), self.settings.clone());
        self.initialised = true;
        self.reset_count = reset_count;
        self.events.push_back(EventKind::Reset { count: reset_count });
        debug!("Simulated modem reset (count={})", reset_count);
        Ok(())
    }

    fn set_dev_eui(&mut self, dev_eui: &Eui) -> Result {
        self.config_command()?;
        self.credentials.dev_eui = Some(*dev_eui);
        Ok(())
    }

    fn set_join_eui(&mut self, join_eui: &Eui) -> Result {
        self.config_command()?;
        self.credentials.join_eui = Some(*join_eui);
        Ok(())
    }

    fn set_app_key(&mut self, app_key: &AesKey) -> Result {
        self.config_command()?;
        self.credentials.app_key = Some(*app_key);
        Ok(())
    }

    fn set_nwk_key(&mut self, nwk_key: &AesKey) -> Result {
        self.config_command()?;
        self.credentials.nwk_key = Some(*nwk_key);
        Ok(())
    }

    fn set_region(&mut self, region: Region) -> Result {
        self.config_command()?;
        self.region = region;
        Ok(())
    }

    fn set_class(&mut self, class: DeviceClass) -> Result {
        self.command()?;
        self.class = class;
        Ok(())
    }

    fn set_adr_profile(&mut self, profile: &AdrProfile) -> Result {
        self.command()?;
        if let AdrProfile::Custom(distribution) = profile {
            if distribution.iter().all(|dr| *dr == 0xFF) {
                return Err(ModemError::Invalid);
            }
        }
        self.adr = profile.clone();
        Ok(())
    }

    fn set_lbt(&mut self, lbt: &LbtConfig) -> Result {
        self.command()?;
        if lbt.enabled && (lbt.listen_duration_ms == 0 || lbt.bandwidth_hz == 0) {
            return Err(ModemError::Invalid);
        }
        self.lbt = *lbt;
        Ok(())
    }

    fn set_csma(&mut self, enabled: bool) -> Result {
        self.command()?;
        self.csma = enabled;
        Ok(())
    }

    fn join_network(&mut self) -> Result {
        self.config_command()?;
        if !self.credentials.complete() {
            return Err(ModemError::Fail);
        }
        self.status.insert(StatusMask::JOINING);
        self.join_deadline = Some(self.now() + self.settings.join_delay_ms);
        debug!(
            "Simulated join started: region={} class={:?} adr={:?} lbt={} csma={}",
            self.region, self.class, self.adr, self.lbt.enabled, self.csma
        );
        Ok(())
    }

    fn leave_network(&mut self) -> Result {
        self.command()?;
        self.status.remove(StatusMask::JOINED | StatusMask::JOINING);
        self.join_deadline = None;
        if self.tx_pending.take().is_some() {
            self.events.push_back(EventKind::TxDone(TxStatus::NotSent));
        }
        self.join_failures_left = self.settings.join_failures;
        Ok(())
    }

    fn request_uplink(&mut self, fport: u8, confirmed: bool, payload: &[u8]) -> Result {
        self.command()?;
        if !self.status.contains(StatusMask::JOINED) {
            return Err(ModemError::Fail);
        }
        if fport == 0 || fport > 223 || payload.len() > MAX_UPLINK_LEN {
            return Err(ModemError::Invalid);
        }
        if self.tx_pending.is_some() {
            return Err(ModemError::Busy);
        }
        let now = self.now();
        self.uplink_count += 1;
        #[cfg(test)]
        {
            if self.uplinks.len() == UPLINK_HISTORY {
                self.uplinks.pop_front();
            }
            self.uplinks.push_back(SentUplink {
                fport,
                confirmed,
                payload: payload.to_vec(),
                at_ms: now,
            });
        }
        self.tx_pending = Some((now + self.settings.tx_duration_ms, confirmed));
        Ok(())
    }

    fn get_status(&self) -> Result<StatusMask> {
        if !self.initialised {
            return Err(ModemError::NotInit);
        }
        Ok(self.status)
    }

    fn get_downlink_data(&mut self) -> Result<Downlink> {
        self.command()?;
        let (mut payload, metadata) = self.downlinks.pop_front().ok_or(ModemError::Fail)?;
        payload.truncate(MAX_DOWNLINK_LEN);
        Ok(Downlink {
            payload,
            metadata,
            remaining: self.downlinks.len().min(u8::MAX as usize) as u8,
            received_at: chrono::Utc::now(),
        })
    }

    fn alarm_start_timer(&mut self, seconds: u32) -> Result {
        self.command()?;
        self.alarm_deadline = Some(self.now() + seconds as u64 * 1000);
        Ok(())
    }

    fn alarm_clear_timer(&mut self) -> Result {
        self.command()?;
        self.alarm_deadline = None;
        Ok(())
    }

    fn run_engine(&mut self) -> Duration {
        if !self.initialised {
            return IDLE_SLEEP;
        }
        let now = self.now();

        if self.join_deadline.is_some_and(|at| at <= now) {
            if self.join_failures_left > 0 {
                self.join_failures_left -= 1;
                self.join_deadline = Some(now + self.settings.join_delay_ms);
                self.events.push_back(EventKind::JoinFail);
            } else {
                self.join_deadline = None;
                self.status.remove(StatusMask::JOINING);
                self.status.insert(StatusMask::JOINED);
                self.events.push_back(EventKind::Joined);
            }
        }

        if let Some((at, confirmed)) = self.tx_pending {
            if at <= now {
                self.tx_pending = None;
                let status = if confirmed {
                    TxStatus::ConfirmedSent
                } else {
                    TxStatus::Sent
                };
                self.events.push_back(EventKind::TxDone(status));
                let every = self.settings.downlink_every as u64;
                if every > 0 && self.uplink_count % every == 0 {
                    self.answer_with_downlinks();
                }
            }
        }

        if self.alarm_deadline.is_some_and(|at| at <= now) {
            self.alarm_deadline = None;
            self.events.push_back(EventKind::Alarm);
        }

        if !self.events.is_empty() {
            return Duration::ZERO;
        }
        match self.next_deadline() {
            Some(at) => Duration::from_millis(at.saturating_sub(now)).min(IDLE_SLEEP),
            None => IDLE_SLEEP,
        }
    }

    fn get_event(&mut self) -> Option<Event> {
        let kind = self.events.pop_front()?;
        trace!("Simulated modem event {}", kind);
        Some(Event {
            kind,
            pending: self.events.len().min(u8::MAX as usize) as u8,
        })
    }
}

/// Inspection and fault-injection hooks
#[cfg(test)]
impl SimulatedModem {
    pub fn push_event(&mut self, kind: EventKind) {
        self.events.push_back(kind);
    }

    pub fn queue_downlink(&mut self, payload: &[u8], metadata: DownlinkMetadata) {
        self.downlinks.push_back((payload.to_vec(), metadata));
    }

    /// Make the next command fail with `err`
    pub fn fail_next(&mut self, err: ModemError) {
        self.injected = Some(err);
    }

    /// Mark the session as joined without emitting an event
    pub fn set_joined(&mut self, joined: bool) {
        self.status.set(StatusMask::JOINED, joined);
    }

    /// Most recent accepted uplinks, oldest first
    pub fn uplinks(&self) -> Vec<SentUplink> {
        self.uplinks.iter().cloned().collect()
    }

    pub fn uplink_count(&self) -> u64 {
        self.uplink_count
    }

    pub fn dev_eui(&self) -> Option<Eui> {
        self.credentials.dev_eui
    }

    pub fn join_eui(&self) -> Option<Eui> {
        self.credentials.join_eui
    }

    pub fn app_key(&self) -> Option<AesKey> {
        self.credentials.app_key
    }

    pub fn nwk_key(&self) -> Option<AesKey> {
        self.credentials.nwk_key
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn csma(&self) -> bool {
        self.csma
    }

    pub fn alarm_armed(&self) -> bool {
        self.alarm_deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::modem::ModemEngine;

    fn modem(settings: SimSettings) -> (SimulatedModem, ManualClock) {
        let clock = ManualClock::new();
        let mut modem = SimulatedModem::new(Arc::new(clock.clone()), settings);
        modem.reset().unwrap();
        assert!(matches!(
            modem.get_event().map(|e| e.kind),
            Some(EventKind::Reset { count: 1 })
        ));
        (modem, clock)
    }

    fn provision(modem: &mut SimulatedModem) {
        modem.set_dev_eui(&[1; 8]).unwrap();
        modem.set_join_eui(&[2; 8]).unwrap();
        modem.set_app_key(&[3; 16]).unwrap();
        modem.set_nwk_key(&[3; 16]).unwrap();
    }

    fn drain(modem: &mut SimulatedModem) -> Vec<EventKind> {
        std::iter::from_fn(|| modem.get_event().map(|e| e.kind)).collect()
    }

    #[test]
    fn test_commands_before_reset_fail() {
        let clock = ManualClock::new();
        let mut modem = SimulatedModem::new(Arc::new(clock), SimSettings::default());
        assert_eq!(modem.set_dev_eui(&[0; 8]), Err(ModemError::NotInit));
        assert_eq!(modem.get_status(), Err(ModemError::NotInit));
        assert_eq!(modem.run_engine(), IDLE_SLEEP);
    }

    #[test]
    fn test_join_requires_credentials() {
        let (mut modem, _) = modem(SimSettings::default());
        assert_eq!(modem.join_network(), Err(ModemError::Fail));
        provision(&mut modem);
        assert_eq!(modem.join_network(), Ok(()));
        assert!(modem.get_status().unwrap().contains(StatusMask::JOINING));
    }

    #[test]
    fn test_join_completes_after_delay() {
        let (mut modem, clock) = modem(SimSettings::default());
        provision(&mut modem);
        modem.join_network().unwrap();

        clock.advance(4_999);
        assert_eq!(modem.run_engine(), Duration::from_millis(1));
        assert!(drain(&mut modem).is_empty());

        clock.advance(1);
        assert_eq!(modem.run_engine(), Duration::ZERO);
        assert_eq!(drain(&mut modem), vec![EventKind::Joined]);
        assert!(modem.get_status().unwrap().contains(StatusMask::JOINED));
    }

    #[test]
    fn test_join_failures_then_success() {
        let (mut modem, clock) = modem(SimSettings {
            join_failures: 2,
            ..SimSettings::default()
        });
        provision(&mut modem);
        modem.join_network().unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            clock.advance(5_000);
            modem.run_engine();
            seen.extend(drain(&mut modem));
        }
        assert_eq!(
            seen,
            vec![EventKind::JoinFail, EventKind::JoinFail, EventKind::Joined]
        );
    }

    #[test]
    fn test_settings_locked_while_joined() {
        let (mut modem, _) = modem(SimSettings::default());
        provision(&mut modem);
        modem.set_joined(true);
        assert_eq!(modem.set_region(Region::US915), Err(ModemError::Busy));
        assert_eq!(modem.set_dev_eui(&[9; 8]), Err(ModemError::Busy));
        assert_eq!(modem.join_network(), Err(ModemError::Busy));

        modem.leave_network().unwrap();
        assert_eq!(modem.set_region(Region::US915), Ok(()));
    }

    #[test]
    fn test_uplink_rules() {
        let (mut modem, clock) = modem(SimSettings::default());
        assert_eq!(modem.request_uplink(2, false, b"x"), Err(ModemError::Fail));

        modem.set_joined(true);
        assert_eq!(modem.request_uplink(0, false, b"x"), Err(ModemError::Invalid));
        assert_eq!(modem.request_uplink(224, false, b"x"), Err(ModemError::Invalid));
        assert_eq!(
            modem.request_uplink(2, false, &[0u8; MAX_UPLINK_LEN + 1]),
            Err(ModemError::Invalid)
        );

        assert_eq!(modem.request_uplink(2, true, b"hello"), Ok(()));
        assert_eq!(modem.request_uplink(2, false, b"again"), Err(ModemError::Busy));

        clock.advance(1_500);
        modem.run_engine();
        assert_eq!(
            drain(&mut modem),
            vec![EventKind::TxDone(TxStatus::ConfirmedSent)]
        );
        assert_eq!(modem.uplinks().len(), 1);
        assert_eq!(modem.uplinks()[0].payload, b"hello".to_vec());
    }

    #[test]
    fn test_network_answers_with_downlinks() {
        let (mut modem, clock) = modem(SimSettings {
            downlink_every: 1,
            downlink_burst: 3,
            ..SimSettings::default()
        });
        modem.set_joined(true);
        modem.request_uplink(2, false, b"ping").unwrap();
        clock.advance(1_500);
        modem.run_engine();
        assert_eq!(
            drain(&mut modem),
            vec![EventKind::TxDone(TxStatus::Sent), EventKind::DownlinkData]
        );

        let remaining: Vec<u8> = (0..3)
            .map(|_| modem.get_downlink_data().unwrap().remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
        assert_eq!(modem.get_downlink_data(), Err(ModemError::Fail));
    }

    #[test]
    fn test_alarm_is_one_shot_and_rearmable() {
        let (mut modem, clock) = modem(SimSettings::default());
        modem.alarm_start_timer(10).unwrap();
        clock.advance(5_000);
        modem.alarm_start_timer(10).unwrap();

        clock.advance(5_000);
        modem.run_engine();
        assert!(drain(&mut modem).is_empty());

        clock.advance(5_000);
        modem.run_engine();
        assert_eq!(drain(&mut modem), vec![EventKind::Alarm]);
        assert!(!modem.alarm_armed());
    }

    #[test]
    fn test_long_run_keeps_bounded_history() {
        let (mut modem, clock) = modem(SimSettings {
            downlink_every: 1_000,
            ..SimSettings::default()
        });
        modem.set_joined(true);
        for counter in 0..10_000u32 {
            modem
                .request_uplink(2, false, &counter.to_be_bytes())
                .unwrap();
            clock.advance(2_000);
            modem.run_engine();
            drain(&mut modem);
            while modem.get_downlink_data().is_ok() {}
        }

        assert_eq!(modem.uplink_count(), 10_000);
        let history = modem.uplinks();
        assert_eq!(history.len(), UPLINK_HISTORY);
        assert_eq!(history.last().unwrap().payload, 9_999u32.to_be_bytes().to_vec());
        // The answer cadence follows the total count, not the kept history
        assert_eq!(modem.downlink_seq, 10);
    }

    #[test]
    fn test_event_pending_count() {
        let (mut modem, _) = modem(SimSettings::default());
        modem.push_event(EventKind::Alarm);
        modem.push_event(EventKind::Joined);
        assert_eq!(modem.get_event().unwrap().pending, 1);
        assert_eq!(modem.get_event().unwrap().pending, 0);
        assert!(modem.get_event().is_none());
    }

    #[test]
    fn test_injected_failure_hits_next_command_only() {
        let (mut modem, _) = modem(SimSettings::default());
        modem.fail_next(ModemError::NoTime);
        assert_eq!(modem.set_csma(true), Err(ModemError::NoTime));
        assert_eq!(modem.set_csma(true), Ok(()));
        assert!(modem.csma());
    }
}
