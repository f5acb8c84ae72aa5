//! LoRaWAN network management and data transfer

use tracing::warn;

use crate::modem::keys::{AesKey, DeviceIdentity, Eui};
use crate::modem::{
    return_code, AdrProfile, DeviceClass, Downlink, LbtConfig, ModemEngine, Region, Result,
    StatusMask,
};

/// Borrowed view of the engine exposing the LoRaWAN commands
pub struct LoRaWan<'a, E: ModemEngine> {
    engine: &'a mut E,
}

fn traced<T>(op: &str, ret: Result<T>) -> Result<T> {
    modem_trace!("{} result: {}", op, return_code(&ret));
    ret
}

impl<'a, E: ModemEngine> LoRaWan<'a, E> {
    pub(super) fn new(engine: &'a mut E) -> Self {
        Self { engine }
    }

    pub fn set_dev_eui(&mut self, dev_eui: &Eui) -> Result {
        traced("Set DevEUI", self.engine.set_dev_eui(dev_eui))
    }

    pub fn set_join_eui(&mut self, join_eui: &Eui) -> Result {
        traced("Set JoinEUI", self.engine.set_join_eui(join_eui))
    }

    pub fn set_app_key(&mut self, app_key: &AesKey) -> Result {
        traced("Set AppKey", self.engine.set_app_key(app_key))
    }

    pub fn set_nwk_key(&mut self, nwk_key: &AesKey) -> Result {
        traced("Set NwkKey", self.engine.set_nwk_key(nwk_key))
    }

    /// Push all four OTAA values, stopping at the first refusal
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn set_identity(&mut self, identity: &DeviceIdentity) -> Result {
        self.set_dev_eui(&identity.dev_eui)?;
        self.set_join_eui(&identity.join_eui)?;
        self.set_app_key(&identity.app_key)?;
        self.set_nwk_key(&identity.nwk_key)
    }

    /// Must happen before `join`; the engine refuses it while joined
    pub fn set_region(&mut self, region: Region) -> Result {
        let ret = self.engine.set_region(region);
        modem_trace!(
            "Set Region {} ({}) result: {}",
            region,
            region.code(),
            return_code(&ret)
        );
        ret
    }

    pub fn set_class(&mut self, class: DeviceClass) -> Result {
        traced("Set Class", self.engine.set_class(class))
    }

    pub fn set_adr_profile(&mut self, profile: &AdrProfile) -> Result {
        traced("Set ADR profile", self.engine.set_adr_profile(profile))
    }

    pub fn set_lbt(&mut self, lbt: &LbtConfig) -> Result {
        traced("Set LBT", self.engine.set_lbt(lbt))
    }

    pub fn set_csma(&mut self, enabled: bool) -> Result {
        traced("Set CSMA", self.engine.set_csma(enabled))
    }

    /// Start joining. Success only means the request was accepted; the
    /// outcome arrives later as a Joined or JoinFail event.
    pub fn join(&mut self) -> Result {
        traced("Join network", self.engine.join_network())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn leave(&mut self) -> Result {
        traced("Leave network", self.engine.leave_network())
    }

    pub fn status(&self) -> Result<StatusMask> {
        traced("Get status", self.engine.get_status())
    }

    /// Whether the engine reports an active session. A failed status query
    /// counts as not joined.
    pub fn is_joined(&self) -> bool {
        match self.engine.get_status() {
            Ok(mask) => mask.contains(StatusMask::JOINED),
            Err(e) => {
                warn!("Failed to get modem status: {}", e);
                false
            }
        }
    }

    pub fn send(&mut self, data: &[u8], port: u8, confirmed: bool) -> Result {
        let ret = self.engine.request_uplink(port, confirmed, data);
        modem_trace!(
            "Send uplink: port={}, len={}, confirmed={}, result={}",
            port,
            data.len(),
            confirmed,
            return_code(&ret)
        );
        ret
    }

    /// Fetch a single downlink. `remaining` on the record tells how many are
    /// still queued; see [`LoRaWan::drain_downlinks`].
    pub fn get_downlink_data(&mut self) -> Result<Downlink> {
        traced("Get downlink data", self.engine.get_downlink_data())
    }

    /// Fetch downlinks until the engine reports none remaining.
    ///
    /// Fails only if the first fetch fails; a later failure ends the loop
    /// and returns what was already fetched.
    pub fn drain_downlinks(&mut self) -> Result<Vec<Downlink>> {
        let first = self.get_downlink_data()?;
        let mut remaining = first.remaining;
        let mut downlinks = vec![first];

        while remaining > 0 {
            match self.get_downlink_data() {
                Ok(downlink) => {
                    remaining = downlink.remaining;
                    downlinks.push(downlink);
                }
                Err(e) => {
                    warn!(
                        "Downlink fetch failed with {} still reported queued: {}",
                        remaining, e
                    );
                    break;
                }
            }
        }
        Ok(downlinks)
    }

    /// Arm the engine's one-shot alarm, replacing any pending one
    pub fn start_alarm(&mut self, seconds: u32) -> Result {
        let ret = self.engine.alarm_start_timer(seconds);
        modem_trace!("Start alarm {}s result: {}", seconds, return_code(&ret));
        ret
    }

    pub fn clear_alarm(&mut self) -> Result {
        traced("Clear alarm", self.engine.alarm_clear_timer())
    }
}
