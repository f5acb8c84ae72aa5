//! Modem engine interface
//!
//! The engine owns the LoRaWAN MAC state, channel plans, crypto and the
//! radio. Callers push configuration in, request joins and uplinks, pump it
//! with [`ModemEngine::run_engine`] and poll the events it queues.

use std::time::Duration;

use super::keys::{AesKey, Eui};
use super::{AdrProfile, DeviceClass, Downlink, Event, LbtConfig, Region, Result, StatusMask};

pub trait ModemEngine {
    /// Bring the engine back to its power-on state; queues a Reset event
    fn reset(&mut self) -> Result;

    fn set_dev_eui(&mut self, dev_eui: &Eui) -> Result;

    fn set_join_eui(&mut self, join_eui: &Eui) -> Result;

    fn set_app_key(&mut self, app_key: &AesKey) -> Result;

    fn set_nwk_key(&mut self, nwk_key: &AesKey) -> Result;

    fn set_region(&mut self, region: Region) -> Result;

    fn set_class(&mut self, class: DeviceClass) -> Result;

    fn set_adr_profile(&mut self, profile: &AdrProfile) -> Result;

    fn set_lbt(&mut self, lbt: &LbtConfig) -> Result;

    fn set_csma(&mut self, enabled: bool) -> Result;

    /// Start the OTAA join procedure; the outcome arrives as an event
    fn join_network(&mut self) -> Result;

    fn leave_network(&mut self) -> Result;

    /// Queue an application uplink; completion arrives as a TxDone event
    fn request_uplink(&mut self, fport: u8, confirmed: bool, payload: &[u8]) -> Result;

    fn get_status(&self) -> Result<StatusMask>;

    /// Fetch the oldest received downlink
    fn get_downlink_data(&mut self) -> Result<Downlink>;

    /// Arm the one-shot alarm; re-arming replaces a pending deadline
    fn alarm_start_timer(&mut self, seconds: u32) -> Result;

    fn alarm_clear_timer(&mut self) -> Result;

    /// Let the engine process pending work. Returns how long the caller may
    /// sleep before the engine needs to run again.
    fn run_engine(&mut self) -> Duration;

    /// Pop the next queued event, if any
    fn get_event(&mut self) -> Option<Event>;
}
