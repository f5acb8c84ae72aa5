//! Basic Modem engine types
//!
//! Everything the command facade exchanges with the modem engine: regions,
//! class and ADR settings, the status mask, asynchronous events, downlink
//! records and the engine's return codes.

pub mod engine;
pub mod keys;
pub mod sim;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

pub use engine::ModemEngine;

/// Largest application payload the engine hands back in a downlink
pub const MAX_DOWNLINK_LEN: usize = 242;

/// Largest application payload the engine accepts for an uplink
pub const MAX_UPLINK_LEN: usize = 242;

/// Engine return code for success
pub const RC_OK: u8 = 0;

/// Failure kinds reported by the modem engine
///
/// Every engine call answers with a single return code; zero is success and
/// each other value maps to one variant here.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemError {
    #[error("modem not initialised")]
    NotInit,
    #[error("invalid parameter")]
    Invalid,
    #[error("modem busy")]
    Busy,
    #[error("command failed")]
    Fail,
    #[error("no time available")]
    NoTime,
    #[error("invalid stack id")]
    InvalidStackId,
    #[error("no event available")]
    NoEvent,
    #[error("unknown modem return code {0}")]
    Unknown(u8),
}

pub type Result<T = ()> = std::result::Result<T, ModemError>;

impl ModemError {
    /// Interpret a raw engine return code
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_code(code: u8) -> Result {
        match code {
            RC_OK => Ok(()),
            1 => Err(ModemError::NotInit),
            2 => Err(ModemError::Invalid),
            3 => Err(ModemError::Busy),
            4 => Err(ModemError::Fail),
            5 => Err(ModemError::NoTime),
            6 => Err(ModemError::InvalidStackId),
            7 => Err(ModemError::NoEvent),
            other => Err(ModemError::Unknown(other)),
        }
    }

    /// Raw engine return code, for diagnostics
    pub fn code(&self) -> u8 {
        match self {
            ModemError::NotInit => 1,
            ModemError::Invalid => 2,
            ModemError::Busy => 3,
            ModemError::Fail => 4,
            ModemError::NoTime => 5,
            ModemError::InvalidStackId => 6,
            ModemError::NoEvent => 7,
            ModemError::Unknown(code) => *code,
        }
    }
}

/// Raw return code of a facade result (0 on success)
pub fn return_code<T>(result: &Result<T>) -> u8 {
    match result {
        Ok(_) => RC_OK,
        Err(e) => e.code(),
    }
}

/// LoRaWAN regional parameter set, numbered as the engine numbers them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
#[repr(u8)]
pub enum Region {
    EU433 = 0,
    CN470 = 1,
    RU864 = 2,
    IN865 = 3,
    EU868 = 4,
    US915 = 5,
    AU915 = 6,
    KR920 = 7,
    AS923_1 = 8,
    AS923_2 = 9,
    AS923_3 = 10,
    AS923_4 = 11,
}

impl Region {
    pub const ALL: [Region; 12] = [
        Region::EU433,
        Region::CN470,
        Region::RU864,
        Region::IN865,
        Region::EU868,
        Region::US915,
        Region::AU915,
        Region::KR920,
        Region::AS923_1,
        Region::AS923_2,
        Region::AS923_3,
        Region::AS923_4,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Region {
    type Error = ModemError;

    fn try_from(value: u8) -> Result<Self> {
        Region::ALL
            .get(value as usize)
            .copied()
            .ok_or(ModemError::Invalid)
    }
}

impl FromStr for Region {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        let region = match normalized.as_str() {
            "EU433" => Region::EU433,
            "CN470" => Region::CN470,
            "RU864" => Region::RU864,
            "IN865" => Region::IN865,
            "EU868" => Region::EU868,
            "US915" => Region::US915,
            "AU915" => Region::AU915,
            "KR920" => Region::KR920,
            "AS923" | "AS9231" => Region::AS923_1,
            "AS9232" => Region::AS923_2,
            "AS9233" => Region::AS923_3,
            "AS9234" => Region::AS923_4,
            _ => return Err(anyhow::anyhow!("Unknown LoRaWAN region: {}", s)),
        };
        Ok(region)
    }
}

impl TryFrom<String> for Region {
    type Error = anyhow::Error;

    fn try_from(value: String) -> anyhow::Result<Self> {
        value.parse()
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::EU433 => "EU433",
            Region::CN470 => "CN470",
            Region::RU864 => "RU864",
            Region::IN865 => "IN865",
            Region::EU868 => "EU868",
            Region::US915 => "US915",
            Region::AU915 => "AU915",
            Region::KR920 => "KR920",
            Region::AS923_1 => "AS923-1",
            Region::AS923_2 => "AS923-2",
            Region::AS923_3 => "AS923-3",
            Region::AS923_4 => "AS923-4",
        };
        write!(f, "{}", name)
    }
}

/// LoRaWAN device class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum DeviceClass {
    #[default]
    A,
    B,
    C,
}

/// Adaptive data rate profile handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdrProfile {
    /// Data rate driven by the network server
    #[default]
    NetworkControlled,
    MobileLongRange,
    MobileLowPower,
    /// Custom data-rate distribution, one entry per uplink slot
    Custom([u8; 16]),
}

/// Listen-before-talk parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LbtConfig {
    pub enabled: bool,
    pub listen_duration_ms: u32,
    pub threshold_dbm: i16,
    pub bandwidth_hz: u32,
}

impl Default for LbtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_duration_ms: 5,
            threshold_dbm: -80,
            bandwidth_hz: 200_000,
        }
    }
}

bitflags::bitflags! {
    /// Modem status bits as reported by the engine
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct StatusMask: u32 {
        const BROWNOUT = 1 << 0;
        const CRASH = 1 << 1;
        const MUTE = 1 << 2;
        const JOINED = 1 << 3;
        const SUSPEND = 1 << 4;
        const UPLOAD = 1 << 5;
        const JOINING = 1 << 6;
        const STREAM = 1 << 7;
    }
}

/// Outcome carried by a TX-done event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NotSent,
    Sent,
    ConfirmedSent,
}

/// Asynchronous event kinds surfaced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Reset { count: u16 },
    Alarm,
    Joined,
    JoinFail,
    TxDone(TxStatus),
    DownlinkData,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Reset { count } => write!(f, "RESET (count={})", count),
            EventKind::Alarm => write!(f, "ALARM"),
            EventKind::Joined => write!(f, "JOINED"),
            EventKind::JoinFail => write!(f, "JOINFAIL"),
            EventKind::TxDone(status) => write!(f, "TXDONE ({:?})", status),
            EventKind::DownlinkData => write!(f, "DOWNDATA"),
        }
    }
}

/// One queued engine event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    /// Events still waiting in the engine after this one
    pub pending: u8,
}

/// Receive window a downlink arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxWindow {
    Rx1,
    Rx2,
    RxC,
    RxB,
}

/// Radio metadata of a received downlink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownlinkMetadata {
    pub rssi: i16,
    pub snr: i8,
    pub window: RxWindow,
    pub fport: u8,
}

/// A downlink fetched from the engine
#[derive(Debug, Clone, PartialEq)]
pub struct Downlink {
    pub payload: Vec<u8>,
    pub metadata: DownlinkMetadata,
    /// Downlinks still queued in the engine after this one
    pub remaining: u8,
    pub received_at: DateTime<Utc>,
}
