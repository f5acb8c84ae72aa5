//! LoRaWAN device identity
//!
//! The four OTAA values pushed into the engine before a join: DevEUI,
//! JoinEUI, AppKey and NwkKey. They are parsed from hex in the
//! configuration file and never change once the device has joined.

use anyhow::Context;

/// 64-bit extended unique identifier, as sent over the air (MSB first)
pub type Eui = [u8; 8];

/// AES-128 root key
pub type AesKey = [u8; 16];

#[derive(Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub dev_eui: Eui,
    pub join_eui: Eui,
    pub app_key: AesKey,
    pub nwk_key: AesKey,
}

impl DeviceIdentity {
    /// Build an identity from hex strings
    ///
    /// LoRaWAN 1.0.x devices only have an AppKey; when `nwk_key` is absent
    /// the AppKey is reused as NwkKey.
    pub fn from_hex(
        dev_eui: &str,
        join_eui: &str,
        app_key: &str,
        nwk_key: Option<&str>,
    ) -> anyhow::Result<Self> {
        let app_key: AesKey = decode_fixed(app_key).context("app_key")?;
        let nwk_key = match nwk_key {
            Some(key) => decode_fixed(key).context("nwk_key")?,
            None => app_key,
        };

        Ok(Self {
            dev_eui: decode_fixed(dev_eui).context("dev_eui")?,
            join_eui: decode_fixed(join_eui).context("join_eui")?,
            app_key,
            nwk_key,
        })
    }
}

// Keys stay out of logs; only the public identifiers are printed.
impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("dev_eui", &hex::encode_upper(self.dev_eui))
            .field("join_eui", &hex::encode_upper(self.join_eui))
            .finish_non_exhaustive()
    }
}

/// Decode a hex string into a fixed-size array, tolerating `:`/`-`/space separators
fn decode_fixed<const N: usize>(input: &str) -> anyhow::Result<[u8; N]> {
    let cleaned: String = input
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | ' '))
        .collect();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| anyhow::anyhow!("Invalid hex '{}': {}", input, e))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected {} bytes, got {}", N, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_EUI: &str = "70B3D57ED0000001";
    const JOIN_EUI: &str = "0000000000000000";
    const APP_KEY: &str = "2B7E151628AED2A6ABF7158809CF4F3C";

    #[test]
    fn test_parse_identity() {
        let id = DeviceIdentity::from_hex(DEV_EUI, JOIN_EUI, APP_KEY, None).unwrap();
        assert_eq!(id.dev_eui, [0x70, 0xB3, 0xD5, 0x7E, 0xD0, 0x00, 0x00, 0x01]);
        assert_eq!(id.join_eui, [0u8; 8]);
        assert_eq!(id.app_key[0], 0x2B);
        assert_eq!(id.app_key[15], 0x3C);
    }

    #[test]
    fn test_nwk_key_defaults_to_app_key() {
        let id = DeviceIdentity::from_hex(DEV_EUI, JOIN_EUI, APP_KEY, None).unwrap();
        assert_eq!(id.nwk_key, id.app_key);

        let id = DeviceIdentity::from_hex(
            DEV_EUI,
            JOIN_EUI,
            APP_KEY,
            Some("000102030405060708090A0B0C0D0E0F"),
        )
        .unwrap();
        assert_ne!(id.nwk_key, id.app_key);
        assert_eq!(id.nwk_key[15], 0x0F);
    }

    #[test]
    fn test_separators_allowed() {
        let id =
            DeviceIdentity::from_hex("70:B3:D5:7E:D0:00:00:01", JOIN_EUI, APP_KEY, None).unwrap();
        assert_eq!(id.dev_eui[0], 0x70);
    }

    #[test]
    fn test_wrong_length_fails() {
        assert!(DeviceIdentity::from_hex("70B3D57E", JOIN_EUI, APP_KEY, None).is_err());
        assert!(DeviceIdentity::from_hex(DEV_EUI, JOIN_EUI, "2B7E", None).is_err());
        assert!(DeviceIdentity::from_hex(DEV_EUI, "zz", APP_KEY, None).is_err());
    }

    #[test]
    fn test_debug_hides_keys() {
        let id = DeviceIdentity::from_hex(DEV_EUI, JOIN_EUI, APP_KEY, None).unwrap();
        let printed = format!("{:?}", id);
        assert!(printed.contains("70B3D57ED0000001"));
        assert!(!printed.to_lowercase().contains("2b7e1516"));
    }
}
