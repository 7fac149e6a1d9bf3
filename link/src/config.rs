use std::time::Duration;

use dfu::{DeviceIdentity, DfuTimings};

use crate::{error::ConfigError, frame::FrameFormat, hid::ReportLimits};

/// Device identifiers as supplied by the platform configuration, in hex.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdConfig {
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub dfu_product: Option<String>,
}

impl IdConfig {
    pub fn new(vendor: &str, product: &str, dfu_product: &str) -> Self {
        IdConfig {
            vendor: Some(vendor.into()),
            product: Some(product.into()),
            dfu_product: Some(dfu_product.into()),
        }
    }

    pub fn resolve(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(DeviceIdentity {
            vendor_id: parse_id("vendor id", self.vendor.as_deref())?,
            product_id: parse_id("product id", self.product.as_deref())?,
            dfu_product_id: parse_id(
                "DFU product id",
                self.dfu_product.as_deref(),
            )?,
        })
    }
}

/// Parse a 16-bit id such as `"0483"` or `"0xDF11"`.
pub fn parse_hex_id(value: &str) -> Option<u16> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u16::from_str_radix(digits, 16).ok()
}

fn parse_id(
    name: &'static str,
    value: Option<&str>,
) -> Result<u16, ConfigError> {
    let value = value
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::Missing(name))?;
    parse_hex_id(value).ok_or_else(|| ConfigError::InvalidHex {
        name,
        value: value.into(),
    })
}

/// Tunables of [crate::Transport] and the components it owns.
#[derive(Clone, Debug)]
pub struct TransportSettings {
    pub frame: FrameFormat,
    /// How long the transmitter blocks on the queue before checking for close.
    pub dequeue_poll: Duration,
    /// Bound on joining the transmitter when closing.
    pub close_join: Duration,
    /// Pause after every message for peripherals that need it.
    pub inter_message_delay: Option<Duration>,
    pub dfu: DfuTimings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        TransportSettings {
            frame: FrameFormat::default(),
            dequeue_poll: Duration::from_millis(100),
            close_join: Duration::from_secs(2),
            inter_message_delay: None,
            dfu: DfuTimings::default(),
        }
    }
}

/// Tunables of [crate::HidTransport].
#[derive(Clone, Debug)]
pub struct HidSettings {
    /// Wait per interrupt read before re-checking for close.
    pub read_poll: Duration,
    /// Interval between device list scans for presence changes.
    pub presence_poll: Duration,
    pub limits: ReportLimits,
    pub control_timeout: Duration,
}

impl Default for HidSettings {
    fn default() -> Self {
        HidSettings {
            read_poll: Duration::from_millis(250),
            presence_poll: Duration::from_millis(500),
            limits: ReportLimits::default(),
            control_timeout: Duration::from_millis(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(parse_hex_id("0483"), Some(0x0483));
        assert_eq!(parse_hex_id("0xDF11"), Some(0xdf11));
        assert_eq!(parse_hex_id(" 0Xdf11 "), Some(0xdf11));
        assert_eq!(parse_hex_id("1"), Some(1));
        assert_eq!(parse_hex_id(""), None);
        assert_eq!(parse_hex_id("0x"), None);
        assert_eq!(parse_hex_id("12345"), None);
        assert_eq!(parse_hex_id("zz"), None);
        assert_eq!(parse_hex_id("+12"), None);
    }

    #[test]
    fn test_resolve() {
        let ids = IdConfig::new("0483", "5740", "df11").resolve().unwrap();
        assert_eq!(
            ids,
            DeviceIdentity {
                vendor_id: 0x0483,
                product_id: 0x5740,
                dfu_product_id: 0xdf11,
            }
        );
    }

    #[test]
    fn test_resolve_reports_missing_id() {
        let config = IdConfig {
            vendor: Some("0483".into()),
            product: None,
            dfu_product: Some("df11".into()),
        };
        assert_eq!(config.resolve(), Err(ConfigError::Missing("product id")));

        let config = IdConfig {
            dfu_product: Some("  ".into()),
            ..IdConfig::new("0483", "5740", "")
        };
        assert_eq!(
            config.resolve(),
            Err(ConfigError::Missing("DFU product id"))
        );
    }

    #[test]
    fn test_resolve_reports_bad_hex() {
        let config = IdConfig::new("0483", "57g0", "df11");
        assert_eq!(
            config.resolve(),
            Err(ConfigError::InvalidHex {
                name: "product id",
                value: "57g0".into()
            })
        );
    }
}
