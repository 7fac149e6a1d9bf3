use std::time::Duration;

/// Bytes of vendor signature trailing every firmware image; never sent.
pub const FIRMWARE_SIGNATURE_LEN: u64 = 16;

/// Retry budgets and bounded waits used by [crate::DfuDriver].
///
/// The defaults are tuned for the bill acceptors and printers on the
/// platform; tests shrink them to milliseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuTimings {
    /// Open attempts per discovery round.
    pub init_attempts: u32,
    /// Pause between discovery rounds while waiting for re-enumeration.
    pub discover_interval: Duration,
    /// Give up on re-enumeration after this long.
    pub discover_max_wait: Duration,
    /// Used when the run-time descriptor cannot be read.
    pub default_detach_timeout: u16,
    /// Send attempts per block before failing with a control-transfer error.
    pub block_retries: u32,
    /// Upper bound on status polling after one block.
    pub download_poll_max: Duration,
    /// Upper bound on status polling for the manifest phase.
    pub manifest_poll_max: Duration,
    /// Settle time per [DfuTimings::firmware_size_scalar] bytes of image.
    pub manifest_wait: Duration,
    pub firmware_size_scalar: u64,
    /// Wait after an explicit detach and reset following installation.
    pub device_ready: Duration,
    /// Wait after installation on devices that detach on their own.
    pub post_install_ready: Duration,
    /// Floor applied to the device-reported poll interval.
    pub min_poll_interval: Duration,
}

impl Default for DfuTimings {
    fn default() -> Self {
        DfuTimings {
            init_attempts: 3,
            discover_interval: Duration::from_millis(500),
            discover_max_wait: Duration::from_secs(15),
            default_detach_timeout: 1000,
            block_retries: 3,
            download_poll_max: Duration::from_secs(10),
            manifest_poll_max: Duration::from_secs(10),
            manifest_wait: Duration::from_secs(8),
            firmware_size_scalar: 1024 * 1024,
            device_ready: Duration::from_secs(5),
            post_install_ready: Duration::from_secs(2),
            min_poll_interval: Duration::from_millis(5),
        }
    }
}

impl DfuTimings {
    /// Time the device needs to commit an image of `firmware_size` bytes.
    pub fn manifest_settle(&self, firmware_size: u64) -> Duration {
        if self.firmware_size_scalar == 0 {
            return self.manifest_wait;
        }
        let millis = self.manifest_wait.as_millis() as u64 * firmware_size
            / self.firmware_size_scalar;
        Duration::from_millis(millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_settle_scales_with_size() {
        let timings = DfuTimings::default();
        assert_eq!(
            timings.manifest_settle(1024 * 1024),
            Duration::from_secs(8)
        );
        assert_eq!(
            timings.manifest_settle(512 * 1024),
            Duration::from_secs(4)
        );
        assert_eq!(timings.manifest_settle(0), Duration::ZERO);
    }

    #[test]
    fn test_manifest_settle_zero_scalar() {
        let timings = DfuTimings {
            firmware_size_scalar: 0,
            ..DfuTimings::default()
        };
        assert_eq!(timings.manifest_settle(4096), timings.manifest_wait);
    }
}
