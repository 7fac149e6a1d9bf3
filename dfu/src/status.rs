use std::time::Duration;

use crate::error::DfuError;

pub(crate) const DFU_STATUS_LEN: u16 = 6;

/// Device state as reported in `bState` (section 6.1.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DfuState {
    AppIdle,
    AppDetach,
    DfuIdle,
    DfuDownloadSync,
    DfuDownBusy,
    DfuDownloadIdle,
    DfuManifestSync,
    DfuManifest,
    DfuManifestWaitReset,
    DfuUploadIdle,
    DfuError,
    Unknown,
}

impl From<u8> for DfuState {
    fn from(raw: u8) -> Self {
        match raw {
            0x00 => DfuState::AppIdle,
            0x01 => DfuState::AppDetach,
            0x02 => DfuState::DfuIdle,
            0x03 => DfuState::DfuDownloadSync,
            0x04 => DfuState::DfuDownBusy,
            0x05 => DfuState::DfuDownloadIdle,
            0x06 => DfuState::DfuManifestSync,
            0x07 => DfuState::DfuManifest,
            0x08 => DfuState::DfuManifestWaitReset,
            0x09 => DfuState::DfuUploadIdle,
            0x0a => DfuState::DfuError,
            _ => DfuState::Unknown,
        }
    }
}

impl DfuState {
    /// Whether the device is running its DFU (bootloader) personality.
    pub fn is_dfu_mode(&self) -> bool {
        !matches!(
            self,
            DfuState::AppIdle | DfuState::AppDetach | DfuState::Unknown
        )
    }
}

/// Response to `DFU_GETSTATUS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuDeviceStatus {
    pub status: u8,
    pub poll_timeout: u32,
    pub state: DfuState,
}

impl DfuDeviceStatus {
    pub fn from_raw(data: &[u8]) -> Result<Self, DfuError> {
        if data.len() < DFU_STATUS_LEN as usize {
            return Err(DfuError::ShortResponse {
                expected: DFU_STATUS_LEN as usize,
                actual: data.len(),
            });
        }
        Ok(DfuDeviceStatus {
            status: data[0],
            poll_timeout: (data[3] as u32) << 16
                | (data[2] as u32) << 8
                | (data[1] as u32),
            state: DfuState::from(data[4]),
        })
    }

    /// Minimum time the host waits before the next `DFU_GETSTATUS`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_timeout as u64)
    }

    pub fn ok(&self) -> Result<(), DfuError> {
        if self.status != 0 {
            Err(DfuError::Status(self.status))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_raw() {
        let st =
            DfuDeviceStatus::from_raw(&[0x00, 0x34, 0x12, 0x01, 0x05, 0x00])
                .unwrap();
        assert_eq!(st.status, 0);
        assert_eq!(st.poll_timeout, 0x011234);
        assert_eq!(st.state, DfuState::DfuDownloadIdle);
        assert!(st.ok().is_ok());

        let st = DfuDeviceStatus::from_raw(&[0x0e, 0, 0, 0, 0x0a, 0]).unwrap();
        assert_eq!(st.state, DfuState::DfuError);
        assert!(matches!(st.ok(), Err(DfuError::Status(0x0e))));
    }

    #[test]
    fn test_status_short_response() {
        assert!(matches!(
            DfuDeviceStatus::from_raw(&[0, 1, 2]),
            Err(DfuError::ShortResponse {
                expected: 6,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_state_values() {
        assert_eq!(DfuState::from(0x02), DfuState::DfuIdle);
        assert_eq!(DfuState::from(0x07), DfuState::DfuManifest);
        assert_eq!(DfuState::from(0x42), DfuState::Unknown);
        assert!(!DfuState::AppIdle.is_dfu_mode());
        assert!(DfuState::DfuIdle.is_dfu_mode());
    }
}
