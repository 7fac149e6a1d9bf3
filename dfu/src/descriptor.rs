pub(crate) const DFU_DESC_TYPE: u8 = 0x21;
pub(crate) const DFU_DESC_LEN: usize = 9;

const INTERFACE_DESC_TYPE: u8 = 0x04;
const INTERFACE_DESC_LEN: usize = 9;

pub(crate) const DFU_CLASS: u8 = 0xFE;
pub(crate) const DFU_SUBCLASS: u8 = 0x1;

pub const DFU_VERSION_1_0: u16 = 0x0101;
pub const DFU_VERSION_1_1: u16 = 0x0110;

/// DFU functional descriptor
///
/// Represents the DFU functional descriptor as described in section 4.1.3,
/// decoded into the capabilities a download session negotiates with.
///
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DfuCapabilities {
    attributes: u8,
    detach_timeout: u16,
    transfer_size: u16,
    dfu_version: u16,
}

impl DfuCapabilities {
    const BIT_CAN_DNLOAD: u8 = 1 << 0;
    const BIT_CAN_UPLOAD: u8 = 1 << 1;
    const BIT_MANIFESTATION_TOLERANT: u8 = 1 << 2;
    const BIT_WILL_DETACH: u8 = 1 << 3;

    pub(crate) fn new(raw_desc: &[u8]) -> Self {
        Self {
            attributes: raw_desc[2],
            detach_timeout: (raw_desc[4] as u16) << 8 | (raw_desc[3] as u16),
            transfer_size: (raw_desc[6] as u16) << 8 | (raw_desc[5] as u16),
            dfu_version: (raw_desc[8] as u16) << 8 | (raw_desc[7] as u16),
        }
    }

    /// Download capable (`bitCanDnload`)
    #[doc(alias = "bitCanDnload")]
    pub fn can_download(&self) -> bool {
        self.attributes & Self::BIT_CAN_DNLOAD != 0
    }

    /// Upload capable (`bitCanUpload`)
    #[doc(alias = "bitCanUpload")]
    pub fn can_upload(&self) -> bool {
        self.attributes & Self::BIT_CAN_UPLOAD != 0
    }

    /// Device is able to communicate via USB after
    /// Manifestation phase (`bitManifestationTolerant`)
    #[doc(alias = "bitManifestationTolerant")]
    pub fn manifestation_tolerant(&self) -> bool {
        self.attributes & Self::BIT_MANIFESTATION_TOLERANT != 0
    }

    /// Device will perform a bus detach-attach sequence when it receives
    /// a `DFU_DETACH` request (`bitWillDetach`). The host must not issue a USB Reset.
    #[doc(alias = "bitWillDetach")]
    pub fn will_detach(&self) -> bool {
        self.attributes & Self::BIT_WILL_DETACH != 0
    }

    /// Time, in milliseconds, that the device will wait after receipt of the `DFU_DETACH`
    /// request (`wDetachTimeOut`).
    #[doc(alias = "wDetachTimeout")]
    pub fn detach_timeout(&self) -> u16 {
        self.detach_timeout
    }

    /// Maximum number of bytes that the device can accept per control-write transaction
    /// (`wTransferSize`).
    #[doc(alias = "wTransferSize")]
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Numeric expression identifying the version of the DFU Specification release
    /// (`bcdDFUVersion`).
    #[doc(alias = "bcdDFUVersion")]
    pub fn dfu_version(&self) -> u16 {
        self.dfu_version
    }
}

fn is_supported_version(version: u16) -> bool {
    version == DFU_VERSION_1_0 || version == DFU_VERSION_1_1
}

/// Scan a raw configuration descriptor for the DFU functional descriptor.
///
/// Type 0x21 is shared with the HID class descriptor, so a candidate only
/// counts when it sits inside a DFU interface (or precedes any interface
/// descriptor, for buffers holding just the functional descriptor).
pub fn parse_capabilities(raw: &[u8]) -> Option<DfuCapabilities> {
    let mut offset = 0;
    let mut in_dfu_interface = true;

    while offset + 2 <= raw.len() {
        let len = raw[offset] as usize;
        if len < 2 || offset + len > raw.len() {
            log::debug!("malformed descriptor at offset {offset}");
            return None;
        }
        let desc = &raw[offset..offset + len];
        match desc[1] {
            INTERFACE_DESC_TYPE if len >= INTERFACE_DESC_LEN => {
                in_dfu_interface =
                    desc[5] == DFU_CLASS && desc[6] == DFU_SUBCLASS;
            }
            DFU_DESC_TYPE if in_dfu_interface && len >= DFU_DESC_LEN => {
                let caps = DfuCapabilities::new(desc);
                if is_supported_version(caps.dfu_version()) {
                    return Some(caps);
                }
                log::warn!(
                    "unsupported DFU version {:#06x}",
                    caps.dfu_version()
                );
            }
            _ => {}
        }
        offset += len;
    }
    None
}
