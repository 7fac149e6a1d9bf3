use nusb::{
    MaybeFuture,
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
};

use crate::DEFAULT_TIMEOUT;
use crate::descriptor::{DfuCapabilities, parse_capabilities};
use crate::error::*;
use crate::status::{DFU_STATUS_LEN, DfuDeviceStatus, DfuState};

const DFU_CMD_DETACH: u8 = 0;
const DFU_CMD_DOWNLOAD: u8 = 1;
const DFU_CMD_GETSTATUS: u8 = 3;
const DFU_CMD_CLRSTATUS: u8 = 4;
const DFU_CMD_GETSTATE: u8 = 5;
const DFU_CMD_ABORT: u8 = 6;

const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;
const USB_DESC_TYPE_CONFIG: u16 = 0x02;
const CONFIG_DESC_HEADER_LEN: u16 = 9;

/// DFU requests understood by a device in either mode.
///
/// Implemented over USB by [UsbTranslator]; the driver only talks to this
/// trait so that it can be exercised without hardware.
pub trait DfuProtocol: Send {
    /// `DFU_DETACH` with `wValue` = timeout in milliseconds.
    fn detach(&self, timeout: u16) -> Result<(), DfuError>;

    /// `DFU_DNLOAD` of one block, returning the number of bytes accepted.
    fn download(&self, block_nr: u16, data: &[u8]) -> Result<usize, DfuError>;

    fn get_status(&self) -> Result<DfuDeviceStatus, DfuError>;

    fn clear_status(&self) -> Result<(), DfuError>;

    fn abort(&self) -> Result<(), DfuError>;

    /// Current device state, [DfuState::Unknown] if it cannot be read.
    fn get_state(&self) -> DfuState;

    /// Capabilities from the DFU functional descriptor, if one with a
    /// supported version is present.
    fn capabilities(&self) -> Option<DfuCapabilities>;

    /// Bus reset of the device ("comms reset").
    fn reset(&self) -> Result<(), DfuError>;
}

/// [DfuProtocol] over an opened nusb device and claimed DFU interface.
pub struct UsbTranslator {
    device: nusb::Device,
    interface: nusb::Interface,
}

impl UsbTranslator {
    pub(crate) fn new(
        device: nusb::Device,
        interface: nusb::Interface,
    ) -> Self {
        UsbTranslator { device, interface }
    }

    pub fn interface_number(&self) -> u8 {
        self.interface.interface_number()
    }

    fn config_descriptor(&self) -> Result<Vec<u8>, DfuError> {
        let header = self.descriptor_in(CONFIG_DESC_HEADER_LEN)?;
        if header.len() < 4 {
            return Err(DfuError::ShortResponse {
                expected: 4,
                actual: header.len(),
            });
        }
        let total_len = u16::from_le_bytes([header[2], header[3]]);
        self.descriptor_in(total_len)
    }

    fn descriptor_in(&self, length: u16) -> Result<Vec<u8>, DfuError> {
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Device,
                    request: USB_REQ_GET_DESCRIPTOR,
                    value: USB_DESC_TYPE_CONFIG << 8,
                    index: 0,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn dfu_cmd_out(
        &self,
        req: u8,
        value: u16,
        data: &[u8],
    ) -> Result<(), DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    data,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }

    fn dfu_cmd_in(
        &self,
        req: u8,
        value: u16,
        length: u16,
    ) -> Result<Vec<u8>, DfuError> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: req,
                    value,
                    index,
                    length,
                },
                DEFAULT_TIMEOUT,
            )
            .wait()?)
    }
}

impl DfuProtocol for UsbTranslator {
    fn detach(&self, timeout: u16) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_DETACH, timeout, &[])
    }

    fn download(&self, block_nr: u16, data: &[u8]) -> Result<usize, DfuError> {
        self.dfu_cmd_out(DFU_CMD_DOWNLOAD, block_nr, data)?;
        Ok(data.len())
    }

    fn get_status(&self) -> Result<DfuDeviceStatus, DfuError> {
        let data = self.dfu_cmd_in(DFU_CMD_GETSTATUS, 0, DFU_STATUS_LEN)?;
        DfuDeviceStatus::from_raw(&data)
    }

    fn clear_status(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_CLRSTATUS, 0, &[])
    }

    fn abort(&self) -> Result<(), DfuError> {
        self.dfu_cmd_out(DFU_CMD_ABORT, 0, &[])
    }

    fn get_state(&self) -> DfuState {
        match self.dfu_cmd_in(DFU_CMD_GETSTATE, 0, 1) {
            Ok(data) if !data.is_empty() => DfuState::from(data[0]),
            Ok(_) => DfuState::Unknown,
            Err(err) => {
                log::debug!("DFU_GETSTATE failed: {err}");
                DfuState::Unknown
            }
        }
    }

    fn capabilities(&self) -> Option<DfuCapabilities> {
        match self.config_descriptor() {
            Ok(raw) => parse_capabilities(&raw),
            Err(err) => {
                log::warn!("reading configuration descriptor failed: {err}");
                None
            }
        }
    }

    fn reset(&self) -> Result<(), DfuError> {
        Ok(self.device.reset().wait()?)
    }
}
