use nusb::{self, MaybeFuture};

use crate::{
    DfuError,
    descriptor::*,
    translator::{DfuProtocol, UsbTranslator},
};

const DFU_PROTOCOL_DFU_MODE: u8 = 0x2;

/// USB device exposing a DFU interface, either in run-time (application)
/// mode or in DFU mode.
pub struct DfuDevice {
    dev: nusb::DeviceInfo,
    interface: u8,
    protocol: u8,
}

impl DfuDevice {
    fn from_device_info(dev: nusb::DeviceInfo) -> Option<Self> {
        let intf = dev
            .interfaces()
            .find(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)?;
        let interface = intf.interface_number();
        let protocol = intf.protocol();
        Some(DfuDevice {
            dev,
            interface,
            protocol,
        })
    }

    pub fn device_info(&self) -> &nusb::DeviceInfo {
        &self.dev
    }

    pub fn bus_id(&self) -> &str {
        self.dev.bus_id()
    }

    pub fn device_address(&self) -> u8 {
        self.dev.device_address()
    }

    pub fn vendor_id(&self) -> u16 {
        self.dev.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.dev.product_id()
    }

    pub fn product_string(&self) -> Option<&str> {
        self.dev.product_string()
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }

    /// The DFU interface advertises the DFU-mode protocol rather than the
    /// run-time one.
    pub fn is_dfu_mode(&self) -> bool {
        self.protocol == DFU_PROTOCOL_DFU_MODE
    }

    /// Open the device and claim its DFU interface.
    pub fn connect(&self) -> Result<UsbTranslator, DfuError> {
        let dev = self.dev.open().wait()?;
        let interface = dev.claim_interface(self.interface).wait()?;
        Ok(UsbTranslator::new(dev, interface))
    }

    /// Query the DFU functional descriptor of this device.
    pub fn capabilities(&self) -> Result<DfuCapabilities, DfuError> {
        self.connect()?
            .capabilities()
            .ok_or(DfuError::NoCapabilities)
    }
}

fn is_dfu_device(dev: &nusb::DeviceInfo) -> bool {
    dev.interfaces()
        .any(|i| i.class() == DFU_CLASS && i.subclass() == DFU_SUBCLASS)
}

pub fn find_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<Vec<DfuDevice>, DfuError> {
    let devices = nusb::list_devices()
        .wait()?
        .filter(|dev| {
            vid.is_none_or(|id| dev.vendor_id() == id)
                && pid.is_none_or(|id| dev.product_id() == id)
        })
        .filter(is_dfu_device)
        .filter_map(DfuDevice::from_device_info)
        .collect();
    Ok(devices)
}

/// Source of [DfuProtocol] connections for a VID/PID pair.
///
/// One call is one discovery attempt; callers own the retry policy.
pub trait DeviceOpener: Send + Sync {
    fn open(
        &self,
        vid: u16,
        pid: u16,
    ) -> Result<Box<dyn DfuProtocol>, DfuError>;
}

/// Opens the first matching device on the local USB bus.
#[derive(Clone, Copy, Debug, Default)]
pub struct UsbOpener;

impl DeviceOpener for UsbOpener {
    fn open(
        &self,
        vid: u16,
        pid: u16,
    ) -> Result<Box<dyn DfuProtocol>, DfuError> {
        let device = find_dfu_devices(Some(vid), Some(pid))?
            .into_iter()
            .next()
            .ok_or(DfuError::NoDevice { vid, pid })?;
        log::debug!(
            "opening {:04x}:{:04x} at bus {} address {}",
            vid,
            pid,
            device.bus_id(),
            device.device_address()
        );
        Ok(Box::new(device.connect()?))
    }
}
