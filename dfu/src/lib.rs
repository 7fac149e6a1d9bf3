//! USB Device Firmware Upgrade (DFU) host side based on [`nusb`]
//!
//! Provides the DFU 1.1 request set ([DfuProtocol], implemented over USB by
//! [UsbTranslator]) and a [DfuDriver] that takes a peripheral from its
//! application personality into DFU mode, downloads and installs an image,
//! and brings it back.
//!
//! Useful references:
//! - DFU: [USB Device Firmware Upgrade Specification, Revision 1.1](https://www.usb.org/sites/default/files/DFU_1.1.pdf)
//!
//! # Example
//!
//! The following example shows how to obtain a `Vec` of [DfuDevice]:
//! ```
//! use dfu::find_dfu_devices;
//!
//! match find_dfu_devices(None, None) {
//!     Ok(devices) => {
//!         if devices.is_empty() {
//!             println!("No DFU devices found");
//!         } else {
//!             println!("Found {} DFU devices", devices.len());
//!         }
//!     }
//!     Err(e) => println!("Error: {e}"),
//! }
//! ```
//!
//! [`nusb`]: https://docs.rs/nusb

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000u64);
pub(crate) const DEFAULT_TRANSFER_SIZE: u16 = 1024 * 2;

mod descriptor;
mod device;
mod driver;
mod error;
mod settings;
mod status;
mod translator;

use std::time::Duration;

// Re-exports
pub use descriptor::{
    DFU_VERSION_1_0, DFU_VERSION_1_1, DfuCapabilities, parse_capabilities,
};
pub use device::{DeviceOpener, DfuDevice, UsbOpener, find_dfu_devices};
pub use driver::{AbortHandle, DeviceIdentity, DfuDriver, DfuModeFlag};
pub use error::{DfuError, DfuStatusCode};
pub use settings::{DfuTimings, FIRMWARE_SIGNATURE_LEN};
pub use status::{DfuDeviceStatus, DfuState};
pub use translator::{DfuProtocol, UsbTranslator};
