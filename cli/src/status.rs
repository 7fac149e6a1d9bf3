use dfu::{DfuDevice, DfuProtocol};

use crate::{CliError, list::print_capabilities};

pub(crate) fn print_status(device: DfuDevice) -> Result<(), CliError> {
    if !device.is_dfu_mode() {
        println!(
            "Device {:04x}:{:04x} is in runtime mode",
            device.vendor_id(),
            device.product_id()
        );
    }
    let translator = device.connect()?;
    let status = translator.get_status()?;
    println!("State:        {:?}", status.state);
    println!("Status:       0x{:02x}", status.status);
    println!("Poll timeout: {} ms", status.poll_timeout);
    if let Some(caps) = translator.capabilities() {
        print_capabilities("", &caps);
    }
    Ok(status.ok()?)
}
