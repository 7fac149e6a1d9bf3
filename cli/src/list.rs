use dfu::{DfuCapabilities, DfuDevice, find_dfu_devices};

use crate::CliError;

pub(crate) fn list_dfu_devices(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<(), CliError> {
    let devices = find_dfu_devices(vid, pid)?;
    if devices.is_empty() {
        println!("No DFU device found");
    } else {
        print_devices(&devices);
    }
    Ok(())
}

pub(crate) fn print_capabilities(prefix: &str, caps: &DfuCapabilities) {
    println!(
        "{}DFU {:x}.{:02x}, transfer size {} bytes, detach timeout {} ms ({}{}{}{})",
        prefix,
        caps.dfu_version() >> 8,
        caps.dfu_version() & 0xff,
        caps.transfer_size(),
        caps.detach_timeout(),
        if caps.can_download() { "d" } else { "" },
        if caps.can_upload() { "u" } else { "" },
        if caps.manifestation_tolerant() { "m" } else { "" },
        if caps.will_detach() { "w" } else { "" },
    );
}

fn print_devices(devices: &[DfuDevice]) {
    for device in devices {
        println!(
            "Bus {} Device {:03}: ID {:04x}:{:04x} ({}){}",
            device.bus_id(),
            device.device_address(),
            device.vendor_id(),
            device.product_id(),
            if device.is_dfu_mode() { "dfu" } else { "runtime" },
            device
                .product_string()
                .map(|s| format!(" {s}"))
                .unwrap_or_default(),
        );

        match device.capabilities() {
            Ok(caps) => print_capabilities("  ", &caps),
            Err(err) => println!("  capabilities unavailable: {err}"),
        }
    }
}
