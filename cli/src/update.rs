use std::{
    fs::File,
    io::{self, Write},
    path::Path,
    sync::Arc,
};

use dfu::{DfuDriver, DfuTimings, UsbOpener};
use link::IdConfig;

use crate::CliError;

pub(crate) fn update(file: &Path, ids: IdConfig) -> Result<(), CliError> {
    let identity = ids.resolve()?;
    let mut firmware = File::open(file)?;

    let mut driver =
        DfuDriver::new(identity, Arc::new(UsbOpener), DfuTimings::default());

    println!("Entering DFU mode...");
    driver.enter_dfu_mode()?;

    let result = driver.download(&mut firmware, print_progress);
    println!();
    result?;
    println!("  {} blocks installed", driver.block_number());

    println!("Leaving DFU mode...");
    driver.exit_dfu_mode()?;
    Ok(())
}

fn print_progress(percentage: u8) {
    let filled = 60 * percentage as usize / 100;
    print!(
        "\r  Flashing {:3}% [{}]",
        percentage,
        "#".repeat(filled) + &" ".repeat(60 - filled)
    );
    let _ = io::stdout().flush();
}
