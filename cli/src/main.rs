use std::{path::PathBuf, process::ExitCode};

use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;

use dfu::{DfuDevice, find_dfu_devices};
use error::CliError;
use link::IdConfig;
use list::*;
use monitor::*;
use status::*;
use update::*;

mod error;
mod list;
mod monitor;
mod status;
mod update;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Identities of the peripheral in application and DFU mode.
#[derive(Args)]
struct DeviceIds {
    /// vendor ID (ex: "0483")
    #[clap(short, long, env = "PDFU_VENDOR_ID")]
    vendor: Option<String>,
    /// application product ID (ex: "5740")
    #[clap(short, long, env = "PDFU_PRODUCT_ID")]
    product: Option<String>,
    /// DFU mode product ID (ex: "df11")
    #[clap(short, long, env = "PDFU_DFU_PRODUCT_ID")]
    dfu_product: Option<String>,
}

impl From<DeviceIds> for IdConfig {
    fn from(ids: DeviceIds) -> Self {
        IdConfig {
            vendor: ids.vendor,
            product: ids.product,
            dfu_product: ids.dfu_product,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// list DFU devices
    List {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// show status of a device in DFU mode
    Status {
        /// vendor ID (ex: "0483")
        #[clap(short, long, value_parser=hex_u16)]
        vendor: Option<u16>,
        /// product ID (ex: "df11")
        #[clap(short, long, value_parser=hex_u16)]
        product: Option<u16>,
    },
    /// install a firmware image (payload followed by its 16 byte signature)
    Update {
        /// firmware image
        file: PathBuf,
        #[command(flatten)]
        ids: DeviceIds,
    },
    /// print messages and presence changes of a peripheral
    Monitor {
        #[command(flatten)]
        ids: DeviceIds,
        /// stop after this many seconds
        #[clap(short, long)]
        seconds: Option<u64>,
    },
    /// send one message to a peripheral
    Send {
        /// HID report ID (ex: 2, 0x05)
        #[clap(value_parser=maybe_hex::<u8>)]
        report_id: u8,
        /// message payload in hex (ex: "01a0ff")
        #[clap(value_parser=parse_hex_bytes)]
        data: Payload,
        #[command(flatten)]
        ids: DeviceIds,
        /// print replies received within this many milliseconds
        #[clap(short, long, default_value_t = 500)]
        wait: u64,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::List {
            vendor: None,
            product: None,
        }
    }
}

fn hex_u16(s: &str) -> Result<u16, String> {
    link::parse_hex_id(s).ok_or_else(|| format!("invalid hex ID {s:?}"))
}

#[derive(Clone, Debug, PartialEq)]
struct Payload(Vec<u8>);

fn parse_hex_bytes(s: &str) -> Result<Payload, String> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err("expected pairs of hex digits".into());
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| format!("{e}"))
        })
        .collect::<Result<_, _>>()
        .map(Payload)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    env_logger::init();

    if let Err(err) = match cli.command.unwrap_or_default() {
        Commands::List { vendor, product } => {
            list_dfu_devices(vendor, product)
        }
        Commands::Status { vendor, product } => {
            get_dfu_device(vendor, product).and_then(print_status)
        }
        Commands::Update { file, ids } => update(&file, ids.into()),
        Commands::Monitor { ids, seconds } => monitor(ids.into(), seconds),
        Commands::Send {
            report_id,
            data,
            ids,
            wait,
        } => send(ids.into(), report_id, data.0, wait),
    } {
        eprintln!("Error: {err}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn get_dfu_device(
    vid: Option<u16>,
    pid: Option<u16>,
) -> Result<DfuDevice, CliError> {
    let mut devices = find_dfu_devices(vid, pid)?.into_iter();
    match (devices.next(), devices.next()) {
        (None, _) => Err(CliError::NoDFUDevice),
        (Some(_), Some(_)) => Err(CliError::ManyDFUDevices),
        (Some(device), None) => Ok(device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("01a0FF"), Ok(Payload(vec![1, 160, 255])));
        assert_eq!(
            parse_hex_bytes("de:ad be ef"),
            Ok(Payload(vec![0xde, 0xad, 0xbe, 0xef]))
        );
        assert_eq!(parse_hex_bytes(""), Ok(Payload(vec![])));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("é1").is_err());
    }

    #[test]
    fn test_hex_u16() {
        assert_eq!(hex_u16("df11"), Ok(0xdf11));
        assert_eq!(hex_u16("0x0483"), Ok(0x0483));
        assert!(hex_u16("10000").is_err());
    }
}
