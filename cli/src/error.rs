use std::{fmt::Display, io};

use dfu::DfuError;
use link::{ConfigError, LinkError};

pub enum CliError {
    IO(io::Error),
    Dfu(DfuError),
    Link(LinkError),
    Config(ConfigError),
    NoDFUDevice,
    ManyDFUDevices,
    LinkUnavailable,
}

impl From<io::Error> for CliError {
    fn from(value: io::Error) -> Self {
        CliError::IO(value)
    }
}

impl From<DfuError> for CliError {
    fn from(value: DfuError) -> Self {
        CliError::Dfu(value)
    }
}

impl From<LinkError> for CliError {
    fn from(value: LinkError) -> Self {
        CliError::Link(value)
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        CliError::Config(value)
    }
}

impl Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::IO(err) => write!(f, "IO error: {err}"),
            CliError::Dfu(err) => {
                write!(f, "DFU error ({:?}): {err}", err.status_code())
            }
            CliError::Link(err) => write!(f, "{err}"),
            CliError::Config(err) => write!(f, "Configuration error: {err}"),
            CliError::NoDFUDevice => write!(f, "No DFU device"),
            CliError::ManyDFUDevices => write!(f, "More than one DFU devices"),
            CliError::LinkUnavailable => {
                write!(f, "Could not open the peripheral")
            }
        }
    }
}
