use crate::status::DfuState;

#[derive(Debug)]
pub enum DfuError {
    Usb(nusb::Error),
    Transfer(nusb::transfer::TransferError),
    Status(u8),
    ShortResponse { expected: usize, actual: usize },
    NoDevice { vid: u16, pid: u16 },
    DeviceTimeout { vid: u16, pid: u16 },
    NoCapabilities,
    AlreadyInDfu,
    NotInDfu,
    InvalidState(DfuState),
    ControlTransfer { block_nr: u32 },
    Timeout,
    FileRead(std::io::Error),
    Aborted,
}

/// Stable result codes handed to hosts that cannot consume [DfuError].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuStatusCode {
    Ok = 0,
    ErrArgumentNull = 1,
    ErrNotInDfu = 2,
    ErrFileRead = 3,
    ErrControlTransfer = 4,
    ErrInvalidDfuState = 5,
    ErrUnknown = 6,
    ErrAborted = 7,
    ErrDeviceNotFound = 8,
}

impl DfuError {
    pub fn status_code(&self) -> DfuStatusCode {
        match self {
            DfuError::NotInDfu | DfuError::AlreadyInDfu => {
                DfuStatusCode::ErrNotInDfu
            }
            DfuError::FileRead(_) => DfuStatusCode::ErrFileRead,
            DfuError::ControlTransfer { .. }
            | DfuError::Transfer(_)
            | DfuError::ShortResponse { .. } => {
                DfuStatusCode::ErrControlTransfer
            }
            DfuError::InvalidState(_) | DfuError::Status(_) => {
                DfuStatusCode::ErrInvalidDfuState
            }
            DfuError::Aborted => DfuStatusCode::ErrAborted,
            DfuError::NoDevice { .. }
            | DfuError::DeviceTimeout { .. }
            | DfuError::NoCapabilities => DfuStatusCode::ErrDeviceNotFound,
            DfuError::Usb(_) | DfuError::Timeout => DfuStatusCode::ErrUnknown,
        }
    }
}

impl std::error::Error for DfuError {}

impl std::fmt::Display for DfuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DfuError::Usb(err) => write!(f, "USB error: {}", err),
            DfuError::Transfer(err) => write!(f, "Transfer error: {}", err),
            DfuError::Status(code) => {
                write!(f, "DFU status error: code {}", code)
            }
            DfuError::ShortResponse { expected, actual } => {
                write!(f, "Short response: {actual} of {expected} bytes")
            }
            DfuError::NoDevice { vid, pid } => {
                write!(f, "No device {vid:04x}:{pid:04x}")
            }
            DfuError::DeviceTimeout { vid, pid } => {
                write!(f, "Device {vid:04x}:{pid:04x} did not appear in time")
            }
            DfuError::NoCapabilities => {
                write!(f, "No usable DFU functional descriptor")
            }
            DfuError::AlreadyInDfu => write!(f, "Already in DFU mode"),
            DfuError::NotInDfu => write!(f, "Not in DFU mode"),
            DfuError::InvalidState(state) => {
                write!(f, "Invalid DFU state: {state:?}")
            }
            DfuError::ControlTransfer { block_nr } => {
                write!(f, "Control transfer failed for block {block_nr}")
            }
            DfuError::Timeout => {
                write!(f, "Timeout")
            }
            DfuError::FileRead(err) => {
                write!(f, "Firmware read error: {}", err)
            }
            DfuError::Aborted => write!(f, "Download aborted"),
        }
    }
}

impl From<nusb::Error> for DfuError {
    fn from(err: nusb::Error) -> Self {
        DfuError::Usb(err)
    }
}

impl From<nusb::transfer::TransferError> for DfuError {
    fn from(err: nusb::transfer::TransferError) -> Self {
        DfuError::Transfer(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DfuError::NotInDfu.status_code(),
            DfuStatusCode::ErrNotInDfu
        );
        assert_eq!(
            DfuError::ControlTransfer { block_nr: 3 }.status_code(),
            DfuStatusCode::ErrControlTransfer
        );
        assert_eq!(
            DfuError::InvalidState(DfuState::DfuError).status_code(),
            DfuStatusCode::ErrInvalidDfuState
        );
        assert_eq!(DfuError::Timeout.status_code(), DfuStatusCode::ErrUnknown);
        let io = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        assert_eq!(
            DfuError::FileRead(io).status_code(),
            DfuStatusCode::ErrFileRead
        );
    }
}
