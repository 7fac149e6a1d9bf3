#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    Truncated { len: usize },
    BadLength { length: usize, max: usize },
    TooLarge { len: usize },
}

impl std::error::Error for FrameError {}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Truncated { len } => {
                write!(f, "Truncated report ({len} bytes)")
            }
            FrameError::BadLength { length, max } => {
                write!(f, "Packet length {length} exceeds {max}")
            }
            FrameError::TooLarge { len } => {
                write!(f, "Message of {len} bytes does not fit the framing")
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Missing(&'static str),
    InvalidHex { name: &'static str, value: String },
}

impl std::error::Error for ConfigError {}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(name) => write!(f, "Missing {name}"),
            ConfigError::InvalidHex { name, value } => {
                write!(f, "Invalid {name}: {value:?} is not a 16-bit hex id")
            }
        }
    }
}

#[derive(Debug)]
pub enum LinkError {
    NotConfigured,
    NotOpen,
    DfuBusy,
    NoDevice { vid: u16, pid: u16 },
    NoHidInterface,
    NoInputEndpoint,
    Usb(nusb::Error),
    Frame(FrameError),
    Io(std::io::Error),
}

impl std::error::Error for LinkError {}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::NotConfigured => write!(f, "Transport not configured"),
            LinkError::NotOpen => write!(f, "Transport not open"),
            LinkError::DfuBusy => {
                write!(f, "Another DFU operation is in progress")
            }
            LinkError::NoDevice { vid, pid } => {
                write!(f, "No device {vid:04x}:{pid:04x} connected")
            }
            LinkError::NoHidInterface => {
                write!(f, "Device has no HID interface")
            }
            LinkError::NoInputEndpoint => {
                write!(f, "HID interface has no interrupt IN endpoint")
            }
            LinkError::Usb(err) => write!(f, "USB error: {err}"),
            LinkError::Frame(err) => write!(f, "Framing error: {err}"),
            LinkError::Io(err) => write!(f, "IO error: {err}"),
        }
    }
}

impl From<FrameError> for LinkError {
    fn from(err: FrameError) -> Self {
        LinkError::Frame(err)
    }
}

impl From<nusb::Error> for LinkError {
    fn from(err: nusb::Error) -> Self {
        LinkError::Usb(err)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Io(err)
    }
}
