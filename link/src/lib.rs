//! Framed message link to a USB HID peripheral
//!
//! A [Transport] serializes outbound [Message]s into HID output reports,
//! reassembles inbound reports into messages and publishes them, together
//! with device presence changes, as [TransportEvent]s. Firmware updates are
//! delegated to a [dfu::DfuDriver] bound to the same peripheral.
//!
//! [HidTransport] is the [HidLink] over real hardware:
//! ```no_run
//! use std::sync::Arc;
//!
//! use dfu::UsbOpener;
//! use link::{HidSettings, HidTransport, IdConfig, Transport};
//!
//! let ids = IdConfig::new("0483", "5740", "df11");
//! let hid = Arc::new(HidTransport::new(0x0483, 0x5740, HidSettings::default()));
//! let transport = Transport::new(hid, Arc::new(UsbOpener), Default::default());
//! if transport.configure(&ids) && transport.open() {
//!     let events = transport.subscribe();
//!     while let Some(event) = events.recv_timeout(std::time::Duration::from_secs(1)) {
//!         println!("{event:?}");
//!     }
//! }
//! ```

mod config;
mod error;
mod events;
mod frame;
mod hid;
mod presence;
mod reassembly;
mod router;

use std::sync::{Mutex, MutexGuard};

// Re-exports
pub use config::{HidSettings, IdConfig, TransportSettings, parse_hex_id};
pub use error::{ConfigError, FrameError, LinkError};
pub use events::{EventBus, Subscription, TransportEvent};
pub use frame::{
    DATA_REPORT_ID, DEFAULT_REPORT_LEN, FrameFormat, Message, Packet, packetize,
};
pub use hid::{HidEvent, HidLink, HidTransport, ReportLimits};
pub use presence::Presence;
pub use reassembly::{Reassembler, Reassembly};
pub use router::{DfuTask, Transport};

/// Lock ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
