//! Main crate

use std::{io::Cursor, sync::Arc, time::Duration};

use dfu::{DfuStatusCode, UsbOpener};
use link::{
    ConfigError, DfuTask, HidSettings, HidTransport, IdConfig, LinkError,
    Message, Subscription, Transport, TransportEvent, TransportSettings,
};

#[cxx::bridge]
mod ffi {

    enum LinkEventKind {
        DeviceAttached,
        DeviceDetached,
        DownloadProgressed,
        MessageReceived,
        DfuCompleted,
    }

    struct LinkEvent {
        kind: LinkEventKind,
        percent: u8,
        report_id: u8,
        data: Vec<u8>,
        status: u8,
    }

    extern "Rust" {
        type PeripheralLink;

        #[Self = "PeripheralLink"]
        fn connect(
            vendor: &str,
            product: &str,
            dfu_product: &str,
        ) -> Result<Box<PeripheralLink>>;

        fn open(&self) -> bool;
        fn close(&self);
        fn send_message(&self, report_id: u8, data: &[u8]) -> bool;

        fn enter_dfu_mode(&mut self) -> bool;
        fn exit_dfu_mode(&mut self) -> bool;
        fn download(&mut self, firmware: &[u8]) -> u8;
        fn abort_download(&self) -> bool;
        fn in_dfu_mode(&self) -> bool;
        fn dfu_busy(&self) -> bool;

        fn next_event(
            &mut self,
            timeout_ms: u32,
            event: &mut LinkEvent,
        ) -> bool;
    }
}

/// A peripheral as seen by the host: framed messaging plus firmware update.
///
/// DFU operations run in the background; their outcome is reported by
/// [PeripheralLink::next_event] as a `DfuCompleted` event carrying a
/// [DfuStatusCode].
pub struct PeripheralLink {
    transport: Transport<HidTransport>,
    events: Subscription<TransportEvent>,
    tasks: Vec<DfuTask>,
}

impl PeripheralLink {
    fn connect(
        vendor: &str,
        product: &str,
        dfu_product: &str,
    ) -> Result<Box<PeripheralLink>, ConfigError> {
        let ids = IdConfig::new(vendor, product, dfu_product);
        let identity = ids.resolve()?;
        let hid = Arc::new(HidTransport::new(
            identity.vendor_id,
            identity.product_id,
            HidSettings::default(),
        ));
        let transport = Transport::new(
            hid,
            Arc::new(UsbOpener),
            TransportSettings::default(),
        );
        transport.configure(&ids);
        let events = transport.subscribe();
        Ok(Box::new(PeripheralLink {
            transport,
            events,
            tasks: Vec::new(),
        }))
    }

    fn open(&self) -> bool {
        self.transport.open()
    }

    fn close(&self) {
        self.transport.close()
    }

    fn send_message(&self, report_id: u8, data: &[u8]) -> bool {
        match self.transport.send_message(Message::new(report_id, data)) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Report {report_id:#04x} not sent: {err}");
                false
            }
        }
    }

    fn enter_dfu_mode(&mut self) -> bool {
        let task = self.transport.enter_dfu_mode();
        self.start(task) == DfuStatusCode::Ok
    }

    fn exit_dfu_mode(&mut self) -> bool {
        let task = self.transport.exit_dfu_mode();
        self.start(task) == DfuStatusCode::Ok
    }

    /// Start installing `firmware`. [DfuStatusCode::Ok] means the download
    /// was started, not that it succeeded.
    fn download(&mut self, firmware: &[u8]) -> u8 {
        if firmware.is_empty() {
            return DfuStatusCode::ErrArgumentNull as u8;
        }
        let task = self.transport.download(Cursor::new(firmware.to_vec()));
        self.start(task) as u8
    }

    fn abort_download(&self) -> bool {
        self.transport.abort_download()
    }

    fn in_dfu_mode(&self) -> bool {
        self.transport.in_dfu_mode()
    }

    fn dfu_busy(&self) -> bool {
        self.transport.dfu_busy()
    }

    /// Wait up to `timeout_ms` for the next event and store it in `event`.
    fn next_event(
        &mut self,
        timeout_ms: u32,
        event: &mut ffi::LinkEvent,
    ) -> bool {
        if let Some(status) = self.finished_task() {
            *event = ffi::LinkEvent::completed(status);
            return true;
        }
        let timeout = Duration::from_millis(timeout_ms.into());
        match self.events.recv_timeout(timeout) {
            Some(received) => {
                *event = received.into();
                true
            }
            None => match self.finished_task() {
                Some(status) => {
                    *event = ffi::LinkEvent::completed(status);
                    true
                }
                None => false,
            },
        }
    }

    fn start(&mut self, task: Result<DfuTask, LinkError>) -> DfuStatusCode {
        match task {
            Ok(task) => {
                self.tasks.push(task);
                DfuStatusCode::Ok
            }
            Err(err) => {
                log::warn!("DFU operation not started: {err}");
                match err {
                    LinkError::NotConfigured => DfuStatusCode::ErrNotInDfu,
                    _ => DfuStatusCode::ErrUnknown,
                }
            }
        }
    }

    fn finished_task(&mut self) -> Option<DfuStatusCode> {
        let index = self.tasks.iter().position(|t| t.is_finished())?;
        let status = match self.tasks.remove(index).join() {
            Ok(Ok(())) => DfuStatusCode::Ok,
            Ok(Err(err)) => err.status_code(),
            Err(_) => DfuStatusCode::ErrUnknown,
        };
        Some(status)
    }
}

impl ffi::LinkEvent {
    fn completed(status: DfuStatusCode) -> Self {
        ffi::LinkEvent {
            kind: ffi::LinkEventKind::DfuCompleted,
            percent: 0,
            report_id: 0,
            data: Vec::new(),
            status: status as u8,
        }
    }
}

impl From<TransportEvent> for ffi::LinkEvent {
    fn from(event: TransportEvent) -> Self {
        let (kind, percent, report_id, data) = match event {
            TransportEvent::DeviceAttached => {
                (ffi::LinkEventKind::DeviceAttached, 0, 0, Vec::new())
            }
            TransportEvent::DeviceDetached => {
                (ffi::LinkEventKind::DeviceDetached, 0, 0, Vec::new())
            }
            TransportEvent::DownloadProgressed(percent) => (
                ffi::LinkEventKind::DownloadProgressed,
                percent,
                0,
                Vec::new(),
            ),
            TransportEvent::MessageReceived(message) => (
                ffi::LinkEventKind::MessageReceived,
                0,
                message.report_id,
                message.data,
            ),
        };
        ffi::LinkEvent {
            kind,
            percent,
            report_id,
            data,
            status: DfuStatusCode::Ok as u8,
        }
    }
}
