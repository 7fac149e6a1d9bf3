use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::*;
use nusb::{
    DeviceId, DeviceInfo, Endpoint, MaybeFuture,
    descriptors::TransferType,
    transfer::{
        Buffer, ControlIn, ControlOut, ControlType, Direction, In, Interrupt,
        Out, Recipient, TransferError,
    },
};

use crate::{
    config::HidSettings,
    error::LinkError,
    events::{EventBus, Subscription},
    presence::Presence,
};

const HID_CLASS: u8 = 0x03;

const HID_REQ_GET_REPORT: u8 = 0x01;
const HID_REQ_SET_REPORT: u8 = 0x09;

const HID_REPORT_INPUT: u16 = 0x01;
const HID_REPORT_OUTPUT: u16 = 0x02;
const HID_REPORT_FEATURE: u16 = 0x03;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HidEvent {
    /// One raw input report, report id first.
    Report(Vec<u8>),
    Attached,
    Detached,
}

/// Raw report I/O used by the router.
pub trait HidLink: Send + Sync + 'static {
    fn open(&self) -> bool;

    fn close(&self);

    fn is_open(&self) -> bool;

    /// Write one output report, report id first.
    fn set_output_report(&self, report: &[u8]) -> bool;

    fn subscribe(&self) -> Subscription<HidEvent>;
}

/// Largest reports the device accepts, each counting the report id byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReportLimits {
    pub input_len: usize,
    pub output_len: usize,
    pub feature_len: usize,
}

impl Default for ReportLimits {
    fn default() -> Self {
        let len = 1 + crate::frame::DEFAULT_REPORT_LEN;
        ReportLimits {
            input_len: len,
            output_len: len,
            feature_len: len,
        }
    }
}

impl ReportLimits {
    pub fn output_fits(&self, report: &[u8]) -> bool {
        fits(report, self.output_len)
    }

    pub fn feature_fits(&self, report: &[u8]) -> bool {
        fits(report, self.feature_len)
    }
}

fn fits(report: &[u8], max: usize) -> bool {
    !report.is_empty() && report.len() <= max
}

struct OpenDevice {
    interface: nusb::Interface,
    out_endpoint: Option<Endpoint<Interrupt, Out>>,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

struct Watcher {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// HID device addressed by VID/PID, read through its interrupt IN endpoint.
///
/// Presence of the device is tracked from construction on, whether or not
/// the transport is open.
pub struct HidTransport {
    vendor_id: u16,
    product_id: u16,
    settings: HidSettings,
    events: Arc<EventBus<HidEvent>>,
    device: Mutex<Option<OpenDevice>>,
    watcher: Option<Watcher>,
}

impl HidTransport {
    pub fn new(vendor_id: u16, product_id: u16, settings: HidSettings) -> Self {
        let events = Arc::new(EventBus::new());
        let initial = find_device(vendor_id, product_id).map(|dev| dev.id());
        let watcher = spawn_watcher(
            vendor_id,
            product_id,
            initial,
            settings.presence_poll,
            events.clone(),
        );
        HidTransport {
            vendor_id,
            product_id,
            settings,
            events,
            device: Mutex::new(None),
            watcher,
        }
    }

    /// Read a feature report. Empty when closed or on failure.
    pub fn get_feature(&self, report_id: u8) -> Vec<u8> {
        self.get_report(
            HID_REPORT_FEATURE,
            report_id,
            self.settings.limits.feature_len,
        )
    }

    pub fn set_feature(&self, report: &[u8]) -> bool {
        if !self.settings.limits.feature_fits(report) {
            warn!("Feature report of {} bytes rejected", report.len());
            return false;
        }
        self.set_report(HID_REPORT_FEATURE, report)
    }

    /// Read an input report through the control pipe. Empty when closed or
    /// on failure.
    pub fn get_input_report(&self, report_id: u8) -> Vec<u8> {
        self.get_report(
            HID_REPORT_INPUT,
            report_id,
            self.settings.limits.input_len,
        )
    }

    fn lock(&self) -> MutexGuard<'_, Option<OpenDevice>> {
        crate::lock(&self.device)
    }

    fn try_open(&self) -> Result<OpenDevice, LinkError> {
        let info = find_device(self.vendor_id, self.product_id).ok_or(
            LinkError::NoDevice {
                vid: self.vendor_id,
                pid: self.product_id,
            },
        )?;
        let number = info
            .interfaces()
            .find(|intf| intf.class() == HID_CLASS)
            .map(|intf| intf.interface_number())
            .ok_or(LinkError::NoHidInterface)?;

        let device = info.open().wait()?;
        let interface = device.detach_and_claim_interface(number).wait()?;

        let (in_addr, out_addr) = interrupt_endpoints(&device, number)?;
        let in_endpoint = interface.endpoint::<Interrupt, In>(in_addr)?;
        let out_endpoint = match out_addr {
            Some(addr) => Some(interface.endpoint::<Interrupt, Out>(addr)?),
            None => None,
        };

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = stop.clone();
            let events = self.events.clone();
            let poll = self.settings.read_poll;
            thread::spawn(move || read_loop(in_endpoint, stop, events, poll))
        };
        debug!(
            "Opened HID interface {number} of {:04x}:{:04x}",
            self.vendor_id, self.product_id
        );
        Ok(OpenDevice {
            interface,
            out_endpoint,
            stop,
            reader,
        })
    }

    fn get_report(&self, kind: u16, report_id: u8, len: usize) -> Vec<u8> {
        let guard = self.lock();
        let Some(open) = guard.as_ref() else {
            return Vec::new();
        };
        let Ok(length) = u16::try_from(len) else {
            return Vec::new();
        };
        let result = open
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request: HID_REQ_GET_REPORT,
                    value: kind << 8 | report_id as u16,
                    index: open.interface.interface_number() as u16,
                    length,
                },
                self.settings.control_timeout,
            )
            .wait();
        match result {
            // devices without report ids leave the id out
            Ok(data) if report_id == 0 => {
                let mut report = Vec::with_capacity(data.len() + 1);
                report.push(0);
                report.extend(data);
                report
            }
            Ok(data) => data,
            Err(err) => {
                warn!("GET_REPORT {report_id:#04x} failed: {err}");
                Vec::new()
            }
        }
    }

    fn set_report(&self, kind: u16, report: &[u8]) -> bool {
        let guard = self.lock();
        let Some(open) = guard.as_ref() else {
            return false;
        };
        control_set_report(open, kind, report, self.settings.control_timeout)
    }
}

fn control_set_report(
    open: &OpenDevice,
    kind: u16,
    report: &[u8],
    timeout: Duration,
) -> bool {
    let report_id = report[0];
    let data = if report_id == 0 { &report[1..] } else { report };
    let result = open
        .interface
        .control_out(
            ControlOut {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request: HID_REQ_SET_REPORT,
                value: kind << 8 | report_id as u16,
                index: open.interface.interface_number() as u16,
                data,
            },
            timeout,
        )
        .wait();
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!("SET_REPORT {report_id:#04x} failed: {err}");
            false
        }
    }
}

impl HidLink for HidTransport {
    fn open(&self) -> bool {
        let mut guard = self.lock();
        if guard.is_some() {
            return true;
        }
        match self.try_open() {
            Ok(open) => {
                *guard = Some(open);
                true
            }
            Err(err) => {
                error!("Failed to open HID device: {err}");
                false
            }
        }
    }

    fn close(&self) {
        let open = self.lock().take();
        if let Some(open) = open {
            open.stop.store(true, Ordering::Release);
            if open.reader.join().is_err() {
                warn!("HID read thread panicked");
            }
            debug!(
                "Closed HID device {:04x}:{:04x}",
                self.vendor_id, self.product_id
            );
        }
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn set_output_report(&self, report: &[u8]) -> bool {
        if !self.settings.limits.output_fits(report) {
            warn!("Output report of {} bytes rejected", report.len());
            return false;
        }
        let mut guard = self.lock();
        let Some(open) = guard.as_mut() else {
            return false;
        };
        let timeout = self.settings.control_timeout;
        if open.out_endpoint.is_none() {
            return control_set_report(open, HID_REPORT_OUTPUT, report, timeout);
        }
        let Some(endpoint) = open.out_endpoint.as_mut() else {
            return false;
        };

        let data = if report[0] == 0 { &report[1..] } else { report };
        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);
        let completion = endpoint.transfer_blocking(buf, timeout);
        match completion.status {
            Ok(()) => true,
            Err(err) => {
                warn!("Interrupt OUT transfer failed: {err}");
                false
            }
        }
    }

    fn subscribe(&self) -> Subscription<HidEvent> {
        self.events.subscribe()
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        self.close();
        if let Some(watcher) = self.watcher.take() {
            drop(watcher.stop);
            if watcher.handle.join().is_err() {
                warn!("HID presence watcher panicked");
            }
        }
    }
}

fn find_device(vid: u16, pid: u16) -> Option<DeviceInfo> {
    match nusb::list_devices().wait() {
        Ok(mut devices) => {
            devices.find(|d| d.vendor_id() == vid && d.product_id() == pid)
        }
        Err(err) => {
            warn!("Failed to list USB devices: {err}");
            None
        }
    }
}

/// Interrupt IN (required) and OUT (optional) endpoint addresses of the
/// default alternate setting of `number`.
fn interrupt_endpoints(
    device: &nusb::Device,
    number: u8,
) -> Result<(u8, Option<u8>), LinkError> {
    let config = device.active_configuration().map_err(|err| {
        warn!("No active configuration: {err:?}");
        LinkError::NoInputEndpoint
    })?;
    let alt = config
        .interface_alt_settings()
        .find(|alt| {
            alt.interface_number() == number && alt.alternate_setting() == 0
        })
        .ok_or(LinkError::NoHidInterface)?;

    let mut input = None;
    let mut output = None;
    for ep in alt.endpoints() {
        if ep.transfer_type() != TransferType::Interrupt {
            continue;
        }
        match ep.direction() {
            Direction::In => input = input.or(Some(ep.address())),
            Direction::Out => output = output.or(Some(ep.address())),
        }
    }
    Ok((input.ok_or(LinkError::NoInputEndpoint)?, output))
}

fn read_loop(
    mut endpoint: Endpoint<Interrupt, In>,
    stop: Arc<AtomicBool>,
    events: Arc<EventBus<HidEvent>>,
    poll: Duration,
) {
    let len = endpoint.max_packet_size();
    while !stop.load(Ordering::Acquire) {
        let completion = endpoint.transfer_blocking(Buffer::new(len), poll);
        match completion.status {
            Ok(()) => {
                let mut report = completion.buffer.into_vec();
                report.truncate(completion.actual_len);
                trace!("HID report: {report:02x?}");
                events.publish(HidEvent::Report(report));
            }
            // read timed out
            Err(TransferError::Cancelled) => {}
            Err(TransferError::Disconnected) => {
                debug!("HID device gone, read loop ends");
                break;
            }
            Err(err) => {
                warn!("Interrupt IN transfer failed: {err}");
                thread::sleep(poll);
            }
        }
    }
}

fn spawn_watcher(
    vid: u16,
    pid: u16,
    initial: Option<DeviceId>,
    interval: Duration,
    events: Arc<EventBus<HidEvent>>,
) -> Option<Watcher> {
    let (stop, stopped) = mpsc::channel::<()>();
    let spawned = thread::Builder::new()
        .name("hid-presence".into())
        .spawn(move || {
            let mut presence = Presence::new(initial);
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let found = find_device(vid, pid).map(|dev| dev.id());
                if let Some(event) = presence.update(found) {
                    info!("Device {vid:04x}:{pid:04x}: {event:?}");
                    events.publish(event);
                }
            }
        });
    match spawned {
        Ok(handle) => Some(Watcher { stop, handle }),
        Err(err) => {
            error!("Failed to start presence watcher: {err}");
            None
        }
    }
}
