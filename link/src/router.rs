use std::{
    io::{Read, Seek},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use dfu::{
    AbortHandle, DeviceIdentity, DeviceOpener, DfuDriver, DfuError,
    DfuModeFlag,
};
use log::*;

use crate::{
    config::{IdConfig, TransportSettings},
    error::LinkError,
    events::{EventBus, Subscription, TransportEvent},
    frame::{FrameFormat, Message, Packet, packetize},
    hid::{HidEvent, HidLink},
    lock,
    reassembly::{Reassembler, Reassembly},
};

/// A DFU operation running on its own thread.
pub type DfuTask = JoinHandle<Result<(), DfuError>>;

/// Whether a firmware update currently owns the device.
#[derive(Default)]
struct DfuActivity {
    busy: AtomicBool,
    mode: Mutex<Option<DfuModeFlag>>,
}

impl DfuActivity {
    fn active(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
            || lock(&self.mode).as_ref().is_some_and(|m| m.is_set())
    }
}

struct BusyGuard(Arc<DfuActivity>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct DfuSession {
    identity: DeviceIdentity,
    driver: Arc<Mutex<DfuDriver>>,
    abort: AbortHandle,
}

struct Worker<T> {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<T>,
}

/// Packets of one message, written back to back.
type Outbound = Vec<Packet>;

struct Running {
    queue: Sender<Outbound>,
    transmitter: Worker<Receiver<Outbound>>,
    dispatcher: Worker<()>,
}

/// Message router between the application and one HID peripheral.
///
/// While open, outbound messages are written by a single transmitter
/// thread and every inbound HID event is handled by a single dispatcher
/// thread, which owns the reassembly buffer.
pub struct Transport<H: HidLink> {
    hid: Arc<H>,
    opener: Arc<dyn DeviceOpener>,
    settings: TransportSettings,
    identity: Mutex<Option<DeviceIdentity>>,
    events: Arc<EventBus<TransportEvent>>,
    running: Mutex<Option<Running>>,
    session: Mutex<Option<DfuSession>>,
    activity: Arc<DfuActivity>,
}

impl<H: HidLink> Transport<H> {
    pub fn new(
        hid: Arc<H>,
        opener: Arc<dyn DeviceOpener>,
        settings: TransportSettings,
    ) -> Self {
        Transport {
            hid,
            opener,
            settings,
            identity: Mutex::new(None),
            events: Arc::new(EventBus::new()),
            running: Mutex::new(None),
            session: Mutex::new(None),
            activity: Arc::new(DfuActivity::default()),
        }
    }

    /// Bind the transport to the ids in `ids`. On any missing or invalid id
    /// the transport is left unconfigured and `false` is returned.
    pub fn configure(&self, ids: &IdConfig) -> bool {
        match ids.resolve() {
            Ok(identity) => {
                info!(
                    "Configured for {:04x}:{:04x} (DFU {:04x}:{:04x})",
                    identity.vendor_id,
                    identity.product_id,
                    identity.vendor_id,
                    identity.dfu_product_id
                );
                *lock(&self.identity) = Some(identity);
                true
            }
            Err(err) => {
                error!("Invalid device configuration: {err}");
                *lock(&self.identity) = None;
                false
            }
        }
    }

    pub fn identity(&self) -> Option<DeviceIdentity> {
        *lock(&self.identity)
    }

    pub fn subscribe(&self) -> Subscription<TransportEvent> {
        self.events.subscribe()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.running).is_some()
    }

    pub fn open(&self) -> bool {
        let mut running = lock(&self.running);
        if running.is_some() {
            return true;
        }

        // subscribe first so no report is missed
        let inbound = self.hid.subscribe();
        if !self.hid.open() {
            return false;
        }

        let (queue, outbound) = mpsc::channel();
        let transmitter = {
            let stop = Arc::new(AtomicBool::new(false));
            let hid = self.hid.clone();
            let settings = self.settings.clone();
            let closing = stop.clone();
            let handle = thread::spawn(move || {
                transmit_loop(&*hid, outbound, &closing, &settings)
            });
            Worker { stop, handle }
        };
        let dispatcher = {
            let stop = Arc::new(AtomicBool::new(false));
            let dispatch = Dispatcher {
                hid: self.hid.clone(),
                events: self.events.clone(),
                activity: self.activity.clone(),
                format: self.settings.frame,
                reassembler: Reassembler::new(
                    self.settings.frame.max_packet_size(),
                ),
            };
            let poll = self.settings.dequeue_poll;
            let stopping = stop.clone();
            let handle = thread::spawn(move || {
                dispatch.run(inbound, &stopping, poll)
            });
            Worker { stop, handle }
        };

        *running = Some(Running {
            queue,
            transmitter,
            dispatcher,
        });
        debug!("Transport opened");
        true
    }

    /// Stop the transmitter and dispatcher and close the HID link. Messages
    /// still queued are dropped.
    pub fn close(&self) {
        let Some(running) = lock(&self.running).take() else {
            return;
        };
        let Running {
            queue,
            transmitter,
            dispatcher,
        } = running;

        transmitter.stop.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + self.settings.close_join;
        while !transmitter.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if transmitter.handle.is_finished() {
            match transmitter.handle.join() {
                Ok(remaining) => {
                    let dropped = remaining.try_iter().count();
                    if dropped > 0 {
                        info!("Dropped {dropped} queued messages on close");
                    }
                }
                Err(_) => warn!("Transmitter thread panicked"),
            }
        } else {
            warn!(
                "Transmitter did not stop within {:?}",
                self.settings.close_join
            );
        }
        drop(queue);

        dispatcher.stop.store(true, Ordering::SeqCst);
        if dispatcher.handle.join().is_err() {
            warn!("Dispatcher thread panicked");
        }

        self.hid.close();
        debug!("Transport closed");
    }

    /// Queue `message` for sending. A message the framing cannot carry is
    /// rejected before it is queued.
    pub fn send_message(&self, message: Message) -> Result<(), LinkError> {
        let running = lock(&self.running);
        let Some(running) = running.as_ref() else {
            debug!(
                "Message for report {:#04x} not queued: closed",
                message.report_id
            );
            return Err(LinkError::NotOpen);
        };
        let packets = packetize(&message, &self.settings.frame)?;
        running
            .queue
            .send(packets)
            .map_err(|_| LinkError::NotOpen)
    }

    pub fn in_dfu_mode(&self) -> bool {
        lock(&self.activity.mode)
            .as_ref()
            .is_some_and(|m| m.is_set())
    }

    pub fn dfu_busy(&self) -> bool {
        self.activity.busy.load(Ordering::SeqCst)
    }

    pub fn enter_dfu_mode(&self) -> Result<DfuTask, LinkError> {
        self.spawn_dfu("dfu-enter", |driver| driver.enter_dfu_mode())
    }

    pub fn exit_dfu_mode(&self) -> Result<DfuTask, LinkError> {
        self.spawn_dfu("dfu-exit", |driver| driver.exit_dfu_mode())
    }

    /// Download and install `firmware`, publishing
    /// [TransportEvent::DownloadProgressed] as blocks are accepted.
    pub fn download<R>(&self, mut firmware: R) -> Result<DfuTask, LinkError>
    where
        R: Read + Seek + Send + 'static,
    {
        let events = self.events.clone();
        self.spawn_dfu("dfu-download", move |driver| {
            driver.download(&mut firmware, |percent| {
                events.publish(TransportEvent::DownloadProgressed(percent))
            })
        })
    }

    /// Request a running download to stop at the next block. `false` when
    /// no DFU driver exists yet.
    pub fn abort_download(&self) -> bool {
        match lock(&self.session).as_ref() {
            Some(session) => {
                session.abort.abort();
                true
            }
            None => false,
        }
    }

    fn session(&self) -> Result<DfuSession, LinkError> {
        let identity = self.identity().ok_or(LinkError::NotConfigured)?;
        let mut session = lock(&self.session);
        if let Some(existing) = session.as_ref() {
            if existing.identity == identity {
                return Ok(existing.clone());
            }
        }

        let driver = DfuDriver::new(
            identity,
            self.opener.clone(),
            self.settings.dfu.clone(),
        );
        *lock(&self.activity.mode) = Some(driver.dfu_mode_flag());
        let created = DfuSession {
            identity,
            abort: driver.abort_handle(),
            driver: Arc::new(Mutex::new(driver)),
        };
        *session = Some(created.clone());
        Ok(created)
    }

    fn spawn_dfu<F>(&self, name: &str, op: F) -> Result<DfuTask, LinkError>
    where
        F: FnOnce(&mut DfuDriver) -> Result<(), DfuError> + Send + 'static,
    {
        let session = self.session()?;
        if self
            .activity
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("{name} rejected, DFU operation in progress");
            return Err(LinkError::DfuBusy);
        }

        // an abort requested before this operation was accepted is void
        session.abort.clear();
        let guard = BusyGuard(self.activity.clone());
        let task = name.to_string();
        let spawned = thread::Builder::new().name(task.clone()).spawn(move || {
            let _busy = guard;
            let mut driver = lock(&session.driver);
            let result = op(&mut *driver);
            match &result {
                Ok(()) => info!("{task} finished"),
                Err(err) => error!("{task} failed: {err}"),
            }
            result
        });
        // a failed spawn drops the closure and with it the busy guard
        spawned.map_err(LinkError::Io)
    }
}

impl<H: HidLink> Drop for Transport<H> {
    fn drop(&mut self) {
        self.close();
    }
}

fn transmit_loop<H: HidLink + ?Sized>(
    hid: &H,
    queue: Receiver<Outbound>,
    closing: &AtomicBool,
    settings: &TransportSettings,
) -> Receiver<Outbound> {
    while !closing.load(Ordering::SeqCst) {
        match queue.recv_timeout(settings.dequeue_poll) {
            Ok(packets) => {
                transmit(hid, &packets, &settings.frame);
                if let Some(delay) = settings.inter_message_delay {
                    thread::sleep(delay);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    queue
}

fn transmit<H: HidLink + ?Sized>(
    hid: &H,
    packets: &[Packet],
    format: &FrameFormat,
) {
    for packet in packets {
        if !hid.set_output_report(&packet.encode(format)) {
            warn!(
                "Write of packet {} of report {:#04x} failed, message abandoned",
                packet.index, packet.report_id
            );
            return;
        }
    }
    if let Some(first) = packets.first() {
        trace!(
            "Sent report {:#04x}, {} bytes in {} packets",
            first.report_id,
            packets.iter().map(Packet::len).sum::<usize>(),
            packets.len()
        );
    }
}

struct Dispatcher<H: HidLink> {
    hid: Arc<H>,
    events: Arc<EventBus<TransportEvent>>,
    activity: Arc<DfuActivity>,
    format: FrameFormat,
    reassembler: Reassembler,
}

impl<H: HidLink> Dispatcher<H> {
    fn run(
        mut self,
        inbound: Subscription<HidEvent>,
        stop: &AtomicBool,
        poll: Duration,
    ) {
        while !stop.load(Ordering::SeqCst) {
            if let Some(event) = inbound.recv_timeout(poll) {
                self.handle(event);
            }
        }
    }

    fn handle(&mut self, event: HidEvent) {
        match event {
            HidEvent::Report(raw) => self.report(&raw),
            HidEvent::Attached => {
                self.notify(TransportEvent::DeviceAttached);
                if !self.hid.is_open() && !self.hid.open() {
                    warn!("Reopening reattached device failed");
                }
            }
            HidEvent::Detached => {
                self.reassembler.reset();
                self.notify(TransportEvent::DeviceDetached);
                self.hid.close();
            }
        }
    }

    fn notify(&self, event: TransportEvent) {
        if self.activity.active() {
            debug!("{event:?} suppressed during firmware update");
        } else {
            self.events.publish(event);
        }
    }

    fn report(&mut self, raw: &[u8]) {
        let packet = match Packet::decode(raw, &self.format) {
            Ok(packet) => packet,
            Err(err) => {
                warn!("Dropping report: {err}");
                return;
            }
        };
        if !self.format.is_data_report(packet.report_id) {
            let message = Message::new(packet.report_id, packet.data);
            self.events.publish(TransportEvent::MessageReceived(message));
            return;
        }
        match self.reassembler.push(packet) {
            Reassembly::Complete(message) => {
                self.events.publish(TransportEvent::MessageReceived(message))
            }
            Reassembly::Incomplete => {}
            Reassembly::Dropped { expected, got } => {
                warn!(
                    "Packet {got} out of sequence (expected {expected}), message dropped"
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, sync::atomic::AtomicUsize};

    use dfu::{
        DfuCapabilities, DfuDeviceStatus, DfuProtocol, DfuState, DfuTimings,
        FIRMWARE_SIGNATURE_LEN, parse_capabilities,
    };

    use super::*;
    use crate::{error::FrameError, frame::DATA_REPORT_ID};

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct FakeHid {
        events: EventBus<HidEvent>,
        open: AtomicBool,
        opens: AtomicUsize,
        closes: AtomicUsize,
        writes: Mutex<Vec<Vec<u8>>>,
        write_delay: Duration,
    }

    impl FakeHid {
        fn written(&self) -> usize {
            self.writes.lock().unwrap().len()
        }

        fn receive(&self, packet: Packet) {
            let report = packet.encode(&FrameFormat::default());
            self.events.publish(HidEvent::Report(report));
        }
    }

    impl HidLink for FakeHid {
        fn open(&self) -> bool {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            true
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn set_output_report(&self, report: &[u8]) -> bool {
            thread::sleep(self.write_delay);
            self.writes.lock().unwrap().push(report.to_vec());
            true
        }

        fn subscribe(&self) -> Subscription<HidEvent> {
            self.events.subscribe()
        }
    }

    /// Never finds a device; each attempt blocks until released.
    #[derive(Default)]
    struct GatedOpener {
        released: AtomicBool,
        calls: AtomicUsize,
    }

    impl DeviceOpener for GatedOpener {
        fn open(
            &self,
            vid: u16,
            pid: u16,
        ) -> Result<Box<dyn DfuProtocol>, DfuError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while !self.released.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Err(DfuError::NoDevice { vid, pid })
        }
    }

    /// Peripheral that enumerates under any id and accepts every block.
    #[derive(Default)]
    struct FakeBootloader {
        state: Mutex<Option<DfuState>>,
        blocks: AtomicUsize,
        aborts: AtomicUsize,
        block_delay: Duration,
    }

    impl FakeBootloader {
        fn state(&self) -> DfuState {
            self.state.lock().unwrap().unwrap_or(DfuState::DfuIdle)
        }

        fn set_state(&self, state: DfuState) {
            *self.state.lock().unwrap() = Some(state);
        }
    }

    struct FakeBootloaderLink(Arc<FakeBootloader>);

    impl DfuProtocol for FakeBootloaderLink {
        fn detach(&self, _timeout: u16) -> Result<(), DfuError> {
            Ok(())
        }

        fn download(
            &self,
            _block_nr: u16,
            data: &[u8],
        ) -> Result<usize, DfuError> {
            thread::sleep(self.0.block_delay);
            if data.is_empty() {
                self.0.set_state(DfuState::DfuManifest);
            } else {
                self.0.blocks.fetch_add(1, Ordering::SeqCst);
                self.0.set_state(DfuState::DfuDownloadIdle);
            }
            Ok(data.len())
        }

        fn get_status(&self) -> Result<DfuDeviceStatus, DfuError> {
            Ok(DfuDeviceStatus {
                status: 0,
                poll_timeout: 0,
                state: self.0.state(),
            })
        }

        fn clear_status(&self) -> Result<(), DfuError> {
            self.0.set_state(DfuState::DfuIdle);
            Ok(())
        }

        fn abort(&self) -> Result<(), DfuError> {
            self.0.aborts.fetch_add(1, Ordering::SeqCst);
            self.0.set_state(DfuState::DfuIdle);
            Ok(())
        }

        fn get_state(&self) -> DfuState {
            self.0.state()
        }

        fn capabilities(&self) -> Option<DfuCapabilities> {
            // will detach, manifestation tolerant, 64 byte transfers
            parse_capabilities(&[9, 0x21, 0x0F, 0xF4, 0x01, 64, 0, 0x10, 0x01])
        }

        fn reset(&self) -> Result<(), DfuError> {
            self.0.set_state(DfuState::DfuIdle);
            Ok(())
        }
    }

    struct BootloaderOpener(Arc<FakeBootloader>);

    impl DeviceOpener for BootloaderOpener {
        fn open(
            &self,
            _vid: u16,
            _pid: u16,
        ) -> Result<Box<dyn DfuProtocol>, DfuError> {
            Ok(Box::new(FakeBootloaderLink(self.0.clone())))
        }
    }

    fn image(blocks: usize) -> Cursor<Vec<u8>> {
        Cursor::new(vec![0x5a; blocks * 64 + FIRMWARE_SIGNATURE_LEN as usize])
    }

    /// A configured, open transport over a [FakeBootloader].
    fn bootloader_transport(
        device: FakeBootloader,
    ) -> (Transport<FakeHid>, Arc<FakeHid>, Arc<FakeBootloader>) {
        let hid = Arc::new(FakeHid::default());
        let device = Arc::new(device);
        let settings = TransportSettings {
            dfu: DfuTimings {
                manifest_wait: Duration::ZERO,
                device_ready: Duration::ZERO,
                post_install_ready: Duration::ZERO,
                min_poll_interval: Duration::from_millis(1),
                ..settings().dfu
            },
            ..settings()
        };
        let opener = Arc::new(BootloaderOpener(device.clone()));
        let transport = Transport::new(hid.clone(), opener, settings);
        assert!(transport.configure(&IdConfig::new("0483", "5740", "df11")));
        assert!(transport.open());
        (transport, hid, device)
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            dequeue_poll: Duration::from_millis(5),
            close_join: Duration::from_secs(1),
            dfu: DfuTimings {
                init_attempts: 1,
                discover_interval: Duration::from_millis(1),
                discover_max_wait: Duration::from_millis(5),
                ..DfuTimings::default()
            },
            ..TransportSettings::default()
        }
    }

    fn transport(hid: FakeHid) -> (Transport<FakeHid>, Arc<FakeHid>) {
        let hid = Arc::new(hid);
        let opener = Arc::new(GatedOpener::default());
        (Transport::new(hid.clone(), opener, settings()), hid)
    }

    fn wait_until(cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while !cond() {
            if Instant::now() > deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_send_requires_open() {
        let (transport, hid) = transport(FakeHid::default());
        assert!(matches!(
            transport.send_message(Message::new(0x05, vec![1])),
            Err(LinkError::NotOpen)
        ));
        assert!(transport.open());
        assert!(transport.open());
        assert_eq!(hid.opens.load(Ordering::SeqCst), 1);
        transport.close();
        transport.close();
        assert_eq!(hid.closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            transport.send_message(Message::new(0x05, vec![1])),
            Err(LinkError::NotOpen)
        ));
    }

    #[test]
    fn test_send_message_is_packetized() {
        let (transport, hid) = transport(FakeHid::default());
        assert!(transport.open());
        let message = Message::new(DATA_REPORT_ID, vec![9u8; 122]);
        assert!(transport.send_message(message).is_ok());
        assert!(wait_until(|| hid.written() == 3));

        let writes = hid.writes.lock().unwrap();
        let headers: Vec<(u8, u16, u8)> = writes
            .iter()
            .map(|r| (r[0], u16::from_le_bytes([r[1], r[2]]), r[3]))
            .collect();
        assert_eq!(
            headers,
            vec![
                (DATA_REPORT_ID, 1, 61),
                (DATA_REPORT_ID, 2, 61),
                (DATA_REPORT_ID, 3, 0)
            ]
        );
        assert!(writes.iter().all(|r| r.len() == 65));
    }

    #[test]
    fn test_inbound_reports() {
        let (transport, hid) = transport(FakeHid::default());
        let events = transport.subscribe();
        assert!(transport.open());

        let message =
            Message::new(DATA_REPORT_ID, (0..100).collect::<Vec<u8>>());
        for packet in packetize(&message, &FrameFormat::default()).unwrap() {
            hid.receive(packet);
        }
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::MessageReceived(message))
        );

        // a stray continuation is dropped, the next single report gets through
        hid.receive(Packet {
            report_id: DATA_REPORT_ID,
            index: 2,
            data: vec![1],
        });
        hid.receive(Packet {
            report_id: 0x05,
            index: 0,
            data: vec![0xaa, 0xbb],
        });
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::MessageReceived(Message::new(
                0x05,
                vec![0xaa, 0xbb]
            )))
        );
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_close_drops_queued_messages() {
        let (transport, hid) = transport(FakeHid {
            write_delay: Duration::from_millis(20),
            ..FakeHid::default()
        });
        assert!(transport.open());
        for i in 0..5 {
            let message = Message::new(0x05, vec![i]);
            assert!(transport.send_message(message).is_ok());
        }
        transport.close();
        let sent = hid.written();
        assert!(sent <= 1, "{sent} messages sent after close");

        assert!(transport.open());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(hid.written(), sent);

        let message = Message::new(0x05, vec![0xff]);
        assert!(transport.send_message(message).is_ok());
        assert!(wait_until(|| hid.written() == sent + 1));
    }

    #[test]
    fn test_presence_events() {
        let (transport, hid) = transport(FakeHid::default());
        let events = transport.subscribe();
        assert!(transport.open());

        hid.events.publish(HidEvent::Detached);
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::DeviceDetached)
        );
        assert!(!hid.is_open());

        hid.events.publish(HidEvent::Attached);
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::DeviceAttached)
        );
        assert!(wait_until(|| hid.is_open()));
    }

    #[test]
    fn test_dfu_requires_configuration() {
        let (transport, _hid) = transport(FakeHid::default());
        assert!(matches!(
            transport.enter_dfu_mode(),
            Err(LinkError::NotConfigured)
        ));
        assert!(!transport.abort_download());

        assert!(!transport.configure(&IdConfig::new("0483", "xyz", "df11")));
        assert!(matches!(
            transport.download(std::io::Cursor::new(vec![0u8; 64])),
            Err(LinkError::NotConfigured)
        ));
        assert_eq!(transport.identity(), None);
    }

    #[test]
    fn test_presence_suppressed_during_dfu() {
        let hid = Arc::new(FakeHid::default());
        let opener = Arc::new(GatedOpener::default());
        let transport = Transport::new(hid.clone(), opener.clone(), settings());
        assert!(transport.configure(&IdConfig::new("0483", "5740", "df11")));
        let events = transport.subscribe();
        assert!(transport.open());

        let task = transport.enter_dfu_mode().unwrap();
        assert!(transport.dfu_busy());
        assert!(matches!(
            transport.exit_dfu_mode(),
            Err(LinkError::DfuBusy)
        ));

        hid.events.publish(HidEvent::Detached);
        hid.events.publish(HidEvent::Attached);
        // the reopen follows the attach decision
        assert!(wait_until(|| hid.opens.load(Ordering::SeqCst) == 2));

        opener.released.store(true, Ordering::SeqCst);
        assert!(matches!(
            task.join().unwrap(),
            Err(DfuError::DeviceTimeout { .. })
        ));
        assert!(!transport.dfu_busy());
        assert!(!transport.in_dfu_mode());
        assert!(opener.calls.load(Ordering::SeqCst) >= 1);

        hid.events.publish(HidEvent::Attached);
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::DeviceAttached)
        );
        assert_eq!(events.try_recv(), None);
    }

    #[test]
    fn test_oversized_report_rejected() {
        let (transport, hid) = transport(FakeHid::default());
        assert!(transport.open());
        assert!(matches!(
            transport.send_message(Message::new(0x05, vec![0u8; 62])),
            Err(LinkError::Frame(FrameError::TooLarge { len: 62 }))
        ));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hid.written(), 0);
    }

    #[test]
    fn test_inter_message_delay() {
        let hid = Arc::new(FakeHid::default());
        let settings = TransportSettings {
            inter_message_delay: Some(Duration::from_millis(30)),
            ..settings()
        };
        let transport = Transport::new(
            hid.clone(),
            Arc::new(GatedOpener::default()),
            settings,
        );
        assert!(transport.open());

        let start = Instant::now();
        for i in 0..3 {
            let message = Message::new(0x05, vec![i]);
            assert!(transport.send_message(message).is_ok());
        }
        assert!(wait_until(|| hid.written() == 3));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_download_publishes_progress() {
        let (transport, _hid, device) =
            bootloader_transport(FakeBootloader::default());
        let events = transport.subscribe();

        transport.enter_dfu_mode().unwrap().join().unwrap().unwrap();
        assert!(transport.in_dfu_mode());
        assert!(!transport.dfu_busy());

        let task = transport.download(image(4)).unwrap();
        assert!(task.join().unwrap().is_ok());
        assert_eq!(device.blocks.load(Ordering::SeqCst), 4);
        let progress: Vec<TransportEvent> =
            std::iter::from_fn(|| events.try_recv()).collect();
        assert_eq!(
            progress,
            [25, 50, 75, 100]
                .into_iter()
                .map(TransportEvent::DownloadProgressed)
                .collect::<Vec<_>>()
        );

        transport.exit_dfu_mode().unwrap().join().unwrap().unwrap();
        assert!(!transport.in_dfu_mode());
    }

    #[test]
    fn test_presence_suppressed_in_dfu_mode() {
        let (transport, hid, _device) =
            bootloader_transport(FakeBootloader::default());
        let events = transport.subscribe();
        transport.enter_dfu_mode().unwrap().join().unwrap().unwrap();
        assert!(transport.in_dfu_mode());
        assert!(!transport.dfu_busy());

        hid.events.publish(HidEvent::Detached);
        hid.events.publish(HidEvent::Attached);
        assert!(wait_until(|| hid.opens.load(Ordering::SeqCst) == 2));
        assert_eq!(events.try_recv(), None);

        transport.exit_dfu_mode().unwrap().join().unwrap().unwrap();
        hid.events.publish(HidEvent::Detached);
        assert_eq!(
            events.recv_timeout(WAIT),
            Some(TransportEvent::DeviceDetached)
        );
    }

    #[test]
    fn test_abort_right_after_download_starts() {
        let (transport, _hid, device) = bootloader_transport(FakeBootloader {
            block_delay: Duration::from_millis(1),
            ..FakeBootloader::default()
        });
        transport.enter_dfu_mode().unwrap().join().unwrap().unwrap();

        let task = transport.download(image(200)).unwrap();
        assert!(transport.abort_download());
        assert!(matches!(task.join().unwrap(), Err(DfuError::Aborted)));
        assert_eq!(device.aborts.load(Ordering::SeqCst), 1);
        assert!(device.blocks.load(Ordering::SeqCst) < 200);
        assert!(transport.in_dfu_mode());
    }

    #[test]
    fn test_stale_abort_does_not_cancel_next_download() {
        let (transport, _hid, device) =
            bootloader_transport(FakeBootloader::default());
        transport.enter_dfu_mode().unwrap().join().unwrap().unwrap();

        assert!(transport.abort_download());
        let task = transport.download(image(2)).unwrap();
        assert!(task.join().unwrap().is_ok());
        assert_eq!(device.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(device.blocks.load(Ordering::SeqCst), 2);
    }
}
