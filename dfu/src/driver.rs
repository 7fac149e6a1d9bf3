use std::{
    cmp,
    io::{Read, Seek, SeekFrom},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    DfuCapabilities, DfuError, DfuState,
    device::DeviceOpener,
    settings::{DfuTimings, FIRMWARE_SIGNATURE_LEN},
    translator::DfuProtocol,
};

/// USB identities of one peripheral in both of its personalities.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub dfu_product_id: u16,
}

/// Requests a running download to stop at the next block boundary.
#[derive(Clone, Debug)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Withdraw a pending request that no download has observed yet.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Read-only view of whether the driver holds the device in DFU mode.
#[derive(Clone, Debug)]
pub struct DfuModeFlag(Arc<AtomicBool>);

impl DfuModeFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Firmware update session for one peripheral.
///
/// Moves the device from its application personality into DFU mode,
/// downloads an image block by block and brings the device back. Every
/// wait is bounded by [DfuTimings].
pub struct DfuDriver {
    identity: DeviceIdentity,
    opener: Arc<dyn DeviceOpener>,
    timings: DfuTimings,
    translator: Option<Box<dyn DfuProtocol>>,
    capabilities: Option<DfuCapabilities>,
    poll_interval: Duration,
    block_nr: u32,
    abort: Arc<AtomicBool>,
    in_dfu: Arc<AtomicBool>,
}

impl DfuDriver {
    pub fn new(
        identity: DeviceIdentity,
        opener: Arc<dyn DeviceOpener>,
        timings: DfuTimings,
    ) -> Self {
        DfuDriver {
            identity,
            opener,
            timings,
            translator: None,
            capabilities: None,
            poll_interval: Duration::ZERO,
            block_nr: 0,
            abort: Arc::new(AtomicBool::new(false)),
            in_dfu: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn in_dfu_mode(&self) -> bool {
        self.in_dfu.load(Ordering::SeqCst)
    }

    pub fn dfu_mode_flag(&self) -> DfuModeFlag {
        DfuModeFlag(self.in_dfu.clone())
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle(self.abort.clone())
    }

    pub fn abort_download(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Blocks accepted by the device in the current (or last) download.
    pub fn block_number(&self) -> u32 {
        self.block_nr
    }

    pub fn capabilities(&self) -> Option<&DfuCapabilities> {
        self.capabilities.as_ref()
    }

    pub fn transfer_size(&self) -> u16 {
        match self.capabilities.as_ref().map(|c| c.transfer_size()) {
            Some(size) if size > 0 => size,
            _ => crate::DEFAULT_TRANSFER_SIZE,
        }
    }

    pub fn enter_dfu_mode(&mut self) -> Result<(), DfuError> {
        if self.in_dfu_mode() {
            log::warn!("enter DFU requested while already in DFU mode");
            return Err(DfuError::AlreadyInDfu);
        }
        let DeviceIdentity {
            vendor_id,
            product_id,
            dfu_product_id,
        } = self.identity;

        match self.open_with_attempts(vendor_id, product_id) {
            Ok(app) => self.detach_application(app.as_ref())?,
            Err(err) => {
                // A device left in its bootloader by an earlier failed
                // session enumerates with the DFU product id only.
                log::info!(
                    "application device {vendor_id:04x}:{product_id:04x} not found ({err}), looking for DFU device"
                );
            }
        }

        let translator = self.wait_for_device(vendor_id, dfu_product_id)?;
        let capabilities =
            translator.capabilities().ok_or(DfuError::NoCapabilities)?;
        let status = translator.get_status()?;
        if status.state == DfuState::DfuError {
            log::info!("clearing DFU error state (status {})", status.status);
            translator.clear_status()?;
        }

        log::info!(
            "in DFU mode: transfer size {}, manifestation tolerant {}, will detach {}",
            capabilities.transfer_size(),
            capabilities.manifestation_tolerant(),
            capabilities.will_detach()
        );
        self.poll_interval = status.poll_interval();
        self.capabilities = Some(capabilities);
        self.translator = Some(translator);
        self.in_dfu.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn exit_dfu_mode(&mut self) -> Result<(), DfuError> {
        if !self.in_dfu_mode() {
            log::warn!("exit DFU requested while not in DFU mode");
            return Err(DfuError::NotInDfu);
        }
        if let Some(translator) = self.translator.take() {
            if let Err(err) = translator.reset() {
                // the device usually drops off the bus before acknowledging
                log::debug!("reset on DFU exit: {err}");
            }
        }
        self.capabilities = None;

        let DeviceIdentity {
            vendor_id,
            product_id,
            ..
        } = self.identity;
        drop(self.wait_for_device(vendor_id, product_id)?);

        self.in_dfu.store(false, Ordering::SeqCst);
        log::info!("device {vendor_id:04x}:{product_id:04x} back in application mode");
        Ok(())
    }

    /// Download and install `firmware`.
    ///
    /// The last [FIRMWARE_SIGNATURE_LEN] bytes of the stream are a signature
    /// that is not sent. `progress` receives the completed percentage each
    /// time it increases. A pending abort request, even one made before
    /// this call, stops the download at its first block boundary.
    pub fn download<R: Read + Seek>(
        &mut self,
        firmware: &mut R,
        mut progress: impl FnMut(u8),
    ) -> Result<(), DfuError> {
        if !self.in_dfu_mode() || self.translator.is_none() {
            return Err(DfuError::NotInDfu);
        }
        let firmware_size = payload_len(firmware)?;
        let transfer_size = self.transfer_size() as u64;

        self.block_nr = 0;
        log::info!(
            "downloading {firmware_size} bytes in blocks of {transfer_size}"
        );

        let mut buf = vec![0u8; transfer_size as usize];
        let mut sent: u64 = 0;
        let mut percent: u8 = 0;
        while sent < firmware_size {
            if self.abort.swap(false, Ordering::SeqCst) {
                log::warn!("download aborted at block {}", self.block_nr);
                self.send_abort();
                return Err(DfuError::Aborted);
            }

            let len = cmp::min(transfer_size, firmware_size - sent) as usize;
            if let Err(err) = firmware.read_exact(&mut buf[..len]) {
                log::error!("reading firmware at offset {sent} failed: {err}");
                self.send_abort();
                return Err(DfuError::FileRead(err));
            }
            self.download_block(&buf[..len])?;
            sent += len as u64;

            let done = (sent * 100 / firmware_size) as u8;
            if done > percent {
                percent = done;
                progress(percent);
            }
        }

        self.install(firmware_size)
    }

    fn install(&mut self, firmware_size: u64) -> Result<(), DfuError> {
        let translator =
            self.translator.as_deref().ok_or(DfuError::NotInDfu)?;
        let block_nr = self.block_nr;

        // zero-length DFU_DNLOAD ends the transfer phase
        if let Err(err) = translator.download(block_nr as u16, &[]) {
            log::error!("terminal block {block_nr} failed: {err}");
            return Err(DfuError::ControlTransfer { block_nr });
        }

        let start = Instant::now();
        let mut state = DfuState::Unknown;
        loop {
            match translator.get_status() {
                Ok(status) => {
                    state = status.state;
                    self.poll_interval = status.poll_interval();
                    if state == DfuState::DfuManifest {
                        break;
                    }
                }
                Err(err) => log::debug!("status during manifest: {err}"),
            }
            if start.elapsed() >= self.timings.manifest_poll_max {
                log::error!("device did not reach manifest, last state {state:?}");
                return Err(DfuError::InvalidState(state));
            }
            thread::sleep(self.poll_delay());
        }

        let settle = self.timings.manifest_settle(firmware_size);
        log::info!("manifesting, waiting {settle:?}");
        thread::sleep(settle);

        let capabilities = self.capabilities.clone().unwrap_or_default();
        if capabilities.manifestation_tolerant() {
            match translator.get_status() {
                Ok(status) if status.state == DfuState::DfuError => {
                    if let Err(err) = translator.clear_status() {
                        log::warn!("clearing post-manifest error: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => log::debug!("status after manifest: {err}"),
            }
        }

        if !capabilities.will_detach() {
            if let Err(err) = translator.detach(capabilities.detach_timeout()) {
                log::debug!("detach after install: {err}");
            }
            if let Err(err) = translator.reset() {
                log::debug!("reset after install: {err}");
            }
            thread::sleep(self.timings.device_ready);
        } else {
            thread::sleep(self.timings.post_install_ready);
        }
        log::info!("firmware installed ({} blocks)", self.block_nr);
        Ok(())
    }

    fn download_block(&mut self, data: &[u8]) -> Result<(), DfuError> {
        let translator =
            self.translator.as_deref().ok_or(DfuError::NotInDfu)?;

        let state = translator.get_state();
        if !matches!(
            state,
            DfuState::DfuIdle
                | DfuState::DfuDownloadIdle
                | DfuState::DfuDownloadSync
        ) {
            log::warn!("unexpected state {state:?} before block, clearing");
            if let Err(err) = translator.clear_status() {
                log::debug!("clear status: {err}");
            }
            let state = translator.get_state();
            if !matches!(state, DfuState::DfuIdle | DfuState::DfuDownloadIdle)
            {
                return Err(DfuError::InvalidState(state));
            }
        }

        let block_nr = self.block_nr;
        let attempts = self.timings.block_retries.max(1);
        let mut accepted = false;
        for attempt in 1..=attempts {
            match translator.download(block_nr as u16, data) {
                Ok(len) if len > 0 => {
                    accepted = true;
                    break;
                }
                Ok(_) => log::warn!(
                    "block {block_nr} not accepted (attempt {attempt}/{attempts})"
                ),
                Err(err) => log::warn!(
                    "block {block_nr} failed (attempt {attempt}/{attempts}): {err}"
                ),
            }
            if attempt < attempts {
                thread::sleep(self.poll_delay());
            }
        }
        if !accepted {
            return Err(DfuError::ControlTransfer { block_nr });
        }
        self.block_nr += 1;
        log::trace!("block {block_nr} sent ({} bytes)", data.len());

        let start = Instant::now();
        loop {
            match translator.get_status() {
                Ok(status) => {
                    self.poll_interval = status.poll_interval();
                    match status.state {
                        DfuState::DfuDownloadIdle => return Ok(()),
                        DfuState::DfuError => {
                            log::warn!(
                                "device error {} after block {block_nr}",
                                status.status
                            );
                            if let Err(err) = translator.clear_status() {
                                log::debug!("clear status: {err}");
                            }
                        }
                        _ => {}
                    }
                }
                Err(err) => log::debug!("status after block {block_nr}: {err}"),
            }
            if start.elapsed() >= self.timings.download_poll_max {
                log::error!("block {block_nr} not acknowledged in time");
                return Err(DfuError::Timeout);
            }
            thread::sleep(self.poll_delay());
        }
    }

    fn send_abort(&self) {
        if let Some(translator) = self.translator.as_deref() {
            if let Err(err) = translator.abort() {
                log::warn!("DFU_ABORT failed: {err}");
            }
        }
    }

    fn detach_application(
        &self,
        app: &dyn DfuProtocol,
    ) -> Result<(), DfuError> {
        let capabilities = app.capabilities();
        let timeout = capabilities
            .as_ref()
            .map(|c| c.detach_timeout())
            .unwrap_or(self.timings.default_detach_timeout);
        log::info!("detaching application (timeout {timeout} ms)");
        app.detach(timeout)?;
        if !capabilities.is_some_and(|c| c.will_detach()) {
            if let Err(err) = app.reset() {
                log::debug!("reset after detach: {err}");
            }
        }
        Ok(())
    }

    fn open_with_attempts(
        &self,
        vid: u16,
        pid: u16,
    ) -> Result<Box<dyn DfuProtocol>, DfuError> {
        let mut last_err = DfuError::NoDevice { vid, pid };
        for attempt in 1..=self.timings.init_attempts.max(1) {
            match self.opener.open(vid, pid) {
                Ok(translator) => return Ok(translator),
                Err(err) => {
                    log::trace!("open {vid:04x}:{pid:04x} attempt {attempt}: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn wait_for_device(
        &self,
        vid: u16,
        pid: u16,
    ) -> Result<Box<dyn DfuProtocol>, DfuError> {
        let start = Instant::now();
        loop {
            if let Ok(translator) = self.open_with_attempts(vid, pid) {
                log::debug!(
                    "device {vid:04x}:{pid:04x} found after {:?}",
                    start.elapsed()
                );
                return Ok(translator);
            }
            if start.elapsed() >= self.timings.discover_max_wait {
                log::error!("device {vid:04x}:{pid:04x} did not appear");
                return Err(DfuError::DeviceTimeout { vid, pid });
            }
            thread::sleep(self.timings.discover_interval);
        }
    }

    fn poll_delay(&self) -> Duration {
        cmp::max(self.poll_interval, self.timings.min_poll_interval)
    }
}

fn payload_len<R: Seek>(firmware: &mut R) -> Result<u64, DfuError> {
    let total = firmware
        .seek(SeekFrom::End(0))
        .map_err(DfuError::FileRead)?;
    firmware.seek(SeekFrom::Start(0)).map_err(DfuError::FileRead)?;
    total.checked_sub(FIRMWARE_SIGNATURE_LEN).ok_or_else(|| {
        DfuError::FileRead(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "firmware image shorter than its signature",
        ))
    })
}
