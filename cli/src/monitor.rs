use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dfu::UsbOpener;
use link::{
    HidSettings, HidTransport, IdConfig, Message, Subscription, Transport,
    TransportEvent,
};

use crate::CliError;

fn open_transport(
    ids: &IdConfig,
) -> Result<Transport<HidTransport>, CliError> {
    let identity = ids.resolve()?;
    let hid = Arc::new(HidTransport::new(
        identity.vendor_id,
        identity.product_id,
        HidSettings::default(),
    ));
    let transport =
        Transport::new(hid, Arc::new(UsbOpener), Default::default());
    if !transport.configure(ids) || !transport.open() {
        return Err(CliError::LinkUnavailable);
    }
    Ok(transport)
}

fn print_event(event: &TransportEvent) {
    match event {
        TransportEvent::DeviceAttached => println!("attached"),
        TransportEvent::DeviceDetached => println!("detached"),
        TransportEvent::DownloadProgressed(percent) => {
            println!("download {percent}%")
        }
        TransportEvent::MessageReceived(message) => println!(
            "report 0x{:02x} ({} bytes): {:02x?}",
            message.report_id,
            message.len(),
            message.data
        ),
    }
}

fn print_events_until(
    events: &Subscription<TransportEvent>,
    deadline: Option<Instant>,
) {
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                left.min(Duration::from_secs(1))
            }
            None => Duration::from_secs(1),
        };
        if let Some(event) = events.recv_timeout(wait) {
            print_event(&event);
        }
    }
}

pub(crate) fn monitor(
    ids: IdConfig,
    seconds: Option<u64>,
) -> Result<(), CliError> {
    let transport = open_transport(&ids)?;
    let events = transport.subscribe();
    println!("Monitoring, press Ctrl-C to stop");
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    print_events_until(&events, deadline);
    transport.close();
    Ok(())
}

pub(crate) fn send(
    ids: IdConfig,
    report_id: u8,
    data: Vec<u8>,
    wait_ms: u64,
) -> Result<(), CliError> {
    let transport = open_transport(&ids)?;
    let events = transport.subscribe();
    transport.send_message(Message::new(report_id, data))?;
    print_events_until(
        &events,
        Some(Instant::now() + Duration::from_millis(wait_ms)),
    );
    transport.close();
    Ok(())
}
