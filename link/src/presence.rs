use crate::hid::HidEvent;

/// Tracks whether the configured device is currently connected.
///
/// Fed with the result of every device list scan; yields an event only
/// when the device appears or disappears. A device that re-enumerates
/// between two scans just replaces the stored handle.
#[derive(Debug)]
pub struct Presence<T> {
    current: Option<T>,
}

impl<T> Presence<T> {
    pub fn new(initial: Option<T>) -> Self {
        Presence { current: initial }
    }

    pub fn current(&self) -> Option<&T> {
        self.current.as_ref()
    }

    pub fn is_present(&self) -> bool {
        self.current.is_some()
    }

    pub fn update(&mut self, found: Option<T>) -> Option<HidEvent> {
        let was_present = self.current.is_some();
        let is_present = found.is_some();
        self.current = found;
        match (was_present, is_present) {
            (false, true) => Some(HidEvent::Attached),
            (true, false) => Some(HidEvent::Detached),
            _ => None,
        }
    }
}
