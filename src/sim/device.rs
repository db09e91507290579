//! Handlers for external devices connected to the Simulator.
//!
//! SIC/XE devices are addressed by a one-byte device number.
//! A device has to be activated with `TD` before it can be used with `RD` or `WD`,
//! and only one device is active at a time.
//!
//! The core types here are:
//! - [`Device`]: A device which can be connected to the Simulator.
//! - [`DeviceHandler`]: The handler for the Simulator's devices.
//!
//! This module also provides some devices:
//! - [`NullDevice`]: Does nothing.
//! - [`BufferedDevice`]: Device that reads off of an input buffer and writes to an output buffer.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard, TryLockError};

use super::SimErr;

/// An external device, which can be accessed through `TD`, `RD`, and `WD`.
pub trait Device: Send + Sync + 'static {
    /// Whether the device is ready to transfer data (tested by `TD`).
    fn is_ready(&mut self) -> bool;

    /// Reads a byte from the device (`RD`).
    ///
    /// If no byte is available, this returns `None`.
    fn read(&mut self) -> Option<u8>;

    /// Writes a byte to the device (`WD`).
    ///
    /// This returns whether the write was successful or not.
    fn write(&mut self, data: u8) -> bool;

    /// Resets device.
    fn reset(&mut self) {}
}

/// A device that does nothing.
///
/// It is always ready, reads zero, and accepts (and drops) every write.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDevice;
impl Device for NullDevice {
    fn is_ready(&mut self) -> bool {
        true
    }

    fn read(&mut self) -> Option<u8> {
        Some(0)
    }

    fn write(&mut self, _data: u8) -> bool {
        true
    }
}

/// Device that reads from an input buffer and writes to an output buffer.
///
/// The buffers are shared, so input can be added
/// and output can be inspected while the simulator holds the device.
///
/// ```
/// use sicxe_ensemble::sim::device::{BufferedDevice, Device};
///
/// let mut dev = BufferedDevice::new();
/// dev.input().write().unwrap().extend(b"HI");
///
/// assert_eq!(dev.read(), Some(b'H'));
/// assert!(dev.write(b'!'));
/// assert_eq!(*dev.output().read().unwrap(), b"!");
/// ```
#[derive(Default, Clone)]
pub struct BufferedDevice {
    input: Arc<RwLock<VecDeque<u8>>>,
    output: Arc<RwLock<Vec<u8>>>,
}
impl BufferedDevice {
    /// Creates a new device with empty buffers.
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates a new device, wrapping it around the given buffers.
    pub fn with_buffers(input: Arc<RwLock<VecDeque<u8>>>, output: Arc<RwLock<Vec<u8>>>) -> Self {
        Self { input, output }
    }

    /// Gets a reference to the input buffer of this device.
    pub fn input(&self) -> &Arc<RwLock<VecDeque<u8>>> {
        &self.input
    }

    /// Gets a reference to the output buffer of this device.
    pub fn output(&self) -> &Arc<RwLock<Vec<u8>>> {
        &self.output
    }

    fn try_input(&self) -> Option<RwLockWriteGuard<'_, VecDeque<u8>>> {
        match self.input.try_write() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn try_output(&self) -> Option<RwLockWriteGuard<'_, Vec<u8>>> {
        match self.output.try_write() {
            Ok(g) => Some(g),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}
impl Device for BufferedDevice {
    // The device is busy while someone else holds either buffer.
    fn is_ready(&mut self) -> bool {
        self.try_input().is_some() && self.try_output().is_some()
    }

    fn read(&mut self) -> Option<u8> {
        self.try_input()?.pop_front()
    }

    fn write(&mut self, data: u8) -> bool {
        match self.try_output() {
            Some(mut out) => {
                out.push(data);
                true
            },
            None => false,
        }
    }

    fn reset(&mut self) {
        if let Some(mut inp) = self.try_input() {
            inp.clear();
        }
        if let Some(mut out) = self.try_output() {
            out.clear();
        }
    }
}
impl std::fmt::Debug for BufferedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferedDevice").finish_non_exhaustive()
    }
}

/// The device selected by the last `TD`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub struct ActiveDevice {
    /// The device number.
    pub id: u8,
    /// The address the device number was read from (the target address of `TD`).
    pub addr: u32,
}

/// The central hub for all external devices for the Simulator.
///
/// Devices which have not been attached still exist:
/// they are always ready, read as zero, and drop whatever is written to them.
///
/// ```
/// use sicxe_ensemble::sim::device::{BufferedDevice, DeviceHandler};
///
/// let dev = BufferedDevice::new();
/// dev.input().write().unwrap().push_back(0x41);
///
/// let mut handler = DeviceHandler::new();
/// handler.attach(0xF1, dev);
///
/// assert!(handler.read(0xF1).is_err()); // not activated yet
/// assert!(handler.activate(0xF1, 0x1000));
/// assert_eq!(handler.read(0xF1).unwrap(), 0x41);
/// ```
#[derive(Default)]
pub struct DeviceHandler {
    devices: HashMap<u8, Box<dyn Device>>,
    active: Option<ActiveDevice>,
    activated: BTreeSet<u32>,
}
impl DeviceHandler {
    /// Creates a new device handler with no devices attached.
    pub fn new() -> Self {
        Default::default()
    }

    /// Attaches a device to the given device number, replacing any device that was there.
    pub fn attach(&mut self, id: u8, dev: impl Device) {
        self.devices.insert(id, Box::new(dev));
    }

    /// Detaches the device at the given device number.
    ///
    /// This returns whether there was a device to detach.
    pub fn detach(&mut self, id: u8) -> bool {
        if self.active.is_some_and(|a| a.id == id) {
            self.active.take();
        }
        self.devices.remove(&id).is_some()
    }

    /// Activates the device (as done by `TD`), returning whether it is ready.
    ///
    /// `addr` is the address the device number was read from.
    pub fn activate(&mut self, id: u8, addr: u32) -> bool {
        self.active.replace(ActiveDevice { id, addr });
        self.activated.insert(addr);

        match self.devices.get_mut(&id) {
            Some(dev) => dev.is_ready(),
            None => true,
        }
    }

    /// The currently active device, if any.
    pub fn active(&self) -> Option<ActiveDevice> {
        self.active
    }

    /// Whether the device numbered at `addr` is the current active device.
    pub fn is_active(&self, addr: u32) -> bool {
        self.active.is_some_and(|a| a.addr == addr)
    }

    /// Whether the device numbered at `addr` has ever been activated.
    pub fn was_activated(&self, addr: u32) -> bool {
        self.activated.contains(&addr)
    }

    fn check_active(&self, id: u8) -> Result<(), SimErr> {
        match self.active {
            Some(a) if a.id == id => Ok(()),
            _ => Err(SimErr::DeviceNotActive(id)),
        }
    }

    /// Reads a byte from the device (as done by `RD`).
    ///
    /// # Errors
    /// This errors if the device is not the active device.
    pub fn read(&mut self, id: u8) -> Result<u8, SimErr> {
        self.check_active(id)?;

        match self.devices.get_mut(&id) {
            Some(dev) => Ok(dev.read().unwrap_or(0)),
            None => {
                tracing::warn!(device = format_args!("{id:02X}"), "read from unattached device");
                Ok(0)
            }
        }
    }

    /// Writes a byte to the device (as done by `WD`).
    ///
    /// # Errors
    /// This errors if the device is not the active device.
    pub fn write(&mut self, id: u8, data: u8) -> Result<(), SimErr> {
        self.check_active(id)?;

        match self.devices.get_mut(&id) {
            Some(dev) => {
                if !dev.write(data) {
                    tracing::warn!(device = format_args!("{id:02X}"), "device dropped write");
                }
            },
            None => tracing::warn!(device = format_args!("{id:02X}"), "write to unattached device"),
        }
        Ok(())
    }

    /// Deactivates the active device and forgets which devices were activated.
    ///
    /// Unlike [`DeviceHandler::reset`], this leaves the devices' state alone.
    pub fn deactivate(&mut self) {
        self.active.take();
        self.activated.clear();
    }

    /// Deactivates the active device and resets all the devices connected to this handler.
    pub fn reset(&mut self) {
        self.deactivate();
        self.devices.values_mut().for_each(|d| d.reset());
    }
}
impl std::fmt::Debug for DeviceHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.devices.keys().copied().collect();
        ids.sort_unstable();

        f.debug_struct("DeviceHandler")
            .field("devices", &ids)
            .field("active", &self.active)
            .field("activated", &self.activated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::sim::SimErr;

    use super::{ActiveDevice, BufferedDevice, Device, DeviceHandler, NullDevice};

    #[test]
    fn test_buffered_device() {
        let mut dev = BufferedDevice::new();
        dev.input().write().unwrap().extend(b"AB");
        assert!(dev.is_ready());
        assert_eq!(dev.read(), Some(b'A'));
        assert_eq!(dev.read(), Some(b'B'));
        assert_eq!(dev.read(), None);

        assert!(dev.write(b'Z'));
        assert_eq!(*dev.output().read().unwrap(), b"Z");

        // Busy while the buffer is held.
        let output = dev.output().clone();
        {
            let _guard = output.write().unwrap();
            assert!(!dev.is_ready());
            assert!(!dev.write(b'Y'));
        }
        assert!(dev.is_ready());

        dev.reset();
        assert!(dev.output().read().unwrap().is_empty());
    }

    #[test]
    fn test_shared_buffers() {
        let dev = BufferedDevice::new();
        let mut copy = dev.clone();
        dev.input().write().unwrap().push_back(7);
        assert_eq!(copy.read(), Some(7));
        copy.write(8);
        assert_eq!(*dev.output().read().unwrap(), [8u8]);
    }

    #[test]
    fn test_active_device() {
        let dev = BufferedDevice::new();
        dev.input().write().unwrap().push_back(b'X');

        let mut handler = DeviceHandler::new();
        handler.attach(0xF1, dev.clone());
        handler.attach(0x05, NullDevice);

        assert!(matches!(handler.read(0xF1), Err(SimErr::DeviceNotActive(0xF1))));
        assert!(handler.activate(0xF1, 0x1000));
        assert_eq!(handler.active(), Some(ActiveDevice { id: 0xF1, addr: 0x1000 }));
        assert!(handler.is_active(0x1000));
        assert_eq!(handler.read(0xF1).unwrap(), b'X');
        // An empty input reads as zero.
        assert_eq!(handler.read(0xF1).unwrap(), 0);

        // Activating another device deactivates the first.
        assert!(handler.activate(0x05, 0x2000));
        assert!(!handler.is_active(0x1000));
        assert!(handler.was_activated(0x1000));
        assert!(matches!(handler.write(0xF1, 1), Err(SimErr::DeviceNotActive(0xF1))));
        handler.write(0x05, 1).unwrap();

        handler.reset();
        assert_eq!(handler.active(), None);
        assert!(!handler.was_activated(0x1000));
    }

    #[test]
    fn test_unattached_device() {
        let mut handler = DeviceHandler::new();
        assert!(handler.activate(0x42, 0));
        assert_eq!(handler.read(0x42).unwrap(), 0);
        handler.write(0x42, 0xFF).unwrap();

        handler.attach(0x42, BufferedDevice::new());
        handler.activate(0x42, 0);
        assert!(handler.detach(0x42));
        assert!(!handler.detach(0x42));
        assert_eq!(handler.active(), None);
    }
}
