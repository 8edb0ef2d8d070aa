//! Bus backends.
//!
//! Two drivers implement [`crate::bus::BusDriver`]:
//!
//! - [`pci`] maps the module register window out of PCI sysfs resources and
//!   is the production path.
//! - [`sim`] emulates the register window, DSP memory, AFE, and FIFO from a
//!   module-definitions registry. All integration tests run against it.

pub mod sim;

#[cfg(unix)]
pub mod pci;

use crate::bus::BusDriver;
use crate::error::Result;

/// Which backend a crate binds its modules through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Prefer hardware, fall back to simulation when the registry has
    /// definitions and no device is present.
    #[default]
    Auto,
    /// PCI hardware only.
    Pci,
    /// Simulation only.
    Sim,
}

/// Open the bus device at `device_number` through the selected backend.
///
/// # Errors
///
/// Returns `ModuleNotFound` when no device exists at that position; other
/// errors indicate a device that exists but could not be bound.
pub fn open(selection: BackendSelection, device_number: usize) -> Result<Box<dyn BusDriver>> {
    match selection {
        BackendSelection::Auto => {
            #[cfg(unix)]
            if let Ok(driver) = pci::PciBus::open(device_number) {
                tracing::info!("bus: device {device_number}: PCI backend");
                return Ok(Box::new(driver));
            }
            sim::SimBus::open(device_number).map(|b| Box::new(b) as Box<dyn BusDriver>)
        }
        BackendSelection::Pci => {
            #[cfg(unix)]
            {
                pci::PciBus::open(device_number).map(|b| Box::new(b) as Box<dyn BusDriver>)
            }
            #[cfg(not(unix))]
            {
                Err(crate::error::Error::bus("PCI backend requires unix"))
            }
        }
        BackendSelection::Sim => {
            sim::SimBus::open(device_number).map(|b| Box::new(b) as Box<dyn BusDriver>)
        }
    }
}
