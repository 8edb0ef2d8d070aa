//! Host-side driver SDK for crates of DPM digital pulse-processing modules.
//!
//! Each module is a PCI/PXI card carrying a communications FPGA, a signal
//! FPGA, a DSP, a bank of analog front-end channels with per-channel ADC
//! and offset DAC, and a hardware FIFO of list-mode event words. The SDK
//! enumerates the crate, boots firmware, configures per-module and
//! per-channel parameters, calibrates analog offsets, and streams list-mode
//! data off the FIFO without loss.
//!
//! # Quick start
//!
//! ```no_run
//! use dpm_sdk::prelude::*;
//!
//! # fn main() -> dpm_sdk::Result<()> {
//! let crate_ = Crate::new(BackendSelection::Auto);
//! crate_.initialize(false)?;
//! crate_.set_firmware()?;
//! crate_.boot(&BootParams::default())?;
//!
//! let module = crate_.module_handle(0, HandleCheck::Online)?;
//! module.start_listmode(RunMode::New)?;
//! let mut words = vec![0u32; 8192];
//! let n = module.read_list_mode(&mut words)?;
//! println!("read {n} list-mode words");
//! module.run_end()?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! Lifecycle operations hold the crate lock exclusively; per-module data
//! operations take a crate user token plus the module's own locks, so
//! operations on distinct modules run in parallel. Each online module runs
//! one background FIFO worker. Lock order is crate, then module, then bus.

#![recursion_limit = "256"]

pub mod backends;
pub mod backplane;
pub mod bus;
pub mod channel;
pub mod chassis;
pub mod config;
pub mod error;
mod fifo;
pub mod firmware;
pub mod fixture;
pub mod module;
pub mod param;
pub mod run;
pub mod stats;

pub use backends::{sim, BackendSelection};
pub use backplane::Backplane;
pub use bus::{BusDriver, BusPort, DeviceInfo};
pub use chassis::{BootParams, Crate, CrateUser, HandleCheck, ModuleHandle};
pub use error::{Error, ErrorKind, Result};
pub use fifo::{
    DEFAULT_FIFO_BUFFERS, DEFAULT_HOLD_USECS, DEFAULT_IDLE_WAIT_USECS, DEFAULT_RUN_WAIT_USECS,
};
pub use firmware::{FirmwareImage, FirmwareKind, FirmwareRegistry, FirmwareTag};
pub use module::{Module, NumberSlot, SyncDirection};
pub use param::{ChannelParam, ChannelVar, ModuleParam, ModuleVar};
pub use run::{ControlTask, RunMode, RunTask};
pub use stats::Stats;

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        BackendSelection, BootParams, ChannelVar, Crate, Error, FirmwareImage, FirmwareKind,
        FirmwareTag, HandleCheck, ModuleVar, NumberSlot, Result, RunMode, SyncDirection,
    };
}
