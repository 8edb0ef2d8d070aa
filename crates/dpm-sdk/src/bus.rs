//! Bus driver abstraction.
//!
//! A [`BusDriver`] owns exactly one bus device and offers the four
//! primitives the SDK needs: 32-bit register read/write and block DMA, plus
//! close. The PCI backend maps the module's register window; the simulation
//! backend emulates it. [`BusPort`] wraps a driver with the module's bus
//! lock and the register-trace diagnostic, and turns an unbound port into
//! no-op reads so modules can be exercised without hardware.

use std::fmt::Debug;

use parking_lot::Mutex;

use dpm_hw::{Address, ChannelConfig, Word};

use crate::error::Result;

/// Identity and configuration discovered when a device is opened. Decoded
/// from the module EEPROM by the backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Bus device number the module was found at.
    pub device_number: usize,
    /// Physical slot in the crate.
    pub slot: usize,
    /// Board serial number.
    pub serial: u32,
    /// Raw board revision field.
    pub revision: i32,
    /// Revision of the crate backplane the module reports.
    pub crate_revision: i32,
    /// EEPROM layout format.
    pub eeprom_format: i32,
    /// Per-channel analog front-end configuration.
    pub configs: Vec<ChannelConfig>,
    /// PCI bus number, used to disambiguate duplicate slots.
    pub pci_bus: i32,
    /// PCI slot number, used to disambiguate duplicate slots.
    pub pci_slot: i32,
}

impl DeviceInfo {
    /// Number of channels the module carries.
    pub fn num_channels(&self) -> usize {
        self.configs.len()
    }
}

/// One bus device: register cells addressed by byte offset and block DMA
/// addressed by word address.
pub trait BusDriver: Debug + Send {
    /// Identity decoded at open.
    fn info(&self) -> &DeviceInfo;

    /// Read a 32-bit register cell.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the access faults.
    fn read_word(&self, offset: usize) -> Result<Word>;

    /// Write a 32-bit register cell.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the access faults.
    fn write_word(&self, offset: usize, value: Word) -> Result<()>;

    /// Block-copy `out.len()` words from `source`. Transfers are limited to
    /// [`dpm_hw::MAX_DMA_BLOCK_SIZE`] words; the port enforces the limit.
    ///
    /// # Errors
    ///
    /// Returns a bus error if the transfer fails.
    fn dma_read(&self, source: Address, out: &mut [Word]) -> Result<()>;

    /// Release the device.
    fn close(&mut self) -> Result<()>;
}

/// The module's serialized hardware access point.
///
/// The inner mutex is the module bus lock: it serializes register and DMA
/// access without being held across anything that sleeps. When no driver is
/// bound, reads return 0 and writes are dropped.
pub struct BusPort {
    driver: Mutex<Option<Box<dyn BusDriver>>>,
    reg_trace: bool,
}

impl Debug for BusPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusPort")
            .field("bound", &self.driver.lock().is_some())
            .field("reg_trace", &self.reg_trace)
            .finish()
    }
}

impl BusPort {
    pub fn new(reg_trace: bool) -> Self {
        Self {
            driver: Mutex::new(None),
            reg_trace,
        }
    }

    /// Bind a driver to the port. Returns the previous driver if one was
    /// bound; the caller decides whether that is an error.
    pub fn bind(&self, driver: Box<dyn BusDriver>) -> Option<Box<dyn BusDriver>> {
        self.driver.lock().replace(driver)
    }

    /// Unbind and close the driver, if any.
    pub fn release(&self) -> Result<()> {
        if let Some(mut driver) = self.driver.lock().take() {
            driver.close()?;
        }
        Ok(())
    }

    /// True when a driver is bound.
    pub fn have_hardware(&self) -> bool {
        self.driver.lock().is_some()
    }

    /// Device identity, if bound.
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.driver.lock().as_ref().map(|d| d.info().clone())
    }

    /// Read a register cell. Returns 0 when no hardware is bound.
    pub fn read_word(&self, offset: usize) -> Result<Word> {
        let guard = self.driver.lock();
        let value = match guard.as_ref() {
            Some(driver) => driver.read_word(offset)?,
            None => 0,
        };
        if self.reg_trace {
            tracing::debug!("M r {offset:#06x} => {value:#010x}");
        }
        Ok(value)
    }

    /// Write a register cell. Dropped when no hardware is bound.
    pub fn write_word(&self, offset: usize, value: Word) -> Result<()> {
        if self.reg_trace {
            tracing::debug!("M w {offset:#06x} <= {value:#010x}");
        }
        let guard = self.driver.lock();
        match guard.as_ref() {
            Some(driver) => driver.write_word(offset, value),
            None => Ok(()),
        }
    }

    /// Block DMA from `source`, split into maximum-block-size transfers.
    /// Zero-fills when no hardware is bound.
    pub fn dma_read(&self, source: Address, out: &mut [Word]) -> Result<()> {
        let guard = self.driver.lock();
        let Some(driver) = guard.as_ref() else {
            out.fill(0);
            return Ok(());
        };
        let mut addr = source;
        for chunk in out.chunks_mut(dpm_hw::MAX_DMA_BLOCK_SIZE) {
            driver.dma_read(addr, chunk)?;
            addr += chunk.len() as Address;
        }
        Ok(())
    }
}

/// Single-word DSP memory access through the address/data port pair.
///
/// Used for variable I/O; bulk reads of DSP memory go through DMA instead.
pub fn dsp_read(bus: &BusPort, addr: Address) -> Result<Word> {
    bus.write_word(dpm_hw::regs::DSP_ADDR, addr)?;
    bus.read_word(dpm_hw::regs::DSP_DATA)
}

/// Single-word DSP memory write. See [`dsp_read`].
pub fn dsp_write(bus: &BusPort, addr: Address, value: Word) -> Result<()> {
    bus.write_word(dpm_hw::regs::DSP_ADDR, addr)?;
    bus.write_word(dpm_hw::regs::DSP_DATA, value)
}

/// Signal FPGA register write through its address/data port pair.
pub fn fippi_write(bus: &BusPort, addr: Address, value: Word) -> Result<()> {
    bus.write_word(dpm_hw::regs::FIPPI_ADDR, addr)?;
    bus.write_word(dpm_hw::regs::FIPPI_DATA, value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_port_reads_zero() {
        let port = BusPort::new(false);
        assert!(!port.have_hardware());
        assert_eq!(port.read_word(dpm_hw::regs::CSR).unwrap(), 0);
        port.write_word(dpm_hw::regs::CSR, 0xdead_beef).unwrap();
        let mut words = vec![0xffff_ffff; 16];
        port.dma_read(0, &mut words).unwrap();
        assert!(words.iter().all(|&w| w == 0));
    }
}
