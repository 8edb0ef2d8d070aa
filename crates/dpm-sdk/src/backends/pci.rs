//! PCI bus backend.
//!
//! Finds modules by scanning `/sys/bus/pci/devices` for the bridge
//! vendor/device pair, maps BAR0 (`resource0`) as the register window, and
//! decodes the module EEPROM through the control/data register pair.
//!
//! DMA block reads burst through the FIFO/memory windows with a host bus
//! request asserted around the transfer. Register cells are volatile; the
//! mapping is exclusive per process by way of the sysfs resource open.

#![allow(clippy::cast_possible_truncation)]

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};

use dpm_hw::{regs, Address, ChannelConfig, DbKind, Word, EEPROM_BLOCK_SIZE};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};

use crate::bus::{BusDriver, DeviceInfo};
use crate::error::{Error, Result};

/// A mapped PCI register window plus the decoded device identity.
pub struct PciBus {
    info: DeviceInfo,
    ptr: *mut u8,
    size: usize,
    _file: File,
}

impl std::fmt::Debug for PciBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciBus")
            .field("device", &self.info.device_number)
            .field("slot", &self.info.slot)
            .field("window", &format_args!("{:p}+{:#x}", self.ptr, self.size))
            .finish()
    }
}

// SAFETY: the mapping is owned exclusively and all access goes through
// volatile reads/writes with bounds checks; no thread-local state.
unsafe impl Send for PciBus {}

impl PciBus {
    /// Open the `device_number`-th matching PCI device in bus-address order.
    ///
    /// # Errors
    ///
    /// `ModuleNotFound` when fewer than `device_number + 1` devices match;
    /// a bus error when the window cannot be mapped.
    pub fn open(device_number: usize) -> Result<Self> {
        let mut matches = scan_devices()?;
        matches.sort();
        let Some(sysfs) = matches.into_iter().nth(device_number) else {
            return Err(Error::ModuleNotFound { device: device_number });
        };

        let resource = sysfs.join("resource0");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&resource)
            .map_err(|e| Error::bus(format!("open {}: {e}", resource.display())))?;
        let size = file
            .metadata()
            .map_err(|e| Error::bus(format!("stat {}: {e}", resource.display())))?
            .len() as usize;

        // SAFETY: file descriptor is open read/write; a failed mapping
        // returns Err instead of an invalid pointer.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| Error::bus(format!("mmap {}: {e}", resource.display())))?;

        let (pci_bus, pci_slot) = parse_pci_address(&sysfs);

        let mut bus = Self {
            info: DeviceInfo {
                device_number,
                slot: 0,
                serial: 0,
                revision: 0,
                crate_revision: 0,
                eeprom_format: 0,
                configs: Vec::new(),
                pci_bus,
                pci_slot,
            },
            ptr: ptr.cast(),
            size,
            _file: file,
        };

        bus.info = bus.decode_eeprom(device_number, pci_bus, pci_slot)?;

        tracing::info!(
            "pci: device {device_number}: slot {} serial {} rev {}",
            bus.info.slot,
            bus.info.serial,
            bus.info.revision
        );

        Ok(bus)
    }

    fn reg_read(&self, offset: usize) -> Result<Word> {
        if offset + 4 > self.size {
            return Err(Error::bus(format!("register offset out of window: {offset:#x}")));
        }
        // SAFETY: ptr is valid for size bytes from mmap; offset bounds
        // checked above; MMIO cells are naturally aligned.
        Ok(unsafe { std::ptr::read_volatile(self.ptr.add(offset).cast::<Word>()) })
    }

    fn reg_write(&self, offset: usize, value: Word) -> Result<()> {
        if offset + 4 > self.size {
            return Err(Error::bus(format!("register offset out of window: {offset:#x}")));
        }
        // SAFETY: as in `reg_read`; writes trigger hardware side effects.
        unsafe {
            std::ptr::write_volatile(self.ptr.add(offset).cast::<Word>(), value);
        }
        Ok(())
    }

    fn read_eeprom_byte(&self, addr: usize) -> Result<u8> {
        self.reg_write(regs::EEPROM_CTRL, addr as Word)?;
        Ok((self.reg_read(regs::EEPROM_DATA)? & 0xff) as u8)
    }

    /// Decode the identity block out of the EEPROM.
    ///
    /// Layout (format 2): `[format, slot, revision, crate_rev, serial_lo,
    /// serial_hi, num_channels, adc_bits, adc_msps_lo, adc_msps_hi,
    /// adc_clk_div, fixture]`.
    fn decode_eeprom(&self, device_number: usize, pci_bus: i32, pci_slot: i32) -> Result<DeviceInfo> {
        let mut block = [0u8; EEPROM_BLOCK_SIZE];
        for (i, byte) in block.iter_mut().enumerate() {
            *byte = self.read_eeprom_byte(i)?;
        }

        let eeprom_format = i32::from(block[0]);
        let slot = usize::from(block[1]);
        let revision = i32::from(block[2]);
        let crate_revision = i32::from(block[3]);
        let serial = u32::from(block[4]) | (u32::from(block[5]) << 8);
        let num_channels = usize::from(block[6]).min(dpm_hw::MAX_CHANNELS);
        let adc_bits = u32::from(block[7]);
        let adc_msps = u32::from(block[8]) | (u32::from(block[9]) << 8);
        let adc_clk_div = u32::from(block[10]).max(1);
        let fixture = match block[11] {
            1 => DbKind::Db01,
            2 => DbKind::Db02,
            4 => DbKind::Db04,
            6 => DbKind::Db06,
            7 => DbKind::Db07,
            _ => DbKind::Mainboard,
        };

        if num_channels == 0 {
            return Err(Error::bus(format!(
                "device {device_number}: EEPROM reports no channels"
            )));
        }

        let configs = (0..num_channels)
            .map(|c| ChannelConfig::new(c, fixture, adc_bits, adc_msps, adc_clk_div))
            .collect();

        Ok(DeviceInfo {
            device_number,
            slot,
            serial,
            revision,
            crate_revision,
            eeprom_format,
            configs,
            pci_bus,
            pci_slot,
        })
    }
}

impl BusDriver for PciBus {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_word(&self, offset: usize) -> Result<Word> {
        self.reg_read(offset)
    }

    fn write_word(&self, offset: usize, value: Word) -> Result<()> {
        self.reg_write(offset, value)
    }

    fn dma_read(&self, source: Address, out: &mut [Word]) -> Result<()> {
        if out.len() > dpm_hw::MAX_DMA_BLOCK_SIZE {
            return Err(Error::invalid_value(format!(
                "DMA block too large: {} words",
                out.len()
            )));
        }
        // Assert the host bus request for the duration of the burst.
        self.reg_write(regs::REQUEST, 1)?;
        self.reg_write(regs::DSP_ADDR, source)?;
        for word in out.iter_mut() {
            *word = self.reg_read(regs::DSP_DATA)?;
        }
        self.reg_write(regs::REQUEST, 0)
    }

    fn close(&mut self) -> Result<()> {
        tracing::info!("pci: device {}: close", self.info.device_number);
        Ok(())
    }
}

impl Drop for PciBus {
    fn drop(&mut self) {
        // SAFETY: ptr/size are the exact values returned by mmap and Drop
        // runs at most once.
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

/// Scan sysfs for devices matching the bridge vendor/device pair.
fn scan_devices() -> Result<Vec<PathBuf>> {
    let root = Path::new("/sys/bus/pci/devices");
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return Ok(Vec::new()),
    };

    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let vendor = read_hex_sysfs(&path.join("vendor"));
        let device = read_hex_sysfs(&path.join("device"));
        if vendor == Some(dpm_hw::pcie::VENDOR_ID) && device == Some(dpm_hw::pcie::DEVICE_ID) {
            matches.push(path);
        }
    }
    Ok(matches)
}

fn read_hex_sysfs(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    u16::from_str_radix(content.trim().trim_start_matches("0x"), 16).ok()
}

/// Pull `(bus, slot)` out of a sysfs device path like `0000:04:0d.0`.
fn parse_pci_address(path: &Path) -> (i32, i32) {
    let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let mut parts = name.split(&[':', '.'][..]).skip(1);
    let bus = parts
        .next()
        .and_then(|s| i32::from_str_radix(s, 16).ok())
        .unwrap_or(-1);
    let slot = parts
        .next()
        .and_then(|s| i32::from_str_radix(s, 16).ok())
        .unwrap_or(-1);
    (bus, slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_address_parsing() {
        let (bus, slot) = parse_pci_address(Path::new("/sys/bus/pci/devices/0000:04:0d.0"));
        assert_eq!(bus, 4);
        assert_eq!(slot, 13);
    }

    #[test]
    #[ignore] // Requires hardware
    fn open_first_device() {
        match PciBus::open(0) {
            Ok(bus) => {
                println!("device 0: slot {}", bus.info().slot);
                assert!(bus.info().num_channels() > 0);
            }
            Err(e) => println!("no hardware: {e}"),
        }
    }
}
