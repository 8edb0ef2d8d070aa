//! Hardware model for DPM digital pulse-processing modules.
//!
//! This crate collects everything that is fixed by the board design and
//! shared by every backend: crate/module limits, the host register window
//! layout, DSP memory geometry, and the per-channel analog front-end
//! configuration records read out of the module EEPROM.
//!
//! It deliberately has no dependencies; the SDK crate (`dpm-sdk`) builds the
//! driver proper on top of it.

pub mod config;
pub mod regs;

pub use config::{ChannelConfig, DbKind};

use std::time::Duration;

/// Basic unit of register and DMA communication.
pub type Word = u32;

/// DSP / DMA word address.
pub type Address = u32;

/// A single ADC sample. Traces are unpacked from 32-bit words, two samples
/// per word, low half first.
pub type AdcWord = u16;

/// An unpacked ADC trace.
pub type AdcTrace = Vec<AdcWord>;

/// Board revision tags. The numeric values match the revision field stored
/// in the module EEPROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum RevTag {
    RevA = 10,
    RevB,
    RevC,
    RevD,
    RevE,
    RevF,
    RevG,
    RevH,
    RevI,
    RevJ,
    RevK,
    RevL,
}

impl RevTag {
    /// Map the raw EEPROM revision field onto a tag. Unknown values return
    /// `None`; callers treat those modules as not bootable.
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            10 => Some(Self::RevA),
            11 => Some(Self::RevB),
            12 => Some(Self::RevC),
            13 => Some(Self::RevD),
            14 => Some(Self::RevE),
            15 => Some(Self::RevF),
            16 => Some(Self::RevG),
            17 => Some(Self::RevH),
            18 => Some(Self::RevI),
            19 => Some(Self::RevJ),
            20 => Some(Self::RevK),
            21 => Some(Self::RevL),
            _ => None,
        }
    }

    /// Single letter label, `A` through `L`.
    pub fn label(self) -> char {
        (b'A' + (self as i32 - 10) as u8) as char
    }
}

/// Maximum number of slots in a crate.
pub const MAX_SLOTS: usize = 13;

/// Maximum number of channels a module can carry.
pub const MAX_CHANNELS: usize = 32;

/// Maximum ADC trace length in samples.
pub const MAX_ADC_TRACE_LENGTH: usize = 8192;

/// Maximum words moved by a single DMA block transfer.
pub const MAX_DMA_BLOCK_SIZE: usize = 8192;

/// Size of the hardware list-mode FIFO in words.
pub const FIFO_SIZE_WORDS: usize = 131_072;

/// DSP I/O buffer length in words.
pub const IO_BUFFER_LENGTH: usize = 65_536;

/// Histogram lengths by channel density.
pub const LARGE_HISTOGRAM_LENGTH: usize = 32_768;
pub const SMALL_HISTOGRAM_LENGTH: usize = 16_384;

/// EEPROM block size in bytes.
pub const EEPROM_BLOCK_SIZE: usize = 128;

/// System FPGA clock in MHz.
pub const SYSTEM_CLOCK_MHZ: usize = 100;

/// PCI identification for the bus bridge the modules sit behind.
pub mod pcie {
    /// PLX Technology, the PCI bridge vendor on every board revision.
    pub const VENDOR_ID: u16 = 0x10B5;

    /// PLX 9054 bridge device id.
    pub const DEVICE_ID: u16 = 0x9054;
}

/// Busy-wait friendly sleep used around DAC settling and SPI shifts.
pub fn wait_usecs(usecs: u64) {
    std::thread::sleep(Duration::from_micros(usecs));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rev_tag_round_trip() {
        assert_eq!(RevTag::from_raw(17), Some(RevTag::RevH));
        assert_eq!(RevTag::RevH.label(), 'H');
        assert_eq!(RevTag::from_raw(9), None);
        assert_eq!(RevTag::from_raw(22), None);
    }

    #[test]
    fn trace_fits_in_dma_block() {
        // Traces are read as packed pairs, so half the sample count in words.
        assert!(MAX_ADC_TRACE_LENGTH / 2 <= MAX_DMA_BLOCK_SIZE);
    }
}
