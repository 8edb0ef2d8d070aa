//! Firmware images and the crate registry.
//!
//! Images are keyed by a tag of (board revision, ADC MSPS, ADC bits); a
//! module binds the set matching each of its channel configurations at
//! `Crate::set_firmware` time. Loading streams the image words into the
//! matching programming port; image parsing lives outside the SDK.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;

use dpm_hw::regs;

use crate::bus::BusPort;
use crate::error::{Error, Result};

/// Which device on the module an image programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareKind {
    /// Communications FPGA.
    Comms,
    /// Signal-processing FPGA.
    Fippi,
    /// DSP code.
    Dsp,
    /// DSP variable layout descriptor.
    Var,
}

impl FirmwareKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Comms => "comms",
            Self::Fippi => "fippi",
            Self::Dsp => "dsp",
            Self::Var => "var",
        }
    }
}

/// Registry key: the hardware variant an image set was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FirmwareTag {
    pub revision: i32,
    pub adc_msps: u32,
    pub adc_bits: u32,
}

impl fmt::Display for FirmwareTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rev{}-{}m-{}b", self.revision, self.adc_msps, self.adc_bits)
    }
}

/// One firmware image.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    pub tag: FirmwareTag,
    pub kind: FirmwareKind,
    pub version: String,
    pub filename: String,
    /// Image payload; `Bytes` keeps clones cheap when several modules bind
    /// the same set.
    pub data: Bytes,
}

impl FirmwareImage {
    pub fn new(
        tag: FirmwareTag,
        kind: FirmwareKind,
        version: impl Into<String>,
        filename: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            tag,
            kind,
            version: version.into(),
            filename: filename.into(),
            data: data.into(),
        }
    }

    /// File name without directories, as exported in config metadata.
    pub fn basename(&self) -> &str {
        Path::new(&self.filename)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.filename)
    }
}

/// Crate-wide firmware registry. Read-only after `Crate::set_firmware`.
#[derive(Debug, Default)]
pub struct FirmwareRegistry {
    images: Vec<Arc<FirmwareImage>>,
}

impl FirmwareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, image: FirmwareImage) {
        tracing::info!(
            "fw: add: {} {} {}",
            image.tag,
            image.kind.label(),
            image.basename()
        );
        self.images.push(Arc::new(image));
    }

    /// All images registered for a tag.
    pub fn find(&self, tag: FirmwareTag) -> Vec<Arc<FirmwareImage>> {
        self.images.iter().filter(|i| i.tag == tag).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<FirmwareImage>> {
        self.images.iter()
    }
}

/// Find the image of `kind` in a module's bound set.
pub fn get(images: &[Arc<FirmwareImage>], kind: FirmwareKind) -> Result<Arc<FirmwareImage>> {
    images
        .iter()
        .find(|i| i.kind == kind)
        .cloned()
        .ok_or_else(|| Error::internal(format!("no {} firmware bound", kind.label())))
}

/// Stream an image into its programming port.
///
/// The image bytes are packed into words little-endian and written to the
/// port for the device kind; the var descriptor image programs nothing.
///
/// # Errors
///
/// Returns a bus error if any write faults.
pub fn load(bus: &BusPort, kind: FirmwareKind, data: &Bytes) -> Result<()> {
    let port = match kind {
        FirmwareKind::Comms => regs::FPGA_COMMS_PROG,
        FirmwareKind::Fippi => regs::FPGA_FIPPI_PROG,
        FirmwareKind::Dsp => regs::DSP_PROG,
        FirmwareKind::Var => return Ok(()),
    };
    for chunk in data.chunks(4) {
        let mut word = [0u8; 4];
        word[..chunk.len()].copy_from_slice(chunk);
        bus.write_word(port, u32::from_le_bytes(word))?;
    }
    tracing::debug!("fw: load: {}: {} bytes", kind.label(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag() -> FirmwareTag {
        FirmwareTag { revision: 17, adc_msps: 250, adc_bits: 14 }
    }

    #[test]
    fn registry_finds_by_tag() {
        let mut registry = FirmwareRegistry::new();
        registry.add(FirmwareImage::new(tag(), FirmwareKind::Comms, "1.0", "a/comms.bin", vec![0u8; 8]));
        registry.add(FirmwareImage::new(tag(), FirmwareKind::Dsp, "1.0", "a/dsp.ldr", vec![0u8; 8]));
        let other = FirmwareTag { revision: 15, ..tag() };
        assert_eq!(registry.find(tag()).len(), 2);
        assert!(registry.find(other).is_empty());
    }

    #[test]
    fn basename_strips_directories() {
        let image = FirmwareImage::new(tag(), FirmwareKind::Fippi, "2.1", "/opt/fw/fippi.bin", vec![]);
        assert_eq!(image.basename(), "fippi.bin");
    }

    #[test]
    fn bound_set_lookup() {
        let images = vec![Arc::new(FirmwareImage::new(
            tag(),
            FirmwareKind::Comms,
            "1.0",
            "comms.bin",
            vec![],
        ))];
        assert!(get(&images, FirmwareKind::Comms).is_ok());
        assert!(get(&images, FirmwareKind::Dsp).is_err());
    }
}
