//! Hardware-variant fixtures.
//!
//! Board revisions differ in how calibration and ADC acquisition work. The
//! variation is captured in tagged variants selected at open time from the
//! revision tag: a default mainboard variant that routes everything through
//! DSP-hosted control tasks, and the AFE daughter-board variant (revision H)
//! that drives the offset DACs and ADC swap compensation from the host.
//!
//! Channel fixtures describe the daughter board behind one channel; module
//! fixtures hold module-wide calibration state and the algorithms.

pub mod afe;

use dpm_hw::{regs, RevTag, Word};

use crate::bus::BusPort;
use crate::error::{Error, Result};
use crate::module::ModuleCore;
use crate::param::Value;
use crate::run::ControlTask;

/// Whether a channel's paired ADC is clocked on the wrong edge. Unknown
/// until the swap detection has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdcSwapState {
    #[default]
    BootState,
    Unswapped,
    Swapped,
}

/// A channel on a daughter board.
#[derive(Debug, Clone)]
pub struct Db {
    /// Daughter-board position within the module.
    pub number: usize,
    /// First module channel carried by this board.
    pub base: usize,
    /// Channel offset relative to the board.
    pub offset: usize,
    /// Swap detection outcome.
    pub adc_state: AdcSwapState,
}

impl Db {
    pub fn new(channel: usize, channels_per_db: usize) -> Self {
        let number = channel / channels_per_db;
        let base = number * channels_per_db;
        Self {
            number,
            base,
            offset: channel - base,
            adc_state: AdcSwapState::BootState,
        }
    }
}

/// Per-channel hardware-variant behavior.
#[derive(Debug, Clone, Default)]
pub enum ChannelFixture {
    /// Channel wired directly on the motherboard; offset control lives in
    /// the DSP.
    #[default]
    Motherboard,
    /// Generic daughter-board channel without its own offset DAC.
    Db(Db),
    /// DB04 channel with a host-programmed offset DAC.
    Db04(Db),
}

impl ChannelFixture {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Motherboard => "motherboard",
            Self::Db(_) => "DB",
            Self::Db04(_) => "DB04",
        }
    }

    /// Daughter-board placement, if the channel sits on one.
    pub fn db(&self) -> Option<&Db> {
        match self {
            Self::Motherboard => None,
            Self::Db(db) | Self::Db04(db) => Some(db),
        }
    }

    fn db_mut(&mut self) -> Option<&mut Db> {
        match self {
            Self::Motherboard => None,
            Self::Db(db) | Self::Db04(db) => Some(db),
        }
    }

    /// True when the channel carries its own offset DAC.
    pub fn has_offset_dac(&self) -> bool {
        matches!(self, Self::Db04(_))
    }

    /// RC settle time of the DAC output filter, in milliseconds.
    pub fn dac_settle_period_ms(&self) -> u64 {
        match self {
            Self::Db04(_) => afe::DB04_DAC_SETTLE_TIME_MS,
            _ => 0,
        }
    }

    /// Record the swap detection outcome. Only the first determination
    /// after boot sticks.
    pub fn set_adc_swap(&mut self, swapped: bool) {
        if let Some(db) = self.db_mut() {
            if db.adc_state == AdcSwapState::BootState {
                db.adc_state = if swapped {
                    AdcSwapState::Swapped
                } else {
                    AdcSwapState::Unswapped
                };
            }
        }
    }

    /// Clear the swap determination, done when the signal FPGA reloads.
    pub fn reset_adc_swap(&mut self) {
        if let Some(db) = self.db_mut() {
            db.adc_state = AdcSwapState::BootState;
        }
    }

    pub fn adc_swapped(&self) -> bool {
        self.db().is_some_and(|db| db.adc_state == AdcSwapState::Swapped)
    }

    /// Program the channel's offset DAC.
    ///
    /// # Errors
    ///
    /// `Internal` for fixtures whose offset control is DSP-hosted;
    /// `InvalidValue` for out-of-range codes.
    pub fn set_dac(&self, bus: &BusPort, value: Value) -> Result<()> {
        match self {
            Self::Db04(db) => afe::db04_set_dac(bus, db, value),
            _ => Err(Error::internal("invalid fixture op: set DAC is using the DSP")),
        }
    }
}

/// Module-wide hardware-variant behavior.
#[derive(Debug, Default)]
pub enum ModuleFixture {
    /// Default variant; calibration runs on the DSP.
    #[default]
    Mainboard,
    /// Daughter-board AFE variant (revision H).
    AfeDbs(afe::AfeDbs),
}

impl ModuleFixture {
    /// Select the fixture for a board revision.
    pub fn for_revision(rev: Option<RevTag>) -> Self {
        match rev {
            Some(RevTag::RevH) => Self::AfeDbs(afe::AfeDbs::new()),
            _ => Self::Mainboard,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Mainboard => "mainboard",
            Self::AfeDbs(_) => "afe-dbs",
        }
    }

    /// Create the channel fixtures from the EEPROM channel configs.
    pub fn init_channels(&self, core: &mut ModuleCore) {
        tracing::debug!("{}: fixture: init-channels", core.label());
        for channel in &mut core.channels {
            let kind = channel.config.fixture;
            let per_db = kind.channels_per_db();
            channel.fixture = match kind {
                dpm_hw::DbKind::Mainboard => ChannelFixture::Motherboard,
                dpm_hw::DbKind::Db04 => ChannelFixture::Db04(Db::new(channel.number, per_db)),
                _ => ChannelFixture::Db(Db::new(channel.number, per_db)),
            };
        }
    }

    /// Comms FPGA load hook.
    pub fn fpga_comms_loaded(&mut self) {}

    /// Signal FPGA load hook; a reload invalidates the swap compensation.
    pub fn fpga_fippi_loaded(&mut self, core: &mut ModuleCore) {
        if let Self::AfeDbs(afe) = self {
            afe.fippi_loaded();
            for channel in &mut core.channels {
                channel.fixture.reset_adc_swap();
            }
        }
    }

    /// DSP load hook.
    pub fn dsp_loaded(&mut self) {}

    /// Boot-time fixture initialization; the AFE variant runs the ADC swap
    /// detection here.
    pub fn boot(&mut self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        match self {
            Self::Mainboard => Ok(()),
            Self::AfeDbs(afe) => afe.boot(core, bus),
        }
    }

    /// Program every channel's offset DAC from the OffsetDAC variables.
    pub fn set_dacs(&self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        match self {
            Self::Mainboard => {
                // The DSP task reads the variables from its own memory.
                core.sync_to_dsp(bus)?;
                crate::module::control_run(core, bus, ControlTask::SetDacs)
            }
            Self::AfeDbs(afe) => afe.set_dacs(core, bus),
        }
    }

    /// Capture a fresh ADC trace on every channel.
    pub fn get_traces(&self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        for chan in 0..core.num_channels {
            afe::acquire_adc(core, bus, chan)?;
        }
        Ok(())
    }

    /// Drive every channel's baseline to its configured target.
    pub fn adjust_offsets(&mut self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        match self {
            Self::Mainboard => {
                core.sync_to_dsp(bus)?;
                crate::module::control_run(core, bus, ControlTask::AdjustOffsets)?;
                // The DSP wrote the final codes back; refresh the cache.
                for chan in 0..core.num_channels {
                    let addr = crate::param::channel_var_address(
                        crate::param::ChannelVar::OffsetDac,
                        chan,
                    );
                    let value = crate::bus::dsp_read(bus, addr)?;
                    let slot =
                        &mut core.channels[chan].vars[crate::param::ChannelVar::OffsetDac as usize];
                    slot.cells[0].value = value;
                    slot.cells[0].dirty = false;
                }
                Ok(())
            }
            Self::AfeDbs(afe) => afe.adjust_offsets(core, bus),
        }
    }

    /// Reconcile register-level state derived from the variables after a
    /// variable sync.
    pub fn sync_hw(&self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        match self {
            Self::Mainboard => Ok(()),
            Self::AfeDbs(afe) => afe.set_dacs(core, bus),
        }
    }
}

/// Write a signal-FPGA daughter-board register.
pub(crate) fn write_db_register(bus: &BusPort, db: usize, reg: u32, value: Word) -> Result<()> {
    crate::bus::fippi_write(bus, regs::db_addr(db, reg), value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_placement() {
        let db = Db::new(11, 8);
        assert_eq!(db.number, 1);
        assert_eq!(db.base, 8);
        assert_eq!(db.offset, 3);
    }

    #[test]
    fn swap_state_sticks_after_first_set() {
        let mut fixture = ChannelFixture::Db04(Db::new(0, 8));
        fixture.set_adc_swap(true);
        assert!(fixture.adc_swapped());
        fixture.set_adc_swap(false);
        assert!(fixture.adc_swapped(), "first determination sticks");
        fixture.reset_adc_swap();
        fixture.set_adc_swap(false);
        assert!(!fixture.adc_swapped());
    }

    #[test]
    fn fixture_selection_by_revision() {
        assert!(matches!(
            ModuleFixture::for_revision(Some(RevTag::RevH)),
            ModuleFixture::AfeDbs(_)
        ));
        assert!(matches!(
            ModuleFixture::for_revision(Some(RevTag::RevF)),
            ModuleFixture::Mainboard
        ));
        assert!(matches!(ModuleFixture::for_revision(None), ModuleFixture::Mainboard));
    }

    #[test]
    fn motherboard_has_no_dac() {
        let fixture = ChannelFixture::Motherboard;
        assert!(!fixture.has_offset_dac());
        assert_eq!(fixture.dac_settle_period_ms(), 0);
        let bus = BusPort::new(false);
        assert!(fixture.set_dac(&bus, 100).is_err());
    }
}
