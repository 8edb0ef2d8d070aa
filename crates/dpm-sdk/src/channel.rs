//! Per-channel state.
//!
//! A channel owns its variable cache, its last captured ADC trace, and the
//! channel fixture describing the daughter-board hardware behind it. The
//! module owns its channels; channel methods never reach back into the
//! module, they operate on what the channel owns and leave bus traffic to
//! the module layer.

use dpm_hw::{AdcWord, ChannelConfig};

use crate::error::Result;
use crate::fixture::ChannelFixture;
use crate::param::{self, channel_var_descriptors, ChannelVar, Value, VarSlot};

#[derive(Debug)]
pub struct Channel {
    /// Channel number within the module.
    pub number: usize,
    /// Analog front-end configuration from the EEPROM.
    pub config: ChannelConfig,
    /// Hardware-variant behavior for this channel.
    pub fixture: ChannelFixture,
    /// Cached DSP variables, indexed by [`ChannelVar`].
    pub vars: Vec<VarSlot>,
    /// Last captured ADC trace.
    pub adc_trace: Vec<AdcWord>,
}

impl Channel {
    pub fn new(number: usize, config: ChannelConfig) -> Self {
        let vars = channel_var_descriptors()
            .iter()
            .map(|d| VarSlot::new(d.size))
            .collect();
        Self {
            number,
            config,
            fixture: ChannelFixture::Motherboard,
            vars,
            adc_trace: Vec::new(),
        }
    }

    /// Cached value of a variable's first cell.
    pub fn var(&self, var: ChannelVar) -> Value {
        self.vars[var as usize].cells[0].value
    }

    /// Set a variable in the cache and mark it dirty.
    pub fn set_var(&mut self, var: ChannelVar, value: Value) {
        let cell = &mut self.vars[var as usize].cells[0];
        cell.value = value;
        cell.dirty = true;
    }

    /// Clear every cached value and dirty flag.
    pub fn erase_vars(&mut self) {
        for slot in &mut self.vars {
            slot.erase();
        }
    }

    /// Baseline target as a fraction of ADC full scale, in percent.
    pub fn baseline_percent(&self) -> f64 {
        f64::from(self.var(ChannelVar::BaselinePercent)).clamp(0.0, 100.0)
    }

    /// Set the channel's offset voltage by programming the OffsetDAC
    /// variable. The DAC itself is updated on the next `set_dacs`.
    ///
    /// # Errors
    ///
    /// `InvalidValue` when the voltage is outside the DAC range.
    pub fn voffset(&mut self, volts: f64) -> Result<()> {
        let dac = param::voffset_to_dac(volts)?;
        self.set_var(ChannelVar::OffsetDac, dac);
        Ok(())
    }

    /// The channel's current offset voltage, derived from the cached DAC.
    pub fn voffset_volts(&self) -> f64 {
        param::dac_to_voffset(self.var(ChannelVar::OffsetDac))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpm_hw::DbKind;

    fn channel() -> Channel {
        Channel::new(0, ChannelConfig::new(0, DbKind::Db04, 14, 250, 2))
    }

    #[test]
    fn writes_mark_dirty() {
        let mut chan = channel();
        assert!(!chan.vars[ChannelVar::OffsetDac as usize].cells[0].dirty);
        chan.set_var(ChannelVar::OffsetDac, 32768);
        assert!(chan.vars[ChannelVar::OffsetDac as usize].cells[0].dirty);
        assert_eq!(chan.var(ChannelVar::OffsetDac), 32768);
    }

    #[test]
    fn voffset_round_trip() {
        let mut chan = channel();
        chan.voffset(-1.5).unwrap();
        assert_eq!(chan.var(ChannelVar::OffsetDac), 65535);
        chan.voffset(1.5).unwrap();
        assert_eq!(chan.var(ChannelVar::OffsetDac), 0);
        chan.voffset(0.0).unwrap();
        assert!(chan.voffset_volts().abs() < 0.001);
        assert!(chan.voffset(1.6).is_err());
    }

    #[test]
    fn baseline_percent_clamps() {
        let mut chan = channel();
        chan.set_var(ChannelVar::BaselinePercent, 10);
        assert!((chan.baseline_percent() - 10.0).abs() < f64::EPSILON);
        chan.set_var(ChannelVar::BaselinePercent, 400);
        assert!((chan.baseline_percent() - 100.0).abs() < f64::EPSILON);
    }
}
