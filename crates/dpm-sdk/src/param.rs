//! DSP variables and user parameters.
//!
//! A *variable* is a DSP memory cell (or small array of cells) described by
//! a descriptor: name, address, length, and access mode. A *parameter* is a
//! named, unit-converted view over one or more variables. The module keeps a
//! host-side cache of every variable; writes mark the slot dirty and
//! `sync_vars` flushes dirty cells to the DSP in address order.
//!
//! The address map is fixed by the DSP build: module variables first, then
//! one block of [`dpm_hw::MAX_CHANNELS`] cells per channel variable.

use dpm_hw::{Address, Word, MAX_CHANNELS};

use crate::error::{Error, Result};

/// Variable value type.
pub type Value = Word;

/// Variable access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarMode {
    ReadOnly,
    ReadWrite,
}

/// Module-level DSP variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ModuleVar {
    ModNum,
    SlotId,
    ModId,
    ModFormat,
    ModCsrA,
    ModCsrB,
    RunTask,
    ControlTask,
    MaxEvents,
    CoincPattern,
    CoincWait,
    SynchWait,
    InSynch,
    Resume,
    SlowFilterRange,
    FastFilterRange,
    FastTrigBackplaneEna,
    CrateId,
    HostRunTimePreset,
    TrigConfig,
    HostIo,
    UserIn,
    U00,
    RealTimeA,
    RealTimeB,
    RunTimeA,
    RunTimeB,
    NumEventsA,
    NumEventsB,
}

/// Channel-level DSP variables, one cell per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChannelVar {
    BLcut,
    BaselinePercent,
    CfdDelay,
    CfdScale,
    CfdThresh,
    ChanCsrA,
    ChanCsrB,
    ChanTrigStretch,
    DigGain,
    EnergyLow,
    ExtTrigStretch,
    ExternDelayLen,
    FastGap,
    FastLength,
    FastThresh,
    FastTrigBackLen,
    FtrigoutDelay,
    GainDac,
    Integrator,
    Log2Bweight,
    Log2Ebin,
    MultiplicityMaskH,
    MultiplicityMaskL,
    OffsetDac,
    PafLength,
    PsaLength,
    PsaOffset,
    PeakSample,
    PreampTau,
    QdcLen0,
    QdcLen1,
    QdcLen2,
    QdcLen3,
    QdcLen4,
    QdcLen5,
    QdcLen6,
    QdcLen7,
    ResetDelay,
    SlowGap,
    SlowLength,
    ThreshWidth,
    TraceLength,
    TrigOutLen,
    TriggerDelay,
    VetoStretch,
    Xavg,
    Xwait,
    LiveTimeA,
    LiveTimeB,
    FastPeaksA,
    FastPeaksB,
}

/// (variable, DSP name, cells, mode) in DSP address order.
const MODULE_VAR_DEFS: &[(ModuleVar, &str, usize, VarMode)] = &[
    (ModuleVar::ModNum, "ModNum", 1, VarMode::ReadWrite),
    (ModuleVar::SlotId, "SlotID", 1, VarMode::ReadWrite),
    (ModuleVar::ModId, "ModID", 1, VarMode::ReadWrite),
    (ModuleVar::ModFormat, "ModFormat", 1, VarMode::ReadWrite),
    (ModuleVar::ModCsrA, "ModCSRA", 1, VarMode::ReadWrite),
    (ModuleVar::ModCsrB, "ModCSRB", 1, VarMode::ReadWrite),
    (ModuleVar::RunTask, "RunTask", 1, VarMode::ReadWrite),
    (ModuleVar::ControlTask, "ControlTask", 1, VarMode::ReadWrite),
    (ModuleVar::MaxEvents, "MaxEvents", 1, VarMode::ReadWrite),
    (ModuleVar::CoincPattern, "CoincPattern", 1, VarMode::ReadWrite),
    (ModuleVar::CoincWait, "CoincWait", 1, VarMode::ReadWrite),
    (ModuleVar::SynchWait, "SynchWait", 1, VarMode::ReadWrite),
    (ModuleVar::InSynch, "InSynch", 1, VarMode::ReadWrite),
    (ModuleVar::Resume, "Resume", 1, VarMode::ReadWrite),
    (ModuleVar::SlowFilterRange, "SlowFilterRange", 1, VarMode::ReadWrite),
    (ModuleVar::FastFilterRange, "FastFilterRange", 1, VarMode::ReadWrite),
    (ModuleVar::FastTrigBackplaneEna, "FastTrigBackplaneEna", 1, VarMode::ReadWrite),
    (ModuleVar::CrateId, "CrateID", 1, VarMode::ReadWrite),
    (ModuleVar::HostRunTimePreset, "HostRunTimePreset", 1, VarMode::ReadWrite),
    (ModuleVar::TrigConfig, "TrigConfig", 4, VarMode::ReadWrite),
    (ModuleVar::HostIo, "HostIO", 16, VarMode::ReadWrite),
    (ModuleVar::UserIn, "UserIn", 16, VarMode::ReadWrite),
    (ModuleVar::U00, "U00", 7, VarMode::ReadWrite),
    (ModuleVar::RealTimeA, "RealTimeA", 1, VarMode::ReadOnly),
    (ModuleVar::RealTimeB, "RealTimeB", 1, VarMode::ReadOnly),
    (ModuleVar::RunTimeA, "RunTimeA", 1, VarMode::ReadOnly),
    (ModuleVar::RunTimeB, "RunTimeB", 1, VarMode::ReadOnly),
    (ModuleVar::NumEventsA, "NumEventsA", 1, VarMode::ReadOnly),
    (ModuleVar::NumEventsB, "NumEventsB", 1, VarMode::ReadOnly),
];

/// (variable, DSP name, mode); every channel variable is one cell per
/// channel, stored as a [`MAX_CHANNELS`]-cell block.
const CHANNEL_VAR_DEFS: &[(ChannelVar, &str, VarMode)] = &[
    (ChannelVar::BLcut, "BLcut", VarMode::ReadWrite),
    (ChannelVar::BaselinePercent, "BaselinePercent", VarMode::ReadWrite),
    (ChannelVar::CfdDelay, "CFDDelay", VarMode::ReadWrite),
    (ChannelVar::CfdScale, "CFDScale", VarMode::ReadWrite),
    (ChannelVar::CfdThresh, "CFDThresh", VarMode::ReadWrite),
    (ChannelVar::ChanCsrA, "ChanCSRa", VarMode::ReadWrite),
    (ChannelVar::ChanCsrB, "ChanCSRb", VarMode::ReadWrite),
    (ChannelVar::ChanTrigStretch, "ChanTrigStretch", VarMode::ReadWrite),
    (ChannelVar::DigGain, "DigGain", VarMode::ReadWrite),
    (ChannelVar::EnergyLow, "EnergyLow", VarMode::ReadWrite),
    (ChannelVar::ExtTrigStretch, "ExtTrigStretch", VarMode::ReadWrite),
    (ChannelVar::ExternDelayLen, "ExternDelayLen", VarMode::ReadWrite),
    (ChannelVar::FastGap, "FastGap", VarMode::ReadWrite),
    (ChannelVar::FastLength, "FastLength", VarMode::ReadWrite),
    (ChannelVar::FastThresh, "FastThresh", VarMode::ReadWrite),
    (ChannelVar::FastTrigBackLen, "FastTrigBackLen", VarMode::ReadWrite),
    (ChannelVar::FtrigoutDelay, "FtrigoutDelay", VarMode::ReadWrite),
    (ChannelVar::GainDac, "GainDAC", VarMode::ReadWrite),
    (ChannelVar::Integrator, "Integrator", VarMode::ReadWrite),
    (ChannelVar::Log2Bweight, "Log2Bweight", VarMode::ReadWrite),
    (ChannelVar::Log2Ebin, "Log2Ebin", VarMode::ReadWrite),
    (ChannelVar::MultiplicityMaskH, "MultiplicityMaskH", VarMode::ReadWrite),
    (ChannelVar::MultiplicityMaskL, "MultiplicityMaskL", VarMode::ReadWrite),
    (ChannelVar::OffsetDac, "OffsetDAC", VarMode::ReadWrite),
    (ChannelVar::PafLength, "PAFlength", VarMode::ReadWrite),
    (ChannelVar::PsaLength, "PSAlength", VarMode::ReadWrite),
    (ChannelVar::PsaOffset, "PSAoffset", VarMode::ReadWrite),
    (ChannelVar::PeakSample, "PeakSample", VarMode::ReadWrite),
    (ChannelVar::PreampTau, "PreampTau", VarMode::ReadWrite),
    (ChannelVar::QdcLen0, "QDCLen0", VarMode::ReadWrite),
    (ChannelVar::QdcLen1, "QDCLen1", VarMode::ReadWrite),
    (ChannelVar::QdcLen2, "QDCLen2", VarMode::ReadWrite),
    (ChannelVar::QdcLen3, "QDCLen3", VarMode::ReadWrite),
    (ChannelVar::QdcLen4, "QDCLen4", VarMode::ReadWrite),
    (ChannelVar::QdcLen5, "QDCLen5", VarMode::ReadWrite),
    (ChannelVar::QdcLen6, "QDCLen6", VarMode::ReadWrite),
    (ChannelVar::QdcLen7, "QDCLen7", VarMode::ReadWrite),
    (ChannelVar::ResetDelay, "ResetDelay", VarMode::ReadWrite),
    (ChannelVar::SlowGap, "SlowGap", VarMode::ReadWrite),
    (ChannelVar::SlowLength, "SlowLength", VarMode::ReadWrite),
    (ChannelVar::ThreshWidth, "ThreshWidth", VarMode::ReadWrite),
    (ChannelVar::TraceLength, "TraceLength", VarMode::ReadWrite),
    (ChannelVar::TrigOutLen, "TrigOutLen", VarMode::ReadWrite),
    (ChannelVar::TriggerDelay, "TriggerDelay", VarMode::ReadWrite),
    (ChannelVar::VetoStretch, "VetoStretch", VarMode::ReadWrite),
    (ChannelVar::Xavg, "Xavg", VarMode::ReadWrite),
    (ChannelVar::Xwait, "Xwait", VarMode::ReadWrite),
    (ChannelVar::LiveTimeA, "LiveTimeA", VarMode::ReadOnly),
    (ChannelVar::LiveTimeB, "LiveTimeB", VarMode::ReadOnly),
    (ChannelVar::FastPeaksA, "FastPeaksA", VarMode::ReadOnly),
    (ChannelVar::FastPeaksB, "FastPeaksB", VarMode::ReadOnly),
];

/// A variable descriptor: where the variable lives and how it may be used.
#[derive(Debug, Clone)]
pub struct VarDescriptor<V> {
    pub var: V,
    pub name: &'static str,
    pub address: Address,
    /// Number of cells (per channel, for channel variables).
    pub size: usize,
    pub mode: VarMode,
}

impl<V> VarDescriptor<V> {
    pub fn writable(&self) -> bool {
        self.mode == VarMode::ReadWrite
    }
}

/// Build the module variable descriptors with their DSP addresses.
pub fn module_var_descriptors() -> Vec<VarDescriptor<ModuleVar>> {
    let mut address = dpm_hw::regs::DSP_VAR_BASE;
    MODULE_VAR_DEFS
        .iter()
        .map(|&(var, name, size, mode)| {
            let desc = VarDescriptor { var, name, address, size, mode };
            address += size as Address;
            desc
        })
        .collect()
}

/// Build the channel variable descriptors. Each descriptor's address is the
/// base of its block; the cell for channel `c` is `address + c`.
pub fn channel_var_descriptors() -> Vec<VarDescriptor<ChannelVar>> {
    let mut address = channel_var_base();
    CHANNEL_VAR_DEFS
        .iter()
        .map(|&(var, name, mode)| {
            let desc = VarDescriptor { var, name, address, size: 1, mode };
            address += MAX_CHANNELS as Address;
            desc
        })
        .collect()
}

/// First DSP address past the module variable block.
pub fn channel_var_base() -> Address {
    let words: usize = MODULE_VAR_DEFS.iter().map(|d| d.2).sum();
    dpm_hw::regs::DSP_VAR_BASE + words as Address
}

/// DSP address of a module variable cell.
pub fn module_var_address(var: ModuleVar, offset: usize) -> Address {
    let mut address = dpm_hw::regs::DSP_VAR_BASE;
    for &(v, _, size, _) in MODULE_VAR_DEFS {
        if v == var {
            return address + offset as Address;
        }
        address += size as Address;
    }
    unreachable!("module variable table is total")
}

/// DSP address of a channel variable cell.
pub fn channel_var_address(var: ChannelVar, channel: usize) -> Address {
    channel_var_base() + (var as usize * MAX_CHANNELS + channel) as Address
}

/// Look up a module variable by DSP name.
pub fn lookup_module_var(name: &str) -> Option<ModuleVar> {
    MODULE_VAR_DEFS
        .iter()
        .find(|&&(_, n, _, _)| n == name)
        .map(|&(v, _, _, _)| v)
}

/// Look up a channel variable by DSP name.
pub fn lookup_channel_var(name: &str) -> Option<ChannelVar> {
    CHANNEL_VAR_DEFS
        .iter()
        .find(|&&(_, n, _)| n == name)
        .map(|&(v, _, _)| v)
}

pub fn is_module_var(name: &str) -> bool {
    lookup_module_var(name).is_some()
}

pub fn is_channel_var(name: &str) -> bool {
    lookup_channel_var(name).is_some()
}

/// One cached cell: last known value plus whether it still needs to be
/// flushed to the DSP.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cell {
    pub value: Value,
    pub dirty: bool,
}

/// Host-side cache of one variable.
#[derive(Debug, Clone)]
pub struct VarSlot {
    pub cells: Vec<Cell>,
}

impl VarSlot {
    pub fn new(size: usize) -> Self {
        Self { cells: vec![Cell::default(); size] }
    }

    pub fn erase(&mut self) {
        for cell in &mut self.cells {
            *cell = Cell::default();
        }
    }
}

/// Named, unit-converted views over module variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleParam {
    ModuleCsrb,
    SlowFilterRange,
    FastFilterRange,
    ModuleId,
    ModuleNumber,
    CrateId,
    SynchWait,
    InSynch,
}

/// Named, unit-converted views over channel variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelParam {
    /// Analog offset voltage in volts, mapped onto OffsetDAC.
    Voffset,
    /// Baseline target as a percent of ADC full scale.
    BaselinePercent,
    /// Fast trigger threshold in ADC counts.
    TriggerThreshold,
    /// Fast filter rise time in microseconds.
    TriggerRisetime,
    /// Slow filter rise time in microseconds.
    EnergyRisetime,
}

const MODULE_PARAM_NAMES: &[(ModuleParam, &str)] = &[
    (ModuleParam::ModuleCsrb, "MODULE_CSRB"),
    (ModuleParam::SlowFilterRange, "SLOW_FILTER_RANGE"),
    (ModuleParam::FastFilterRange, "FAST_FILTER_RANGE"),
    (ModuleParam::ModuleId, "MODULE_ID"),
    (ModuleParam::ModuleNumber, "MODULE_NUMBER"),
    (ModuleParam::CrateId, "CRATE_ID"),
    (ModuleParam::SynchWait, "SYNCH_WAIT"),
    (ModuleParam::InSynch, "IN_SYNCH"),
];

const CHANNEL_PARAM_NAMES: &[(ChannelParam, &str)] = &[
    (ChannelParam::Voffset, "VOFFSET"),
    (ChannelParam::BaselinePercent, "BASELINE_PERCENT"),
    (ChannelParam::TriggerThreshold, "TRIGGER_THRESHOLD"),
    (ChannelParam::TriggerRisetime, "TRIGGER_RISETIME"),
    (ChannelParam::EnergyRisetime, "ENERGY_RISETIME"),
];

pub fn lookup_module_param(name: &str) -> Option<ModuleParam> {
    MODULE_PARAM_NAMES.iter().find(|&&(_, n)| n == name).map(|&(p, _)| p)
}

pub fn lookup_channel_param(name: &str) -> Option<ChannelParam> {
    CHANNEL_PARAM_NAMES.iter().find(|&&(_, n)| n == name).map(|&(p, _)| p)
}

pub fn is_module_param(name: &str) -> bool {
    lookup_module_param(name).is_some()
}

pub fn is_channel_param(name: &str) -> bool {
    lookup_channel_param(name).is_some()
}

/// The offset DAC spans ±1.5 V over its 16-bit range, inverted: DAC 0 sits
/// at +1.5 V and DAC 0xffff at −1.5 V.
pub const VOFFSET_RANGE_V: f64 = 1.5;

/// Convert an offset voltage to a DAC setting.
///
/// # Errors
///
/// Returns `InvalidValue` when the voltage is outside ±[`VOFFSET_RANGE_V`].
pub fn voffset_to_dac(volts: f64) -> Result<Value> {
    if !(-VOFFSET_RANGE_V..=VOFFSET_RANGE_V).contains(&volts) {
        return Err(Error::invalid_value(format!(
            "offset voltage out of range: {volts} V"
        )));
    }
    let frac = (VOFFSET_RANGE_V - volts) / (2.0 * VOFFSET_RANGE_V);
    Ok((frac * f64::from(u16::MAX)).round() as Value)
}

/// Convert a DAC setting back to an offset voltage.
pub fn dac_to_voffset(dac: Value) -> f64 {
    let frac = f64::from(dac.min(u32::from(u16::MAX))) / f64::from(u16::MAX);
    VOFFSET_RANGE_V - frac * 2.0 * VOFFSET_RANGE_V
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_addresses_are_ordered_and_disjoint() {
        let descs = module_var_descriptors();
        for pair in descs.windows(2) {
            assert!(pair[0].address + pair[0].size as Address <= pair[1].address);
        }
        let chan = channel_var_descriptors();
        assert_eq!(chan[0].address, channel_var_base());
        for pair in chan.windows(2) {
            assert_eq!(pair[0].address + MAX_CHANNELS as Address, pair[1].address);
        }
    }

    #[test]
    fn name_lookup() {
        assert_eq!(lookup_module_var("ModCSRB"), Some(ModuleVar::ModCsrB));
        assert_eq!(lookup_channel_var("OffsetDAC"), Some(ChannelVar::OffsetDac));
        assert!(lookup_module_var("NoSuchVar").is_none());
        assert!(is_channel_param("VOFFSET"));
        assert!(!is_module_var("VOFFSET"));
    }

    #[test]
    fn var_addresses_match_descriptors() {
        let descs = module_var_descriptors();
        for desc in &descs {
            assert_eq!(module_var_address(desc.var, 0), desc.address);
        }
        let chan = channel_var_descriptors();
        for desc in &chan {
            assert_eq!(channel_var_address(desc.var, 0), desc.address);
            assert_eq!(channel_var_address(desc.var, 3), desc.address + 3);
        }
    }

    #[test]
    fn voffset_mapping_rails() {
        assert_eq!(voffset_to_dac(VOFFSET_RANGE_V).unwrap(), 0);
        assert_eq!(voffset_to_dac(-VOFFSET_RANGE_V).unwrap(), 65535);
        let mid = voffset_to_dac(0.0).unwrap();
        assert!((32767..=32768).contains(&mid));
        assert!(voffset_to_dac(2.0).is_err());
        assert!((dac_to_voffset(0) - VOFFSET_RANGE_V).abs() < 1e-9);
    }
}
