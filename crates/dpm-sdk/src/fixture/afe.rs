//! AFE daughter-board calibration.
//!
//! Covers the two boot-time procedures for modules whose channels sit on
//! offset-DAC daughter boards:
//!
//! - ADC polarity swap detection. The PCB clocks channel pairs on opposite
//!   edges; the detection drives known offsets, watches which baselines
//!   move, sets the per-pair compensation bit in the board's ADCCTRL word,
//!   and verifies the result.
//! - The offset-DAC feedback loop, which walks each channel's baseline to
//!   its configured target using live traces and a per-channel linear fit.

use dpm_hw::{regs, AdcTrace, Word, MAX_ADC_TRACE_LENGTH};

use crate::bus::{self, BusPort};
use crate::error::{Error, Result};
use crate::module::{control_run, ModuleCore};
use crate::param::{self, ChannelVar, ModuleVar, Value};
use crate::run::ControlTask;

/// Maximum daughter boards per module.
pub const MAX_DBS: usize = 4;

/// The DB04 DAC output filter has an RC 1/e settling time of 47 ms; wait
/// this long after programming before trusting a trace.
pub const DB04_DAC_SETTLE_TIME_MS: u64 = 250;

/// Clocking out the 32-bit DAC command over SPI takes about 4 ms.
const DAC_SPI_WAIT_USECS: u64 = 6_000;

/// Baseline bins averaged either side of the histogram peak.
const NOISE_BINS: usize = 30;

/// Default noise tolerance for baseline comparison, percent of full scale.
const NOISE_PERCENT: f64 = 0.5;

/// DAC step used while the linear fit still has fewer than two samples.
const DAC_SLOPE_LEARN_STEPS: i64 = 200;

/// Samples required before the fit replaces step learning.
const LINEAR_FIT_SAMPLES: usize = 2;

/// Offset adjustment iteration cap.
const ADJUST_RUNS: usize = 10;

/// Baseline estimate for one channel's trace.
///
/// Bins every sample, finds the fullest bin, and takes the weighted mean of
/// the bins within [`NOISE_BINS`] either side. Robust against thermal noise
/// and isolated spikes.
#[derive(Debug, Clone)]
pub struct ChannelBaseline {
    pub channel: usize,
    pub adc_bits: u32,
    noise_percent: f64,
    runs: usize,
    pub baseline: i64,
    bins: Vec<u32>,
}

impl ChannelBaseline {
    pub fn new(channel: usize, adc_bits: u32) -> Self {
        Self {
            channel,
            adc_bits,
            noise_percent: NOISE_PERCENT.clamp(0.0, 100.0),
            runs: 0,
            baseline: -1,
            bins: vec![0; 1 << adc_bits],
        }
    }

    /// Bin one trace.
    pub fn update(&mut self, trace: &AdcTrace) {
        self.runs += 1;
        let top = self.bins.len() - 1;
        for &sample in trace {
            self.bins[(sample as usize).min(top)] += 1;
        }
    }

    /// Collapse the bins into the baseline estimate.
    pub fn end(&mut self) {
        let max_bin = self
            .bins
            .iter()
            .enumerate()
            .max_by_key(|&(_, count)| count)
            .map_or(0, |(bin, _)| bin);
        let from = max_bin.saturating_sub(NOISE_BINS);
        let to = (max_bin + NOISE_BINS).min(self.bins.len());
        let mut sum: u64 = 0;
        let mut samples: u64 = 0;
        for (bin, &count) in self.bins.iter().enumerate().take(to).skip(from) {
            sum += bin as u64 * u64::from(count);
            samples += u64::from(count);
        }
        self.baseline = if samples == 0 { -1 } else { (sum / samples) as i64 };
    }

    /// Noise-tolerant equality against a target value: equal when within
    /// `noise_percent` of full scale.
    pub fn matches(&self, value: i64) -> bool {
        let mut range = 1;
        if self.noise_percent > 0.0 {
            range = ((1u64 << self.adc_bits) as f64 * (self.noise_percent / 100.0)) as i64;
        }
        self.baseline >= value - range && self.baseline <= value + range
    }

    /// Noise-tolerant equality against another estimate.
    pub fn matches_baseline(&self, other: &ChannelBaseline) -> bool {
        self.matches(other.baseline)
    }
}

/// Incremental least-squares fit, `y = kx + c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearFit {
    k: f64,
    c: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xy: f64,
    sum_x_sq: f64,
    pub count: usize,
}

impl LinearFit {
    pub fn update(&mut self, x: f64, y: f64) {
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xy += x * y;
        self.sum_x_sq += x * x;
        self.count += 1;
    }

    pub fn calc(&mut self) {
        let n = self.count as f64;
        let divisor = self.sum_x * self.sum_x - n * self.sum_x_sq;
        self.k = (self.sum_x * self.sum_y - n * self.sum_xy) / divisor;
        self.c = (self.sum_x * self.sum_xy - self.sum_y * self.sum_x_sq) / divisor;
    }

    pub fn y(&self, x: f64) -> f64 {
        self.k * x + self.c
    }
}

/// Scoped save of the DSP UserIn[0..1] cells.
///
/// The trace acquisition borrows the two cells to pass the daughter-board
/// index and channel offset to the DSP; the guard restores the saved values
/// on every exit path.
pub(crate) struct UserInGuard<'a> {
    bus: &'a BusPort,
    address: u32,
    saved: [Word; 2],
}

impl<'a> UserInGuard<'a> {
    pub fn new(bus: &'a BusPort) -> Result<Self> {
        let address = param::module_var_address(ModuleVar::UserIn, 0);
        let saved = [bus::dsp_read(bus, address)?, bus::dsp_read(bus, address + 1)?];
        Ok(Self { bus, address, saved })
    }

    pub fn set(&self, db_index: Word, db_channel: Word) -> Result<()> {
        bus::dsp_write(self.bus, self.address, db_index)?;
        bus::dsp_write(self.bus, self.address + 1, db_channel)
    }
}

impl Drop for UserInGuard<'_> {
    fn drop(&mut self) {
        for (i, &word) in self.saved.iter().enumerate() {
            if let Err(e) = bus::dsp_write(self.bus, self.address + i as u32, word) {
                tracing::error!("afe: UserIn restore failed: {e}");
            }
        }
    }
}

/// Capture one channel's ADC trace through the get-traces control task.
///
/// Stores the daughter-board index and channel offset in UserIn, runs the
/// task, then unpacks half-trace-length packed words from the DSP I/O
/// buffer, low half first. The trace lands in the channel's `adc_trace`.
pub(crate) fn acquire_adc(core: &mut ModuleCore, bus: &BusPort, channel: usize) -> Result<()> {
    let (db_index, db_channel) = match core.channels[channel].fixture.db() {
        Some(db) => (db.number as Word, db.offset as Word),
        None => (0, channel as Word),
    };

    {
        let userins = UserInGuard::new(bus)?;
        userins.set(db_index, db_channel)?;
        control_run(core, bus, ControlTask::GetTraces)?;
    }

    let size = core.channels[channel]
        .config
        .max_adc_trace_length
        .min(MAX_ADC_TRACE_LENGTH);
    let mut packed = vec![0u32; size / 2];
    bus.dma_read(regs::DSP_MEM + regs::DSP_IO_BUFFER, &mut packed)?;

    let trace = &mut core.channels[channel].adc_trace;
    trace.resize(size, 0);
    for (w, &word) in packed.iter().enumerate() {
        trace[w * 2] = (word & 0xffff) as u16;
        trace[w * 2 + 1] = ((word >> 16) & 0xffff) as u16;
    }
    Ok(())
}

/// Capture traces and estimate every channel's baseline.
pub(crate) fn analyze_channel_baselines(
    core: &mut ModuleCore,
    bus: &BusPort,
    traces: usize,
) -> Result<Vec<ChannelBaseline>> {
    let mut baselines: Vec<ChannelBaseline> = core
        .channels
        .iter()
        .map(|c| ChannelBaseline::new(c.number, c.config.adc_bits))
        .collect();
    for _ in 0..traces.max(1) {
        for chan in 0..core.num_channels {
            acquire_adc(core, bus, chan)?;
            baselines[chan].update(&core.channels[chan].adc_trace);
        }
    }
    for bl in &mut baselines {
        bl.end();
        tracing::debug!(
            "{}: afe: analyze-baselines: channel={} baseline={} traces={}",
            core.label(),
            bl.channel,
            bl.baseline,
            bl.runs
        );
    }
    Ok(baselines)
}

/// Longest DAC settle period across the module's channels.
fn wait_dac_settle_period(core: &ModuleCore) {
    let period_ms = core
        .channels
        .iter()
        .map(|c| c.fixture.dac_settle_period_ms())
        .max()
        .unwrap_or(0);
    tracing::debug!("{}: afe: dac-settle-wait: period={period_ms} msecs", core.label());
    if period_ms > 0 {
        dpm_hw::wait_usecs(period_ms * 1000);
    }
}

/// Program one DB04 offset DAC.
///
/// The command word is `(addr << 24) | (ctrl << 16) | value`. Address bit 1
/// selects the DAC serving the lower four channels; the control nibble maps
/// the channel offset onto the DAC output letter, compensating the PCB ADC
/// swap layout:
///
/// ```text
/// offset 0,4 -> B(1)   1,5 -> C(2)   2,6 -> A(0)   3,7 -> D(3)
/// ```
pub(crate) fn db04_set_dac(bus: &BusPort, db: &super::Db, value: Value) -> Result<()> {
    if value > 65_535 {
        return Err(Error::invalid_value(format!(
            "invalid DAC offset: db={} offset={} value={value}",
            db.number, db.offset
        )));
    }

    bus.write_word(regs::CFG_PORT, db.number as Word + 1)?;

    let dac_addr: Word = 0x20 | (u32::from(db.offset < 4) << 1);
    let dac_ctrl: Word = 0x30
        + match db.offset {
            0 | 4 => 1,
            1 | 5 => 2,
            2 | 6 => 0,
            3 | 7 => 3,
            _ => 0,
        };
    let dac = (dac_addr << 24) | (dac_ctrl << 16) | value;
    tracing::debug!(
        "fixture: db04: db={} db_channel={} dac_addr={dac_addr:#x} dac_ctrl={dac_ctrl:#x} \
         dac_value={value:#x} write={dac:#x}",
        db.number,
        db.offset
    );
    bus.write_word(regs::CFG_DAC, dac)?;
    dpm_hw::wait_usecs(DAC_SPI_WAIT_USECS);
    Ok(())
}

/// Set the offset voltage on every `step`-th channel and program the DACs.
fn set_channel_voffset(
    afe: &AfeDbs,
    core: &mut ModuleCore,
    bus: &BusPort,
    voffset: f64,
    step: usize,
) -> Result<()> {
    for chan in (0..core.num_channels).step_by(step.max(1)) {
        core.channels[chan].voffset(voffset)?;
    }
    afe.set_dacs(core, bus)?;
    wait_dac_settle_period(core);
    Ok(())
}

/// Module fixture state for daughter-board AFE modules.
#[derive(Debug, Default)]
pub struct AfeDbs {
    /// ADCCTRL shadow per daughter board.
    adcctrl: [Word; MAX_DBS],
}

impl AfeDbs {
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal FPGA reload clears the hardware ADCCTRL words.
    pub fn fippi_loaded(&mut self) {
        self.adcctrl = [0; MAX_DBS];
    }

    /// Program every channel's offset DAC from its cached OffsetDAC value.
    pub fn set_dacs(&self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        for channel in &core.channels {
            channel.fixture.set_dac(bus, channel.var(ChannelVar::OffsetDac))?;
        }
        Ok(())
    }

    /// ADC polarity swap detection and verification.
    ///
    /// Drives all channels to the low rail, moves the even channels to the
    /// high rail, and flags every channel whose observed baseline motion
    /// inverts the expectation. Flagged channels get their pair's ADCCTRL
    /// compensation bit; a verification pass must then see every channel
    /// behave, or boot fails.
    pub fn boot(&mut self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        tracing::debug!("{}: fixture: afe-dbs: boot", core.label());

        set_channel_voffset(self, core, bus, -1.5, 1)?;
        let bl_same = analyze_channel_baselines(core, bus, 1)?;

        set_channel_voffset(self, core, bus, 1.5, 2)?;
        let bl_moved = analyze_channel_baselines(core, bus, 1)?;

        for chan in 0..core.num_channels {
            let swapped = if chan % 2 == 0 {
                bl_same[chan].matches_baseline(&bl_moved[chan])
            } else {
                !bl_same[chan].matches_baseline(&bl_moved[chan])
            };
            core.channels[chan].fixture.set_adc_swap(swapped);
            if !swapped {
                continue;
            }
            let Some(db) = core.channels[chan].fixture.db().cloned() else {
                continue;
            };
            if db.number >= MAX_DBS {
                return Err(Error::initialize_failure(
                    core.number,
                    core.slot,
                    format!("invalid DB number for channel: {chan}"),
                ));
            }
            let last = self.adcctrl[db.number];
            self.adcctrl[db.number] |= 1 << (db.offset / 2);
            tracing::debug!(
                "{}: afe-dbs: boot: adc_swap: db={} offset={} adcctrl={:#x}",
                core.label(),
                db.number,
                db.offset,
                self.adcctrl[db.number]
            );
            if self.adcctrl[db.number] != last {
                super::write_db_register(bus, db.number, regs::ADCCTRL, self.adcctrl[db.number])?;
            }
        }

        // Verification pass under the same offsets.
        let bl_verify = analyze_channel_baselines(core, bus, 1)?;
        let mut failed = Vec::new();
        for chan in 0..core.num_channels {
            let bad = if chan % 2 == 0 {
                bl_same[chan].matches_baseline(&bl_verify[chan])
            } else {
                !bl_same[chan].matches_baseline(&bl_verify[chan])
            };
            if bad {
                tracing::error!("{}: afe-dbs: boot: ADC swap failed: {chan}", core.label());
                failed.push(chan);
            }
        }

        set_channel_voffset(self, core, bus, 0.0, 1)?;

        if let Some(&chan) = failed.first() {
            return Err(Error::initialize_failure(
                core.number,
                core.slot,
                format!("DB AFE ADC swap failure: channel {chan}"),
            ));
        }
        Ok(())
    }

    /// The offset-DAC feedback loop.
    ///
    /// Each iteration captures one trace per channel and, for every channel
    /// whose baseline misses its target, records (baseline, DAC) into the
    /// channel's linear fit and programs a new DAC: step learning until two
    /// samples exist, the fit's prediction afterwards. Stops when an
    /// iteration makes no update or the cap is reached; the final codes are
    /// written back to the OffsetDAC variables.
    pub fn adjust_offsets(&self, core: &mut ModuleCore, bus: &BusPort) -> Result<()> {
        tracing::debug!("{}: fixture: afe-dbs: adjust-offsets", core.label());

        set_channel_voffset(self, core, bus, 0.0, 1)?;

        let bl_percents: Vec<f64> =
            core.channels.iter().map(crate::channel::Channel::baseline_percent).collect();
        let mut offsetdacs: Vec<i64> = core
            .channels
            .iter()
            .map(|c| i64::from(c.var(ChannelVar::OffsetDac)))
            .collect();
        let has_offset_dacs: Vec<bool> =
            core.channels.iter().map(|c| c.fixture.has_offset_dac()).collect();

        let mut fits = vec![LinearFit::default(); core.num_channels];

        let mut run_again = true;
        let mut run = 0;
        while run_again && run < ADJUST_RUNS {
            tracing::debug!("{}: afe-dbs: adjust-offsets: run={run}", core.label());
            run_again = false;
            let baselines = analyze_channel_baselines(core, bus, 1)?;
            for chan in 0..core.num_channels {
                if !has_offset_dacs[chan] {
                    continue;
                }
                let bl = &baselines[chan];
                let adc_target =
                    ((1u64 << bl.adc_bits) as f64 * (bl_percents[chan] / 100.0)) as i64;
                let mut dac = offsetdacs[chan];
                // The compare carries the baseline noise margin.
                if bl.matches(adc_target) {
                    continue;
                }
                let fit = &mut fits[chan];
                fit.update(bl.baseline as f64, dac as f64);
                if fit.count < LINEAR_FIT_SAMPLES {
                    if adc_target > bl.baseline {
                        dac -= DAC_SLOPE_LEARN_STEPS;
                    } else {
                        dac += DAC_SLOPE_LEARN_STEPS;
                    }
                } else {
                    fit.calc();
                    dac = fit.y(adc_target as f64).round() as i64;
                }
                dac = dac.clamp(0, 65_535);
                tracing::debug!(
                    "{}: afe-dbs: adjust-offsets: channel={chan} adc-target={adc_target} \
                     bl={} adc-error={} dac={dac}",
                    core.label(),
                    bl.baseline,
                    adc_target - bl.baseline
                );
                offsetdacs[chan] = dac;
                core.channels[chan].fixture.set_dac(bus, dac as Value)?;
                run_again = true;
            }
            if run_again {
                wait_dac_settle_period(core);
            }
            run += 1;
        }

        for chan in 0..core.num_channels {
            core.write_channel_var(bus, ChannelVar::OffsetDac, offsetdacs[chan] as Value, chan, true)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace_of(baseline: u16, len: usize) -> AdcTrace {
        (0..len)
            .map(|i| match i % 4 {
                1 => baseline + 1,
                3 => baseline.saturating_sub(1),
                _ => baseline,
            })
            .collect()
    }

    #[test]
    fn baseline_finds_modal_value() {
        let mut bl = ChannelBaseline::new(0, 14);
        bl.update(&trace_of(8191, 8192));
        bl.end();
        assert_eq!(bl.baseline, 8191);
    }

    #[test]
    fn baseline_ignores_isolated_spikes() {
        let mut bl = ChannelBaseline::new(0, 14);
        let mut trace = trace_of(1000, 8192);
        trace[100] = 16000;
        trace[4000] = 0;
        bl.update(&trace);
        bl.end();
        assert!((999..=1001).contains(&bl.baseline), "baseline={}", bl.baseline);
    }

    #[test]
    fn noise_tolerant_compare() {
        let mut bl = ChannelBaseline::new(0, 14);
        bl.update(&trace_of(1638, 8192));
        bl.end();
        // 0.5% of 16384 is 81 counts.
        assert!(bl.matches(1638));
        assert!(bl.matches(1638 + 81));
        assert!(!bl.matches(1638 + 83));
        assert!(!bl.matches(0));
    }

    #[test]
    fn baseline_compare_is_symmetric() {
        let mut a = ChannelBaseline::new(0, 14);
        a.update(&trace_of(5000, 4096));
        a.end();
        let mut b = ChannelBaseline::new(1, 14);
        b.update(&trace_of(5040, 4096));
        b.end();
        assert!(a.matches_baseline(&b));
        assert!(b.matches_baseline(&a));
        let mut c = ChannelBaseline::new(2, 14);
        c.update(&trace_of(9000, 4096));
        c.end();
        assert!(!a.matches_baseline(&c));
        assert!(!c.matches_baseline(&a));
    }

    #[test]
    fn linear_fit_recovers_exact_line() {
        // dac = -4 * baseline + 65535, the sim transfer function.
        let mut fit = LinearFit::default();
        fit.update(8191.0, 32771.0);
        fit.update(8141.0, 32971.0);
        fit.calc();
        let dac = fit.y(1638.0).round() as i64;
        assert_eq!(dac, 58983);
    }

    #[test]
    fn dac_command_word_layout() {
        // offset 2 lives on DAC output A (ctrl 0x30), lower-group address.
        let db = super::super::Db { number: 1, base: 8, offset: 2, adc_state: Default::default() };
        let dac_addr: Word = 0x20 | (u32::from(db.offset < 4) << 1);
        let dac_ctrl: Word = 0x30;
        let word = (dac_addr << 24) | (dac_ctrl << 16) | 0x1234;
        assert_eq!(word, 0x2230_1234);
    }
}
