//! Simulation backend.
//!
//! Emulates a module's register window, DSP memory, analog front end, and
//! list-mode FIFO well enough to exercise every SDK path without hardware:
//! boot, variable sync, the ADC swap detection, the offset-DAC feedback
//! loop, and the FIFO pump.
//!
//! Modules are described by a process-wide definitions registry loaded once
//! from a text file (or string) before `Crate::initialize`. Each definition
//! is one line of comma-separated `key=value` fields:
//!
//! ```text
//! device-number=0,slot=2,revision=17,eeprom-format=2,serial-num=250,
//! num-channels=16,adc-bits=14,adc-msps=250,adc-clk-div=2
//! ```
//!
//! The analog model is an inverted linear DAC→baseline map with a small
//! deterministic ripple. Channel pairs can be marked as swap-wired to stand
//! in for the PCB layout the swap detection exists to fix; the ADCCTRL
//! compensation bit rewires them, except for channels marked stuck.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use dpm_hw::{
    regs, Address, ChannelConfig, DbKind, RevTag, Word, MAX_ADC_TRACE_LENGTH, MAX_CHANNELS,
    MAX_DMA_BLOCK_SIZE,
};

use crate::bus::{BusDriver, DeviceInfo};
use crate::error::{Error, Result};
use crate::param::{self, ChannelVar, ModuleVar};
use crate::run::{ControlTask, RunTask};

/// One simulated module definition.
#[derive(Debug, Clone, Default)]
pub struct ModuleDef {
    pub device_number: usize,
    pub slot: usize,
    pub revision: i32,
    pub crate_revision: i32,
    pub eeprom_format: i32,
    pub serial: u32,
    pub num_channels: usize,
    pub adc_bits: u32,
    pub adc_msps: u32,
    pub adc_clk_div: u32,
    /// Fixture override; derived from the revision when absent.
    pub fixture: Option<DbKind>,
    /// Optional var-defaults file seeded into DSP memory at open.
    pub var_defaults: Option<String>,
    pub pci_bus: i32,
    pub pci_slot: i32,
}

impl ModuleDef {
    fn db_kind(&self) -> DbKind {
        self.fixture.unwrap_or(match RevTag::from_raw(self.revision) {
            Some(RevTag::RevH) => DbKind::Db04,
            _ => DbKind::Mainboard,
        })
    }
}

static MOD_DEFS: RwLock<Vec<ModuleDef>> = RwLock::new(Vec::new());
static STATES: Mutex<Vec<(usize, Arc<SimState>)>> = Mutex::new(Vec::new());

/// Load module definitions from a file, replacing any existing registry.
///
/// # Errors
///
/// `FileRead` when the file cannot be opened; `InvalidValue` on a malformed
/// definition line.
pub fn load_module_defs(path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
        path: path.into(),
        reason: e.to_string(),
    })?;
    load_module_defs_str(&text)?;
    tracing::info!("sim: module defs: {} from {path}", MOD_DEFS.read().len());
    Ok(())
}

/// Load module definitions from a string, replacing any existing registry.
pub fn load_module_defs_str(text: &str) -> Result<()> {
    let mut defs = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if !line.is_empty() {
            defs.push(parse_module_def(line)?);
        }
    }
    let mut registry = MOD_DEFS.write();
    if !registry.is_empty() {
        tracing::warn!("sim: replacing {} module defs", registry.len());
    }
    *registry = defs;
    Ok(())
}

/// Append one definition line to the registry.
pub fn add_module_def(desc: &str) -> Result<()> {
    let def = parse_module_def(desc)?;
    tracing::info!("sim: module def: add: {desc}");
    MOD_DEFS.write().push(def);
    Ok(())
}

/// Drop every definition and every retained device state.
pub fn clear_module_defs() {
    MOD_DEFS.write().clear();
    STATES.lock().clear();
}

/// True once definitions have been loaded.
pub fn module_defs_loaded() -> bool {
    !MOD_DEFS.read().is_empty()
}

/// The retained state of an opened simulated device, for tests that need to
/// look behind the register window.
pub fn state(device_number: usize) -> Option<Arc<SimState>> {
    STATES
        .lock()
        .iter()
        .rev()
        .find(|(n, _)| *n == device_number)
        .map(|(_, s)| Arc::clone(s))
}

fn parse_module_def(desc: &str) -> Result<ModuleDef> {
    let mut def = ModuleDef {
        adc_clk_div: 1,
        pci_bus: 0,
        pci_slot: -1,
        ..Default::default()
    };
    for field in desc.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let (key, value) = field
            .split_once('=')
            .ok_or_else(|| Error::invalid_value(format!("invalid module definition: {field}")))?;
        let parse = |v: &str| -> Result<u32> {
            v.trim()
                .parse()
                .map_err(|_| Error::invalid_value(format!("invalid module definition: bad value: {v}")))
        };
        match key.trim() {
            "device-number" => def.device_number = parse(value)? as usize,
            "slot" => def.slot = parse(value)? as usize,
            "revision" => def.revision = parse(value)? as i32,
            "crate-revision" => def.crate_revision = parse(value)? as i32,
            "eeprom-format" => def.eeprom_format = parse(value)? as i32,
            "serial-num" => def.serial = parse(value)?,
            "num-channels" => def.num_channels = parse(value)? as usize,
            "adc-bits" => def.adc_bits = parse(value)?,
            "adc-msps" => def.adc_msps = parse(value)?,
            "adc-clk-div" => def.adc_clk_div = parse(value)?.max(1),
            "fixture" => def.fixture = DbKind::from_label(value.trim()),
            "var-defaults" => def.var_defaults = Some(value.trim().to_string()),
            "pci-bus" => def.pci_bus = parse(value)? as i32,
            "pci-slot" => def.pci_slot = parse(value)? as i32,
            other => {
                return Err(Error::invalid_value(format!(
                    "invalid module definition: {other}"
                )))
            }
        }
    }
    if def.num_channels > MAX_CHANNELS {
        return Err(Error::invalid_value(format!(
            "invalid module definition: {} channels",
            def.num_channels
        )));
    }
    Ok(def)
}

/// One channel of the analog model.
#[derive(Debug, Clone, Default)]
struct AfeChannel {
    /// Applied offset-DAC code.
    dac: Word,
    /// The PCB routes this channel's ADC pair on the wrong clock edge.
    swapped_wiring: bool,
    /// The ADCCTRL compensation bit has no effect on this channel.
    stuck: bool,
}

#[derive(Debug)]
struct SimInner {
    regs: HashMap<usize, Word>,
    dsp_ptr: Address,
    fippi_ptr: Address,
    dsp: HashMap<Address, Word>,
    fippi: HashMap<Address, Word>,
    io_buffer: Vec<Word>,
    fifo: VecDeque<Word>,
    histograms: Vec<Vec<Word>>,
    afe: Vec<AfeChannel>,
    run_active: bool,
    comms_done: bool,
    fippi_done: bool,
    dsp_running: bool,
}

/// Shared state of one simulated device. Held by the [`SimBus`] driver and
/// retained in a process-wide table so tests can inspect and drive it.
#[derive(Debug)]
pub struct SimState {
    def: ModuleDef,
    inner: Mutex<SimInner>,
}

impl SimState {
    fn new(def: ModuleDef) -> Self {
        let channels = def.num_channels;
        let histogram_len = if def.db_kind() == DbKind::Mainboard {
            dpm_hw::LARGE_HISTOGRAM_LENGTH
        } else {
            dpm_hw::SMALL_HISTOGRAM_LENGTH
        };
        Self {
            def,
            inner: Mutex::new(SimInner {
                regs: HashMap::new(),
                dsp_ptr: 0,
                fippi_ptr: 0,
                dsp: HashMap::new(),
                fippi: HashMap::new(),
                io_buffer: vec![0; MAX_ADC_TRACE_LENGTH / 2],
                fifo: VecDeque::new(),
                histograms: vec![vec![0; histogram_len]; channels],
                afe: vec![AfeChannel::default(); channels],
                run_active: false,
                comms_done: false,
                fippi_done: false,
                dsp_running: false,
            }),
        }
    }

    /// Feed words into the simulated list-mode FIFO.
    pub fn push_fifo(&self, words: &[Word]) {
        let mut inner = self.inner.lock();
        inner.fifo.extend(words.iter().copied());
        let len = inner.fifo.len();
        if len > dpm_hw::FIFO_SIZE_WORDS {
            inner.fifo.drain(..len - dpm_hw::FIFO_SIZE_WORDS);
            tracing::warn!("sim: device {}: FIFO overrun", self.def.device_number);
        }
    }

    /// Words currently waiting in the simulated FIFO.
    pub fn fifo_level(&self) -> usize {
        self.inner.lock().fifo.len()
    }

    /// Mark a channel pair as wired on the wrong clock edge.
    pub fn set_swapped_wiring(&self, channel: usize, swapped: bool) {
        let mut inner = self.inner.lock();
        if let Some(afe) = inner.afe.get_mut(channel) {
            afe.swapped_wiring = swapped;
        }
    }

    /// Make the compensation bit ineffective for a channel, so the swap
    /// verification pass fails.
    pub fn set_stuck_swap(&self, channel: usize, stuck: bool) {
        let mut inner = self.inner.lock();
        if let Some(afe) = inner.afe.get_mut(channel) {
            afe.stuck = stuck;
        }
    }

    /// The applied offset-DAC code of a channel.
    pub fn dac(&self, channel: usize) -> Word {
        self.inner.lock().afe.get(channel).map_or(0, |a| a.dac)
    }

    /// Whether a list-mode or histogram run is active.
    pub fn run_active(&self) -> bool {
        self.inner.lock().run_active
    }

    /// The ADCCTRL compensation word applied to a daughter board.
    pub fn adcctrl(&self, db: usize) -> Word {
        self.inner
            .lock()
            .fippi
            .get(&regs::db_addr(db, regs::ADCCTRL))
            .copied()
            .unwrap_or(0)
    }

    fn channels_per_db(&self) -> usize {
        self.def.db_kind().channels_per_db()
    }

    /// The channel whose analog signal actually lands on `channel`'s ADC,
    /// given the wiring and the applied ADCCTRL compensation.
    fn source_channel(&self, inner: &SimInner, channel: usize) -> usize {
        let cpd = self.channels_per_db();
        if cpd == 0 {
            return channel;
        }
        let afe = &inner.afe[channel];
        let db = channel / cpd;
        let offset = channel % cpd;
        let adcctrl = inner
            .fippi
            .get(&regs::db_addr(db, regs::ADCCTRL))
            .copied()
            .unwrap_or(0);
        let compensated = !afe.stuck && adcctrl & (1 << (offset / 2)) != 0;
        if afe.swapped_wiring != compensated {
            channel ^ 1
        } else {
            channel
        }
    }

    /// Modal ADC value the channel sits at for its applied DAC code.
    fn baseline_of(&self, dac: Word) -> Word {
        (0xffff - dac.min(0xffff)) >> (16 - self.def.adc_bits)
    }

    fn execute_control_task(&self, inner: &mut SimInner, task: ControlTask) {
        match task {
            ControlTask::SetDacs => {
                for chan in 0..self.def.num_channels {
                    let addr = param::channel_var_address(ChannelVar::OffsetDac, chan);
                    let dac = inner.dsp.get(&addr).copied().unwrap_or(0);
                    inner.afe[chan].dac = dac.min(0xffff);
                }
            }
            ControlTask::GetTraces => {
                let user0 = inner
                    .dsp
                    .get(&param::module_var_address(ModuleVar::UserIn, 0))
                    .copied()
                    .unwrap_or(0) as usize;
                let user1 = inner
                    .dsp
                    .get(&param::module_var_address(ModuleVar::UserIn, 1))
                    .copied()
                    .unwrap_or(0) as usize;
                let cpd = self.channels_per_db();
                let chan = if cpd == 0 { user1 } else { user0 * cpd + user1 };
                if chan < self.def.num_channels {
                    let source = self.source_channel(inner, chan);
                    let baseline = self.baseline_of(inner.afe[source].dac);
                    self.fill_trace(inner, baseline);
                }
            }
            ControlTask::AdjustOffsets => {
                // The DSP-hosted loop lands every channel on its target.
                for chan in 0..self.def.num_channels {
                    let addr = param::channel_var_address(ChannelVar::BaselinePercent, chan);
                    let percent = inner.dsp.get(&addr).copied().unwrap_or(10).clamp(0, 100);
                    let target = ((1u64 << self.def.adc_bits) * u64::from(percent) / 100) as Word;
                    let dac = 0xffff - (target << (16 - self.def.adc_bits)).min(0xffff);
                    inner.afe[chan].dac = dac;
                    let dac_addr = param::channel_var_address(ChannelVar::OffsetDac, chan);
                    inner.dsp.insert(dac_addr, dac);
                }
            }
            _ => {}
        }
    }

    /// Pack a trace at `baseline` with a ±1 ripple into the I/O buffer, two
    /// samples per word, low half first.
    fn fill_trace(&self, inner: &mut SimInner, baseline: Word) {
        let full_scale = (1u32 << self.def.adc_bits) - 1;
        let sample = |i: usize| -> Word {
            match i % 4 {
                1 => (baseline + 1).min(full_scale),
                3 => baseline.saturating_sub(1),
                _ => baseline,
            }
        };
        for (w, word) in inner.io_buffer.iter_mut().enumerate() {
            let lo = sample(w * 2) & 0xffff;
            let hi = sample(w * 2 + 1) & 0xffff;
            *word = lo | (hi << 16);
        }
    }

    fn handle_csr_write(&self, inner: &mut SimInner, value: Word) {
        if value & regs::csr::RUN_ENABLE != 0 {
            let control = inner
                .dsp
                .get(&param::module_var_address(ModuleVar::ControlTask, 0))
                .copied()
                .unwrap_or(0);
            let task = ControlTask::from_raw(control);
            if task != ControlTask::Idle {
                // Control tasks complete before the write returns, so the
                // host never observes RUN_ACTIVE for them.
                self.execute_control_task(inner, task);
                return;
            }
            let run = inner
                .dsp
                .get(&param::module_var_address(ModuleVar::RunTask, 0))
                .copied()
                .unwrap_or(0);
            if RunTask::from_raw(run) != RunTask::Idle {
                inner.run_active = true;
            }
        } else {
            inner.run_active = false;
        }
    }

    fn decode_cfg_dac(&self, inner: &mut SimInner, command: Word) {
        let cpd = self.channels_per_db();
        if cpd == 0 {
            return;
        }
        let port = inner.regs.get(&regs::CFG_PORT).copied().unwrap_or(0) as usize;
        if port == 0 {
            return;
        }
        let db = port - 1;
        let addr = (command >> 24) & 0xff;
        let ctrl = (command >> 16) & 0xff;
        let value = command & 0xffff;
        // Address bit 1 selects the lower four channels; the control nibble
        // is the DAC output letter compensating the PCB swap layout.
        let group = if addr & 0x02 != 0 { 0 } else { 4 };
        let sigma = match ctrl.wrapping_sub(0x30) {
            1 => 0,
            2 => 1,
            0 => 2,
            3 => 3,
            _ => return,
        };
        let chan = db * cpd + group + sigma;
        if chan < self.def.num_channels {
            inner.afe[chan].dac = value;
        }
    }

    fn seed_var_defaults(&self, inner: &mut SimInner, text: &str) {
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.split('(').next().unwrap_or("").trim();
            let Ok(value) = value.parse::<Word>() else {
                continue;
            };
            let name = name.trim();
            if let Some(var) = param::lookup_module_var(name) {
                inner.dsp.insert(param::module_var_address(var, 0), value);
                tracing::debug!("sim: mod var default: {name}={value}");
            } else if let Some(var) = param::lookup_channel_var(name) {
                for chan in 0..self.def.num_channels {
                    inner.dsp.insert(param::channel_var_address(var, chan), value);
                }
                tracing::debug!("sim: chan var default: {name}={value}");
            }
        }
    }
}

/// A simulated bus device.
#[derive(Debug)]
pub struct SimBus {
    info: DeviceInfo,
    state: Arc<SimState>,
}

impl SimBus {
    /// Open the simulated device at `device_number`.
    ///
    /// # Errors
    ///
    /// `ModuleNotFound` when no definition matches; enumeration treats this
    /// as the end of the crate.
    pub fn open(device_number: usize) -> Result<Self> {
        let def = MOD_DEFS
            .read()
            .iter()
            .find(|d| d.num_channels != 0 && d.device_number == device_number)
            .cloned()
            .ok_or(Error::ModuleNotFound { device: device_number })?;

        tracing::info!("sim: module: open: device={device_number}");

        let kind = def.db_kind();
        let configs = (0..def.num_channels)
            .map(|c| ChannelConfig::new(c, kind, def.adc_bits, def.adc_msps, def.adc_clk_div))
            .collect();
        let info = DeviceInfo {
            device_number,
            slot: def.slot,
            serial: def.serial,
            revision: def.revision,
            crate_revision: def.crate_revision,
            eeprom_format: def.eeprom_format,
            configs,
            pci_bus: def.pci_bus,
            pci_slot: if def.pci_slot < 0 { def.slot as i32 } else { def.pci_slot },
        };

        let state = Arc::new(SimState::new(def));

        if let Some(path) = state.def.var_defaults.clone() {
            let text = std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            let mut inner = state.inner.lock();
            state.seed_var_defaults(&mut inner, &text);
        }

        let mut states = STATES.lock();
        states.retain(|(n, _)| *n != device_number);
        states.push((device_number, Arc::clone(&state)));

        Ok(Self { info, state })
    }
}

impl BusDriver for SimBus {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn read_word(&self, offset: usize) -> Result<Word> {
        let mut inner = self.state.inner.lock();
        let value = match offset {
            regs::CSR => {
                if inner.run_active {
                    regs::csr::RUN_ACTIVE
                } else {
                    0
                }
            }
            regs::FIFO_LEVEL => inner.fifo.len().min(dpm_hw::FIFO_SIZE_WORDS) as Word,
            regs::FIFO_DATA => inner.fifo.pop_front().unwrap_or(0),
            regs::DSP_DATA => {
                let ptr = inner.dsp_ptr;
                inner.dsp.get(&ptr).copied().unwrap_or(0)
            }
            regs::FIPPI_DATA => {
                let ptr = inner.fippi_ptr;
                inner.fippi.get(&ptr).copied().unwrap_or(0)
            }
            regs::FPGA_STATUS => {
                let mut status = 0;
                if inner.comms_done {
                    status |= regs::status::COMMS_DONE;
                }
                if inner.fippi_done {
                    status |= regs::status::FIPPI_DONE;
                }
                if inner.dsp_running {
                    status |= regs::status::DSP_RUNNING;
                }
                status
            }
            other => inner.regs.get(&other).copied().unwrap_or(0),
        };
        Ok(value)
    }

    fn write_word(&self, offset: usize, value: Word) -> Result<()> {
        let mut inner = self.state.inner.lock();
        match offset {
            regs::CSR => self.state.handle_csr_write(&mut inner, value),
            regs::DSP_ADDR => inner.dsp_ptr = value,
            regs::DSP_DATA => {
                let ptr = inner.dsp_ptr;
                inner.dsp.insert(ptr, value);
            }
            regs::FIPPI_ADDR => inner.fippi_ptr = value,
            regs::FIPPI_DATA => {
                let ptr = inner.fippi_ptr;
                inner.fippi.insert(ptr, value);
            }
            regs::CFG_DAC => self.state.decode_cfg_dac(&mut inner, value),
            regs::FPGA_COMMS_PROG => inner.comms_done = true,
            regs::FPGA_FIPPI_PROG => {
                // A reload clears the signal FPGA's register state.
                inner.fippi.clear();
                inner.fippi_done = true;
            }
            regs::DSP_PROG => inner.dsp_running = true,
            other => {
                inner.regs.insert(other, value);
            }
        }
        Ok(())
    }

    fn dma_read(&self, source: Address, out: &mut [Word]) -> Result<()> {
        if out.len() > MAX_DMA_BLOCK_SIZE {
            return Err(Error::invalid_value(format!(
                "DMA block too large: {} words",
                out.len()
            )));
        }
        let mut inner = self.state.inner.lock();
        if (regs::FIFO_MEM..regs::MCA_MEM).contains(&source) {
            for word in out.iter_mut() {
                *word = inner.fifo.pop_front().unwrap_or(0);
            }
        } else if source >= regs::MCA_MEM {
            let len = inner.histograms.first().map_or(0, Vec::len);
            let index = (source - regs::MCA_MEM) as usize;
            for (i, word) in out.iter_mut().enumerate() {
                let at = index + i;
                *word = if len == 0 {
                    0
                } else {
                    inner
                        .histograms
                        .get(at / len)
                        .and_then(|h| h.get(at % len))
                        .copied()
                        .unwrap_or(0)
                };
            }
        } else if source >= regs::DSP_MEM {
            let base = source - regs::DSP_MEM;
            let io_start = regs::DSP_IO_BUFFER;
            let io_end = io_start + inner.io_buffer.len() as Address;
            for (i, word) in out.iter_mut().enumerate() {
                let addr = base + i as Address;
                *word = if (io_start..io_end).contains(&addr) {
                    inner.io_buffer[(addr - io_start) as usize]
                } else {
                    inner.dsp.get(&addr).copied().unwrap_or(0)
                };
            }
        } else {
            return Err(Error::bus(format!("DMA source out of range: {source:#x}")));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        tracing::info!("sim: module: close: device={}", self.info.device_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusDriver;

    fn def_line(device: usize, slot: usize) -> String {
        format!(
            "device-number={device},slot={slot},revision=17,eeprom-format=2,\
             serial-num=1000,num-channels=8,adc-bits=14,adc-msps=250,adc-clk-div=2"
        )
    }

    #[test]
    fn parse_rejects_unknown_keys() {
        assert!(parse_module_def("device-number=0,bogus=1").is_err());
        assert!(parse_module_def("device-number").is_err());
        assert!(parse_module_def("adc-bits=fourteen").is_err());
    }

    #[test]
    fn parse_full_definition() {
        let def = parse_module_def(&def_line(3, 9)).unwrap();
        assert_eq!(def.device_number, 3);
        assert_eq!(def.slot, 9);
        assert_eq!(def.db_kind(), DbKind::Db04);
        assert_eq!(def.num_channels, 8);
    }

    #[test]
    fn baseline_follows_dac_inverted() {
        let state = SimState::new(parse_module_def(&def_line(40, 2)).unwrap());
        assert_eq!(state.baseline_of(0xffff), 0);
        assert_eq!(state.baseline_of(0), (1 << 14) - 1);
        let mid = state.baseline_of(0x8000);
        assert!((8190..=8192).contains(&mid));
    }

    #[test]
    fn fifo_pops_through_dma() {
        let mut registry = MOD_DEFS.write();
        registry.retain(|d| d.device_number != 41);
        registry.push(parse_module_def(&def_line(41, 3)).unwrap());
        drop(registry);

        let bus = SimBus::open(41).unwrap();
        let words: Vec<Word> = (0..100).collect();
        bus.state.push_fifo(&words);
        assert_eq!(bus.read_word(regs::FIFO_LEVEL).unwrap(), 100);

        let mut out = vec![0; 64];
        bus.dma_read(regs::FIFO_MEM, &mut out).unwrap();
        assert_eq!(out, (0..64).collect::<Vec<Word>>());
        assert_eq!(bus.read_word(regs::FIFO_LEVEL).unwrap(), 36);
    }

    #[test]
    fn swapped_pair_reads_partner_until_compensated() {
        let state = SimState::new(parse_module_def(&def_line(42, 4)).unwrap());
        state.set_swapped_wiring(0, true);
        state.set_swapped_wiring(1, true);
        {
            let mut inner = state.inner.lock();
            inner.afe[0].dac = 0x1000;
            inner.afe[1].dac = 0xe000;
            assert_eq!(state.source_channel(&inner, 0), 1);
            assert_eq!(state.source_channel(&inner, 1), 0);
            assert_eq!(state.source_channel(&inner, 2), 2);
            // The pair bit rewires both channels of the pair.
            inner.fippi.insert(regs::db_addr(0, regs::ADCCTRL), 1);
            assert_eq!(state.source_channel(&inner, 0), 0);
            assert_eq!(state.source_channel(&inner, 1), 1);
        }
    }
}
