//! One pulse-processing module.
//!
//! A module exclusively owns its bus device, its fixture, and its FIFO
//! pump. The crate owns the modules; shared access goes through the crate's
//! user token plus the module's own locking. State that the FIFO worker and
//! per-module operations share lives behind atomics ([`ModuleFlags`]); the
//! rest sits in one mutex ([`ModuleCore`]) that every operation takes for
//! its duration, so operations on the same module serialize while distinct
//! modules proceed in parallel.
//!
//! Lifecycle: `created → opened → present → booted → online`. Closing
//! releases the bus device exactly once.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use dpm_hw::{regs, AdcWord, Address, RevTag, Word};

use crate::backends::{self, BackendSelection};
use crate::backplane::Backplane;
use crate::bus::{self, BusPort};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::fifo::FifoPump;
use crate::firmware::{self, FirmwareImage, FirmwareKind};
use crate::fixture::ModuleFixture;
use crate::param::{
    self, channel_var_descriptors, module_var_descriptors, ChannelVar, ModuleVar, Value,
    VarDescriptor, VarSlot,
};
use crate::run::{ControlTask, RunMode, RunTask};
use crate::stats::{Counters, Stats};

/// How long a control task may run before it is declared stuck.
const CONTROL_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock-free module state shared with the FIFO worker.
#[derive(Debug, Default)]
pub(crate) struct ModuleFlags {
    pub present: AtomicBool,
    pub online: AtomicBool,
    pub forced_offline: AtomicBool,
    /// Raw RunTask code of the active run, `0` when idle.
    pub run_task: AtomicU32,
}

/// Everything behind the module lock: identity, variable caches, channels,
/// and the fixture.
#[derive(Debug)]
pub(crate) struct ModuleCore {
    pub device_number: usize,
    pub slot: usize,
    pub number: i32,
    pub serial: u32,
    pub revision: i32,
    pub rev_tag: Option<RevTag>,
    pub crate_revision: i32,
    pub eeprom_format: i32,
    pub num_channels: usize,
    pub pci_bus: i32,
    pub pci_slot: i32,
    pub module_var_descs: Vec<VarDescriptor<ModuleVar>>,
    pub channel_var_descs: Vec<VarDescriptor<ChannelVar>>,
    pub module_vars: Vec<VarSlot>,
    pub channels: Vec<Channel>,
    pub fixture: ModuleFixture,
    pub firmware: Vec<Arc<FirmwareImage>>,
    pub comms_fpga: bool,
    pub fippi_fpga: bool,
    pub dsp_online: bool,
    pub vars_loaded: bool,
}

impl ModuleCore {
    fn new() -> Self {
        let module_var_descs = module_var_descriptors();
        let module_vars = module_var_descs.iter().map(|d| VarSlot::new(d.size)).collect();
        Self {
            device_number: 0,
            slot: 0,
            number: -1,
            serial: 0,
            revision: 0,
            rev_tag: None,
            crate_revision: 0,
            eeprom_format: 0,
            num_channels: 0,
            pci_bus: -1,
            pci_slot: -1,
            module_var_descs,
            channel_var_descs: channel_var_descriptors(),
            module_vars,
            channels: Vec::new(),
            fixture: ModuleFixture::default(),
            firmware: Vec::new(),
            comms_fpga: false,
            fippi_fpga: false,
            dsp_online: false,
            vars_loaded: false,
        }
    }

    pub fn label(&self) -> String {
        format!("module={} slot={}", self.number, self.slot)
    }

    pub fn channel_check(&self, channel: usize) -> Result<()> {
        if channel >= self.num_channels {
            return Err(Error::ChannelNumberInvalid {
                number: self.number,
                slot: self.slot,
                channel,
            });
        }
        Ok(())
    }

    /// Cached first cell of a module variable.
    pub fn module_var(&self, var: ModuleVar) -> Value {
        self.module_vars[var as usize].cells[0].value
    }

    fn cell_mut(&mut self, var: ModuleVar, offset: usize) -> Result<&mut param::Cell> {
        let desc = &self.module_var_descs[var as usize];
        if offset >= desc.size {
            return Err(Error::invalid_value(format!(
                "variable offset out of range: {}[{offset}]",
                desc.name
            )));
        }
        Ok(&mut self.module_vars[var as usize].cells[offset])
    }

    /// Read a module variable. `io` reads through to the DSP and refreshes
    /// the cache; otherwise the cached copy is returned.
    pub fn read_module_var(
        &mut self,
        bus: &BusPort,
        var: ModuleVar,
        offset: usize,
        io: bool,
    ) -> Result<Value> {
        let address = self.module_var_descs[var as usize].address + offset as Address;
        let cell = self.cell_mut(var, offset)?;
        if io {
            let value = bus::dsp_read(bus, address)?;
            cell.value = value;
            cell.dirty = false;
            Ok(value)
        } else {
            Ok(cell.value)
        }
    }

    /// Write a module variable. `io` pushes straight to the DSP; otherwise
    /// the cell is cached dirty for the next sync.
    pub fn write_module_var(
        &mut self,
        bus: &BusPort,
        var: ModuleVar,
        value: Value,
        offset: usize,
        io: bool,
    ) -> Result<()> {
        let desc = &self.module_var_descs[var as usize];
        if !desc.writable() {
            return Err(Error::invalid_value(format!("variable is read-only: {}", desc.name)));
        }
        let address = desc.address + offset as Address;
        let cell = self.cell_mut(var, offset)?;
        cell.value = value;
        if io {
            cell.dirty = false;
            bus::dsp_write(bus, address, value)?;
        } else {
            cell.dirty = true;
        }
        Ok(())
    }

    /// Read a channel variable; see [`Self::read_module_var`].
    pub fn read_channel_var(
        &mut self,
        bus: &BusPort,
        var: ChannelVar,
        channel: usize,
        io: bool,
    ) -> Result<Value> {
        self.channel_check(channel)?;
        if io {
            let value = bus::dsp_read(bus, param::channel_var_address(var, channel))?;
            let cell = &mut self.channels[channel].vars[var as usize].cells[0];
            cell.value = value;
            cell.dirty = false;
            Ok(value)
        } else {
            Ok(self.channels[channel].var(var))
        }
    }

    /// Write a channel variable; see [`Self::write_module_var`].
    pub fn write_channel_var(
        &mut self,
        bus: &BusPort,
        var: ChannelVar,
        value: Value,
        channel: usize,
        io: bool,
    ) -> Result<()> {
        self.channel_check(channel)?;
        let desc = &self.channel_var_descs[var as usize];
        if !desc.writable() {
            return Err(Error::invalid_value(format!("variable is read-only: {}", desc.name)));
        }
        let cell = &mut self.channels[channel].vars[var as usize].cells[0];
        cell.value = value;
        if io {
            cell.dirty = false;
            bus::dsp_write(bus, param::channel_var_address(var, channel), value)?;
        } else {
            cell.dirty = true;
        }
        Ok(())
    }

    /// Flush every dirty cell to the DSP in address order and clear the
    /// dirty flags.
    pub fn sync_to_dsp(&mut self, bus: &BusPort) -> Result<()> {
        let mut writes: Vec<(Address, Value)> = Vec::new();
        for (desc, slot) in self.module_var_descs.iter().zip(&self.module_vars) {
            for (offset, cell) in slot.cells.iter().enumerate() {
                if cell.dirty {
                    writes.push((desc.address + offset as Address, cell.value));
                }
            }
        }
        for channel in &self.channels {
            for desc in &self.channel_var_descs {
                let cell = &channel.vars[desc.var as usize].cells[0];
                if cell.dirty {
                    writes.push((param::channel_var_address(desc.var, channel.number), cell.value));
                }
            }
        }
        writes.sort_by_key(|&(address, _)| address);
        tracing::debug!("{}: sync vars: {} dirty cells", self.label(), writes.len());
        for (address, value) in writes {
            bus::dsp_write(bus, address, value)?;
        }
        for slot in &mut self.module_vars {
            for cell in &mut slot.cells {
                cell.dirty = false;
            }
        }
        for channel in &mut self.channels {
            for slot in &mut channel.vars {
                for cell in &mut slot.cells {
                    cell.dirty = false;
                }
            }
        }
        Ok(())
    }

    /// Refresh every cached cell from the DSP, discarding dirty state.
    pub fn refresh_from_dsp(&mut self, bus: &BusPort) -> Result<()> {
        for (desc, slot) in self.module_var_descs.iter().zip(self.module_vars.iter_mut()) {
            for (offset, cell) in slot.cells.iter_mut().enumerate() {
                cell.value = bus::dsp_read(bus, desc.address + offset as Address)?;
                cell.dirty = false;
            }
        }
        for channel in &mut self.channels {
            for desc in &self.channel_var_descs {
                let cell = &mut channel.vars[desc.var as usize].cells[0];
                cell.value =
                    bus::dsp_read(bus, param::channel_var_address(desc.var, channel.number))?;
                cell.dirty = false;
            }
        }
        Ok(())
    }

    /// Drop every cached value and dirty flag.
    fn erase_values(&mut self) {
        for slot in &mut self.module_vars {
            slot.erase();
        }
        for channel in &mut self.channels {
            channel.erase_vars();
            channel.adc_trace.clear();
        }
    }

    /// Seed the cache with the values the DSP expects after a load.
    fn init_values(&mut self) {
        self.module_vars[ModuleVar::SlotId as usize].cells[0].value = self.slot as Value;
        self.module_vars[ModuleVar::ModNum as usize].cells[0].value = self.number.max(0) as Value;
        for (var, value) in [(ModuleVar::SlowFilterRange, 3), (ModuleVar::FastFilterRange, 0)] {
            let cell = &mut self.module_vars[var as usize].cells[0];
            cell.value = value;
            cell.dirty = true;
        }
        for channel in &mut self.channels {
            channel.set_var(ChannelVar::BaselinePercent, 10);
            channel.set_var(ChannelVar::OffsetDac, 32_768);
        }
    }
}

/// Run a control task to completion: select it, strobe the run enable, and
/// poll the CSR until the active bit drops.
pub(crate) fn control_run(core: &mut ModuleCore, bus: &BusPort, task: ControlTask) -> Result<()> {
    core.write_module_var(bus, ModuleVar::ControlTask, task as Word, 0, true)?;
    bus.write_word(regs::CSR, regs::csr::RUN_ENABLE)?;

    let deadline = Instant::now() + CONTROL_TASK_TIMEOUT;
    while bus.read_word(regs::CSR)? & regs::csr::RUN_ACTIVE != 0 {
        if Instant::now() > deadline {
            return Err(Error::internal(format!(
                "{}: control task timeout: {task:?}",
                core.label()
            )));
        }
        std::thread::sleep(Duration::from_micros(100));
    }

    core.write_module_var(bus, ModuleVar::ControlTask, ControlTask::Idle as Word, 0, true)
}

/// Direction of a variable sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Flush dirty cache cells to the DSP, then reconcile hardware state.
    ToDsp,
    /// Refresh the cache from the DSP, e.g. before a config export.
    FromDsp,
}

/// One module of the crate.
#[derive(Debug)]
pub struct Module {
    bus: Arc<BusPort>,
    flags: Arc<ModuleFlags>,
    counters: Arc<Counters>,
    fifo: FifoPump,
    backplane: Arc<Backplane>,
    core: Mutex<ModuleCore>,
}

impl Module {
    /// Modules are created by the crate, sharing its backplane.
    pub fn new(backplane: Arc<Backplane>, reg_trace: bool) -> Self {
        let bus = Arc::new(BusPort::new(reg_trace));
        let flags = Arc::new(ModuleFlags::default());
        let counters = Arc::new(Counters::default());
        let fifo = FifoPump::new(Arc::clone(&bus), Arc::clone(&flags), Arc::clone(&counters));
        Self {
            bus,
            flags,
            counters,
            fifo,
            backplane,
            core: Mutex::new(ModuleCore::new()),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Bind the bus device at `device_number` and decode its identity.
    ///
    /// # Errors
    ///
    /// `ModuleAlreadyOpen` when a device is already bound; `ModuleNotFound`
    /// when no device exists at that number.
    pub fn open(&self, selection: BackendSelection, device_number: usize) -> Result<()> {
        if self.present() {
            let core = self.core.lock();
            return Err(Error::ModuleAlreadyOpen { number: core.number, slot: core.slot });
        }

        let driver = backends::open(selection, device_number)?;
        let info = driver.info().clone();
        self.bus.bind(driver);

        let mut core = self.core.lock();
        core.device_number = device_number;
        core.slot = info.slot;
        core.serial = info.serial;
        core.revision = info.revision;
        core.rev_tag = RevTag::from_raw(info.revision);
        core.crate_revision = info.crate_revision;
        core.eeprom_format = info.eeprom_format;
        core.num_channels = info.num_channels();
        core.pci_bus = info.pci_bus;
        core.pci_slot = info.pci_slot;
        core.channels = info
            .configs
            .iter()
            .map(|config| Channel::new(config.index, config.clone()))
            .collect();
        core.fixture = ModuleFixture::for_revision(core.rev_tag);

        let fixture = std::mem::take(&mut core.fixture);
        fixture.init_channels(&mut core);
        core.fixture = fixture;

        self.flags.present.store(true, Ordering::Release);
        tracing::info!(
            "module: device {device_number}: slot={} serial={} rev={} eeprom-format={}",
            core.slot,
            core.serial,
            core.revision,
            core.eeprom_format
        );
        Ok(())
    }

    /// Stop everything and release the bus device.
    pub fn close(&self) -> Result<()> {
        if self.run_active() {
            if let Err(e) = self.run_end() {
                tracing::warn!("module: close: run end: {e}");
            }
        }
        self.fifo.stop();
        self.flags.online.store(false, Ordering::Release);
        self.flags.present.store(false, Ordering::Release);
        self.flags.forced_offline.store(false, Ordering::Release);
        {
            let mut core = self.core.lock();
            core.comms_fpga = false;
            core.fippi_fpga = false;
            core.dsp_online = false;
            core.vars_loaded = false;
            tracing::info!("{}: close: device={}", core.label(), core.device_number);
        }
        self.bus.release()
    }

    /// Take the module offline without releasing the bus device.
    pub fn force_offline(&self) {
        if self.run_active() {
            let _ = self.run_end();
        }
        self.fifo.stop();
        self.flags.online.store(false, Ordering::Release);
        self.flags.forced_offline.store(true, Ordering::Release);
        let slot = self.slot();
        self.backplane.offline(slot);
        tracing::info!("module: slot {slot}: forced offline");
    }

    /// Probe the devices to see what is loaded and recompute onlineness.
    pub fn probe(&self) -> Result<bool> {
        let mut core = self.core.lock();
        let status = self.bus.read_word(regs::FPGA_STATUS)?;
        core.comms_fpga = status & regs::status::COMMS_DONE != 0;
        core.fippi_fpga = status & regs::status::FIPPI_DONE != 0;
        core.dsp_online = status & regs::status::DSP_RUNNING != 0;
        let online = core.comms_fpga
            && core.fippi_fpga
            && core.dsp_online
            && !self.flags.forced_offline.load(Ordering::Acquire);
        tracing::info!(
            "{}: probe: comms={} fippi={} dsp={}",
            core.label(),
            core.comms_fpga,
            core.fippi_fpga,
            core.dsp_online
        );
        if online && !core.vars_loaded {
            core.erase_values();
            core.init_values();
            core.vars_loaded = true;
        }
        self.flags.online.store(online, Ordering::Release);
        if online && !self.fifo.is_running() {
            self.fifo.start(core.slot);
        }
        Ok(online)
    }

    /// Boot the requested devices. The module is online only when all
    /// three of comms FPGA, signal FPGA, and DSP are loaded; full boots
    /// then initialize the variable caches, start the FIFO services, and
    /// run the fixture's boot procedure.
    pub fn boot(&self, boot_comms: bool, boot_fippi: bool, boot_dsp: bool) -> Result<()> {
        if !self.present() {
            let core = self.core.lock();
            return Err(Error::module_offline(core.number, core.slot));
        }
        self.flags.online.store(false, Ordering::Release);

        let mut core = self.core.lock();
        tracing::info!(
            "{}: boot: comms={boot_comms} fippi={boot_fippi} dsp={boot_dsp}",
            core.label()
        );

        if boot_comms {
            let image = firmware::get(&core.firmware, FirmwareKind::Comms)?;
            firmware::load(&self.bus, FirmwareKind::Comms, &image.data)?;
            core.comms_fpga = true;
            let mut fixture = std::mem::take(&mut core.fixture);
            fixture.fpga_comms_loaded();
            core.fixture = fixture;
        }
        if boot_fippi {
            let image = firmware::get(&core.firmware, FirmwareKind::Fippi)?;
            firmware::load(&self.bus, FirmwareKind::Fippi, &image.data)?;
            core.fippi_fpga = true;
            let mut fixture = std::mem::take(&mut core.fixture);
            fixture.fpga_fippi_loaded(&mut core);
            core.fixture = fixture;
        }
        if boot_dsp {
            let image = firmware::get(&core.firmware, FirmwareKind::Dsp)?;
            firmware::load(&self.bus, FirmwareKind::Dsp, &image.data)?;
            core.dsp_online = true;
            let mut fixture = std::mem::take(&mut core.fixture);
            fixture.dsp_loaded();
            core.fixture = fixture;
        }

        if core.comms_fpga && core.fippi_fpga && core.dsp_online {
            self.initialize(&mut core)?;
            self.flags.forced_offline.store(false, Ordering::Release);
            self.flags.online.store(true, Ordering::Release);
            tracing::info!("{}: online", core.label());
        }
        Ok(())
    }

    /// Post-boot initialization: variable caches, FIFO services, and the
    /// fixture boot procedure. A fixture failure leaves the module offline.
    fn initialize(&self, core: &mut ModuleCore) -> Result<()> {
        core.erase_values();
        core.init_values();
        core.sync_to_dsp(&self.bus)?;
        core.vars_loaded = true;

        self.fifo.start(core.slot);

        let mut fixture = std::mem::take(&mut core.fixture);
        let booted = fixture.boot(core, &self.bus);
        core.fixture = fixture;
        if let Err(e) = booted {
            self.fifo.stop();
            return Err(e);
        }
        Ok(())
    }

    // ── Identity ─────────────────────────────────────────────────────────────

    pub fn present(&self) -> bool {
        self.flags.present.load(Ordering::Acquire)
    }

    pub fn online(&self) -> bool {
        self.flags.online.load(Ordering::Acquire)
    }

    pub fn forced_offline(&self) -> bool {
        self.flags.forced_offline.load(Ordering::Acquire)
    }

    pub fn slot(&self) -> usize {
        self.core.lock().slot
    }

    /// Logical module number, -1 when unassigned.
    pub fn number(&self) -> i32 {
        self.core.lock().number
    }

    pub fn set_number(&self, number: i32) {
        self.core.lock().number = number;
    }

    /// Override the slot, used by duplicate-slot resolution.
    pub(crate) fn set_slot(&self, slot: usize) {
        self.core.lock().slot = slot;
    }

    pub fn serial(&self) -> u32 {
        self.core.lock().serial
    }

    pub fn revision(&self) -> i32 {
        self.core.lock().revision
    }

    pub fn rev_tag(&self) -> Option<RevTag> {
        self.core.lock().rev_tag
    }

    /// Revision letter, `?` when unknown.
    pub fn revision_label(&self) -> char {
        self.core.lock().rev_tag.map_or('?', RevTag::label)
    }

    pub fn crate_revision(&self) -> i32 {
        self.core.lock().crate_revision
    }

    pub fn num_channels(&self) -> usize {
        self.core.lock().num_channels
    }

    pub fn pci_bus(&self) -> i32 {
        self.core.lock().pci_bus
    }

    pub fn pci_slot(&self) -> i32 {
        self.core.lock().pci_slot
    }

    pub fn label(&self) -> String {
        self.core.lock().label()
    }

    /// Per-channel analog front-end configurations.
    pub fn channel_configs(&self) -> Vec<dpm_hw::ChannelConfig> {
        self.core.lock().channels.iter().map(|c| c.config.clone()).collect()
    }

    /// The cached value of a module variable, without bus traffic.
    pub fn cached_var(&self, var: ModuleVar) -> Value {
        self.core.lock().module_var(var)
    }

    // ── Checks ───────────────────────────────────────────────────────────────

    /// # Errors
    ///
    /// `ModuleOffline` unless the module is online.
    pub fn online_check(&self) -> Result<()> {
        if self.online() {
            Ok(())
        } else {
            let core = self.core.lock();
            Err(Error::module_offline(core.number, core.slot))
        }
    }

    /// # Errors
    ///
    /// `ChannelNumberInvalid` when the channel is out of range.
    pub fn channel_check(&self, channel: usize) -> Result<()> {
        self.core.lock().channel_check(channel)
    }

    // ── Firmware ─────────────────────────────────────────────────────────────

    /// Bind a firmware image set to the module.
    pub fn add_firmware(&self, images: Vec<Arc<FirmwareImage>>) {
        let mut core = self.core.lock();
        for image in images {
            if !core.firmware.iter().any(|i| Arc::ptr_eq(i, &image)) {
                core.firmware.push(image);
            }
        }
    }

    /// The bound image of a kind.
    ///
    /// # Errors
    ///
    /// `Internal` when no image of that kind is bound.
    pub fn firmware_get(&self, kind: FirmwareKind) -> Result<Arc<FirmwareImage>> {
        firmware::get(&self.core.lock().firmware, kind)
    }

    pub fn has_firmware(&self) -> bool {
        !self.core.lock().firmware.is_empty()
    }

    // ── Variable I/O ─────────────────────────────────────────────────────────

    /// Read a module variable.
    pub fn read_module_var(&self, var: ModuleVar, offset: usize, io: bool) -> Result<Value> {
        self.core.lock().read_module_var(&self.bus, var, offset, io)
    }

    /// Write a module variable. Variables with register-level side effects
    /// are routed through their handlers.
    pub fn write_module_var(
        &self,
        var: ModuleVar,
        value: Value,
        offset: usize,
        io: bool,
    ) -> Result<()> {
        let mut core = self.core.lock();
        match var {
            ModuleVar::ModCsrB => self.module_csrb(&mut core, value, io),
            ModuleVar::SlowFilterRange => self.slow_filter_range(&mut core, value, io),
            ModuleVar::FastFilterRange => self.fast_filter_range(&mut core, value, io),
            _ => core.write_module_var(&self.bus, var, value, offset, io),
        }
    }

    /// Read a channel variable.
    pub fn read_channel_var(&self, var: ChannelVar, channel: usize, io: bool) -> Result<Value> {
        self.core.lock().read_channel_var(&self.bus, var, channel, io)
    }

    /// Write a channel variable.
    pub fn write_channel_var(
        &self,
        var: ChannelVar,
        value: Value,
        channel: usize,
        io: bool,
    ) -> Result<()> {
        self.core.lock().write_channel_var(&self.bus, var, value, channel, io)
    }

    /// String-keyed variable read, for test tools. The channel is ignored
    /// for module variables.
    pub fn read_var(&self, name: &str, channel: usize, io: bool) -> Result<Value> {
        if let Some(var) = param::lookup_module_var(name) {
            self.read_module_var(var, 0, io)
        } else if let Some(var) = param::lookup_channel_var(name) {
            self.read_channel_var(var, channel, io)
        } else {
            Err(Error::invalid_value(format!("unknown variable: {name}")))
        }
    }

    /// String-keyed variable write, for test tools.
    pub fn write_var(&self, name: &str, value: Value, channel: usize, io: bool) -> Result<()> {
        if let Some(var) = param::lookup_module_var(name) {
            self.write_module_var(var, value, 0, io)
        } else if let Some(var) = param::lookup_channel_var(name) {
            self.write_channel_var(var, value, channel, io)
        } else {
            Err(Error::invalid_value(format!("unknown variable: {name}")))
        }
    }

    // ── Parameter I/O ────────────────────────────────────────────────────────
    //
    // Parameters are named, unit-converted views over the variables; writes
    // go through the variable layer so side-effect handlers still apply.

    /// Read a module parameter.
    pub fn read_module_param(&self, par: param::ModuleParam, io: bool) -> Result<Value> {
        self.read_module_var(Self::module_param_var(par), 0, io)
    }

    /// Write a module parameter through to the DSP.
    pub fn write_module_param(&self, par: param::ModuleParam, value: Value) -> Result<()> {
        self.write_module_var(Self::module_param_var(par), value, 0, true)
    }

    fn module_param_var(par: param::ModuleParam) -> ModuleVar {
        match par {
            param::ModuleParam::ModuleCsrb => ModuleVar::ModCsrB,
            param::ModuleParam::SlowFilterRange => ModuleVar::SlowFilterRange,
            param::ModuleParam::FastFilterRange => ModuleVar::FastFilterRange,
            param::ModuleParam::ModuleId => ModuleVar::ModId,
            param::ModuleParam::ModuleNumber => ModuleVar::ModNum,
            param::ModuleParam::CrateId => ModuleVar::CrateId,
            param::ModuleParam::SynchWait => ModuleVar::SynchWait,
            param::ModuleParam::InSynch => ModuleVar::InSynch,
        }
    }

    /// Read a channel parameter in its natural unit.
    pub fn read_channel_param(&self, par: param::ChannelParam, channel: usize) -> Result<f64> {
        let mut core = self.core.lock();
        core.channel_check(channel)?;
        let value = match par {
            param::ChannelParam::Voffset => {
                param::dac_to_voffset(core.channels[channel].var(ChannelVar::OffsetDac))
            }
            param::ChannelParam::BaselinePercent => core.channels[channel].baseline_percent(),
            param::ChannelParam::TriggerThreshold => {
                let thresh = f64::from(core.channels[channel].var(ChannelVar::FastThresh));
                let length = f64::from(core.channels[channel].var(ChannelVar::FastLength)).max(1.0);
                thresh / length
            }
            param::ChannelParam::TriggerRisetime => {
                let length = f64::from(core.channels[channel].var(ChannelVar::FastLength));
                let range = core.module_var(ModuleVar::FastFilterRange);
                let clk = f64::from(core.channels[channel].config.fpga_clk_mhz.max(1));
                length * f64::from(1u32 << range) / clk
            }
            param::ChannelParam::EnergyRisetime => {
                let length = f64::from(core.channels[channel].var(ChannelVar::SlowLength));
                let range = core.module_var(ModuleVar::SlowFilterRange);
                let clk = f64::from(core.channels[channel].config.fpga_clk_mhz.max(1));
                length * f64::from(1u32 << range) / clk
            }
        };
        Ok(value)
    }

    /// Write a channel parameter, converting into the underlying variables
    /// and pushing through to the DSP.
    ///
    /// # Errors
    ///
    /// `InvalidValue` when the value is out of the parameter's range.
    pub fn write_channel_param(
        &self,
        par: param::ChannelParam,
        channel: usize,
        value: f64,
    ) -> Result<()> {
        let mut core = self.core.lock();
        core.channel_check(channel)?;
        match par {
            param::ChannelParam::Voffset => {
                let dac = param::voffset_to_dac(value)?;
                core.write_channel_var(&self.bus, ChannelVar::OffsetDac, dac, channel, true)
            }
            param::ChannelParam::BaselinePercent => {
                if !(0.0..=100.0).contains(&value) {
                    return Err(Error::invalid_value(format!(
                        "baseline percent out of range: {value}"
                    )));
                }
                core.write_channel_var(
                    &self.bus,
                    ChannelVar::BaselinePercent,
                    value.round() as Value,
                    channel,
                    true,
                )
            }
            param::ChannelParam::TriggerThreshold => {
                let length = f64::from(core.channels[channel].var(ChannelVar::FastLength)).max(1.0);
                let thresh = (value * length).round();
                if !(0.0..=f64::from(u32::MAX)).contains(&thresh) {
                    return Err(Error::invalid_value(format!(
                        "trigger threshold out of range: {value}"
                    )));
                }
                core.write_channel_var(&self.bus, ChannelVar::FastThresh, thresh as Value, channel, true)
            }
            param::ChannelParam::TriggerRisetime => {
                let range = core.module_var(ModuleVar::FastFilterRange);
                let clk = f64::from(core.channels[channel].config.fpga_clk_mhz.max(1));
                let length = (value * clk / f64::from(1u32 << range)).round().max(1.0);
                core.write_channel_var(&self.bus, ChannelVar::FastLength, length as Value, channel, true)
            }
            param::ChannelParam::EnergyRisetime => {
                let range = core.module_var(ModuleVar::SlowFilterRange);
                let clk = f64::from(core.channels[channel].config.fpga_clk_mhz.max(1));
                let length = (value * clk / f64::from(1u32 << range)).round().max(1.0);
                core.write_channel_var(&self.bus, ChannelVar::SlowLength, length as Value, channel, true)
            }
        }
    }

    /// Synchronize the variable cache with the DSP.
    pub fn sync_vars(&self, direction: SyncDirection) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        match direction {
            SyncDirection::ToDsp => {
                core.sync_to_dsp(&self.bus)?;
                let fixture = std::mem::take(&mut core.fixture);
                let synced = fixture.sync_hw(&mut core, &self.bus);
                core.fixture = fixture;
                synced
            }
            SyncDirection::FromDsp => core.refresh_from_dsp(&self.bus),
        }
    }

    /// Initialize the analog front end: program the offset DACs and run the
    /// baseline adjustment.
    pub fn sync_hw(&self) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        let mut fixture = std::mem::take(&mut core.fixture);
        let result = fixture
            .set_dacs(&mut core, &self.bus)
            .and_then(|()| fixture.adjust_offsets(&mut core, &self.bus));
        core.fixture = fixture;
        result
    }

    // ── ModCSRB / filter range handlers ──────────────────────────────────────

    fn module_csrb(&self, core: &mut ModuleCore, value: Value, io: bool) -> Result<()> {
        let denied = self.backplane.claim(core.slot, value);
        let effective = value & !denied;
        core.write_module_var(&self.bus, ModuleVar::ModCsrB, effective, 0, io)
    }

    fn slow_filter_range(&self, core: &mut ModuleCore, value: Value, io: bool) -> Result<()> {
        if !(1..=6).contains(&value) {
            return Err(Error::invalid_value(format!("SlowFilterRange out of range: {value}")));
        }
        core.write_module_var(&self.bus, ModuleVar::SlowFilterRange, value, 0, io)?;
        if io {
            let fast = core.module_var(ModuleVar::FastFilterRange);
            bus::fippi_write(&self.bus, regs::FIPPI_FILTER_CTRL, (value << 4) | fast)?;
        }
        Ok(())
    }

    fn fast_filter_range(&self, core: &mut ModuleCore, value: Value, io: bool) -> Result<()> {
        if value > 6 {
            return Err(Error::invalid_value(format!("FastFilterRange out of range: {value}")));
        }
        core.write_module_var(&self.bus, ModuleVar::FastFilterRange, value, 0, io)?;
        if io {
            let slow = core.module_var(ModuleVar::SlowFilterRange);
            bus::fippi_write(&self.bus, regs::FIPPI_FILTER_CTRL, (slow << 4) | value)?;
        }
        Ok(())
    }

    // ── Control tasks ────────────────────────────────────────────────────────

    /// Program every channel's offset DAC from the OffsetDAC variables.
    pub fn set_dacs(&self) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        let fixture = std::mem::take(&mut core.fixture);
        let result = fixture.set_dacs(&mut core, &self.bus);
        core.fixture = fixture;
        result
    }

    /// Capture a fresh ADC trace on every channel.
    pub fn get_traces(&self) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        let fixture = std::mem::take(&mut core.fixture);
        let result = fixture.get_traces(&mut core, &self.bus);
        core.fixture = fixture;
        result
    }

    /// Drive every channel's baseline to its configured target.
    pub fn adjust_offsets(&self) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        let mut fixture = std::mem::take(&mut core.fixture);
        let result = fixture.adjust_offsets(&mut core, &self.bus);
        core.fixture = fixture;
        result
    }

    // ── Runs ─────────────────────────────────────────────────────────────────

    /// Start a list-mode run.
    pub fn start_listmode(&self, mode: RunMode) -> Result<()> {
        self.start_run(RunTask::ListMode, mode)
    }

    /// Start a histogram run.
    pub fn start_histograms(&self, mode: RunMode) -> Result<()> {
        self.start_run(RunTask::Histogram, mode)
    }

    fn start_run(&self, task: RunTask, mode: RunMode) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        if self.run_active() {
            self.run_end_with(&mut core)?;
        }
        let resume = Value::from(mode == RunMode::Resume);
        core.write_module_var(&self.bus, ModuleVar::Resume, resume, 0, true)?;
        core.write_module_var(&self.bus, ModuleVar::ControlTask, ControlTask::Idle as Word, 0, true)?;
        core.write_module_var(&self.bus, ModuleVar::RunTask, task as Word, 0, true)?;
        self.flags.run_task.store(task as u32, Ordering::Release);
        self.bus.write_word(regs::CSR, regs::csr::RUN_ENABLE)?;
        tracing::info!("{}: run start: {task:?} {mode:?}", core.label());
        Ok(())
    }

    /// True while a run task is active.
    pub fn run_active(&self) -> bool {
        RunTask::from_raw(self.flags.run_task.load(Ordering::Acquire)) != RunTask::Idle
    }

    /// Stop the hardware run and wait for the FIFO worker to drain what the
    /// hardware still holds. The worker keeps running for the next run.
    pub fn run_end(&self) -> Result<()> {
        self.online_check()?;
        let mut core = self.core.lock();
        self.run_end_with(&mut core)
    }

    fn run_end_with(&self, core: &mut ModuleCore) -> Result<()> {
        self.bus.write_word(regs::CSR, 0)?;
        core.write_module_var(&self.bus, ModuleVar::RunTask, RunTask::Idle as Word, 0, true)?;
        self.flags.run_task.store(RunTask::Idle as u32, Ordering::Release);
        tracing::info!("{}: run end", core.label());
        self.fifo.wait_drained();
        Ok(())
    }

    // ── Readout ──────────────────────────────────────────────────────────────

    /// Read a channel's ADC trace. `run` captures a fresh trace first;
    /// otherwise the last captured trace is copied. Returns the number of
    /// samples written.
    pub fn read_adc(&self, channel: usize, out: &mut [AdcWord], run: bool) -> Result<usize> {
        self.online_check()?;
        let mut core = self.core.lock();
        core.channel_check(channel)?;
        if run {
            crate::fixture::afe::acquire_adc(&mut core, &self.bus, channel)?;
        }
        let trace = &core.channels[channel].adc_trace;
        let n = out.len().min(trace.len());
        out[..n].copy_from_slice(&trace[..n]);
        Ok(n)
    }

    /// Read a channel's histogram memory.
    pub fn read_histogram(&self, channel: usize, out: &mut [Word]) -> Result<()> {
        self.online_check()?;
        let core = self.core.lock();
        core.channel_check(channel)?;
        let length = core.channels[channel].config.max_histogram_length;
        if out.len() > length {
            return Err(Error::invalid_value(format!(
                "histogram read too large: {} > {length}",
                out.len()
            )));
        }
        self.bus
            .dma_read(regs::MCA_MEM + (channel * length) as Address, out)
    }

    /// Drain up to `out.len()` list-mode words. Non-blocking.
    pub fn read_list_mode(&self, out: &mut [Word]) -> Result<usize> {
        self.online_check()?;
        Ok(self.fifo.read(out))
    }

    /// Words waiting across the module's queued buffers.
    pub fn read_list_mode_level(&self) -> Result<usize> {
        self.online_check()?;
        Ok(self.fifo.level())
    }

    /// Snapshot the module's counters.
    pub fn read_stats(&self) -> Stats {
        self.counters.snapshot()
    }

    // ── Register access (test tools) ─────────────────────────────────────────

    /// Read a register cell; returns 0 without hardware.
    pub fn read_word(&self, reg: usize) -> Result<Word> {
        self.bus.read_word(reg)
    }

    /// Write a register cell; dropped without hardware.
    pub fn write_word(&self, reg: usize, value: Word) -> Result<()> {
        self.bus.write_word(reg, value)
    }

    /// Block DMA read; transfers are split to the DMA block limit.
    pub fn dma_read(&self, source: Address, out: &mut [Word]) -> Result<()> {
        self.bus.dma_read(source, out)
    }

    // ── FIFO tunables ────────────────────────────────────────────────────────

    pub fn fifo_buffers(&self) -> usize {
        self.fifo.shared().buffers.load(Ordering::Relaxed)
    }

    /// Set the buffer pool size; applies at the next FIFO service start.
    pub fn set_fifo_buffers(&self, buffers: usize) {
        self.fifo.shared().buffers.store(buffers.max(1), Ordering::Relaxed);
    }

    pub fn fifo_run_wait_usecs(&self) -> u64 {
        self.fifo.shared().run_wait_usecs.load(Ordering::Relaxed)
    }

    pub fn set_fifo_run_wait_usecs(&self, usecs: u64) {
        self.fifo.shared().run_wait_usecs.store(usecs.max(1), Ordering::Relaxed);
    }

    pub fn fifo_idle_wait_usecs(&self) -> u64 {
        self.fifo.shared().idle_wait_usecs.load(Ordering::Relaxed)
    }

    pub fn set_fifo_idle_wait_usecs(&self, usecs: u64) {
        self.fifo.shared().idle_wait_usecs.store(usecs.max(1), Ordering::Relaxed);
    }

    pub fn fifo_hold_usecs(&self) -> u64 {
        self.fifo.shared().hold_usecs.load(Ordering::Relaxed)
    }

    pub fn set_fifo_hold_usecs(&self, usecs: u64) {
        self.fifo.shared().hold_usecs.store(usecs.max(1), Ordering::Relaxed);
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        self.fifo.stop();
        if let Err(e) = self.bus.release() {
            tracing::warn!("module: drop: bus release: {e}");
        }
    }
}

// ── Numbering ────────────────────────────────────────────────────────────────

/// A (logical number, physical slot) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NumberSlot {
    pub number: i32,
    pub slot: usize,
}

impl NumberSlot {
    pub fn new(number: i32, slot: usize) -> Self {
        Self { number, slot }
    }
}

/// Bind logical numbers to modules by slot. Modules whose slot is not in
/// the map are left with number -1.
///
/// # Errors
///
/// `ModuleSlotInvalid` when the map names a slot no module occupies.
pub fn assign(modules: &[Arc<Module>], numbers: &[NumberSlot]) -> Result<()> {
    for ns in numbers {
        if !modules.iter().any(|m| m.slot() == ns.slot) {
            return Err(Error::ModuleSlotInvalid { slot: ns.slot });
        }
    }
    for module in modules {
        let slot = module.slot();
        let number = numbers
            .iter()
            .find(|ns| ns.slot == slot)
            .map_or(-1, |ns| ns.number);
        module.set_number(number);
    }
    Ok(())
}

/// Sort modules by logical number.
pub fn order_by_number(modules: &mut [Arc<Module>]) {
    modules.sort_by_key(|m| m.number());
}

/// Sort modules by physical slot.
pub fn order_by_slot(modules: &mut [Arc<Module>]) {
    modules.sort_by_key(|m| m.slot());
}

/// Number modules by ascending slot order.
pub fn set_number_by_slot(modules: &mut [Arc<Module>]) {
    order_by_slot(modules);
    for (index, module) in modules.iter().enumerate() {
        module.set_number(index as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module() -> Module {
        Module::new(Arc::new(Backplane::new()), false)
    }

    #[test]
    fn new_module_is_unbound() {
        let m = module();
        assert!(!m.present());
        assert!(!m.online());
        assert_eq!(m.number(), -1);
        assert!(m.online_check().is_err());
    }

    #[test]
    fn offline_errors_carry_identity() {
        let m = module();
        m.set_number(4);
        let err = m.online_check().unwrap_err();
        assert!(matches!(err, Error::ModuleOffline { number: 4, .. }));
    }

    #[test]
    fn var_cache_without_hardware() {
        // With no bus bound, io writes are dropped by the port but the
        // cache still tracks values and dirty state.
        let m = module();
        {
            let mut core = m.core.lock();
            core.num_channels = 4;
            core.channels = (0..4)
                .map(|c| {
                    Channel::new(c, dpm_hw::ChannelConfig::new(c, dpm_hw::DbKind::Mainboard, 14, 250, 2))
                })
                .collect();
        }
        m.write_module_var(ModuleVar::MaxEvents, 42, 0, false).unwrap();
        assert_eq!(m.read_module_var(ModuleVar::MaxEvents, 0, false).unwrap(), 42);
        let core = m.core.lock();
        assert!(core.module_vars[ModuleVar::MaxEvents as usize].cells[0].dirty);
    }

    #[test]
    fn sync_clears_every_dirty_flag() {
        let m = module();
        {
            let mut core = m.core.lock();
            core.num_channels = 2;
            core.channels = (0..2)
                .map(|c| {
                    Channel::new(c, dpm_hw::ChannelConfig::new(c, dpm_hw::DbKind::Mainboard, 14, 250, 2))
                })
                .collect();
        }
        m.write_module_var(ModuleVar::MaxEvents, 1, 0, false).unwrap();
        m.write_module_var(ModuleVar::UserIn, 2, 7, false).unwrap();
        m.write_channel_var(ChannelVar::FastGap, 3, 1, false).unwrap();

        let mut core = m.core.lock();
        core.sync_to_dsp(&m.bus).unwrap();
        let clean = core
            .module_vars
            .iter()
            .flat_map(|slot| &slot.cells)
            .chain(core.channels.iter().flat_map(|c| c.vars.iter().flat_map(|s| &s.cells)))
            .all(|cell| !cell.dirty);
        assert!(clean);
    }

    #[test]
    fn channel_params_convert_units() {
        let m = module();
        {
            let mut core = m.core.lock();
            core.num_channels = 2;
            core.channels = (0..2)
                .map(|c| {
                    Channel::new(c, dpm_hw::ChannelConfig::new(c, dpm_hw::DbKind::Mainboard, 14, 250, 2))
                })
                .collect();
        }

        m.write_channel_param(param::ChannelParam::Voffset, 0, -1.5).unwrap();
        assert_eq!(m.read_channel_var(ChannelVar::OffsetDac, 0, false).unwrap(), 65535);
        let volts = m.read_channel_param(param::ChannelParam::Voffset, 0).unwrap();
        assert!((volts + 1.5).abs() < 1e-3);
        assert!(m.write_channel_param(param::ChannelParam::Voffset, 0, 2.0).is_err());

        // 0.16 µs at 125 MHz with filter range 0 is 20 FPGA ticks.
        m.write_channel_param(param::ChannelParam::TriggerRisetime, 0, 0.16).unwrap();
        assert_eq!(m.read_channel_var(ChannelVar::FastLength, 0, false).unwrap(), 20);
        let risetime = m.read_channel_param(param::ChannelParam::TriggerRisetime, 0).unwrap();
        assert!((risetime - 0.16).abs() < 1e-6);

        // Threshold scales by the fast filter length.
        m.write_channel_param(param::ChannelParam::TriggerThreshold, 0, 50.0).unwrap();
        assert_eq!(m.read_channel_var(ChannelVar::FastThresh, 0, false).unwrap(), 1000);

        assert!(matches!(
            m.write_channel_param(param::ChannelParam::Voffset, 5, 0.0),
            Err(Error::ChannelNumberInvalid { channel: 5, .. })
        ));
    }

    #[test]
    fn read_only_vars_reject_writes() {
        let m = module();
        let err = m.write_module_var(ModuleVar::RealTimeA, 1, 0, false).unwrap_err();
        assert!(matches!(err, Error::InvalidValue { .. }));
    }

    #[test]
    fn filter_range_validation() {
        let m = module();
        assert!(m.write_module_var(ModuleVar::SlowFilterRange, 0, 0, false).is_err());
        assert!(m.write_module_var(ModuleVar::SlowFilterRange, 7, 0, false).is_err());
        assert!(m.write_module_var(ModuleVar::SlowFilterRange, 3, 0, false).is_ok());
        assert!(m.write_module_var(ModuleVar::FastFilterRange, 7, 0, false).is_err());
        assert!(m.write_module_var(ModuleVar::FastFilterRange, 0, 0, false).is_ok());
    }

    #[test]
    fn numbering_by_slot() {
        let backplane = Arc::new(Backplane::new());
        let mods: Vec<Arc<Module>> = (0..3)
            .map(|i| {
                let m = Module::new(Arc::clone(&backplane), false);
                m.core.lock().slot = 10 - i; // slots 10, 9, 8
                Arc::new(m)
            })
            .collect();
        let mut mods = mods;
        set_number_by_slot(&mut mods);
        assert_eq!(mods[0].slot(), 8);
        assert_eq!(mods[0].number(), 0);
        assert_eq!(mods[2].slot(), 10);
        assert_eq!(mods[2].number(), 2);
    }

    #[test]
    fn assign_rejects_unknown_slots() {
        let backplane = Arc::new(Backplane::new());
        let m = Module::new(Arc::clone(&backplane), false);
        m.core.lock().slot = 2;
        let mods = vec![Arc::new(m)];
        let err = assign(&mods, &[NumberSlot::new(0, 5)]).unwrap_err();
        assert!(matches!(err, Error::ModuleSlotInvalid { slot: 5 }));
        assign(&mods, &[NumberSlot::new(7, 2)]).unwrap();
        assert_eq!(mods[0].number(), 7);
    }
}
