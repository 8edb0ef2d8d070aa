//! The crate: a series of slots holding modules.
//!
//! The crate owns the online and offline module lists, the backplane, and
//! the firmware registry, all behind one crate lock. Lifecycle operations
//! (initialize, shutdown, boot, assign, config import) hold it exclusively;
//! per-module data operations go through a [`ModuleHandle`], which takes a
//! crate user token and works against the module's own locking so distinct
//! modules proceed in parallel.
//!
//! Lock order is strictly crate, then module, then bus. Worker threads
//! spawned by boot and AFE initialization touch only their own module.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use dpm_hw::MAX_SLOTS;

use crate::backends::BackendSelection;
use crate::backplane::Backplane;
use crate::config;
use crate::error::{Error, ErrorKind, Result};
use crate::firmware::{FirmwareImage, FirmwareRegistry, FirmwareTag};
use crate::module::{self, Module, NumberSlot};

/// Boot settings. Defaults to a forced full boot of all modules.
#[derive(Debug, Clone)]
pub struct BootParams {
    /// Boot modules that are already online; when false only offline
    /// modules boot.
    pub force: bool,
    /// Clear and load the comms FPGA.
    pub boot_comms: bool,
    /// Clear and load the signal FPGA.
    pub boot_fippi: bool,
    /// Reset and load the DSP.
    pub boot_dsp: bool,
    /// Module numbers to boot; empty means all.
    pub modules: Vec<usize>,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            force: true,
            boot_comms: true,
            boot_fippi: true,
            boot_dsp: true,
            modules: Vec::new(),
        }
    }
}

/// Which state a [`ModuleHandle`] requires of its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleCheck {
    #[default]
    Online,
    Present,
    None,
}

#[derive(Debug)]
struct CrateInner {
    modules: Vec<Arc<Module>>,
    offline: Vec<Arc<Module>>,
    backplane: Arc<Backplane>,
    firmware: FirmwareRegistry,
    revision: i32,
}

/// A crate of modules.
#[derive(Debug)]
pub struct Crate {
    inner: Mutex<CrateInner>,
    selection: BackendSelection,
    ready: AtomicBool,
    users: AtomicI32,
}

impl Default for Crate {
    fn default() -> Self {
        Self::new(BackendSelection::default())
    }
}

impl Crate {
    pub fn new(selection: BackendSelection) -> Self {
        Self {
            inner: Mutex::new(CrateInner {
                modules: Vec::new(),
                offline: Vec::new(),
                backplane: Arc::new(Backplane::new()),
                firmware: FirmwareRegistry::new(),
                revision: -1,
            }),
            selection,
            ready: AtomicBool::new(false),
            users: AtomicI32::new(0),
        }
    }

    // ── Readiness and the user gate ──────────────────────────────────────────

    /// Check the crate has been initialized and is ready for use.
    ///
    /// # Errors
    ///
    /// `CrateNotReady` until `initialize` succeeds.
    pub fn ready(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::CrateNotReady)
        }
    }

    /// True while any user token is held.
    pub fn busy(&self) -> bool {
        self.users.load(Ordering::Acquire) > 0
    }

    /// Number of active users.
    pub fn users(&self) -> i32 {
        self.users.load(Ordering::Acquire)
    }

    /// Take a user token, allowing concurrent module access while the
    /// crate tracks activity.
    pub fn user(&self) -> CrateUser<'_> {
        self.users.fetch_add(1, Ordering::AcqRel);
        CrateUser { crate_: self }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Enumerate the bus, open every module, and make the crate ready.
    ///
    /// Probing stops at the first absent device. Modules that respond but
    /// cannot be opened are kept on the offline list. All present modules
    /// must agree on the crate revision; a mismatch only logs a warning.
    ///
    /// # Errors
    ///
    /// `CrateAlreadyOpen` when already initialized; enumeration failures
    /// return the crate to the uninitialized state.
    pub fn initialize(&self, reg_trace: bool) -> Result<()> {
        tracing::info!("crate: initialize");
        if self.ready.swap(true, Ordering::AcqRel) {
            return Err(Error::CrateAlreadyOpen);
        }

        let mut inner = self.inner.lock();
        let enumerated = Self::enumerate(self.selection, &mut inner, reg_trace);
        if enumerated.is_err() {
            self.ready.store(false, Ordering::Release);
        }
        enumerated
    }

    fn enumerate(
        selection: BackendSelection,
        inner: &mut CrateInner,
        reg_trace: bool,
    ) -> Result<()> {
        for device_number in 0..MAX_SLOTS {
            let module = Arc::new(Module::new(Arc::clone(&inner.backplane), reg_trace));
            match module.open(selection, device_number) {
                Ok(()) => {
                    tracing::info!(
                        "module: device {device_number}: slot={} serial={} rev={}",
                        module.slot(),
                        module.serial(),
                        module.revision_label()
                    );
                    inner.modules.push(module);
                }
                Err(Error::ModuleNotFound { .. }) => break,
                Err(e) => {
                    tracing::error!("module: device {device_number}: error: {e}");
                    inner.offline.push(module);
                }
            }
        }

        inner
            .backplane
            .init(inner.modules.len() + inner.offline.len());

        Self::check_revision(inner);
        Self::check_slots(inner);

        module::set_number_by_slot(&mut inner.modules);
        tracing::info!("crate: {} modules, {} offline", inner.modules.len(), inner.offline.len());
        Ok(())
    }

    /// All present modules must report the same crate revision; the first
    /// one wins and mismatches warn.
    fn check_revision(inner: &mut CrateInner) {
        inner.revision = -1;
        for module in inner.modules.iter().chain(&inner.offline) {
            if !module.present() {
                continue;
            }
            let rev = module.crate_revision();
            if inner.revision < 0 {
                inner.revision = rev;
                tracing::info!("crate: crate revision: {rev}");
            } else if inner.revision != rev {
                tracing::warn!(
                    "crate: crate revision mismatch: {rev} module slot={}",
                    module.slot()
                );
            }
        }
    }

    /// Detect duplicate slot numbers. Crate revision 2 had a backplane
    /// strapping fault that reports slot 5 twice; the module in PCI slot 13
    /// is actually in slot 4. Surviving duplicates log an error but do not
    /// fail initialization.
    fn check_slots(inner: &mut CrateInner) {
        let all: Vec<Arc<Module>> = inner
            .modules
            .iter()
            .chain(&inner.offline)
            .filter(|m| m.present())
            .cloned()
            .collect();

        let mut dups: Vec<(Arc<Module>, Arc<Module>)> = Vec::new();
        for (i, a) in all.iter().enumerate() {
            for b in all.iter().skip(i + 1) {
                if a.slot() == b.slot() && !dups.iter().any(|(d, _)| d.slot() == a.slot()) {
                    dups.push((Arc::clone(a), Arc::clone(b)));
                }
            }
        }

        for (a, b) in dups {
            if inner.revision == 2 && a.slot() == 5 && a.pci_bus() == b.pci_bus() {
                if a.pci_slot() == 13 {
                    a.set_slot(4);
                } else if b.pci_slot() == 13 {
                    b.set_slot(4);
                }
            }
            if a.slot() == b.slot() {
                tracing::error!(
                    "crate: duplicate slot: {} 1:pci={}:{} 2:pci={}:{}",
                    a.slot(),
                    a.pci_bus(),
                    a.pci_slot(),
                    b.pci_bus(),
                    b.pci_slot()
                );
            }
        }
    }

    /// Close every module and leave the crate uninitialized. The first
    /// error is surfaced after every module has been closed.
    pub fn shutdown(&self) -> Result<()> {
        tracing::info!("crate: shutdown");
        let mut inner = self.inner.lock();
        let mut first_error: Option<ErrorKind> = None;
        for module in inner.modules.iter().chain(&inner.offline) {
            if let Err(e) = module.close() {
                tracing::error!("crate: shutdown: {e}");
                first_error.get_or_insert(e.kind());
            }
        }
        inner.modules.clear();
        inner.offline.clear();
        self.ready.store(false, Ordering::Release);
        match first_error {
            Some(kind) => Err(kind.into_error("crate shutdown error; see log")),
            None => Ok(()),
        }
    }

    // ── Lookup ───────────────────────────────────────────────────────────────

    /// Number of online modules.
    pub fn num_modules(&self) -> usize {
        self.inner.lock().modules.len()
    }

    /// Crate revision reported by the modules, -1 when empty.
    pub fn revision(&self) -> i32 {
        self.inner.lock().revision
    }

    /// The module at a logical number.
    ///
    /// # Errors
    ///
    /// `ModuleNumberInvalid` when out of range.
    pub fn module(&self, number: usize) -> Result<Arc<Module>> {
        let inner = self.inner.lock();
        inner
            .modules
            .get(number)
            .cloned()
            .ok_or(Error::ModuleNumberInvalid {
                number: number as i32,
                count: inner.modules.len(),
            })
    }

    /// Find a module by physical slot, online list first.
    ///
    /// # Errors
    ///
    /// `ModuleSlotInvalid` when no module occupies the slot.
    pub fn find(&self, slot: usize) -> Result<Arc<Module>> {
        let inner = self.inner.lock();
        inner
            .modules
            .iter()
            .chain(&inner.offline)
            .find(|m| m.slot() == slot)
            .cloned()
            .ok_or(Error::ModuleSlotInvalid { slot })
    }

    /// A handle for per-module operations: user token plus state check.
    ///
    /// # Errors
    ///
    /// `CrateNotReady`, `ModuleNumberInvalid`, or `ModuleOffline` per the
    /// requested check.
    pub fn module_handle(&self, number: usize, check: HandleCheck) -> Result<ModuleHandle<'_>> {
        self.ready()?;
        let module = self.module(number)?;
        let user = self.user();
        match check {
            HandleCheck::Online => module.online_check()?,
            HandleCheck::Present => {
                if !module.present() {
                    return Err(Error::module_offline(module.number(), module.slot()));
                }
            }
            HandleCheck::None => {}
        }
        Ok(ModuleHandle { module, _user: user })
    }

    /// The crate's backplane.
    pub fn backplane(&self) -> Arc<Backplane> {
        Arc::clone(&self.inner.lock().backplane)
    }

    // ── Probe and boot ───────────────────────────────────────────────────────

    /// Probe every online-listed module; true when all are online.
    pub fn probe(&self) -> Result<bool> {
        tracing::info!("crate: probe");
        self.ready()?;
        let inner = self.inner.lock();
        let mut online = 0;
        for module in &inner.modules {
            if module.probe()? {
                online += 1;
            }
        }
        inner.backplane.reinit(&inner.modules, &inner.offline);
        Ok(online == inner.modules.len())
    }

    /// Boot modules in parallel, one worker per target.
    ///
    /// Workers publish their outcome through a channel; after joining all
    /// of them the backplane is reinitialized and the first error kind in
    /// module order is rethrown.
    pub fn boot(&self, params: &BootParams) -> Result<()> {
        tracing::info!(
            "crate: boot: force={} comms={} fippi={} dsp={}",
            params.force,
            params.boot_comms,
            params.boot_fippi,
            params.boot_dsp
        );
        self.ready()?;
        let inner = self.inner.lock();

        let numbers: Vec<usize> = if params.modules.is_empty() {
            (0..inner.modules.len()).collect()
        } else {
            for &number in &params.modules {
                if number >= inner.modules.len() {
                    return Err(Error::ModuleNumberInvalid {
                        number: number as i32,
                        count: inner.modules.len(),
                    });
                }
            }
            params.modules.clone()
        };

        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Option<ErrorKind>)>();
        let mut workers = Vec::new();

        for number in numbers {
            let module = Arc::clone(&inner.modules[number]);
            if !module.present() || (!params.force && module.online()) {
                continue;
            }
            let tx = tx.clone();
            let (comms, fippi, dsp) = (params.boot_comms, params.boot_fippi, params.boot_dsp);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("boot-{number}"))
                    .spawn(move || {
                        let outcome = match module.boot(comms, fippi, dsp) {
                            Ok(()) => None,
                            Err(e) => {
                                tracing::error!("module {number}: boot: {e}");
                                Some(e.kind())
                            }
                        };
                        let _ = tx.send((number, outcome));
                    })
                    .expect("spawn boot worker"),
            );
        }
        drop(tx);

        for worker in workers {
            let _ = worker.join();
        }
        let mut outcomes: Vec<(usize, Option<ErrorKind>)> = rx.iter().collect();
        outcomes.sort_by_key(|&(number, _)| number);
        let first_error = outcomes.into_iter().find_map(|(_, outcome)| outcome);

        inner.backplane.reinit(&inner.modules, &inner.offline);

        match first_error {
            Some(kind) => Err(kind.into_error("crate boot error; see log")),
            None => Ok(()),
        }
    }

    /// Run the AFE initialization on every online module in parallel.
    pub fn initialize_afe(&self) -> Result<()> {
        tracing::info!("crate: initializing analog front-end");
        self.ready()?;
        let inner = self.inner.lock();

        let (tx, rx) = crossbeam_channel::unbounded::<(usize, Option<ErrorKind>)>();
        let mut workers = Vec::new();

        for (number, module) in inner.modules.iter().enumerate() {
            if !module.online() {
                continue;
            }
            let module = Arc::clone(module);
            let tx = tx.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("afe-{number}"))
                    .spawn(move || {
                        let outcome = match module.sync_hw() {
                            Ok(()) => None,
                            Err(e) => {
                                tracing::error!("module {number}: afe: {e}");
                                Some(e.kind())
                            }
                        };
                        let _ = tx.send((number, outcome));
                    })
                    .expect("spawn afe worker"),
            );
        }
        drop(tx);

        for worker in workers {
            let _ = worker.join();
        }
        let mut outcomes: Vec<(usize, Option<ErrorKind>)> = rx.iter().collect();
        outcomes.sort_by_key(|&(number, _)| number);
        match outcomes.into_iter().find_map(|(_, outcome)| outcome) {
            Some(kind) => Err(kind.into_error("crate AFE initialize error; see log")),
            None => Ok(()),
        }
    }

    // ── Firmware ─────────────────────────────────────────────────────────────

    /// Add an image to the crate registry.
    pub fn register_firmware(&self, image: FirmwareImage) {
        self.inner.lock().firmware.add(image);
    }

    /// Bind registered firmware to every module by hardware tag.
    pub fn set_firmware(&self) -> Result<()> {
        tracing::info!("crate: set firmware");
        self.ready()?;
        let inner = self.inner.lock();
        for module in &inner.modules {
            let revision = module.revision();
            let mut tags: Vec<FirmwareTag> = module
                .channel_configs()
                .iter()
                .map(|c| FirmwareTag { revision, adc_msps: c.adc_msps, adc_bits: c.adc_bits })
                .collect();
            tags.dedup();
            for tag in tags {
                let images = inner.firmware.find(tag);
                if images.is_empty() {
                    tracing::warn!("{}: crate: module firmware not found: {tag}", module.label());
                } else {
                    module.add_firmware(images);
                }
            }
            if !module.has_firmware() {
                tracing::warn!("{}: no firmware set", module.label());
            }
        }
        Ok(())
    }

    // ── Offline management ───────────────────────────────────────────────────

    /// Force a module offline and move it to the offline list.
    ///
    /// # Errors
    ///
    /// `ModuleNumberInvalid` when the number is out of range.
    pub fn set_offline(&self, number: usize) -> Result<()> {
        tracing::info!("crate: set offline: module={number}");
        self.ready()?;
        let mut inner = self.inner.lock();
        if number >= inner.modules.len() {
            return Err(Error::ModuleNumberInvalid {
                number: number as i32,
                count: inner.modules.len(),
            });
        }
        let module = inner.modules.remove(number);
        module.force_offline();
        inner.offline.push(module);
        Ok(())
    }

    /// Move modules that have dropped offline out of the online list.
    pub fn move_offlines(&self) {
        tracing::info!("crate: move offline modules");
        let mut inner = self.inner.lock();
        let (online, offline): (Vec<_>, Vec<_>) =
            inner.modules.drain(..).partition(|m| m.online());
        inner.modules = online;
        for module in &offline {
            inner.backplane.offline(module.slot());
        }
        inner.offline.extend(offline);
    }

    /// Bind logical numbers to slots; modules not in the map are closed, or
    /// forced offline when `close` is false. Errors roll the numbering back
    /// to slot order.
    pub fn assign(&self, numbers: &[NumberSlot], close: bool) -> Result<()> {
        self.ready()?;
        let mut inner = self.inner.lock();
        let assigned = Self::assign_inner(&mut inner, numbers, close);
        if assigned.is_err() {
            module::set_number_by_slot(&mut inner.modules);
        }
        assigned
    }

    fn assign_inner(inner: &mut CrateInner, numbers: &[NumberSlot], close: bool) -> Result<()> {
        module::assign(&inner.modules, numbers)?;
        let (keep, unassigned): (Vec<_>, Vec<_>) =
            inner.modules.drain(..).partition(|m| m.number() != -1);
        inner.modules = keep;
        for module in unassigned {
            if close {
                module.close()?;
            } else {
                module.force_offline();
                inner.offline.push(module);
            }
        }
        module::order_by_number(&mut inner.modules);
        inner.backplane.reinit(&inner.modules, &inner.offline);
        Ok(())
    }

    // ── Configuration ────────────────────────────────────────────────────────

    /// Import a JSON configuration file; returns the modules loaded.
    pub fn import_config(&self, path: &str) -> Result<Vec<NumberSlot>> {
        tracing::info!("crate: import configuration");
        self.ready()?;
        let inner = self.inner.lock();
        let loaded = config::import_json(path, &inner.modules)?;
        for module in &inner.modules {
            if module.online() {
                module.sync_vars(crate::module::SyncDirection::ToDsp)?;
            }
        }
        inner.backplane.reinit(&inner.modules, &inner.offline);
        Ok(loaded)
    }

    /// Export the active module configurations to a JSON file.
    pub fn export_config(&self, path: &str) -> Result<()> {
        tracing::info!("crate: export configuration");
        self.ready()?;
        let inner = self.inner.lock();
        config::export_json(path, &inner.modules)
    }
}

impl fmt::Display for Crate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ready().is_err() {
            return write!(f, "not initialized");
        }
        let inner = self.inner.lock();
        writeln!(f, "fw: tags: {}", inner.firmware.len())?;
        writeln!(f, "modules: {}", inner.modules.len())?;
        for module in &inner.modules {
            writeln!(
                f,
                " {} serial={} rev={} channels={} online={}",
                module.label(),
                module.serial(),
                module.revision_label(),
                module.num_channels(),
                module.online()
            )?;
        }
        Ok(())
    }
}

/// Counts a crate user for the lifetime of the token.
pub struct CrateUser<'a> {
    crate_: &'a Crate,
}

impl Drop for CrateUser<'_> {
    fn drop(&mut self) {
        self.crate_.users.fetch_sub(1, Ordering::AcqRel);
    }
}

/// User token plus module access for the span of an operation.
pub struct ModuleHandle<'a> {
    module: Arc<Module>,
    _user: CrateUser<'a>,
}

impl std::ops::Deref for ModuleHandle<'_> {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_until_initialized() {
        let crate_ = Crate::new(BackendSelection::Sim);
        assert!(matches!(crate_.ready(), Err(Error::CrateNotReady)));
        assert_eq!(crate_.num_modules(), 0);
        assert!(crate_.module(0).is_err());
    }

    #[test]
    fn user_gate_counts() {
        let crate_ = Crate::new(BackendSelection::Sim);
        assert!(!crate_.busy());
        {
            let _a = crate_.user();
            let _b = crate_.user();
            assert_eq!(crate_.users(), 2);
            assert!(crate_.busy());
        }
        assert_eq!(crate_.users(), 0);
        assert!(!crate_.busy());
    }

    #[test]
    fn display_before_initialize() {
        let crate_ = Crate::new(BackendSelection::Sim);
        assert_eq!(crate_.to_string(), "not initialized");
    }
}
