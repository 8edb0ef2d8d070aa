//! Shared test plumbing: sim module definitions, firmware registration, and
//! a serialization lock. The sim registry and device-state table are
//! process-wide, so tests within one binary take the lock to keep their
//! device states to themselves.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use dpm_sdk::prelude::*;

/// Serialize tests that open simulated devices.
pub fn lock() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Load the binary's module definitions exactly once.
pub fn load_defs_once(defs: &str) {
    static LOADED: OnceLock<()> = OnceLock::new();
    LOADED.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init()
            .ok();
        dpm_sdk::sim::load_module_defs_str(defs).expect("load module defs");
    });
}

/// Register a full image set for one hardware tag.
pub fn register_firmware(crate_: &Crate, revision: i32, adc_msps: u32, adc_bits: u32) {
    let tag = FirmwareTag { revision, adc_msps, adc_bits };
    let images = [
        (FirmwareKind::Comms, "comms.bin"),
        (FirmwareKind::Fippi, "fippi.bin"),
        (FirmwareKind::Dsp, "dsp.ldr"),
        (FirmwareKind::Var, "dsp.var"),
    ];
    for (kind, file) in images {
        crate_.register_firmware(FirmwareImage::new(tag, kind, "1.0.0", file, vec![0u8; 256]));
    }
}

/// A unique temp file path for config export tests.
pub fn temp_path(name: &str) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("dpm-sdk-test-{}-{name}", std::process::id()));
    path.to_string_lossy().into_owned()
}
