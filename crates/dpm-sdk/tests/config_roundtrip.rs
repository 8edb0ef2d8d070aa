//! Configuration import/export: default-template padding, identity
//! overrides, round trips, and the DMA/variable round-trip properties.

mod common;

use dpm_sdk::prelude::*;
use serde_json::json;

const DEFS: &str = "\
device-number=0,slot=2,revision=17,crate-revision=5,eeprom-format=2,serial-num=600,\
num-channels=8,adc-bits=14,adc-msps=250,adc-clk-div=2
device-number=1,slot=7,revision=17,crate-revision=5,eeprom-format=2,serial-num=601,\
num-channels=8,adc-bits=14,adc-msps=250,adc-clk-div=2
";

fn booted_crate() -> Crate {
    common::load_defs_once(DEFS);
    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();
    common::register_firmware(&crate_, 17, 250, 14);
    crate_.set_firmware().unwrap();
    crate_.boot(&BootParams::default()).unwrap();
    crate_
}

#[test]
fn short_config_pads_with_the_default_template() {
    let _guard = common::lock();
    let crate_ = booted_crate();

    // One entry for a two-module crate: the second module receives the
    // built-in template.
    let config = json!([{
        "metadata": { "hardware_revision": "H", "slot": 2 },
        "module": { "input": { "MaxEvents": 5 } },
        "channel": { "input": { "FastThresh": [2500] } }
    }]);
    let path = common::temp_path("short-config.json");
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

    let loaded = crate_.import_config(&path).unwrap();
    std::fs::remove_file(&path).ok();

    // Every online module was loaded.
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0], NumberSlot::new(0, 2));
    assert_eq!(loaded[1], NumberSlot::new(1, 7));

    let first = crate_.module_handle(0, HandleCheck::Online).unwrap();
    assert_eq!(first.read_module_var(ModuleVar::MaxEvents, 0, false).unwrap(), 5);
    // The single-element channel array was replicated across channels.
    for channel in 0..8 {
        assert_eq!(
            first.read_channel_var(ChannelVar::FastThresh, channel, false).unwrap(),
            2500
        );
    }

    // The padded module carries the template values.
    let second = crate_.module_handle(1, HandleCheck::Online).unwrap();
    assert_eq!(
        second.read_channel_var(ChannelVar::OffsetDac, 0, false).unwrap(),
        34952
    );
    assert_eq!(second.read_module_var(ModuleVar::SlowFilterRange, 0, false).unwrap(), 3);

    crate_.shutdown().unwrap();
}

#[test]
fn slot_and_number_are_overridden_from_the_module() {
    let _guard = common::lock();
    let crate_ = booted_crate();

    let mut entry = dpm_sdk::config::default_config();
    entry["module"]["input"]["SlotID"] = json!(99);
    entry["module"]["input"]["ModNum"] = json!(42);
    let config = json!([entry.clone(), entry]);
    let path = common::temp_path("override-config.json");
    std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

    crate_.import_config(&path).unwrap();
    std::fs::remove_file(&path).ok();

    for number in 0..2 {
        let module = crate_.module_handle(number, HandleCheck::Online).unwrap();
        assert_eq!(
            module.read_module_var(ModuleVar::SlotId, 0, false).unwrap(),
            module.slot() as u32
        );
        assert_eq!(
            module.read_module_var(ModuleVar::ModNum, 0, false).unwrap(),
            number as u32
        );
    }

    crate_.shutdown().unwrap();
}

#[test]
fn export_then_import_restores_writable_variables() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();

    module.write_module_var(ModuleVar::MaxEvents, 7, 0, false).unwrap();
    module.write_module_var(ModuleVar::CoincWait, 13, 0, false).unwrap();
    for channel in 0..8 {
        module
            .write_channel_var(ChannelVar::FastThresh, 1234 + channel as u32, channel, false)
            .unwrap();
    }
    module.sync_vars(SyncDirection::ToDsp).unwrap();

    let path = common::temp_path("round-trip.json");
    crate_.export_config(&path).unwrap();

    // Disturb the values, then restore them from the export.
    module.write_module_var(ModuleVar::MaxEvents, 9, 0, true).unwrap();
    for channel in 0..8 {
        module.write_channel_var(ChannelVar::FastThresh, 1, channel, true).unwrap();
    }

    crate_.import_config(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(module.read_module_var(ModuleVar::MaxEvents, 0, false).unwrap(), 7);
    assert_eq!(module.read_module_var(ModuleVar::CoincWait, 0, false).unwrap(), 13);
    for channel in 0..8 {
        assert_eq!(
            module.read_channel_var(ChannelVar::FastThresh, channel, false).unwrap(),
            1234 + channel as u32
        );
    }

    crate_.shutdown().unwrap();
}

#[test]
fn variable_round_trip_through_the_dsp() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();

    module.write_module_var(ModuleVar::CoincPattern, 0xfeed, 0, false).unwrap();
    module.write_module_var(ModuleVar::HostIo, 0xbeef, 3, false).unwrap();
    module.write_channel_var(ChannelVar::SlowLength, 25, 5, false).unwrap();
    module.sync_vars(SyncDirection::ToDsp).unwrap();

    assert_eq!(module.read_module_var(ModuleVar::CoincPattern, 0, true).unwrap(), 0xfeed);
    assert_eq!(module.read_module_var(ModuleVar::HostIo, 3, true).unwrap(), 0xbeef);
    assert_eq!(module.read_channel_var(ChannelVar::SlowLength, 5, true).unwrap(), 25);

    // String-keyed access reaches the same cells.
    assert_eq!(module.read_var("CoincPattern", 0, true).unwrap(), 0xfeed);
    module.write_var("SlowLength", 30, 5, true).unwrap();
    assert_eq!(module.read_channel_var(ChannelVar::SlowLength, 5, false).unwrap(), 30);
    assert!(module.read_var("NoSuchVar", 0, false).is_err());

    crate_.shutdown().unwrap();
}

#[test]
fn dma_ramp_round_trip() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();

    // Scratch region of DSP memory, clear of the I/O buffer and variables.
    let base = 0x0002_0000u32;
    let n = 8192usize;
    for i in 0..n {
        module
            .write_word(dpm_hw::regs::DSP_ADDR, base + i as u32)
            .unwrap();
        module
            .write_word(dpm_hw::regs::DSP_DATA, 0x0100_0000 | i as u32)
            .unwrap();
    }

    let mut readback = vec![0u32; n];
    module
        .dma_read(dpm_hw::regs::DSP_MEM + base, &mut readback)
        .unwrap();
    for (i, &word) in readback.iter().enumerate() {
        assert_eq!(word, 0x0100_0000 | i as u32);
    }

    crate_.shutdown().unwrap();
}

#[test]
fn parse_failures_are_fatal() {
    let _guard = common::lock();
    let crate_ = booted_crate();

    let path = common::temp_path("broken.json");
    std::fs::write(&path, "{ not json ]").unwrap();
    let err = crate_.import_config(&path).unwrap_err();
    std::fs::remove_file(&path).ok();
    assert!(matches!(err, Error::ConfigJson { .. }));

    assert!(matches!(
        crate_.import_config("/nonexistent/config.json"),
        Err(Error::FileOpen { .. })
    ));

    crate_.shutdown().unwrap();
}
