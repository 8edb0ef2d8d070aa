//! AFE calibration against the simulated analog model: swap detection,
//! offset-DAC convergence, and trace readout.

mod common;

use dpm_sdk::prelude::*;

const DEFS: &str = "\
device-number=0,slot=2,revision=17,crate-revision=5,eeprom-format=2,serial-num=1042,\
num-channels=8,adc-bits=14,adc-msps=250,adc-clk-div=2
";

const ADC_BITS: u32 = 14;
const FULL_SCALE: i64 = 1 << ADC_BITS;
/// 0.5% of full scale, the default baseline noise tolerance.
const NOISE_COUNTS: i64 = FULL_SCALE / 200;

fn booted_crate() -> Crate {
    common::load_defs_once(DEFS);
    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();
    common::register_firmware(&crate_, 17, 250, 14);
    crate_.set_firmware().unwrap();
    crate_.boot(&BootParams::default()).unwrap();
    crate_
}

/// Baseline the sim produces for an applied DAC code.
fn baseline_of(dac: u32) -> i64 {
    i64::from((0xffff - dac.min(0xffff)) >> (16 - ADC_BITS))
}

#[test]
fn offsets_converge_to_target() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();

    // BaselinePercent defaults to 10: target = 16384 * 10% = 1638.
    let target = FULL_SCALE / 10;

    module.adjust_offsets().unwrap();

    let state = dpm_sdk::sim::state(0).unwrap();
    for channel in 0..8 {
        let dac = state.dac(channel);
        let error = (baseline_of(dac) - target).abs();
        assert!(
            error <= NOISE_COUNTS,
            "channel {channel}: baseline {} vs target {target}",
            baseline_of(dac)
        );
        // The final code was written back to the OffsetDAC variable.
        let var = module.read_channel_var(ChannelVar::OffsetDac, channel, false).unwrap();
        assert_eq!(var, dac);
        // And pushed through to the DSP.
        let dsp = module.read_channel_var(ChannelVar::OffsetDac, channel, true).unwrap();
        assert_eq!(dsp, dac);
    }

    crate_.shutdown().unwrap();
}

#[test]
fn swap_detection_compensates_wired_pairs() {
    let _guard = common::lock();
    common::load_defs_once(DEFS);

    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();
    common::register_firmware(&crate_, 17, 250, 14);
    crate_.set_firmware().unwrap();

    // Pairs {0,1} and {4,5} are wired on the wrong clock edge.
    let state = dpm_sdk::sim::state(0).unwrap();
    for channel in [0, 1, 4, 5] {
        state.set_swapped_wiring(channel, true);
    }

    crate_.boot(&BootParams::default()).unwrap();
    assert!(crate_.module(0).unwrap().online());

    // One compensation bit per affected pair: offsets 0/1 share bit 0,
    // offsets 4/5 share bit 2.
    assert_eq!(state.adcctrl(0), 0b101);

    crate_.shutdown().unwrap();
}

#[test]
fn clean_wiring_needs_no_compensation() {
    let _guard = common::lock();
    let crate_ = booted_crate();

    let state = dpm_sdk::sim::state(0).unwrap();
    assert_eq!(state.adcctrl(0), 0);

    crate_.shutdown().unwrap();
}

#[test]
fn trace_readout_sits_at_the_baseline() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();

    let mut trace = vec![0u16; 8192];
    let n = module.read_adc(3, &mut trace, true).unwrap();
    assert_eq!(n, 8192);

    let state = dpm_sdk::sim::state(0).unwrap();
    let baseline = baseline_of(state.dac(3));
    for &sample in &trace {
        assert!((i64::from(sample) - baseline).abs() <= 1);
    }

    assert!(matches!(
        module.read_adc(8, &mut trace, false),
        Err(Error::ChannelNumberInvalid { channel: 8, .. })
    ));

    crate_.shutdown().unwrap();
}

#[test]
fn initialize_afe_runs_the_full_front_end() {
    let _guard = common::lock();
    let crate_ = booted_crate();

    crate_.initialize_afe().unwrap();

    let target = FULL_SCALE / 10;
    let state = dpm_sdk::sim::state(0).unwrap();
    for channel in 0..8 {
        let error = (baseline_of(state.dac(channel)) - target).abs();
        assert!(error <= NOISE_COUNTS, "channel {channel}");
    }

    crate_.shutdown().unwrap();
}
