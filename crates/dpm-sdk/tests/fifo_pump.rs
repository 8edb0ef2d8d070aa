//! The FIFO pump against a synthesized word source: no loss, ordering,
//! buffer conservation, and overflow accounting under pool pressure.

mod common;

use std::time::Duration;

use dpm_sdk::prelude::*;

const DEFS: &str = "\
device-number=0,slot=3,revision=15,crate-revision=5,eeprom-format=2,serial-num=777,\
num-channels=4,adc-bits=12,adc-msps=100,adc-clk-div=1
";

const BLOCK: usize = 8192;

fn booted_crate() -> Crate {
    common::load_defs_once(DEFS);
    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();
    common::register_firmware(&crate_, 15, 100, 12);
    crate_.set_firmware().unwrap();
    crate_.boot(&BootParams::default()).unwrap();
    crate_
}

#[test]
fn pump_delivers_every_word_in_order() {
    let _guard = common::lock();
    let crate_ = booted_crate();
    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();
    module.set_fifo_hold_usecs(20_000);

    let state = dpm_sdk::sim::state(0).unwrap();
    module.start_listmode(RunMode::New).unwrap();
    assert!(state.run_active());
    assert!(module.run_active());

    // 25 full blocks plus a partial tail, 8192 words every 4 ms.
    let total = 25 * BLOCK + 1000;
    let producer = {
        let state = std::sync::Arc::clone(&state);
        std::thread::spawn(move || {
            let mut next = 0u32;
            while (next as usize) < total {
                let batch = BLOCK.min(total - next as usize);
                let words: Vec<u32> = (next..next + batch as u32).collect();
                state.push_fifo(&words);
                next += batch as u32;
                std::thread::sleep(Duration::from_millis(4));
            }
        })
    };

    // Reader polls every 20 ms while the run is active.
    let mut collected: Vec<u32> = Vec::with_capacity(total);
    let mut chunk = vec![0u32; 4 * BLOCK];
    while !producer.is_finished() {
        let n = module.read_list_mode(&mut chunk).unwrap();
        collected.extend_from_slice(&chunk[..n]);
        std::thread::sleep(Duration::from_millis(20));
    }
    producer.join().unwrap();

    module.run_end().unwrap();
    assert!(!state.run_active());

    // Drain whatever the worker still holds queued.
    let mut idle_reads = 0;
    while idle_reads < 3 {
        let n = module.read_list_mode(&mut chunk).unwrap();
        if n == 0 {
            idle_reads += 1;
            std::thread::sleep(Duration::from_millis(25));
        } else {
            idle_reads = 0;
            collected.extend_from_slice(&chunk[..n]);
        }
    }

    assert_eq!(collected.len(), total, "consumed equals produced");
    for (i, &word) in collected.iter().enumerate() {
        assert_eq!(word, i as u32, "words arrive exactly once, in order");
    }

    let stats = module.read_stats();
    assert_eq!(stats.fifo_overflows, 0);
    assert_eq!(stats.fifo_dma_words, total as u64);
    assert_eq!(stats.list_mode_words_read, total as u64);
    assert_eq!(module.read_list_mode_level().unwrap(), 0);

    crate_.shutdown().unwrap();
}

#[test]
fn pool_pressure_records_overflow_without_loss() {
    let _guard = common::lock();
    common::load_defs_once(DEFS);

    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();
    common::register_firmware(&crate_, 15, 100, 12);
    crate_.set_firmware().unwrap();

    // Shrink the pool before the FIFO services start.
    crate_.module(0).unwrap().set_fifo_buffers(4);
    crate_.boot(&BootParams::default()).unwrap();

    let module = crate_.module_handle(0, HandleCheck::Online).unwrap();
    let state = dpm_sdk::sim::state(0).unwrap();
    module.start_listmode(RunMode::New).unwrap();

    // Six full blocks swamp a four-buffer pool; full blocks cannot be
    // compacted, so the worker must hold data in the hardware FIFO and
    // record the starvation.
    let total = 6 * BLOCK;
    let words: Vec<u32> = (0..total as u32).collect();
    state.push_fifo(&words);

    // Give the worker time to hit the exhausted pool.
    std::thread::sleep(Duration::from_millis(50));

    let mut collected: Vec<u32> = Vec::with_capacity(total);
    let mut chunk = vec![0u32; BLOCK];
    let mut idle_reads = 0;
    while collected.len() < total && idle_reads < 50 {
        let n = module.read_list_mode(&mut chunk).unwrap();
        if n == 0 {
            idle_reads += 1;
        } else {
            idle_reads = 0;
            collected.extend_from_slice(&chunk[..n]);
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(collected.len(), total, "nothing dropped under pressure");
    for (i, &word) in collected.iter().enumerate() {
        assert_eq!(word, i as u32);
    }
    assert!(module.read_stats().fifo_overflows > 0, "starvation was recorded");

    module.run_end().unwrap();
    crate_.shutdown().unwrap();
}

#[test]
fn reader_requires_online_module() {
    let _guard = common::lock();
    common::load_defs_once(DEFS);

    let crate_ = Crate::new(BackendSelection::Sim);
    crate_.initialize(false).unwrap();

    let module = crate_.module(0).unwrap();
    let mut chunk = vec![0u32; 16];
    assert!(matches!(
        module.read_list_mode(&mut chunk),
        Err(Error::ModuleOffline { .. })
    ));
    assert!(matches!(
        module.read_list_mode_level(),
        Err(Error::ModuleOffline { .. })
    ));

    crate_.shutdown().unwrap();
}
