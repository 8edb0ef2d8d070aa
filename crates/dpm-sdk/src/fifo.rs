//! The list-mode FIFO pump.
//!
//! Each online module runs one worker thread that drains the hardware FIFO
//! into a bounded pool of fixed-size buffers and publishes filled buffers to
//! a queue for `read_list_mode`. The worker adapts its poll period to the
//! run state, holds small amounts of data in the hardware FIFO up to the
//! hold time, and compacts the queue tail when the pool runs dry rather
//! than dropping data.
//!
//! Buffer conservation invariant: every buffer is in exactly one of the
//! pool, the queue, or the worker's hands, so
//! `pool + queue + in_flight == fifo_buffers` at all times.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use dpm_hw::{regs, Word, MAX_DMA_BLOCK_SIZE};

use crate::bus::BusPort;
use crate::error::Result;
use crate::module::ModuleFlags;
use crate::run::RunTask;
use crate::stats::Counters;

/// Default number of buffers in the pool.
pub const DEFAULT_FIFO_BUFFERS: usize = 100;
/// Default poll period while a run is active, in microseconds.
pub const DEFAULT_RUN_WAIT_USECS: u64 = 5_000;
/// Default idle poll ceiling, in microseconds.
pub const DEFAULT_IDLE_WAIT_USECS: u64 = 150_000;
/// Default hold time before partial reads, in microseconds.
pub const DEFAULT_HOLD_USECS: u64 = 100_000;

/// One fixed-capacity transfer buffer.
#[derive(Debug)]
struct Buffer {
    words: Vec<Word>,
    /// Read offset; only the queue head is ever partially consumed.
    start: usize,
}

impl Buffer {
    fn new() -> Self {
        Self { words: Vec::with_capacity(MAX_DMA_BLOCK_SIZE), start: 0 }
    }

    fn payload(&self) -> &[Word] {
        &self.words[self.start..]
    }

    fn len(&self) -> usize {
        self.words.len() - self.start
    }

    fn reset(&mut self) {
        self.words.clear();
        self.start = 0;
    }
}

#[derive(Debug)]
struct FifoData {
    pool: Vec<Buffer>,
    queue: VecDeque<Buffer>,
    in_flight: usize,
    last_publish: Instant,
}

#[derive(Debug)]
pub(crate) struct FifoShared {
    bus: Arc<BusPort>,
    flags: Arc<ModuleFlags>,
    counters: Arc<Counters>,
    running: AtomicBool,
    finished: AtomicBool,
    pub buffers: AtomicUsize,
    pub run_wait_usecs: AtomicU64,
    pub idle_wait_usecs: AtomicU64,
    pub hold_usecs: AtomicU64,
    data: Mutex<FifoData>,
    slot: AtomicUsize,
}

/// The per-module pump: tunables, buffer accounting, and the worker.
#[derive(Debug)]
pub(crate) struct FifoPump {
    shared: Arc<FifoShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FifoPump {
    pub fn new(bus: Arc<BusPort>, flags: Arc<ModuleFlags>, counters: Arc<Counters>) -> Self {
        Self {
            shared: Arc::new(FifoShared {
                bus,
                flags,
                counters,
                running: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                buffers: AtomicUsize::new(DEFAULT_FIFO_BUFFERS),
                run_wait_usecs: AtomicU64::new(DEFAULT_RUN_WAIT_USECS),
                idle_wait_usecs: AtomicU64::new(DEFAULT_IDLE_WAIT_USECS),
                hold_usecs: AtomicU64::new(DEFAULT_HOLD_USECS),
                data: Mutex::new(FifoData {
                    pool: Vec::new(),
                    queue: VecDeque::new(),
                    in_flight: 0,
                    last_publish: Instant::now(),
                }),
                slot: AtomicUsize::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn shared(&self) -> &Arc<FifoShared> {
        &self.shared
    }

    /// Allocate the pool, clear the queue, and start the worker.
    pub fn start(&self, slot: usize) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.slot.store(slot, Ordering::Relaxed);
        {
            let mut data = self.shared.data.lock();
            let buffers = self.shared.buffers.load(Ordering::Relaxed);
            data.pool = (0..buffers).map(|_| Buffer::new()).collect();
            data.queue.clear();
            data.in_flight = 0;
            data.last_publish = Instant::now();
        }
        self.shared.finished.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("fifo-slot-{slot}"))
            .spawn(move || worker(&shared))
            .expect("spawn fifo worker");
        *self.worker.lock() = Some(handle);
        tracing::info!("fifo: slot {slot}: worker started");
    }

    /// Stop the worker and release every buffer.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let mut data = self.shared.data.lock();
        data.pool.clear();
        data.queue.clear();
        data.in_flight = 0;
        tracing::info!(
            "fifo: slot {}: worker stopped",
            self.shared.slot.load(Ordering::Relaxed)
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire) && !self.shared.finished.load(Ordering::Acquire)
    }

    /// Total words waiting across queued buffers.
    pub fn level(&self) -> usize {
        self.shared.data.lock().queue.iter().map(Buffer::len).sum()
    }

    /// Drain up to `out.len()` words from the queue head. Non-blocking;
    /// returns the number of words copied.
    pub fn read(&self, out: &mut [Word]) -> usize {
        let mut data = self.shared.data.lock();
        let mut copied = 0;
        while copied < out.len() {
            let Some(front) = data.queue.front_mut() else {
                break;
            };
            let take = (out.len() - copied).min(front.len());
            out[copied..copied + take].copy_from_slice(&front.payload()[..take]);
            front.start += take;
            copied += take;
            if front.len() == 0 {
                let mut done = data.queue.pop_front().expect("queue head");
                done.reset();
                data.pool.push(done);
            }
        }
        self.shared
            .counters
            .list_mode_words_read
            .fetch_add(copied as u64, Ordering::Relaxed);
        copied
    }

    /// Wait for the hardware FIFO and queue to drain after a run stops.
    /// Bounded by a timeout derived from the hold time.
    pub fn wait_drained(&self) {
        let hold = self.shared.hold_usecs.load(Ordering::Relaxed);
        let poll = self.shared.run_wait_usecs.load(Ordering::Relaxed);
        let deadline = Instant::now() + Duration::from_micros(3 * hold);
        while Instant::now() < deadline {
            let hw_level = self
                .shared
                .bus
                .read_word(regs::FIFO_LEVEL)
                .map(|w| w as usize)
                .unwrap_or(0);
            if hw_level == 0 {
                return;
            }
            std::thread::sleep(Duration::from_micros(poll));
        }
        tracing::warn!(
            "fifo: slot {}: drain timeout",
            self.shared.slot.load(Ordering::Relaxed)
        );
    }

    /// Buffer conservation check, used by the invariant tests.
    #[cfg(test)]
    fn accounted_buffers(&self) -> usize {
        let data = self.shared.data.lock();
        data.pool.len() + data.queue.len() + data.in_flight
    }
}

/// Take a buffer from the pool, compacting the queue tail if the pool is
/// dry. `None` means genuinely exhausted.
fn take_buffer(shared: &FifoShared) -> Option<Buffer> {
    let mut data = shared.data.lock();
    if let Some(buffer) = data.pool.pop() {
        data.in_flight += 1;
        return Some(buffer);
    }
    if compact(&mut data) {
        shared.counters.fifo_compactions.fetch_add(1, Ordering::Relaxed);
        if let Some(buffer) = data.pool.pop() {
            data.in_flight += 1;
            return Some(buffer);
        }
    }
    None
}

/// Merge the last adjacent pair of queued buffers whose combined payload
/// fits one block, freeing a buffer back to the pool.
fn compact(data: &mut FifoData) -> bool {
    if data.queue.len() < 2 {
        return false;
    }
    for i in (0..data.queue.len() - 1).rev() {
        if data.queue[i].len() + data.queue[i + 1].len() <= MAX_DMA_BLOCK_SIZE {
            let mut later = data.queue.remove(i + 1).expect("queue index");
            let earlier = &mut data.queue[i];
            if earlier.start > 0 {
                earlier.words.drain(..earlier.start);
                earlier.start = 0;
            }
            earlier.words.extend_from_slice(later.payload());
            later.reset();
            data.pool.push(later);
            return true;
        }
    }
    false
}

fn publish(shared: &FifoShared, buffer: Buffer) {
    let mut data = shared.data.lock();
    data.in_flight -= 1;
    data.queue.push_back(buffer);
    data.last_publish = Instant::now();
}

fn return_to_pool(shared: &FifoShared, mut buffer: Buffer) {
    let mut data = shared.data.lock();
    data.in_flight -= 1;
    buffer.reset();
    data.pool.push(buffer);
}

/// One service pass: move everything the block threshold and hold time say
/// should move.
fn service(shared: &FifoShared) -> Result<()> {
    let mut level = shared.bus.read_word(regs::FIFO_LEVEL)? as usize;

    while level >= MAX_DMA_BLOCK_SIZE {
        let Some(mut buffer) = take_buffer(shared) else {
            // Exhausted even after compaction. Leave the data in the
            // hardware FIFO, record the overflow, and retry next pass.
            shared.counters.fifo_overflows.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "fifo: slot {}: buffer pool exhausted",
                shared.slot.load(Ordering::Relaxed)
            );
            return Ok(());
        };
        buffer.words.resize(MAX_DMA_BLOCK_SIZE, 0);
        if let Err(e) = shared.bus.dma_read(regs::FIFO_MEM, &mut buffer.words) {
            return_to_pool(shared, buffer);
            return Err(e);
        }
        shared
            .counters
            .fifo_dma_words
            .fetch_add(MAX_DMA_BLOCK_SIZE as u64, Ordering::Relaxed);
        publish(shared, buffer);
        level = shared.bus.read_word(regs::FIFO_LEVEL)? as usize;
    }

    if level > 0 {
        let hold = Duration::from_micros(shared.hold_usecs.load(Ordering::Relaxed));
        let held_long_enough = shared.data.lock().last_publish.elapsed() >= hold;
        if held_long_enough {
            if let Some(mut buffer) = take_buffer(shared) {
                buffer.words.resize(level, 0);
                if let Err(e) = shared.bus.dma_read(regs::FIFO_MEM, &mut buffer.words) {
                    return_to_pool(shared, buffer);
                    return Err(e);
                }
                shared
                    .counters
                    .fifo_dma_words
                    .fetch_add(level as u64, Ordering::Relaxed);
                publish(shared, buffer);
            } else {
                shared.counters.fifo_overflows.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    Ok(())
}

fn worker(shared: &FifoShared) {
    let slot = shared.slot.load(Ordering::Relaxed);
    let mut idle_period = shared.run_wait_usecs.load(Ordering::Relaxed);
    let mut last_step = Instant::now();

    while shared.running.load(Ordering::Acquire) {
        let run_active =
            RunTask::from_raw(shared.flags.run_task.load(Ordering::Acquire)) != RunTask::Idle;

        if let Err(e) = service(shared) {
            // A bus failure is not recoverable from here: mark the module
            // offline and end the worker. Readers see module_offline.
            tracing::error!("fifo: slot {slot}: worker bus error: {e}");
            shared.counters.hw_errors.fetch_add(1, Ordering::Relaxed);
            shared.flags.online.store(false, Ordering::Release);
            break;
        }

        let period = if run_active {
            idle_period = shared.run_wait_usecs.load(Ordering::Relaxed);
            last_step = Instant::now();
            idle_period
        } else {
            let hold = Duration::from_micros(shared.hold_usecs.load(Ordering::Relaxed));
            if last_step.elapsed() >= hold {
                let ceiling = shared.idle_wait_usecs.load(Ordering::Relaxed);
                idle_period = (idle_period * 2).min(ceiling);
                last_step = Instant::now();
            }
            idle_period
        };
        std::thread::sleep(Duration::from_micros(period));
    }

    shared.finished.store(true, Ordering::Release);
    tracing::debug!("fifo: slot {slot}: worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump() -> FifoPump {
        let bus = Arc::new(BusPort::new(false));
        let flags = Arc::new(ModuleFlags::default());
        let counters = Arc::new(Counters::default());
        let pump = FifoPump::new(bus, flags, counters);
        pump.shared.buffers.store(4, Ordering::Relaxed);
        pump
    }

    /// Hand-fill the pump's pool without a worker.
    fn prime(pump: &FifoPump) {
        let mut data = pump.shared.data.lock();
        data.pool = (0..4).map(|_| Buffer::new()).collect();
        data.queue.clear();
        data.in_flight = 0;
    }

    fn enqueue(pump: &FifoPump, words: &[Word]) {
        let mut buffer = take_buffer(&pump.shared).expect("pool empty");
        buffer.words.extend_from_slice(words);
        publish(&pump.shared, buffer);
    }

    #[test]
    fn reader_drains_across_buffers() {
        let pump = pump();
        prime(&pump);
        enqueue(&pump, &[1, 2, 3]);
        enqueue(&pump, &[4, 5]);
        assert_eq!(pump.level(), 5);

        let mut out = vec![0; 4];
        assert_eq!(pump.read(&mut out), 4);
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert_eq!(pump.level(), 1);
        assert_eq!(pump.accounted_buffers(), 4);

        let mut rest = vec![0; 4];
        assert_eq!(pump.read(&mut rest), 1);
        assert_eq!(rest[0], 5);
        assert_eq!(pump.accounted_buffers(), 4);
    }

    #[test]
    fn compaction_merges_tail_and_frees_a_buffer() {
        let pump = pump();
        prime(&pump);
        // Fill all four buffers with small payloads, exhausting the pool.
        for chunk in [[1, 2], [3, 4], [5, 6], [7, 8]] {
            enqueue(&pump, &chunk);
        }
        assert!(pump.shared.data.lock().pool.is_empty());

        let buffer = take_buffer(&pump.shared).expect("compaction frees one");
        assert_eq!(pump.shared.data.lock().queue.len(), 3);
        return_to_pool(&pump.shared, buffer);
        assert_eq!(pump.accounted_buffers(), 4);

        // Order preserved after the merge.
        let mut out = vec![0; 8];
        assert_eq!(pump.read(&mut out), 8);
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn compaction_respects_block_limit() {
        let pump = pump();
        prime(&pump);
        let big = vec![0u32; MAX_DMA_BLOCK_SIZE];
        for _ in 0..4 {
            enqueue(&pump, &big);
        }
        // Every pair exceeds one block; nothing can merge.
        assert!(take_buffer(&pump.shared).is_none());
        assert_eq!(pump.accounted_buffers(), 4);
    }

    #[test]
    fn read_is_at_most_once() {
        let pump = pump();
        prime(&pump);
        enqueue(&pump, &[9, 9, 9]);
        let mut first = vec![0; 3];
        let mut second = vec![0; 3];
        assert_eq!(pump.read(&mut first), 3);
        assert_eq!(pump.read(&mut second), 0);
    }
}
