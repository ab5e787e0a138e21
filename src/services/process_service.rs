// Process Management Service for procsim
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Local;
use log::{debug, error, info};
use parking_lot::Mutex;

use crate::config::Config;
use crate::process::clock::PeriodicTimer;
use crate::process::pcb::{
    Instruction, PrintInstruction, ProcessControlBlock, ProcessError, ProcessId, ProcessState,
    ProcessTable,
};
use crate::process::scheduler::{Admission, CycleSource, UtilizationReport};

/// How often the batch spawner checks the cycle counter
pub const BATCH_POLL_PERIOD: Duration = Duration::from_millis(10);

/// Small xorshift64 generator for instruction counts
#[derive(Debug, Clone)]
struct XorShift64(u64);

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // zero is a fixed point
        Self(seed.max(1))
    }

    fn from_clock() -> Self {
        let nanos = Local::now().timestamp_nanos_opt().unwrap_or_default();
        Self::new(nanos as u64)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish draw from `[low, high]`
    fn between(&mut self, low: u32, high: u32) -> u32 {
        let span = u64::from(high - low) + 1;
        low + (self.next_u64() % span) as u32
    }
}

struct ServiceInner {
    num_cores: usize,
    min_ins: u32,
    max_ins: u32,
    batch_process_freq: u64,
    table: Arc<ProcessTable>,
    admission: Arc<dyn Admission>,
    cycles: Arc<dyn CycleSource>,
    rng: Mutex<XorShift64>,
    batch_counter: AtomicU64,
}

struct BatchWorker {
    timer: Arc<PeriodicTimer>,
    handle: JoinHandle<()>,
}

/// Process Management Service - creates processes, hands them to the
/// scheduler and runs the batch spawner
pub struct ProcessService {
    inner: Arc<ServiceInner>,
    batch: Mutex<Option<BatchWorker>>,
}

impl ProcessService {
    pub fn new(
        config: &Config,
        table: Arc<ProcessTable>,
        admission: Arc<dyn Admission>,
        cycles: Arc<dyn CycleSource>,
    ) -> Self {
        Self::with_rng(config, table, admission, cycles, XorShift64::from_clock())
    }

    /// Same as [`ProcessService::new`] with a fixed instruction-count seed
    pub fn with_seed(
        config: &Config,
        table: Arc<ProcessTable>,
        admission: Arc<dyn Admission>,
        cycles: Arc<dyn CycleSource>,
        seed: u64,
    ) -> Self {
        Self::with_rng(config, table, admission, cycles, XorShift64::new(seed))
    }

    fn with_rng(
        config: &Config,
        table: Arc<ProcessTable>,
        admission: Arc<dyn Admission>,
        cycles: Arc<dyn CycleSource>,
        rng: XorShift64,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                num_cores: config.num_cpu,
                min_ins: config.min_ins,
                max_ins: config.max_ins,
                batch_process_freq: config.batch_process_freq,
                table,
                admission,
                cycles,
                rng: Mutex::new(rng),
                batch_counter: AtomicU64::new(1),
            }),
            batch: Mutex::new(None),
        }
    }

    /// Create a process of print instructions and admit it.
    ///
    /// The instruction count is drawn from `[min-ins, max-ins]`.
    pub fn create_process(&self, name: &str) -> Result<ProcessId, ProcessError> {
        self.inner.create_process(name)
    }

    /// Create a process with a caller supplied program and admit it
    pub fn create_process_with(
        &self,
        name: &str,
        instructions: Vec<Box<dyn Instruction>>,
    ) -> Result<ProcessId, ProcessError> {
        self.inner.spawn(name, instructions)
    }

    pub fn process(&self, name: &str) -> Option<Arc<ProcessControlBlock>> {
        let pid = self.inner.table.find(name)?;
        self.inner.table.get(pid)
    }

    /// Utilization view built from process states
    pub fn list_processes(&self) -> UtilizationReport {
        let processes = self.inner.table.list();
        let with_state = |state: ProcessState| {
            processes
                .iter()
                .filter(move |pcb| pcb.state() == state)
                .map(Arc::as_ref)
        };
        UtilizationReport::from_processes(
            self.inner.num_cores,
            with_state(ProcessState::Running),
            with_state(ProcessState::Finished),
        )
    }

    pub fn is_batching(&self) -> bool {
        self.batch.lock().is_some()
    }

    /// Start the background spawner. No-op if it is already running.
    pub fn start_batch(&self) {
        let mut batch = self.batch.lock();
        if batch.is_some() {
            return;
        }

        let timer = Arc::new(PeriodicTimer::new(BATCH_POLL_PERIOD));
        let inner = Arc::clone(&self.inner);
        let worker_timer = Arc::clone(&timer);
        let handle = thread::spawn(move || inner.batch_loop(&worker_timer));

        *batch = Some(BatchWorker { timer, handle });
        info!("Batch process generation started");
    }

    /// Stop and join the background spawner. No-op if it is not running.
    pub fn stop_batch(&self) {
        let Some(worker) = self.batch.lock().take() else {
            return;
        };

        worker.timer.stop();
        if worker.handle.join().is_err() {
            error!("Batch spawner thread panicked");
        }
        info!("Batch process generation stopped");
    }
}

impl Drop for ProcessService {
    fn drop(&mut self) {
        self.stop_batch();
    }
}

impl ServiceInner {
    fn create_process(&self, name: &str) -> Result<ProcessId, ProcessError> {
        let count = self.rng.lock().between(self.min_ins, self.max_ins);
        let instructions = (0..count)
            .map(|_| Box::new(PrintInstruction::default()) as Box<dyn Instruction>)
            .collect();
        self.spawn(name, instructions)
    }

    fn spawn(
        &self,
        name: &str,
        instructions: Vec<Box<dyn Instruction>>,
    ) -> Result<ProcessId, ProcessError> {
        let total = instructions.len();
        let pid = self.table.insert(name, instructions)?;
        self.admission.admit(pid);
        debug!("Created process '{}' with PID {} ({} instructions)", name, pid, total);
        Ok(pid)
    }

    fn batch_loop(&self, timer: &PeriodicTimer) {
        let mut last_creation = 0;

        while timer.wait_tick() {
            let current = self.cycles.cycles();
            if current <= last_creation + self.batch_process_freq {
                continue;
            }

            let number = self.batch_counter.fetch_add(1, Ordering::Relaxed);
            let name = format!("p{:02}", number);
            match self.create_process(&name) {
                Ok(_) => last_creation = current,
                Err(err) => error!("Error creating batch process: {}", err),
            }
        }
    }
}
