// Command line entry point for procsim
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use parking_lot::Mutex;

use procsim::process::scheduler::Admission;
use procsim::{Config, MemoryError, MemoryManager, ProcessId, ProcessService, ProcessTable, Scheduler};

/// Main loop period for releasing memory and retrying pending processes
const SUPERVISOR_PERIOD: Duration = Duration::from_millis(10);

#[derive(Parser)]
#[command(name = "procsim")]
#[command(about = "Multi-core process scheduling and memory simulator", long_about = None)]
struct Cli {
    /// Config file (`key value` pairs, or TOML when it ends in .toml)
    #[arg(short, long, default_value = "config.txt")]
    config: PathBuf,

    /// Wall-clock time to run the simulation for
    #[arg(long, default_value_t = 5000)]
    duration_ms: u64,

    /// Write a memory snapshot every N cycles (0 disables)
    #[arg(long, default_value_t = 0)]
    snapshot_every: u64,
}

/// Processes waiting for memory before they may enter the ready queue
#[derive(Default)]
struct PendingQueue(Mutex<VecDeque<ProcessId>>);

impl PendingQueue {
    fn take(&self) -> VecDeque<ProcessId> {
        std::mem::take(&mut *self.0.lock())
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

impl Admission for PendingQueue {
    fn admit(&self, pid: ProcessId) {
        self.0.lock().push_back(pid);
    }
}

/// Allocates frames before a process reaches the scheduler.
///
/// The memory manager's round-robin no-fit re-admission is pointed at the
/// gate's pending queue rather than the scheduler, so a process enters the
/// ready queue only once it holds frames and is retried from here.
struct MemoryGate {
    scheduler: Arc<Scheduler>,
    memory: Arc<MemoryManager>,
    pending: Arc<PendingQueue>,
}

impl MemoryGate {
    fn retry_pending(&self) {
        for pid in self.pending.take() {
            self.admit(pid);
        }
    }
}

impl Admission for MemoryGate {
    fn admit(&self, pid: ProcessId) {
        match self.memory.allocate(pid) {
            Ok(_) => self.scheduler.admit(pid),
            // round-robin no-fit is already back in the pending queue
            Err(MemoryError::NoFit { .. }) if self.scheduler.algorithm().is_round_robin() => {}
            Err(MemoryError::UnknownProcess(pid)) => warn!("Dropping unknown process {}", pid),
            Err(_) => self.pending.admit(pid),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let table = Arc::new(ProcessTable::new());
    let scheduler = Arc::new(Scheduler::new(&config, table.clone()));
    let pending = Arc::new(PendingQueue::default());
    let memory = Arc::new(MemoryManager::new(&config, table.clone(), pending.clone()));
    let gate = Arc::new(MemoryGate {
        scheduler: scheduler.clone(),
        memory: memory.clone(),
        pending: pending.clone(),
    });
    let service = ProcessService::new(&config, table.clone(), gate.clone(), scheduler.clone());

    scheduler.start();
    service.start_batch();

    let deadline = Instant::now() + Duration::from_millis(cli.duration_ms);
    let mut released = 0;
    let mut next_snapshot = cli.snapshot_every;

    while Instant::now() < deadline {
        thread::sleep(SUPERVISOR_PERIOD);

        let finished = scheduler.finished();
        for pid in &finished[released..] {
            if let Some(pcb) = table.get(*pid) {
                memory.release(pcb.name());
            }
        }
        released = finished.len();
        gate.retry_pending();

        let cycle = scheduler.cycles();
        if cli.snapshot_every > 0 && cycle >= next_snapshot {
            if let Err(err) = memory.snapshot(cycle) {
                warn!("{}", err);
            }
            next_snapshot = cycle + cli.snapshot_every;
        }
    }

    service.stop_batch();
    let report = scheduler.write_report()?;
    println!("{report}");
    print!("{}", memory.memory_usage());
    info!(
        "{} process(es) created, {} waiting for memory",
        table.len(),
        pending.len()
    );

    scheduler.stop()?;
    Ok(())
}
