// Process Scheduler for procsim
use std::collections::VecDeque;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Config;
use crate::process::clock::{CycleBarrier, PeriodicTimer, BACKUP_TICK_PERIOD};
use crate::process::pcb::{
    ProcessControlBlock, ProcessError, ProcessId, ProcessState, ProcessTable, TIMESTAMP_FORMAT,
    UNASSIGNED_CORE,
};

/// Dispatch policy, fixed for the lifetime of a scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingAlgorithm {
    #[serde(rename = "fcfs")]
    FirstComeFirstServed,
    #[serde(rename = "rr")]
    RoundRobin,
}

impl SchedulingAlgorithm {
    pub fn is_round_robin(self) -> bool {
        self == SchedulingAlgorithm::RoundRobin
    }
}

impl fmt::Display for SchedulingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingAlgorithm::FirstComeFirstServed => write!(f, "fcfs"),
            SchedulingAlgorithm::RoundRobin => write!(f, "rr"),
        }
    }
}

impl FromStr for SchedulingAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fcfs" => Ok(SchedulingAlgorithm::FirstComeFirstServed),
            "rr" => Ok(SchedulingAlgorithm::RoundRobin),
            other => Err(format!("unknown scheduler '{other}'")),
        }
    }
}

/// Scheduler errors. Every variant is fatal: it means the scheduler itself
/// is broken, not that a process or resource is busy.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("core worker {worker} hit a fatal error: {source}")]
    Fatal {
        worker: usize,
        #[source]
        source: ProcessError,
    },
    #[error("core worker {0} panicked")]
    WorkerPanicked(usize),
}

/// Failure writing the utilization report
#[derive(Debug, Error)]
#[error("failed to write report to {}: {source}", path.display())]
pub struct ReportError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Something that accepts processes into a ready queue
pub trait Admission: Send + Sync {
    fn admit(&self, pid: ProcessId);
}

/// Read access to the global cycle counter
pub trait CycleSource: Send + Sync {
    fn cycles(&self) -> u64;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub name: String,
    pub core: isize,
    pub progress: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedProcess {
    pub name: String,
    pub total: usize,
}

/// Point-in-time view of core usage and process lists
#[derive(Debug, Clone)]
pub struct UtilizationReport {
    pub generated_at: DateTime<Local>,
    pub cores_total: usize,
    pub cores_used: usize,
    pub running: Vec<RunningProcess>,
    pub finished: Vec<FinishedProcess>,
}

impl UtilizationReport {
    /// Build a report from the given process blocks
    pub fn from_processes<'a, R, F>(cores_total: usize, running: R, finished: F) -> Self
    where
        R: IntoIterator<Item = &'a ProcessControlBlock>,
        F: IntoIterator<Item = &'a ProcessControlBlock>,
    {
        let running: Vec<RunningProcess> = running
            .into_iter()
            .map(|pcb| RunningProcess {
                name: pcb.name().to_string(),
                core: pcb.core(),
                progress: pcb.progress(),
                total: pcb.total_instructions(),
            })
            .collect();
        let finished = finished
            .into_iter()
            .map(|pcb| FinishedProcess {
                name: pcb.name().to_string(),
                total: pcb.total_instructions(),
            })
            .collect();

        Self {
            generated_at: Local::now(),
            cores_total,
            cores_used: running.len(),
            running,
            finished,
        }
    }

    /// Percentage of cores in use
    pub fn utilization(&self) -> usize {
        if self.cores_total == 0 {
            return 0;
        }
        self.cores_used * 100 / self.cores_total
    }

    pub fn cores_available(&self) -> usize {
        self.cores_total.saturating_sub(self.cores_used)
    }
}

impl fmt::Display for UtilizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.generated_at.format(TIMESTAMP_FORMAT);
        writeln!(f, "CPU utilization: {}%", self.utilization())?;
        writeln!(f, "Cores used: {}", self.cores_used)?;
        writeln!(f, "Cores available: {}", self.cores_available())?;
        writeln!(f)?;
        writeln!(f, "Running processes:")?;
        for process in &self.running {
            writeln!(
                f,
                "{} ({})   Core: {}    {} / {}",
                process.name, stamp, process.core, process.progress, process.total
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Finished processes:")?;
        for process in &self.finished {
            writeln!(
                f,
                "{} ({})   Finished    {} / {}",
                process.name, stamp, process.total, process.total
            )?;
        }
        Ok(())
    }
}

/// State guarded by the scheduler lock
#[derive(Debug, Default)]
struct SchedulerState {
    ready_queue: VecDeque<ProcessId>,
    running: Vec<ProcessId>,
    finished: Vec<ProcessId>,
    core_status: Vec<bool>,
}

impl SchedulerState {
    fn free_core(&self) -> Option<usize> {
        self.core_status.iter().position(|busy| !busy)
    }
}

/// A process bound to a core, owned by one worker until it is released
struct Dispatch {
    pid: ProcessId,
    pcb: Arc<ProcessControlBlock>,
    core: usize,
}

/// Shared between the scheduler handle and its threads
struct Inner {
    algorithm: SchedulingAlgorithm,
    num_cores: usize,
    quantum: u32,
    delays_per_exec: u32,
    report_log: PathBuf,
    table: Arc<ProcessTable>,
    state: Mutex<SchedulerState>,
    work_available: Condvar,
    clock: CycleBarrier,
    backup_timer: PeriodicTimer,
    shutdown: AtomicBool,
}

#[derive(Default)]
struct Threads {
    workers: Vec<JoinHandle<Result<(), SchedulerError>>>,
    backup: Option<JoinHandle<()>>,
}

/// Multi-core process scheduler.
///
/// Runs one dispatch loop per configured core and one backup clock loop.
/// Processes are referenced by [`ProcessId`] and resolved through the
/// shared [`ProcessTable`].
pub struct Scheduler {
    inner: Arc<Inner>,
    threads: Mutex<Threads>,
    started: AtomicBool,
}

impl Scheduler {
    pub fn new(config: &Config, table: Arc<ProcessTable>) -> Self {
        let state = SchedulerState {
            core_status: vec![false; config.num_cpu],
            ..SchedulerState::default()
        };

        Self {
            inner: Arc::new(Inner {
                algorithm: config.scheduler,
                num_cores: config.num_cpu,
                quantum: config.quantum_cycles,
                delays_per_exec: config.delays_per_exec,
                report_log: config.report_log.clone(),
                table,
                state: Mutex::new(state),
                work_available: Condvar::new(),
                clock: CycleBarrier::new(),
                backup_timer: PeriodicTimer::new(BACKUP_TICK_PERIOD),
                shutdown: AtomicBool::new(false),
            }),
            threads: Mutex::new(Threads::default()),
            started: AtomicBool::new(false),
        }
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.inner.algorithm
    }

    pub fn num_cores(&self) -> usize {
        self.inner.num_cores
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the core workers and the backup clock. No-op if already started.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let inner = &self.inner;
        inner.shutdown.store(false, Ordering::Release);
        inner.clock.reset();
        inner.backup_timer.reset();

        let mut threads = self.threads.lock();
        for worker in 0..inner.num_cores {
            let inner = Arc::clone(inner);
            threads
                .workers
                .push(thread::spawn(move || inner.dispatch_loop(worker)));
        }

        let backup = Arc::clone(inner);
        threads.backup = Some(thread::spawn(move || backup.backup_clock_loop()));

        info!(
            "Scheduler started: {} core(s), {} policy",
            inner.num_cores, inner.algorithm
        );
    }

    /// Signal every loop to exit, wake all waiters and join the threads.
    ///
    /// Returns the first fatal error reported by a core worker, if any.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }

        let inner = &self.inner;
        {
            let _state = inner.state.lock();
            inner.shutdown.store(true, Ordering::Release);
            inner.work_available.notify_all();
        }
        inner.clock.shutdown();
        inner.backup_timer.stop();

        let threads = std::mem::take(&mut *self.threads.lock());
        let mut outcome = Ok(());
        for (worker, handle) in threads.workers.into_iter().enumerate() {
            let result = handle
                .join()
                .unwrap_or(Err(SchedulerError::WorkerPanicked(worker)));
            if let Err(err) = result {
                error!("{}", err);
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }
        if let Some(backup) = threads.backup {
            if backup.join().is_err() {
                warn!("Backup clock thread panicked");
            }
        }

        self.started.store(false, Ordering::Release);
        info!("Scheduler stopped at cycle {}", inner.clock.cycles());
        outcome
    }

    /// Append a process to the tail of the ready queue and wake one worker.
    ///
    /// A process that is already queued, bound to a core or finished is left
    /// where it is, so a second admission path can never bind it twice.
    pub fn admit(&self, pid: ProcessId) {
        self.inner.admit(pid);
    }

    pub fn cycles(&self) -> u64 {
        self.inner.clock.cycles()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.state.lock().ready_queue.len()
    }

    pub fn finished(&self) -> Vec<ProcessId> {
        self.inner.state.lock().finished.clone()
    }

    /// Hand finished processes to a consumer and forget them
    pub fn drain_finished(&self) -> Vec<ProcessId> {
        std::mem::take(&mut self.inner.state.lock().finished)
    }

    /// Snapshot of core usage and the running/finished lists
    pub fn report_utilization(&self) -> UtilizationReport {
        let inner = &self.inner;
        let state = inner.state.lock();
        let resolve = |pids: &[ProcessId]| -> Vec<Arc<ProcessControlBlock>> {
            pids.iter().filter_map(|pid| inner.table.get(*pid)).collect()
        };
        let running = resolve(&state.running);
        let finished = resolve(&state.finished);
        drop(state);

        UtilizationReport::from_processes(
            inner.num_cores,
            running.iter().map(Arc::as_ref),
            finished.iter().map(Arc::as_ref),
        )
    }

    /// Build the utilization report and append it to the report log
    pub fn write_report(&self) -> Result<UtilizationReport, ReportError> {
        let report = self.report_utilization();
        let path = &self.inner.report_log;
        let io_err = |source| ReportError {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        writeln!(file, "{report}").map_err(io_err)?;

        info!("Report generated at {}", path.display());
        Ok(report)
    }
}

impl Admission for Scheduler {
    fn admit(&self, pid: ProcessId) {
        Scheduler::admit(self, pid);
    }
}

impl CycleSource for Scheduler {
    fn cycles(&self) -> u64 {
        Scheduler::cycles(self)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!("Scheduler stopped with error: {}", err);
        }
    }
}

impl Inner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn is_round_robin(&self) -> bool {
        self.algorithm.is_round_robin()
    }

    fn admit(&self, pid: ProcessId) {
        let mut state = self.state.lock();
        if state.ready_queue.contains(&pid)
            || state.running.contains(&pid)
            || state.finished.contains(&pid)
        {
            debug!("Ignoring admission of {}: already scheduled", pid);
            return;
        }
        state.ready_queue.push_back(pid);
        drop(state);
        self.work_available.notify_one();
    }

    fn dispatch_loop(&self, worker: usize) -> Result<(), SchedulerError> {
        debug!("Core worker {} online", worker);

        while !self.is_shutdown() {
            let next = {
                let mut state = self.state.lock();
                while state.ready_queue.is_empty() && !self.is_shutdown() {
                    self.work_available.wait(&mut state);
                }
                if self.is_shutdown() {
                    break;
                }
                self.next_process(&mut state)
                    .map_err(|source| SchedulerError::Fatal { worker, source })?
            };

            match next {
                Some(dispatch) => self
                    .run(dispatch)
                    .map_err(|source| SchedulerError::Fatal { worker, source })?,
                None => self.clock.idle_round(),
            }
        }

        debug!("Core worker {} offline", worker);
        Ok(())
    }

    /// Pick the next process per policy and bind it to the lowest free core.
    /// Caller holds the scheduler lock.
    fn next_process(
        &self,
        state: &mut SchedulerState,
    ) -> Result<Option<Dispatch>, ProcessError> {
        let Some(core) = state.free_core() else {
            return Ok(None);
        };

        let pid = match self.algorithm {
            SchedulingAlgorithm::FirstComeFirstServed => self.schedule_fcfs(state),
            SchedulingAlgorithm::RoundRobin => self.schedule_round_robin(state),
        };
        let Some(pid) = pid else {
            return Ok(None);
        };

        let Some(pcb) = self.table.get(pid) else {
            warn!("Dropping unknown process {} from the ready queue", pid);
            return Ok(None);
        };

        pcb.set_core(core as isize, self.num_cores)?;
        state.core_status[core] = true;
        state.running.push(pid);
        self.clock.enter();

        debug!("Dispatched {} to core {}", pcb.name(), core);
        Ok(Some(Dispatch { pid, pcb, core }))
    }

    /// First-Come-First-Served: strict FIFO, no preemption
    fn schedule_fcfs(&self, state: &mut SchedulerState) -> Option<ProcessId> {
        state.ready_queue.pop_front()
    }

    /// Round-robin: pop the head; a head whose quantum is already used up is
    /// sent to the back and nothing is dispatched this attempt.
    fn schedule_round_robin(&self, state: &mut SchedulerState) -> Option<ProcessId> {
        let pid = state.ready_queue.pop_front()?;
        let pcb = self.table.get(pid)?;

        if pcb.quantum() < self.quantum {
            return Some(pid);
        }

        pcb.reset_quantum();
        pcb.set_state(ProcessState::Ready);
        state.ready_queue.push_back(pid);
        None
    }

    fn quantum_expired(&self, pcb: &ProcessControlBlock) -> bool {
        self.is_round_robin() && pcb.quantum() >= self.quantum
    }

    /// Execute one turn of a bound process, then finish or requeue it
    fn run(&self, dispatch: Dispatch) -> Result<(), ProcessError> {
        let Dispatch { pid, pcb, core } = dispatch;
        pcb.set_state(ProcessState::Running);

        let mut delay = 0;
        while !pcb.is_finished() && !self.quantum_expired(&pcb) {
            if delay < self.delays_per_exec {
                delay += 1;
            } else {
                if let Err(err) = pcb.execute_current(core, self.clock.cycles()) {
                    error!("Error executing instruction in process {}: {}", pcb.name(), err);
                }
                pcb.advance();
                delay = 0;

                if self.is_round_robin() {
                    pcb.increment_quantum();
                }
            }

            if !self.clock.sync() {
                break;
            }
        }

        let mut state = self.state.lock();
        if pcb.is_finished() {
            pcb.set_state(ProcessState::Finished);
            state.finished.push(pid);
            debug!("{} finished on core {}", pcb.name(), core);
        } else {
            pcb.set_state(ProcessState::Ready);
            pcb.reset_quantum();
            state.ready_queue.push_back(pid);
            self.work_available.notify_one();
        }
        state.running.retain(|running| *running != pid);
        state.core_status[core] = false;
        self.clock.leave();
        pcb.set_core(UNASSIGNED_CORE, self.num_cores)
    }

    fn backup_clock_loop(&self) {
        while self.backup_timer.wait_tick() {
            self.clock.tick_if_idle();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::{Instruction, PrintInstruction};

    fn config(num_cpu: usize, scheduler: SchedulingAlgorithm) -> Config {
        Config {
            num_cpu,
            scheduler,
            quantum_cycles: 2,
            ..Config::default()
        }
    }

    fn prints(count: usize) -> Vec<Box<dyn Instruction>> {
        (0..count)
            .map(|_| Box::new(PrintInstruction::default()) as Box<dyn Instruction>)
            .collect()
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!(
            "fcfs".parse::<SchedulingAlgorithm>(),
            Ok(SchedulingAlgorithm::FirstComeFirstServed)
        );
        assert_eq!(
            "rr".parse::<SchedulingAlgorithm>(),
            Ok(SchedulingAlgorithm::RoundRobin)
        );
        assert!("sjf".parse::<SchedulingAlgorithm>().is_err());
        assert_eq!(SchedulingAlgorithm::RoundRobin.to_string(), "rr");
    }

    #[test]
    fn fcfs_binds_lowest_free_core() {
        let table = Arc::new(ProcessTable::new());
        let config = config(3, SchedulingAlgorithm::FirstComeFirstServed);
        let scheduler = Scheduler::new(&config, table.clone());
        let a = table.insert("a", prints(1)).unwrap();
        let b = table.insert("b", prints(1)).unwrap();
        scheduler.admit(a);
        scheduler.admit(b);

        let inner = &scheduler.inner;
        let mut state = inner.state.lock();
        state.core_status[0] = true;
        let first = inner.next_process(&mut state).unwrap().unwrap();
        assert_eq!((first.pid, first.core), (a, 1));
        let second = inner.next_process(&mut state).unwrap().unwrap();
        assert_eq!((second.pid, second.core), (b, 2));
        assert_eq!(state.running, vec![a, b]);
        assert!(inner.next_process(&mut state).unwrap().is_none());
    }

    #[test]
    fn round_robin_requeues_expired_head_without_dispatch() {
        let table = Arc::new(ProcessTable::new());
        let config = config(1, SchedulingAlgorithm::RoundRobin);
        let scheduler = Scheduler::new(&config, table.clone());
        let tired = table.insert("tired", prints(5)).unwrap();
        let fresh = table.insert("fresh", prints(5)).unwrap();
        let pcb = table.get(tired).unwrap();
        pcb.increment_quantum();
        pcb.increment_quantum();
        scheduler.admit(tired);
        scheduler.admit(fresh);

        let inner = &scheduler.inner;
        let mut state = inner.state.lock();
        assert!(inner.next_process(&mut state).unwrap().is_none());
        assert_eq!(state.ready_queue, VecDeque::from(vec![fresh, tired]));
        assert_eq!(pcb.quantum(), 0);
        assert_eq!(state.core_status, vec![false]);

        let next = inner.next_process(&mut state).unwrap().unwrap();
        assert_eq!(next.pid, fresh);
    }

    #[test]
    fn admit_ignores_already_scheduled_process() {
        let table = Arc::new(ProcessTable::new());
        let config = config(2, SchedulingAlgorithm::RoundRobin);
        let scheduler = Scheduler::new(&config, table.clone());
        let a = table.insert("a", prints(3)).unwrap();
        let b = table.insert("b", prints(3)).unwrap();
        scheduler.admit(a);
        scheduler.admit(a);
        scheduler.admit(b);
        assert_eq!(scheduler.ready_len(), 2);

        let inner = &scheduler.inner;
        let mut state = inner.state.lock();
        let running = inner.next_process(&mut state).unwrap().unwrap();
        assert_eq!(running.pid, a);
        drop(state);

        scheduler.admit(a);
        assert_eq!(scheduler.ready_len(), 1);
        assert_eq!(inner.state.lock().ready_queue, VecDeque::from(vec![b]));
    }

    #[test]
    fn report_lists_running_and_finished() {
        let table = Arc::new(ProcessTable::new());
        let config = config(4, SchedulingAlgorithm::FirstComeFirstServed);
        let scheduler = Scheduler::new(&config, table.clone());
        let a = table.insert("a", prints(3)).unwrap();
        let b = table.insert("b", prints(2)).unwrap();
        table.get(a).unwrap().set_core(1, 4).unwrap();
        {
            let mut state = scheduler.inner.state.lock();
            state.running.push(a);
            state.finished.push(b);
        }

        let report = scheduler.report_utilization();
        assert_eq!(report.utilization(), 25);
        assert_eq!(report.cores_available(), 3);
        assert_eq!(report.running[0].core, 1);
        assert_eq!(report.finished[0], FinishedProcess { name: "b".into(), total: 2 });

        let text = report.to_string();
        assert!(text.starts_with("CPU utilization: 25%\nCores used: 1\nCores available: 3\n"));
        assert!(text.contains("Core: 1    0 / 3"));
        assert!(text.contains("Finished    2 / 2"));
    }

    #[test]
    fn stop_without_start_is_noop() {
        let table = Arc::new(ProcessTable::new());
        let scheduler = Scheduler::new(&config(2, SchedulingAlgorithm::RoundRobin), table);
        assert!(scheduler.stop().is_ok());
        assert!(!scheduler.is_running());
    }
}
