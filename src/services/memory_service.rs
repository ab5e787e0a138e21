// Memory Management Service for procsim
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::process::pcb::{ProcessId, ProcessState, ProcessTable, TIMESTAMP_FORMAT};
use crate::process::scheduler::Admission;

/// How long `allocate` waits for the memory lock before giving up
pub const ALLOCATE_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Recoverable allocation failures. None of these stop a caller; under
/// round-robin a no-fit process has already been put back in the ready queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("process {0} does not exist")]
    UnknownProcess(ProcessId),
    #[error("memory lock not acquired within {0:?}")]
    LockTimeout(Duration),
    #[error("no contiguous run of {frames} free frames for {name}")]
    NoFit { name: String, frames: usize },
}

/// Failure writing a memory snapshot
#[derive(Debug, Error)]
#[error("failed to write memory snapshot {}: {source}", path.display())]
pub struct SnapshotError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// One fixed-size allocation unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub owner: Option<String>,
    pub start_address: usize,
    pub end_address: usize,
}

impl Frame {
    pub fn is_free(&self) -> bool {
        self.owner.is_none()
    }
}

/// Frame run held by one resident process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessMemoryInfo {
    pub start_frame: usize,
    pub num_frames: usize,
    pub start_address: usize,
    pub end_address: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStatistics {
    pub total_memory: usize,
    pub used_memory: usize,
    pub free_memory: usize,
    pub process_count: usize,
    pub external_fragmentation: usize,
}

/// Memory map at one instant, resident processes by descending address
#[derive(Debug, Clone)]
pub struct MemorySnapshot {
    pub generated_at: DateTime<Local>,
    pub total_memory: usize,
    pub process_count: usize,
    pub external_fragmentation: usize,
    pub resident: Vec<(String, ProcessMemoryInfo)>,
}

impl fmt::Display for MemorySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Timestamp: ({})", self.generated_at.format(TIMESTAMP_FORMAT))?;
        writeln!(f, "Number of processes in memory: {}", self.process_count)?;
        writeln!(
            f,
            "Total external fragmentation in KB: {}",
            self.external_fragmentation / 1024
        )?;
        writeln!(f)?;
        writeln!(f, "----end---- = {}", self.total_memory)?;
        writeln!(f)?;
        for (name, info) in &self.resident {
            writeln!(f, "{}", info.end_address + 1)?;
            writeln!(f, "{}", name)?;
            writeln!(f, "{}", info.start_address)?;
            writeln!(f)?;
        }
        writeln!(f, "----start---- = 0")
    }
}

/// State guarded by the memory lock
#[derive(Debug)]
struct MemoryState {
    frames: Vec<Frame>,
    allocations: BTreeMap<String, ProcessMemoryInfo>,
    resident: BTreeSet<String>,
}

impl MemoryState {
    /// Lowest index starting `wanted` contiguous free frames
    fn first_fit(&self, wanted: usize) -> Option<usize> {
        let mut run = 0;
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.is_free() {
                run += 1;
                if run == wanted {
                    return Some(index + 1 - wanted);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    /// Bytes in free runs too short to hold one process
    fn fragmentation(&self, frames_per_process: usize, frame_size: usize) -> usize {
        let mut total = 0;
        let mut run = 0;
        for frame in &self.frames {
            if frame.is_free() {
                run += 1;
                continue;
            }
            if run < frames_per_process {
                total += run * frame_size;
            }
            run = 0;
        }
        if run < frames_per_process {
            total += run * frame_size;
        }
        total
    }
}

/// First-fit frame allocator with a uniform per-process footprint.
///
/// Holds its own lock, independent of the scheduler's. It never calls back
/// into the scheduler while that lock is held.
pub struct MemoryManager {
    total_memory: usize,
    frame_size: usize,
    process_size: usize,
    frames_per_process: usize,
    round_robin: bool,
    snapshot_dir: PathBuf,
    table: Arc<ProcessTable>,
    readmit: Arc<dyn Admission>,
    state: Mutex<MemoryState>,
    fragmentation: AtomicUsize,
}

impl MemoryManager {
    pub fn new(config: &Config, table: Arc<ProcessTable>, readmit: Arc<dyn Admission>) -> Self {
        let frame_size = config.mem_per_frame;
        let frames = (0..config.total_frames())
            .map(|index| Frame {
                owner: None,
                start_address: index * frame_size,
                end_address: (index + 1) * frame_size - 1,
            })
            .collect();

        let state = MemoryState {
            frames,
            allocations: BTreeMap::new(),
            resident: BTreeSet::new(),
        };
        let frames_per_process = config.frames_per_process();
        let fragmentation = state.fragmentation(frames_per_process, frame_size);

        Self {
            total_memory: config.max_overall_mem,
            frame_size,
            process_size: config.mem_per_proc,
            frames_per_process,
            round_robin: config.is_round_robin(),
            snapshot_dir: config.snapshot_dir.clone(),
            table,
            readmit,
            state: Mutex::new(state),
            fragmentation: AtomicUsize::new(fragmentation),
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_memory / self.frame_size
    }

    pub fn frames_per_process(&self) -> usize {
        self.frames_per_process
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Give a process one footprint worth of contiguous frames.
    ///
    /// Waits at most [`ALLOCATE_LOCK_TIMEOUT`] for the lock. When nothing
    /// fits and the policy is round-robin, the process is marked `Ready` and
    /// re-admitted to the scheduler after the memory lock is released.
    /// Allocating for an already resident process returns its current run.
    pub fn allocate(&self, pid: ProcessId) -> Result<ProcessMemoryInfo, MemoryError> {
        let pcb = self.table.get(pid).ok_or(MemoryError::UnknownProcess(pid))?;
        let name = pcb.name();

        let outcome = {
            let mut state = self
                .state
                .try_lock_for(ALLOCATE_LOCK_TIMEOUT)
                .ok_or(MemoryError::LockTimeout(ALLOCATE_LOCK_TIMEOUT))?;
            self.allocate_locked(&mut state, name)
        };

        match &outcome {
            Ok(info) => debug!(
                "Allocated frames {}..{} to {}",
                info.start_frame,
                info.start_frame + info.num_frames,
                name
            ),
            Err(MemoryError::NoFit { .. }) if self.round_robin => {
                debug!("No memory for {}, returning it to the ready queue", name);
                pcb.set_state(ProcessState::Ready);
                self.readmit.admit(pid);
            }
            Err(err @ MemoryError::NoFit { .. }) => debug!("{}", err),
            Err(err) => warn!("{}", err),
        }
        outcome
    }

    fn allocate_locked(
        &self,
        state: &mut MemoryState,
        name: &str,
    ) -> Result<ProcessMemoryInfo, MemoryError> {
        if let Some(info) = state.allocations.get(name) {
            return Ok(*info);
        }

        let start_frame = state
            .first_fit(self.frames_per_process)
            .ok_or_else(|| MemoryError::NoFit {
                name: name.to_string(),
                frames: self.frames_per_process,
            })?;

        let range = start_frame..start_frame + self.frames_per_process;
        for frame in &mut state.frames[range] {
            frame.owner = Some(name.to_string());
        }

        let info = ProcessMemoryInfo {
            start_frame,
            num_frames: self.frames_per_process,
            start_address: start_frame * self.frame_size,
            end_address: (start_frame + self.frames_per_process) * self.frame_size - 1,
        };
        state.allocations.insert(name.to_string(), info);
        state.resident.insert(name.to_string());
        self.update_fragmentation(state);
        Ok(info)
    }

    /// Free the frames held by `name`. No-op if it holds none.
    pub fn release(&self, name: &str) {
        let mut state = self.state.lock();
        let Some(info) = state.allocations.remove(name) else {
            return;
        };

        for frame in &mut state.frames[info.start_frame..info.start_frame + info.num_frames] {
            frame.owner = None;
        }
        state.resident.remove(name);
        self.update_fragmentation(&state);
        debug!("Released frames of {}", name);
    }

    pub fn is_resident(&self, name: &str) -> bool {
        self.state.lock().resident.contains(name)
    }

    pub fn allocation(&self, name: &str) -> Option<ProcessMemoryInfo> {
        self.state.lock().allocations.get(name).copied()
    }

    /// Indices of frames currently owned by `name`
    pub fn frames_owned_by(&self, name: &str) -> Vec<usize> {
        self.state
            .lock()
            .frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| frame.owner.as_deref() == Some(name))
            .map(|(index, _)| index)
            .collect()
    }

    pub fn has_available_memory(&self) -> bool {
        self.state.lock().first_fit(self.frames_per_process).is_some()
    }

    /// Free runs strictly shorter than one process footprint, in bytes.
    ///
    /// Reads the value cached by the last allocate or release, so it never
    /// waits on the memory lock.
    pub fn external_fragmentation(&self) -> usize {
        self.fragmentation.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> MemoryStatistics {
        let state = self.state.lock();
        self.statistics_locked(&state)
    }

    fn statistics_locked(&self, state: &MemoryState) -> MemoryStatistics {
        // every resident process has the same footprint
        let used_memory = state.resident.len() * self.process_size;
        MemoryStatistics {
            total_memory: self.total_memory,
            used_memory,
            free_memory: self.total_memory - used_memory,
            process_count: state.resident.len(),
            external_fragmentation: state.fragmentation(self.frames_per_process, self.frame_size),
        }
    }

    /// Human readable usage summary
    pub fn memory_usage(&self) -> String {
        let stats = self.statistics();
        format!(
            "Memory Usage:\nTotal Memory: {}KB\nUsed Memory: {}KB\nFree Memory: {}KB\n\
             External Fragmentation: {}KB\nProcesses in Memory: {}\n",
            stats.total_memory / 1024,
            stats.used_memory / 1024,
            stats.free_memory / 1024,
            stats.external_fragmentation / 1024,
            stats.process_count
        )
    }

    /// Capture the current memory map for a snapshot
    pub fn memory_map(&self) -> MemorySnapshot {
        let state = self.state.lock();
        let stats = self.statistics_locked(&state);

        let mut resident: Vec<(String, ProcessMemoryInfo)> = state
            .allocations
            .iter()
            .map(|(name, info)| (name.clone(), *info))
            .collect();
        resident.sort_by(|a, b| b.1.start_address.cmp(&a.1.start_address));

        MemorySnapshot {
            generated_at: Local::now(),
            total_memory: self.total_memory,
            process_count: stats.process_count,
            external_fragmentation: stats.external_fragmentation,
            resident,
        }
    }

    /// Render the current memory map in the per-cycle snapshot layout
    pub fn render_snapshot(&self) -> String {
        self.memory_map().to_string()
    }

    /// Write `memory_stamp_<cycle>.txt` into the snapshot directory
    pub fn snapshot(&self, cycle: u64) -> Result<PathBuf, SnapshotError> {
        let path = self.snapshot_dir.join(format!("memory_stamp_{:02}.txt", cycle));
        let text = self.render_snapshot();

        fs::create_dir_all(&self.snapshot_dir)
            .and_then(|_| fs::write(&path, text))
            .map_err(|source| SnapshotError {
                path: path.clone(),
                source,
            })?;

        info!("Wrote memory snapshot {}", path.display());
        Ok(path)
    }

    fn update_fragmentation(&self, state: &MemoryState) {
        let fragmentation = state.fragmentation(self.frames_per_process, self.frame_size);
        let previous = self.fragmentation.swap(fragmentation, Ordering::AcqRel);
        if previous != fragmentation {
            debug!("External fragmentation now {} bytes", fragmentation);
        }
        if state.first_fit(self.frames_per_process).is_none() {
            debug!("Memory full: {} process(es) resident", state.resident.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::pcb::{Instruction, PrintInstruction};
    use crate::process::scheduler::SchedulingAlgorithm;

    #[derive(Default)]
    struct Recorder(parking_lot::Mutex<Vec<ProcessId>>);

    impl Admission for Recorder {
        fn admit(&self, pid: ProcessId) {
            self.0.lock().push(pid);
        }
    }

    /// 10 frames of 16 bytes, 4 frames per process
    fn setup(scheduler: SchedulingAlgorithm) -> (Arc<ProcessTable>, Arc<Recorder>, MemoryManager) {
        let config = Config {
            scheduler,
            max_overall_mem: 160,
            mem_per_frame: 16,
            mem_per_proc: 64,
            ..Config::default()
        };
        let table = Arc::new(ProcessTable::new());
        let recorder = Arc::new(Recorder::default());
        let memory = MemoryManager::new(&config, table.clone(), recorder.clone());
        (table, recorder, memory)
    }

    fn spawn(table: &ProcessTable, name: &str) -> ProcessId {
        let instructions: Vec<Box<dyn Instruction>> = vec![Box::new(PrintInstruction::default())];
        table.insert(name, instructions).unwrap()
    }

    #[test]
    fn derives_frame_geometry() {
        let (_, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        assert_eq!(memory.total_frames(), 10);
        assert_eq!(memory.frames_per_process(), 4);
        assert_eq!(memory.external_fragmentation(), 0);
    }

    #[test]
    fn fragmentation_scenario() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let p2 = spawn(&table, "P2");

        assert_eq!(memory.allocate(p1).unwrap().start_frame, 0);
        assert_eq!(memory.allocate(p2).unwrap().start_frame, 4);
        assert_eq!(memory.external_fragmentation(), 2 * 16);

        memory.release("P1");
        assert_eq!(memory.external_fragmentation(), 2 * 16);
        assert_eq!(memory.statistics().external_fragmentation, 2 * 16);
        assert!(!memory.is_resident("P1"));
    }

    #[test]
    fn frames_match_recorded_range() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let p2 = spawn(&table, "P2");
        memory.allocate(p1).unwrap();
        let info = memory.allocate(p2).unwrap();

        assert_eq!(memory.frames_owned_by("P2"), vec![4, 5, 6, 7]);
        assert_eq!(info.start_address, 64);
        assert_eq!(info.end_address, 127);
        assert_eq!(memory.allocation("P2"), Some(info));
        assert_eq!(memory.frames_owned_by("P1"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn first_fit_reuses_lowest_hole() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let p2 = spawn(&table, "P2");
        let p3 = spawn(&table, "P3");
        memory.allocate(p1).unwrap();
        memory.allocate(p2).unwrap();
        memory.release("P1");

        assert_eq!(memory.allocate(p3).unwrap().start_frame, 0);
    }

    #[test]
    fn allocate_is_idempotent_for_resident_process() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let first = memory.allocate(p1).unwrap();
        assert_eq!(memory.allocate(p1).unwrap(), first);
        assert_eq!(memory.statistics().process_count, 1);
    }

    #[test]
    fn release_of_unknown_process_is_noop() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        memory.allocate(p1).unwrap();
        let before = memory.external_fragmentation();
        memory.release("ghost");
        memory.release("ghost");
        assert_eq!(memory.external_fragmentation(), before);
        assert!(memory.is_resident("P1"));
    }

    #[test]
    fn no_fit_under_fcfs_is_not_readmitted() {
        let (table, recorder, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let p2 = spawn(&table, "P2");
        let p3 = spawn(&table, "P3");
        memory.allocate(p1).unwrap();
        memory.allocate(p2).unwrap();

        assert_eq!(
            memory.allocate(p3),
            Err(MemoryError::NoFit { name: "P3".into(), frames: 4 })
        );
        assert!(recorder.0.lock().is_empty());
        assert!(!memory.has_available_memory());
    }

    #[test]
    fn no_fit_under_round_robin_readmits() {
        let (table, recorder, memory) = setup(SchedulingAlgorithm::RoundRobin);
        let p1 = spawn(&table, "P1");
        let p2 = spawn(&table, "P2");
        let p3 = spawn(&table, "P3");
        memory.allocate(p1).unwrap();
        memory.allocate(p2).unwrap();
        table.get(p3).unwrap().set_state(ProcessState::Running);

        assert!(matches!(memory.allocate(p3), Err(MemoryError::NoFit { .. })));
        assert_eq!(*recorder.0.lock(), vec![p3]);
        assert_eq!(table.get(p3).unwrap().state(), ProcessState::Ready);
    }

    #[test]
    fn unknown_process_is_rejected() {
        let (table, _, memory) = setup(SchedulingAlgorithm::RoundRobin);
        let p1 = spawn(&table, "P1");
        let other = ProcessTable::new();
        other.insert("x", Vec::new()).unwrap();
        let stranger = other.insert("y", Vec::new()).unwrap();
        assert_ne!(stranger, p1);

        assert_eq!(memory.allocate(stranger), Err(MemoryError::UnknownProcess(stranger)));
    }

    #[test]
    fn contended_lock_times_out() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        let p1 = spawn(&table, "P1");
        let _held = memory.state.lock();
        assert_eq!(
            memory.allocate(p1),
            Err(MemoryError::LockTimeout(ALLOCATE_LOCK_TIMEOUT))
        );
        // cached value stays readable while the lock is held
        assert_eq!(memory.external_fragmentation(), 0);
    }

    #[test]
    fn statistics_use_uniform_footprint() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        memory.allocate(spawn(&table, "P1")).unwrap();
        let stats = memory.statistics();
        assert_eq!(stats.total_memory, 160);
        assert_eq!(stats.used_memory, 64);
        assert_eq!(stats.free_memory, 96);
        assert_eq!(stats.process_count, 1);
        assert_eq!(stats.external_fragmentation, 0);
    }

    #[test]
    fn snapshot_lists_processes_by_descending_address() {
        let (table, _, memory) = setup(SchedulingAlgorithm::FirstComeFirstServed);
        memory.allocate(spawn(&table, "P1")).unwrap();
        memory.allocate(spawn(&table, "P2")).unwrap();

        let map = memory.memory_map();
        let names: Vec<&str> = map.resident.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["P2", "P1"]);

        let text = map.to_string();
        let body: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(
            body,
            vec![
                "",
                "----end---- = 160",
                "",
                "128",
                "P2",
                "64",
                "",
                "64",
                "P1",
                "0",
                "",
                "----start---- = 0",
            ]
        );
        assert!(text.contains("Number of processes in memory: 2\n"));
        assert!(text.contains("Total external fragmentation in KB: 0\n"));
    }
}
