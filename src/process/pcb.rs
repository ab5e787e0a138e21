// Process Control Block (PCB) for procsim
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Local};
use crossbeam_queue::ArrayQueue;
use spin::{Mutex, RwLock};
use thiserror::Error;

/// Timestamp layout used in process output, reports and snapshots
pub const TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S%p";

/// Core id of a process that is not bound to any core
pub const UNASSIGNED_CORE: isize = -1;

/// Number of output lines kept per process
const OUTPUT_CAPACITY: usize = 64;

/// Opaque process handle handed out by the [`ProcessTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,    // Waiting in the ready queue
    Running,  // Bound to a core
    Waiting,  // Parked outside the ready queue
    Finished, // All instructions executed
}

/// Process management errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("process name cannot be empty")]
    EmptyName,
    #[error("process with name '{0}' already exists")]
    DuplicateName(String),
    #[error("process {0} not found")]
    NotFound(ProcessId),
    #[error("process {0} has not finished")]
    NotFinished(ProcessId),
    /// Fatal: the scheduler tried to bind a core outside `[-1, num_cores)`.
    #[error("invalid CPU core id {core} (valid range is -1..{num_cores})")]
    InvalidCore { core: isize, num_cores: usize },
}

/// Failure raised from inside a single instruction
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("instruction failed: {0}")]
pub struct InstructionError(pub String);

/// What an instruction sees while it runs
pub struct ExecutionContext<'a> {
    pub process: &'a ProcessControlBlock,
    pub core: usize,
    pub cycle: u64,
}

impl ExecutionContext<'_> {
    /// Append a timestamped line to the process's output buffer
    pub fn print(&self, message: &str) {
        let line = format!(
            "({}) Core:{} \"{}\"",
            Local::now().format(TIMESTAMP_FORMAT),
            self.core,
            message
        );
        self.process.output.force_push(line);
    }
}

/// One unit of work. The scheduler only ever calls `execute` and advances
/// the program counter; what the instruction does is its own business.
pub trait Instruction: Send + Sync + fmt::Debug {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<(), InstructionError>;
}

/// Prints a greeting into the process output
#[derive(Debug, Clone, Default)]
pub struct PrintInstruction {
    message: Option<String>,
}

impl PrintInstruction {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

impl Instruction for PrintInstruction {
    fn execute(&self, ctx: &ExecutionContext<'_>) -> Result<(), InstructionError> {
        match &self.message {
            Some(message) => ctx.print(message),
            None => ctx.print(&format!("Hello world from {}!", ctx.process.name())),
        }
        Ok(())
    }
}

/// Process Control Block (PCB) - per-process scheduling state
///
/// Identity is fixed at creation. Everything the scheduler mutates lives
/// behind atomics or a short spin lock so a PCB can be shared by reference
/// between the owning table, a core worker and report readers.
pub struct ProcessControlBlock {
    pid: ProcessId,
    name: String,
    created_at: DateTime<Local>,
    state: Mutex<ProcessState>,
    core: AtomicIsize,
    quantum: AtomicU32,
    program_counter: AtomicUsize,
    instructions: Vec<Box<dyn Instruction>>,
    output: ArrayQueue<String>,
}

impl ProcessControlBlock {
    fn new(pid: ProcessId, name: String, instructions: Vec<Box<dyn Instruction>>) -> Self {
        Self {
            pid,
            name,
            created_at: Local::now(),
            state: Mutex::new(ProcessState::Ready),
            core: AtomicIsize::new(UNASSIGNED_CORE),
            quantum: AtomicU32::new(0),
            program_counter: AtomicUsize::new(0),
            instructions,
            output: ArrayQueue::new(OUTPUT_CAPACITY),
        }
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<Local> {
        self.created_at
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: ProcessState) {
        *self.state.lock() = state;
    }

    /// Bound core, `-1` when unassigned
    pub fn core(&self) -> isize {
        self.core.load(Ordering::Acquire)
    }

    /// Bind the process to `core`, or unbind it with `-1`.
    ///
    /// Anything outside `[-1, num_cores)` is a scheduler bug and is reported
    /// as the fatal [`ProcessError::InvalidCore`]; the value is never clamped.
    pub fn set_core(&self, core: isize, num_cores: usize) -> Result<(), ProcessError> {
        if core < UNASSIGNED_CORE || core >= num_cores as isize {
            return Err(ProcessError::InvalidCore { core, num_cores });
        }
        self.core.store(core, Ordering::Release);
        Ok(())
    }

    pub fn quantum(&self) -> u32 {
        self.quantum.load(Ordering::Acquire)
    }

    pub fn increment_quantum(&self) {
        self.quantum.fetch_add(1, Ordering::AcqRel);
    }

    pub fn reset_quantum(&self) {
        self.quantum.store(0, Ordering::Release);
    }

    /// Instructions completed so far
    pub fn progress(&self) -> usize {
        self.program_counter.load(Ordering::Acquire)
    }

    pub fn total_instructions(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_finished(&self) -> bool {
        self.progress() >= self.total_instructions()
    }

    /// Run the instruction under the program counter, if any is left
    pub fn execute_current(&self, core: usize, cycle: u64) -> Result<(), InstructionError> {
        match self.instructions.get(self.progress()) {
            Some(instruction) => instruction.execute(&ExecutionContext {
                process: self,
                core,
                cycle,
            }),
            None => Ok(()),
        }
    }

    /// Move the program counter forward, saturating at the instruction count
    pub fn advance(&self) {
        let total = self.total_instructions();
        let _ = self
            .program_counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pc| {
                (pc < total).then_some(pc + 1)
            });
    }

    /// Drain buffered output lines, oldest first
    pub fn take_output(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.output.len());
        while let Some(line) = self.output.pop() {
            lines.push(line);
        }
        lines
    }

    /// Render the process-smi style view without consuming output
    pub fn describe(&self) -> String {
        let mut text = format!(
            "Process: {}\nID: {}\nCreated: {}\n",
            self.name,
            self.pid,
            self.created_at.format(TIMESTAMP_FORMAT)
        );
        if self.state() == ProcessState::Finished {
            text.push_str(&format!(
                "Finished    {} / {}\n",
                self.total_instructions(),
                self.total_instructions()
            ));
        } else {
            text.push_str(&format!(
                "Core: {}    {} / {}\n",
                self.core(),
                self.progress(),
                self.total_instructions()
            ));
        }
        text
    }
}

impl fmt::Debug for ProcessControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessControlBlock")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("core", &self.core())
            .field("quantum", &self.quantum())
            .field("progress", &self.progress())
            .field("total", &self.total_instructions())
            .finish()
    }
}

#[derive(Default)]
struct TableInner {
    processes: BTreeMap<ProcessId, Arc<ProcessControlBlock>>,
    names: BTreeMap<String, ProcessId>,
}

/// Process arena.
///
/// Owns every PCB. The scheduler and memory manager only keep
/// [`ProcessId`]s and resolve them here when they need the block.
pub struct ProcessTable {
    next_pid: AtomicU64,
    inner: RwLock<TableInner>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU64::new(1), // Start from PID 1
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// Create a process in `Ready`. Fails without side effects on an empty
    /// or already used name.
    pub fn insert(
        &self,
        name: &str,
        instructions: Vec<Box<dyn Instruction>>,
    ) -> Result<ProcessId, ProcessError> {
        if name.is_empty() {
            return Err(ProcessError::EmptyName);
        }

        let mut inner = self.inner.write();
        if inner.names.contains_key(name) {
            return Err(ProcessError::DuplicateName(name.to_string()));
        }

        let pid = ProcessId(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let pcb = ProcessControlBlock::new(pid, name.to_string(), instructions);
        inner.processes.insert(pid, Arc::new(pcb));
        inner.names.insert(name.to_string(), pid);
        Ok(pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<ProcessControlBlock>> {
        self.inner.read().processes.get(&pid).cloned()
    }

    pub fn find(&self, name: &str) -> Option<ProcessId> {
        self.inner.read().names.get(name).copied()
    }

    /// All processes in pid order
    pub fn list(&self) -> Vec<Arc<ProcessControlBlock>> {
        self.inner.read().processes.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a finished process from the arena
    pub fn remove(&self, pid: ProcessId) -> Result<Arc<ProcessControlBlock>, ProcessError> {
        let mut inner = self.inner.write();
        let pcb = inner
            .processes
            .get(&pid)
            .cloned()
            .ok_or(ProcessError::NotFound(pid))?;
        if pcb.state() != ProcessState::Finished {
            return Err(ProcessError::NotFinished(pid));
        }
        inner.processes.remove(&pid);
        inner.names.remove(pcb.name());
        Ok(pcb)
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
