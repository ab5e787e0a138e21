// Process Management Module for procsim
pub mod clock;
pub mod pcb;
pub mod scheduler;

pub use clock::{CycleBarrier, PeriodicTimer};
pub use pcb::{
    ExecutionContext, Instruction, InstructionError, PrintInstruction, ProcessControlBlock,
    ProcessError, ProcessId, ProcessState, ProcessTable,
};
pub use scheduler::{
    Admission, CycleSource, Scheduler, SchedulerError, SchedulingAlgorithm, UtilizationReport,
};
