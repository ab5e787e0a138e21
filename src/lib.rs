// procsim: multi-core process scheduling and memory simulator
pub mod config;
pub mod process;
pub mod services;


pub use config::{Config, ConfigError};
pub use process::{ProcessId, ProcessTable, Scheduler, SchedulingAlgorithm};
pub use services::memory_service::{MemoryError, MemoryManager};
pub use services::process_service::ProcessService;
