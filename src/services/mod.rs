// Services layered over the scheduler for procsim
pub mod memory_service;
pub mod process_service;
