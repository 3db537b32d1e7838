pub mod collaborators;
pub mod database;
pub mod exit_protocol;
pub mod headroom;
pub mod live_queue;
pub mod notifier;
pub mod offload;
pub mod offload_monitor;
pub mod pipeline;
pub mod process;
pub mod queue;
pub mod singleton_lock;
pub mod storage;
pub mod watchdog;
