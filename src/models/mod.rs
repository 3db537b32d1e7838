pub mod exit;
pub mod job;
pub mod live_queue;
pub mod offload;
pub mod pipeline;
