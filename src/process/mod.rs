pub mod exit;
pub mod scheduler;
pub mod signal;
pub mod thread;
pub mod wait;

pub use thread::{current_tid, Thread, ThreadGroup, Tid};
