pub mod runner;

pub use runner::{JobRunner, TaskHook, DEFAULT_NUM_TASKS};
