//! Node-side execution of grid tasks.
//!
//! - [`NodeAgent`]: registers a worker machine with the dispatcher, runs the
//!   tasks it is handed and kills process trees on request
//! - [`TaskRunner`]: spawns one task's process and captures its outcome
//! - [`ProcessTreeKiller`]: terminates a process and all of its descendants
//!
//! # Execution Flow
//!
//! 1. `launch-task` arrives on the node's topic
//! 2. Execution parameters are read from the job database
//! 3. [`TaskRunner::run`] spawns `sh -c <cmd>`; `task-started` carries the pid
//! 4. The result is recorded and `task-complete` goes back to the dispatcher
//!
//! Commands run directly through the shell without sandboxing.

pub mod agent;
pub mod executor;
pub mod process_tree;

pub use agent::NodeAgent;
pub use executor::{TaskExecResult, TaskRunner, TaskRunnerEvent};
pub use process_tree::{ProcessTreeKiller, ProcfsTreeKiller};
