//! Side-effecting adapters: processes, models, git, config and history.

pub mod cancel;
pub mod config;
pub mod environment;
pub mod git;
pub mod history;
pub mod model;
pub mod process;
pub mod prompt;
