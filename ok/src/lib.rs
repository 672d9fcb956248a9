//! Plan, implement and judge coding tasks with model CLIs.
//!
//! A task runs through a closed state machine: a planner drafts a plan until a
//! plan judge approves it, then every step is implemented in attempts that an
//! implementation judge and a completion judge review. The architecture keeps
//! a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (verdict parsing, plan extraction,
//!   budgets, the transition function). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (processes, model CLIs, git, config,
//!   session history). Behind traits so tests can script them.
//!
//! [`driver`] performs one task by alternating the two; [`looping`] runs a
//! list of tasks one after another.

pub mod core;
pub mod driver;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
