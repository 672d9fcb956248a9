//! Deterministic, pure logic for running one task.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod error;
pub mod implementation;
pub mod machine;
pub mod plan;
pub mod planning;
pub mod types;
pub mod verdict;
