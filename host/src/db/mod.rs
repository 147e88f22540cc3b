//! Host relational store (spec.md §4.E Task store, §4.C Node registry).
//!
//! Uses runtime-checked `sqlx::query()` rather than the `query!()` macro:
//! the schema comes from migrations that may not exist at compile time
//! (the same convention the teacher's `ob-workflow` crate documents in
//! `listener.rs`).

pub mod nodes;
pub mod tasks;

pub use nodes::NodeRepo;
pub use tasks::{CasOutcome, TaskRepo};
