//! Durable state store — the single source of truth.
//!
//! ## Overview
//!
//! Every entity the control plane coordinates on (codebases, candidates,
//! the work queue, leases, runs, publishes, merge proposals, change sets,
//! policies, workers) lives in one SQLite database. Components never share
//! mutable in-process state; all cross-component coordination goes through
//! this store plus best-effort event-bus notifications.
//!
//! ## Module Map
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | Entity structs + DB enums (stable string values)            |
//! | `db`     | Schema migration, CRUD, transactions, async `Db` handle     |
//! | `views`  | Derived views: last-run resolution, change-set state,       |
//! |          | publish-ready set, queue positions                          |
//!
//! The derived views are part of the store's contract: every write path that
//! touches their inputs recomputes them inside the same transaction, so they
//! are consistent at commit.

pub mod db;
pub mod models;
pub mod views;

pub use db::{Db, StateDb};
