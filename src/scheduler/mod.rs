//! Scheduling core: everything between a task definition and a running scan.
//!
//! This module provides:
//!
//! - **TriggerScheduler**: durable per-task triggers that fire on schedule
//! - **ExecutionCreator**: the single entry point that creates executions
//! - **MissedRunAuditor**: catch-up creation for runs that never happened
//! - **AdmissionController**: promotes queued executions under the ceiling
//! - **ZombieReaper**: fails executions whose process has vanished
//!
//! # Architecture
//!
//! ```text
//!   ┌──────────────────┐      ┌──────────────────┐
//!   │ TriggerScheduler │      │ MissedRunAuditor │
//!   └────────┬─────────┘      └────────┬─────────┘
//!            │   create_execution      │
//!            └──────────┬──────────────┘
//!                ┌──────▼──────────┐
//!                │ ExecutionCreator│  creation guard + dedup
//!                └──────┬──────────┘
//!                       │ queued
//!              ┌────────▼────────────┐
//!              │ AdmissionController │ ──► dispatch::WorkerPool
//!              └─────────────────────┘
//!                       ▲ failed (zombie)
//!              ┌────────┴────────────┐
//!              │    ZombieReaper     │
//!              └─────────────────────┘
//! ```
//!
//! The auditor, admission controller and reaper run as independent
//! periodic sweeps driven by [`run_periodic`].

pub mod admission;
pub mod auditor;
pub mod creation;
pub mod reaper;
pub mod sweep;
pub mod trigger;

pub use admission::{AdmissionController, AdmissionReport};
pub use auditor::{AuditReport, MissedRunAuditor};
pub use creation::{CreateOrigin, CreateOutcome, ExecutionCreator};
pub use reaper::{ReapReport, ZombieReaper};
pub use sweep::run_periodic;
pub use trigger::{ReconcileReport, TriggerScheduler};
