//! # twinspawn
//!
//! Pipeline that turns a natural-language request into small, independently
//! verified units of work and integrates them into a shared git mainline.
//!
//! ## Architecture
//!
//! ```text
//!   request ──▶ Decomposer ──▶ TaskRepository (TODO tasks)
//!                                   │
//!                                   ▼
//!                       TwinSpawn (per task, on its own branch)
//!                         Implementer ──▶ commit ──▶ Verifier
//!                         (retried with feedback, ends GREEN/RED/SPLIT)
//!                                   │
//!                                   ▼
//!                       DeployCycle (all GREEN branches)
//!                         merge ──▶ Integrator on conflict
//!                         integration suite ──▶ push or reset
//! ```
//!
//! ## Modules
//! - `llm`: inference gateway (OpenRouter)
//! - `tools`: file, search and command tools handed to roles
//! - `vcs`: git adapter, conflict parsing and the work-tree lock
//! - `task`: task model and repositories (in-memory, SQLite)
//! - `agents`: the agent loop and the four roles
//! - `orchestrator`: Twin-Spawn, deploy cycle and the driver

pub mod agents;
pub mod config;
pub mod llm;
pub mod orchestrator;
pub mod task;
pub mod tools;
pub mod vcs;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use orchestrator::{DeployCycle, Orchestrator, OrchestratorError, TwinSpawn};
pub use task::{SqliteTaskStore, Task, TaskRepository, TaskStatus};
pub use vcs::{GitRepo, VersionControl};
