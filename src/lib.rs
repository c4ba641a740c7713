// ============================================================================
// Linting - Dangerous or non-idiomatic practices are flagged
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items should be documented
#![warn(dead_code)]                   // Unused code is flagged
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness
#![warn(unused_imports)]              // Unused imports are flagged
#![warn(unused_variables)]            // Unused variables are flagged
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests unwrap freely.
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative reconciliation engine: it turns a desired-state document
//! into real objects through pluggable providers, and keeps them converged.
//!
//! ## Overview
//!
//! Converge gives you a plan/apply workflow for anything a provider can
//! create, read, update and destroy:
//!
//! - Describe resources in a YAML or JSON document, with `count`/`for_each`
//!   multiplicity and `${...}` references between resources
//! - Preview every change as a plan before anything is touched
//! - Apply plans concurrently, in dependency order, containing failures
//! - Detect drift between the recorded state and the live objects
//! - Keep versioned, locked state locally or in S3
//!
//! ## Architecture
//!
//! A run follows one pipeline:
//!
//! 1. **Graph**: the document is expanded into instances and ordered
//! 2. **Lock**: the workspace state is locked for the run
//! 3. **Refresh**: recorded objects are re-read from their providers
//! 4. **Plan**: desired instances are diffed against the refreshed state
//! 5. **Apply**: steps run as their dependencies complete; state is
//!    persisted after every success
//!
//! ## Modules
//!
//! - [`config`]: Document types, parsing, environment overrides, validation
//! - [`expr`]: `${...}` attribute expressions
//! - [`graph`]: Addresses, multiplicity expansion, dependency graph
//! - [`state`]: Snapshots, locks and state backends (memory, local, S3)
//! - [`provider`]: Provider trait, registry and built-in providers
//! - [`planner`]: Refresh, diff, plans and the apply executor
//! - [`reconciler`]: The end-to-end pipeline and state administration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! state:
//!   backend: local
//!   workspace: dev
//!
//! resources:
//!   - type: local_dir
//!     name: root
//!     attributes:
//!       path: build
//!
//!   - type: local_file
//!     name: config
//!     for_each: [api, worker]
//!     attributes:
//!       dir: "${local_dir.root.id}"
//!       content: "service = ${each.key}"
//!
//! outputs:
//!   config_ids: "${local_file.config[*].id}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod expr;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, Document};
pub use error::{ConvergeError, Result};
pub use graph::{BuiltGraph, GraphBuilder, ResourceAddress};
pub use planner::{ApplyExecutor, ApplyReport, DiffEngine, Plan, PlanMode};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{DriftReport, ReconcileOutcome, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};
