//! Graph building module.
//!
//! This module turns a desired-state document into a dependency graph:
//! - Resource addresses and instance keys
//! - `count` / `for_each` expansion
//! - Implicit and explicit edge inference
//! - Cycle detection and creation/destruction ordering

mod address;
mod expand;
mod dag;
mod builder;

pub use address::{InstanceKey, ResourceAddress, is_identifier};
pub use expand::{Multiplicity, ResourceInstance};
pub use dag::DependencyGraph;
pub use builder::{BuiltGraph, GraphBuilder};
