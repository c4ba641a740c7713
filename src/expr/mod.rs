//! Typed attribute expressions.
//!
//! This module handles everything between a raw attribute value in the
//! document and a concrete value handed to a provider:
//! - Parsing `${...}` interpolations into unbound trees
//! - Binding per instance (`count.index`, `each.*`, `var.*`, references)
//! - Evaluating against values of already planned or realised instances

mod parse;
mod bind;
mod eval;

use serde_json::Value;
use std::collections::BTreeMap;

/// Concrete attribute values of one resource.
pub type Attributes = BTreeMap<String, Value>;

pub use parse::{RawExpr, RawIndex, RawRef, parse_string, parse_value};
pub use bind::{BindScope, BlockInstances, Expr, lookup_path, render};
pub use eval::{ID_ATTRIBUTE, ResolutionContext, Resolved};
