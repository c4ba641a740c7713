//! Provider module.
//!
//! Providers perform the actual create/read/update/destroy calls on
//! external objects. This module defines the `Provider` trait, capability
//! tables, the registry, and two built-in providers.

mod local;
mod memory;
mod registry;
mod traits;

pub use local::{DEFAULT_LOCAL_ROOT, LOCAL_PROVIDER, LocalProvider};
pub use memory::{InMemoryProvider, ProviderCall, ProviderOperation};
pub use registry::ProviderRegistry;
pub use traits::{CapabilityTable, Mutability, Provider, ProviderOutput};

#[cfg(test)]
pub use traits::MockProvider;
