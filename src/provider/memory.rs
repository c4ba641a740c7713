//! Programmable in-memory provider.
//!
//! Holds objects in a map and lets callers inject failures, add latency,
//! mutate or delete objects behind the engine's back, and inspect every call.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::expr::Attributes;

use super::traits::{CapabilityTable, Provider, ProviderOutput};

/// A provider operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderOperation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `destroy`
    Destroy,
}

impl fmt::Display for ProviderOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Read => write!(f, "read"),
            Self::Update => write!(f, "update"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    /// Operation invoked.
    pub operation: ProviderOperation,
    /// Resource type passed.
    pub resource_type: String,
    /// External id passed (or assigned, for create).
    pub external_id: Option<String>,
    /// Attributes passed to create/update.
    pub attributes: Option<Attributes>,
}

/// Injected failure.
#[derive(Debug, Clone)]
struct FailureRule {
    operation: ProviderOperation,
    resource_type: String,
    /// Only objects whose attribute equals this value fail.
    matching: Option<(String, Value)>,
    message: String,
}

impl FailureRule {
    fn matches(&self, operation: ProviderOperation, resource_type: &str, attributes: Option<&Attributes>) -> bool {
        if self.operation != operation || self.resource_type != resource_type {
            return false;
        }
        match &self.matching {
            None => true,
            Some((key, value)) => attributes.and_then(|a| a.get(key)) == Some(value),
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    resource_type: String,
    attributes: Attributes,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, StoredObject>,
    next_id: u64,
    failures: Vec<FailureRule>,
    calls: Vec<ProviderCall>,
    capabilities: BTreeMap<String, CapabilityTable>,
}

/// In-memory provider.
#[derive(Debug)]
pub struct InMemoryProvider {
    name: String,
    latency: Option<Duration>,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter when a call finishes.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryProvider {
    /// Creates an empty provider named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            latency: None,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Sets the capability table of `resource_type`.
    #[must_use]
    pub fn with_capabilities(self, resource_type: &str, table: CapabilityTable) -> Self {
        self.lock()
            .capabilities
            .insert(resource_type.to_string(), table);
        self
    }

    /// Marks attribute paths of `resource_type` as replace-only.
    #[must_use]
    pub fn with_replace_paths<I, S>(self, resource_type: &str, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with_capabilities(resource_type, CapabilityTable::requires_replace(paths))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every `operation` on `resource_type` fail.
    pub fn fail(&self, operation: ProviderOperation, resource_type: &str, message: &str) {
        self.lock().failures.push(FailureRule {
            operation,
            resource_type: resource_type.to_string(),
            matching: None,
            message: message.to_string(),
        });
    }

    /// Makes `operation` fail on objects of `resource_type` whose attribute
    /// `key` equals `value`.
    pub fn fail_when(
        &self,
        operation: ProviderOperation,
        resource_type: &str,
        key: &str,
        value: Value,
        message: &str,
    ) {
        self.lock().failures.push(FailureRule {
            operation,
            resource_type: resource_type.to_string(),
            matching: Some((key.to_string(), value)),
            message: message.to_string(),
        });
    }

    /// Removes every injected failure.
    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Adds an object directly, as if created outside the engine.
    pub fn insert_external(&self, resource_type: &str, attributes: Attributes) -> String {
        let mut inner = self.lock();
        let id = next_id(&self.name, &mut inner);
        inner.objects.insert(
            id.clone(),
            StoredObject {
                resource_type: resource_type.to_string(),
                attributes,
            },
        );
        id
    }

    /// Sets one attribute of an object, simulating out-of-band drift.
    ///
    /// Returns false if the object does not exist.
    pub fn set_external(&self, external_id: &str, key: &str, value: Value) -> bool {
        self.lock()
            .objects
            .get_mut(external_id)
            .map(|object| object.attributes.insert(key.to_string(), value))
            .is_some()
    }

    /// Deletes an object out-of-band.
    pub fn delete_external(&self, external_id: &str) -> bool {
        self.lock().objects.remove(external_id).is_some()
    }

    /// Returns the attributes of an object.
    #[must_use]
    pub fn object(&self, external_id: &str) -> Option<Attributes> {
        self.lock()
            .objects
            .get(external_id)
            .map(|object| object.attributes.clone())
    }

    /// Returns the ids of all objects of `resource_type`.
    #[must_use]
    pub fn object_ids(&self, resource_type: &str) -> Vec<String> {
        self.lock()
            .objects
            .iter()
            .filter(|(_, object)| object.resource_type == resource_type)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Returns the number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Returns every recorded call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Returns the number of recorded calls of `operation`.
    #[must_use]
    pub fn call_count(&self, operation: ProviderOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Returns the number of mutating calls (create, update, destroy).
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation != ProviderOperation::Read)
            .count()
    }

    /// Clears the call log.
    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Returns the highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        guard
    }

    fn check_failure(
        inner: &Inner,
        operation: ProviderOperation,
        resource_type: &str,
        attributes: Option<&Attributes>,
    ) -> ProviderResult<()> {
        match inner
            .failures
            .iter()
            .find(|rule| rule.matches(operation, resource_type, attributes))
        {
            Some(rule) => Err(ProviderError::failed(operation.to_string(), &rule.message)),
            None => Ok(()),
        }
    }
}

fn next_id(name: &str, inner: &mut Inner) -> String {
    inner.next_id += 1;
    format!("{name}-{}", inner.next_id)
}

#[async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self, resource_type: &str) -> CapabilityTable {
        self.lock()
            .capabilities
            .get(resource_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn create(
        &self,
        resource_type: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput> {
        let _flight = self.enter().await;
        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Create,
            resource_type: resource_type.to_string(),
            external_id: None,
            attributes: Some(attributes.clone()),
        });
        Self::check_failure(&inner, ProviderOperation::Create, resource_type, Some(attributes))?;

        let id = next_id(&self.name, &mut inner);
        inner.objects.insert(
            id.clone(),
            StoredObject {
                resource_type: resource_type.to_string(),
                attributes: attributes.clone(),
            },
        );
        if let Some(call) = inner.calls.last_mut() {
            call.external_id = Some(id.clone());
        }
        debug!("{}: created {resource_type} {id}", self.name);
        Ok(ProviderOutput::new(id, attributes.clone()))
    }

    async fn read(&self, resource_type: &str, external_id: &str) -> ProviderResult<ProviderOutput> {
        let _flight = self.enter().await;
        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Read,
            resource_type: resource_type.to_string(),
            external_id: Some(external_id.to_string()),
            attributes: None,
        });

        let object = inner
            .objects
            .get(external_id)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(external_id))?;
        Self::check_failure(&inner, ProviderOperation::Read, resource_type, Some(&object.attributes))?;
        Ok(ProviderOutput::new(external_id, object.attributes))
    }

    async fn update(
        &self,
        resource_type: &str,
        external_id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<ProviderOutput> {
        let _flight = self.enter().await;
        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Update,
            resource_type: resource_type.to_string(),
            external_id: Some(external_id.to_string()),
            attributes: Some(attributes.clone()),
        });
        Self::check_failure(&inner, ProviderOperation::Update, resource_type, Some(attributes))?;

        let object = inner
            .objects
            .get_mut(external_id)
            .ok_or_else(|| ProviderError::not_found(external_id))?;
        object.attributes = attributes.clone();
        debug!("{}: updated {resource_type} {external_id}", self.name);
        Ok(ProviderOutput::new(external_id, attributes.clone()))
    }

    async fn destroy(&self, resource_type: &str, external_id: &str) -> ProviderResult<()> {
        let _flight = self.enter().await;
        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            operation: ProviderOperation::Destroy,
            resource_type: resource_type.to_string(),
            external_id: Some(external_id.to_string()),
            attributes: None,
        });

        let attributes = inner.objects.get(external_id).map(|o| o.attributes.clone());
        Self::check_failure(&inner, ProviderOperation::Destroy, resource_type, attributes.as_ref())?;

        if inner.objects.remove(external_id).is_none() {
            return Err(ProviderError::not_found(external_id));
        }
        debug!("{}: destroyed {resource_type} {external_id}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(name: &str) -> Attributes {
        [(String::from("name"), json!(name))].into_iter().collect()
    }

    #[tokio::test]
    async fn test_crud_and_call_log() {
        let provider = InMemoryProvider::new("mem");
        let out = provider.create("mem_thing", &attrs("a")).await.unwrap();
        assert_eq!(out.external_id, "mem-1");

        provider.update("mem_thing", "mem-1", &attrs("b")).await.unwrap();
        assert_eq!(provider.object("mem-1"), Some(attrs("b")));

        provider.destroy("mem_thing", "mem-1").await.unwrap();
        assert_eq!(provider.object_count(), 0);

        let ops: Vec<ProviderOperation> = provider.calls().iter().map(|c| c.operation).collect();
        assert_eq!(
            ops,
            vec![
                ProviderOperation::Create,
                ProviderOperation::Update,
                ProviderOperation::Destroy
            ]
        );
        assert_eq!(provider.calls()[0].external_id.as_deref(), Some("mem-1"));
        assert_eq!(provider.mutation_count(), 3);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let provider = InMemoryProvider::new("mem");
        provider.fail_when(ProviderOperation::Create, "mem_thing", "name", json!("bad"), "quota exceeded");

        assert!(provider.create("mem_thing", &attrs("good")).await.is_ok());
        let err = provider.create("mem_thing", &attrs("bad")).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(provider.object_count(), 1);

        provider.clear_failures();
        assert!(provider.create("mem_thing", &attrs("bad")).await.is_ok());
    }

    #[tokio::test]
    async fn test_out_of_band_changes() {
        let provider = InMemoryProvider::new("mem");
        let id = provider.insert_external("mem_thing", attrs("a"));

        assert!(provider.set_external(&id, "name", json!("drifted")));
        let live = provider.read("mem_thing", &id).await.unwrap();
        assert_eq!(live.attributes["name"], json!("drifted"));

        assert!(provider.delete_external(&id));
        assert!(provider.read("mem_thing", &id).await.unwrap_err().is_not_found());
        assert!(provider.destroy("mem_thing", &id).await.unwrap_err().is_not_found());
    }

    #[test]
    fn test_capabilities() {
        let provider = InMemoryProvider::new("mem").with_replace_paths("mem_thing", ["zone"]);
        assert!(provider.capabilities("mem_thing").requires_replacement("zone"));
        assert!(!provider.capabilities("mem_other").requires_replacement("zone"));
    }
}
