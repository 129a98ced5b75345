//! Provider interface.
//!
//! Providers perform the physical operations behind each step. They are
//! only called while applying a plan, never while planning.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::resource::{OutputRef, PropertyMap, PropertyValue, TypeToken, Urn};
use crate::state::Snapshot;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Created {
    /// Provider-assigned ID.
    pub id: String,
    /// Outputs known after creation.
    pub outputs: PropertyMap,
}

impl Created {
    /// Creates a result with no outputs.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            outputs: PropertyMap::new(),
        }
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: PropertyMap) -> Self {
        self.outputs = outputs;
        self
    }
}

/// Physical resource operations.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource from fully resolved inputs.
    async fn create(&self, type_token: &TypeToken, inputs: &PropertyMap) -> Result<Created, ProviderError>;

    /// Updates a resource in place, returning its new outputs.
    async fn update(
        &self,
        type_token: &TypeToken,
        id: &str,
        old: &PropertyMap,
        new: &PropertyMap,
    ) -> Result<PropertyMap, ProviderError>;

    /// Deletes a resource.
    ///
    /// Returning [`ProviderError::NotFound`] is treated as success.
    async fn delete(&self, type_token: &TypeToken, id: &str, props: &PropertyMap) -> Result<(), ProviderError>;
}

/// Resolves output references in the inputs of `owner` against recorded
/// resources.
///
/// # Errors
///
/// Returns [`ProviderError::UnresolvedInput`] for the first input that is
/// still unknown or references an output the snapshot does not hold. The
/// error names the referenced resource, or `owner` for a bare placeholder.
pub fn resolve_inputs(owner: &Urn, inputs: &PropertyMap, snapshot: &Snapshot) -> Result<PropertyMap, ProviderError> {
    let lookup = |reference: &OutputRef| -> Option<PropertyValue> {
        snapshot.get(&reference.urn)?.output_value(reference)
    };
    let resolved = inputs.resolve(&lookup);

    if let Some((key, value)) = resolved.first_computed() {
        let mut refs = Vec::new();
        value.collect_refs(&mut refs);
        return Err(ProviderError::UnresolvedInput {
            property: key.clone(),
            urn: refs.first().map_or_else(|| owner.clone(), |r| r.urn.clone()),
        });
    }
    Ok(resolved)
}

/// Resolves the last-applied inputs of a resource.
///
/// References resolve against the instance the inputs were last applied
/// with, so a replaced instance still awaiting deletion wins over its live
/// successor. References that cannot be resolved are left in place.
#[must_use]
pub fn resolve_prior_inputs(inputs: &PropertyMap, snapshot: &Snapshot) -> PropertyMap {
    let lookup = |reference: &OutputRef| -> Option<PropertyValue> {
        snapshot
            .pending_deletes
            .iter()
            .rev()
            .find(|retired| retired.urn == reference.urn)
            .or_else(|| snapshot.get(&reference.urn))?
            .output_value(reference)
    };
    inputs.resolve(&lookup)
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory provider for tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records calls and fails on request.
    #[derive(Debug, Default)]
    pub struct FakeProvider {
        counter: AtomicUsize,
        pub calls: Mutex<Vec<String>>,
        pub old_inputs: Mutex<Vec<PropertyMap>>,
        pub fail: Mutex<HashMap<String, ProviderError>>,
        pub delay: Option<Duration>,
    }

    impl FakeProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_delay(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        /// Fails any operation on a resource whose `name` input is `name`.
        pub fn fail_on(&self, name: &str, error: ProviderError) {
            self.fail.lock().unwrap().insert(name.to_string(), error);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        async fn record(&self, call: String, props: &PropertyMap) -> Result<(), ProviderError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().unwrap().push(call);
            let name = props.get("name").and_then(PropertyValue::as_str).unwrap_or_default();
            match self.fail.lock().unwrap().get(name) {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        async fn create(&self, _type_token: &TypeToken, inputs: &PropertyMap) -> Result<Created, ProviderError> {
            let name = inputs.get("name").and_then(PropertyValue::as_str).unwrap_or_default().to_string();
            self.record(format!("create {name}"), inputs).await?;
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            let id = format!("{name}-{n}");
            let mut outputs = PropertyMap::new();
            outputs.insert("arn", format!("arn:{id}"));
            Ok(Created::new(id).with_outputs(outputs))
        }

        async fn update(
            &self,
            _type_token: &TypeToken,
            id: &str,
            old: &PropertyMap,
            new: &PropertyMap,
        ) -> Result<PropertyMap, ProviderError> {
            self.old_inputs.lock().unwrap().push(old.clone());
            let name = new.get("name").and_then(PropertyValue::as_str).unwrap_or_default().to_string();
            self.record(format!("update {name}"), new).await?;
            let mut outputs = PropertyMap::new();
            outputs.insert("arn", format!("arn:{id}"));
            Ok(outputs)
        }

        async fn delete(&self, _type_token: &TypeToken, id: &str, props: &PropertyMap) -> Result<(), ProviderError> {
            let name = props.get("name").and_then(PropertyValue::as_str).unwrap_or_default().to_string();
            self.record(format!("delete {name} {id}"), props).await
        }
    }
}
