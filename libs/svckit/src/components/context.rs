use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use super::instance::BoundService;
use super::runtime::RuntimeShared;
use crate::bundle::Bundle;
use crate::framework::BundleContext;
use crate::properties::PropertyMap;
use crate::service::ServiceInterface;

/// View handed to a component's factory and lifecycle callbacks.
pub struct ComponentContext {
    pub(crate) name: String,
    pub(crate) properties: PropertyMap,
    pub(crate) bundle_context: BundleContext,
    pub(crate) using_bundle: Option<Bundle>,
    pub(crate) bound: BTreeMap<String, Vec<BoundService>>,
    pub(crate) runtime: Weak<RuntimeShared>,
}

impl ComponentContext {
    pub fn component_name(&self) -> &str {
        &self.name
    }

    /// Effective configuration, including `component.name` and `component.id`.
    pub fn properties(&self) -> &PropertyMap {
        &self.properties
    }

    pub fn bundle_context(&self) -> &BundleContext {
        &self.bundle_context
    }

    /// The consumer this instance was created for; `None` for singleton instances.
    pub fn using_bundle(&self) -> Option<&Bundle> {
        self.using_bundle.as_ref()
    }

    /// Best bound service of `reference`, as `T`.
    pub fn locate_service<T: ?Sized + ServiceInterface>(&self, reference: &str) -> Option<Arc<T>> {
        self.bound.get(reference)?.iter().find_map(|b| b.get::<T>())
    }

    /// Every bound service of `reference`, as `T`, best first.
    pub fn locate_services<T: ?Sized + ServiceInterface>(&self, reference: &str) -> Vec<Arc<T>> {
        self.bound
            .get(reference)
            .map(|bound| bound.iter().filter_map(|b| b.get::<T>()).collect())
            .unwrap_or_default()
    }

    pub fn bound_services(&self, reference: &str) -> &[BoundService] {
        self.bound.get(reference).map(Vec::as_slice).unwrap_or_default()
    }

    /// Enables a component of the same bundle. Takes effect asynchronously.
    pub fn enable_component(&self, name: &str) {
        self.post_enabled(name, true);
    }

    /// Disables a component of the same bundle. Takes effect asynchronously.
    pub fn disable_component(&self, name: &str) {
        self.post_enabled(name, false);
    }

    fn post_enabled(&self, name: &str, enabled: bool) {
        match self.runtime.upgrade() {
            Some(runtime) => {
                runtime.post_set_enabled(self.bundle_context.bundle().id(), name.to_owned(), enabled)
            }
            None => tracing::warn!(component = name, "Component runtime is gone, request dropped"),
        }
    }
}
