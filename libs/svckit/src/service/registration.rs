//! Registration records and the handles that point at them.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use super::object::{ServiceId, ServiceObject, ServiceScope, ServiceSource};
use super::registry::RegistryShared;
use crate::bundle::{Bundle, BundleId};
use crate::properties::{PropertyMap, PropertyValue, SERVICE_RANKING};
use crate::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RegistrationState {
    Registered = 0,
    /// UNREGISTERING is being delivered; still queryable but not handed out.
    Unregistering = 1,
    Unregistered = 2,
}

/// Per-consumer bookkeeping for one registration.
#[derive(Default)]
pub(crate) struct UsageTable {
    /// Outstanding `get_service` calls per consuming bundle (singleton and bundle scope).
    pub(crate) counts: HashMap<BundleId, usize>,
    /// Factory-created singleton, shared by every consumer.
    pub(crate) shared: Option<(Bundle, ServiceObject)>,
    /// Factory-created objects for bundle scope.
    pub(crate) per_bundle: HashMap<BundleId, (Bundle, ServiceObject)>,
    /// Every outstanding prototype object, per consuming bundle.
    pub(crate) prototypes: HashMap<BundleId, (Bundle, Vec<ServiceObject>)>,
}

impl UsageTable {
    pub(crate) fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub(crate) fn is_used_by(&self, bundle: BundleId) -> bool {
        self.counts.get(&bundle).is_some_and(|c| *c > 0)
            || self
                .prototypes
                .get(&bundle)
                .is_some_and(|(_, objs)| !objs.is_empty())
    }
}

pub(crate) struct RegistrationCore {
    pub(crate) id: ServiceId,
    pub(crate) interfaces: Arc<[String]>,
    pub(crate) scope: ServiceScope,
    pub(crate) bundle: Bundle,
    pub(crate) source: ServiceSource,
    pub(crate) properties: ArcSwap<PropertyMap>,
    state: AtomicU8,
    pub(crate) usage: Mutex<UsageTable>,
}

impl RegistrationCore {
    pub(crate) fn new(
        id: ServiceId,
        interfaces: Vec<String>,
        scope: ServiceScope,
        bundle: Bundle,
        source: ServiceSource,
        properties: PropertyMap,
    ) -> Self {
        Self {
            id,
            interfaces: interfaces.into(),
            scope,
            bundle,
            source,
            properties: ArcSwap::from_pointee(properties),
            state: AtomicU8::new(RegistrationState::Registered as u8),
            usage: Mutex::new(UsageTable::default()),
        }
    }

    pub(crate) fn state(&self) -> RegistrationState {
        match self.state.load(AtomicOrdering::Acquire) {
            0 => RegistrationState::Registered,
            1 => RegistrationState::Unregistering,
            _ => RegistrationState::Unregistered,
        }
    }

    /// Moves from `Registered` to `Unregistering`; false if another caller got there first.
    pub(crate) fn begin_unregister(&self) -> bool {
        self.state
            .compare_exchange(
                RegistrationState::Registered as u8,
                RegistrationState::Unregistering as u8,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn finish_unregister(&self) {
        self.state
            .store(RegistrationState::Unregistered as u8, AtomicOrdering::Release);
    }

    pub(crate) fn ranking(&self) -> i64 {
        ranking_of(&self.properties.load())
    }
}

/// `service.ranking` as an integer; absent or non-numeric values rank 0.
pub(crate) fn ranking_of(props: &PropertyMap) -> i64 {
    props
        .get(SERVICE_RANKING)
        .and_then(PropertyValue::as_i64)
        .unwrap_or(0)
}

/// Copyable handle to a registration.
///
/// Property reads keep working after the service is unregistered (they return the
/// last known values); obtaining the service object goes through the registry and
/// fails once the registration is gone.
#[derive(Clone)]
pub struct ServiceReference {
    pub(crate) core: Arc<RegistrationCore>,
}

impl ServiceReference {
    pub(crate) fn new(core: Arc<RegistrationCore>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    pub fn interfaces(&self) -> &[String] {
        &self.core.interfaces
    }

    pub fn scope(&self) -> ServiceScope {
        self.core.scope
    }

    /// Bundle that published the service.
    pub fn bundle(&self) -> &Bundle {
        &self.core.bundle
    }

    pub fn ranking(&self) -> i64 {
        self.core.ranking()
    }

    pub fn property(&self, key: &str) -> Option<PropertyValue> {
        self.core.properties.load().get(key).cloned()
    }

    pub fn properties(&self) -> Arc<PropertyMap> {
        self.core.properties.load_full()
    }

    /// True while the registration can still hand out service objects.
    pub fn is_available(&self) -> bool {
        self.core.state() == RegistrationState::Registered
    }

    /// Bundles currently holding the service.
    pub fn using_bundles(&self) -> Vec<BundleId> {
        let usage = self.core.usage.lock();
        let mut ids: Vec<BundleId> = usage
            .counts
            .iter()
            .filter(|(_, c)| **c > 0)
            .map(|(id, _)| *id)
            .chain(
                usage
                    .prototypes
                    .iter()
                    .filter(|(_, (_, objs))| !objs.is_empty())
                    .map(|(id, _)| *id),
            )
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Best-first comparison: higher ranking first, then lower id.
    pub fn best_first(&self, other: &ServiceReference) -> Ordering {
        other
            .ranking()
            .cmp(&self.ranking())
            .then(self.id().cmp(&other.id()))
    }
}

impl PartialEq for ServiceReference {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for ServiceReference {}

impl std::hash::Hash for ServiceReference {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.core.id.hash(state);
    }
}

impl fmt::Debug for ServiceReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceReference")
            .field("id", &self.core.id)
            .field("interfaces", &self.core.interfaces)
            .field("bundle", &self.core.bundle.id())
            .finish()
    }
}

/// Owner-side handle returned by `register`.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub(crate) core: Arc<RegistrationCore>,
    pub(crate) registry: Weak<RegistryShared>,
}

impl ServiceRegistration {
    pub fn reference(&self) -> ServiceReference {
        ServiceReference::new(self.core.clone())
    }

    pub fn id(&self) -> ServiceId {
        self.core.id
    }

    /// Replaces the custom properties; reserved keys keep their registry-assigned
    /// values. Fires MODIFIED and, where a filter stopped matching, MODIFIED_ENDMATCH.
    pub fn set_properties(&self, properties: PropertyMap) -> Result<(), RegistryError> {
        let registry = self.registry.upgrade().ok_or(RegistryError::FrameworkStopped)?;
        registry.set_properties(&self.core, properties)
    }

    /// Removes the service. A second call fails with `AlreadyUnregistered`.
    pub fn unregister(&self) -> Result<(), RegistryError> {
        let registry = self.registry.upgrade().ok_or(RegistryError::FrameworkStopped)?;
        registry.unregister(&self.core)
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("id", &self.core.id)
            .field("interfaces", &self.core.interfaces)
            .finish()
    }
}
