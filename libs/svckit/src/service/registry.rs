//! The service registry: registration table, scoped service objects and event dispatch.
//!
//! Registrations live in an id-keyed table behind a read-write lock. Ids are never
//! reused, so a reference to a removed registration simply misses the table.
//! User code (factories, listeners, hooks) is never called with a registry lock held.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::object::{ServiceFactory, ServiceId, ServiceObject, ServiceScope, ServiceSource};
use super::registration::{RegistrationCore, RegistrationState, ServiceReference, ServiceRegistration};
use crate::bundle::{Bundle, BundleId};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, Severity};
use crate::events::{
    BundleEvent, FrameworkEvent, FrameworkEventKind, ServiceEvent, ServiceEventKind,
};
use crate::filter::{Filter, FilterError};
use crate::framework::FrameworkSettings;
use crate::guard;
use crate::hooks::{
    BundleEventHook, EventListenerHook, FindHook, ListenerHook, ListenerInfo,
    ShrinkableListenerMap, ShrinkableVec,
};
use crate::listeners::{
    BundleListenerFn, FrameworkListenerFn, ListenerTables, ListenerToken, ServiceListenerEntry,
    ServiceListenerFn,
};
use crate::properties::{
    PropertyMap, PropertyValue, OBJECTCLASS, SERVICE_BUNDLE_ID, SERVICE_ID, SERVICE_SCOPE,
};
use crate::service::ServiceInterface;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] FilterError),
    #[error("service {0} is already unregistered")]
    AlreadyUnregistered(ServiceId),
    #[error("bundle {0} is not active")]
    BundleNotActive(BundleId),
    #[error("framework is stopped")]
    FrameworkStopped,
}

#[derive(Default)]
struct RegistryTable {
    services: HashMap<ServiceId, Arc<RegistrationCore>>,
    by_interface: HashMap<String, Vec<Arc<RegistrationCore>>>,
}

impl RegistryTable {
    fn insert(&mut self, core: Arc<RegistrationCore>) {
        for interface in core.interfaces.iter() {
            self.by_interface
                .entry(interface.clone())
                .or_default()
                .push(core.clone());
        }
        self.services.insert(core.id, core);
    }

    fn remove(&mut self, core: &RegistrationCore) {
        self.services.remove(&core.id);
        for interface in core.interfaces.iter() {
            if let Some(list) = self.by_interface.get_mut(interface) {
                list.retain(|c| c.id != core.id);
                if list.is_empty() {
                    self.by_interface.remove(interface);
                }
            }
        }
    }
}

thread_local! {
    /// (consumer, service) pairs whose factory is running on this thread.
    static FACTORY_CALLS: RefCell<HashSet<(BundleId, ServiceId)>> = RefCell::new(HashSet::new());
}

struct FactoryCallMark((BundleId, ServiceId));

impl FactoryCallMark {
    fn enter(key: (BundleId, ServiceId)) -> Option<Self> {
        FACTORY_CALLS
            .with(|calls| calls.borrow_mut().insert(key))
            .then_some(Self(key))
    }
}

impl Drop for FactoryCallMark {
    fn drop(&mut self) {
        FACTORY_CALLS.with(|calls| {
            calls.borrow_mut().remove(&self.0);
        });
    }
}

pub(crate) struct RegistryShared {
    table: RwLock<RegistryTable>,
    next_id: AtomicU64,
    pub(crate) listeners: ListenerTables,
    pub(crate) sink: Arc<dyn DiagnosticSink>,
    pub(crate) system_bundle: Bundle,
    pub(crate) settings: FrameworkSettings,
    weak_self: Weak<RegistryShared>,
}

/// Shared handle to the broker's registry. Cheap to clone.
#[derive(Clone)]
pub struct ServiceRegistry {
    shared: Arc<RegistryShared>,
}

impl ServiceRegistry {
    pub(crate) fn new(
        system_bundle: Bundle,
        settings: FrameworkSettings,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak| RegistryShared {
            table: RwLock::new(RegistryTable::default()),
            next_id: AtomicU64::new(0),
            listeners: ListenerTables::default(),
            sink,
            system_bundle,
            settings,
            weak_self: weak.clone(),
        });
        Self { shared }
    }

    pub fn system_bundle(&self) -> &Bundle {
        &self.shared.system_bundle
    }

    pub fn settings(&self) -> &FrameworkSettings {
        &self.shared.settings
    }

    pub fn diagnostics(&self) -> Arc<dyn DiagnosticSink> {
        self.shared.sink.clone()
    }

    /// Publishes a service owned by `bundle`.
    ///
    /// `service.id`, `service.scope`, `service.bundleid` and `objectclass` are
    /// assigned here and override any caller-supplied values. Bundle and prototype
    /// scopes require a factory.
    pub fn register(
        &self,
        bundle: &Bundle,
        interfaces: Vec<String>,
        source: ServiceSource,
        scope: ServiceScope,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration, RegistryError> {
        self.shared
            .register(bundle, interfaces, source, scope, properties)
    }

    /// References matching `interface` (empty for any) and `filter` (empty for none),
    /// best first, after find hooks narrowed them for `consumer`.
    pub fn find_references(
        &self,
        consumer: &Bundle,
        interface: &str,
        filter: &str,
    ) -> Result<Vec<ServiceReference>, RegistryError> {
        let parsed = if filter.trim().is_empty() {
            None
        } else {
            Some(Filter::parse(filter)?)
        };
        let interface = (!interface.is_empty()).then_some(interface);
        let mut refs = self.shared.lookup(interface, parsed.as_ref());
        self.shared
            .apply_find_hooks(consumer, interface.unwrap_or(""), filter, &mut refs);
        Ok(refs)
    }

    /// Best reference for `interface`, if any.
    pub fn find_reference(&self, consumer: &Bundle, interface: &str) -> Option<ServiceReference> {
        self.find_references(consumer, interface, "")
            .ok()
            .and_then(|refs| refs.into_iter().next())
    }

    pub fn get_service(&self, consumer: &Bundle, reference: &ServiceReference) -> Option<ServiceObject> {
        self.shared.get_service(consumer, reference)
    }

    /// Releases one use of the service. For prototype scope `service` names the
    /// object to release; other scopes ignore it. Returns false when nothing was held.
    pub fn unget_service(
        &self,
        consumer: &Bundle,
        reference: &ServiceReference,
        service: Option<&ServiceObject>,
    ) -> bool {
        self.shared.unget_service(consumer, reference, service)
    }

    pub fn service_objects(&self, consumer: &Bundle, reference: &ServiceReference) -> ServiceObjects {
        ServiceObjects {
            registry: self.clone(),
            consumer: consumer.clone(),
            reference: reference.clone(),
        }
    }

    /// Services published by `bundle` that are still registered.
    pub fn registrations_of(&self, bundle: &Bundle) -> Vec<ServiceReference> {
        let mut refs: Vec<ServiceReference> = self
            .shared
            .table
            .read()
            .services
            .values()
            .filter(|c| c.bundle.id() == bundle.id())
            .map(|c| ServiceReference::new(c.clone()))
            .collect();
        refs.sort_by_key(ServiceReference::id);
        refs
    }

    /// Services `bundle` currently holds.
    pub fn services_in_use(&self, bundle: &Bundle) -> Vec<ServiceReference> {
        let mut refs: Vec<ServiceReference> = self
            .shared
            .table
            .read()
            .services
            .values()
            .filter(|c| c.usage.lock().is_used_by(bundle.id()))
            .map(|c| ServiceReference::new(c.clone()))
            .collect();
        refs.sort_by_key(ServiceReference::id);
        refs
    }

    /// Releases every service object `bundle` holds.
    pub fn release_services_of(&self, bundle: &Bundle) {
        for reference in self.services_in_use(bundle) {
            self.shared.release_consumer(&reference.core, bundle);
        }
    }

    /// Unregisters every service `bundle` published.
    pub fn unregister_services_of(&self, bundle: &Bundle) {
        for reference in self.registrations_of(bundle) {
            if let Err(err) = self.shared.unregister(&reference.core) {
                tracing::debug!(service_id = reference.id(), error = %err, "Registration already gone");
            }
        }
    }

    pub fn add_service_listener<F>(
        &self,
        bundle: &Bundle,
        filter: &str,
        callback: F,
    ) -> Result<ListenerToken, RegistryError>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.shared
            .add_service_listener(bundle, filter, Arc::new(callback), None)
    }

    /// Adds a service listener that can also be removed by `(bundle, discriminator)`.
    pub fn add_service_listener_with_discriminator(
        &self,
        bundle: &Bundle,
        filter: &str,
        callback: Arc<ServiceListenerFn>,
        discriminator: usize,
    ) -> Result<ListenerToken, RegistryError> {
        self.shared
            .add_service_listener(bundle, filter, callback, Some(discriminator))
    }

    pub fn add_bundle_listener<F>(&self, bundle: &Bundle, callback: F) -> ListenerToken
    where
        F: Fn(&BundleEvent) + Send + Sync + 'static,
    {
        let callback: Arc<BundleListenerFn> = Arc::new(callback);
        self.shared.listeners.add_bundle(bundle, callback, None)
    }

    pub fn add_framework_listener<F>(&self, bundle: &Bundle, callback: F) -> ListenerToken
    where
        F: Fn(&FrameworkEvent) + Send + Sync + 'static,
    {
        let callback: Arc<FrameworkListenerFn> = Arc::new(callback);
        self.shared.listeners.add_framework(bundle, callback, None)
    }

    /// Removes a listener of any kind; false if the token is unknown.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.shared.remove_listeners(&[token]) > 0
    }

    /// Legacy removal by the discriminator supplied when the listener was added.
    #[deprecated(note = "remove listeners by the token returned when adding them")]
    pub fn remove_listener_by_discriminator(&self, bundle: &Bundle, discriminator: usize) -> usize {
        let tokens = self
            .shared
            .listeners
            .tokens_with_discriminator(bundle.id(), discriminator);
        self.shared.remove_listeners(&tokens)
    }

    /// Removes every listener `bundle` added.
    pub fn remove_listeners_of(&self, bundle: &Bundle) -> usize {
        let tokens = self.shared.listeners.tokens_of(bundle.id());
        self.shared.remove_listeners(&tokens)
    }

    pub fn fire_bundle_event(&self, event: &BundleEvent) {
        self.shared.deliver_bundle_event(event);
    }

    pub fn fire_framework_event(&self, event: &FrameworkEvent) {
        self.shared.deliver_framework_event(event);
    }
}

/// Per-consumer access to one service, including fresh prototype objects.
pub struct ServiceObjects {
    registry: ServiceRegistry,
    consumer: Bundle,
    reference: ServiceReference,
}

impl ServiceObjects {
    pub fn reference(&self) -> &ServiceReference {
        &self.reference
    }

    /// A new object for prototype scope; the shared or per-bundle object otherwise.
    pub fn get_service(&self) -> Option<ServiceObject> {
        self.registry.get_service(&self.consumer, &self.reference)
    }

    pub fn unget_service(&self, service: &ServiceObject) -> bool {
        self.registry
            .unget_service(&self.consumer, &self.reference, Some(service))
    }
}

impl RegistryShared {
    fn registration(&self, core: &Arc<RegistrationCore>) -> ServiceRegistration {
        ServiceRegistration {
            core: core.clone(),
            registry: self.weak_self.clone(),
        }
    }

    fn register(
        &self,
        bundle: &Bundle,
        interfaces: Vec<String>,
        source: ServiceSource,
        scope: ServiceScope,
        mut properties: PropertyMap,
    ) -> Result<ServiceRegistration, RegistryError> {
        if interfaces.is_empty() {
            return Err(RegistryError::InvalidRegistration(
                "at least one interface name is required".into(),
            ));
        }
        match &source {
            ServiceSource::Instance(obj) => {
                if scope != ServiceScope::Singleton {
                    return Err(RegistryError::InvalidRegistration(format!(
                        "{} scope requires a service factory",
                        scope.as_str()
                    )));
                }
                if let Some(missing) = interfaces.iter().find(|i| !obj.contains(i)) {
                    return Err(RegistryError::InvalidRegistration(format!(
                        "service object does not implement '{missing}'"
                    )));
                }
            }
            ServiceSource::Factory(_) => {}
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        properties.insert(
            OBJECTCLASS,
            PropertyValue::List(interfaces.iter().map(|i| i.as_str().into()).collect()),
        );
        properties.insert(SERVICE_ID, PropertyValue::Int(id as i64));
        properties.insert(SERVICE_SCOPE, scope.as_str());
        properties.insert(SERVICE_BUNDLE_ID, PropertyValue::Int(bundle.id() as i64));

        let core = Arc::new(RegistrationCore::new(
            id,
            interfaces,
            scope,
            bundle.clone(),
            source,
            properties,
        ));
        self.table.write().insert(core.clone());
        tracing::debug!(
            service_id = id,
            bundle = %bundle,
            interfaces = ?core.interfaces,
            scope = scope.as_str(),
            "Service registered"
        );

        self.service_changed(&core, ServiceEventKind::Registered);
        if core.interfaces.iter().any(|i| i == <dyn ListenerHook as ServiceInterface>::NAME) {
            self.announce_listeners_to(&core);
        }
        Ok(self.registration(&core))
    }

    pub(crate) fn unregister(&self, core: &Arc<RegistrationCore>) -> Result<(), RegistryError> {
        if !core.begin_unregister() {
            return Err(RegistryError::AlreadyUnregistered(core.id));
        }
        self.service_changed(core, ServiceEventKind::Unregistering);

        self.table.write().remove(core);
        core.finish_unregister();

        let released: Vec<(Bundle, ServiceObject)> = {
            let mut usage = core.usage.lock();
            usage.counts.clear();
            let mut objs: Vec<(Bundle, ServiceObject)> = usage.shared.take().into_iter().collect();
            objs.extend(usage.per_bundle.drain().map(|(_, pair)| pair));
            for (_, (bundle, list)) in usage.prototypes.drain() {
                objs.extend(list.into_iter().map(|obj| (bundle.clone(), obj)));
            }
            objs
        };
        if let ServiceSource::Factory(factory) = &core.source {
            for (consumer, obj) in released {
                self.release_object(core, factory.as_ref(), &consumer, obj);
            }
        }
        tracing::debug!(service_id = core.id, "Service unregistered");
        Ok(())
    }

    pub(crate) fn set_properties(
        &self,
        core: &Arc<RegistrationCore>,
        mut properties: PropertyMap,
    ) -> Result<(), RegistryError> {
        if core.state() == RegistrationState::Unregistered {
            return Err(RegistryError::AlreadyUnregistered(core.id));
        }
        let old = core.properties.load_full();
        for key in [OBJECTCLASS, SERVICE_ID, SERVICE_SCOPE, SERVICE_BUNDLE_ID] {
            if let Some(v) = old.get(key) {
                properties.insert(key, v.clone());
            }
        }

        let before = self.listeners.service_receivers(&old);
        core.properties.store(Arc::new(properties));
        let after = self.listeners.service_receivers(&core.properties.load());

        let still: HashSet<ListenerToken> = after.iter().map(|e| e.base.token).collect();
        let ended: Vec<Arc<ServiceListenerEntry>> = before
            .into_iter()
            .filter(|e| !still.contains(&e.base.token))
            .collect();

        let reference = ServiceReference::new(core.clone());
        self.deliver_service_event(
            &ServiceEvent::new(ServiceEventKind::Modified, reference.clone()),
            after,
        );
        self.deliver_service_event(
            &ServiceEvent::new(ServiceEventKind::ModifiedEndMatch, reference),
            ended,
        );
        Ok(())
    }

    /// Candidate references, best first. Includes registrations that are in the
    /// middle of unregistering.
    pub(crate) fn lookup(&self, interface: Option<&str>, filter: Option<&Filter>) -> Vec<ServiceReference> {
        let candidates: Vec<Arc<RegistrationCore>> = {
            let table = self.table.read();
            match interface {
                Some(name) => table.by_interface.get(name).cloned().unwrap_or_default(),
                None => {
                    let classes = filter.map(Filter::object_classes).unwrap_or_default();
                    if classes.is_empty() {
                        table.services.values().cloned().collect()
                    } else {
                        let mut seen = HashSet::new();
                        classes
                            .iter()
                            .filter_map(|c| table.by_interface.get(c))
                            .flatten()
                            .filter(|c| seen.insert(c.id))
                            .cloned()
                            .collect()
                    }
                }
            }
        };

        let mut refs: Vec<ServiceReference> = candidates
            .into_iter()
            .filter(|c| c.state() != RegistrationState::Unregistered)
            .filter(|c| filter.map_or(true, |f| f.matches(&c.properties.load())))
            .map(ServiceReference::new)
            .collect();
        refs.sort_by(ServiceReference::best_first);
        refs
    }

    fn apply_find_hooks(
        &self,
        consumer: &Bundle,
        interface: &str,
        filter: &str,
        refs: &mut Vec<ServiceReference>,
    ) {
        if consumer.is_system() {
            return;
        }
        self.each_hook::<dyn FindHook>("find", |hook| {
            hook.find(consumer, interface, filter, &mut ShrinkableVec::new(refs))
        });
    }

    /// Invokes every hook registered under `H::NAME`, highest ranking and newest
    /// first. Failures are reported and do not stop later hooks.
    fn each_hook<H: ?Sized + ServiceInterface>(
        &self,
        label: &str,
        mut call: impl FnMut(&H) -> anyhow::Result<()>,
    ) {
        let mut hooks = self.lookup(Some(H::NAME), None);
        if hooks.is_empty() {
            return;
        }
        hooks.sort_by(|a, b| b.ranking().cmp(&a.ranking()).then(b.id().cmp(&a.id())));

        let system = self.system_bundle.clone();
        for reference in hooks {
            let Some(obj) = self.get_service(&system, &reference) else {
                continue;
            };
            if let Some(hook) = obj.get::<H>() {
                let callback = format!("{label} hook #{}", reference.id());
                if let Err(err) = guard::invoke(&callback, || call(hook.as_ref())) {
                    self.sink.report(
                        &Diagnostic::error(
                            DiagnosticKind::Hook,
                            format!("Failed to call {label} hook #{}", reference.id()),
                        )
                        .service(reference.id())
                        .bundle(reference.bundle().id())
                        .cause(err),
                    );
                }
            }
            self.unget_service(&system, &reference, Some(&obj));
        }
    }

    pub(crate) fn get_service(&self, consumer: &Bundle, reference: &ServiceReference) -> Option<ServiceObject> {
        let core = self.table.read().services.get(&reference.id()).cloned()?;
        if core.state() != RegistrationState::Registered {
            return None;
        }

        let obj = match (&core.source, core.scope) {
            (ServiceSource::Instance(obj), _) => {
                *core.usage.lock().counts.entry(consumer.id()).or_default() += 1;
                obj.clone()
            }
            (ServiceSource::Factory(factory), ServiceScope::Singleton) => {
                {
                    let mut usage = core.usage.lock();
                    if let Some((_, obj)) = usage.shared.clone() {
                        *usage.counts.entry(consumer.id()).or_default() += 1;
                        return Some(obj);
                    }
                }
                let created = self.call_factory(&core, factory.as_ref(), consumer)?;
                let (obj, lost) = {
                    let mut usage = core.usage.lock();
                    *usage.counts.entry(consumer.id()).or_default() += 1;
                    match usage.shared.clone() {
                        Some((_, existing)) if existing.ptr_eq(&created) => (existing, None),
                        Some((_, existing)) => (existing, Some(created)),
                        None => {
                            usage.shared = Some((consumer.clone(), created.clone()));
                            (created, None)
                        }
                    }
                };
                if let Some(lost) = lost {
                    self.release_object(&core, factory.as_ref(), consumer, lost);
                }
                obj
            }
            (ServiceSource::Factory(factory), ServiceScope::Bundle) => {
                {
                    let mut usage = core.usage.lock();
                    if let Some((_, obj)) = usage.per_bundle.get(&consumer.id()).cloned() {
                        *usage.counts.entry(consumer.id()).or_default() += 1;
                        return Some(obj);
                    }
                }
                let created = self.call_factory(&core, factory.as_ref(), consumer)?;
                let (obj, lost) = {
                    let mut usage = core.usage.lock();
                    *usage.counts.entry(consumer.id()).or_default() += 1;
                    match usage.per_bundle.get(&consumer.id()).cloned() {
                        Some((_, existing)) if existing.ptr_eq(&created) => (existing, None),
                        Some((_, existing)) => (existing, Some(created)),
                        None => {
                            usage
                                .per_bundle
                                .insert(consumer.id(), (consumer.clone(), created.clone()));
                            (created, None)
                        }
                    }
                };
                if let Some(lost) = lost {
                    self.release_object(&core, factory.as_ref(), consumer, lost);
                }
                obj
            }
            (ServiceSource::Factory(factory), ServiceScope::Prototype) => {
                let created = self.call_factory(&core, factory.as_ref(), consumer)?;
                core.usage
                    .lock()
                    .prototypes
                    .entry(consumer.id())
                    .or_insert_with(|| (consumer.clone(), Vec::new()))
                    .1
                    .push(created.clone());
                created
            }
        };

        // Unregistered while the factory ran: hand back nothing.
        if core.state() == RegistrationState::Unregistered {
            self.unget_service(consumer, reference, Some(&obj));
            return None;
        }
        Some(obj)
    }

    fn call_factory(
        &self,
        core: &Arc<RegistrationCore>,
        factory: &dyn ServiceFactory,
        consumer: &Bundle,
    ) -> Option<ServiceObject> {
        let Some(_mark) = FactoryCallMark::enter((consumer.id(), core.id)) else {
            self.factory_problem(
                core,
                consumer,
                Severity::Error,
                format!(
                    "Recursive service factory call for service #{} from bundle {consumer}",
                    core.id
                ),
                None,
            );
            return None;
        };

        let registration = self.registration(core);
        let obj = match guard::invoke("service factory", || factory.get_service(consumer, &registration)) {
            Ok(obj) => obj,
            Err(err) => {
                self.factory_problem(
                    core,
                    consumer,
                    Severity::Error,
                    format!("Service factory for service #{} failed", core.id),
                    Some(err.to_string()),
                );
                return None;
            }
        };

        if obj.is_empty() {
            self.factory_problem(
                core,
                consumer,
                Severity::Error,
                format!("Service factory for service #{} returned an empty object", core.id),
                None,
            );
            return None;
        }
        let missing: Vec<&str> = core
            .interfaces
            .iter()
            .filter(|i| !obj.contains(i))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            self.factory_problem(
                core,
                consumer,
                Severity::Warning,
                format!(
                    "Service factory for service #{} returned an object missing interfaces {missing:?}",
                    core.id
                ),
                None,
            );
            return None;
        }
        Some(obj)
    }

    fn factory_problem(
        &self,
        core: &RegistrationCore,
        consumer: &Bundle,
        severity: Severity,
        message: String,
        cause: Option<String>,
    ) {
        let mut diagnostic = Diagnostic::new(DiagnosticKind::ServiceFactory, severity, message.clone())
            .service(core.id)
            .bundle(consumer.id());
        let mut event = FrameworkEvent::new(
            match severity {
                Severity::Error => FrameworkEventKind::Error,
                Severity::Warning => FrameworkEventKind::Warning,
            },
            message,
        )
        .with_bundle(core.bundle.clone());
        if let Some(cause) = cause {
            diagnostic = diagnostic.cause(&cause);
            event = event.with_cause(cause);
        }
        self.sink.report(&diagnostic);
        self.deliver_framework_event(&event);
    }

    pub(crate) fn unget_service(
        &self,
        consumer: &Bundle,
        reference: &ServiceReference,
        service: Option<&ServiceObject>,
    ) -> bool {
        let core = &reference.core;
        let factory = match &core.source {
            ServiceSource::Instance(_) => None,
            ServiceSource::Factory(f) => Some(f.clone()),
        };

        let released: Option<(Bundle, ServiceObject)> = {
            let mut usage = core.usage.lock();
            if core.scope == ServiceScope::Prototype {
                let Some(service) = service else {
                    return false;
                };
                let Some((owner, list)) = usage.prototypes.get_mut(&consumer.id()) else {
                    return false;
                };
                let Some(pos) = list.iter().position(|o| o.ptr_eq(service)) else {
                    return false;
                };
                let obj = list.remove(pos);
                let owner = owner.clone();
                if list.is_empty() {
                    usage.prototypes.remove(&consumer.id());
                }
                Some((owner, obj))
            } else {
                let Some(count) = usage.counts.get_mut(&consumer.id()) else {
                    return false;
                };
                *count -= 1;
                let consumer_done = *count == 0;
                if consumer_done {
                    usage.counts.remove(&consumer.id());
                }
                match (&factory, core.scope) {
                    (Some(_), ServiceScope::Singleton) if usage.total() == 0 => usage.shared.take(),
                    (Some(_), ServiceScope::Bundle) if consumer_done => {
                        usage.per_bundle.remove(&consumer.id())
                    }
                    _ => None,
                }
            }
        };

        if let (Some(factory), Some((owner, obj))) = (factory, released) {
            self.release_object(core, factory.as_ref(), &owner, obj);
        }
        true
    }

    /// Drops every use `consumer` has of one registration.
    pub(crate) fn release_consumer(&self, core: &Arc<RegistrationCore>, consumer: &Bundle) {
        let released: Vec<(Bundle, ServiceObject)> = {
            let mut usage = core.usage.lock();
            usage.counts.remove(&consumer.id());
            let mut objs = Vec::new();
            if let Some(pair) = usage.per_bundle.remove(&consumer.id()) {
                objs.push(pair);
            }
            if let Some((owner, list)) = usage.prototypes.remove(&consumer.id()) {
                objs.extend(list.into_iter().map(|o| (owner.clone(), o)));
            }
            if usage.total() == 0 {
                if let Some(pair) = usage.shared.take() {
                    objs.push(pair);
                }
            }
            objs
        };
        if let ServiceSource::Factory(factory) = &core.source {
            for (owner, obj) in released {
                self.release_object(core, factory.as_ref(), &owner, obj);
            }
        }
    }

    fn release_object(
        &self,
        core: &Arc<RegistrationCore>,
        factory: &dyn ServiceFactory,
        consumer: &Bundle,
        obj: ServiceObject,
    ) {
        let registration = self.registration(core);
        if let Err(err) = guard::invoke("service factory release", || {
            factory.unget_service(consumer, &registration, obj)
        }) {
            let message = format!("Releasing service #{} for bundle {consumer} failed", core.id);
            self.sink.report(
                &Diagnostic::warning(DiagnosticKind::ServiceRelease, message.clone())
                    .service(core.id)
                    .bundle(consumer.id())
                    .cause(&err),
            );
            self.deliver_framework_event(
                &FrameworkEvent::new(FrameworkEventKind::Warning, message)
                    .with_bundle(core.bundle.clone())
                    .with_cause(err),
            );
        }
    }

    fn add_service_listener(
        &self,
        bundle: &Bundle,
        filter: &str,
        callback: Arc<ServiceListenerFn>,
        discriminator: Option<usize>,
    ) -> Result<ListenerToken, RegistryError> {
        let filter = if filter.trim().is_empty() {
            None
        } else {
            Some(Filter::parse(filter)?)
        };
        let entry = self
            .listeners
            .add_service(bundle, filter, callback, discriminator);
        let info = entry.info();
        self.each_hook::<dyn ListenerHook>("listener", |hook| {
            hook.added(std::slice::from_ref(&info))
        });
        Ok(entry.base.token)
    }

    fn remove_listeners(&self, tokens: &[ListenerToken]) -> usize {
        let mut removed = 0;
        let mut infos = Vec::new();
        for token in tokens {
            let (existed, info) = self.listeners.remove(*token);
            if existed {
                removed += 1;
            }
            infos.extend(info);
        }
        if !infos.is_empty() {
            self.each_hook::<dyn ListenerHook>("listener", |hook| hook.removed(&infos));
        }
        removed
    }

    /// Tells a newly registered listener hook about every existing service listener.
    fn announce_listeners_to(&self, core: &Arc<RegistrationCore>) {
        let infos = self.listeners.service_infos();
        if infos.is_empty() {
            return;
        }
        let system = self.system_bundle.clone();
        let reference = ServiceReference::new(core.clone());
        let Some(obj) = self.get_service(&system, &reference) else {
            return;
        };
        if let Some(hook) = obj.get::<dyn ListenerHook>() {
            let label = format!("listener hook #{}", core.id);
            if let Err(err) = guard::invoke(&label, || hook.added(&infos)) {
                self.sink.report(
                    &Diagnostic::error(
                        DiagnosticKind::Hook,
                        format!("Failed to call listener hook #{}", core.id),
                    )
                    .service(core.id)
                    .cause(err),
                );
            }
        }
        self.unget_service(&system, &reference, Some(&obj));
    }

    fn service_changed(&self, core: &Arc<RegistrationCore>, kind: ServiceEventKind) {
        let receivers = self.listeners.service_receivers(&core.properties.load());
        let event = ServiceEvent::new(kind, ServiceReference::new(core.clone()));
        self.deliver_service_event(&event, receivers);
    }

    fn deliver_service_event(&self, event: &ServiceEvent, mut receivers: Vec<Arc<ServiceListenerEntry>>) {
        if receivers.is_empty() {
            return;
        }

        let mut groups: BTreeMap<BundleId, Vec<ListenerInfo>> = BTreeMap::new();
        for entry in &receivers {
            groups
                .entry(entry.base.bundle.id())
                .or_default()
                .push(entry.info());
        }
        let mut hooked = false;
        self.each_hook::<dyn EventListenerHook>("event listener", |hook| {
            hooked = true;
            hook.event(event, &mut ShrinkableListenerMap::new(&mut groups))
        });
        if hooked {
            let kept: HashSet<ListenerToken> = groups.values().flatten().map(|i| i.token).collect();
            receivers.retain(|e| kept.contains(&e.base.token));
        }

        for entry in receivers {
            if entry.base.is_removed() {
                continue;
            }
            let label = format!("service listener {}", entry.base.token);
            let callback = entry.base.callback.clone();
            if let Err(err) = guard::invoke_unit(&label, || callback(event)) {
                self.listener_failed(&entry.base.bundle, err);
            }
        }
    }

    fn listener_failed(&self, bundle: &Bundle, err: guard::CallbackError) {
        self.sink.report(
            &Diagnostic::error(DiagnosticKind::Listener, "Listener failed")
                .bundle(bundle.id())
                .cause(&err),
        );
        if self.settings.listener_errors_as_events {
            self.deliver_framework_event(
                &FrameworkEvent::new(FrameworkEventKind::Error, "Listener failed")
                    .with_bundle(bundle.clone())
                    .with_cause(err),
            );
        }
    }

    pub(crate) fn deliver_bundle_event(&self, event: &BundleEvent) {
        let receivers = self.listeners.bundle_receivers();
        if receivers.is_empty() {
            return;
        }

        let mut bundles: Vec<Bundle> = Vec::new();
        for entry in &receivers {
            if !bundles.contains(&entry.bundle) {
                bundles.push(entry.bundle.clone());
            }
        }
        self.each_hook::<dyn BundleEventHook>("bundle event", |hook| {
            hook.event(event, &mut ShrinkableVec::new(&mut bundles))
        });

        for entry in receivers {
            if entry.is_removed() || !bundles.contains(&entry.bundle) {
                continue;
            }
            let label = format!("bundle listener {}", entry.token);
            let callback = entry.callback.clone();
            if let Err(err) = guard::invoke_unit(&label, || callback(event)) {
                self.listener_failed(&entry.bundle, err);
            }
        }
    }

    /// Framework listener failures are only reported, never turned into further events.
    pub(crate) fn deliver_framework_event(&self, event: &FrameworkEvent) {
        for entry in self.listeners.framework_receivers() {
            if entry.is_removed() {
                continue;
            }
            let label = format!("framework listener {}", entry.token);
            let callback = entry.callback.clone();
            if let Err(err) = guard::invoke_unit(&label, || callback(event)) {
                self.sink.report(
                    &Diagnostic::error(DiagnosticKind::Listener, "Framework listener failed")
                        .bundle(entry.bundle.id())
                        .cause(err),
                );
            }
        }
    }
}
