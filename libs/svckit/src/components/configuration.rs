//! Per-component state machine.
//!
//! Every service event marks each configuration dirty and reconciles it. One
//! thread at a time runs transitions for a configuration (`transition` is only
//! ever try-locked); a caller that finds it busy leaves the dirty flag set and
//! the holder runs another pass. State queries read `data` and never wait on a
//! transition.
//!
//! Delayed components publish a factory-backed service while satisfied; the
//! instance is created on first use under `instance_lock`, which is never held
//! while a registration is withdrawn. A delayed chain that leads back to a
//! component already being created on the same thread leaves that dynamic
//! reference unbound; it is bound by the reconcile pass scheduled once the
//! outermost creation returns.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::context::ComponentContext;
use super::description::{ComponentDescription, ComponentMetadata, PolicyOption, ReferenceMetadata, ReferencePolicy};
use super::instance::{BoundService, ComponentInstance};
use super::runtime::RuntimeShared;
use crate::bundle::{Bundle, BundleId};
use crate::diagnostics::{Diagnostic, DiagnosticKind};
use crate::events::{FrameworkEvent, FrameworkEventKind};
use crate::guard::{self, CallbackError};
use crate::properties::{PropertyMap, PropertyValue, COMPONENT_ID, COMPONENT_NAME};
use crate::service::{
    ServiceFactory, ServiceId, ServiceObject, ServiceReference, ServiceRegistration, ServiceScope,
    ServiceSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentState {
    /// Waiting for mandatory references, or disabled.
    #[default]
    Unsatisfied,
    /// References available; a delayed component's service is published but no
    /// instance exists yet.
    Satisfied,
    Active,
    Deactivating,
    /// Activation failed; stays here until the component is disabled and re-enabled.
    Failed,
}

/// Snapshot of one configuration for diagnostics and tooling.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentConfigurationInfo {
    pub id: u64,
    pub name: String,
    pub bundle: BundleId,
    pub enabled: bool,
    pub state: ComponentState,
    pub immediate: bool,
    pub instances: usize,
    pub service_id: Option<ServiceId>,
    pub bound: BTreeMap<String, Vec<ServiceId>>,
    pub unsatisfied_references: Vec<String>,
    pub failure: Option<String>,
}

pub(crate) type Candidates = BTreeMap<String, Vec<ServiceReference>>;

#[derive(Default)]
struct Activations {
    configs: Vec<u64>,
    rebind: bool,
}

thread_local! {
    /// Delayed configurations whose instance is being created on this thread.
    static ACTIVATIONS: RefCell<Activations> = RefCell::new(Activations::default());
}

struct ActivationMark(u64);

impl ActivationMark {
    fn enter(config: u64) -> Option<Self> {
        ACTIVATIONS.with(|a| {
            let mut a = a.borrow_mut();
            if a.configs.contains(&config) {
                return None;
            }
            a.configs.push(config);
            Some(Self(config))
        })
    }

    fn contains(config: u64) -> bool {
        ACTIVATIONS.with(|a| a.borrow().configs.contains(&config))
    }

    fn request_rebind() {
        ACTIVATIONS.with(|a| a.borrow_mut().rebind = true);
    }

    /// True once per outermost creation that left references to bind later.
    fn take_rebind() -> bool {
        ACTIVATIONS.with(|a| {
            let mut a = a.borrow_mut();
            a.configs.is_empty() && std::mem::take(&mut a.rebind)
        })
    }
}

impl Drop for ActivationMark {
    fn drop(&mut self) {
        ACTIVATIONS.with(|a| a.borrow_mut().configs.retain(|c| *c != self.0));
    }
}

/// The service belongs to a component whose instance this thread is creating.
fn activating_here(reference: &ServiceReference) -> bool {
    reference
        .property(COMPONENT_ID)
        .and_then(|v| v.as_i64())
        .and_then(|id| u64::try_from(id).ok())
        .is_some_and(ActivationMark::contains)
}

struct LiveInstance {
    instance: Arc<dyn ComponentInstance>,
    object: Option<ServiceObject>,
    using: Option<Bundle>,
}

#[derive(Default)]
pub(crate) struct ConfigData {
    state: ComponentState,
    enabled: bool,
    overrides: PropertyMap,
    pending_modified: bool,
    instances: Vec<LiveInstance>,
    bound: BTreeMap<String, Vec<BoundService>>,
    /// Mandatory dynamic references activated without a service to break a cycle.
    relaxed: BTreeSet<String>,
    registration: Option<ServiceRegistration>,
    failure: Option<String>,
    deadlock_reported: bool,
}

pub(crate) struct ComponentConfiguration {
    pub(crate) id: u64,
    pub(crate) description: ComponentDescription,
    pub(crate) bundle: Bundle,
    transition: Mutex<()>,
    instance_lock: Mutex<()>,
    dirty: AtomicBool,
    data: RwLock<ConfigData>,
}

impl ComponentConfiguration {
    pub(crate) fn new(id: u64, description: ComponentDescription, bundle: Bundle) -> Self {
        let data = ConfigData {
            enabled: description.metadata.enabled,
            ..ConfigData::default()
        };
        Self {
            id,
            description,
            bundle,
            transition: Mutex::new(()),
            instance_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
            data: RwLock::new(data),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.description.metadata.name
    }

    pub(crate) fn meta(&self) -> &ComponentMetadata {
        &self.description.metadata
    }

    pub(crate) fn state(&self) -> ComponentState {
        self.data.read().state
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.data.read().enabled
    }

    /// Metadata properties overlaid with runtime overrides and identity keys.
    pub(crate) fn properties(&self) -> PropertyMap {
        let mut props = self.meta().properties.clone();
        props.extend_from(&self.data.read().overrides);
        props.insert(COMPONENT_NAME, self.name());
        props.insert(COMPONENT_ID, PropertyValue::Int(self.id as i64));
        props
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        let mut d = self.data.write();
        d.enabled = enabled;
        if enabled && d.state == ComponentState::Failed {
            d.state = ComponentState::Unsatisfied;
            d.failure = None;
        }
        d.deadlock_reported = false;
    }

    pub(crate) fn set_overrides(&self, overrides: PropertyMap) {
        let mut d = self.data.write();
        d.overrides = overrides;
        d.pending_modified = true;
    }

    pub(crate) fn relax(&self, references: impl IntoIterator<Item = String>) {
        self.data.write().relaxed.extend(references);
    }

    pub(crate) fn deadlock_reported(&self) -> bool {
        self.data.read().deadlock_reported
    }

    pub(crate) fn mark_deadlock_reported(&self) {
        self.data.write().deadlock_reported = true;
    }

    /// Runs transitions until no further change is pending.
    pub(crate) fn reconcile(self: &Arc<Self>, rt: &RuntimeShared) {
        self.dirty.store(true, Ordering::SeqCst);
        loop {
            let Some(guard) = self.transition.try_lock() else {
                return;
            };
            if !self.dirty.swap(false, Ordering::SeqCst) {
                return;
            }
            self.step(rt);
            drop(guard);
            if !self.dirty.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    fn step(self: &Arc<Self>, rt: &RuntimeShared) {
        let (state, enabled, pending_modified) = {
            let d = self.data.read();
            (d.state, d.enabled, d.pending_modified)
        };

        if !enabled {
            if matches!(state, ComponentState::Satisfied | ComponentState::Active) {
                self.deactivate(rt, "component disabled");
            }
            return;
        }
        match state {
            ComponentState::Failed => {
                let registration = self.data.write().registration.take();
                if let Some(registration) = registration {
                    if let Err(err) = registration.unregister() {
                        tracing::debug!(component = self.name(), error = %err, "Failed component service already gone");
                    }
                }
                return;
            }
            ComponentState::Deactivating => return,
            _ => {}
        }

        if pending_modified {
            self.data.write().pending_modified = false;
            if matches!(state, ComponentState::Satisfied | ComponentState::Active)
                && !self.apply_modified(rt)
            {
                self.deactivate(rt, "configuration changed");
            }
        }

        let state = self.state();
        let candidates = self.candidates(rt);
        let satisfied = self.is_satisfied(&candidates);
        match state {
            ComponentState::Unsatisfied if satisfied => self.activate(rt, &candidates),
            ComponentState::Satisfied | ComponentState::Active => {
                if !satisfied {
                    self.deactivate(rt, "mandatory reference unavailable");
                } else if self.needs_reactivation(&candidates) {
                    self.deactivate(rt, "static reference changed");
                    let candidates = self.candidates(rt);
                    if self.is_satisfied(&candidates) {
                        self.activate(rt, &candidates);
                    }
                } else {
                    self.update_dynamic(rt, &candidates);
                }
            }
            _ => {}
        }
    }

    /// Live services per reference, best first. Excludes services being
    /// unregistered and the component's own service.
    pub(crate) fn candidates(&self, rt: &RuntimeShared) -> Candidates {
        let registry = rt.registry();
        self.meta()
            .references
            .iter()
            .map(|r| {
                let filter = r.target.as_deref().unwrap_or("");
                let mut refs = registry
                    .find_references(&self.bundle, &r.interface, filter)
                    .unwrap_or_else(|err| {
                        tracing::warn!(component = self.name(), reference = %r.name, error = %err, "Reference lookup failed");
                        Vec::new()
                    });
                refs.retain(|s| {
                    s.is_available()
                        && s.property(COMPONENT_NAME)
                            .and_then(|v| v.as_str().map(|n| n != self.name()))
                            .unwrap_or(true)
                });
                (r.name.clone(), refs)
            })
            .collect()
    }

    /// Mandatory references without any candidate, ignoring relaxed ones.
    pub(crate) fn unmet_references<'a>(&'a self, candidates: &Candidates) -> Vec<&'a ReferenceMetadata> {
        let relaxed = self.data.read().relaxed.clone();
        self.meta()
            .references
            .iter()
            .filter(|r| r.cardinality.is_mandatory() && !relaxed.contains(&r.name))
            .filter(|r| candidates.get(&r.name).map_or(true, Vec::is_empty))
            .collect()
    }

    fn is_satisfied(&self, candidates: &Candidates) -> bool {
        self.unmet_references(candidates).is_empty()
    }

    fn context(
        &self,
        rt: &RuntimeShared,
        using: Option<Bundle>,
        bound: BTreeMap<String, Vec<BoundService>>,
    ) -> ComponentContext {
        ComponentContext {
            name: self.name().to_owned(),
            properties: self.properties(),
            bundle_context: rt.framework().context(&self.bundle),
            using_bundle: using,
            bound,
            runtime: rt.weak(),
        }
    }

    fn activate(self: &Arc<Self>, rt: &RuntimeShared, candidates: &Candidates) {
        self.data.write().state = ComponentState::Satisfied;
        if !self.meta().is_immediate() {
            self.register_delayed(rt);
            return;
        }

        let Some(bound) = self.bind_initial(rt, candidates) else {
            self.data.write().state = ComponentState::Unsatisfied;
            return;
        };
        let ctx = self.context(rt, None, bound.clone());
        let instance = match self.create_instance(&ctx) {
            Ok(instance) => instance,
            Err(err) => {
                self.release_bound(rt, &[], bound);
                self.fail(rt, "activation failed", &err);
                return;
            }
        };

        let object = match (&self.meta().service, instance.service()) {
            (None, _) => None,
            (Some(_), Some(object)) => Some(object),
            (Some(_), None) => {
                self.discard_instance(rt, &instance, &ctx, bound);
                self.fail(rt, "activation failed", "instance provides no service object");
                return;
            }
        };

        {
            let mut d = self.data.write();
            d.bound = bound;
            d.instances = vec![LiveInstance {
                instance: instance.clone(),
                object: object.clone(),
                using: None,
            }];
            d.state = ComponentState::Active;
            d.failure = None;
            d.deadlock_reported = false;
        }
        tracing::info!(component = self.name(), id = self.id, "Component activated");

        if let Some(object) = object {
            let registered = rt.registry().register(
                &self.bundle,
                self.meta().provided_interfaces().to_vec(),
                ServiceSource::Instance(object),
                ServiceScope::Singleton,
                self.properties(),
            );
            match registered {
                Ok(registration) => self.data.write().registration = Some(registration),
                Err(err) => {
                    let (instances, bound) = self.take_instances();
                    for live in &instances {
                        self.discard_instance(rt, &live.instance, &ctx, BTreeMap::new());
                    }
                    self.release_bound(rt, &[], bound);
                    self.fail(rt, "service registration failed", &err);
                }
            }
        }
    }

    fn register_delayed(self: &Arc<Self>, rt: &RuntimeShared) {
        let scope = self
            .meta()
            .service
            .as_ref()
            .map(|s| s.scope)
            .unwrap_or_default();
        let factory = Arc::new(DelayedFactory {
            config: Arc::downgrade(self),
            runtime: rt.weak(),
        });
        let registered = rt.registry().register(
            &self.bundle,
            self.meta().provided_interfaces().to_vec(),
            ServiceSource::Factory(factory),
            scope,
            self.properties(),
        );
        match registered {
            Ok(registration) => {
                let mut d = self.data.write();
                d.registration = Some(registration);
                d.failure = None;
                d.deadlock_reported = false;
                drop(d);
                tracing::debug!(component = self.name(), "Component satisfied, instance created on first use");
            }
            Err(err) => self.fail(rt, "service registration failed", &err),
        }
    }

    /// Gets a service for every reference up to its cardinality. `None` when a
    /// mandatory reference cannot be bound; nothing stays checked out then.
    fn bind_initial(
        &self,
        rt: &RuntimeShared,
        candidates: &Candidates,
    ) -> Option<BTreeMap<String, Vec<BoundService>>> {
        let registry = rt.registry();
        let relaxed = self.data.read().relaxed.clone();
        let mut bound: BTreeMap<String, Vec<BoundService>> = BTreeMap::new();

        for r in &self.meta().references {
            let mut got = Vec::new();
            let mut deferred = false;
            for reference in candidates.get(&r.name).into_iter().flatten() {
                if activating_here(reference) {
                    deferred = true;
                    continue;
                }
                if let Some(object) = registry.get_service(&self.bundle, reference) {
                    got.push(BoundService {
                        reference: reference.clone(),
                        object,
                    });
                    if !r.cardinality.is_multiple() {
                        break;
                    }
                }
            }
            let mut short = got.len() < r.cardinality.min() && !relaxed.contains(&r.name);
            if deferred && r.is_dynamic() {
                ActivationMark::request_rebind();
                if short {
                    tracing::debug!(component = self.name(), reference = %r.name, "Reference target is being activated, binding later");
                    self.relax([r.name.clone()]);
                    short = false;
                }
            }
            bound.insert(r.name.clone(), got);
            if short {
                tracing::debug!(component = self.name(), reference = %r.name, "Mandatory reference could not be bound");
                self.release_bound(rt, &[], bound);
                return None;
            }
        }
        Some(bound)
    }

    /// Calls unbind for every bound service on every instance, then releases them.
    fn release_bound(
        &self,
        rt: &RuntimeShared,
        instances: &[Arc<dyn ComponentInstance>],
        bound: BTreeMap<String, Vec<BoundService>>,
    ) {
        let registry = rt.registry();
        for (name, services) in bound {
            for service in services {
                for instance in instances {
                    if let Err(err) = guard::invoke("unbind", || instance.unbind(&name, &service)) {
                        self.warn(rt, "unbind failed", &err);
                    }
                }
                registry.unget_service(&self.bundle, &service.reference, Some(&service.object));
            }
        }
    }

    fn create_instance(&self, ctx: &ComponentContext) -> Result<Arc<dyn ComponentInstance>, CallbackError> {
        let factory = self.description.factory.clone();
        let instance = guard::invoke("component factory", || factory.create(ctx))?;
        guard::invoke("activate", || instance.activate(ctx))?;
        Ok(instance)
    }

    fn discard_instance(
        &self,
        rt: &RuntimeShared,
        instance: &Arc<dyn ComponentInstance>,
        ctx: &ComponentContext,
        bound: BTreeMap<String, Vec<BoundService>>,
    ) {
        if let Err(err) = guard::invoke("deactivate", || instance.deactivate(ctx)) {
            self.warn(rt, "deactivate failed", &err);
        }
        self.release_bound(rt, std::slice::from_ref(instance), bound);
    }

    fn take_instances(&self) -> (Vec<LiveInstance>, BTreeMap<String, Vec<BoundService>>) {
        let _guard = self.instance_lock.lock();
        let mut d = self.data.write();
        (std::mem::take(&mut d.instances), std::mem::take(&mut d.bound))
    }

    /// Withdraws the service, deactivates every instance and releases bound
    /// services, in that order. Callback failures are logged and teardown continues.
    pub(crate) fn deactivate(&self, rt: &RuntimeShared, reason: &str) {
        let registration = {
            let mut d = self.data.write();
            if d.registration.is_none() && d.instances.is_empty() && d.bound.is_empty() {
                if d.state != ComponentState::Failed {
                    d.state = ComponentState::Unsatisfied;
                }
                d.relaxed.clear();
                return;
            }
            d.state = ComponentState::Deactivating;
            d.registration.take()
        };
        if let Some(registration) = registration {
            if let Err(err) = registration.unregister() {
                tracing::debug!(component = self.name(), error = %err, "Component service already gone");
            }
        }

        let (instances, bound) = self.take_instances();
        for live in &instances {
            let ctx = self.context(rt, live.using.clone(), bound.clone());
            if let Err(err) = guard::invoke("deactivate", || live.instance.deactivate(&ctx)) {
                self.warn(rt, "deactivate failed", &err);
            }
        }
        let arcs: Vec<Arc<dyn ComponentInstance>> = instances.iter().map(|l| l.instance.clone()).collect();
        self.release_bound(rt, &arcs, bound);

        {
            let mut d = self.data.write();
            d.relaxed.clear();
            d.state = ComponentState::Unsatisfied;
        }
        tracing::info!(component = self.name(), reason, "Component deactivated");
    }

    fn fail(&self, rt: &RuntimeShared, message: &str, cause: impl ToString) {
        let cause = cause.to_string();
        {
            let mut d = self.data.write();
            d.state = ComponentState::Failed;
            d.failure = Some(format!("{message}: {cause}"));
        }
        rt.sink().report(
            &Diagnostic::error(DiagnosticKind::Component, format!("Component {} {message}", self.name()))
                .component(self.name())
                .bundle(self.bundle.id())
                .cause(&cause),
        );
        rt.registry().fire_framework_event(
            &FrameworkEvent::new(
                FrameworkEventKind::Error,
                format!("component {} {message}", self.name()),
            )
            .with_bundle(self.bundle.clone())
            .with_cause(cause),
        );
    }

    fn warn(&self, rt: &RuntimeShared, message: &str, err: &CallbackError) {
        rt.sink().report(
            &Diagnostic::warning(DiagnosticKind::Component, format!("Component {} {message}", self.name()))
                .component(self.name())
                .bundle(self.bundle.id())
                .cause(err),
        );
    }

    /// Static references force a restart when a bound service went away or,
    /// for greedy ones, when the best candidates changed.
    fn needs_reactivation(&self, candidates: &Candidates) -> bool {
        let d = self.data.read();
        if d.instances.is_empty() {
            return false;
        }
        for r in &self.meta().references {
            if r.policy != ReferencePolicy::Static {
                continue;
            }
            let live = candidates.get(&r.name).map(Vec::as_slice).unwrap_or_default();
            let bound = d.bound.get(&r.name).map(Vec::as_slice).unwrap_or_default();
            if bound.iter().any(|b| !live.contains(&b.reference)) {
                return true;
            }
            if r.policy_option == PolicyOption::Greedy {
                let wanted = if r.cardinality.is_multiple() { live.len() } else { live.len().min(1) };
                let best: BTreeSet<ServiceId> = live.iter().take(wanted).map(|s| s.id()).collect();
                let have: BTreeSet<ServiceId> = bound.iter().map(|b| b.reference.id()).collect();
                if best != have {
                    return true;
                }
            }
        }
        false
    }

    /// Binds new and unbinds departed services of dynamic references in place.
    fn update_dynamic(&self, rt: &RuntimeShared, candidates: &Candidates) {
        let (instances, snapshot) = {
            let d = self.data.read();
            if d.instances.is_empty() {
                return;
            }
            let arcs: Vec<Arc<dyn ComponentInstance>> = d.instances.iter().map(|l| l.instance.clone()).collect();
            (arcs, d.bound.clone())
        };
        let registry = rt.registry();

        for r in &self.meta().references {
            if r.policy != ReferencePolicy::Dynamic {
                continue;
            }
            let live = candidates.get(&r.name).map(Vec::as_slice).unwrap_or_default();
            let current = snapshot.get(&r.name).map(Vec::as_slice).unwrap_or_default();

            let desired: Vec<&ServiceReference> = if r.cardinality.is_multiple() {
                live.iter().collect()
            } else {
                let kept = current.iter().find(|b| live.contains(&b.reference));
                match (kept, live.first()) {
                    (Some(k), Some(best)) if r.policy_option == PolicyOption::Greedy && *best != k.reference => {
                        vec![best]
                    }
                    (Some(k), _) => vec![&k.reference],
                    (None, best) => best.into_iter().collect(),
                }
            };

            let to_bind: Vec<&ServiceReference> = desired
                .iter()
                .copied()
                .filter(|s| !current.iter().any(|b| b.reference == **s))
                .collect();
            let to_unbind: Vec<BoundService> = current
                .iter()
                .filter(|b| !desired.contains(&&b.reference))
                .cloned()
                .collect();

            for reference in to_bind {
                if activating_here(reference) {
                    continue;
                }
                let Some(object) = registry.get_service(&self.bundle, reference) else {
                    continue;
                };
                let service = BoundService {
                    reference: reference.clone(),
                    object,
                };
                {
                    let mut d = self.data.write();
                    let list = d.bound.entry(r.name.clone()).or_default();
                    list.push(service.clone());
                    list.sort_by(|a, b| a.reference.best_first(&b.reference));
                    d.relaxed.remove(&r.name);
                }
                for instance in &instances {
                    if let Err(err) = guard::invoke("bind", || instance.bind(&r.name, &service)) {
                        self.warn(rt, "bind failed", &err);
                    }
                }
                tracing::debug!(component = self.name(), reference = %r.name, service_id = reference.id(), "Bound dynamic reference");
            }

            for service in to_unbind {
                if let Some(list) = self.data.write().bound.get_mut(&r.name) {
                    list.retain(|b| b.reference != service.reference);
                }
                for instance in &instances {
                    if let Err(err) = guard::invoke("unbind", || instance.unbind(&r.name, &service)) {
                        self.warn(rt, "unbind failed", &err);
                    }
                }
                registry.unget_service(&self.bundle, &service.reference, Some(&service.object));
                tracing::debug!(component = self.name(), reference = %r.name, service_id = service.reference.id(), "Unbound dynamic reference");
            }
        }
    }

    /// Delivers changed properties. False when the component must be restarted.
    fn apply_modified(&self, rt: &RuntimeShared) -> bool {
        let props = self.properties();
        let (instances, bound, registration) = {
            let d = self.data.read();
            let live: Vec<(Arc<dyn ComponentInstance>, Option<Bundle>)> = d
                .instances
                .iter()
                .map(|l| (l.instance.clone(), l.using.clone()))
                .collect();
            (live, d.bound.clone(), d.registration.clone())
        };

        for (instance, using) in instances {
            let ctx = self.context(rt, using, bound.clone());
            match guard::invoke("modified", || instance.modified(&ctx)) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(err) => {
                    self.warn(rt, "modified failed", &err);
                    return false;
                }
            }
        }
        if let Some(registration) = registration {
            if let Err(err) = registration.set_properties(props) {
                tracing::warn!(component = self.name(), error = %err, "Failed to update component service properties");
            }
        }
        true
    }

    /// Creates an instance for a consumer of a delayed component's service.
    pub(crate) fn instantiate_delayed(
        self: &Arc<Self>,
        rt: &RuntimeShared,
        consumer: &Bundle,
    ) -> anyhow::Result<ServiceObject> {
        let Some(mark) = ActivationMark::enter(self.id) else {
            anyhow::bail!("component {} is already being activated on this thread", self.name());
        };
        let result = self.instantiate_delayed_locked(rt, consumer);
        drop(mark);
        if result.is_err() || ActivationMark::take_rebind() {
            rt.schedule_reconcile();
        }
        result
    }

    fn instantiate_delayed_locked(&self, rt: &RuntimeShared, consumer: &Bundle) -> anyhow::Result<ServiceObject> {
        let _guard = self.instance_lock.lock();
        let (state, first, bound) = {
            let d = self.data.read();
            (d.state, d.instances.is_empty(), d.bound.clone())
        };
        if !matches!(state, ComponentState::Satisfied | ComponentState::Active) {
            anyhow::bail!("component {} is not available ({state:?})", self.name());
        }
        if let Some(object) = self.reusable_object(consumer) {
            return Ok(object);
        }

        let bound = if first {
            let candidates = self.candidates(rt);
            self.bind_initial(rt, &candidates)
                .ok_or_else(|| anyhow!("references of component {} are not satisfied", self.name()))?
        } else {
            bound
        };

        let ctx = self.context(rt, Some(consumer.clone()), bound.clone());
        let instance = match self.create_instance(&ctx) {
            Ok(instance) => instance,
            Err(err) => {
                if first {
                    self.release_bound(rt, &[], bound);
                }
                self.fail(rt, "activation failed", &err);
                return Err(anyhow!(err));
            }
        };
        let Some(object) = instance.service() else {
            let release = if first { bound } else { BTreeMap::new() };
            self.discard_instance(rt, &instance, &ctx, release);
            self.fail(rt, "activation failed", "instance provides no service object");
            anyhow::bail!("component {} provides no service object", self.name());
        };

        {
            let mut d = self.data.write();
            if first {
                d.bound = bound;
            }
            d.instances.push(LiveInstance {
                instance,
                object: Some(object.clone()),
                using: Some(consumer.clone()),
            });
            d.state = ComponentState::Active;
        }
        tracing::info!(component = self.name(), consumer = %consumer, "Component activated on first use");
        Ok(object)
    }

    /// Live object a singleton or bundle scoped service already handed out to
    /// `consumer` while its registry entry was still being filled.
    fn reusable_object(&self, consumer: &Bundle) -> Option<ServiceObject> {
        let scope = self.meta().service.as_ref().map(|s| s.scope).unwrap_or_default();
        let d = self.data.read();
        d.instances
            .iter()
            .find(|l| match scope {
                ServiceScope::Singleton => true,
                ServiceScope::Bundle => l.using.as_ref().is_some_and(|u| u.id() == consumer.id()),
                ServiceScope::Prototype => false,
            })
            .and_then(|l| l.object.clone())
    }

    /// Tears down the instance created for `object`; the last one also releases
    /// the bound services.
    pub(crate) fn release_delayed(&self, rt: &RuntimeShared, object: &ServiceObject) {
        let (live, bound, last) = {
            let _guard = self.instance_lock.lock();
            let mut d = self.data.write();
            let Some(pos) = d
                .instances
                .iter()
                .position(|l| l.object.as_ref().is_some_and(|o| o.ptr_eq(object)))
            else {
                return;
            };
            let live = d.instances.remove(pos);
            let last = d.instances.is_empty();
            let bound = if last {
                std::mem::take(&mut d.bound)
            } else {
                d.bound.clone()
            };
            if last && d.state == ComponentState::Active {
                d.state = ComponentState::Satisfied;
            }
            (live, bound, last)
        };

        let ctx = self.context(rt, live.using.clone(), bound.clone());
        if let Err(err) = guard::invoke("deactivate", || live.instance.deactivate(&ctx)) {
            self.warn(rt, "deactivate failed", &err);
        }
        if last {
            self.release_bound(rt, std::slice::from_ref(&live.instance), bound);
        }
        tracing::debug!(component = self.name(), "Released delayed component instance");
    }

    pub(crate) fn info(&self, rt: &RuntimeShared) -> ComponentConfigurationInfo {
        let candidates = self.candidates(rt);
        let unsatisfied_references = self
            .meta()
            .references
            .iter()
            .filter(|r| r.cardinality.is_mandatory())
            .filter(|r| candidates.get(&r.name).map_or(true, Vec::is_empty))
            .map(|r| r.name.clone())
            .collect();
        let d = self.data.read();
        ComponentConfigurationInfo {
            id: self.id,
            name: self.name().to_owned(),
            bundle: self.bundle.id(),
            enabled: d.enabled,
            state: d.state,
            immediate: self.meta().is_immediate(),
            instances: d.instances.len(),
            service_id: d.registration.as_ref().map(ServiceRegistration::id),
            bound: d
                .bound
                .iter()
                .map(|(k, v)| (k.clone(), v.iter().map(|b| b.reference.id()).collect()))
                .collect(),
            unsatisfied_references,
            failure: d.failure.clone(),
        }
    }
}

/// Service factory published for delayed components.
struct DelayedFactory {
    config: Weak<ComponentConfiguration>,
    runtime: Weak<RuntimeShared>,
}

impl ServiceFactory for DelayedFactory {
    fn get_service(&self, consumer: &Bundle, _registration: &ServiceRegistration) -> anyhow::Result<ServiceObject> {
        let (Some(config), Some(runtime)) = (self.config.upgrade(), self.runtime.upgrade()) else {
            anyhow::bail!("component runtime is gone");
        };
        config.instantiate_delayed(&runtime, consumer)
    }

    fn unget_service(
        &self,
        _consumer: &Bundle,
        _registration: &ServiceRegistration,
        service: ServiceObject,
    ) -> anyhow::Result<()> {
        if let (Some(config), Some(runtime)) = (self.config.upgrade(), self.runtime.upgrade()) {
            config.release_delayed(&runtime, &service);
        }
        Ok(())
    }
}
