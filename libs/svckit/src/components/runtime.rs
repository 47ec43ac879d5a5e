//! The component runtime: owns every configuration and drives them from
//! service and bundle events.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::configuration::{Candidates, ComponentConfiguration, ComponentConfigurationInfo, ComponentState};
use super::description::ComponentDescription;
use super::graph::{DependencyEdge, DependencyGraph};
use super::work::{work_service, AsyncWorkService, WorkMode};
use super::ComponentError;
use crate::bundle::{Bundle, BundleId};
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::events::{BundleEventKind, FrameworkEvent, FrameworkEventKind};
use crate::framework::Framework;
use crate::listeners::ListenerToken;
use crate::properties::PropertyMap;
use crate::service::ServiceRegistry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentSettings {
    /// Executor for enable/disable requests made from component callbacks.
    pub work_mode: WorkMode,
    /// Report cycles of static mandatory references as deadlock diagnostics.
    pub report_deadlocks: bool,
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self {
            work_mode: WorkMode::default(),
            report_deadlocks: true,
        }
    }
}

pub(crate) struct RuntimeShared {
    framework: Framework,
    settings: ComponentSettings,
    configs: DashMap<String, Arc<ComponentConfiguration>>,
    order: RwLock<Vec<String>>,
    next_id: AtomicU64,
    work: Arc<dyn AsyncWorkService>,
    tokens: Mutex<Vec<ListenerToken>>,
    cycle_pass: Mutex<()>,
    weak_self: Weak<RuntimeShared>,
}

/// Declarative component runtime bound to one framework.
///
/// Components are added per bundle and activated as their mandatory references
/// become available. Stopping a bundle removes its components.
#[derive(Clone)]
pub struct ComponentRuntime {
    shared: Arc<RuntimeShared>,
}

impl ComponentRuntime {
    pub fn new(framework: &Framework, settings: ComponentSettings) -> Self {
        let work = work_service(settings.work_mode);
        Self::with_work_service(framework, settings, work)
    }

    pub fn with_work_service(
        framework: &Framework,
        settings: ComponentSettings,
        work: Arc<dyn AsyncWorkService>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak_self| RuntimeShared {
            framework: framework.clone(),
            settings,
            configs: DashMap::new(),
            order: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            work,
            tokens: Mutex::new(Vec::new()),
            cycle_pass: Mutex::new(()),
            weak_self: weak_self.clone(),
        });

        let system = framework.system_context();
        let weak = Arc::downgrade(&shared);
        match system.add_service_listener("", move |_event| {
            if let Some(rt) = weak.upgrade() {
                rt.reconcile_all();
            }
        }) {
            Ok(token) => shared.tokens.lock().push(token),
            Err(err) => tracing::error!(error = %err, "Failed to subscribe component runtime to service events"),
        }

        let weak = Arc::downgrade(&shared);
        let token = system.add_bundle_listener(move |event| {
            if event.kind == BundleEventKind::Stopping {
                if let Some(rt) = weak.upgrade() {
                    rt.remove_bundle_components(&event.bundle);
                }
            }
        });
        shared.tokens.lock().push(token);

        tracing::debug!(work_mode = ?shared.settings.work_mode, "Component runtime attached");
        Self { shared }
    }

    pub fn framework(&self) -> &Framework {
        &self.shared.framework
    }

    pub fn settings(&self) -> &ComponentSettings {
        &self.shared.settings
    }

    /// Adds the components of `bundle` and activates those already satisfied.
    /// Returns the configuration ids in input order.
    pub fn add_bundle_components(
        &self,
        bundle: &Bundle,
        descriptions: Vec<ComponentDescription>,
    ) -> Result<Vec<u64>, ComponentError> {
        let mut names = HashSet::new();
        for description in &descriptions {
            description.metadata.validate()?;
            if !names.insert(description.name()) || self.shared.configs.contains_key(description.name()) {
                return Err(ComponentError::Duplicate(description.name().to_owned()));
            }
        }

        let mut ids = Vec::with_capacity(descriptions.len());
        for description in descriptions {
            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
            let name = description.name().to_owned();
            tracing::debug!(component = %name, id, bundle = %bundle, "Component added");
            let config = Arc::new(ComponentConfiguration::new(id, description, bundle.clone()));
            self.shared.configs.insert(name, config);
            ids.push(id);
        }
        self.shared.recompute_order();
        self.shared.reconcile_all();
        Ok(ids)
    }

    /// Deactivates and forgets every component of `bundle`.
    pub fn remove_bundle_components(&self, bundle: &Bundle) {
        self.shared.remove_bundle_components(bundle);
    }

    pub fn enable_component(&self, name: &str) -> Result<(), ComponentError> {
        self.shared.set_enabled(name, true, None)
    }

    pub fn disable_component(&self, name: &str) -> Result<(), ComponentError> {
        self.shared.set_enabled(name, false, None)
    }

    /// Queues an enable request on the work service.
    pub fn enable_component_async(&self, name: &str) {
        self.shared.post(name.to_owned(), true, None);
    }

    /// Queues a disable request on the work service.
    pub fn disable_component_async(&self, name: &str) {
        self.shared.post(name.to_owned(), false, None);
    }

    /// Replaces runtime-supplied configuration properties of a component.
    /// Active instances get `modified`; declining it restarts the component.
    pub fn update_properties(&self, name: &str, properties: PropertyMap) -> Result<(), ComponentError> {
        let config = self.shared.config(name)?;
        config.set_overrides(properties);
        config.reconcile(&self.shared);
        self.shared.resolve_cycles();
        Ok(())
    }

    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.shared.configs.get(name).map(|c| c.state())
    }

    pub fn configuration(&self, name: &str) -> Option<ComponentConfigurationInfo> {
        let config = self.shared.configs.get(name).map(|c| c.value().clone())?;
        Some(config.info(&self.shared))
    }

    /// Every configuration in activation order.
    pub fn configurations(&self) -> Vec<ComponentConfigurationInfo> {
        self.shared
            .ordered()
            .iter()
            .map(|c| c.info(&self.shared))
            .collect()
    }

    /// Mandatory references of `name` that currently have no candidate service.
    pub fn unsatisfied_references(&self, name: &str) -> Option<Vec<String>> {
        self.configuration(name).map(|info| info.unsatisfied_references)
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        self.shared.graph()
    }

    /// Deactivates every component in reverse activation order and detaches
    /// from the framework.
    pub fn shutdown(&self) {
        tracing::info!("Phase: component shutdown");
        for token in self.shared.tokens.lock().drain(..) {
            self.shared.framework.registry().remove_listener(token);
        }
        let configs = self.shared.ordered();
        for config in configs.iter().rev() {
            config.set_enabled(false);
            config.reconcile(&self.shared);
        }
        self.shared.configs.clear();
        self.shared.order.write().clear();
    }
}

impl RuntimeShared {
    pub(crate) fn framework(&self) -> &Framework {
        &self.framework
    }

    pub(crate) fn registry(&self) -> &ServiceRegistry {
        self.framework.registry()
    }

    pub(crate) fn sink(&self) -> Arc<dyn DiagnosticSink> {
        self.registry().diagnostics()
    }

    pub(crate) fn weak(&self) -> Weak<RuntimeShared> {
        self.weak_self.clone()
    }

    fn config(&self, name: &str) -> Result<Arc<ComponentConfiguration>, ComponentError> {
        self.configs
            .get(name)
            .map(|c| c.value().clone())
            .ok_or_else(|| ComponentError::Unknown(name.to_owned()))
    }

    fn ordered(&self) -> Vec<Arc<ComponentConfiguration>> {
        let order = self.order.read().clone();
        order
            .iter()
            .filter_map(|name| self.configs.get(name).map(|c| c.value().clone()))
            .collect()
    }

    fn graph(&self) -> DependencyGraph {
        let mut configs: Vec<Arc<ComponentConfiguration>> =
            self.configs.iter().map(|c| c.value().clone()).collect();
        configs.sort_by_key(|c| c.id);
        DependencyGraph::from_metadata(configs.iter().map(|c| c.meta()))
    }

    fn recompute_order(&self) {
        let order = self.graph().activation_order_lenient();
        *self.order.write() = order;
    }

    pub(crate) fn reconcile_all(&self) {
        for config in self.ordered() {
            config.reconcile(self);
        }
        self.resolve_cycles();
    }

    pub(crate) fn schedule_reconcile(&self) {
        let weak = self.weak();
        self.work.post(Box::new(move || {
            if let Some(rt) = weak.upgrade() {
                rt.reconcile_all();
            }
        }));
    }

    /// Enable or disable requested by a component of `bundle`.
    pub(crate) fn post_set_enabled(&self, bundle: BundleId, name: String, enabled: bool) {
        self.post(name, enabled, Some(bundle));
    }

    fn post(&self, name: String, enabled: bool, bundle: Option<BundleId>) {
        let weak = self.weak();
        self.work.post(Box::new(move || {
            let Some(rt) = weak.upgrade() else {
                return;
            };
            if let Err(err) = rt.set_enabled(&name, enabled, bundle) {
                tracing::warn!(component = %name, enabled, error = %err, "Component enable request failed");
            }
        }));
    }

    fn set_enabled(&self, name: &str, enabled: bool, bundle: Option<BundleId>) -> Result<(), ComponentError> {
        let config = self.config(name)?;
        if bundle.is_some_and(|id| id != config.bundle.id()) {
            return Err(ComponentError::Unknown(name.to_owned()));
        }
        if config.is_enabled() == enabled && config.state() != ComponentState::Failed {
            return Ok(());
        }
        tracing::debug!(component = name, enabled, "Component enablement changed");
        config.set_enabled(enabled);
        self.reconcile_all();
        Ok(())
    }

    fn remove_bundle_components(&self, bundle: &Bundle) {
        let owned: Vec<Arc<ComponentConfiguration>> = self
            .ordered()
            .into_iter()
            .filter(|c| c.bundle.id() == bundle.id())
            .collect();
        if owned.is_empty() {
            return;
        }
        tracing::info!(bundle = %bundle, count = owned.len(), "Removing bundle components");
        for config in owned.iter().rev() {
            self.configs.remove(config.name());
            config.set_enabled(false);
            config.reconcile(self);
        }
        self.recompute_order();
    }

    /// Breaks or reports cycles among components that wait only on each other.
    pub(crate) fn resolve_cycles(&self) {
        let Some(_pass) = self.cycle_pass.try_lock() else {
            return;
        };
        for _ in 0..=self.configs.len() {
            if !self.break_one_cycle() {
                break;
            }
        }
    }

    fn break_one_cycle(&self) -> bool {
        let blocked: Vec<(Arc<ComponentConfiguration>, Candidates)> = self
            .ordered()
            .into_iter()
            .filter(|c| c.is_enabled() && c.state() == ComponentState::Unsatisfied)
            .map(|c| {
                let candidates = c.candidates(self);
                (c, candidates)
            })
            .filter(|(c, candidates)| !c.unmet_references(candidates).is_empty())
            .collect();
        if blocked.len() < 2 {
            return false;
        }

        let providers_of = |interface: &str, except: &str| -> Vec<String> {
            blocked
                .iter()
                .filter(|(other, _)| other.name() != except)
                .filter(|(other, _)| other.meta().provided_interfaces().iter().any(|i| i == interface))
                .map(|(other, _)| other.name().to_owned())
                .collect()
        };

        // Members waiting on something outside the blocked set cannot be freed
        // by breaking a cycle.
        let mut external = BTreeSet::new();
        for (config, candidates) in &blocked {
            if config
                .unmet_references(candidates)
                .iter()
                .any(|r| providers_of(&r.interface, config.name()).is_empty())
            {
                external.insert(config.name().to_owned());
            }
        }

        let mut graph = DependencyGraph::new();
        for (config, candidates) in &blocked {
            if external.contains(config.name()) {
                continue;
            }
            graph.add_node(config.name());
            for reference in config.unmet_references(candidates) {
                for provider in providers_of(&reference.interface, config.name()) {
                    if external.contains(&provider) {
                        continue;
                    }
                    graph.add_edge(DependencyEdge {
                        from: config.name().to_owned(),
                        to: provider,
                        reference: reference.name.clone(),
                        mandatory: true,
                        dynamic: reference.is_dynamic(),
                    });
                }
            }
        }

        for cycle in graph.cycles() {
            let path = cycle.path.join(" -> ");
            if let Some(breaker) = &cycle.breaker {
                let Some((config, candidates)) = blocked.iter().find(|(c, _)| c.name() == breaker) else {
                    continue;
                };
                let relaxed: Vec<String> = config
                    .unmet_references(candidates)
                    .iter()
                    .map(|r| r.name.clone())
                    .collect();
                tracing::info!(component = %breaker, cycle = %path, "Breaking dependency cycle through dynamic references");
                config.relax(relaxed);
                config.reconcile(self);
                return true;
            }
            if !self.settings.report_deadlocks {
                continue;
            }
            for member in &cycle.members {
                let Some((config, _)) = blocked.iter().find(|(c, _)| c.name() == member) else {
                    continue;
                };
                if config.deadlock_reported() {
                    continue;
                }
                config.mark_deadlock_reported();
                tracing::error!(component = %member, cycle = %path, "Component dependency cycle cannot be resolved");
                self.sink().report(
                    &Diagnostic::error(
                        DiagnosticKind::Deadlock,
                        format!("Component dependency cycle cannot be resolved: {path}"),
                    )
                    .component(member.as_str())
                    .bundle(config.bundle.id()),
                );
                self.registry().fire_framework_event(
                    &FrameworkEvent::new(
                        FrameworkEventKind::Error,
                        format!("component {member} cannot resolve dependency cycle {path}"),
                    )
                    .with_bundle(config.bundle.clone()),
                );
            }
        }
        false
    }
}
