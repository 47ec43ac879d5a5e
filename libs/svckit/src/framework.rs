//! The framework: bundle table, per-bundle contexts and lifecycle ordering.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bundle::{Bundle, BundleId, BundleState, SYSTEM_BUNDLE_ID};
use crate::diagnostics::{DiagnosticSink, TracingSink};
use crate::events::{
    BundleEvent, BundleEventKind, FrameworkEvent, FrameworkEventKind, ServiceEvent,
};
use crate::listeners::ListenerToken;
use crate::properties::PropertyMap;
use crate::service::{
    RegistryError, ServiceInterface, ServiceObject, ServiceObjects, ServiceReference,
    ServiceRegistration, ServiceRegistry, ServiceScope, ServiceSource,
};

/// Framework-level settings, usually loaded from the `framework` config section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FrameworkSettings {
    /// Name of the system bundle.
    pub name: String,
    /// Turn bundle and service listener failures into FrameworkEvent ERROR.
    pub listener_errors_as_events: bool,
}

impl Default for FrameworkSettings {
    fn default() -> Self {
        Self {
            name: "svckit.system".to_owned(),
            listener_errors_as_events: true,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameworkError {
    #[error("unknown bundle {0}")]
    UnknownBundle(BundleId),
    #[error("bundle {0} is uninstalled")]
    BundleUninstalled(BundleId),
    #[error("the system bundle cannot be {0}")]
    SystemBundle(&'static str),
}

struct FrameworkInner {
    registry: ServiceRegistry,
    bundles: RwLock<BTreeMap<BundleId, Bundle>>,
    next_bundle_id: AtomicU64,
}

/// Entry point of the broker. Cheap to clone.
#[derive(Clone)]
pub struct Framework {
    inner: Arc<FrameworkInner>,
}

#[derive(Default)]
pub struct FrameworkBuilder {
    settings: FrameworkSettings,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl FrameworkBuilder {
    pub fn settings(mut self, settings: FrameworkSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> Framework {
        let system = Bundle::new(SYSTEM_BUNDLE_ID, self.settings.name.clone());
        system.set_state(BundleState::Starting);
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let registry = ServiceRegistry::new(system.clone(), self.settings, sink);
        let mut bundles = BTreeMap::new();
        bundles.insert(SYSTEM_BUNDLE_ID, system);
        Framework {
            inner: Arc::new(FrameworkInner {
                registry,
                bundles: RwLock::new(bundles),
                next_bundle_id: AtomicU64::new(SYSTEM_BUNDLE_ID + 1),
            }),
        }
    }
}

impl Default for Framework {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Framework {
    pub fn builder() -> FrameworkBuilder {
        FrameworkBuilder::default()
    }

    pub fn new(settings: FrameworkSettings) -> Self {
        Self::builder().settings(settings).build()
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn system_bundle(&self) -> Bundle {
        self.inner.registry.system_bundle().clone()
    }

    pub fn system_context(&self) -> BundleContext {
        self.context(&self.system_bundle())
    }

    pub fn context(&self, bundle: &Bundle) -> BundleContext {
        BundleContext {
            bundle: bundle.clone(),
            registry: self.inner.registry.clone(),
        }
    }

    pub fn bundles(&self) -> Vec<Bundle> {
        self.inner.bundles.read().values().cloned().collect()
    }

    pub fn bundle(&self, id: BundleId) -> Option<Bundle> {
        self.inner.bundles.read().get(&id).cloned()
    }

    /// Activates the system bundle and fires FrameworkEvent STARTED.
    pub fn start(&self) {
        let system = self.system_bundle();
        if system.state() == BundleState::Active {
            return;
        }
        system.set_state(BundleState::Active);
        tracing::info!(framework = system.name(), "Framework started");
        self.inner
            .registry
            .fire_framework_event(&FrameworkEvent::new(FrameworkEventKind::Started, "framework started"));
    }

    /// Adds a bundle in the RESOLVED state.
    pub fn install(&self, name: impl Into<String>) -> Bundle {
        let id = self.inner.next_bundle_id.fetch_add(1, Ordering::Relaxed);
        let bundle = Bundle::new(id, name);
        self.inner.bundles.write().insert(id, bundle.clone());
        tracing::debug!(bundle = %bundle, "Bundle installed");
        self.fire(BundleEventKind::Installed, &bundle);
        bundle.set_state(BundleState::Resolved);
        self.fire(BundleEventKind::Resolved, &bundle);
        bundle
    }

    pub fn start_bundle(&self, bundle: &Bundle) -> Result<(), FrameworkError> {
        self.known(bundle)?;
        if bundle.state() == BundleState::Active {
            return Ok(());
        }
        bundle.set_state(BundleState::Starting);
        self.fire(BundleEventKind::Starting, bundle);
        bundle.set_state(BundleState::Active);
        tracing::info!(bundle = %bundle, "Bundle started");
        self.fire(BundleEventKind::Started, bundle);
        Ok(())
    }

    /// Stops a bundle.
    ///
    /// STOPPING is delivered first so component runtimes deactivate the bundle's
    /// components; then the services it uses are released, its remaining
    /// registrations are withdrawn, its listeners removed, and STOPPED is fired.
    pub fn stop_bundle(&self, bundle: &Bundle) -> Result<(), FrameworkError> {
        self.known(bundle)?;
        if bundle.is_system() {
            return Err(FrameworkError::SystemBundle("stopped individually"));
        }
        if !matches!(bundle.state(), BundleState::Active | BundleState::Starting) {
            return Ok(());
        }
        self.teardown(bundle);
        bundle.set_state(BundleState::Resolved);
        self.fire(BundleEventKind::Stopped, bundle);
        tracing::info!(bundle = %bundle, "Bundle stopped");
        Ok(())
    }

    pub fn uninstall(&self, bundle: &Bundle) -> Result<(), FrameworkError> {
        if bundle.is_system() {
            return Err(FrameworkError::SystemBundle("uninstalled"));
        }
        self.stop_bundle(bundle)?;
        bundle.set_state(BundleState::Uninstalled);
        self.fire(BundleEventKind::Uninstalled, bundle);
        self.inner.bundles.write().remove(&bundle.id());
        Ok(())
    }

    /// Stops every bundle in reverse install order, then the system bundle.
    pub fn shutdown(&self) {
        tracing::info!("Framework shutting down");
        let bundles: Vec<Bundle> = self
            .bundles()
            .into_iter()
            .rev()
            .filter(|b| !b.is_system())
            .collect();
        for bundle in bundles {
            if let Err(err) = self.stop_bundle(&bundle) {
                tracing::warn!(bundle = %bundle, error = %err, "Failed to stop bundle");
            }
        }

        let system = self.system_bundle();
        if system.state() == BundleState::Resolved {
            return;
        }
        system.set_state(BundleState::Stopping);
        let registry = &self.inner.registry;
        registry.release_services_of(&system);
        registry.unregister_services_of(&system);
        registry.fire_framework_event(&FrameworkEvent::new(
            FrameworkEventKind::Stopped,
            "framework stopped",
        ));
        registry.remove_listeners_of(&system);
        system.set_state(BundleState::Resolved);
        tracing::info!("Framework stopped");
    }

    fn teardown(&self, bundle: &Bundle) {
        let registry = &self.inner.registry;
        bundle.set_state(BundleState::Stopping);
        self.fire(BundleEventKind::Stopping, bundle);
        registry.release_services_of(bundle);
        registry.unregister_services_of(bundle);
        registry.remove_listeners_of(bundle);
    }

    fn known(&self, bundle: &Bundle) -> Result<(), FrameworkError> {
        if bundle.state() == BundleState::Uninstalled {
            return Err(FrameworkError::BundleUninstalled(bundle.id()));
        }
        if !self.inner.bundles.read().contains_key(&bundle.id()) {
            return Err(FrameworkError::UnknownBundle(bundle.id()));
        }
        Ok(())
    }

    fn fire(&self, kind: BundleEventKind, bundle: &Bundle) {
        self.inner
            .registry
            .fire_bundle_event(&BundleEvent::new(kind, bundle.clone()));
    }
}

/// A bundle's view of the broker. Every call acts on behalf of that bundle.
#[derive(Clone)]
pub struct BundleContext {
    bundle: Bundle,
    registry: ServiceRegistry,
}

impl BundleContext {
    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    fn ensure_active(&self) -> Result<(), RegistryError> {
        match self.bundle.state() {
            BundleState::Starting | BundleState::Active | BundleState::Stopping => Ok(()),
            _ => Err(RegistryError::BundleNotActive(self.bundle.id())),
        }
    }

    /// Registers a singleton-scoped service.
    pub fn register_service(
        &self,
        interfaces: &[&str],
        source: impl Into<ServiceSource>,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration, RegistryError> {
        self.register_scoped(interfaces, source, ServiceScope::Singleton, properties)
    }

    pub fn register_scoped(
        &self,
        interfaces: &[&str],
        source: impl Into<ServiceSource>,
        scope: ServiceScope,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration, RegistryError> {
        self.ensure_active()?;
        self.registry.register(
            &self.bundle,
            interfaces.iter().map(|s| (*s).to_owned()).collect(),
            source.into(),
            scope,
            properties,
        )
    }

    /// Registers one implementation under `T::NAME`.
    pub fn register<T: ?Sized + ServiceInterface>(
        &self,
        service: Arc<T>,
        properties: PropertyMap,
    ) -> Result<ServiceRegistration, RegistryError> {
        self.register_service(&[T::NAME], ServiceObject::of(service), properties)
    }

    pub fn find_references(
        &self,
        interface: &str,
        filter: &str,
    ) -> Result<Vec<ServiceReference>, RegistryError> {
        self.registry.find_references(&self.bundle, interface, filter)
    }

    pub fn find_reference(&self, interface: &str) -> Option<ServiceReference> {
        self.registry.find_reference(&self.bundle, interface)
    }

    pub fn get_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        self.registry.get_service(&self.bundle, reference)
    }

    /// Gets the service and extracts `T`. The use is released again when the
    /// object does not provide `T`.
    pub fn get_typed<T: ?Sized + ServiceInterface>(&self, reference: &ServiceReference) -> Option<Arc<T>> {
        let obj = self.get_service(reference)?;
        let typed = obj.get::<T>();
        if typed.is_none() {
            self.unget_service(reference, Some(&obj));
        }
        typed
    }

    pub fn unget_service(&self, reference: &ServiceReference, service: Option<&ServiceObject>) -> bool {
        self.registry.unget_service(&self.bundle, reference, service)
    }

    pub fn service_objects(&self, reference: &ServiceReference) -> ServiceObjects {
        self.registry.service_objects(&self.bundle, reference)
    }

    pub fn services_in_use(&self) -> Vec<ServiceReference> {
        self.registry.services_in_use(&self.bundle)
    }

    pub fn registrations(&self) -> Vec<ServiceReference> {
        self.registry.registrations_of(&self.bundle)
    }

    pub fn add_service_listener<F>(&self, filter: &str, callback: F) -> Result<ListenerToken, RegistryError>
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        self.registry.add_service_listener(&self.bundle, filter, callback)
    }

    pub fn add_bundle_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&BundleEvent) + Send + Sync + 'static,
    {
        self.registry.add_bundle_listener(&self.bundle, callback)
    }

    pub fn add_framework_listener<F>(&self, callback: F) -> ListenerToken
    where
        F: Fn(&FrameworkEvent) + Send + Sync + 'static,
    {
        self.registry.add_framework_listener(&self.bundle, callback)
    }

    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        self.registry.remove_listener(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn bundle_lifecycle_fires_events_in_order() {
        let fw = Framework::default();
        fw.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        fw.system_context()
            .add_bundle_listener(move |e| sink.lock().push((e.bundle.id(), e.kind)));

        let b = fw.install("printer");
        fw.start_bundle(&b).unwrap();
        fw.stop_bundle(&b).unwrap();
        fw.uninstall(&b).unwrap();

        let kinds: Vec<BundleEventKind> = seen.lock().iter().map(|(_, k)| *k).collect();
        assert_eq!(
            kinds,
            vec![
                BundleEventKind::Installed,
                BundleEventKind::Resolved,
                BundleEventKind::Starting,
                BundleEventKind::Started,
                BundleEventKind::Stopping,
                BundleEventKind::Stopped,
                BundleEventKind::Uninstalled,
            ]
        );
        assert!(fw.bundle(b.id()).is_none());
        assert_eq!(
            fw.start_bundle(&b),
            Err(FrameworkError::BundleUninstalled(b.id()))
        );
    }

    #[test]
    fn inactive_bundle_cannot_register() {
        let fw = Framework::default();
        let b = fw.install("idle");
        let err = fw
            .context(&b)
            .register_service(&["x"], crate::service::InterfaceMap::new(), PropertyMap::new())
            .unwrap_err();
        assert_eq!(err, RegistryError::BundleNotActive(b.id()));
    }

    #[test]
    fn system_bundle_is_protected() {
        let fw = Framework::default();
        let system = fw.system_bundle();
        assert!(matches!(fw.stop_bundle(&system), Err(FrameworkError::SystemBundle(_))));
        assert!(matches!(fw.uninstall(&system), Err(FrameworkError::SystemBundle(_))));
    }

    #[test]
    fn shutdown_reports_stopped() {
        let fw = Framework::default();
        fw.start();
        let stopped = Arc::new(Mutex::new(Vec::new()));
        let sink = stopped.clone();
        fw.system_context()
            .add_framework_listener(move |e| sink.lock().push(e.kind));
        let b = fw.install("a");
        fw.start_bundle(&b).unwrap();

        fw.shutdown();

        assert_eq!(b.state(), BundleState::Resolved);
        assert_eq!(*stopped.lock(), vec![FrameworkEventKind::Stopped]);
    }
}
