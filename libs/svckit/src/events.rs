//! Events delivered to service, bundle and framework listeners.

use serde::Serialize;

use crate::bundle::Bundle;
use crate::service::ServiceReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEventKind {
    Registered,
    Modified,
    /// Sent to listeners whose filter matched before a property change but no longer does.
    ModifiedEndMatch,
    /// Sent while the registration is still queryable, before it disappears.
    Unregistering,
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub kind: ServiceEventKind,
    pub reference: ServiceReference,
}

impl ServiceEvent {
    pub fn new(kind: ServiceEventKind, reference: ServiceReference) -> Self {
        Self { kind, reference }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BundleEventKind {
    Installed,
    Resolved,
    Starting,
    Started,
    Stopping,
    Stopped,
    Uninstalled,
}

#[derive(Debug, Clone)]
pub struct BundleEvent {
    pub kind: BundleEventKind,
    pub bundle: Bundle,
}

impl BundleEvent {
    pub fn new(kind: BundleEventKind, bundle: Bundle) -> Self {
        Self { kind, bundle }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameworkEventKind {
    Started,
    Stopped,
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct FrameworkEvent {
    pub kind: FrameworkEventKind,
    pub bundle: Option<Bundle>,
    pub message: String,
    pub cause: Option<String>,
}

impl FrameworkEvent {
    pub fn new(kind: FrameworkEventKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            bundle: None,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_bundle(mut self, bundle: Bundle) -> Self {
        self.bundle = Some(bundle);
        self
    }

    pub fn with_cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}
