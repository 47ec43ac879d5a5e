//! Pluggable reporting of errors the broker isolates instead of propagating.
//!
//! Factory, hook, listener and component callback failures never unwind into the
//! caller; they are converted to a [`Diagnostic`] and handed to the configured
//! [`DiagnosticSink`]. The default sink forwards to `tracing`.

use parking_lot::Mutex;
use serde::Serialize;

use crate::bundle::BundleId;
use crate::service::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A service factory failed, panicked, recursed or returned an unusable object.
    ServiceFactory,
    /// Releasing a service object through its factory failed.
    ServiceRelease,
    /// A find, event, listener or bundle-event hook failed.
    Hook,
    /// A service, bundle or framework listener failed.
    Listener,
    /// A component lifecycle or bind callback failed.
    Component,
    /// A component dependency cycle cannot be broken.
    Deadlock,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<BundleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_id: Option<ServiceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            bundle: None,
            service_id: None,
            component: None,
            cause: None,
        }
    }

    pub fn error(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Error, message)
    }

    pub fn warning(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warning, message)
    }

    pub fn bundle(mut self, id: BundleId) -> Self {
        self.bundle = Some(id);
        self
    }

    pub fn service(mut self, id: ServiceId) -> Self {
        self.service_id = Some(id);
        self
    }

    pub fn component(mut self, name: impl Into<String>) -> Self {
        self.component = Some(name.into());
        self
    }

    pub fn cause(mut self, cause: impl ToString) -> Self {
        self.cause = Some(cause.to_string());
        self
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing` under the `svckit::diagnostics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, d: &Diagnostic) {
        let cause = d.cause.as_deref().unwrap_or("");
        let component = d.component.as_deref().unwrap_or("");
        match d.severity {
            Severity::Error => tracing::error!(
                target: "svckit::diagnostics",
                kind = ?d.kind,
                bundle = ?d.bundle,
                service_id = ?d.service_id,
                component,
                cause,
                "{}",
                d.message
            ),
            Severity::Warning => tracing::warn!(
                target: "svckit::diagnostics",
                kind = ?d.kind,
                bundle = ?d.bundle,
                service_id = ?d.service_id,
                component,
                cause,
                "{}",
                d.message
            ),
        }
    }
}

/// Records every diagnostic in memory, and forwards it to `tracing` too.
#[derive(Default)]
pub struct CollectingSink {
    entries: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries.lock().clone()
    }

    pub fn of_kind(&self, kind: DiagnosticKind) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: &Diagnostic) {
        TracingSink.report(diagnostic);
        self.entries.lock().push(diagnostic.clone());
    }
}
