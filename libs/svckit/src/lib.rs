//! # svckit - In-process service broker
//!
//! Bundles publish services under interface names with properties; other bundles
//! look them up with LDAP-style filters, get notified of changes and can be
//! wired together declaratively.
//!
//! - [`filter`]: RFC 1960 filter parsing and matching over [`PropertyMap`]s
//! - [`service`]: the registry, with singleton, bundle and prototype scopes
//! - [`hooks`]: find, event-listener, listener and bundle-event hooks
//! - [`tracker`]: a live, best-first view of the services matching a filter
//! - [`components`]: declarative components with reference tracking
//!
//! ```rust
//! use std::sync::Arc;
//! use svckit::{Framework, PropertyMap};
//!
//! trait Greeter: Send + Sync {
//!     fn greet(&self) -> String;
//! }
//! svckit::service_interface!(dyn Greeter, "example.Greeter");
//!
//! struct English;
//! impl Greeter for English {
//!     fn greet(&self) -> String {
//!         "hello".into()
//!     }
//! }
//!
//! let fw = Framework::default();
//! fw.start();
//! let bundle = fw.install("greeter");
//! fw.start_bundle(&bundle).unwrap();
//!
//! let ctx = fw.context(&bundle);
//! let greeter: Arc<dyn Greeter> = Arc::new(English);
//! ctx.register::<dyn Greeter>(greeter, PropertyMap::new().with("lang", "en")).unwrap();
//!
//! let reference = ctx.find_references("example.Greeter", "(lang=en)").unwrap().remove(0);
//! let found = ctx.get_typed::<dyn Greeter>(&reference).unwrap();
//! assert_eq!(found.greet(), "hello");
//! ```

pub mod bundle;
pub mod components;
pub mod diagnostics;
pub mod events;
pub mod filter;
pub mod framework;
pub mod hooks;
pub mod listeners;
pub mod properties;
pub mod service;
pub mod tracker;

mod guard;

pub use bundle::{Bundle, BundleId, BundleState, SYSTEM_BUNDLE_ID};
pub use components::{ComponentError, ComponentRuntime, ComponentSettings, ComponentState};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, Severity, TracingSink};
pub use events::{
    BundleEvent, BundleEventKind, FrameworkEvent, FrameworkEventKind, ServiceEvent, ServiceEventKind,
};
pub use filter::{Filter, FilterError};
pub use framework::{BundleContext, Framework, FrameworkBuilder, FrameworkError, FrameworkSettings};
pub use guard::CallbackError;
pub use listeners::ListenerToken;
pub use properties::{PropertyMap, PropertyValue};
pub use service::{
    InterfaceMap, RegistryError, ServiceFactory, ServiceId, ServiceInterface, ServiceObject,
    ServiceObjects, ServiceReference, ServiceRegistration, ServiceRegistry, ServiceScope,
    ServiceSource,
};
pub use tracker::{ObjectCustomizer, ServiceTracker, ServiceTrackerCustomizer};
