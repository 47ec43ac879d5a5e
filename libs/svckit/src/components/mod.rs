//! Declarative components on top of the service registry.
//!
//! A component declares the interfaces it publishes and the services it
//! references. The runtime activates it once every mandatory reference is
//! available, keeps its bindings current and deactivates it when a reference
//! it cannot live without goes away.

pub mod context;
pub mod description;
pub mod graph;
pub mod instance;
pub mod work;

mod configuration;
mod runtime;

pub use configuration::{ComponentConfigurationInfo, ComponentState};
pub use context::ComponentContext;
pub use description::{
    Cardinality, ComponentDescription, ComponentMetadata, PolicyOption, ReferenceMetadata,
    ReferencePolicy, ServiceMetadata,
};
pub use graph::{CycleInfo, DependencyEdge, DependencyGraph, GraphError};
pub use instance::{BoundService, ComponentFactory, ComponentInstance};
pub use runtime::{ComponentRuntime, ComponentSettings};
pub use work::{AsyncWorkService, InlineWorkService, ThreadWorkService, TokioWorkService, WorkMode};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error("invalid component '{component}': {reason}")]
    InvalidDescription { component: String, reason: String },

    #[error("component '{0}' already exists")]
    Duplicate(String),

    #[error("unknown component '{0}'")]
    Unknown(String),
}
