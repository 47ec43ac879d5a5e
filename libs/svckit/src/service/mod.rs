//! Service registration, lookup and scoped service objects.

mod object;
mod registration;
mod registry;

pub use object::{
    InterfaceMap, ServiceFactory, ServiceId, ServiceInterface, ServiceObject, ServiceScope,
    ServiceSource,
};
pub use registration::{ServiceReference, ServiceRegistration};
pub use registry::{RegistryError, ServiceObjects, ServiceRegistry};

