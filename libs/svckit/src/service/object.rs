//! Type-erased service objects.
//!
//! A service object is a map from interface name to an `Arc<dyn Trait>` for that
//! interface. Consumers downcast by naming the trait object type, which carries
//! its interface name through [`ServiceInterface`].

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;

use super::registration::ServiceRegistration;
use crate::bundle::Bundle;

pub type ServiceId = u64;

/// Names the interface a (usually unsized) trait object type is published under.
///
/// Implement it for `dyn YourTrait`, or use [`service_interface!`](crate::service_interface).
pub trait ServiceInterface: Send + Sync + 'static {
    const NAME: &'static str;
}

/// Implements [`ServiceInterface`] for a trait object type.
///
/// ```
/// pub trait Greeter: Send + Sync {
///     fn greet(&self) -> String;
/// }
/// svckit::service_interface!(dyn Greeter, "demo.Greeter");
/// ```
#[macro_export]
macro_rules! service_interface {
    ($ty:ty, $name:expr) => {
        impl $crate::service::ServiceInterface for $ty {
            const NAME: &'static str = $name;
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceScope {
    /// One object shared by every consumer.
    #[default]
    Singleton,
    /// One object per consuming bundle, created through the factory.
    Bundle,
    /// A fresh object on every request, created through the factory.
    Prototype,
}

impl ServiceScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceScope::Singleton => "singleton",
            ServiceScope::Bundle => "bundle",
            ServiceScope::Prototype => "prototype",
        }
    }
}

impl std::str::FromStr for ServiceScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "singleton" => Ok(ServiceScope::Singleton),
            "bundle" => Ok(ServiceScope::Bundle),
            "prototype" => Ok(ServiceScope::Prototype),
            other => Err(format!("unknown service scope '{other}'")),
        }
    }
}

impl<'de> serde::Deserialize<'de> for ServiceScope {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Interface name to implementation map.
#[derive(Clone, Default)]
pub struct InterfaceMap {
    entries: BTreeMap<String, Arc<dyn Any + Send + Sync>>,
}

impl InterfaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `service` under `T::NAME`.
    pub fn with<T: ?Sized + ServiceInterface>(mut self, service: Arc<T>) -> Self {
        self.insert(service);
        self
    }

    pub fn insert<T: ?Sized + ServiceInterface>(&mut self, service: Arc<T>) {
        self.entries.insert(T::NAME.to_owned(), Arc::new(service));
    }

    /// Adds an untyped entry; `get_named` returns it unchanged.
    pub fn insert_named(&mut self, name: impl Into<String>, value: Arc<dyn Any + Send + Sync>) {
        self.entries.insert(name.into(), value);
    }

    pub fn get<T: ?Sized + ServiceInterface>(&self) -> Option<Arc<T>> {
        self.entries
            .get(T::NAME)?
            .downcast_ref::<Arc<T>>()
            .cloned()
    }

    pub fn get_named(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for InterfaceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Shared handle to a service object. Identity is pointer identity.
#[derive(Clone)]
pub struct ServiceObject(Arc<InterfaceMap>);

impl ServiceObject {
    pub fn new(map: InterfaceMap) -> Self {
        Self(Arc::new(map))
    }

    /// Convenience for a single-interface object.
    pub fn of<T: ?Sized + ServiceInterface>(service: Arc<T>) -> Self {
        Self::new(InterfaceMap::new().with(service))
    }

    pub fn ptr_eq(&self, other: &ServiceObject) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for ServiceObject {
    type Target = InterfaceMap;

    fn deref(&self) -> &InterfaceMap {
        &self.0
    }
}

impl From<InterfaceMap> for ServiceObject {
    fn from(map: InterfaceMap) -> Self {
        Self::new(map)
    }
}

impl fmt::Debug for ServiceObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceObject").field(&*self.0).finish()
    }
}

/// Produces service objects for bundle- and prototype-scoped registrations,
/// or lazily for a singleton.
pub trait ServiceFactory: Send + Sync {
    fn get_service(
        &self,
        consumer: &Bundle,
        registration: &ServiceRegistration,
    ) -> anyhow::Result<ServiceObject>;

    fn unget_service(
        &self,
        _consumer: &Bundle,
        _registration: &ServiceRegistration,
        _service: ServiceObject,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a registration hands out.
#[derive(Clone)]
pub enum ServiceSource {
    Instance(ServiceObject),
    Factory(Arc<dyn ServiceFactory>),
}

impl From<ServiceObject> for ServiceSource {
    fn from(obj: ServiceObject) -> Self {
        ServiceSource::Instance(obj)
    }
}

impl From<InterfaceMap> for ServiceSource {
    fn from(map: InterfaceMap) -> Self {
        ServiceSource::Instance(ServiceObject::new(map))
    }
}

impl fmt::Debug for ServiceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceSource::Instance(obj) => f.debug_tuple("Instance").field(obj).finish(),
            ServiceSource::Factory(_) => f.write_str("Factory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Greeter: Send + Sync {
        fn greet(&self) -> &'static str;
    }
    crate::service_interface!(dyn Greeter, "test.Greeter");

    trait Counter: Send + Sync {}
    crate::service_interface!(dyn Counter, "test.Counter");

    struct Hello;
    impl Greeter for Hello {
        fn greet(&self) -> &'static str {
            "hello"
        }
    }

    #[test]
    fn typed_lookup_by_interface_name() {
        let greeter: Arc<dyn Greeter> = Arc::new(Hello);
        let obj = ServiceObject::of(greeter);
        assert!(obj.contains("test.Greeter"));
        assert_eq!(obj.get::<dyn Greeter>().map(|g| g.greet()), Some("hello"));
        assert!(obj.get::<dyn Counter>().is_none());
        assert_eq!(obj.interfaces().collect::<Vec<_>>(), vec!["test.Greeter"]);
    }

    #[test]
    fn identity_is_pointer_identity() {
        let a = ServiceObject::new(InterfaceMap::new());
        let b = ServiceObject::new(InterfaceMap::new());
        assert!(a.ptr_eq(&a.clone()));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn scope_parses() {
        assert_eq!("bundle".parse::<ServiceScope>(), Ok(ServiceScope::Bundle));
        assert!("global".parse::<ServiceScope>().is_err());
    }
}
