use std::sync::Arc;

use super::context::ComponentContext;
use crate::service::{ServiceInterface, ServiceObject, ServiceReference};

/// A service bound to one of a component's references.
#[derive(Clone, Debug)]
pub struct BoundService {
    pub reference: ServiceReference,
    pub object: ServiceObject,
}

impl BoundService {
    pub fn get<T: ?Sized + ServiceInterface>(&self) -> Option<Arc<T>> {
        self.object.get::<T>()
    }
}

/// Builds component instances. References bound before creation are visible
/// through [`ComponentContext::locate_service`].
pub trait ComponentFactory: Send + Sync {
    fn create(&self, ctx: &ComponentContext) -> anyhow::Result<Arc<dyn ComponentInstance>>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&ComponentContext) -> anyhow::Result<Arc<dyn ComponentInstance>> + Send + Sync,
{
    fn create(&self, ctx: &ComponentContext) -> anyhow::Result<Arc<dyn ComponentInstance>> {
        self(ctx)
    }
}

/// Lifecycle callbacks of a component instance. Every method has a no-op default.
pub trait ComponentInstance: Send + Sync {
    fn activate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Applies changed configuration properties in place. Returning `Ok(false)`
    /// asks the runtime to deactivate and reactivate the component instead.
    fn modified(&self, _ctx: &ComponentContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn deactivate(&self, _ctx: &ComponentContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn bind(&self, _reference: &str, _service: &BoundService) -> anyhow::Result<()> {
        Ok(())
    }

    fn unbind(&self, _reference: &str, _service: &BoundService) -> anyhow::Result<()> {
        Ok(())
    }

    /// The object published for the component's declared interfaces.
    fn service(&self) -> Option<ServiceObject> {
        None
    }
}
