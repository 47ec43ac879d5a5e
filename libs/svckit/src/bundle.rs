use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

pub type BundleId = u64;

/// Id of the framework's own bundle, which owns hooks and internal listeners.
pub const SYSTEM_BUNDLE_ID: BundleId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Installed,
    Resolved,
    Starting,
    Active,
    Stopping,
    Uninstalled,
}

struct BundleInner {
    id: BundleId,
    name: String,
    state: RwLock<BundleState>,
}

/// Identity of a consumer or provider of services. Cheap to clone; equality is by id.
#[derive(Clone)]
pub struct Bundle(Arc<BundleInner>);

impl Bundle {
    pub(crate) fn new(id: BundleId, name: impl Into<String>) -> Self {
        Self(Arc::new(BundleInner {
            id,
            name: name.into(),
            state: RwLock::new(BundleState::Installed),
        }))
    }

    pub fn id(&self) -> BundleId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn state(&self) -> BundleState {
        *self.0.state.read()
    }

    pub fn is_system(&self) -> bool {
        self.0.id == SYSTEM_BUNDLE_ID
    }

    pub(crate) fn set_state(&self, state: BundleState) {
        *self.0.state.write() = state;
    }
}

impl PartialEq for Bundle {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Bundle {}

impl std::hash::Hash for Bundle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish()
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.0.name, self.0.id)
    }
}
