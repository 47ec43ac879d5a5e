//! Hook services that observe or narrow the broker's decisions.
//!
//! Hooks are ordinary services registered under the interface names below. They are
//! invoked highest ranking first and, among equal rankings, most recently registered
//! first. A hook can only remove entries from the collections it is handed; a failing
//! hook is reported and skipped, and later hooks still run.

use std::collections::BTreeMap;

use crate::bundle::{Bundle, BundleId};
use crate::events::{BundleEvent, ServiceEvent};
use crate::listeners::ListenerToken;
use crate::service::ServiceReference;

/// Vector view that allows removal only.
pub struct ShrinkableVec<'a, T> {
    items: &'a mut Vec<T>,
}

impl<'a, T> ShrinkableVec<'a, T> {
    pub(crate) fn new(items: &'a mut Vec<T>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.remove(index))
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Snapshot of a service listener handed to hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub token: ListenerToken,
    pub bundle: Bundle,
    pub filter: Option<String>,
    pub removed: bool,
}

/// Receivers of one service event, grouped by the bundle that added them.
pub struct ShrinkableListenerMap<'a> {
    groups: &'a mut BTreeMap<BundleId, Vec<ListenerInfo>>,
}

impl<'a> ShrinkableListenerMap<'a> {
    pub(crate) fn new(groups: &'a mut BTreeMap<BundleId, Vec<ListenerInfo>>) -> Self {
        Self { groups }
    }

    pub fn bundles(&self) -> Vec<BundleId> {
        self.groups.keys().copied().collect()
    }

    pub fn get(&self, bundle: BundleId) -> Option<&[ListenerInfo]> {
        self.groups.get(&bundle).map(Vec::as_slice)
    }

    /// Drops every listener of `bundle`.
    pub fn remove_bundle(&mut self, bundle: BundleId) -> bool {
        self.groups.remove(&bundle).is_some()
    }

    pub fn retain(&mut self, mut f: impl FnMut(&ListenerInfo) -> bool) {
        for infos in self.groups.values_mut() {
            infos.retain(&mut f);
        }
        self.groups.retain(|_, infos| !infos.is_empty());
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Narrows the references a consumer sees from a lookup.
pub trait FindHook: Send + Sync {
    fn find(
        &self,
        consumer: &Bundle,
        interface: &str,
        filter: &str,
        references: &mut ShrinkableVec<'_, ServiceReference>,
    ) -> anyhow::Result<()>;
}

/// Narrows the listeners that receive a service event.
pub trait EventListenerHook: Send + Sync {
    fn event(
        &self,
        event: &ServiceEvent,
        listeners: &mut ShrinkableListenerMap<'_>,
    ) -> anyhow::Result<()>;
}

/// Observes service listener registration.
pub trait ListenerHook: Send + Sync {
    fn added(&self, listeners: &[ListenerInfo]) -> anyhow::Result<()>;
    fn removed(&self, listeners: &[ListenerInfo]) -> anyhow::Result<()>;
}

/// Narrows the bundles whose listeners receive a bundle event.
pub trait BundleEventHook: Send + Sync {
    fn event(
        &self,
        event: &BundleEvent,
        bundles: &mut ShrinkableVec<'_, Bundle>,
    ) -> anyhow::Result<()>;
}

crate::service_interface!(dyn FindHook, "svckit.hooks.FindHook");
crate::service_interface!(dyn EventListenerHook, "svckit.hooks.EventListenerHook");
crate::service_interface!(dyn ListenerHook, "svckit.hooks.ListenerHook");
crate::service_interface!(dyn BundleEventHook, "svckit.hooks.BundleEventHook");

#[cfg(test)]
mod tests {
    use super::*;

    fn info(token: u64, bundle: &Bundle) -> ListenerInfo {
        ListenerInfo {
            token: ListenerToken::from_raw(token),
            bundle: bundle.clone(),
            filter: None,
            removed: false,
        }
    }

    #[test]
    fn shrinkable_vec_only_removes() {
        let mut items = vec![1, 2, 3, 4];
        let mut view = ShrinkableVec::new(&mut items);
        assert_eq!(view.remove(0), Some(1));
        assert_eq!(view.remove(10), None);
        view.retain(|v| v % 2 == 0);
        assert_eq!(view.iter().copied().collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(items, vec![2, 4]);
    }

    #[test]
    fn listener_map_drops_emptied_groups() {
        let a = Bundle::new(1, "a");
        let b = Bundle::new(2, "b");
        let mut groups = BTreeMap::new();
        groups.insert(1, vec![info(1, &a), info(2, &a)]);
        groups.insert(2, vec![info(3, &b)]);

        let mut view = ShrinkableListenerMap::new(&mut groups);
        assert_eq!(view.len(), 3);
        view.retain(|i| i.token != ListenerToken::from_raw(3));
        assert_eq!(view.bundles(), vec![1]);
        assert!(view.remove_bundle(1));
        assert!(view.is_empty());
    }
}
