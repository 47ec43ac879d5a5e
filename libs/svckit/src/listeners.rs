//! Listener tables for service, bundle and framework events.
//!
//! Service listeners whose filter is a plain equality (or a disjunction of
//! equalities) on `objectclass` or `service.id` are indexed by value; every other
//! listener is evaluated on each event. Entries are flagged as removed before they
//! leave the table so an in-flight delivery skips them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bundle::{Bundle, BundleId};
use crate::events::{BundleEvent, FrameworkEvent, ServiceEvent};
use crate::filter::Filter;
use crate::hooks::ListenerInfo;
use crate::properties::{PropertyMap, OBJECTCLASS, SERVICE_ID};

/// Opaque handle identifying one added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerToken(u64);

impl ListenerToken {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener#{}", self.0)
    }
}

pub type ServiceListenerFn = dyn Fn(&ServiceEvent) + Send + Sync;
pub type BundleListenerFn = dyn Fn(&BundleEvent) + Send + Sync;
pub type FrameworkListenerFn = dyn Fn(&FrameworkEvent) + Send + Sync;

const CACHE_KEYWORDS: [&str; 2] = [OBJECTCLASS, SERVICE_ID];

/// Index keys for a simple filter. `service.id` patterns compare numerically,
/// so they are stored in canonical decimal form; a pattern that is not an
/// integer leaves the filter to the linear scan.
fn index_keys(filter: &Filter) -> Option<Vec<Vec<String>>> {
    let mut keys = filter.classify_simple(&CACHE_KEYWORDS, false)?;
    keys[1] = keys[1]
        .iter()
        .map(|v| v.trim().parse::<i128>().ok().map(|id| id.to_string()))
        .collect::<Option<Vec<_>>>()?;
    Some(keys)
}

pub(crate) struct ListenerEntry<F: ?Sized> {
    pub(crate) token: ListenerToken,
    pub(crate) bundle: Bundle,
    pub(crate) callback: Arc<F>,
    pub(crate) discriminator: Option<usize>,
    removed: AtomicBool,
}

impl<F: ?Sized> ListenerEntry<F> {
    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

pub(crate) struct ServiceListenerEntry {
    pub(crate) base: ListenerEntry<ServiceListenerFn>,
    pub(crate) filter: Option<Filter>,
    cache_keys: Option<Vec<Vec<String>>>,
}

impl ServiceListenerEntry {
    pub(crate) fn info(&self) -> ListenerInfo {
        ListenerInfo {
            token: self.base.token,
            bundle: self.base.bundle.clone(),
            filter: self.filter.as_ref().map(ToString::to_string),
            removed: self.base.is_removed(),
        }
    }
}

pub(crate) type BundleListenerEntry = ListenerEntry<BundleListenerFn>;
pub(crate) type FrameworkListenerEntry = ListenerEntry<FrameworkListenerFn>;

#[derive(Default)]
struct ServiceTable {
    entries: BTreeMap<ListenerToken, Arc<ServiceListenerEntry>>,
    index: [HashMap<String, BTreeSet<ListenerToken>>; 2],
    complex: BTreeSet<ListenerToken>,
}

impl ServiceTable {
    fn insert(&mut self, entry: Arc<ServiceListenerEntry>) {
        let token = entry.base.token;
        match &entry.cache_keys {
            Some(keys) => {
                for (slot, values) in keys.iter().enumerate() {
                    for value in values {
                        self.index[slot]
                            .entry(value.clone())
                            .or_default()
                            .insert(token);
                    }
                }
            }
            None => {
                self.complex.insert(token);
            }
        }
        self.entries.insert(token, entry);
    }

    fn remove(&mut self, token: ListenerToken) -> Option<Arc<ServiceListenerEntry>> {
        let entry = self.entries.remove(&token)?;
        entry.base.mark_removed();
        match &entry.cache_keys {
            Some(keys) => {
                for (slot, values) in keys.iter().enumerate() {
                    for value in values {
                        if let Some(set) = self.index[slot].get_mut(value) {
                            set.remove(&token);
                            if set.is_empty() {
                                self.index[slot].remove(value);
                            }
                        }
                    }
                }
            }
            None => {
                self.complex.remove(&token);
            }
        }
        Some(entry)
    }
}

/// All listener tables of one broker.
#[derive(Default)]
pub(crate) struct ListenerTables {
    next_token: AtomicU64,
    service: RwLock<ServiceTable>,
    bundle: RwLock<BTreeMap<ListenerToken, Arc<BundleListenerEntry>>>,
    framework: RwLock<BTreeMap<ListenerToken, Arc<FrameworkListenerEntry>>>,
}

impl ListenerTables {
    fn next_token(&self) -> ListenerToken {
        ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn entry<F: ?Sized>(
        &self,
        bundle: &Bundle,
        callback: Arc<F>,
        discriminator: Option<usize>,
    ) -> ListenerEntry<F> {
        ListenerEntry {
            token: self.next_token(),
            bundle: bundle.clone(),
            callback,
            discriminator,
            removed: AtomicBool::new(false),
        }
    }

    pub(crate) fn add_service(
        &self,
        bundle: &Bundle,
        filter: Option<Filter>,
        callback: Arc<ServiceListenerFn>,
        discriminator: Option<usize>,
    ) -> Arc<ServiceListenerEntry> {
        let cache_keys = filter.as_ref().and_then(index_keys);
        let entry = Arc::new(ServiceListenerEntry {
            base: self.entry(bundle, callback, discriminator),
            filter,
            cache_keys,
        });
        self.service.write().insert(entry.clone());
        entry
    }

    pub(crate) fn add_bundle(
        &self,
        bundle: &Bundle,
        callback: Arc<BundleListenerFn>,
        discriminator: Option<usize>,
    ) -> ListenerToken {
        let entry = Arc::new(self.entry(bundle, callback, discriminator));
        let token = entry.token;
        self.bundle.write().insert(token, entry);
        token
    }

    pub(crate) fn add_framework(
        &self,
        bundle: &Bundle,
        callback: Arc<FrameworkListenerFn>,
        discriminator: Option<usize>,
    ) -> ListenerToken {
        let entry = Arc::new(self.entry(bundle, callback, discriminator));
        let token = entry.token;
        self.framework.write().insert(token, entry);
        token
    }

    /// Removes a listener of any kind. Returns whether it existed, plus the
    /// listener info when it was a service listener.
    pub(crate) fn remove(&self, token: ListenerToken) -> (bool, Option<ListenerInfo>) {
        if let Some(entry) = self.service.write().remove(token) {
            return (true, Some(entry.info()));
        }
        if let Some(entry) = self.bundle.write().remove(&token) {
            entry.mark_removed();
            return (true, None);
        }
        if let Some(entry) = self.framework.write().remove(&token) {
            entry.mark_removed();
            return (true, None);
        }
        (false, None)
    }

    /// Tokens added by `bundle` with the given discriminator, of every kind.
    pub(crate) fn tokens_with_discriminator(
        &self,
        bundle: BundleId,
        discriminator: usize,
    ) -> Vec<ListenerToken> {
        let wanted = |b: &Bundle, d: Option<usize>| b.id() == bundle && d == Some(discriminator);
        let mut tokens: Vec<ListenerToken> = self
            .service
            .read()
            .entries
            .values()
            .filter(|e| wanted(&e.base.bundle, e.base.discriminator))
            .map(|e| e.base.token)
            .collect();
        tokens.extend(
            self.bundle
                .read()
                .values()
                .filter(|e| wanted(&e.bundle, e.discriminator))
                .map(|e| e.token),
        );
        tokens.extend(
            self.framework
                .read()
                .values()
                .filter(|e| wanted(&e.bundle, e.discriminator))
                .map(|e| e.token),
        );
        tokens
    }

    /// Every listener token owned by `bundle`.
    pub(crate) fn tokens_of(&self, bundle: BundleId) -> Vec<ListenerToken> {
        let mut tokens: Vec<ListenerToken> = self
            .service
            .read()
            .entries
            .values()
            .filter(|e| e.base.bundle.id() == bundle)
            .map(|e| e.base.token)
            .collect();
        tokens.extend(
            self.bundle
                .read()
                .values()
                .filter(|e| e.bundle.id() == bundle)
                .map(|e| e.token),
        );
        tokens.extend(
            self.framework
                .read()
                .values()
                .filter(|e| e.bundle.id() == bundle)
                .map(|e| e.token),
        );
        tokens
    }

    /// Service listeners whose filter matches `props`, in token order.
    pub(crate) fn service_receivers(&self, props: &PropertyMap) -> Vec<Arc<ServiceListenerEntry>> {
        let table = self.service.read();
        let mut tokens: BTreeSet<ListenerToken> = BTreeSet::new();

        let mut hit = |slot: usize, value: &str| {
            if let Some(set) = table.index[slot].get(value) {
                tokens.extend(set.iter().copied());
            }
        };
        if let Some(classes) = props.get(OBJECTCLASS) {
            for class in classes.string_list() {
                hit(0, &class);
            }
        }
        if let Some(id) = props.get(SERVICE_ID) {
            hit(1, &id.to_string());
        }

        for token in &table.complex {
            if let Some(entry) = table.entries.get(token) {
                if entry.filter.as_ref().map_or(true, |f| f.matches(props)) {
                    tokens.insert(*token);
                }
            }
        }

        tokens
            .into_iter()
            .filter_map(|t| table.entries.get(&t).cloned())
            .collect()
    }

    pub(crate) fn service_infos(&self) -> Vec<ListenerInfo> {
        self.service
            .read()
            .entries
            .values()
            .map(|e| e.info())
            .collect()
    }

    pub(crate) fn bundle_receivers(&self) -> Vec<Arc<BundleListenerEntry>> {
        self.bundle.read().values().cloned().collect()
    }

    pub(crate) fn framework_receivers(&self) -> Vec<Arc<FrameworkListenerEntry>> {
        self.framework.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;

    fn noop() -> Arc<ServiceListenerFn> {
        Arc::new(|_: &ServiceEvent| {})
    }

    fn props(class: &str, id: i64) -> PropertyMap {
        PropertyMap::new()
            .with(OBJECTCLASS, PropertyValue::from(vec![class]))
            .with(SERVICE_ID, id)
            .with("color", "red")
    }

    fn tokens(entries: &[Arc<ServiceListenerEntry>]) -> Vec<ListenerToken> {
        entries.iter().map(|e| e.base.token).collect()
    }

    #[test]
    fn simple_filters_go_to_the_index() {
        let tables = ListenerTables::default();
        let bundle = Bundle::new(1, "b");
        let by_class = tables.add_service(
            &bundle,
            Some(Filter::parse("(objectclass=a.Printer)").unwrap()),
            noop(),
            None,
        );
        let by_id = tables.add_service(
            &bundle,
            Some(Filter::parse("(service.id=7)").unwrap()),
            noop(),
            None,
        );
        let complex = tables.add_service(
            &bundle,
            Some(Filter::parse("(color=red)").unwrap()),
            noop(),
            None,
        );
        let all = tables.add_service(&bundle, None, noop(), None);

        {
            let table = tables.service.read();
            assert_eq!(table.complex.len(), 2);
            assert!(table.index[0].contains_key("a.Printer"));
            assert!(table.index[1].contains_key("7"));
        }

        let got = tables.service_receivers(&props("a.Printer", 7));
        assert_eq!(
            tokens(&got),
            vec![by_class.base.token, by_id.base.token, complex.base.token, all.base.token]
        );

        let got = tables.service_receivers(&props("b.Scanner", 8));
        assert_eq!(tokens(&got), vec![complex.base.token, all.base.token]);
    }

    #[test]
    fn service_id_keys_are_indexed_numerically() {
        let tables = ListenerTables::default();
        let bundle = Bundle::new(1, "b");
        let padded = tables.add_service(
            &bundle,
            Some(Filter::parse("(|(service.id=01)(service.id= 2))").unwrap()),
            noop(),
            None,
        );
        let junk = tables.add_service(
            &bundle,
            Some(Filter::parse("(service.id=one)").unwrap()),
            noop(),
            None,
        );

        {
            let table = tables.service.read();
            assert!(table.index[1].contains_key("1"));
            assert!(table.index[1].contains_key("2"));
            assert_eq!(table.complex.len(), 1);
        }

        assert_eq!(tokens(&tables.service_receivers(&props("x", 1))), vec![padded.base.token]);
        assert_eq!(tokens(&tables.service_receivers(&props("x", 2))), vec![padded.base.token]);
        assert!(tables.service_receivers(&props("x", 3)).is_empty());
        assert!(!junk.filter.as_ref().unwrap().matches(&props("x", 1)));
    }

    #[test]
    fn removal_flags_and_unindexes() {
        let tables = ListenerTables::default();
        let bundle = Bundle::new(1, "b");
        let entry = tables.add_service(
            &bundle,
            Some(Filter::parse("(objectclass=a)").unwrap()),
            noop(),
            Some(42),
        );
        let token = entry.base.token;

        assert_eq!(tables.tokens_with_discriminator(1, 42), vec![token]);
        let (existed, info) = tables.remove(token);
        assert!(existed);
        assert!(info.is_some_and(|i| i.removed));
        assert!(entry.base.is_removed());
        assert!(tables.service.read().index[0].is_empty());
        assert_eq!(tables.remove(token), (false, None));
    }

    #[test]
    fn tokens_of_collects_every_kind() {
        let tables = ListenerTables::default();
        let a = Bundle::new(1, "a");
        let b = Bundle::new(2, "b");
        tables.add_service(&a, None, noop(), None);
        tables.add_bundle(&a, Arc::new(|_: &BundleEvent| {}), None);
        tables.add_framework(&b, Arc::new(|_: &FrameworkEvent| {}), None);

        assert_eq!(tables.tokens_of(1).len(), 2);
        assert_eq!(tables.tokens_of(2).len(), 1);
    }
}
