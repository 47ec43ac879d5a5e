//! Service tracker: keeps the set of services matching an interface and filter
//! current, on top of a service listener and an initial lookup.
//!
//! A [`ServiceTrackerCustomizer`] decides what is kept per service. Callbacks run
//! without the tracker's lock held, so a customizer may query the tracker.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::events::{ServiceEvent, ServiceEventKind};
use crate::framework::BundleContext;
use crate::listeners::ListenerToken;
use crate::properties::OBJECTCLASS;
use crate::service::{RegistryError, ServiceId, ServiceObject, ServiceReference};

/// Hooks called as services enter, change within, and leave the tracked set.
pub trait ServiceTrackerCustomizer: Send + Sync + 'static {
    type Tracked: Clone + Send + 'static;

    /// Value to keep for a newly matching service; `None` leaves it untracked.
    fn adding_service(&self, reference: &ServiceReference) -> Option<Self::Tracked>;

    fn modified_service(&self, _reference: &ServiceReference, _tracked: &Self::Tracked) {}

    fn removed_service(&self, _reference: &ServiceReference, _tracked: Self::Tracked) {}
}

/// Tracks the service objects themselves, holding one use of each.
pub struct ObjectCustomizer {
    context: BundleContext,
}

impl ObjectCustomizer {
    pub fn new(context: BundleContext) -> Self {
        Self { context }
    }
}

impl ServiceTrackerCustomizer for ObjectCustomizer {
    type Tracked = ServiceObject;

    fn adding_service(&self, reference: &ServiceReference) -> Option<ServiceObject> {
        self.context.get_service(reference)
    }

    fn removed_service(&self, reference: &ServiceReference, tracked: ServiceObject) {
        self.context.unget_service(reference, Some(&tracked));
    }
}

struct TrackedSet<T> {
    entries: BTreeMap<ServiceId, (ServiceReference, T)>,
    closed: bool,
    count: u64,
}

impl<T: Clone> TrackedSet<T> {
    fn best_first(&self) -> Vec<&(ServiceReference, T)> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by(|a, b| a.0.best_first(&b.0));
        entries
    }

    fn best(&self) -> Option<T> {
        self.best_first().first().map(|(_, t)| t.clone())
    }
}

struct TrackerShared<C: ServiceTrackerCustomizer> {
    customizer: C,
    set: Mutex<TrackedSet<C::Tracked>>,
    changed: Condvar,
}

impl<C: ServiceTrackerCustomizer> TrackerShared<C> {
    fn on_event(&self, event: &ServiceEvent) {
        match event.kind {
            ServiceEventKind::Registered | ServiceEventKind::Modified => self.track(&event.reference),
            ServiceEventKind::ModifiedEndMatch | ServiceEventKind::Unregistering => {
                self.untrack(&event.reference)
            }
        }
    }

    fn track(&self, reference: &ServiceReference) {
        {
            let mut set = self.set.lock();
            if set.closed {
                return;
            }
            if let Some((_, tracked)) = set.entries.get(&reference.id()) {
                let tracked = tracked.clone();
                set.count += 1;
                drop(set);
                self.customizer.modified_service(reference, &tracked);
                return;
            }
        }

        let Some(tracked) = self.customizer.adding_service(reference) else {
            tracing::trace!(service_id = reference.id(), "Customizer declined service");
            return;
        };
        let mut set = self.set.lock();
        // closed, withdrawn or added by another thread in the meantime
        if set.closed || !reference.is_available() || set.entries.contains_key(&reference.id()) {
            drop(set);
            self.customizer.removed_service(reference, tracked);
            return;
        }
        set.entries.insert(reference.id(), (reference.clone(), tracked));
        set.count += 1;
        drop(set);
        self.changed.notify_all();
    }

    fn untrack(&self, reference: &ServiceReference) {
        let removed = {
            let mut set = self.set.lock();
            let removed = set.entries.remove(&reference.id());
            if removed.is_some() {
                set.count += 1;
            }
            removed
        };
        if let Some((reference, tracked)) = removed {
            self.customizer.removed_service(&reference, tracked);
            self.changed.notify_all();
        }
    }
}

/// Tracks services published under `interface` that match `filter`.
///
/// Nothing is tracked until [`open`](Self::open); dropping the tracker closes it.
pub struct ServiceTracker<C: ServiceTrackerCustomizer = ObjectCustomizer> {
    context: BundleContext,
    interface: String,
    filter: String,
    shared: Arc<TrackerShared<C>>,
    token: Mutex<Option<ListenerToken>>,
}

impl ServiceTracker<ObjectCustomizer> {
    /// Tracks service objects. `filter` may be empty.
    pub fn new(context: &BundleContext, interface: &str, filter: &str) -> Self {
        Self::with_customizer(context, interface, filter, ObjectCustomizer::new(context.clone()))
    }
}

impl<C: ServiceTrackerCustomizer> ServiceTracker<C> {
    pub fn with_customizer(context: &BundleContext, interface: &str, filter: &str, customizer: C) -> Self {
        Self {
            context: context.clone(),
            interface: interface.to_owned(),
            filter: filter.trim().to_owned(),
            shared: Arc::new(TrackerShared {
                customizer,
                set: Mutex::new(TrackedSet {
                    entries: BTreeMap::new(),
                    closed: true,
                    count: 0,
                }),
                changed: Condvar::new(),
            }),
            token: Mutex::new(None),
        }
    }

    fn listener_filter(&self) -> String {
        match (self.interface.is_empty(), self.filter.is_empty()) {
            (true, _) => self.filter.clone(),
            (false, true) => format!("({OBJECTCLASS}={})", escape_value(&self.interface)),
            (false, false) => format!("(&({OBJECTCLASS}={}){})", escape_value(&self.interface), self.filter),
        }
    }

    /// Starts tracking: listens for changes, then adds the services already
    /// registered. Opening an open tracker does nothing.
    pub fn open(&self) -> Result<(), RegistryError> {
        {
            let mut token = self.token.lock();
            if token.is_some() {
                return Ok(());
            }
            self.shared.set.lock().closed = false;
            let shared = self.shared.clone();
            let listener = self
                .context
                .add_service_listener(&self.listener_filter(), move |event| shared.on_event(event));
            match listener {
                Ok(listener) => *token = Some(listener),
                Err(err) => {
                    self.shared.set.lock().closed = true;
                    return Err(err);
                }
            }
        }

        match self.context.find_references(&self.interface, &self.filter) {
            Ok(existing) => {
                for reference in existing.iter().filter(|r| self.tracked(r).is_none()) {
                    self.shared.track(reference);
                }
                tracing::debug!(interface = %self.interface, filter = %self.filter, tracked = self.len(), "Service tracker opened");
                Ok(())
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Stops tracking and hands every tracked service to `removed_service`.
    pub fn close(&self) {
        let Some(token) = self.token.lock().take() else {
            return;
        };
        self.context.remove_listener(token);
        let outgoing = {
            let mut set = self.shared.set.lock();
            set.closed = true;
            if !set.entries.is_empty() {
                set.count += 1;
            }
            std::mem::take(&mut set.entries)
        };
        self.shared.changed.notify_all();
        for (reference, tracked) in outgoing.into_values() {
            self.shared.customizer.removed_service(&reference, tracked);
        }
        tracing::debug!(interface = %self.interface, filter = %self.filter, "Service tracker closed");
    }

    /// Tracked references, best first.
    pub fn references(&self) -> Vec<ServiceReference> {
        let set = self.shared.set.lock();
        set.best_first().into_iter().map(|(r, _)| r.clone()).collect()
    }

    /// Value tracked for the best service.
    pub fn service(&self) -> Option<C::Tracked> {
        self.shared.set.lock().best()
    }

    /// Every tracked value, best first.
    pub fn services(&self) -> Vec<C::Tracked> {
        let set = self.shared.set.lock();
        set.best_first().into_iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn tracked(&self, reference: &ServiceReference) -> Option<C::Tracked> {
        self.shared
            .set
            .lock()
            .entries
            .get(&reference.id())
            .map(|(_, t)| t.clone())
    }

    pub fn len(&self) -> usize {
        self.shared.set.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped on every addition, modification and removal.
    pub fn tracking_count(&self) -> u64 {
        self.shared.set.lock().count
    }

    /// Best tracked value, waiting up to `timeout` for one to appear. Returns
    /// `None` at once when the tracker is closed.
    pub fn wait_for_service(&self, timeout: Duration) -> Option<C::Tracked> {
        let deadline = Instant::now() + timeout;
        let mut set = self.shared.set.lock();
        loop {
            if let Some(best) = set.best() {
                return Some(best);
            }
            if set.closed || self.shared.changed.wait_until(&mut set, deadline).timed_out() {
                return set.best();
            }
        }
    }
}

impl<C: ServiceTrackerCustomizer> Drop for ServiceTracker<C> {
    fn drop(&mut self) {
        self.close();
    }
}

fn escape_value(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '(' | ')' | '*' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_filter_metacharacters() {
        assert_eq!(escape_value("test.Plain"), "test.Plain");
        assert_eq!(escape_value("a(b)*c\\"), "a\\(b\\)\\*c\\\\");
    }
}
