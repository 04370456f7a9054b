//! Last known value per measurement, and the observers that want to hear about new ones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::clock::Instant;
use crate::registers::MeasurementRequest;

/// A decoded value and the measurement it answers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub request: MeasurementRequest,
    pub value: f64,
    /// Poll cycle that produced this reading, counting from 1.
    pub sequence: u64,
    pub timestamp: Instant,
}

/// Handle returned by [`ObserverRegistry::register`], used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

pub type Callback = Box<dyn FnMut(&Reading) + Send>;

struct Registration {
    id: ObserverId,
    request: MeasurementRequest,
    callback: Arc<Mutex<Callback>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    registrations: Vec<Registration>,
    cache: HashMap<MeasurementRequest, Reading>,
}

/// Value cache plus observer callbacks, keyed by `(kind, phase)`.
///
/// Callbacks run synchronously inside [`publish`](Self::publish), after the registry lock has
/// been released. They may register and unregister observers, but must not publish a reading
/// that would reach themselves.
#[derive(Default)]
pub struct ObserverRegistry {
    inner: Mutex<Inner>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        request: MeasurementRequest,
        callback: impl FnMut(&Reading) + Send + 'static,
    ) -> ObserverId {
        let mut inner = self.lock();
        let id = ObserverId(inner.next_id);
        inner.next_id += 1;
        inner.registrations.push(Registration {
            id,
            request,
            callback: Arc::new(Mutex::new(Box::new(callback))),
        });
        id
    }

    /// Remove an observer. Returns `false` if it was not registered.
    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut inner = self.lock();
        let before = inner.registrations.len();
        inner.registrations.retain(|registration| registration.id != id);
        inner.registrations.len() != before
    }

    /// Store `reading` as the latest value for its measurement and notify, in registration order,
    /// every observer of that exact measurement. Unchanged values are delivered too.
    ///
    /// An observer unregistered by an earlier callback of the same dispatch is not called.
    pub fn publish(&self, reading: Reading) {
        let observers: Vec<(ObserverId, Arc<Mutex<Callback>>)> = {
            let mut inner = self.lock();
            inner.cache.insert(reading.request, reading);
            inner
                .registrations
                .iter()
                .filter(|registration| registration.request == reading.request)
                .map(|registration| (registration.id, registration.callback.clone()))
                .collect()
        };

        for (id, callback) in observers {
            if !self.is_registered(id) {
                continue;
            }
            let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
            (callback)(&reading);
        }
    }

    pub fn latest(&self, request: MeasurementRequest) -> Option<Reading> {
        self.lock().cache.get(&request).copied()
    }

    pub fn observer_count(&self, request: MeasurementRequest) -> usize {
        self.lock()
            .registrations
            .iter()
            .filter(|registration| registration.request == request)
            .count()
    }

    fn is_registered(&self, id: ObserverId) -> bool {
        self.lock()
            .registrations
            .iter()
            .any(|registration| registration.id == id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{MeasurementKind, Phase};

    const VOLTAGE_A: MeasurementRequest =
        MeasurementRequest::new(MeasurementKind::Voltage, Phase::A);
    const VOLTAGE_B: MeasurementRequest =
        MeasurementRequest::new(MeasurementKind::Voltage, Phase::B);

    fn reading(request: MeasurementRequest, value: f64, sequence: u64) -> Reading {
        Reading {
            request,
            value,
            sequence,
            timestamp: Instant::from_ticks(sequence * 1_000),
        }
    }

    type Log = Arc<Mutex<Vec<(&'static str, f64)>>>;

    fn recorder(log: &Log, name: &'static str) -> impl FnMut(&Reading) + Send + 'static {
        let log = log.clone();
        move |reading| log.lock().unwrap().push((name, reading.value))
    }

    #[test]
    fn test_publish_updates_cache() {
        let registry = ObserverRegistry::new();
        assert_eq!(registry.latest(VOLTAGE_A), None);

        registry.publish(reading(VOLTAGE_A, 230.0, 1));
        registry.publish(reading(VOLTAGE_A, 231.5, 2));

        let latest = registry.latest(VOLTAGE_A).unwrap();
        assert_eq!(latest.value, 231.5);
        assert_eq!(latest.sequence, 2);
        assert_eq!(registry.latest(VOLTAGE_B), None);
    }

    #[test]
    fn test_callbacks_in_registration_order_for_exact_key() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(VOLTAGE_A, recorder(&log, "first"));
        registry.register(VOLTAGE_B, recorder(&log, "other phase"));
        registry.register(VOLTAGE_A, recorder(&log, "second"));

        registry.publish(reading(VOLTAGE_A, 230.0, 1));

        assert_eq!(*log.lock().unwrap(), vec![("first", 230.0), ("second", 230.0)]);
    }

    #[test]
    fn test_unchanged_values_are_delivered() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.register(VOLTAGE_A, recorder(&log, "sensor"));

        registry.publish(reading(VOLTAGE_A, 230.0, 1));
        registry.publish(reading(VOLTAGE_A, 230.0, 2));

        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unregister() {
        let registry = ObserverRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = registry.register(VOLTAGE_A, recorder(&log, "first"));
        registry.register(VOLTAGE_A, recorder(&log, "second"));
        assert_eq!(registry.observer_count(VOLTAGE_A), 2);

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert_eq!(registry.observer_count(VOLTAGE_A), 1);

        registry.publish(reading(VOLTAGE_A, 229.0, 1));
        assert_eq!(*log.lock().unwrap(), vec![("second", 229.0)]);
    }

    #[test]
    fn test_observer_can_unregister_itself() {
        let registry = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let own_id = Arc::new(Mutex::new(None));

        let (shared, slot) = (registry.clone(), own_id.clone());
        let mut record = recorder(&log, "once");
        let id = registry.register(VOLTAGE_A, move |reading| {
            record(reading);
            if let Some(id) = *slot.lock().unwrap() {
                shared.unregister(id);
            }
        });
        *own_id.lock().unwrap() = Some(id);
        registry.register(VOLTAGE_A, recorder(&log, "steady"));

        registry.publish(reading(VOLTAGE_A, 230.0, 1));
        registry.publish(reading(VOLTAGE_A, 231.0, 2));

        assert_eq!(
            *log.lock().unwrap(),
            vec![("once", 230.0), ("steady", 230.0), ("steady", 231.0)]
        );
        assert_eq!(registry.observer_count(VOLTAGE_A), 1);
    }

    #[test]
    fn test_observer_removed_mid_dispatch_is_skipped() {
        let registry = Arc::new(ObserverRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let later = Arc::new(Mutex::new(None));

        let (shared, slot) = (registry.clone(), later.clone());
        registry.register(VOLTAGE_A, move |_| {
            if let Some(id) = slot.lock().unwrap().take() {
                shared.unregister(id);
            }
        });
        let id = registry.register(VOLTAGE_A, recorder(&log, "removed"));
        *later.lock().unwrap() = Some(id);

        registry.publish(reading(VOLTAGE_A, 230.0, 1));

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(registry.latest(VOLTAGE_A).unwrap().value, 230.0);
    }

    #[test]
    fn test_survives_panicking_observer() {
        let registry = Arc::new(ObserverRegistry::new());
        registry.register(VOLTAGE_A, |_| panic!("observer bug"));

        let shared = registry.clone();
        let result = std::thread::spawn(move || shared.publish(reading(VOLTAGE_A, 1.0, 1))).join();
        assert!(result.is_err());

        // The observer died mid-dispatch but the registry keeps working.
        assert_eq!(registry.latest(VOLTAGE_A).unwrap().value, 1.0);
        registry.publish(reading(VOLTAGE_B, 2.0, 2));
        assert_eq!(registry.latest(VOLTAGE_B).unwrap().value, 2.0);
    }
}
