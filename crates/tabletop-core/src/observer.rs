//! Thread-safe collection of listener handles.
//!
//! Notification iterates over a snapshot taken when firing starts, so a
//! listener that subscribes or unsubscribes (itself or anyone else) while it
//! is being notified cannot disturb delivery to the remaining listeners.

use std::sync::{Arc, RwLock};

/// A list of shared listener handles of type `T` (usually `dyn SomeListener`).
pub struct ObserverList<T: ?Sized> {
    observers: RwLock<Vec<Arc<T>>>,
}

impl<T: ?Sized> ObserverList<T> {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes `observer`.  The same handle may be added more than once.
    pub fn add(&self, observer: Arc<T>) {
        let mut guard = self.observers.write().unwrap_or_else(|e| e.into_inner());
        guard.push(observer);
    }

    /// Unsubscribes the first occurrence of this exact handle.
    ///
    /// Returns `true` when a handle was removed.
    pub fn remove(&self, observer: &Arc<T>) -> bool {
        let mut guard = self.observers.write().unwrap_or_else(|e| e.into_inner());
        match guard.iter().position(|o| same_instance(o, observer)) {
            Some(index) => {
                guard.remove(index);
                true
            }
            None => false,
        }
    }

    /// Returns a copy of the current handles.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Calls `notify` on every handle present when this call started.
    pub fn for_each(&self, mut notify: impl FnMut(&T)) {
        for observer in self.snapshot() {
            notify(&observer);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: ?Sized> Default for ObserverList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compares two handles by the address of the value they point to.
///
/// `Arc::ptr_eq` on trait objects also compares vtable pointers, which are
/// not guaranteed unique, so only the data address is compared.
pub fn same_instance<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    trait Listener: Send + Sync {
        fn fired(&self);
    }

    struct Counter(AtomicUsize);

    impl Listener for Counter {
        fn fired(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_for_each_notifies_every_listener() {
        // Arrange
        let list: ObserverList<dyn Listener> = ObserverList::new();
        let a = Arc::new(Counter(AtomicUsize::new(0)));
        let b = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(a.clone());
        list.add(b.clone());

        // Act
        list.for_each(|l| l.fired());

        // Assert
        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_uses_instance_identity() {
        let list: ObserverList<dyn Listener> = ObserverList::new();
        let a: Arc<dyn Listener> = Arc::new(Counter(AtomicUsize::new(0)));
        let b: Arc<dyn Listener> = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(a.clone());

        assert!(!list.remove(&b));
        assert!(list.remove(&a));
        assert!(list.is_empty());
    }

    struct SelfRemoving {
        list: Mutex<Option<Arc<ObserverList<dyn Listener>>>>,
        me: Mutex<Option<Arc<dyn Listener>>>,
        hits: AtomicUsize,
    }

    impl Listener for SelfRemoving {
        fn fired(&self) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            let list = self.list.lock().unwrap().clone();
            let me = self.me.lock().unwrap().clone();
            if let (Some(list), Some(me)) = (list, me) {
                list.remove(&me);
            }
        }
    }

    #[test]
    fn test_listener_removing_itself_does_not_skip_others() {
        // Arrange
        let list: Arc<ObserverList<dyn Listener>> = Arc::new(ObserverList::new());
        let leaving = Arc::new(SelfRemoving {
            list: Mutex::new(Some(list.clone())),
            me: Mutex::new(None),
            hits: AtomicUsize::new(0),
        });
        let leaving_dyn: Arc<dyn Listener> = leaving.clone();
        *leaving.me.lock().unwrap() = Some(leaving_dyn.clone());
        let staying = Arc::new(Counter(AtomicUsize::new(0)));
        list.add(leaving_dyn);
        list.add(staying.clone());

        // Act
        list.for_each(|l| l.fired());
        list.for_each(|l| l.fired());

        // Assert: the leaver saw the first round only, the other listener both.
        assert_eq!(leaving.hits.load(Ordering::SeqCst), 1);
        assert_eq!(staying.0.load(Ordering::SeqCst), 2);
        assert_eq!(list.len(), 1);
    }
}
