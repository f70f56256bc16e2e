//! ConnectionRegistry: the set of admitted, broadcast-eligible connections.
//!
//! # Concurrency
//!
//! Every operation takes one mutex around a `HashMap`.  Reaping checks
//! liveness and removes dead entries under that same lock, so a concurrent
//! `add` or `remove` can never interleave with it.  Broadcasts copy the
//! `Arc` handles out under the lock and send after releasing it, so a slow
//! peer never holds up new accepts.
//!
//! # Identity-based removal
//!
//! [`ConnectionRegistry::remove`] only removes an entry when the registered
//! handle is the *same instance* that is being removed.  A late cleanup for
//! a connection that already left can therefore never evict a newer
//! connection that reuses its id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tabletop_core::observer::same_instance;
use tabletop_core::protocol::Channel;
use tracing::{debug, warn};

use super::connection::Connection;

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<dyn Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers `connection` under its id.
    ///
    /// Returns `false` and leaves the registry untouched when the id is
    /// already taken; the existing entry wins.
    pub fn add(&self, connection: Arc<dyn Connection>) -> bool {
        let mut map = self.lock();
        let id = connection.id().to_string();
        if map.contains_key(&id) {
            warn!("rejecting duplicate connection id {id}");
            return false;
        }
        debug!("registered connection {id}");
        map.insert(id, connection);
        true
    }

    /// Removes `connection` if this exact instance is registered under its id.
    pub fn remove(&self, connection: &Arc<dyn Connection>) -> bool {
        let mut map = self.lock();
        match map.get(connection.id()) {
            Some(current) if same_instance(current, connection) => {
                map.remove(connection.id());
                debug!("unregistered connection {}", connection.id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Connection>> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sends `payload` to every registered connection whose id is not in `exclude`.
    ///
    /// A failure on one connection is logged and does not stop delivery to
    /// the others.  Returns the number of successful sends.
    pub fn broadcast(&self, channel: Channel, payload: &[u8], exclude: &[&str]) -> usize {
        let targets: Vec<Arc<dyn Connection>> = self
            .lock()
            .values()
            .filter(|c| !exclude.contains(&c.id()))
            .cloned()
            .collect();

        let mut delivered = 0;
        for connection in targets {
            match connection.send(channel, payload) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("broadcast to {} failed: {e}", connection.id()),
            }
        }
        delivered
    }

    /// Sends `payload` to one connection.
    ///
    /// Unknown ids are ignored: the peer may have left a moment ago.
    /// Returns `true` when the payload was queued.
    pub fn send(&self, id: &str, channel: Channel, payload: &[u8]) -> bool {
        let Some(connection) = self.get(id) else {
            debug!("dropping message for departed connection {id}");
            return false;
        };
        match connection.send(channel, payload) {
            Ok(()) => true,
            Err(e) => {
                warn!("send to {id} failed: {e}");
                false
            }
        }
    }

    /// Empties the registry and returns everything that was in it.
    pub fn drain_all(&self) -> Vec<Arc<dyn Connection>> {
        self.lock().drain().map(|(_, c)| c).collect()
    }

    /// Removes and returns every connection whose liveness probe reports dead.
    pub fn reap(&self) -> Vec<Arc<dyn Connection>> {
        let mut map = self.lock();
        let dead: Vec<String> = map
            .iter()
            .filter(|(_, c)| !c.is_alive())
            .map(|(id, _)| id.clone())
            .collect();
        dead.iter().filter_map(|id| map.remove(id)).collect()
    }
}


// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::FakeConnection;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::thread;

    fn conn(id: &str) -> Arc<FakeConnection> {
        Arc::new(FakeConnection::new(id))
    }

    #[test]
    fn test_add_then_get_returns_same_instance() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let a: Arc<dyn Connection> = conn("10.0.0.1-0");

        // Act
        assert!(registry.add(a.clone()));

        // Assert
        let found = registry.get("10.0.0.1-0").expect("registered");
        assert!(same_instance(&found, &a));
        assert!(registry.get("10.0.0.1-1").is_none());
    }

    #[test]
    fn test_add_duplicate_id_keeps_original() {
        let registry = ConnectionRegistry::new();
        let original: Arc<dyn Connection> = conn("dup");
        let impostor: Arc<dyn Connection> = conn("dup");

        assert!(registry.add(original.clone()));
        assert!(!registry.add(impostor));

        assert!(same_instance(&registry.get("dup").unwrap(), &original));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_stale_instance_keeps_newer_connection() {
        // Arrange: the old connection left, a new one reused its id.
        let registry = ConnectionRegistry::new();
        let old: Arc<dyn Connection> = conn("alice");
        let new: Arc<dyn Connection> = conn("alice");
        registry.add(old.clone());
        assert!(registry.remove(&old));
        registry.add(new.clone());

        // Act: a late cleanup for the old instance runs.
        let removed = registry.remove(&old);

        // Assert
        assert!(!removed);
        assert!(same_instance(&registry.get("alice").unwrap(), &new));
    }

    #[test]
    fn test_broadcast_skips_excluded_and_survives_failures() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let a = conn("a");
        let b = conn("b");
        let c = conn("c");
        b.fail_sends.store(true, Ordering::SeqCst);
        for x in [&a, &b, &c] {
            registry.add(x.clone());
        }

        // Act
        let delivered = registry.broadcast(Channel::Default, b"hello", &["c"]);

        // Assert
        assert_eq!(delivered, 1);
        assert_eq!(a.sent_payloads(), vec![b"hello".to_vec()]);
        assert!(b.sent_payloads().is_empty());
        assert!(c.sent_payloads().is_empty());
    }

    #[test]
    fn test_send_to_unknown_id_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send("ghost", Channel::Default, b"x"));
    }

    #[test]
    fn test_send_uses_requested_channel() {
        let registry = ConnectionRegistry::new();
        let a = conn("a");
        registry.add(a.clone());

        assert!(registry.send("a", Channel::Image, b"chunk"));

        assert_eq!(a.sent.lock().unwrap()[0].0, Channel::Image);
    }

    #[test]
    fn test_reap_removes_exactly_the_dead() {
        // Arrange
        let registry = ConnectionRegistry::new();
        let live = conn("live");
        let dead1 = conn("dead1");
        let dead2 = conn("dead2");
        for x in [&live, &dead1, &dead2] {
            registry.add(x.clone());
        }
        dead1.alive.store(false, Ordering::SeqCst);
        dead2.alive.store(false, Ordering::SeqCst);

        // Act
        let mut reaped: Vec<String> = registry.reap().iter().map(|c| c.id().to_string()).collect();
        reaped.sort();

        // Assert
        assert_eq!(reaped, vec!["dead1".to_string(), "dead2".to_string()]);
        assert_eq!(registry.ids(), vec!["live".to_string()]);
        assert!(registry.reap().is_empty());
    }

    #[test]
    fn test_drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        registry.add(conn("a"));
        registry.add(conn("b"));

        let drained = registry.drain_all();

        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_adds_and_removes_stay_consistent() {
        // Arrange
        let registry = Arc::new(ConnectionRegistry::new());

        // Act: each thread adds 50 connections and removes every other one.
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let r = Arc::clone(&registry);
                thread::spawn(move || {
                    for i in 0..50 {
                        let c: Arc<dyn Connection> = Arc::new(FakeConnection::new(&format!("{t}-{i}")));
                        r.add(c.clone());
                        if i % 2 == 0 {
                            r.remove(&c);
                        }
                        r.reap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Assert
        assert_eq!(registry.len(), 4 * 25);
    }
}
