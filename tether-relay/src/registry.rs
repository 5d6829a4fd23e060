//! Connection registry: who is online, and under which groups.
//!
//! Owns every live [`ConnectionHandle`]. Group membership is derived from the
//! handle's [`Identity`] at registration and kept in a reverse index so the
//! router can resolve a group without scanning all connections.

use crate::error::DeliveryError;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_types::{ConnectionId, DeviceId, Frame, Group, Identity, UserId};
use tokio::sync::mpsc;

/// Sending half of one live connection.
///
/// Cheap to clone. Frames are queued on a bounded channel drained by the
/// connection's writer task, which preserves per-connection FIFO order.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Arc<Frame>>,
}

impl ConnectionHandle {
    /// Create a handle and the receiver its writer task should drain.
    pub fn new(identity: Identity, buffer: usize) -> (Self, mpsc::Receiver<Arc<Frame>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Self {
            id: ConnectionId::new(),
            identity,
            tx,
        };
        (handle, rx)
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Verified identity.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Queue a frame without waiting. A full or closed connection fails
    /// immediately so one slow peer never stalls a fan-out.
    pub fn deliver(&self, frame: Arc<Frame>) -> Result<(), DeliveryError> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    groups: DashMap<Group, HashSet<ConnectionId>>,
    slots: AtomicUsize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its identity's groups.
    ///
    /// Re-registering the same id replaces the previous entry; a connection is
    /// never listed twice in a group.
    pub fn register(&self, handle: ConnectionHandle) {
        if self.insert(handle) {
            self.slots.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Register a connection only if fewer than `capacity` are live.
    ///
    /// The slot is reserved before insertion, so concurrent callers can never
    /// push the registry past `capacity`. On refusal the handle is returned.
    pub fn try_register(
        &self,
        handle: ConnectionHandle,
        capacity: usize,
    ) -> Result<(), ConnectionHandle> {
        let reserved = self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < capacity).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            tracing::debug!(connection_id = %handle.id(), capacity, "Registry full");
            return Err(handle);
        }
        if !self.insert(handle) {
            self.slots.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Insert under the identity's groups. True when the id was new.
    fn insert(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id();
        let groups = handle.identity().groups();

        let previous = self.connections.insert(id, handle);
        if let Some(previous) = &previous {
            for group in previous.identity().groups() {
                self.leave(&group, &id);
            }
        }
        for group in &groups {
            self.groups.entry(group.clone()).or_default().insert(id);
        }

        tracing::debug!(
            connection_id = %id,
            groups = ?groups,
            total = self.connections.len(),
            "Registered connection"
        );
        previous.is_none()
    }

    /// Remove a connection from the registry and all of its groups.
    ///
    /// Idempotent: returns `None` if the connection was already gone.
    pub fn unregister(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        let (_, handle) = self.connections.remove(id)?;
        self.slots.fetch_sub(1, Ordering::SeqCst);
        for group in handle.identity().groups() {
            self.leave(&group, id);
        }

        tracing::debug!(
            connection_id = %id,
            remaining = self.connections.len(),
            "Unregistered connection"
        );
        Some(handle)
    }

    fn leave(&self, group: &Group, id: &ConnectionId) {
        if let Some(mut members) = self.groups.get_mut(group) {
            members.remove(id);
        }
        self.groups.remove_if(group, |_, members| members.is_empty());
    }

    /// Look up one connection.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    /// Every live connection in `group`. Empty for unknown groups.
    pub fn list_connections(&self, group: &Group) -> Vec<ConnectionHandle> {
        let ids: Vec<ConnectionId> = match self.groups.get(group) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// First connection in `group` matching `predicate`.
    pub fn find_by_predicate<P>(&self, group: &Group, predicate: P) -> Option<ConnectionHandle>
    where
        P: Fn(&ConnectionHandle) -> bool,
    {
        self.list_connections(group)
            .into_iter()
            .find(|handle| predicate(handle))
    }

    /// A live primary connection for `user_id`.
    ///
    /// With `device_id`, only that device of the user qualifies. Otherwise any
    /// of the user's primaries will do.
    pub fn find_primary(
        &self,
        user_id: &UserId,
        device_id: Option<&DeviceId>,
    ) -> Option<ConnectionHandle> {
        match device_id {
            Some(device_id) => self.find_by_predicate(&Group::device(user_id, device_id), |c| {
                c.identity().is_primary()
            }),
            None => self.find_by_predicate(&Group::user(user_id), |c| c.identity().is_primary()),
        }
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when nobody is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of non-empty groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    fn primary() -> Identity {
        Identity::primary(alice(), DeviceId::new("pixel").unwrap())
    }

    #[test]
    fn register_joins_user_and_device_groups() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx) = ConnectionHandle::new(primary(), 8);
        registry.register(phone.clone());

        let user = registry.list_connections(&Group::user(&alice()));
        let device =
            registry.list_connections(&Group::device(&alice(), &DeviceId::new("pixel").unwrap()));
        assert_eq!(user.len(), 1);
        assert_eq!(device.len(), 1);
        assert_eq!(user[0].id(), phone.id());
        assert!(registry
            .list_connections(&Group::mirrors(&alice()))
            .is_empty());
    }

    #[test]
    fn double_register_lists_once() {
        let registry = ConnectionRegistry::new();
        let (laptop, _rx) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        registry.register(laptop.clone());
        registry.register(laptop.clone());

        assert_eq!(registry.list_connections(&Group::user(&alice())).len(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_removes_from_every_group_and_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx) = ConnectionHandle::new(primary(), 8);
        registry.register(phone.clone());

        assert!(registry.unregister(&phone.id()).is_some());
        assert!(registry.unregister(&phone.id()).is_none());
        for group in phone.identity().groups() {
            assert!(registry.list_connections(&group).is_empty());
        }
        assert_eq!(registry.group_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn unknown_group_is_empty() {
        let registry = ConnectionRegistry::new();
        let group = Group::user(&UserId::new("nobody").unwrap());
        assert!(registry.list_connections(&group).is_empty());
        assert!(registry.find_by_predicate(&group, |_| true).is_none());
    }

    #[test]
    fn find_by_predicate_locates_primary() {
        let registry = ConnectionRegistry::new();
        let (laptop, _rx1) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        let (phone, _rx2) = ConnectionHandle::new(primary(), 8);
        registry.register(laptop);
        registry.register(phone.clone());

        let found = registry
            .find_by_predicate(&Group::user(&alice()), |c| c.identity().is_primary())
            .unwrap();
        assert_eq!(found.id(), phone.id());
    }

    #[test]
    fn find_primary_honors_device_and_owner() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx) = ConnectionHandle::new(primary(), 8);
        registry.register(phone.clone());
        let pixel = DeviceId::new("pixel").unwrap();
        let bob = UserId::new("bob").unwrap();

        assert_eq!(registry.find_primary(&alice(), None).unwrap().id(), phone.id());
        assert_eq!(
            registry.find_primary(&alice(), Some(&pixel)).unwrap().id(),
            phone.id()
        );
        assert!(registry.find_primary(&bob, Some(&pixel)).is_none());
        assert!(registry
            .find_primary(&alice(), Some(&DeviceId::new("tablet").unwrap()))
            .is_none());
    }

    #[test]
    fn shared_device_id_keeps_owners_apart() {
        let registry = ConnectionRegistry::new();
        let bob = UserId::new("bob").unwrap();
        let pixel = DeviceId::new("pixel").unwrap();
        let (alice_phone, _rx1) = ConnectionHandle::new(primary(), 8);
        let (bob_phone, _rx2) = ConnectionHandle::new(Identity::primary(bob.clone(), pixel.clone()), 8);
        registry.register(alice_phone.clone());
        registry.register(bob_phone.clone());

        let alice_group = registry.list_connections(&Group::device(&alice(), &pixel));
        let bob_group = registry.list_connections(&Group::device(&bob, &pixel));
        assert_eq!(alice_group.len(), 1);
        assert_eq!(bob_group.len(), 1);
        assert_eq!(alice_group[0].id(), alice_phone.id());
        assert_eq!(bob_group[0].id(), bob_phone.id());
        assert_eq!(
            registry.find_primary(&bob, Some(&pixel)).unwrap().id(),
            bob_phone.id()
        );
    }

    #[test]
    fn try_register_stops_at_capacity() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        let (second, _rx2) = ConnectionHandle::new(Identity::mirror(alice()), 8);

        assert!(registry.try_register(first.clone(), 1).is_ok());
        let refused = registry.try_register(second.clone(), 1).unwrap_err();
        assert_eq!(refused.id(), second.id());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&second.id()).is_none());

        // A freed slot can be taken again.
        registry.unregister(&first.id());
        assert!(registry.try_register(second, 1).is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_try_register_never_exceeds_capacity() {
        let registry = Arc::new(ConnectionRegistry::new());
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let (handle, rx) = ConnectionHandle::new(Identity::mirror(alice()), 8);
                    (registry.try_register(handle, 4).is_ok(), rx)
                })
            })
            .collect();
        let admitted = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|(ok, _)| *ok)
            .count();

        assert_eq!(admitted, 4);
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn re_register_does_not_take_a_second_slot() {
        let registry = ConnectionRegistry::new();
        let (laptop, _rx) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        assert!(registry.try_register(laptop.clone(), 1).is_ok());
        assert!(registry.try_register(laptop.clone(), 2).is_ok());
        assert_eq!(registry.len(), 1);

        let (other, _rx2) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        assert!(registry.try_register(other, 2).is_ok());
    }

    #[test]
    fn users_are_isolated() {
        let registry = ConnectionRegistry::new();
        let bob = UserId::new("bob").unwrap();
        let (a, _rx1) = ConnectionHandle::new(Identity::mirror(alice()), 8);
        let (b, _rx2) = ConnectionHandle::new(Identity::mirror(bob.clone()), 8);
        registry.register(a);
        registry.register(b);

        assert_eq!(registry.list_connections(&Group::user(&alice())).len(), 1);
        assert_eq!(registry.list_connections(&Group::user(&bob)).len(), 1);
        assert_eq!(registry.group_count(), 4);
    }

    #[test]
    fn deliver_reports_full_and_closed() {
        let (handle, rx) = ConnectionHandle::new(Identity::mirror(alice()), 1);
        let frame = Arc::new(Frame::new("pong", serde_json::Value::Null));
        assert!(handle.deliver(frame.clone()).is_ok());
        assert_eq!(handle.deliver(frame.clone()), Err(DeliveryError::Full));
        drop(rx);
        assert_eq!(handle.deliver(frame), Err(DeliveryError::Closed));
    }
}
