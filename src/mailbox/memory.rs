//! In-process reference implementation of the mailbox contract.
//!
//! A production deployment replaces this with a hosted keyed store; the
//! semantics here (last-write-wins values, key-ordered children, epoch-
//! scoped deferred writes) are the contract the rest of the crate is
//! written against.

use super::{
    ChildAddedCallback, ConnectionCallback, DeferredValue, Mailbox, MailboxError, MailboxPath,
    Subscription, ValueCallback,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use rand::Rng;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub struct MemoryMailbox {
    shared: Arc<Shared>,
}

struct Shared {
    tree: Mutex<Value>,
    /// Serializes observer delivery so subscribers see one consistent
    /// last-write-wins sequence per path.
    dispatch: Mutex<()>,
    watchers: DashMap<u64, Watcher>,
    conn_watchers: DashMap<u64, ConnectionCallback>,
    next_watcher_id: AtomicU64,
    next_child_seq: AtomicU64,
    connected: AtomicBool,
    epoch: AtomicU64,
    deferred: Mutex<Vec<DeferredWrite>>,
}

struct Watcher {
    path: MailboxPath,
    kind: WatchKind,
}

enum WatchKind {
    Value(ValueCallback),
    ChildAdded {
        cb: ChildAddedCallback,
        seen: Mutex<HashSet<String>>,
    },
}

struct DeferredWrite {
    epoch: u64,
    path: MailboxPath,
    value: DeferredValue,
}

enum Delivery {
    Value(ValueCallback, Option<Value>),
    Children(ChildAddedCallback, Vec<(String, Value)>),
}

impl Delivery {
    fn fire(self) {
        match self {
            Delivery::Value(cb, value) => cb(value),
            Delivery::Children(cb, children) => {
                for (key, value) in children {
                    cb(&key, value);
                }
            }
        }
    }
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Value::Object(Map::new())),
                dispatch: Mutex::new(()),
                watchers: DashMap::new(),
                conn_watchers: DashMap::new(),
                next_watcher_id: AtomicU64::new(1),
                next_child_seq: AtomicU64::new(1),
                connected: AtomicBool::new(true),
                epoch: AtomicU64::new(1),
                deferred: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Simulate the link going up or down. On disconnect, deferred writes
    /// registered in the current epoch fire (the store's dead-man switch);
    /// registrations from earlier epochs are discarded. On reconnect the
    /// epoch advances, so anything registered before the drop stays dead.
    pub fn set_connected(&self, up: bool) {
        let was = self.shared.connected.swap(up, Ordering::SeqCst);
        if was == up {
            return;
        }
        if up {
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            self.shared.notify_connection(true);
        } else {
            let epoch = self.shared.epoch.load(Ordering::SeqCst);
            let due: Vec<DeferredWrite> = {
                let mut deferred = self
                    .shared
                    .deferred
                    .lock()
                    .expect("lock should not be poisoned");
                std::mem::take(&mut *deferred)
                    .into_iter()
                    .filter(|w| w.epoch == epoch)
                    .collect()
            };
            for write in due {
                let value = match write.value {
                    DeferredValue::Value(v) => v,
                    DeferredValue::ServerTimestamp => Value::from(self.now_ms()),
                };
                debug!(target: "Mailbox", "deferred write firing at {}", write.path);
                self.shared
                    .apply_and_notify(&write.path, |tree| set_at(tree, write.path.segments(), value));
            }
            self.shared.notify_connection(false);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<(), MailboxError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MailboxError::Unreachable)
        }
    }
}

impl Shared {
    /// Mutate the tree and deliver to every observer whose path overlaps
    /// the written path. Payloads are computed under the tree lock;
    /// callbacks run after it is released, serialized by the dispatch
    /// lock. Callbacks must not call back into the mailbox.
    fn apply_and_notify(self: &Arc<Self>, path: &MailboxPath, apply: impl FnOnce(&mut Value)) {
        let _order = self.dispatch.lock().expect("lock should not be poisoned");
        let mut batch: Vec<Delivery> = Vec::new();
        {
            let mut tree = self.tree.lock().expect("lock should not be poisoned");
            apply(&mut tree);
            for watcher in self.watchers.iter() {
                if watcher.path.contains(path) || path.contains(&watcher.path) {
                    if let Some(delivery) = watcher.collect(&tree) {
                        batch.push(delivery);
                    }
                }
            }
        }
        for delivery in batch {
            delivery.fire();
        }
    }

    fn notify_connection(self: &Arc<Self>, up: bool) {
        let _order = self.dispatch.lock().expect("lock should not be poisoned");
        let callbacks: Vec<ConnectionCallback> =
            self.conn_watchers.iter().map(|cb| cb.clone()).collect();
        for cb in callbacks {
            cb(up);
        }
    }

    fn register(self: &Arc<Self>, watcher: Watcher) -> (u64, Subscription) {
        let id = self.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(id, watcher);
        let shared = Arc::clone(self);
        (id, Subscription::new(move || {
            shared.watchers.remove(&id);
        }))
    }
}

impl Watcher {
    /// Compute what this watcher should see right now, if anything.
    fn collect(&self, tree: &Value) -> Option<Delivery> {
        let current = get_at(tree, self.path.segments());
        match &self.kind {
            WatchKind::Value(cb) => Some(Delivery::Value(cb.clone(), current.cloned())),
            WatchKind::ChildAdded { cb, seen } => {
                let children: Vec<(String, Value)> = current
                    .and_then(Value::as_object)
                    .map(|map| {
                        map.iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                let mut seen = seen.lock().expect("lock should not be poisoned");
                let added: Vec<(String, Value)> = children
                    .iter()
                    .filter(|(k, _)| !seen.contains(k))
                    .cloned()
                    .collect();
                // A key removed and later re-added fires again.
                *seen = children.iter().map(|(k, _)| k.clone()).collect();
                if added.is_empty() {
                    None
                } else {
                    Some(Delivery::Children(cb.clone(), added))
                }
            }
        }
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn publish(&self, path: &MailboxPath, value: Value) -> Result<(), MailboxError> {
        self.ensure_connected()?;
        if path.is_root() && !value.is_object() {
            return Err(MailboxError::InvalidPath(
                "root value must be a keyed map".into(),
            ));
        }
        self.shared
            .apply_and_notify(path, |tree| set_at(tree, path.segments(), value));
        Ok(())
    }

    async fn read_once(&self, path: &MailboxPath) -> Result<Option<Value>, MailboxError> {
        self.ensure_connected()?;
        let tree = self
            .shared
            .tree
            .lock()
            .expect("lock should not be poisoned");
        Ok(get_at(&tree, path.segments()).cloned())
    }

    async fn remove(&self, path: &MailboxPath) -> Result<(), MailboxError> {
        self.ensure_connected()?;
        self.shared.apply_and_notify(path, |tree| {
            remove_at(tree, path.segments());
        });
        Ok(())
    }

    async fn allocate_child_id(&self, _path: &MailboxPath) -> Result<String, MailboxError> {
        self.ensure_connected()?;
        let ms = self.now_ms().max(0) as u64;
        let seq = self.shared.next_child_seq.fetch_add(1, Ordering::SeqCst);
        let salt: u16 = rand::rng().random();
        // Fixed-width hex so lexicographic order is allocation order.
        Ok(format!("{ms:012x}{:06x}{salt:04x}", seq & 0x00ff_ffff))
    }

    fn subscribe(
        &self,
        path: &MailboxPath,
        cb: ValueCallback,
    ) -> Result<Subscription, MailboxError> {
        self.ensure_connected()?;
        let (id, subscription) = self.shared.register(Watcher {
            path: path.clone(),
            kind: WatchKind::Value(cb),
        });
        self.deliver_initial(id);
        Ok(subscription)
    }

    fn subscribe_child_added(
        &self,
        path: &MailboxPath,
        cb: ChildAddedCallback,
    ) -> Result<Subscription, MailboxError> {
        self.ensure_connected()?;
        let (id, subscription) = self.shared.register(Watcher {
            path: path.clone(),
            kind: WatchKind::ChildAdded {
                cb,
                seen: Mutex::new(HashSet::new()),
            },
        });
        self.deliver_initial(id);
        Ok(subscription)
    }

    fn subscribe_connection(&self, cb: ConnectionCallback) -> Subscription {
        let id = self.shared.next_watcher_id.fetch_add(1, Ordering::SeqCst);
        self.shared.conn_watchers.insert(id, cb.clone());
        let up = self.is_connected();
        {
            let _order = self
                .shared
                .dispatch
                .lock()
                .expect("lock should not be poisoned");
            cb(up);
        }
        let shared = Arc::clone(&self.shared);
        Subscription::new(move || {
            shared.conn_watchers.remove(&id);
        })
    }

    async fn on_disconnect_set(
        &self,
        path: &MailboxPath,
        value: DeferredValue,
    ) -> Result<(), MailboxError> {
        self.ensure_connected()?;
        let epoch = self.shared.epoch.load(Ordering::SeqCst);
        self.shared
            .deferred
            .lock()
            .expect("lock should not be poisoned")
            .push(DeferredWrite {
                epoch,
                path: path.clone(),
                value,
            });
        Ok(())
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

impl MemoryMailbox {
    /// Synchronous initial delivery for a fresh subscription.
    fn deliver_initial(&self, watcher_id: u64) {
        let _order = self
            .shared
            .dispatch
            .lock()
            .expect("lock should not be poisoned");
        let delivery = {
            let tree = self
                .shared
                .tree
                .lock()
                .expect("lock should not be poisoned");
            self.shared
                .watchers
                .get(&watcher_id)
                .and_then(|w| w.collect(&tree))
        };
        if let Some(delivery) = delivery {
            delivery.fire();
        }
    }
}

fn get_at<'a>(node: &'a Value, segments: &[String]) -> Option<&'a Value> {
    let mut current = node;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_at(node: &mut Value, segments: &[String], value: Value) {
    match segments.split_first() {
        None => *node = value,
        Some((head, rest)) => {
            if !node.is_object() {
                *node = Value::Object(Map::new());
            }
            if let Value::Object(map) = node {
                set_at(
                    map.entry(head.clone()).or_insert(Value::Null),
                    rest,
                    value,
                );
            }
        }
    }
}

/// Delete the subtree at `segments`. Empty parent maps are pruned so an
/// emptied inbox reads as absent, not as `{}`.
fn remove_at(node: &mut Value, segments: &[String]) -> bool {
    match segments.split_first() {
        None => {
            *node = Value::Object(Map::new());
            true
        }
        Some((head, rest)) => {
            let Some(map) = node.as_object_mut() else {
                return false;
            };
            if rest.is_empty() {
                return map.remove(head).is_some();
            }
            let Some(child) = map.get_mut(head) else {
                return false;
            };
            let changed = remove_at(child, rest);
            if changed && child.as_object().is_some_and(Map::is_empty) {
                map.remove(head);
            }
            changed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value_log() -> (ValueCallback, Arc<Mutex<Vec<Option<Value>>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let cb: ValueCallback = Arc::new(move |v| sink.lock().unwrap().push(v));
        (cb, log)
    }

    fn child_log() -> (ChildAddedCallback, Arc<Mutex<Vec<(String, Value)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let cb: ChildAddedCallback =
            Arc::new(move |k, v| sink.lock().unwrap().push((k.to_string(), v)));
        (cb, log)
    }

    #[tokio::test]
    async fn test_publish_read_remove_subtree() {
        let mb = MemoryMailbox::new();
        let entry = MailboxPath::new(["inbox", "bob", "s1"]);
        mb.publish(&entry, json!({"kind": "video"})).await.unwrap();
        mb.publish(&entry.child("answer"), json!({"sdp": "x"}))
            .await
            .unwrap();

        let read = mb.read_once(&entry).await.unwrap().unwrap();
        assert_eq!(read["kind"], "video");
        assert_eq!(read["answer"]["sdp"], "x");

        mb.remove(&entry).await.unwrap();
        assert!(mb.read_once(&entry).await.unwrap().is_none());
        // Parent pruned: the inbox reads absent, not `{}`.
        assert!(
            mb.read_once(&MailboxPath::new(["inbox", "bob"]))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_subscribe_sees_current_then_changes_then_removal() {
        let mb = MemoryMailbox::new();
        let path = MailboxPath::new(["presence", "alice"]);
        mb.publish(&path, json!("online")).await.unwrap();

        let (cb, log) = value_log();
        let sub = mb.subscribe(&path, cb).unwrap();
        mb.publish(&path, json!(42)).await.unwrap();
        mb.remove(&path).await.unwrap();
        sub.unsubscribe();
        mb.publish(&path, json!("online")).await.unwrap();

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec![Some(json!("online")), Some(json!(42)), None]);
    }

    #[tokio::test]
    async fn test_parent_subscription_fires_on_child_write() {
        let mb = MemoryMailbox::new();
        let entry = MailboxPath::new(["inbox", "bob", "s1"]);
        mb.publish(&entry, json!({"kind": "voice"})).await.unwrap();

        let (cb, log) = value_log();
        let _sub = mb.subscribe(&MailboxPath::new(["inbox", "bob"]), cb).unwrap();
        mb.publish(&entry.child("answer"), json!({"sdp": "a"}))
            .await
            .unwrap();

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].as_ref().unwrap()["s1"]["answer"]["sdp"], "a");
    }

    #[tokio::test]
    async fn test_child_added_replays_existing_in_key_order_then_additions() {
        let mb = MemoryMailbox::new();
        let queue = MailboxPath::new(["candidates", "s1", "caller"]);
        mb.publish(&queue.child("b"), json!(2)).await.unwrap();
        mb.publish(&queue.child("a"), json!(1)).await.unwrap();

        let (cb, log) = child_log();
        let _sub = mb.subscribe_child_added(&queue, cb).unwrap();
        mb.publish(&queue.child("c"), json!(3)).await.unwrap();
        // Rewriting an existing child is not a new addition.
        mb.publish(&queue.child("a"), json!(10)).await.unwrap();

        let seen = log.lock().unwrap().clone();
        let keys: Vec<&str> = seen.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_child_removed_then_readded_fires_again() {
        let mb = MemoryMailbox::new();
        let queue = MailboxPath::new(["candidates", "s1", "callee"]);
        let (cb, log) = child_log();
        let _sub = mb.subscribe_child_added(&queue, cb).unwrap();

        mb.publish(&queue.child("a"), json!(1)).await.unwrap();
        mb.remove(&queue.child("a")).await.unwrap();
        mb.publish(&queue.child("a"), json!(2)).await.unwrap();

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].1, json!(2));
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_operation() {
        let mb = MemoryMailbox::new();
        let path = MailboxPath::new(["inbox", "bob"]);
        mb.set_connected(false);

        assert!(matches!(
            mb.publish(&path, json!(1)).await,
            Err(MailboxError::Unreachable)
        ));
        assert!(matches!(
            mb.read_once(&path).await,
            Err(MailboxError::Unreachable)
        ));
        assert!(matches!(
            mb.remove(&path).await,
            Err(MailboxError::Unreachable)
        ));
        assert!(matches!(
            mb.allocate_child_id(&path).await,
            Err(MailboxError::Unreachable)
        ));
        let (cb, _) = value_log();
        assert!(mb.subscribe(&path, cb).is_err());
        assert!(matches!(
            mb.on_disconnect_set(&path, DeferredValue::ServerTimestamp)
                .await,
            Err(MailboxError::Unreachable)
        ));
    }

    #[tokio::test]
    async fn test_deferred_write_fires_on_disconnect_once() {
        let mb = MemoryMailbox::new();
        let path = MailboxPath::new(["presence", "alice"]);
        mb.publish(&path, json!("online")).await.unwrap();
        mb.on_disconnect_set(&path, DeferredValue::ServerTimestamp)
            .await
            .unwrap();

        mb.set_connected(false);
        let after_drop = {
            let tree = mb.shared.tree.lock().unwrap();
            get_at(&tree, path.segments()).cloned().unwrap()
        };
        assert!(after_drop.is_i64());

        // Reconnect, go online again; the old registration must not fire.
        mb.set_connected(true);
        mb.publish(&path, json!("online")).await.unwrap();
        mb.set_connected(false);
        let after_second_drop = {
            let tree = mb.shared.tree.lock().unwrap();
            get_at(&tree, path.segments()).cloned().unwrap()
        };
        assert_eq!(after_second_drop, json!("online"));
    }

    #[tokio::test]
    async fn test_stale_epoch_registration_is_discarded() {
        let mb = MemoryMailbox::new();
        let path = MailboxPath::new(["presence", "alice"]);
        mb.on_disconnect_set(&path, DeferredValue::Value(json!("stale")))
            .await
            .unwrap();
        mb.set_connected(false);
        mb.set_connected(true);
        mb.on_disconnect_set(&path, DeferredValue::Value(json!("fresh")))
            .await
            .unwrap();
        mb.set_connected(false);

        let value = {
            let tree = mb.shared.tree.lock().unwrap();
            get_at(&tree, path.segments()).cloned().unwrap()
        };
        assert_eq!(value, json!("fresh"));
    }

    #[tokio::test]
    async fn test_allocated_ids_sort_in_allocation_order() {
        let mb = MemoryMailbox::new();
        let root = MailboxPath::new(["callLogs", "alice"]);
        let mut previous = mb.allocate_child_id(&root).await.unwrap();
        for _ in 0..10 {
            let next = mb.allocate_child_id(&root).await.unwrap();
            assert!(next > previous, "{next} should sort after {previous}");
            previous = next;
        }
    }

    #[tokio::test]
    async fn test_connection_subscription_reports_current_and_changes() {
        let mb = MemoryMailbox::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let _sub = mb.subscribe_connection(Arc::new(move |up| sink.lock().unwrap().push(up)));
        mb.set_connected(false);
        mb.set_connected(true);
        assert_eq!(log.lock().unwrap().clone(), vec![true, false, true]);
    }
}
