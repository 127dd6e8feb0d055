//! Signaling mailbox: the keyed, subscribable store-and-forward transport.
//!
//! All call coordination happens as eventually-delivered key-value events
//! against this store; there is no request/response signaling channel.
//! The contract:
//!
//! - [`Mailbox::publish`] / [`Mailbox::read_once`] / [`Mailbox::remove`]
//!   operate on whole subtrees addressed by [`MailboxPath`].
//! - [`Mailbox::subscribe`] observes a path continuously with
//!   last-write-wins values; it fires with the current value at subscribe
//!   time and with `None` when the path goes away.
//! - [`Mailbox::subscribe_child_added`] replays every existing child in
//!   key order, then delivers each later addition once per child.
//! - Child keys allocated by [`Mailbox::allocate_child_id`] sort
//!   lexicographically in allocation order, so key order is insertion
//!   order for mailbox-assigned ids.
//! - When the store is unreachable every operation fails with
//!   [`MailboxError::Unreachable`]; callers treat this as non-retryable
//!   for the current attempt and unwind.
//!
//! Subscription callbacks are invoked synchronously on the writer's task
//! and must not call back into the mailbox; hand real work to a spawned
//! task.

mod memory;
mod path;

pub use memory::MemoryMailbox;
pub use path::MailboxPath;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailboxError {
    /// The store cannot be reached; the current attempt must unwind.
    #[error("mailbox unreachable")]
    Unreachable,

    #[error("invalid mailbox path: {0}")]
    InvalidPath(String),
}

/// Continuous value observer; receives `None` when the path is absent.
pub type ValueCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Child-added observer; receives the child key and its value.
pub type ChildAddedCallback = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Link liveness observer; `true` on connect, `false` on disconnect.
pub type ConnectionCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Value for a deferred (disconnect-triggered) write.
#[derive(Debug, Clone)]
pub enum DeferredValue {
    Value(Value),
    /// Resolved to the store's clock at the moment the write fires.
    ServerTimestamp,
}

/// Handle to an active subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches the observer; both are safe
/// after the mailbox itself is gone.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Last-write-wins set of the value at `path`, creating parents.
    async fn publish(&self, path: &MailboxPath, value: Value) -> Result<(), MailboxError>;

    /// One-shot read of the subtree at `path`.
    async fn read_once(&self, path: &MailboxPath) -> Result<Option<Value>, MailboxError>;

    /// Delete the subtree at `path`. Removing an absent path is a no-op.
    async fn remove(&self, path: &MailboxPath) -> Result<(), MailboxError>;

    /// Allocate a fresh child key under `path` without writing anything.
    /// Keys sort lexicographically in allocation order.
    async fn allocate_child_id(&self, path: &MailboxPath) -> Result<String, MailboxError>;

    /// Continuous observation of `path`; delivers the current value
    /// immediately, then every change, `None` on removal.
    fn subscribe(&self, path: &MailboxPath, cb: ValueCallback)
    -> Result<Subscription, MailboxError>;

    /// Child-added observation of `path`; replays existing children in
    /// key order, then delivers each subsequent addition exactly once.
    fn subscribe_child_added(
        &self,
        path: &MailboxPath,
        cb: ChildAddedCallback,
    ) -> Result<Subscription, MailboxError>;

    /// Observe link liveness; delivers the current state immediately.
    /// Works regardless of connection state.
    fn subscribe_connection(&self, cb: ConnectionCallback) -> Subscription;

    /// Register a write that the store executes if the current connection
    /// drops without explicit teardown. Scoped to the connection epoch in
    /// effect at registration: a registration from an earlier epoch never
    /// fires after a reconnect.
    async fn on_disconnect_set(
        &self,
        path: &MailboxPath,
        value: DeferredValue,
    ) -> Result<(), MailboxError>;

    /// The store's clock, in milliseconds. Shared timestamp authority for
    /// records that need a common ordering.
    fn now_ms(&self) -> i64;
}
