//! Presence tracker.
//!
//! Publishes a participant's online/offline state keyed purely to link
//! liveness; call logic never touches it. On link-up it writes `online`
//! and arms a deferred last-seen write that the store fires if the
//! client vanishes; the registration is scoped to the connection epoch,
//! so a registration from before a drop can never clobber a newer
//! `online` from a reconnect. Explicit detach writes the last-seen
//! timestamp directly.

use crate::mailbox::{DeferredValue, Mailbox, MailboxPath, Subscription};
use crate::types::presence::PresenceState;
use crate::types::user::PeerId;
use log::{debug, warn};
use std::sync::{Arc, Mutex};

pub fn presence_path(uid: &PeerId) -> MailboxPath {
    MailboxPath::new(["presence", uid.as_str()])
}

pub struct PresenceTracker {
    mailbox: Arc<dyn Mailbox>,
    uid: PeerId,
    subscription: Mutex<Option<Subscription>>,
}

impl PresenceTracker {
    pub fn new(mailbox: Arc<dyn Mailbox>, uid: PeerId) -> Self {
        Self {
            mailbox,
            uid,
            subscription: Mutex::new(None),
        }
    }

    /// Start tracking: on every link-up, publish `online` and re-arm the
    /// deferred last-seen write for the new connection epoch.
    pub fn attach(&self) {
        let mailbox = Arc::clone(&self.mailbox);
        let uid = self.uid.clone();
        let subscription = self.mailbox.subscribe_connection(Arc::new(move |up| {
            if !up {
                debug!(target: "Presence", "link down for {uid}; deferred write takes over");
                return;
            }
            let mailbox = Arc::clone(&mailbox);
            let uid = uid.clone();
            tokio::spawn(async move {
                let path = presence_path(&uid);
                // Arm the dead-man switch before announcing: once `online`
                // is visible, the last-seen fallback is already in place.
                if let Err(e) = mailbox
                    .on_disconnect_set(&path, DeferredValue::ServerTimestamp)
                    .await
                {
                    warn!(target: "Presence", "failed to arm last-seen write for {uid}: {e}");
                    return;
                }
                if let Err(e) = mailbox
                    .publish(&path, PresenceState::Online.to_value())
                    .await
                {
                    warn!(target: "Presence", "failed to publish online for {uid}: {e}");
                }
            });
        }));
        *self
            .subscription
            .lock()
            .expect("lock should not be poisoned") = Some(subscription);
    }

    /// Graceful teardown: stop tracking and overwrite the presence record
    /// with an explicit last-seen timestamp.
    pub async fn detach(&self) -> Result<(), anyhow::Error> {
        if let Some(subscription) = self
            .subscription
            .lock()
            .expect("lock should not be poisoned")
            .take()
        {
            subscription.unsubscribe();
        }
        let last_seen = PresenceState::LastSeen(self.mailbox.now_ms());
        self.mailbox
            .publish(&presence_path(&self.uid), last_seen.to_value())
            .await?;
        Ok(())
    }
}
