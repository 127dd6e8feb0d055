//! Presence lifecycle against the in-memory mailbox: online on link-up,
//! deferred last-seen on link loss, explicit last-seen on detach, and no
//! stale deferred writes across reconnects.

mod common;

use common::*;
use dropcall::mailbox::{Mailbox, MemoryMailbox};
use dropcall::presence::{PresenceTracker, presence_path};
use dropcall::types::presence::PresenceState;
use dropcall::types::user::PeerId;
use serde_json::Value;
use std::sync::{Arc, Mutex};

fn watch_presence(
    mailbox: &Arc<MemoryMailbox>,
    uid: &PeerId,
) -> (Arc<Mutex<Vec<Option<Value>>>>, dropcall::mailbox::Subscription) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let subscription = mailbox
        .subscribe(
            &presence_path(uid),
            Arc::new(move |value| sink.lock().unwrap().push(value)),
        )
        .unwrap();
    (log, subscription)
}

fn states(log: &Mutex<Vec<Option<Value>>>) -> Vec<Option<PresenceState>> {
    log.lock()
        .unwrap()
        .iter()
        .map(|v| v.as_ref().and_then(PresenceState::from_value))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_online_on_attach_then_last_seen_on_link_loss() {
    init_logging();
    let mailbox = Arc::new(MemoryMailbox::new());
    let uid = PeerId::from("alice");
    let (log, _watch) = watch_presence(&mailbox, &uid);

    let tracker = PresenceTracker::new(mailbox.clone(), uid);
    tracker.attach();

    let probe = log.clone();
    eventually(
        move || {
            states(&probe)
                .last()
                .is_some_and(|s| *s == Some(PresenceState::Online))
        },
        "online published",
    )
    .await;

    // The link drops without teardown: the deferred write takes over.
    mailbox.set_connected(false);
    let seen = states(&log);
    assert!(
        matches!(seen.last(), Some(Some(PresenceState::LastSeen(_)))),
        "expected a last-seen timestamp, got {seen:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reconnect_goes_back_online_and_rearms() {
    init_logging();
    let mailbox = Arc::new(MemoryMailbox::new());
    let uid = PeerId::from("alice");
    let (log, _watch) = watch_presence(&mailbox, &uid);

    let tracker = PresenceTracker::new(mailbox.clone(), uid);
    tracker.attach();

    let probe = log.clone();
    eventually(
        move || {
            states(&probe)
                .last()
                .is_some_and(|s| *s == Some(PresenceState::Online))
        },
        "first online",
    )
    .await;

    mailbox.set_connected(false);
    mailbox.set_connected(true);

    // The tracker re-publishes online for the new epoch.
    let probe = log.clone();
    eventually(
        move || {
            states(&probe)
                .last()
                .is_some_and(|s| *s == Some(PresenceState::Online))
        },
        "online after reconnect",
    )
    .await;

    // And a second drop still flips to last-seen: the deferred write was
    // re-armed for the new epoch, not left over from the old one.
    mailbox.set_connected(false);
    let seen = states(&log);
    assert!(
        matches!(seen.last(), Some(Some(PresenceState::LastSeen(_)))),
        "expected a re-armed last-seen, got {seen:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detach_writes_last_seen_directly() {
    init_logging();
    let mailbox = Arc::new(MemoryMailbox::new());
    let uid = PeerId::from("alice");

    let tracker = PresenceTracker::new(mailbox.clone(), uid.clone());
    tracker.attach();

    let mb = mailbox.clone();
    let path = presence_path(&uid);
    let probe_path = path.clone();
    eventually_async(
        move || {
            let mb = mb.clone();
            let path = probe_path.clone();
            async move {
                mb.read_once(&path)
                    .await
                    .unwrap()
                    .as_ref()
                    .and_then(PresenceState::from_value)
                    == Some(PresenceState::Online)
            }
        },
        "online before detach",
    )
    .await;

    tracker.detach().await.unwrap();
    let value = mailbox.read_once(&path).await.unwrap().unwrap();
    assert!(matches!(
        PresenceState::from_value(&value),
        Some(PresenceState::LastSeen(_))
    ));

    // Graceful teardown disarms nothing server-side, but the stale
    // registration belongs to this epoch; dropping the link now must not
    // resurrect "online".
    mailbox.set_connected(false);
    mailbox.set_connected(true);
    let value = mailbox.read_once(&path).await.unwrap().unwrap();
    assert!(matches!(
        PresenceState::from_value(&value),
        Some(PresenceState::LastSeen(_))
    ));
}
