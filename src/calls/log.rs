//! Call log recorder.
//!
//! Appends immutable call-attempt records at call start and patches a
//! duration in after the fact. Reconciliation is best-effort by design: a
//! duration that finds no matching entry inside the bounded window is
//! dropped, not an error.

use super::signaling::{self, CallLogRecord};
use crate::mailbox::{Mailbox, MailboxError};
use crate::types::call::{CallDirection, CallKind};
use crate::types::user::{PeerId, PeerSnapshot};
use log::{debug, warn};
use std::sync::Arc;

/// How many of the owner's most recent entries finalization considers.
const FINALIZE_WINDOW: usize = 5;

pub struct CallLogRecorder {
    mailbox: Arc<dyn Mailbox>,
}

impl CallLogRecorder {
    pub fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        Self { mailbox }
    }

    /// Append one entry to `owner`'s log and return its key.
    pub async fn start_log(
        &self,
        owner: &PeerId,
        partner: PeerSnapshot,
        kind: CallKind,
        direction: CallDirection,
        ts: i64,
    ) -> Result<String, MailboxError> {
        let root = signaling::call_logs_root(owner);
        let log_id = self.mailbox.allocate_child_id(&root).await?;
        let record = CallLogRecord {
            partner,
            kind,
            direction,
            ts,
            duration: None,
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| MailboxError::InvalidPath(e.to_string()))?;
        self.mailbox
            .publish(&signaling::call_log_entry(owner, &log_id), value)
            .await?;
        Ok(log_id)
    }

    /// Patch `duration_secs` into the newest of `owner`'s recent entries
    /// that matches `partner` and has no duration yet. Scans at most the
    /// last [`FINALIZE_WINDOW`] entries; no match means the duration is
    /// silently dropped.
    pub async fn finalize_log(
        &self,
        owner: &PeerId,
        partner: &PeerId,
        duration_secs: u64,
    ) -> Result<(), MailboxError> {
        let root = signaling::call_logs_root(owner);
        let Some(snapshot) = self.mailbox.read_once(&root).await? else {
            debug!(target: "Calls/Log", "no log entries for {owner}, dropping duration");
            return Ok(());
        };
        let Some(entries) = snapshot.as_object() else {
            warn!(target: "Calls/Log", "log root for {owner} is not a keyed map");
            return Ok(());
        };

        // Keys are mailbox-assigned, so key order is insertion order; the
        // window is the last few keys.
        let window: Vec<(&String, &serde_json::Value)> = {
            let keys: Vec<_> = entries.iter().collect();
            let start = keys.len().saturating_sub(FINALIZE_WINDOW);
            keys[start..].to_vec()
        };

        let mut best: Option<(&String, i64)> = None;
        for (key, value) in window {
            let record = match signaling::decode_call_log(
                &signaling::call_log_entry(owner, key),
                value,
            ) {
                Ok(record) => record,
                Err(e) => {
                    warn!(target: "Calls/Log", "skipping unreadable log entry {key}: {e}");
                    continue;
                }
            };
            if record.partner.id != *partner || record.duration.is_some() {
                continue;
            }
            // Newest start wins; later key wins a timestamp tie since the
            // window iterates in insertion order.
            if best.is_none_or(|(_, ts)| record.ts >= ts) {
                best = Some((key, record.ts));
            }
        }

        match best {
            Some((key, _)) => {
                let path = signaling::call_log_entry(owner, key).child("duration");
                self.mailbox
                    .publish(&path, serde_json::Value::from(duration_secs))
                    .await
            }
            None => {
                debug!(
                    target: "Calls/Log",
                    "no open log entry for {owner} with partner {partner}, dropping duration"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{MailboxPath, MemoryMailbox};
    use serde_json::json;

    fn recorder() -> (Arc<MemoryMailbox>, CallLogRecorder) {
        let mailbox = Arc::new(MemoryMailbox::new());
        let recorder = CallLogRecorder::new(mailbox.clone());
        (mailbox, recorder)
    }

    async fn read_durations(mailbox: &MemoryMailbox, owner: &PeerId) -> Vec<Option<u64>> {
        let root = signaling::call_logs_root(owner);
        let snapshot = mailbox.read_once(&root).await.unwrap().unwrap();
        snapshot
            .as_object()
            .unwrap()
            .values()
            .map(|v| v.get("duration").and_then(|d| d.as_u64()))
            .collect()
    }

    #[tokio::test]
    async fn test_finalize_patches_newest_open_entry() {
        let (mailbox, recorder) = recorder();
        let alice = PeerId::from("alice");
        let partner = PeerSnapshot::new("bob", "bob");

        recorder
            .start_log(&alice, partner.clone(), CallKind::Voice, CallDirection::Outgoing, 90)
            .await
            .unwrap();
        recorder
            .start_log(&alice, partner, CallKind::Voice, CallDirection::Outgoing, 100)
            .await
            .unwrap();

        recorder
            .finalize_log(&alice, &PeerId::from("bob"), 42)
            .await
            .unwrap();

        // Only the ts:100 entry is patched; insertion order puts it last.
        assert_eq!(
            read_durations(&mailbox, &alice).await,
            vec![None, Some(42)]
        );
    }

    #[tokio::test]
    async fn test_finalize_never_patches_twice() {
        let (mailbox, recorder) = recorder();
        let alice = PeerId::from("alice");
        let partner = PeerSnapshot::new("bob", "bob");

        recorder
            .start_log(&alice, partner.clone(), CallKind::Video, CallDirection::Outgoing, 50)
            .await
            .unwrap();
        recorder
            .start_log(&alice, partner, CallKind::Video, CallDirection::Outgoing, 60)
            .await
            .unwrap();

        recorder.finalize_log(&alice, &PeerId::from("bob"), 7).await.unwrap();
        recorder.finalize_log(&alice, &PeerId::from("bob"), 9).await.unwrap();

        // Second finalize lands on the remaining open entry, not the
        // already-dotted one.
        assert_eq!(
            read_durations(&mailbox, &alice).await,
            vec![Some(9), Some(7)]
        );
    }

    #[tokio::test]
    async fn test_finalize_outside_window_is_dropped() {
        let (mailbox, recorder) = recorder();
        let alice = PeerId::from("alice");

        recorder
            .start_log(
                &alice,
                PeerSnapshot::new("bob", "bob"),
                CallKind::Voice,
                CallDirection::Outgoing,
                10,
            )
            .await
            .unwrap();
        for i in 0..FINALIZE_WINDOW {
            recorder
                .start_log(
                    &alice,
                    PeerSnapshot::new("carol", "carol"),
                    CallKind::Voice,
                    CallDirection::Incoming,
                    20 + i as i64,
                )
                .await
                .unwrap();
        }

        // bob's entry scrolled out of the window; the duration vanishes.
        recorder
            .finalize_log(&alice, &PeerId::from("bob"), 33)
            .await
            .unwrap();
        assert!(
            read_durations(&mailbox, &alice)
                .await
                .iter()
                .all(Option::is_none)
        );
    }

    #[tokio::test]
    async fn test_finalize_with_no_entries_is_a_noop() {
        let (mailbox, recorder) = recorder();
        recorder
            .finalize_log(&PeerId::from("alice"), &PeerId::from("bob"), 5)
            .await
            .unwrap();
        assert!(
            mailbox
                .read_once(&MailboxPath::new(["callLogs", "alice"]))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unreadable_entry_is_skipped() {
        let (mailbox, recorder) = recorder();
        let alice = PeerId::from("alice");
        mailbox
            .publish(
                &signaling::call_log_entry(&alice, "000aaa"),
                json!({"partner": "not-a-snapshot"}),
            )
            .await
            .unwrap();
        recorder
            .start_log(
                &alice,
                PeerSnapshot::new("bob", "bob"),
                CallKind::Voice,
                CallDirection::Outgoing,
                10,
            )
            .await
            .unwrap();

        recorder
            .finalize_log(&alice, &PeerId::from("bob"), 12)
            .await
            .unwrap();
        let durations = read_durations(&mailbox, &alice).await;
        assert!(durations.contains(&Some(12)));
    }
}
