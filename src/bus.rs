//! Pub/sub event bus.
//!
//! Live delivery rides a `tokio::sync::broadcast` channel; every publish is
//! also appended to the `event_log` table so consumers that missed a
//! notification can recover from the store. Delivery is at-least-once and
//! per-topic ordering is best-effort: subscribers must derive state
//! idempotently from `run_id` / `url` keys plus the authoritative store.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::Db;

/// Topics carried on the bus. String values are part of the wire contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Topic {
    #[serde(rename = "runner.run-finished")]
    RunFinished,
    #[serde(rename = "publish.merge-proposal-updated")]
    MergeProposalUpdated,
    #[serde(rename = "publish.publish-result")]
    PublishResult,
    #[serde(rename = "differ.precache-done")]
    PrecacheDone,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunFinished => "runner.run-finished",
            Self::MergeProposalUpdated => "publish.merge-proposal-updated",
            Self::PublishResult => "publish.publish-result",
            Self::PrecacheDone => "differ.precache-done",
        }
    }
}

/// A JSON envelope on a topic. Payloads carry an `event` field naming the
/// event kind; subscribers tolerate unknown extra fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub topic: Topic,
    pub payload: serde_json::Value,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    db: Db,
}

impl EventBus {
    pub fn new(db: Db) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx, db }
    }

    /// Publish an event: append to the durable log, then notify live
    /// subscribers. A full or empty channel is not an error; the log is
    /// the recovery path.
    pub async fn publish(&self, topic: Topic, payload: serde_json::Value) {
        if let Err(err) = self
            .db
            .call({
                let payload = payload.clone();
                move |db| db.append_event(topic.as_str(), &payload)
            })
            .await
        {
            tracing::warn!(topic = topic.as_str(), error = %err, "failed to persist event");
        }
        let _ = self.tx.send(Event { topic, payload });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateDb;

    #[tokio::test]
    async fn test_publish_reaches_subscriber_and_log() -> anyhow::Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let bus = EventBus::new(db.clone());
        let mut rx = bus.subscribe();

        bus.publish(
            Topic::RunFinished,
            serde_json::json!({
                "event": "run-finished",
                "run_id": "r1",
                "codebase": "foo",
                "campaign": "lintian-fixes",
                "result_code": "success",
            }),
        )
        .await;

        let event = rx.recv().await?;
        assert_eq!(event.topic, Topic::RunFinished);
        assert_eq!(event.payload["run_id"], "r1");

        let logged: i64 = db
            .call(|db| {
                db.connection()
                    .query_row(
                        "SELECT COUNT(*) FROM event_log WHERE topic = 'runner.run-finished'",
                        [],
                        |row| row.get(0),
                    )
                    .map_err(Into::into)
            })
            .await?;
        assert_eq!(logged, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() -> anyhow::Result<()> {
        let db = Db::new(StateDb::new_in_memory()?);
        let bus = EventBus::new(db);
        bus.publish(Topic::PrecacheDone, serde_json::json!({"event": "precache-done"}))
            .await;
        Ok(())
    }

    #[test]
    fn test_topic_strings_are_stable() {
        assert_eq!(Topic::RunFinished.as_str(), "runner.run-finished");
        assert_eq!(
            Topic::MergeProposalUpdated.as_str(),
            "publish.merge-proposal-updated"
        );
        assert_eq!(Topic::PublishResult.as_str(), "publish.publish-result");
        assert_eq!(Topic::PrecacheDone.as_str(), "differ.precache-done");
    }
}
