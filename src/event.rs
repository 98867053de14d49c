//! Events the engine consumes: push notifications and mutation results.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::cache::{Partition, Record, RecordId};
use crate::key::QueryKey;

/// Out-of-band notification that one record changed or was destroyed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent<R> {
  /// Record was created or changed, possibly moving between partitions
  Upsert {
    record: R,
    #[serde(default)]
    previous_partition: Option<Partition>,
  },
  /// Record was permanently destroyed
  Remove { id: RecordId, partition: Partition },
}

impl<R: Record> PushEvent<R> {
  pub fn upsert(record: R) -> Self {
    PushEvent::Upsert {
      record,
      previous_partition: None,
    }
  }

  pub fn moved(record: R, previous_partition: Partition) -> Self {
    PushEvent::Upsert {
      record,
      previous_partition: Some(previous_partition),
    }
  }

  pub fn remove(id: impl Into<RecordId>, partition: Partition) -> Self {
    PushEvent::Remove {
      id: id.into(),
      partition,
    }
  }

  pub fn record_id(&self) -> RecordId {
    match self {
      PushEvent::Upsert { record, .. } => record.record_id(),
      PushEvent::Remove { id, .. } => id.clone(),
    }
  }
}

/// A push event addressed to one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEnvelope<R> {
  pub resource: String,
  #[serde(flatten)]
  pub event: PushEvent<R>,
}

impl<R: Record> PushEnvelope<R> {
  /// Decode the canonical JSON shape:
  /// `{ "resource": "tags", "type": "upsert", "record": {...} }`.
  pub fn from_json(payload: &Value) -> Result<Self> {
    serde_json::from_value(payload.clone()).map_err(|e| eyre!("Invalid push payload: {}", e))
  }

  pub fn resource_key(&self) -> QueryKey {
    QueryKey::resource(&self.resource)
  }
}

/// What a successful create/update/delete/bulk action hands to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationOutcome {
  pub all_query_key: QueryKey,
  pub detail_query_key: Option<QueryKey>,
  pub affected_id: Option<RecordId>,
}

impl MutationOutcome {
  pub fn for_resource(resource: &str) -> Self {
    Self {
      all_query_key: QueryKey::resource(resource),
      detail_query_key: None,
      affected_id: None,
    }
  }

  /// Mark a single affected record; its detail key is refreshed as well.
  pub fn with_affected(mut self, id: impl Into<RecordId>) -> Self {
    let id = id.into();
    if let Some(resource) = self.all_query_key.resource_name() {
      self.detail_query_key = Some(QueryKey::detail(resource, &id));
    }
    self.affected_id = Some(id);
    self
  }
}

/// Sending half of a push channel, handed to the transport decoder.
pub struct PushSender<R> {
  tx: mpsc::UnboundedSender<PushEnvelope<R>>,
}

impl<R> Clone for PushSender<R> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
    }
  }
}

impl<R: Record> PushSender<R> {
  pub fn send(&self, resource: &str, event: PushEvent<R>) -> Result<()> {
    self
      .tx
      .send(PushEnvelope {
        resource: resource.to_string(),
        event,
      })
      .map_err(|_| eyre!("Push channel closed"))
  }
}

/// Receiving half of a push channel, drained by the rendering layer.
pub struct PushReceiver<R> {
  rx: mpsc::UnboundedReceiver<PushEnvelope<R>>,
}

impl<R: Record> PushReceiver<R> {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<PushEnvelope<R>> {
    self.rx.recv().await
  }

  /// Receive without waiting; None when nothing is queued.
  pub fn try_next(&mut self) -> Option<PushEnvelope<R>> {
    self.rx.try_recv().ok()
  }
}

/// Create an unbounded push channel.
pub fn push_channel<R: Record>() -> (PushSender<R>, PushReceiver<R>) {
  let (tx, rx) = mpsc::unbounded_channel();
  (PushSender { tx }, PushReceiver { rx })
}
