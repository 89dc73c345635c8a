use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::stream::{ConsumerGroup, DurableStream, StreamMessage};
use crate::utils::error::{AppError, Result};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    entries: BTreeMap<u64, HashMap<String, String>>,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    /// Drop entries every group has both received and acknowledged.
    fn trim(&mut self) {
        let floor = self
            .groups
            .values()
            .map(|group| {
                group
                    .pending
                    .keys()
                    .next()
                    .copied()
                    .unwrap_or(group.last_delivered + 1)
            })
            .min();
        if let Some(floor) = floor {
            self.entries = self.entries.split_off(&floor);
        }
    }

    fn message(&self, id: u64) -> Option<StreamMessage> {
        self.entries.get(&id).map(|values| StreamMessage {
            id: id.to_string(),
            values: values.clone(),
        })
    }
}

/// Process-local stream, for single-instance deployments and tests.
pub struct MemoryStream {
    streams: Mutex<HashMap<String, StreamState>>,
    notify: Notify,
    claim_idle: Duration,
    poll_interval: Duration,
}

impl MemoryStream {
    pub fn new(claim_idle: Duration, poll_interval: Duration) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            claim_idle,
            poll_interval,
        }
    }

    /// Number of entries still stored for `stream`.
    pub fn len(&self, stream: &str) -> usize {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.get(stream).map(|state| state.entries.len()).unwrap_or(0)
    }

    /// Number of entries of the group that are delivered but unacknowledged.
    pub fn pending_count(&self, group: &ConsumerGroup) -> usize {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(&group.stream)
            .and_then(|stream| stream.groups.get(&group.group))
            .map(|state| state.pending.len())
            .unwrap_or(0)
    }

    fn with_group<T>(
        &self,
        group: &ConsumerGroup,
        f: impl FnOnce(&mut GroupState, &StreamState) -> T,
    ) -> T {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(group.stream.clone()).or_default();

        // Split borrow: the group is taken out while the entries are read
        let mut state = stream.groups.remove(&group.group).unwrap_or_default();
        let result = f(&mut state, stream);
        stream.groups.insert(group.group.clone(), state);
        result
    }
}

#[async_trait]
impl DurableStream for MemoryStream {
    async fn publish(&self, stream: &str, values: HashMap<String, String>) -> Result<String> {
        let id = {
            let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            let id = state.next_id;
            state.entries.insert(id, values);
            id
        };

        self.notify.notify_waiters();
        Ok(id.to_string())
    }

    async fn acknowledge(&self, group: &ConsumerGroup, id: &str) -> Result<()> {
        let id: u64 = id
            .parse()
            .map_err(|_| AppError::InvalidParams(format!("invalid stream entry id {}", id)))?;
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = streams.get_mut(&group.stream) {
            if let Some(state) = stream.groups.get_mut(&group.group) {
                state.pending.remove(&id);
            }
            stream.trim();
        }
        Ok(())
    }

    async fn ensure_group(&self, group: &ConsumerGroup) -> Result<()> {
        self.with_group(group, |_, _| ());
        Ok(())
    }

    async fn read_pending(&self, group: &ConsumerGroup) -> Result<Vec<StreamMessage>> {
        Ok(self.with_group(group, |state, stream| {
            state
                .pending
                .iter()
                .filter(|(_, entry)| entry.consumer == group.consumer)
                .filter_map(|(id, _)| stream.message(*id))
                .collect()
        }))
    }

    async fn claim_idle(&self, group: &ConsumerGroup, min_idle: Duration) -> Result<Vec<StreamMessage>> {
        let now = Instant::now();
        Ok(self.with_group(group, |state, stream| {
            let mut claimed = Vec::new();
            for (id, entry) in state.pending.iter_mut() {
                if now.duration_since(entry.delivered_at) >= min_idle {
                    tracing::info!(
                        stream = %group.stream,
                        "claiming entry {} idle on consumer {}",
                        id,
                        entry.consumer
                    );
                    entry.consumer = group.consumer.clone();
                    entry.delivered_at = now;
                    claimed.extend(stream.message(*id));
                }
            }
            claimed
        }))
    }

    async fn read_next(&self, group: &ConsumerGroup) -> Result<Option<StreamMessage>> {
        Ok(self.with_group(group, |state, stream| {
            let (id, _) = stream.entries.range(state.last_delivered + 1..).next()?;
            let id = *id;
            state.last_delivered = id;
            state.pending.insert(
                id,
                PendingEntry {
                    consumer: group.consumer.clone(),
                    delivered_at: Instant::now(),
                },
            );
            stream.message(id)
        }))
    }

    async fn wait_for_entries(&self) {
        let _ = tokio::time::timeout(self.poll_interval, self.notify.notified()).await;
    }

    fn claim_idle_after(&self) -> Duration {
        self.claim_idle
    }
}
