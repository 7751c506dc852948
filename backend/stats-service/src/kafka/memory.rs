//! In-process partitioned log
//!
//! A single-topic stand-in for Kafka used by local runs and tests. It
//! implements [`EventPublisher`] for the producer side and hands out
//! [`MemoryGroupMember`]s implementing [`GroupClient`] for the consumer side.
//!
//! Group semantics follow the broker: every join or leave starts a new
//! generation, partitions are dealt round-robin over the members sorted by id,
//! and each claim resumes at the group's committed offset, so uncommitted
//! messages are delivered again after a rebalance.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::group::{
    CoordinationError, Delivery, GroupClient, GroupSession, PartitionClaim, SessionClosed,
};
use super::publisher::{EventPublisher, PublishError, PublishReceipt};
use crate::models::StatEvent;

const CLAIM_BUFFER: usize = 64;

#[derive(Debug, Clone)]
struct Record {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

struct Partition {
    records: Mutex<Vec<Record>>,
    /// Current length, for feeders waiting on new records
    len: watch::Sender<usize>,
}

/// State of one member inside a group
struct MemberSlot {
    sessions: mpsc::UnboundedSender<GroupSession>,
    current: Option<(CancellationToken, oneshot::Sender<SessionClosed>)>,
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    members: BTreeMap<u64, MemberSlot>,
    /// Next offset to read, per partition
    committed: HashMap<i32, i64>,
    /// Owner of each partition in the current generation
    assignments: BTreeMap<i32, u64>,
}

struct LogInner {
    topic: String,
    partitions: Vec<Arc<Partition>>,
    groups: Mutex<HashMap<String, GroupState>>,
    next_member_id: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryLog {
    inner: Arc<LogInner>,
}

impl MemoryLog {
    /// Create a topic with `partitions` partitions (at least one)
    pub fn new(topic: impl Into<String>, partitions: usize) -> Self {
        let partitions = (0..partitions.max(1))
            .map(|_| {
                let (len, _) = watch::channel(0);
                Arc::new(Partition {
                    records: Mutex::new(Vec::new()),
                    len,
                })
            })
            .collect();

        Self {
            inner: Arc::new(LogInner {
                topic: topic.into(),
                partitions,
                groups: Mutex::new(HashMap::new()),
                next_member_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.inner.partitions.len()
    }

    /// Partition a message key maps to
    pub fn partition_for(&self, key: &[u8]) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.inner.partitions.len() as u64) as i32
    }

    /// Append a raw message to `partition`
    pub fn append(
        &self,
        partition: i32,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<PublishReceipt, PublishError> {
        let target = usize::try_from(partition)
            .ok()
            .and_then(|p| self.inner.partitions.get(p))
            .ok_or_else(|| PublishError::Kafka(format!("unknown partition {partition}")))?;

        let offset = {
            let mut records = target.records.lock();
            records.push(Record {
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
            });
            records.len()
        };
        target.len.send_replace(offset);

        Ok(PublishReceipt {
            partition,
            offset: offset as i64 - 1,
        })
    }

    /// Number of records in `partition`
    pub fn partition_len(&self, partition: i32) -> usize {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.inner.partitions.get(p))
            .map(|p| p.records.lock().len())
            .unwrap_or_default()
    }

    /// Create a consumer for `group`. It joins on its first `join` call.
    pub fn member(&self, group: &str) -> MemoryGroupMember {
        let id = self.inner.next_member_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        MemoryGroupMember {
            log: self.clone(),
            group: group.to_string(),
            id,
            registration: Mutex::new(Some(tx)),
            sessions: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Partition → member id for the group's current generation
    pub fn assignments(&self, group: &str) -> BTreeMap<i32, u64> {
        self.inner
            .groups
            .lock()
            .get(group)
            .map(|g| g.assignments.clone())
            .unwrap_or_default()
    }

    /// Next offset the group will read from `partition`
    pub fn committed(&self, group: &str, partition: i32) -> i64 {
        self.inner
            .groups
            .lock()
            .get(group)
            .and_then(|g| g.committed.get(&partition).copied())
            .unwrap_or_default()
    }

    /// Break every session of `group` as a lost connection would. Members
    /// receive a fresh generation on their next join.
    pub fn disconnect(&self, group: &str) {
        let mut groups = self.inner.groups.lock();
        if let Some(state) = groups.get_mut(group) {
            self.rebalance(
                group,
                state,
                SessionClosed::Error(CoordinationError::Consume("connection lost".into())),
            );
        }
    }

    /// End the current generation and deal partitions to the current members.
    /// Called with the groups lock held.
    fn rebalance(&self, group: &str, state: &mut GroupState, reason: SessionClosed) {
        for slot in state.members.values_mut() {
            if let Some((token, closed)) = slot.current.take() {
                token.cancel();
                let _ = closed.send(reason.clone());
            }
        }

        state.generation += 1;
        state.assignments.clear();

        let member_ids: Vec<u64> = state.members.keys().copied().collect();
        if member_ids.is_empty() {
            return;
        }

        let mut dealt: BTreeMap<u64, Vec<i32>> = BTreeMap::new();
        for partition in 0..self.inner.partitions.len() as i32 {
            let owner = member_ids[partition as usize % member_ids.len()];
            state.assignments.insert(partition, owner);
            dealt.entry(owner).or_default().push(partition);
        }

        for (id, slot) in state.members.iter_mut() {
            let token = CancellationToken::new();
            let (closed_tx, closed_rx) = oneshot::channel();

            let claims = dealt
                .remove(id)
                .unwrap_or_default()
                .into_iter()
                .map(|partition| {
                    let start = state.committed.get(&partition).copied().unwrap_or_default();
                    self.spawn_feeder(partition, start, token.clone())
                })
                .collect();

            let session = GroupSession {
                generation: state.generation,
                claims,
                token: token.clone(),
                closed: closed_rx,
            };

            slot.current = Some((token, closed_tx));
            let _ = slot.sessions.send(session);
        }

        info!(
            group = %group,
            generation = state.generation,
            members = member_ids.len(),
            "In-process consumer group rebalanced"
        );
    }

    fn spawn_feeder(&self, partition: i32, start: i64, token: CancellationToken) -> PartitionClaim {
        let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
        let topic = self.inner.topic.clone();
        let source = self.inner.partitions[partition as usize].clone();

        tokio::spawn(feed(source, topic.clone(), partition, start, tx, token));

        PartitionClaim {
            topic,
            partition,
            messages: rx,
        }
    }
}

/// Copy records from `next` onwards into the claim channel until cancelled
async fn feed(
    source: Arc<Partition>,
    topic: String,
    partition: i32,
    mut next: i64,
    tx: mpsc::Sender<Delivery>,
    token: CancellationToken,
) {
    let mut len = source.len.subscribe();

    loop {
        let record = source.records.lock().get(next as usize).cloned();

        match record {
            Some(record) => {
                let delivery = Delivery {
                    topic: topic.clone(),
                    partition,
                    offset: next,
                    key: record.key,
                    payload: record.payload,
                };
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    sent = tx.send(delivery) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
                next += 1;
            }
            None => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    changed = len.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl EventPublisher for MemoryLog {
    async fn publish(&self, event: &StatEvent) -> Result<PublishReceipt, PublishError> {
        let payload =
            serde_json::to_vec(event).map_err(|e| PublishError::Serialization(e.to_string()))?;
        let key = event.partition_key();
        let partition = self.partition_for(key.as_bytes());

        self.append(partition, Some(key.as_bytes()), &payload)
    }
}

/// One consumer of an in-process group
pub struct MemoryGroupMember {
    log: MemoryLog,
    group: String,
    id: u64,
    /// Session sender, handed to the group on first join
    registration: Mutex<Option<mpsc::UnboundedSender<GroupSession>>>,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupSession>>,
    closed: AtomicBool,
}

impl MemoryGroupMember {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn register(&self) {
        let Some(sessions) = self.registration.lock().take() else {
            return;
        };

        let mut groups = self.log.inner.groups.lock();
        let state = groups.entry(self.group.clone()).or_default();
        state.members.insert(
            self.id,
            MemberSlot {
                sessions,
                current: None,
            },
        );
        debug!(group = %self.group, member = self.id, "Member joining in-process group");
        self.log.rebalance(&self.group, state, SessionClosed::Rebalance);
    }
}

#[async_trait]
impl GroupClient for MemoryGroupMember {
    async fn join(&self) -> Result<GroupSession, CoordinationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinationError::Closed);
        }
        self.register();

        let mut sessions = self.sessions.lock().await;
        while let Some(session) = sessions.recv().await {
            // Superseded by a rebalance before this member picked it up
            if session.token.is_cancelled() {
                continue;
            }
            return Ok(session);
        }

        Err(CoordinationError::Closed)
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        let mut groups = self.log.inner.groups.lock();
        let state = groups
            .get_mut(&self.group)
            .ok_or_else(|| CoordinationError::Commit(format!("unknown group {}", self.group)))?;

        let next = state.committed.entry(delivery.partition).or_default();
        *next = (*next).max(delivery.offset + 1);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut groups = self.log.inner.groups.lock();
        if let Some(state) = groups.get_mut(&self.group) {
            if let Some(slot) = state.members.remove(&self.id) {
                if let Some((token, closed)) = slot.current {
                    token.cancel();
                    let _ = closed.send(SessionClosed::Rebalance);
                }
            }
            debug!(group = %self.group, member = self.id, "Member left in-process group");
            self.log.rebalance(&self.group, state, SessionClosed::Rebalance);
        }
    }
}
