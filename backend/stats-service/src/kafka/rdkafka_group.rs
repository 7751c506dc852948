//! Kafka consumer group client
//!
//! Wraps one `StreamConsumer` subscribed with the round-robin assignor. A pump
//! task reads the consumer and routes each message into the bounded channel of
//! its partition's claim. Assignment changes are detected by polling
//! `assignment()`; every change starts a new session.
//!
//! Offsets are stored only after the handler succeeded (`enable.auto.offset.store
//! = false`) and flushed by librdkafka's auto-commit. When a new session keeps a
//! partition, the consumer seeks back to the last stored offset so in-flight
//! messages of the previous session are delivered again.
//!
//! The pump is shared by all partitions: a claim whose channel is full stalls
//! delivery to the others until it drains.

use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::Offset;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::group::{
    CoordinationError, Delivery, GroupClient, GroupSession, PartitionClaim, SessionClosed,
};
use crate::config::Config;

const SEEK_TIMEOUT: Duration = Duration::from_secs(1);

type TopicPartition = (String, i32);

#[derive(Debug, Clone)]
pub struct GroupClientSettings {
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub client_id: String,
    pub session_timeout: Duration,
    pub partition_buffer: usize,
    pub assignment_poll: Duration,
    pub metadata_timeout: Duration,
}

impl From<&Config> for GroupClientSettings {
    fn from(config: &Config) -> Self {
        Self {
            brokers: config.kafka_brokers.clone(),
            topic: config.kafka_topic.clone(),
            group_id: config.consumer_group.clone(),
            client_id: config.consumer_client_id.clone(),
            session_timeout: Duration::from_millis(config.session_timeout_ms),
            partition_buffer: config.partition_buffer,
            assignment_poll: config.assignment_poll_interval(),
            metadata_timeout: Duration::from_secs(10),
        }
    }
}

/// Next offset to process per partition, as last stored by a successful handler
type StoredOffsets = Arc<Mutex<HashMap<TopicPartition, i64>>>;

pub struct KafkaGroupClient {
    consumer: Arc<StreamConsumer>,
    stored: StoredOffsets,
    sessions: tokio::sync::Mutex<mpsc::UnboundedReceiver<GroupSession>>,
    stop: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaGroupClient {
    /// Connect, verify the brokers answer and subscribe to the stats topic.
    pub async fn connect(settings: GroupClientSettings) -> Result<Self, CoordinationError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &settings.group_id)
            .set("client.id", &settings.client_id)
            .set("bootstrap.servers", &settings.brokers)
            .set("partition.assignment.strategy", "roundrobin")
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                settings.session_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| CoordinationError::Join(e.to_string()))?;
        let consumer = Arc::new(consumer);

        let metadata_client = consumer.clone();
        let topic = settings.topic.clone();
        let timeout = settings.metadata_timeout;
        tokio::task::spawn_blocking(move || {
            metadata_client
                .client()
                .fetch_metadata(Some(&topic), timeout)
                .map(|_| ())
        })
        .await
        .map_err(|e| CoordinationError::Join(e.to_string()))?
        .map_err(|e| CoordinationError::Join(format!("brokers unreachable: {e}")))?;

        consumer.subscribe(&[settings.topic.as_str()]).map_err(|e| {
            error!(topic = %settings.topic, error = %e, "Failed to subscribe to topic");
            CoordinationError::Join(e.to_string())
        })?;

        info!(
            brokers = %settings.brokers,
            topic = %settings.topic,
            group_id = %settings.group_id,
            client_id = %settings.client_id,
            "Stats Kafka consumer subscribed"
        );

        let stored: StoredOffsets = Arc::default();
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();

        let pump = Pump {
            consumer: consumer.clone(),
            stored: stored.clone(),
            sessions: sessions_tx,
            partition_buffer: settings.partition_buffer,
            generation: 0,
            live: None,
            forwarded: HashMap::new(),
        };
        let handle = tokio::spawn(pump.run(stop.clone(), settings.assignment_poll));

        Ok(Self {
            consumer,
            stored,
            sessions: tokio::sync::Mutex::new(sessions_rx),
            stop,
            pump: Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl GroupClient for KafkaGroupClient {
    async fn join(&self) -> Result<GroupSession, CoordinationError> {
        let mut sessions = self.sessions.lock().await;

        while let Some(session) = sessions.recv().await {
            // Generations superseded while nobody was joining
            if session.token.is_cancelled() {
                continue;
            }
            return Ok(session);
        }

        Err(CoordinationError::Closed)
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), CoordinationError> {
        let next = delivery.offset + 1;

        self.consumer
            .store_offset(&delivery.topic, delivery.partition, next)
            .map_err(|e| CoordinationError::Commit(e.to_string()))?;

        let mut stored = self.stored.lock();
        let entry = stored
            .entry((delivery.topic.clone(), delivery.partition))
            .or_insert(next);
        *entry = (*entry).max(next);
        Ok(())
    }

    async fn close(&self) {
        self.stop.cancel();

        let handle = self.pump.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Kafka pump task failed");
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            debug!(error = %e, "No stored offsets committed on close");
        }
        self.consumer.unsubscribe();
        info!("Stats Kafka consumer closed");
    }
}

/// The pump's view of the current generation
struct LiveSession {
    assignment: BTreeSet<TopicPartition>,
    routes: HashMap<TopicPartition, mpsc::Sender<Delivery>>,
    token: CancellationToken,
    closed: oneshot::Sender<SessionClosed>,
}

struct Pump {
    consumer: Arc<StreamConsumer>,
    stored: StoredOffsets,
    sessions: mpsc::UnboundedSender<GroupSession>,
    partition_buffer: usize,
    generation: u64,
    live: Option<LiveSession>,
    /// Offset after the last message handed to a claim, per partition
    forwarded: HashMap<TopicPartition, i64>,
}

impl Pump {
    async fn run(mut self, stop: CancellationToken, poll: Duration) {
        let consumer = self.consumer.clone();
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.refresh_assignment(),
                received = consumer.recv() => {
                    let delivery = match received {
                        Ok(message) => Delivery {
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                            key: message.key().map(<[u8]>::to_vec),
                            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                        },
                        Err(e) => {
                            error!(error = %e, "Kafka consumer error");
                            self.end_session(SessionClosed::Error(CoordinationError::Consume(
                                e.to_string(),
                            )));
                            continue;
                        }
                    };

                    if !self.route(delivery, &stop).await {
                        break;
                    }
                }
            }
        }

        if let Some(live) = self.live.take() {
            live.token.cancel();
        }
        debug!("Kafka pump stopped");
    }

    /// Hand `delivery` to its claim. Returns `false` once `stop` fired.
    async fn route(&mut self, delivery: Delivery, stop: &CancellationToken) -> bool {
        let key = (delivery.topic.clone(), delivery.partition);

        let covered = self
            .live
            .as_ref()
            .map(|live| live.routes.contains_key(&key))
            .unwrap_or(false);
        if !covered {
            self.refresh_assignment();
        }

        let Some((route, token)) = self
            .live
            .as_ref()
            .and_then(|live| live.routes.get(&key).map(|r| (r.clone(), live.token.clone())))
        else {
            warn!(
                topic = %key.0,
                partition = key.1,
                offset = delivery.offset,
                "Message for unassigned partition dropped"
            );
            return true;
        };

        let next = delivery.offset + 1;
        self.stored.lock().entry(key.clone()).or_insert(delivery.offset);

        tokio::select! {
            biased;
            _ = stop.cancelled() => return false,
            _ = token.cancelled() => {}
            sent = route.send(delivery) => {
                if sent.is_ok() {
                    self.forwarded.insert(key, next);
                }
            }
        }
        true
    }

    fn refresh_assignment(&mut self) {
        let assignment = match self.consumer.assignment() {
            Ok(list) => list
                .elements()
                .iter()
                .map(|e| (e.topic().to_string(), e.partition()))
                .collect::<BTreeSet<_>>(),
            Err(e) => {
                warn!(error = %e, "Failed to read partition assignment");
                return;
            }
        };

        if self.live.as_ref().map(|live| &live.assignment) == Some(&assignment) {
            return;
        }

        self.end_session(SessionClosed::Rebalance);
        self.start_session(assignment);
    }

    fn end_session(&mut self, reason: SessionClosed) {
        if let Some(live) = self.live.take() {
            live.token.cancel();
            let _ = live.closed.send(reason);
        }
    }

    fn start_session(&mut self, assignment: BTreeSet<TopicPartition>) {
        self.generation += 1;

        {
            let mut stored = self.stored.lock();
            stored.retain(|tp, _| assignment.contains(tp));
            self.forwarded.retain(|tp, _| assignment.contains(tp));

            for (tp, forwarded) in self.forwarded.iter_mut() {
                let Some(resume) = stored.get(tp).copied() else {
                    continue;
                };
                if *forwarded <= resume {
                    continue;
                }
                match self
                    .consumer
                    .seek(&tp.0, tp.1, Offset::Offset(resume), SEEK_TIMEOUT)
                {
                    Ok(()) => {
                        debug!(topic = %tp.0, partition = tp.1, offset = resume, "Rewound partition");
                        *forwarded = resume;
                    }
                    Err(e) => warn!(
                        topic = %tp.0,
                        partition = tp.1,
                        offset = resume,
                        error = %e,
                        "Failed to rewind partition"
                    ),
                }
            }
        }

        let token = CancellationToken::new();
        let (closed_tx, closed_rx) = oneshot::channel();
        let mut routes = HashMap::new();
        let mut claims = Vec::new();

        for (topic, partition) in &assignment {
            let (tx, rx) = mpsc::channel(self.partition_buffer);
            routes.insert((topic.clone(), *partition), tx);
            claims.push(PartitionClaim {
                topic: topic.clone(),
                partition: *partition,
                messages: rx,
            });
        }

        info!(
            generation = self.generation,
            partitions = ?assignment.iter().map(|(_, p)| *p).collect::<Vec<_>>(),
            "Kafka partition assignment changed"
        );

        let session = GroupSession {
            generation: self.generation,
            claims,
            token: token.clone(),
            closed: closed_rx,
        };
        let _ = self.sessions.send(session);

        self.live = Some(LiveSession {
            assignment,
            routes,
            token,
            closed: closed_tx,
        });
    }
}
