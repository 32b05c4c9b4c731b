//! Message queue between schedulers (producers) and workers (consumers).
//!
//! The log lives in the shared SQLite database. Each consumer group keeps a
//! single committed position; members compete for the next message by
//! compare-and-set on that position, so one message reaches exactly one
//! member of the group. Claiming a message commits it: a worker that dies
//! after the claim loses the message (at-most-once delivery).

use super::metadata_store::SqliteStore;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, Row, sqlite::Sqlite};
use std::time::Duration;
use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SIDE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("fetch task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait]
pub trait Producer: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;
}

/// Where a group that has never committed starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum InitialOffset {
    /// Skip whatever is already queued.
    #[default]
    Newest,
    /// Replay the whole log.
    Oldest,
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub group: String,
    pub topics: Vec<String>,
    pub poll_interval: Duration,
    /// Members silent for longer than this are no longer counted.
    pub session_timeout: Duration,
    pub initial_offset: InitialOffset,
}

impl ConsumerConfig {
    pub fn new(group: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group: group.into(),
            topics,
            poll_interval: Duration::from_millis(500),
            session_timeout: Duration::from_secs(30),
            initial_offset: InitialOffset::Newest,
        }
    }
}

/// A message claimed by this consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    pub seq: i64,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Group membership changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rebalance {
    pub group: String,
    pub members: i64,
}

#[derive(Clone, Debug)]
pub struct SqliteBroker {
    store: SqliteStore,
}

impl SqliteBroker {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Join `config.group` and start fetching its messages.
    pub async fn subscribe(&self, config: ConsumerConfig) -> Result<Consumer, BrokerError> {
        let pool = self.store.pool();
        let start = match config.initial_offset {
            InitialOffset::Newest => {
                sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(seq), 0) FROM broker_messages")
                    .fetch_one(pool)
                    .await?
            }
            InitialOffset::Oldest => 0,
        };
        sqlx::query(
            "INSERT INTO broker_offsets (group_name, committed) VALUES (?, ?)
             ON CONFLICT(group_name) DO NOTHING",
        )
        .bind(&config.group)
        .bind(start)
        .execute(pool)
        .await?;

        let member_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO broker_members (group_name, member_id, last_seen) VALUES (?, ?, ?)",
        )
        .bind(&config.group)
        .bind(&member_id)
        .bind(Utc::now().timestamp_millis())
        .execute(pool)
        .await?;
        info!(group = %config.group, member = %member_id, topics = ?config.topics, "joined consumer group");

        // One slot: the fetch task claims at most one message ahead of the reader.
        let (messages_tx, messages) = mpsc::channel(1);
        let (errors_tx, errors) = mpsc::channel(SIDE_CHANNEL_CAPACITY);
        let (notes_tx, notifications) = mpsc::channel(SIDE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let fetch = FetchLoop {
            store: self.store.clone(),
            member_id: member_id.clone(),
            config: config.clone(),
            messages: messages_tx,
            errors: errors_tx,
            notifications: notes_tx,
            known_members: 0,
        };
        let task = tokio::spawn(fetch.run(cancel.clone()));

        Ok(Consumer {
            messages,
            errors,
            notifications,
            store: self.store.clone(),
            group: config.group,
            member_id,
            cancel,
            task: Some(task),
        })
    }
}

#[async_trait]
impl Producer for SqliteBroker {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        sqlx::query("INSERT INTO broker_messages (topic, payload, published_at) VALUES (?, ?, ?)")
            .bind(topic)
            .bind(payload)
            .bind(Utc::now())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }
}

/// Group member handle. Messages, broker errors and rebalance notifications
/// arrive on separate channels; `close` leaves the group.
pub struct Consumer {
    pub messages: mpsc::Receiver<Delivery>,
    pub errors: mpsc::Receiver<BrokerError>,
    pub notifications: mpsc::Receiver<Rebalance>,
    store: SqliteStore,
    group: String,
    member_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Consumer {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Stop claiming new messages. At most one claimed message may still sit
    /// in `messages`; it stays readable until the receiver is dropped.
    pub async fn stop(&mut self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }

    /// Stop fetching and leave the group. Claims are commits, so nothing is
    /// left to flush once the fetch task has stopped.
    pub async fn close(mut self) -> Result<(), BrokerError> {
        self.stop().await?;
        sqlx::query("DELETE FROM broker_members WHERE group_name = ? AND member_id = ?")
            .bind(&self.group)
            .bind(&self.member_id)
            .execute(self.store.pool())
            .await?;
        info!(group = %self.group, member = %self.member_id, "left consumer group");
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FetchLoop {
    store: SqliteStore,
    member_id: String,
    config: ConsumerConfig,
    messages: mpsc::Sender<Delivery>,
    errors: mpsc::Sender<BrokerError>,
    notifications: mpsc::Sender<Rebalance>,
    known_members: i64,
}

impl FetchLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let heartbeat_every = self.config.session_timeout / 3;
        loop {
            if let Err(err) = self.heartbeat().await {
                self.report(err);
            }

            // Reserve room first: a claimed message must always reach the channel.
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(heartbeat_every) => continue,
                permit = self.messages.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.claim_next().await {
                Ok(Some(delivery)) => {
                    debug!(seq = delivery.seq, topic = %delivery.topic, "claimed message");
                    permit.send(delivery);
                    continue;
                }
                Ok(None) => drop(permit),
                Err(err) => {
                    drop(permit);
                    self.report(err);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        debug!(member = %self.member_id, "fetch loop stopped");
    }

    fn report(&self, err: BrokerError) {
        match self.errors.try_send(err) {
            Ok(()) => {}
            Err(TrySendError::Full(err)) | Err(TrySendError::Closed(err)) => {
                warn!("dropping broker error: {}", err);
            }
        }
    }

    /// Refresh our membership and announce any change in live members.
    async fn heartbeat(&mut self) -> Result<(), BrokerError> {
        let pool = self.store.pool();
        let now = Utc::now().timestamp_millis();
        let stale_before = now - self.config.session_timeout.as_millis() as i64;

        sqlx::query(
            "INSERT INTO broker_members (group_name, member_id, last_seen) VALUES (?, ?, ?)
             ON CONFLICT(group_name, member_id) DO UPDATE SET last_seen = excluded.last_seen",
        )
        .bind(&self.config.group)
        .bind(&self.member_id)
        .bind(now)
        .execute(pool)
        .await?;
        sqlx::query("DELETE FROM broker_members WHERE group_name = ? AND last_seen < ?")
            .bind(&self.config.group)
            .bind(stale_before)
            .execute(pool)
            .await?;
        let members = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM broker_members WHERE group_name = ?",
        )
        .bind(&self.config.group)
        .fetch_one(pool)
        .await?;

        if members != self.known_members {
            self.known_members = members;
            let note = Rebalance {
                group: self.config.group.clone(),
                members,
            };
            if self.notifications.try_send(note).is_err() {
                debug!("rebalance notification dropped");
            }
        }
        Ok(())
    }

    /// Claim the next message on a subscribed topic, if any.
    async fn claim_next(&self) -> Result<Option<Delivery>, BrokerError> {
        let pool = self.store.pool();
        loop {
            let committed = sqlx::query_scalar::<_, i64>(
                "SELECT committed FROM broker_offsets WHERE group_name = ?",
            )
            .bind(&self.config.group)
            .fetch_one(pool)
            .await?;

            let mut builder = QueryBuilder::<Sqlite>::new(
                "SELECT seq, topic, payload FROM broker_messages WHERE seq > ",
            );
            builder.push_bind(committed);
            builder.push(" AND topic IN (");
            let mut topics = builder.separated(", ");
            for topic in &self.config.topics {
                topics.push_bind(topic);
            }
            builder.push(") ORDER BY seq ASC LIMIT 1");

            let Some(row) = builder.build().fetch_optional(pool).await? else {
                return Ok(None);
            };
            let delivery = Delivery {
                seq: row.try_get("seq")?,
                topic: row.try_get("topic")?,
                payload: row.try_get("payload")?,
            };

            let claimed = sqlx::query(
                "UPDATE broker_offsets SET committed = ? WHERE group_name = ? AND committed = ?",
            )
            .bind(delivery.seq)
            .bind(&self.config.group)
            .bind(committed)
            .execute(pool)
            .await?;

            if claimed.rows_affected() == 1 {
                return Ok(Some(delivery));
            }
            // Another member moved the group forward; look again.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(group: &str, topics: &[&str]) -> ConsumerConfig {
        ConsumerConfig {
            poll_interval: Duration::from_millis(10),
            initial_offset: InitialOffset::Oldest,
            ..ConsumerConfig::new(group, topics.iter().map(|t| t.to_string()).collect())
        }
    }

    async fn recv(consumer: &mut Consumer) -> Delivery {
        tokio::time::timeout(Duration::from_secs(5), consumer.messages.recv())
            .await
            .expect("message in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn delivers_published_messages_in_order() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        broker.publish("migration", b"one".to_vec()).await.unwrap();
        broker.publish("migration", b"two".to_vec()).await.unwrap();

        let mut consumer = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        assert_eq!(recv(&mut consumer).await.payload, b"one");
        assert_eq!(recv(&mut consumer).await.payload, b"two");
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn newest_offset_skips_backlog() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        broker.publish("migration", b"old".to_vec()).await.unwrap();

        let mut cfg = config("movers", &["migration"]);
        cfg.initial_offset = InitialOffset::Newest;
        let mut consumer = broker.subscribe(cfg).await.unwrap();
        broker.publish("migration", b"new".to_vec()).await.unwrap();

        assert_eq!(recv(&mut consumer).await.payload, b"new");
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_skipped() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        broker.publish("lifecycle", b"ignored".to_vec()).await.unwrap();
        broker.publish("migration", b"wanted".to_vec()).await.unwrap();

        let mut consumer = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        let delivery = recv(&mut consumer).await;
        assert_eq!(delivery.topic, "migration");
        assert_eq!(delivery.payload, b"wanted");
        consumer.close().await.unwrap();
    }

    #[tokio::test]
    async fn competing_members_never_share_a_message() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        let mut a = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        let mut b = broker.subscribe(config("movers", &["migration"])).await.unwrap();

        for i in 0..6 {
            broker.publish("migration", format!("m{i}").into_bytes()).await.unwrap();
        }

        let mut seen = HashSet::new();
        while seen.len() < 6 {
            let delivery = tokio::select! {
                Some(d) = a.messages.recv() => d,
                Some(d) = b.messages.recv() => d,
            };
            assert!(seen.insert(delivery.seq), "message {} delivered twice", delivery.seq);
        }
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    #[tokio::test]
    async fn separate_groups_each_see_every_message() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        broker.publish("migration", b"job".to_vec()).await.unwrap();

        let mut a = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        let mut b = broker.subscribe(config("auditors", &["migration"])).await.unwrap();
        assert_eq!(recv(&mut a).await.payload, b"job");
        assert_eq!(recv(&mut b).await.payload, b"job");
        a.close().await.unwrap();
        b.close().await.unwrap();
    }

    async fn committed(broker: &SqliteBroker, group: &str) -> i64 {
        sqlx::query_scalar("SELECT committed FROM broker_offsets WHERE group_name = ?")
            .bind(group)
            .fetch_one(broker.store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stopped_consumer_keeps_its_single_claimed_message() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        for payload in ["one", "two", "three"] {
            broker.publish("migration", payload.as_bytes().to_vec()).await.unwrap();
        }

        let mut consumer = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while committed(&broker, "movers").await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        // Nobody reads: the fetch task must not run further ahead.
        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.stop().await.unwrap();
        assert_eq!(committed(&broker, "movers").await, 1);

        let buffered = consumer.messages.try_recv().unwrap();
        assert_eq!(buffered.payload, b"one");
        assert!(consumer.messages.try_recv().is_err());
        consumer.close().await.unwrap();

        let mut next = broker.subscribe(config("movers", &["migration"])).await.unwrap();
        assert_eq!(recv(&mut next).await.payload, b"two");
        next.close().await.unwrap();
    }

    #[tokio::test]
    async fn joining_member_triggers_rebalance_notice() {
        let broker = SqliteBroker::new(SqliteStore::in_memory().await.unwrap());
        let mut consumer = broker.subscribe(config("movers", &["migration"])).await.unwrap();

        let note = tokio::time::timeout(Duration::from_secs(5), consumer.notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(note.group, "movers");
        assert_eq!(note.members, 1);
        consumer.close().await.unwrap();
    }
}
