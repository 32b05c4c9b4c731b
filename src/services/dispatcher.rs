//! Hands run requests to the worker fleet through the broker.

use super::broker::{BrokerError, Producer};
use crate::models::message::RunJobRequest;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{error, info};

pub const DEFAULT_MIGRATION_TOPIC: &str = "migration";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("encode run request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("publish run request: {0}")]
    Publish(#[from] BrokerError),
}

/// Outcome of one dispatch, broadcast to whoever listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    Published { job_id: String },
    Failed { job_id: String, error: String },
}

#[derive(Clone)]
pub struct Dispatcher {
    producer: Arc<dyn Producer>,
    topic: String,
    events: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(producer: Arc<dyn Producer>, topic: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            producer,
            topic: topic.into(),
            events,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Publish in the background. Publishing is not retried; failures are
    /// logged and broadcast as `DispatchEvent::Failed`.
    pub fn dispatch(&self, request: RunJobRequest) -> JoinHandle<Result<(), DispatchError>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.publish(&request).await;
            let event = match &result {
                Ok(()) => {
                    info!(job_id = %request.id, topic = %this.topic, "run request published");
                    DispatchEvent::Published { job_id: request.id }
                }
                Err(err) => {
                    error!(job_id = %request.id, error = %err, "run request not published");
                    DispatchEvent::Failed {
                        job_id: request.id,
                        error: err.to_string(),
                    }
                }
            };
            // No subscribers is fine.
            let _ = this.events.send(event);
            result
        })
    }

    async fn publish(&self, request: &RunJobRequest) -> Result<(), DispatchError> {
        let payload = serde_json::to_vec(request)?;
        self.producer.publish(&self.topic, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{connector::Connector, message::WireConnector},
        testkit::RecordingProducer,
    };

    fn request(id: &str) -> RunJobRequest {
        RunJobRequest {
            id: id.into(),
            over_write: false,
            remain_source: true,
            source_conn: WireConnector::from(&Connector::internal("a")),
            dest_conn: WireConnector::from(&Connector::internal("b")),
            filter: Default::default(),
        }
    }

    #[tokio::test]
    async fn publishes_json_on_the_topic() {
        let producer = RecordingProducer::new();
        let dispatcher = Dispatcher::new(producer.clone(), "migration");
        let mut events = dispatcher.subscribe();

        dispatcher.dispatch(request("job-1")).await.unwrap().unwrap();

        let published = producer.published.lock().clone();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "migration");
        let decoded: RunJobRequest = serde_json::from_slice(&published[0].1).unwrap();
        assert_eq!(decoded, request("job-1"));
        assert_eq!(
            events.recv().await.unwrap(),
            DispatchEvent::Published { job_id: "job-1".into() }
        );
    }

    #[tokio::test]
    async fn publish_failure_is_observable() {
        let dispatcher = Dispatcher::new(RecordingProducer::failing(), "migration");
        let mut events = dispatcher.subscribe();

        let result = dispatcher.dispatch(request("job-2")).await.unwrap();
        assert!(matches!(result, Err(DispatchError::Publish(_))));
        assert!(matches!(
            events.recv().await.unwrap(),
            DispatchEvent::Failed { job_id, .. } if job_id == "job-2"
        ));
    }
}
