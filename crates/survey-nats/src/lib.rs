//! Survey transport over NATS request-reply.
//!
//! Each node answers surveys on its own subject (`<prefix>.survey.<node_id>`),
//! so delivery stays strictly addressed. `NoResponders` from the NATS layer
//! maps to `NoSuchNode`, which is how callers learn a lease names a dead node.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::Client;
use async_trait::async_trait;
use futures::StreamExt;
use relay_survey::{
    SurveyError, SurveyHandler, SurveyRequest, SurveyResponse, SurveyTransport,
};
use relay_types::NodeId;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Configuration for the `NatsSurveyTransport`.
#[derive(Clone, Debug)]
pub struct NatsSurveyTransportConfig {
    /// The NATS client to use.
    pub client: Client,

    /// Subject prefix; surveys travel on `<prefix>.survey.<node_id>`.
    pub subject_prefix: String,
}

/// A survey transport implemented over NATS request-reply.
#[derive(Clone)]
pub struct NatsSurveyTransport {
    client: Client,
    subject_prefix: String,
    shutdown_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl NatsSurveyTransport {
    /// Creates a new `NatsSurveyTransport`.
    #[must_use]
    pub fn new(
        NatsSurveyTransportConfig {
            client,
            subject_prefix,
        }: NatsSurveyTransportConfig,
    ) -> Self {
        Self {
            client,
            subject_prefix,
            shutdown_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        }
    }

    fn subject_for(&self, node_id: &NodeId) -> String {
        format!("{}.survey.{}", self.subject_prefix, node_id)
    }

    /// Stops answering surveys and waits for responder tasks to unwind.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }
}

#[async_trait]
impl SurveyTransport for NatsSurveyTransport {
    type Error = Error;

    async fn survey(
        &self,
        target: &NodeId,
        request: SurveyRequest,
        timeout: Duration,
    ) -> Result<SurveyResponse, SurveyError<Error>> {
        let subject = self.subject_for(target);
        let body = serde_json::to_vec(&request)
            .map_err(|e| SurveyError::Transport(Error::Body(e)))?;

        let request_future = self.client.request(subject, body.into());
        let message = match tokio::time::timeout(timeout, request_future).await {
            Ok(Ok(message)) => message,
            Ok(Err(request_err)) => {
                return Err(match request_err.kind() {
                    RequestErrorKind::NoResponders => SurveyError::NoSuchNode(target.clone()),
                    RequestErrorKind::TimedOut => SurveyError::Timeout(target.clone()),
                    _ => SurveyError::Transport(Error::Request(request_err)),
                });
            }
            Err(_) => return Err(SurveyError::Timeout(target.clone())),
        };

        serde_json::from_slice(&message.payload)
            .map_err(|e| SurveyError::Transport(Error::Body(e)))
    }

    async fn bind(
        &self,
        node_id: NodeId,
        handler: Arc<dyn SurveyHandler>,
    ) -> Result<(), Error> {
        let subject = self.subject_for(&node_id);
        let mut subscriber = self.client.subscribe(subject.clone()).await?;

        let client = self.client.clone();
        let shutdown_token = self.shutdown_token.clone();

        self.task_tracker.spawn(async move {
            info!(%node_id, %subject, "answering surveys");

            loop {
                let message = tokio::select! {
                    () = shutdown_token.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };

                let request: SurveyRequest = match serde_json::from_slice(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(%node_id, error = %e, "discarding malformed survey");
                        continue;
                    }
                };

                let response = handler.handle(request).await;

                if let Some(reply) = message.reply {
                    match serde_json::to_vec(&response) {
                        Ok(body) => {
                            if let Err(e) = client.publish(reply, body.into()).await {
                                warn!(%node_id, error = %e, "failed to publish survey reply");
                            }
                        }
                        Err(e) => warn!(%node_id, error = %e, "failed to encode survey reply"),
                    }
                } else {
                    debug!(%node_id, "survey arrived without a reply subject");
                }
            }

            info!(%node_id, "stopped answering surveys");
        });

        Ok(())
    }
}
