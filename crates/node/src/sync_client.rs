//! Synchronous client node: every request is a literal blocking round trip
//! over a stateless endpoint. Server-pushed events are not deliverable
//! out-of-band, so each observation channel runs its own poll task governed
//! by the configured [`PushStrategy`].

use std::sync::Arc;
use std::time::Duration;

use cardlink_protocol::{Action, Message};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::endpoint::SyncEndpointClient;
use crate::observer::EventObserver;
use crate::push::{EventChannel, PushStrategy};
use crate::session::{new_session_id, SessionRegistry};
use crate::{check_reply, require_session_id, NodeError, Result};

/// Spacing between retries when a poll round trip fails outright.
const POLL_FAILURE_BACKOFF: Duration = Duration::from_secs(1);

pub struct SyncClientNode {
    node_id: String,
    endpoint: Arc<dyn SyncEndpointClient>,
    sessions: SessionRegistry,
    observer: Option<Arc<dyn EventObserver>>,
    plugin_strategy: Option<PushStrategy>,
    reader_strategy: Option<PushStrategy>,
    plugin_poll: Mutex<Option<CancellationToken>>,
    reader_poll: Mutex<Option<CancellationToken>>,
}

impl SyncClientNode {
    pub(crate) fn new(
        endpoint: Arc<dyn SyncEndpointClient>,
        observer: Option<Arc<dyn EventObserver>>,
        plugin_strategy: Option<PushStrategy>,
        reader_strategy: Option<PushStrategy>,
    ) -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            endpoint,
            sessions: SessionRegistry::new(),
            observer,
            plugin_strategy,
            reader_strategy,
            plugin_poll: Mutex::new(None),
            reader_poll: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Blocking round trip. The reply is the single envelope paired with
    /// this request; an `ERROR` reply is surfaced as
    /// [`NodeError::Remote`], never returned as a result.
    pub async fn send_request(&self, message: Message) -> Result<Message> {
        let session_id = require_session_id(&message)?;
        self.sessions.begin_request(&session_id)?;
        let result = self.transmit_request(message).await;
        self.sessions.end_request(&session_id);
        result
    }

    async fn transmit_request(&self, mut message: Message) -> Result<Message> {
        message.client_node_id = Some(self.node_id.clone());
        let mut replies = self
            .endpoint
            .transmit(message)
            .await
            .map_err(NodeError::Endpoint)?;
        if replies.len() != 1 {
            return Err(NodeError::Endpoint(anyhow::anyhow!(
                "expected one reply envelope, got {}",
                replies.len()
            )));
        }
        check_reply(replies.remove(0))
    }

    /// Fire-and-forget notification. Delivery failure is reported to the
    /// caller but never retried.
    pub async fn send_message(&self, mut message: Message) -> Result<()> {
        message.client_node_id = Some(self.node_id.clone());
        let replies = self
            .endpoint
            .transmit(message)
            .await
            .map_err(NodeError::Endpoint)?;
        if !replies.is_empty() {
            tracing::debug!(count = replies.len(), "discarding replies to a one-way message");
        }
        Ok(())
    }

    pub fn open_session(&self, session_id: &str) -> Result<()> {
        self.sessions.open(session_id)
    }

    pub fn close_session_silently(&self, session_id: &str) {
        self.sessions.close_silently(session_id);
    }

    pub fn open_global_session(&self) -> String {
        self.sessions.open_global()
    }

    pub fn global_session(&self) -> Option<String> {
        self.sessions.global()
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Starts the plugin-event poll loop and announces the observation to
    /// the server. Idempotent.
    pub async fn start_plugin_observation(&self) -> Result<()> {
        self.start_observation(EventChannel::Plugin).await
    }

    /// Stops the plugin-event poll loop and notifies the server. Idempotent.
    pub async fn stop_plugin_observation(&self) {
        self.stop_observation(EventChannel::Plugin).await;
    }

    /// Starts the reader-event poll loop. Idempotent. Reader-level
    /// observation has no wire announcement; the server buffers reader
    /// events per binding.
    pub async fn start_reader_observation(&self) -> Result<()> {
        self.start_observation(EventChannel::Reader).await
    }

    pub async fn stop_reader_observation(&self) {
        self.stop_observation(EventChannel::Reader).await;
    }

    fn strategy(&self, channel: EventChannel) -> Option<PushStrategy> {
        match channel {
            EventChannel::Plugin => self.plugin_strategy,
            EventChannel::Reader => self.reader_strategy,
        }
    }

    fn poll_slot(&self, channel: EventChannel) -> &Mutex<Option<CancellationToken>> {
        match channel {
            EventChannel::Plugin => &self.plugin_poll,
            EventChannel::Reader => &self.reader_poll,
        }
    }

    async fn start_observation(&self, channel: EventChannel) -> Result<()> {
        let strategy = self
            .strategy(channel)
            .ok_or(NodeError::ObservationNotConfigured(channel.name()))?;
        let observer = self
            .observer
            .clone()
            .ok_or(NodeError::ObservationNotConfigured(channel.name()))?;
        let token = CancellationToken::new();
        {
            let mut slot = self.poll_slot(channel).lock();
            if slot.is_some() {
                return Ok(());
            }
            *slot = Some(token.clone());
        }
        if channel == EventChannel::Plugin {
            let notice =
                Message::new(Action::StartPluginsObservation).with_session_id(new_session_id());
            if let Err(error) = self.send_message(notice).await {
                tracing::warn!(error = %error, "failed to announce plugin observation start");
            }
        }
        self.spawn_poll_loop(channel, strategy, observer, token);
        Ok(())
    }

    async fn stop_observation(&self, channel: EventChannel) {
        let token = self.poll_slot(channel).lock().take();
        let Some(token) = token else { return };
        token.cancel();
        if channel == EventChannel::Plugin {
            let notice =
                Message::new(Action::StopPluginsObservation).with_session_id(new_session_id());
            if let Err(error) = self.send_message(notice).await {
                tracing::warn!(error = %error, "failed to announce plugin observation stop");
            }
        }
    }

    fn spawn_poll_loop(
        &self,
        channel: EventChannel,
        strategy: PushStrategy,
        observer: Arc<dyn EventObserver>,
        token: CancellationToken,
    ) {
        let endpoint = Arc::clone(&self.endpoint);
        let node_id = self.node_id.clone();
        tokio::spawn(async move {
            tracing::debug!(channel = channel.name(), "event poll loop started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                let request = Message::new(channel.action())
                    .with_session_id(new_session_id())
                    .with_client_node_id(node_id.clone())
                    .with_body(strategy.encode_body());
                let outcome = tokio::select! {
                    _ = token.cancelled() => break,
                    outcome = endpoint.transmit(request) => outcome,
                };
                match outcome {
                    Ok(events) => {
                        for event in events {
                            if event.action == channel.action() {
                                let body = event.body.as_deref().unwrap_or("");
                                match channel {
                                    EventChannel::Plugin => observer.on_plugin_event(body),
                                    EventChannel::Reader => observer.on_reader_event(body),
                                }
                            } else {
                                tracing::warn!(
                                    envelope = ?event,
                                    "unexpected envelope in a poll reply"
                                );
                            }
                        }
                    }
                    Err(error) => {
                        tracing::warn!(
                            channel = channel.name(),
                            error = %error,
                            "event poll failed"
                        );
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = tokio::time::sleep(POLL_FAILURE_BACKOFF) => {}
                        }
                        continue;
                    }
                }
                if let PushStrategy::Polling { interval } = strategy {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
            tracing::debug!(channel = channel.name(), "event poll loop stopped");
        });
    }
}
