//! Agent message router: named agents exchanging [`AgentMessage`]s over the bus.
//!
//! Every registered agent gets a publisher and a subscriber. Its
//! subscription accepts only command events named `agent_message` whose
//! target is the agent, converts them back to messages, and hands them to
//! the agent's handler. A message returned by the handler is sent on
//! automatically.
//!
//! `send_message` and `broadcast_message` never fail loudly: every failure
//! collapses to `false` / a lower count, with a `warn!` line.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Map;
use switchboard_types::config::RouterConfig;
use switchboard_types::event::{Event, EventType};
use switchboard_types::message::{AGENT_MESSAGE_EVENT, AGENT_MESSAGE_KEY, AgentMessage};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::directory::AgentDirectory;
use crate::filter::{CompositeFilter, NameFilter, TargetFilter, TypeFilter};
use crate::publisher::EventPublisher;
use crate::subscriber::EventSubscriber;
use crate::subscription::{EventHandler, HandlerError, SubscriptionOptions, handler_fn};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// What an agent handler produces: optionally a message to send on.
pub type AgentHandlerResult = Result<Option<AgentMessage>, HandlerError>;

/// Type-erased async agent message handler.
pub type AgentHandler =
    Arc<dyn Fn(AgentMessage) -> BoxFuture<'static, AgentHandlerResult> + Send + Sync>;

/// Box an async closure into an [`AgentHandler`].
pub fn agent_handler_fn<F, Fut>(f: F) -> AgentHandler
where
    F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AgentHandlerResult> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

/// Per-agent message counts derived from router history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMessageStats {
    pub agent_id: String,
    pub messages_sent: usize,
    pub messages_received: usize,
    pub is_registered: bool,
    pub active_conversations: usize,
}

// ---------------------------------------------------------------------------
// AgentRouter
// ---------------------------------------------------------------------------

pub struct AgentRouter {
    /// Handle given to subscription wrappers so replies can be re-sent.
    me: Weak<AgentRouter>,
    bus: Arc<EventBus>,
    config: RouterConfig,
    publishers: DashMap<String, EventPublisher>,
    subscribers: DashMap<String, Arc<EventSubscriber>>,
    handlers: DashMap<String, AgentHandler>,
    conversations: DashMap<String, Vec<AgentMessage>>,
    history: RwLock<VecDeque<AgentMessage>>,
    directory: Option<Arc<dyn AgentDirectory>>,
}

impl AgentRouter {
    pub fn new(bus: Arc<EventBus>, config: RouterConfig) -> Arc<Self> {
        Self::build(bus, config, None)
    }

    /// Router whose broadcasts resolve recipients through `directory`.
    pub fn with_directory(
        bus: Arc<EventBus>,
        config: RouterConfig,
        directory: Arc<dyn AgentDirectory>,
    ) -> Arc<Self> {
        Self::build(bus, config, Some(directory))
    }

    fn build(
        bus: Arc<EventBus>,
        config: RouterConfig,
        directory: Option<Arc<dyn AgentDirectory>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            config,
            publishers: DashMap::new(),
            subscribers: DashMap::new(),
            handlers: DashMap::new(),
            conversations: DashMap::new(),
            history: RwLock::new(VecDeque::new()),
            directory,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    // -- registration ------------------------------------------------------

    /// Register `agent_id` with `handler`. Re-registering replaces the
    /// previous handler and subscription.
    pub async fn register_agent(&self, agent_id: &str, handler: AgentHandler) -> bool {
        if agent_id.is_empty() {
            warn!("refusing to register agent with empty id");
            return false;
        }
        if self.is_registered(agent_id) {
            debug!(%agent_id, "replacing existing agent registration");
            self.unregister_agent(agent_id).await;
        }

        let publisher = EventPublisher::new(Arc::clone(&self.bus), agent_id);
        let subscriber = Arc::new(EventSubscriber::new(Arc::clone(&self.bus), agent_id));

        let filter = CompositeFilter::all()
            .with(TypeFilter::new([EventType::Command]))
            .with(NameFilter::new([AGENT_MESSAGE_EVENT]))
            .with(TargetFilter::new([agent_id]));
        let wrapper = self.delivery_wrapper(agent_id, Arc::clone(&handler));

        if let Err(err) = subscriber
            .subscribe(Arc::new(filter), wrapper, SubscriptionOptions::default())
            .await
        {
            warn!(%agent_id, error = %err, "agent registration failed");
            return false;
        }

        self.publishers.insert(agent_id.to_string(), publisher);
        self.subscribers.insert(agent_id.to_string(), subscriber);
        self.handlers.insert(agent_id.to_string(), handler);
        info!(%agent_id, "registered agent");
        true
    }

    /// Event handler that decodes the message, runs the agent handler and
    /// forwards its reply.
    fn delivery_wrapper(&self, agent_id: &str, handler: AgentHandler) -> EventHandler {
        let me = self.me.clone();
        let agent_id = agent_id.to_string();
        handler_fn(move |event: Event| {
            let me = me.clone();
            let handler = Arc::clone(&handler);
            let agent_id = agent_id.clone();
            async move {
                let message = AgentMessage::from_event(&event)
                    .map_err(|err| HandlerError::new(err.to_string()))?;
                debug!(%agent_id, message_id = %message.message_id, "delivering agent message");

                if let Some(reply) = handler(message).await?
                    && let Some(router) = me.upgrade()
                    && !router.send_message(reply).await
                {
                    warn!(%agent_id, "reply from agent handler was not sent");
                }
                Ok(None)
            }
        })
    }

    /// Remove an agent and close its subscriptions. Returns `false` if unknown.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        self.publishers.remove(agent_id);
        self.handlers.remove(agent_id);
        let Some((_, subscriber)) = self.subscribers.remove(agent_id) else {
            return false;
        };
        subscriber.close().await;
        info!(%agent_id, "unregistered agent");
        true
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.publishers.contains_key(agent_id)
    }

    /// Registered agent ids, sorted.
    pub fn registered_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.publishers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // -- messaging ---------------------------------------------------------

    /// Send a message from a registered agent.
    ///
    /// Returns `false` without touching history when either id is empty or
    /// the sender is not registered, and `false` after recording when the
    /// bus refuses the event.
    pub async fn send_message(&self, message: AgentMessage) -> bool {
        if message.sender_id.is_empty() || message.receiver_id.is_empty() {
            warn!(message_id = %message.message_id, "message rejected: sender or receiver missing");
            return false;
        }
        let Some(publisher) = self.publishers.get(&message.sender_id).map(|p| p.value().clone()) else {
            warn!(
                sender_id = %message.sender_id,
                message_id = %message.message_id,
                "message rejected: sender not registered"
            );
            return false;
        };

        self.record(&message).await;

        let event = match Self::message_to_event(&message) {
            Ok(event) => event,
            Err(err) => {
                warn!(message_id = %message.message_id, error = %err, "message could not be encoded");
                return false;
            }
        };
        match publisher.publish(event).await {
            Ok(event_id) => {
                debug!(
                    %event_id,
                    message_id = %message.message_id,
                    sender_id = %message.sender_id,
                    receiver_id = %message.receiver_id,
                    "message sent"
                );
                true
            }
            Err(err) => {
                warn!(message_id = %message.message_id, error = %err, "message publish failed");
                false
            }
        }
    }

    /// Send a copy of `message` to every recipient except its sender.
    ///
    /// Recipients come from the agent directory (active agents, narrowed to
    /// `agent_category`) or, without a directory, every registered agent.
    /// Returns the number of copies sent.
    pub async fn broadcast_message(&self, message: &AgentMessage, agent_category: Option<&str>) -> usize {
        let recipients = match &self.directory {
            Some(directory) => directory.active_agent_ids(agent_category),
            None => self.registered_agents(),
        };

        let mut sent = 0;
        for recipient in recipients {
            if recipient == message.sender_id {
                continue;
            }
            if self.send_message(message.with_receiver(recipient)).await {
                sent += 1;
            }
        }
        debug!(sender_id = %message.sender_id, sent, "broadcast complete");
        sent
    }

    async fn record(&self, message: &AgentMessage) {
        {
            let mut history = self.history.write().await;
            history.push_back(message.clone());
            if let Some(limit) = self.config.history_limit {
                while history.len() > limit {
                    history.pop_front();
                }
            }
        }
        if let Some(correlation_id) = &message.correlation_id {
            self.conversations
                .entry(correlation_id.clone())
                .or_default()
                .push(message.clone());
        }
    }

    /// Wrap a message in an `agent_message` command event addressed to its receiver.
    fn message_to_event(message: &AgentMessage) -> Result<Event, serde_json::Error> {
        let envelope = serde_json::to_value(message)?;
        let correlation_id = message
            .correlation_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Ok(Event::command(AGENT_MESSAGE_EVENT, Map::new())
            .with_extension(AGENT_MESSAGE_KEY, envelope)
            .with_source(message.sender_id.as_str())
            .with_target(message.receiver_id.as_str())
            .with_priority(message.priority)
            .with_conversation_id(correlation_id.as_str())
            .with_correlation_id(correlation_id))
    }

    // -- inspection --------------------------------------------------------

    /// Messages recorded under `correlation_id`, in send order.
    pub fn get_conversation_history(&self, correlation_id: &str) -> Vec<AgentMessage> {
        self.conversations
            .get(correlation_id)
            .map(|messages| messages.value().clone())
            .unwrap_or_default()
    }

    pub async fn message_history(&self) -> Vec<AgentMessage> {
        self.history.read().await.iter().cloned().collect()
    }

    pub async fn get_agent_message_stats(&self, agent_id: &str) -> AgentMessageStats {
        let (messages_sent, messages_received) = {
            let history = self.history.read().await;
            (
                history.iter().filter(|m| m.sender_id == agent_id).count(),
                history.iter().filter(|m| m.receiver_id == agent_id).count(),
            )
        };
        let active_conversations = self
            .conversations
            .iter()
            .filter(|entry| entry.value().iter().any(|m| m.involves(agent_id)))
            .count();

        AgentMessageStats {
            agent_id: agent_id.to_string(),
            messages_sent,
            messages_received,
            is_registered: self.is_registered(agent_id),
            active_conversations,
        }
    }

    /// Close every agent's subscriber and forget all state. In-flight
    /// deliveries are not cancelled.
    pub async fn shutdown(&self) {
        let subscribers: Vec<Arc<EventSubscriber>> =
            self.subscribers.iter().map(|e| Arc::clone(e.value())).collect();
        for subscriber in &subscribers {
            subscriber.close().await;
        }
        self.subscribers.clear();
        self.publishers.clear();
        self.handlers.clear();
        self.conversations.clear();
        self.history.write().await.clear();
        info!(agents = subscribers.len(), "router shut down");
    }
}

impl std::fmt::Debug for AgentRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRouter")
            .field("agents", &self.publishers.len())
            .field("conversations", &self.conversations.len())
            .finish()
    }
}
