use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::fmt::{Debug, Formatter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::channel::{Channel, MessageType, Role, Target};
use crate::peer_addr::PeerAddr;

/// A message that was received, deduplicated and (for the ordered channel) brought into
///  sequence, and is now handed to the application
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InboundMessage {
    pub sender: PeerAddr,
    pub channel: Channel,
    pub target: Target,
    pub message_type: MessageType,
    /// the message's bytes after the message type tag
    pub payload: Bytes,
    /// the receiving side's role
    pub role: Role,
}

/// This is the interface through which received messages are passed to application code. It is
///  called from the receive loop, so implementations should return quickly: a slow dispatcher
///  delays the processing of all subsequent datagrams.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, message: InboundMessage);
}

/// Decouples the application from the receive loop by forwarding messages into a bounded queue.
///
/// If the queue is full, unreliable messages are dropped, while messages on reliable channels
///  wait for space. The frame was acknowledged before it is dispatched, so waiting is the only
///  way not to lose it; it stalls the receive loop until the application catches up, and
///  closing the socket abandons the wait.
pub struct QueueDispatcher {
    sender: mpsc::Sender<InboundMessage>,
}

impl QueueDispatcher {
    pub fn new(queue_size: usize) -> (QueueDispatcher, mpsc::Receiver<InboundMessage>) {
        let (sender, receiver) = mpsc::channel(queue_size);
        (QueueDispatcher { sender }, receiver)
    }
}

#[async_trait]
impl MessageDispatcher for QueueDispatcher {
    async fn on_message(&self, message: InboundMessage) {
        if message.channel.is_reliable() {
            if self.sender.send(message).await.is_err() {
                debug!("receive queue is closed - dropping message");
            }
            return;
        }

        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("receive queue is full - dropping unreliable message {:?} from {:?}", message.message_type, message.sender);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("receive queue is closed - dropping message");
            }
        }
    }
}

pub type MessageHandler = Box<dyn Fn(&InboundMessage) + Send + Sync>;

/// Dispatches received messages to handlers based on their [MessageType]. Handlers are registered
///  explicitly before the registry is passed to the transport, and there is at most one handler
///  per message type.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: FxHashMap<MessageType, MessageHandler>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut message_types = self.handlers.keys().collect::<Vec<_>>();
        message_types.sort();
        write!(f, "HandlerRegistry{{{:?}}}", message_types)
    }
}

impl HandlerRegistry {
    pub fn new() -> HandlerRegistry {
        Default::default()
    }

    pub fn register(&mut self, message_type: MessageType, handler: impl Fn(&InboundMessage) + Send + Sync + 'static) -> anyhow::Result<()> {
        if message_type.is_reserved() {
            bail!("message type {:?} is reserved for the transport", message_type);
        }

        match self.handlers.entry(message_type) {
            Entry::Occupied(_) => {
                Err(anyhow!("registering a second handler for message type {:?}", message_type))
            }
            Entry::Vacant(e) => {
                e.insert(Box::new(handler));
                Ok(())
            }
        }
    }

    pub fn is_registered(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }
}

#[async_trait]
impl MessageDispatcher for HandlerRegistry {
    async fn on_message(&self, message: InboundMessage) {
        match self.handlers.get(&message.message_type) {
            Some(handler) => {
                trace!("dispatching {:?} from {:?}", message.message_type, message.sender);
                handler(&message);
            }
            None => {
                debug!("no handler registered for {:?} - dropping message from {:?}", message.message_type, message.sender);
            }
        }
    }
}
