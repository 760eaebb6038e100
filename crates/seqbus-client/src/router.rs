//! Delivery of decoded input events.
//!
//! Exactly one delivery strategy is active at a time, chosen by priority
//! whenever the configuration changes:
//!
//! 1. a registered callback handler,
//! 2. broadcast to every registered listener (when events are enabled and
//!    at least one listener exists),
//! 3. the single-subscriber channel returned by [`EventRouter::events`].

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use seqbus_event::SequencerEvent;
use smallvec::SmallVec;
use std::sync::Arc;

/// Callback invoked on the input pump thread for every event.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: SequencerEvent);
}

impl<F> EventHandler for F
where
    F: Fn(SequencerEvent) + Send + Sync,
{
    fn handle_event(&self, event: SequencerEvent) {
        self(event)
    }
}

/// A broadcast target. Each listener receives its own copy.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: SequencerEvent);
}

impl EventListener for Sender<SequencerEvent> {
    fn on_event(&self, event: SequencerEvent) {
        if self.try_send(event).is_err() {
            tracing::debug!("Listener channel full or closed, event dropped");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listeners = SmallVec<[Arc<dyn EventListener>; 4]>;

pub enum DeliveryStrategy {
    Callback(Arc<dyn EventHandler>),
    Broadcast(Listeners),
    SingleSubscriber(Sender<SequencerEvent>),
}

/// Which strategy handled an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Callback,
    /// Number of listeners reached.
    Broadcast(usize),
    /// `false` when the channel was full and the event was dropped.
    SingleSubscriber(bool),
}

struct RouterConfig {
    handler: Option<Arc<dyn EventHandler>>,
    listeners: Vec<(ListenerId, Arc<dyn EventListener>)>,
    events_enabled: bool,
    next_id: u64,
}

pub struct EventRouter {
    config: Mutex<RouterConfig>,
    strategy: ArcSwap<DeliveryStrategy>,
    sender: Sender<SequencerEvent>,
    receiver: Receiver<SequencerEvent>,
}

impl EventRouter {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            config: Mutex::new(RouterConfig {
                handler: None,
                listeners: Vec::new(),
                events_enabled: false,
                next_id: 0,
            }),
            strategy: ArcSwap::from_pointee(DeliveryStrategy::SingleSubscriber(sender.clone())),
            sender,
            receiver,
        }
    }

    // ==================== Configuration ====================

    pub fn set_handler(&self, handler: Arc<dyn EventHandler>) {
        self.update(|config| config.handler = Some(handler));
    }

    pub fn clear_handler(&self) {
        self.update(|config| config.handler = None);
    }

    pub fn has_handler(&self) -> bool {
        self.config.lock().handler.is_some()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> ListenerId {
        let mut id = ListenerId(0);
        self.update(|config| {
            id = ListenerId(config.next_id);
            config.next_id += 1;
            config.listeners.push((id, listener));
        });
        id
    }

    /// Returns `false` if no listener had this id.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.update(|config| {
            let before = config.listeners.len();
            config.listeners.retain(|(lid, _)| *lid != id);
            removed = config.listeners.len() != before;
        });
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.config.lock().listeners.len()
    }

    pub fn set_events_enabled(&self, enabled: bool) {
        self.update(|config| config.events_enabled = enabled);
    }

    pub fn events_enabled(&self) -> bool {
        self.config.lock().events_enabled
    }

    /// Receiving end of the single-subscriber channel.
    pub fn events(&self) -> Receiver<SequencerEvent> {
        self.receiver.clone()
    }

    /// The currently selected strategy.
    pub fn strategy(&self) -> Arc<DeliveryStrategy> {
        self.strategy.load_full()
    }

    fn update(&self, f: impl FnOnce(&mut RouterConfig)) {
        let mut config = self.config.lock();
        f(&mut config);
        let strategy = if let Some(handler) = &config.handler {
            DeliveryStrategy::Callback(Arc::clone(handler))
        } else if config.events_enabled && !config.listeners.is_empty() {
            DeliveryStrategy::Broadcast(
                config
                    .listeners
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect(),
            )
        } else {
            DeliveryStrategy::SingleSubscriber(self.sender.clone())
        };
        self.strategy.store(Arc::new(strategy));
    }

    // ==================== Dispatch ====================

    pub fn dispatch(&self, event: SequencerEvent) -> Delivery {
        let strategy = self.strategy.load();
        match &**strategy {
            DeliveryStrategy::Callback(handler) => {
                handler.handle_event(event);
                Delivery::Callback
            }
            DeliveryStrategy::Broadcast(listeners) => {
                if let Some((last, rest)) = listeners.split_last() {
                    for listener in rest {
                        listener.on_event(event.clone());
                    }
                    last.on_event(event);
                }
                Delivery::Broadcast(listeners.len())
            }
            DeliveryStrategy::SingleSubscriber(sender) => match sender.try_send(event) {
                Ok(()) => Delivery::SingleSubscriber(true),
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    tracing::debug!("Event channel full, dropping event");
                    Delivery::SingleSubscriber(false)
                }
            },
        }
    }
}
