//! Input Dispatch
//!
//! Typed subscriptions for the discrete input events the session layer
//! cares about. Raw device capture lives in the embedding application; it
//! feeds [`InputEvent`]s into [`InputDispatcher::dispatch`].
//!
//! The active [`CapabilitySet`] gates delivery: while paused only pause
//! toggles get through, so gameplay handlers never see input meant for the
//! pause menu.

use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// A discrete input event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    /// Jump pressed.
    Jump,
    /// Interact pressed.
    Interact,
    /// Pause toggled to the given value.
    Pause(bool),
    /// Scroll wheel delta.
    Scroll(f32),
}

/// Event kind, for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InputKind {
    /// [`InputEvent::Jump`]
    Jump,
    /// [`InputEvent::Interact`]
    Interact,
    /// [`InputEvent::Pause`]
    Pause,
    /// [`InputEvent::Scroll`]
    Scroll,
}

impl InputEvent {
    /// Kind of this event.
    pub fn kind(&self) -> InputKind {
        match self {
            InputEvent::Jump => InputKind::Jump,
            InputEvent::Interact => InputKind::Interact,
            InputEvent::Pause(_) => InputKind::Pause,
            InputEvent::Scroll(_) => InputKind::Scroll,
        }
    }
}

/// Which input kinds are currently delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilitySet {
    /// Movement and interaction.
    #[default]
    Gameplay,
    /// Pause menu only.
    PauseOnly,
}

impl CapabilitySet {
    /// Whether `kind` is delivered under this set.
    pub fn allows(self, kind: InputKind) -> bool {
        match self {
            CapabilitySet::Gameplay => true,
            CapabilitySet::PauseOnly => kind == InputKind::Pause,
        }
    }
}

/// Handle returned by [`InputDispatcher::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(InputEvent) + Send>;

struct Subscription {
    kind: InputKind,
    handler: Handler,
}

/// Routes input events to typed subscribers.
#[derive(Default)]
pub struct InputDispatcher {
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    next_id: u64,
    capabilities: CapabilitySet,
}

impl fmt::Debug for InputDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputDispatcher")
            .field("subscriptions", &self.subscriptions.len())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

impl InputDispatcher {
    /// Dispatcher with no subscribers and gameplay input enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&mut self, kind: InputKind, handler: impl FnMut(InputEvent) + Send + 'static) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.subscriptions.insert(id, Subscription { kind, handler: Box::new(handler) });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Remove every subscription (teardown).
    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Active capability set.
    pub fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    /// Swap the active capability set.
    pub fn set_capabilities(&mut self, capabilities: CapabilitySet) {
        if self.capabilities != capabilities {
            debug!("Input capabilities -> {:?}", capabilities);
            self.capabilities = capabilities;
        }
    }

    /// Deliver `event` to matching subscribers, in subscription order.
    /// Returns how many handlers ran.
    pub fn dispatch(&mut self, event: InputEvent) -> usize {
        let kind = event.kind();
        if !self.capabilities.allows(kind) {
            return 0;
        }

        let mut delivered = 0;
        for sub in self.subscriptions.values_mut().filter(|s| s.kind == kind) {
            (sub.handler)(event);
            delivered += 1;
        }
        delivered
    }
}
