//! Dispatch table mapping message ids to handler functors

use crate::msgmgr::message::Message;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// Handler functor: one message in, an application status code out.
pub type MessageHandler = Arc<dyn Fn(&dyn Message) -> i32 + Send + Sync>;

/// Thread-safe message-id → handler mapping.
///
/// Lookups for unregistered ids resolve to the current default handler;
/// the built-in default logs the stray message and returns 0.
pub struct MessageHandlerList {
    handlers: RwLock<HashMap<u16, MessageHandler>>,
    default_handler: MessageHandler,
    current_default: RwLock<MessageHandler>,
}

impl MessageHandlerList {
    pub fn new() -> Arc<Self> {
        let default_handler: MessageHandler = Arc::new(|message: &dyn Message| {
            warn!(
                "no handler registered for message id {:#06x} from {}",
                message.message_id(),
                message.source_address()
            );
            0
        });
        Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            default_handler: Arc::clone(&default_handler),
            current_default: RwLock::new(default_handler),
        })
    }

    /// Register a handler. Returns false (and keeps the incumbent) when the
    /// id already has one.
    pub fn add(&self, message_id: u16, handler: MessageHandler) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&message_id) {
            warn!("handler for message id {:#06x} already registered", message_id);
            return false;
        }
        handlers.insert(message_id, handler);
        true
    }

    pub fn remove(&self, message_id: u16) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id)
            .is_some()
    }

    /// Handler for this id, or the current default.
    pub fn find(&self, message_id: u16) -> MessageHandler {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        match handlers.get(&message_id) {
            Some(handler) => Arc::clone(handler),
            None => Arc::clone(&self.current_default.read().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Replace the default handler used for unregistered ids.
    pub fn set_default(&self, handler: MessageHandler) {
        *self.current_default.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    /// Put the built-in logging default back.
    pub fn restore_default(&self) {
        *self.current_default.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::clone(&self.default_handler);
    }

    /// Registered message ids, sorted.
    pub fn list(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}
