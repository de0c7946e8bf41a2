//! Message envelope contract, timer and discovery messages, factory seam

use crate::error::{Error, Result};
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::buffer::MessageBuffer;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Message id reserved for discovery announcements.
pub const DISCOVERY_MESSAGE_ID: u16 = 0xFF01;

/// Envelope contract every fabric message implements.
///
/// `serialize` writes the body only; transports frame it with the message
/// id and the optional priority tail. A deserializer registered with the
/// [`MessageFactory`] must consume exactly the bytes `serialize` wrote.
/// Disposal is `Drop`: pooled payloads travel inside their pool guards and
/// return to the pool when the box goes away.
pub trait Message: Send + fmt::Debug {
    fn message_id(&self) -> u16;

    fn source_address(&self) -> &MailboxAddress;

    fn set_source_address(&mut self, address: MailboxAddress);

    /// Nonzero priorities ride a trailing u32 on the wire
    fn priority(&self) -> u32 {
        0
    }

    fn set_priority(&mut self, _priority: u32) {}

    fn version(&self) -> u8 {
        0
    }

    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Rebuilds a typed message from a wire buffer positioned at the message
/// id. The fabric core depends only on this signature.
pub trait MessageFactory: Send + Sync {
    fn recreate_message_from_buffer(&self, buffer: &mut MessageBuffer) -> Result<Box<dyn Message>>;
}

pub type MessageCreator =
    Arc<dyn Fn(&mut MessageBuffer) -> Result<Box<dyn Message>> + Send + Sync>;

/// Id-keyed registry of creator closures; the crate's stock
/// [`MessageFactory`]. The discovery creator is pre-registered.
pub struct FunctionMessageFactory {
    creators: RwLock<HashMap<u16, MessageCreator>>,
}

impl FunctionMessageFactory {
    pub fn new() -> Arc<Self> {
        let factory = Self { creators: RwLock::new(HashMap::new()) };
        factory.register_creator(
            DISCOVERY_MESSAGE_ID,
            Arc::new(|buffer| DiscoveryMessage::deserialize(buffer).map(|m| Box::new(m) as _)),
        );
        Arc::new(factory)
    }

    /// Register a creator for one message id, replacing any previous one.
    pub fn register_creator(&self, message_id: u16, creator: MessageCreator) {
        let replaced = self
            .creators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_id, creator);
        if replaced.is_some() {
            warn!("message creator for id {:#06x} replaced", message_id);
        }
    }

    pub fn remove_creator(&self, message_id: u16) -> bool {
        self.creators
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&message_id)
            .is_some()
    }
}

impl MessageFactory for FunctionMessageFactory {
    fn recreate_message_from_buffer(&self, buffer: &mut MessageBuffer) -> Result<Box<dyn Message>> {
        let message_id = buffer.extract_u16()?;
        let creator = self
            .creators
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&message_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no creator for message id {message_id:#06x}")))?;
        creator(buffer)
    }
}

/// Message a mailbox's timer reactor posts back into its own queue on
/// expiry. Never crosses a transport.
#[derive(Debug, Clone)]
pub struct TimerMessage {
    message_id: u16,
    source_address: MailboxAddress,
    timeout: Duration,
    restart_interval: Duration,
    reusable: bool,
    timer_id: u64,
}

impl TimerMessage {
    /// A timer with a nonzero `restart_interval` is reusable: it keeps
    /// firing on that interval until cancelled or its interval is reset to
    /// zero.
    pub fn new(message_id: u16, timeout: Duration, restart_interval: Duration) -> Self {
        Self {
            message_id,
            source_address: MailboxAddress::default(),
            timeout,
            restart_interval,
            reusable: !restart_interval.is_zero(),
            timer_id: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn restart_interval(&self) -> Duration {
        self.restart_interval
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    /// Id assigned by `schedule_timer`; 0 before scheduling.
    pub fn timer_id(&self) -> u64 {
        self.timer_id
    }

    pub(crate) fn stamp(&mut self, timer_id: u64, owner: MailboxAddress) {
        self.timer_id = timer_id;
        self.source_address = owner;
    }
}

impl Message for TimerMessage {
    fn message_id(&self) -> u16 {
        self.message_id
    }

    fn source_address(&self) -> &MailboxAddress {
        &self.source_address
    }

    fn set_source_address(&mut self, address: MailboxAddress) {
        self.source_address = address;
    }

    fn serialize(&self, _buffer: &mut MessageBuffer) -> Result<()> {
        Err(Error::ProgrammerError(
            "timer messages are local to their mailbox and cannot be serialized".into(),
        ))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryUpdate {
    Added,
    Removed,
}

#[derive(Serialize, Deserialize)]
struct DiscoveryPayload {
    update: DiscoveryUpdate,
    addresses: Vec<MailboxAddress>,
}

/// Announcement of mailbox addresses appearing or disappearing somewhere
/// on the fabric. Carried over the discovery group channel and re-posted
/// to matching subscribers.
#[derive(Debug, Clone)]
pub struct DiscoveryMessage {
    source_address: MailboxAddress,
    update: DiscoveryUpdate,
    addresses: Vec<MailboxAddress>,
}

impl DiscoveryMessage {
    pub fn new(update: DiscoveryUpdate, addresses: Vec<MailboxAddress>) -> Self {
        Self {
            source_address: MailboxAddress::default(),
            update,
            addresses,
        }
    }

    pub fn update(&self) -> DiscoveryUpdate {
        self.update
    }

    pub fn addresses(&self) -> &[MailboxAddress] {
        &self.addresses
    }

    fn deserialize(buffer: &mut MessageBuffer) -> Result<Self> {
        let len = buffer.extract_u16()? as usize;
        let bytes = buffer.extract_raw(len)?;
        let payload: DiscoveryPayload = postcard::from_bytes(&bytes)?;
        Ok(Self {
            source_address: MailboxAddress::default(),
            update: payload.update,
            addresses: payload.addresses,
        })
    }
}

impl Message for DiscoveryMessage {
    fn message_id(&self) -> u16 {
        DISCOVERY_MESSAGE_ID
    }

    fn source_address(&self) -> &MailboxAddress {
        &self.source_address
    }

    fn set_source_address(&mut self, address: MailboxAddress) {
        self.source_address = address;
    }

    fn serialize(&self, buffer: &mut MessageBuffer) -> Result<()> {
        let payload = DiscoveryPayload {
            update: self.update,
            addresses: self.addresses.clone(),
        };
        let bytes = postcard::to_allocvec(&payload)?;
        if bytes.len() > u16::MAX as usize {
            return Err(Error::Codec("discovery payload too large".into()));
        }
        buffer.insert_u16(bytes.len() as u16)?;
        buffer.insert_raw(&bytes)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn discovery_message_round_trips_through_the_factory() {
        let factory = FunctionMessageFactory::new();
        let addr = MailboxAddress::distributed(
            "alarm",
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7777),
        );
        let msg = DiscoveryMessage::new(DiscoveryUpdate::Added, vec![addr.clone()]);

        let mut buffer = MessageBuffer::new(true);
        buffer.insert_u16(msg.message_id()).unwrap();
        msg.serialize(&mut buffer).unwrap();

        let rebuilt = factory.recreate_message_from_buffer(&mut buffer).unwrap();
        let rebuilt = rebuilt
            .as_any()
            .downcast_ref::<DiscoveryMessage>()
            .unwrap();
        assert_eq!(rebuilt.update(), DiscoveryUpdate::Added);
        assert_eq!(rebuilt.addresses(), &[addr]);
    }

    #[test]
    fn unknown_message_id_is_not_found() {
        let factory = FunctionMessageFactory::new();
        let mut buffer = MessageBuffer::new(true);
        buffer.insert_u16(0x0042).unwrap();
        assert!(matches!(
            factory.recreate_message_from_buffer(&mut buffer),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn timer_message_refuses_serialization() {
        let timer = TimerMessage::new(9, Duration::from_millis(100), Duration::ZERO);
        assert!(!timer.is_reusable());
        let mut buffer = MessageBuffer::new(true);
        assert!(matches!(
            timer.serialize(&mut buffer),
            Err(Error::ProgrammerError(_))
        ));
    }
}
