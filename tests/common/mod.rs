//! Shared fixtures for the fabric integration tests

use postbus::{Fabric, FabricConfig, MailboxAddress, Message, MessageBuffer};
use std::any::Any;
use std::sync::Arc;

pub const TEST_MESSAGE_ID: u16 = 0x0077;

/// Simple payload-bearing message used across the scenario tests.
#[derive(Debug)]
pub struct TestMessage {
    source: MailboxAddress,
    priority: u32,
    pub payload: String,
}

impl TestMessage {
    pub fn new(payload: &str) -> Self {
        Self {
            source: MailboxAddress::default(),
            priority: 0,
            payload: payload.to_string(),
        }
    }

    pub fn with_priority(payload: &str, priority: u32) -> Self {
        Self {
            source: MailboxAddress::default(),
            priority,
            payload: payload.to_string(),
        }
    }

    pub fn deserialize(buffer: &mut MessageBuffer) -> postbus::Result<Self> {
        Ok(Self {
            source: MailboxAddress::default(),
            priority: 0,
            payload: buffer.extract_str()?,
        })
    }
}

impl Message for TestMessage {
    fn message_id(&self) -> u16 {
        TEST_MESSAGE_ID
    }

    fn source_address(&self) -> &MailboxAddress {
        &self.source
    }

    fn set_source_address(&mut self, address: MailboxAddress) {
        self.source = address;
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn set_priority(&mut self, priority: u32) {
        self.priority = priority;
    }

    fn serialize(&self, buffer: &mut MessageBuffer) -> postbus::Result<()> {
        buffer.insert_str(&self.payload)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A fabric with the test message registered in its factory.
pub fn test_fabric(neid: &str) -> Arc<Fabric> {
    let config = FabricConfig { neid: neid.to_string(), ..Default::default() };
    let fabric = Fabric::new(config).expect("fabric construction");
    fabric.message_factory().register_creator(
        TEST_MESSAGE_ID,
        Arc::new(|buffer| TestMessage::deserialize(buffer).map(|m| Box::new(m) as _)),
    );
    fabric
}
