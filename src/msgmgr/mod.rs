//! Mailbox runtime: addressing, envelopes, transports and lookup

pub mod address;
pub mod buffer;
pub mod discovery;
pub mod distributed;
pub mod group;
pub mod handler;
pub mod local;
#[cfg(target_os = "linux")]
pub mod local_sm;
pub mod lookup;
pub mod mailbox;
pub mod message;
pub mod processor;

// Re-exports
pub use address::{LocationType, MailboxAddress, MailboxType, RedundantRole};
pub use buffer::MessageBuffer;
pub use discovery::DiscoveryManager;
pub use distributed::{DistributedMailbox, DistributedMailboxProxy};
pub use group::{GroupMailbox, GroupMailboxProxy};
pub use handler::{MessageHandler, MessageHandlerList};
pub use local::LocalMailbox;
#[cfg(target_os = "linux")]
pub use local_sm::{LocalSmMailbox, LocalSmMailboxProxy};
pub use lookup::{DISCOVERY_MANAGER_MAILBOX_NAME, MailboxLookupService};
pub use mailbox::{Mailbox, MailboxHandle, MailboxOwnerHandle, TimerId};
pub use message::{
    DISCOVERY_MESSAGE_ID, DiscoveryMessage, DiscoveryUpdate, FunctionMessageFactory, Message,
    MessageCreator, MessageFactory, TimerMessage,
};
pub use processor::MailboxProcessor;
