//! postbus: an in-process / inter-process / inter-node message-passing
//! fabric. Application components exchange typed messages through uniform
//! mailbox endpoints over four transports: an in-process queue, a
//! shared-memory queue, TCP streams and UDP multicast/broadcast groups. A
//! process-wide lookup service resolves logical addresses to live
//! mailboxes, synthesizing sender-side proxies for remote endpoints, and a
//! pooled allocator keeps the wire path allocation-free.

pub mod config;
pub mod error;
pub mod fabric;
pub mod msgmgr;
pub mod opm;
pub mod threadmgr;

pub use config::{
    DistributedMailboxConfig, FabricConfig, GroupMailboxConfig, MAX_MESSAGE_LENGTH,
};
pub use error::{Error, Result};
pub use fabric::Fabric;
pub use msgmgr::{
    DISCOVERY_MANAGER_MAILBOX_NAME, DISCOVERY_MESSAGE_ID, DiscoveryMessage, DiscoveryUpdate,
    DistributedMailbox, DistributedMailboxProxy, FunctionMessageFactory, GroupMailbox,
    GroupMailboxProxy, LocalMailbox, LocationType, Mailbox, MailboxAddress, MailboxHandle,
    MailboxLookupService, MailboxOwnerHandle, MailboxProcessor, MailboxType, Message,
    MessageBuffer, MessageCreator, MessageFactory, MessageHandler, MessageHandlerList,
    RedundantRole, TimerId, TimerMessage,
};
#[cfg(target_os = "linux")]
pub use msgmgr::{LocalSmMailbox, LocalSmMailboxProxy};
pub use opm::{GrowthMode, Opm, PoolId, PoolStats, Poolable, PooledObject, SyncObjectPool};
pub use threadmgr::{ThreadManager, WorkerFn, WorkerId};
