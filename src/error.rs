//! Fabric-wide error taxonomy

use crate::opm::PoolId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Null-equivalent or out-of-range argument (unknown address type,
    /// illegal ttl, zero worker count, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Lookup miss that the caller must handle (LOCAL find miss,
    /// deregister of an unknown address, unregistered message id)
    #[error("not found: {0}")]
    NotFound(String),

    /// Send/recv/accept failure that may succeed on retry. Proxies retry
    /// once with a reconnect before surfacing this.
    #[error("transient transport failure: {0}")]
    TransportTransient(String),

    /// Socket open/bind/join failure during activate. Partial state is
    /// rolled back before this is returned.
    #[error("fatal transport failure: {0}")]
    TransportFatal(String),

    /// Reserve on an empty NO_GROWTH pool, or a non-blocking reserve that
    /// lost the race for the pool lock
    #[error("pool {0} has no free objects")]
    PoolExhausted(PoolId),

    #[error("pool id {0} is not known to the object pool manager")]
    BadPoolId(PoolId),

    /// Release of an object that was never allocated through the manager
    #[error("object was not allocated from a pool")]
    NotPooled,

    #[error("object belongs to pool {actual}, not pool {expected}")]
    WrongPool { expected: PoolId, actual: PoolId },

    /// Bounded local queue rejected a zero-timeout post
    #[error("mailbox queue is full")]
    QueueFull,

    /// Post or privileged operation against a mailbox that is not
    /// REGISTERED_ACTIVE
    #[error("mailbox is not active")]
    Inactive,

    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// API misuse that is diagnosed and refused, never a panic: timers on a
    /// proxy, getMessage on a proxy, releasing through the wrong pool
    #[error("programmer error: {0}")]
    ProgrammerError(String),

    #[error("message buffer overflow: {needed} bytes needed, {available} available")]
    BufferOverflow { needed: usize, available: usize },

    #[error("message buffer underflow: {needed} bytes needed, {remaining} remaining")]
    BufferUnderflow { needed: usize, remaining: usize },

    #[error("codec failure: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
