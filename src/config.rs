//! Fabric and per-mailbox configuration

use std::net::{Ipv4Addr, SocketAddrV4};

/// Upper bound on a single serialized message, across every transport.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Process-wide fabric configuration. Consumed once by [`Fabric::new`].
///
/// [`Fabric::new`]: crate::Fabric::new
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Network element id stamped into addresses originated by this process
    pub neid: String,
    /// Physical coordinates of this process
    pub shelf_number: u32,
    pub slot_number: u32,
    /// Depth of every mailbox's bounded local queue
    pub queue_depth: usize,
    /// Multicast group the discovery manager announces on
    pub discovery_group: SocketAddrV4,
    /// Initial capacity of the shared MessageBuffer pool
    pub buffer_pool_size: usize,
    /// Default per-mailbox trace flag; nonzero enables frame dumps
    pub debug_value: i32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            neid: String::from("ne-0"),
            shelf_number: 0,
            slot_number: 0,
            queue_depth: 1024,
            discovery_group: SocketAddrV4::new(Ipv4Addr::new(224, 9, 9, 9), 9909),
            buffer_pool_size: 32,
            debug_value: 0,
        }
    }
}

/// Options for a group (UDP) mailbox.
#[derive(Debug, Clone)]
pub struct GroupMailboxConfig {
    /// Loop multicast sends back to joiners on the same host. Enabled by
    /// default so co-located processes see each other's traffic.
    pub multicast_loopback_enabled: bool,
    /// Hop limit, 0..=255. Default 1 keeps traffic on the local segment.
    pub multicast_ttl: u32,
    /// Interface the group is joined/sent on
    pub interface: Ipv4Addr,
}

impl Default for GroupMailboxConfig {
    fn default() -> Self {
        Self {
            multicast_loopback_enabled: true,
            multicast_ttl: 1,
            interface: Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// Options for a distributed (TCP) mailbox.
#[derive(Debug, Clone)]
pub struct DistributedMailboxConfig {
    pub reuse_addr: bool,
    /// Timeout applied to proxy connect and send, in milliseconds
    pub io_timeout_ms: u64,
}

impl Default for DistributedMailboxConfig {
    fn default() -> Self {
        Self {
            reuse_addr: true,
            io_timeout_ms: 5_000,
        }
    }
}
