//! Mailbox addressing: the routing key for every endpoint in the fabric

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddrV4;

/// Which transport a mailbox lives behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub enum LocationType {
    /// In-process bounded queue
    Local,
    /// TCP stream endpoint on some host
    Distributed,
    /// Shared-memory queue between processes on one host
    LocalSharedMemory,
    /// UDP multicast or broadcast group
    Group,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MailboxType {
    Physical,
    #[default]
    Logical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RedundantRole {
    Active,
    Standby,
    #[default]
    None,
}

/// Routing key for a mailbox.
///
/// Identity (equality, ordering, hashing) is lexicographic over
/// (location type, mailbox name, endpoint, neid); the physical coordinates,
/// mailbox type and redundancy role are descriptive only. Within one
/// process a LOCAL mailbox and a remote mailbox must not share a name: the
/// lookup service registers a local-equivalent alias under every non-proxy
/// remote name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MailboxAddress {
    pub location_type: LocationType,
    pub mailbox_name: String,
    /// IPv4 endpoint; meaningful for Distributed and Group addresses
    pub endpoint: Option<SocketAddrV4>,
    /// Network element id
    pub neid: String,
    pub shelf_number: u32,
    pub slot_number: u32,
    pub mailbox_type: MailboxType,
    pub redundant_role: RedundantRole,
}

impl MailboxAddress {
    pub fn local(mailbox_name: &str) -> Self {
        Self {
            location_type: LocationType::Local,
            mailbox_name: mailbox_name.to_string(),
            ..Default::default()
        }
    }

    pub fn distributed(mailbox_name: &str, endpoint: SocketAddrV4) -> Self {
        Self {
            location_type: LocationType::Distributed,
            mailbox_name: mailbox_name.to_string(),
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    pub fn group(mailbox_name: &str, endpoint: SocketAddrV4) -> Self {
        Self {
            location_type: LocationType::Group,
            mailbox_name: mailbox_name.to_string(),
            endpoint: Some(endpoint),
            ..Default::default()
        }
    }

    pub fn shared_memory(mailbox_name: &str) -> Self {
        Self {
            location_type: LocationType::LocalSharedMemory,
            mailbox_name: mailbox_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_neid(mut self, neid: &str) -> Self {
        self.neid = neid.to_string();
        self
    }

    pub fn with_physical_location(mut self, shelf: u32, slot: u32) -> Self {
        self.shelf_number = shelf;
        self.slot_number = slot;
        self.mailbox_type = MailboxType::Physical;
        self
    }

    pub fn with_redundant_role(mut self, role: RedundantRole) -> Self {
        self.redundant_role = role;
        self
    }

    /// The LOCAL alias the lookup service registers for a non-proxy remote
    /// mailbox, so same-process senders bypass serialization.
    pub fn local_equivalent(&self) -> Self {
        MailboxAddress::local(&self.mailbox_name)
    }

    pub fn is_remote(&self) -> bool {
        matches!(
            self.location_type,
            LocationType::Distributed | LocationType::LocalSharedMemory | LocationType::Group
        )
    }

    /// Wildcard match for discovery subscriptions: fields left at their
    /// defaults in `criteria` match anything; every non-default field must
    /// match exactly.
    pub fn matches(&self, criteria: &MailboxAddress) -> bool {
        if criteria.location_type != LocationType::Unknown
            && criteria.location_type != self.location_type
        {
            return false;
        }
        if !criteria.mailbox_name.is_empty() && criteria.mailbox_name != self.mailbox_name {
            return false;
        }
        if criteria.endpoint.is_some() && criteria.endpoint != self.endpoint {
            return false;
        }
        if !criteria.neid.is_empty() && criteria.neid != self.neid {
            return false;
        }
        if criteria.shelf_number != 0 && criteria.shelf_number != self.shelf_number {
            return false;
        }
        if criteria.slot_number != 0 && criteria.slot_number != self.slot_number {
            return false;
        }
        if criteria.redundant_role != RedundantRole::None
            && criteria.redundant_role != self.redundant_role
        {
            return false;
        }
        true
    }

    fn identity(&self) -> (LocationType, &str, Option<SocketAddrV4>, &str) {
        (
            self.location_type,
            self.mailbox_name.as_str(),
            self.endpoint,
            self.neid.as_str(),
        )
    }
}

impl PartialEq for MailboxAddress {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for MailboxAddress {}

impl PartialOrd for MailboxAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MailboxAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Hash for MailboxAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl fmt::Display for MailboxAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.location_type, self.mailbox_name)?;
        if let Some(endpoint) = self.endpoint {
            write!(f, "@{endpoint}")?;
        }
        if !self.neid.is_empty() {
            write!(f, " neid={}", self.neid)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn endpoint(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn identity_ignores_descriptive_fields() {
        let a = MailboxAddress::distributed("alarm", endpoint(7777)).with_physical_location(1, 4);
        let b = MailboxAddress::distributed("alarm", endpoint(7777))
            .with_redundant_role(RedundantRole::Active);
        assert_eq!(a, b);

        let c = MailboxAddress::distributed("alarm", endpoint(7778));
        assert_ne!(a, c);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let local = MailboxAddress::local("zeta");
        let dist = MailboxAddress::distributed("alpha", endpoint(1));
        // Location type dominates the name
        assert!(local < dist);

        let a = MailboxAddress::local("alpha");
        assert!(a < local);
    }

    #[test]
    fn local_equivalent_shares_only_the_name() {
        let remote = MailboxAddress::distributed("billing", endpoint(9000)).with_neid("ne-3");
        let alias = remote.local_equivalent();
        assert_eq!(alias.location_type, LocationType::Local);
        assert_eq!(alias.mailbox_name, "billing");
        assert!(alias.endpoint.is_none());
        assert!(alias.neid.is_empty());
    }

    #[test]
    fn default_criteria_matches_everything() {
        let criteria = MailboxAddress::default();
        let addr = MailboxAddress::group("events", endpoint(5000)).with_neid("ne-1");
        assert!(addr.matches(&criteria));
    }

    #[test]
    fn non_default_criteria_fields_must_match() {
        let addr = MailboxAddress::distributed("billing", endpoint(9000)).with_neid("ne-3");

        let mut criteria = MailboxAddress::default();
        criteria.neid = "ne-3".into();
        assert!(addr.matches(&criteria));

        criteria.neid = "ne-4".into();
        assert!(!addr.matches(&criteria));

        let mut by_name = MailboxAddress::default();
        by_name.mailbox_name = "billing".into();
        assert!(addr.matches(&by_name));
        by_name.location_type = LocationType::Group;
        assert!(!addr.matches(&by_name));
    }
}
