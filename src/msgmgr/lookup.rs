//! Mailbox Lookup Service: the process-wide address → mailbox registry

use crate::config::{DistributedMailboxConfig, FabricConfig, GroupMailboxConfig};
use crate::error::{Error, Result};
use crate::msgmgr::address::{LocationType, MailboxAddress};
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::discovery::DiscoveryManager;
use crate::msgmgr::distributed::DistributedMailboxProxy;
use crate::msgmgr::group::GroupMailboxProxy;
#[cfg(target_os = "linux")]
use crate::msgmgr::local_sm::LocalSmMailboxProxy;
use crate::msgmgr::mailbox::{Mailbox, MailboxHandle, MailboxOwnerHandle};
use crate::msgmgr::message::MessageFactory;
use crate::opm::SyncObjectPool;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

/// The discovery manager's own group channel; its proxy is refused
/// registration to keep discovery from announcing itself.
pub const DISCOVERY_MANAGER_MAILBOX_NAME: &str = "DiscoveryManager";

type Registry = Mutex<BTreeMap<MailboxAddress, Weak<dyn Mailbox>>>;

/// Resolves logical addresses to live mailboxes.
///
/// Two registries: `local` holds every LOCAL mailbox plus a
/// local-equivalent alias for each non-proxy remote mailbox created in
/// this process; `proxy` holds the sender-side proxies to remote
/// endpoints. Entries are weak: a mailbox's lifetime is governed by its
/// handle reference count, and it deregisters itself on deactivation.
pub struct MailboxLookupService {
    self_ref: Weak<MailboxLookupService>,
    local: Registry,
    proxy: Registry,
    discovery: OnceCell<Arc<DiscoveryManager>>,
    factory: Arc<dyn MessageFactory>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    config: FabricConfig,
}

impl MailboxLookupService {
    pub(crate) fn new(
        config: FabricConfig,
        factory: Arc<dyn MessageFactory>,
        buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            local: Mutex::new(BTreeMap::new()),
            proxy: Mutex::new(BTreeMap::new()),
            discovery: OnceCell::new(),
            factory,
            buffer_pool,
            config,
        })
    }

    /// Resolve an address to a posting handle.
    ///
    /// LOCAL addresses must already be registered in this process. Remote
    /// addresses resolve to their proxy, synthesizing and activating one on
    /// a miss; the registry lock is released across that activation since
    /// it re-enters the registry.
    pub async fn find(&self, address: &MailboxAddress) -> Result<MailboxHandle> {
        match address.location_type {
            LocationType::Unknown => Err(Error::InvalidArgument(
                "cannot find a mailbox with location type UNKNOWN".into(),
            )),
            LocationType::Local => {
                let mut local = self.local.lock().await;
                match local.get(address).and_then(Weak::upgrade) {
                    Some(mailbox) => Ok(MailboxHandle::new(mailbox)),
                    None => {
                        local.remove(address);
                        Err(Error::NotFound(format!(
                            "no local mailbox registered as {address}"
                        )))
                    }
                }
            }
            _ => {
                {
                    let mut proxy = self.proxy.lock().await;
                    match proxy.get(address).and_then(Weak::upgrade) {
                        Some(mailbox) => return Ok(MailboxHandle::new(mailbox)),
                        None => {
                            proxy.remove(address);
                        }
                    }
                }
                // Lock released: the proxy's activate re-enters the registry
                debug!("no proxy for {address} yet, creating one");
                let owner = self.create_proxy(address)?;
                owner.activate().await.inspect_err(|e| {
                    warn!("proxy activation for {address} failed: {e}; caller should retry the find");
                })?;
                // The returned handle is the application's sole reference
                Ok(owner.to_handle())
            }
        }
    }

    fn create_proxy(&self, address: &MailboxAddress) -> Result<MailboxOwnerHandle> {
        let this = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        match address.location_type {
            LocationType::Distributed => Ok(DistributedMailboxProxy::create(
                &this,
                &self.buffer_pool,
                address.clone(),
                DistributedMailboxConfig::default(),
            )),
            LocationType::Group => Ok(GroupMailboxProxy::create(
                &this,
                &self.buffer_pool,
                address.clone(),
                GroupMailboxConfig::default(),
            )),
            #[cfg(target_os = "linux")]
            LocationType::LocalSharedMemory => Ok(LocalSmMailboxProxy::create(
                &this,
                &self.buffer_pool,
                address.clone(),
            )),
            #[cfg(not(target_os = "linux"))]
            LocationType::LocalSharedMemory => Err(Error::InvalidArgument(
                "shared-memory mailboxes are only available on linux".into(),
            )),
            _ => Err(Error::InvalidArgument(format!(
                "illegal location type for proxy creation: {:?}",
                address.location_type
            ))),
        }
    }

    /// Register an activated mailbox.
    ///
    /// LOCAL mailboxes land in the local registry. Non-proxy remote
    /// mailboxes land there too under a local-equivalent alias (letting
    /// same-process senders bypass serialization) and are announced to
    /// discovery. Proxies land in the proxy registry, except the discovery
    /// manager's own proxy, which is refused by name.
    pub async fn register_mailbox(&self, mailbox: Arc<dyn Mailbox>) -> Result<()> {
        let address = mailbox.address().clone();
        match address.location_type {
            LocationType::Unknown => Err(Error::InvalidArgument(
                "cannot register a mailbox with location type UNKNOWN".into(),
            )),
            LocationType::Local => {
                debug!("registering local address {address}");
                Self::register_into(&self.local, address, mailbox).await;
                Ok(())
            }
            _ if !mailbox.is_proxy() => {
                let alias = address.local_equivalent();
                debug!("registering {address} with local equivalent {alias}");
                Self::register_into(&self.local, alias, mailbox).await;
                if address.mailbox_name != DISCOVERY_MANAGER_MAILBOX_NAME
                    && let Some(dm) = self.discovery.get()
                {
                    dm.register_local_address(address).await;
                }
                Ok(())
            }
            _ => {
                if address.mailbox_name == DISCOVERY_MANAGER_MAILBOX_NAME {
                    debug!("discovery manager proxy is not registered with the MLS");
                    return Ok(());
                }
                debug!("registering proxy address {address}");
                Self::register_into(&self.proxy, address, mailbox).await;
                Ok(())
            }
        }
    }

    /// Insert under the duplicate-replacement protocol: an active incumbent
    /// is deactivated first (with the registry lock released, since
    /// deactivation re-enters the registry to deregister), an inactive or
    /// dead one is simply erased.
    async fn register_into(
        registry: &Registry,
        address: MailboxAddress,
        mailbox: Arc<dyn Mailbox>,
    ) {
        let incumbent = {
            let mut map = registry.lock().await;
            match map.get(&address).and_then(Weak::upgrade) {
                Some(existing) if existing.is_active() && !Arc::ptr_eq(&existing, &mailbox) => {
                    Some(existing)
                }
                _ => {
                    map.insert(address.clone(), Arc::downgrade(&mailbox));
                    None
                }
            }
        };

        if let Some(existing) = incumbent {
            warn!("deactivating and replacing registry entry for {address}");
            if let Err(e) = existing.deactivate().await {
                warn!("deactivation of the replaced mailbox failed: {e}");
            }
            registry
                .lock()
                .await
                .insert(address, Arc::downgrade(&mailbox));
        }
    }

    /// Remove a non-proxy mailbox's entries. Never deactivates; mailboxes
    /// deregister themselves as part of their own deactivation.
    pub async fn deregister_mailbox(&self, address: &MailboxAddress) {
        match address.location_type {
            LocationType::Unknown => {
                warn!("cannot deregister a mailbox with location type UNKNOWN");
            }
            LocationType::Local => {
                if self.local.lock().await.remove(address).is_none() {
                    warn!("deregister of unknown local address {address}");
                }
            }
            _ => {
                let alias = address.local_equivalent();
                if self.local.lock().await.remove(&alias).is_none() {
                    warn!("deregister of unknown local equivalent {alias}");
                }
                if address.mailbox_name != DISCOVERY_MANAGER_MAILBOX_NAME
                    && let Some(dm) = self.discovery.get()
                {
                    dm.deregister_local_address(address).await;
                    dm.remove_subscriptions_for(address).await;
                }
            }
        }
    }

    /// Remove a proxy's entry.
    pub async fn deregister_proxy(&self, address: &MailboxAddress) {
        if address.mailbox_name == DISCOVERY_MANAGER_MAILBOX_NAME {
            return;
        }
        if self.proxy.lock().await.remove(address).is_none() {
            warn!("deregister of unknown proxy address {address}");
        }
    }

    /// Subscribe to discovery updates matching `criteria` (defaulted fields
    /// are wildcards). Returns the matching addresses known right now;
    /// later matches are posted to `notify` as `DiscoveryMessage`s. Starts
    /// the discovery manager on first use.
    pub async fn register_for_discovery_updates(
        &self,
        criteria: MailboxAddress,
        notify: MailboxHandle,
    ) -> Result<Vec<MailboxAddress>> {
        let dm = self.ensure_discovery().await?;
        Ok(dm.register_for_updates(criteria, notify).await)
    }

    async fn ensure_discovery(&self) -> Result<Arc<DiscoveryManager>> {
        let this = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        self.discovery
            .get_or_try_init(|| async {
                info!(
                    "starting discovery manager on group {}",
                    self.config.discovery_group
                );
                DiscoveryManager::start(
                    &this,
                    &self.factory,
                    &self.buffer_pool,
                    &self.config,
                )
                .await
            })
            .await
            .cloned()
    }

    /// All registered addresses, local registry first. Debug aid.
    pub async fn list_all_mailbox_addresses(&self) -> (Vec<MailboxAddress>, Vec<MailboxAddress>) {
        let local = self.local.lock().await.keys().cloned().collect();
        let proxy = self.proxy.lock().await.keys().cloned().collect();
        (local, proxy)
    }

    /// Flip the trace flag on every live registered mailbox.
    pub async fn set_debug_for_all_mailboxes(&self, debug_value: i32) {
        for registry in [&self.local, &self.proxy] {
            for mailbox in registry.lock().await.values().filter_map(Weak::upgrade) {
                mailbox.set_debug_value(debug_value);
            }
        }
    }

    /// Stop discovery and forget every registration.
    pub async fn shutdown(&self) {
        if let Some(dm) = self.discovery.get() {
            dm.shutdown().await;
        }
        self.local.lock().await.clear();
        self.proxy.lock().await.clear();
    }
}
