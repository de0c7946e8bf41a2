//! Discovery manager: propagates mailbox addresses across hosts over a
//! dedicated group channel

use crate::config::{FabricConfig, GroupMailboxConfig};
use crate::error::Result;
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::group::{GroupMailbox, GroupMailboxProxy};
use crate::msgmgr::lookup::{DISCOVERY_MANAGER_MAILBOX_NAME, MailboxLookupService};
use crate::msgmgr::mailbox::{MailboxHandle, MailboxOwnerHandle};
use crate::msgmgr::message::{DiscoveryMessage, DiscoveryUpdate, MessageFactory};
use crate::opm::SyncObjectPool;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Subscription {
    criteria: MailboxAddress,
    notify: MailboxHandle,
}

/// Owns the discovery group mailbox, announces this process's non-proxy
/// remote addresses, and fans matching remote announcements out to
/// subscribers.
pub struct DiscoveryManager {
    group_member: MailboxOwnerHandle,
    group_proxy: MailboxHandle,
    locally_announced: Mutex<BTreeSet<MailboxAddress>>,
    known_remote: Mutex<BTreeSet<MailboxAddress>>,
    subscriptions: Mutex<Vec<Subscription>>,
    processor: StdMutex<Option<JoinHandle<()>>>,
}

impl DiscoveryManager {
    /// Bring up the discovery channel: a group member to hear peer
    /// announcements, a group proxy to send ours, and a processor task
    /// draining the member queue.
    pub(crate) async fn start(
        lookup: &Arc<MailboxLookupService>,
        factory: &Arc<dyn MessageFactory>,
        buffer_pool: &Arc<SyncObjectPool<MessageBuffer>>,
        config: &FabricConfig,
    ) -> Result<Arc<Self>> {
        let address = MailboxAddress::group(DISCOVERY_MANAGER_MAILBOX_NAME, config.discovery_group)
            .with_neid(&config.neid);

        let group_member = GroupMailbox::create_with_address(
            lookup,
            factory,
            buffer_pool,
            config.queue_depth,
            config.debug_value,
            address.clone(),
            GroupMailboxConfig::default(),
        );
        group_member.activate().await?;

        let proxy_owner =
            GroupMailboxProxy::create(lookup, buffer_pool, address, GroupMailboxConfig::default());
        if let Err(e) = proxy_owner.activate().await {
            let _ = group_member.deactivate().await;
            return Err(e);
        }
        let group_proxy = proxy_owner.to_handle();
        drop(proxy_owner);

        let manager = Arc::new(Self {
            group_member,
            group_proxy,
            locally_announced: Mutex::new(BTreeSet::new()),
            known_remote: Mutex::new(BTreeSet::new()),
            subscriptions: Mutex::new(Vec::new()),
            processor: StdMutex::new(None),
        });

        let processor = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                loop {
                    let Some(message) = manager.group_member.get_message(None).await else {
                        break;
                    };
                    if let Some(discovery) = message.as_any().downcast_ref::<DiscoveryMessage>() {
                        manager.handle_announcement(discovery).await;
                    }
                }
                debug!("discovery processor ended");
            })
        };
        *manager.processor.lock().unwrap_or_else(|e| e.into_inner()) = Some(processor);

        info!("discovery manager started");
        Ok(manager)
    }

    /// Announce a locally created non-proxy remote address to the fabric.
    pub(crate) async fn register_local_address(&self, address: MailboxAddress) {
        self.locally_announced.lock().await.insert(address.clone());
        let announcement =
            DiscoveryMessage::new(DiscoveryUpdate::Added, vec![address.clone()]);
        if let Err(e) = self.group_proxy.post(Box::new(announcement)).await {
            warn!("discovery announcement for {address} failed: {e}");
        }
        // Local subscribers are told directly; the multicast loop path is
        // reserved for remote announcements
        self.notify_subscribers(DiscoveryUpdate::Added, &[address]).await;
    }

    /// Withdraw a previously announced local address.
    pub(crate) async fn deregister_local_address(&self, address: &MailboxAddress) {
        if !self.locally_announced.lock().await.remove(address) {
            return;
        }
        let withdrawal =
            DiscoveryMessage::new(DiscoveryUpdate::Removed, vec![address.clone()]);
        if let Err(e) = self.group_proxy.post(Box::new(withdrawal)).await {
            warn!("discovery withdrawal for {address} failed: {e}");
        }
        self.notify_subscribers(DiscoveryUpdate::Removed, std::slice::from_ref(address))
            .await;
    }

    /// Store a subscription and return the currently known matches.
    pub(crate) async fn register_for_updates(
        &self,
        criteria: MailboxAddress,
        notify: MailboxHandle,
    ) -> Vec<MailboxAddress> {
        let mut matches: Vec<MailboxAddress> = Vec::new();
        for address in self.locally_announced.lock().await.iter() {
            if address.matches(&criteria) {
                matches.push(address.clone());
            }
        }
        for address in self.known_remote.lock().await.iter() {
            if address.matches(&criteria) {
                matches.push(address.clone());
            }
        }
        self.subscriptions
            .lock()
            .await
            .push(Subscription { criteria, notify });
        matches
    }

    /// Drop subscriptions that notify the given mailbox.
    pub(crate) async fn remove_subscriptions_for(&self, address: &MailboxAddress) {
        self.subscriptions
            .lock()
            .await
            .retain(|subscription| subscription.notify.address() != *address);
    }

    async fn handle_announcement(&self, message: &DiscoveryMessage) {
        // Self-announcements loop back over multicast; they were already
        // delivered to subscribers at registration time
        let locally_announced = self.locally_announced.lock().await;
        let fresh: Vec<MailboxAddress> = message
            .addresses()
            .iter()
            .filter(|address| !locally_announced.contains(address))
            .cloned()
            .collect();
        drop(locally_announced);
        if fresh.is_empty() {
            return;
        }

        {
            let mut known = self.known_remote.lock().await;
            match message.update() {
                DiscoveryUpdate::Added => {
                    for address in &fresh {
                        if known.insert(address.clone()) {
                            debug!("discovered remote mailbox {address}");
                        }
                    }
                }
                DiscoveryUpdate::Removed => {
                    for address in &fresh {
                        if known.remove(address) {
                            debug!("remote mailbox {address} withdrawn");
                        }
                    }
                }
            }
        }

        self.notify_subscribers(message.update(), &fresh).await;
    }

    async fn notify_subscribers(&self, update: DiscoveryUpdate, addresses: &[MailboxAddress]) {
        let subscriptions = self.subscriptions.lock().await;
        for subscription in subscriptions.iter() {
            let matched: Vec<MailboxAddress> = addresses
                .iter()
                .filter(|address| address.matches(&subscription.criteria))
                .cloned()
                .collect();
            if matched.is_empty() {
                continue;
            }
            let notification = DiscoveryMessage::new(update, matched);
            if let Err(e) = subscription.notify.post(Box::new(notification)).await {
                warn!(
                    "discovery notification to {} failed: {e}",
                    subscription.notify.address()
                );
            }
        }
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(processor) = self
            .processor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            processor.abort();
        }
        let _ = self.group_member.deactivate().await;
        self.subscriptions.lock().await.clear();
        info!("discovery manager stopped");
    }
}
