//! The process-wide fabric runtime handle

use crate::config::FabricConfig;
use crate::error::Result;
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::lookup::MailboxLookupService;
use crate::msgmgr::mailbox::MailboxHandle;
use crate::msgmgr::message::{FunctionMessageFactory, MessageFactory};
use crate::opm::{
    DEFAULT_CAPACITY_INCREMENT, DEFAULT_THRESHOLD_PERCENTAGE, GrowthMode, Opm, PoolId,
    SyncObjectPool,
};
use crate::threadmgr::ThreadManager;
use std::sync::Arc;
use tracing::info;

/// Everything process-wide in one handle: the object pool manager, the
/// thread manager, the lookup service, the shared wire-buffer pool and the
/// message factory. Passed by context instead of living in globals;
/// mailboxes are created against a `Fabric` and resolve each other through
/// its lookup service.
pub struct Fabric {
    config: FabricConfig,
    opm: Arc<Opm>,
    thread_manager: Arc<ThreadManager>,
    factory: Arc<FunctionMessageFactory>,
    factory_dyn: Arc<dyn MessageFactory>,
    lookup: Arc<MailboxLookupService>,
    buffer_pool_id: PoolId,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
}

impl Fabric {
    pub fn new(config: FabricConfig) -> Result<Arc<Fabric>> {
        let opm = Opm::new();
        // Wire buffers are network-order; one pool serves every transport
        let buffer_pool_id = opm.create_pool::<MessageBuffer>(
            1,
            DEFAULT_THRESHOLD_PERCENTAGE,
            DEFAULT_CAPACITY_INCREMENT,
            config.buffer_pool_size,
            GrowthMode::GrowthAllowed,
        )?;
        let buffer_pool = opm.pool::<MessageBuffer>(buffer_pool_id)?;

        let factory = FunctionMessageFactory::new();
        let factory_dyn: Arc<dyn MessageFactory> = factory.clone() as Arc<dyn MessageFactory>;
        let lookup = MailboxLookupService::new(
            config.clone(),
            Arc::clone(&factory_dyn),
            Arc::clone(&buffer_pool),
        );

        info!("fabric runtime up (neid {})", config.neid);
        Ok(Arc::new(Fabric {
            config,
            opm,
            thread_manager: ThreadManager::new(),
            factory,
            factory_dyn,
            lookup,
            buffer_pool_id,
            buffer_pool,
        }))
    }

    pub fn config(&self) -> &FabricConfig {
        &self.config
    }

    pub fn opm(&self) -> &Arc<Opm> {
        &self.opm
    }

    pub fn thread_manager(&self) -> &Arc<ThreadManager> {
        &self.thread_manager
    }

    /// The registry applications register message creators with.
    pub fn message_factory(&self) -> &Arc<FunctionMessageFactory> {
        &self.factory
    }

    pub(crate) fn factory(&self) -> &Arc<dyn MessageFactory> {
        &self.factory_dyn
    }

    pub fn lookup(&self) -> &Arc<MailboxLookupService> {
        &self.lookup
    }

    pub fn buffer_pool(&self) -> &Arc<SyncObjectPool<MessageBuffer>> {
        &self.buffer_pool
    }

    pub fn buffer_pool_id(&self) -> PoolId {
        self.buffer_pool_id
    }

    /// Shorthand for [`MailboxLookupService::find`].
    pub async fn find(&self, address: &MailboxAddress) -> Result<MailboxHandle> {
        self.lookup.find(address).await
    }

    /// Stop discovery, drop registrations, abort workers and drain pools.
    pub async fn shutdown(&self) {
        info!("fabric runtime shutting down");
        self.lookup.shutdown().await;
        self.thread_manager.shutdown();
        self.opm.shutdown();
    }
}
