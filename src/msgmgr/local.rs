//! In-process mailbox: bounded FIFO plus timer delivery

use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::lookup::MailboxLookupService;
use crate::msgmgr::mailbox::{Mailbox, MailboxCore, MailboxOwnerHandle, TimerId};
use crate::msgmgr::message::{Message, TimerMessage};
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

/// Mailbox for same-process communication. Messages are enqueued directly;
/// timers deliver into the same queue.
pub struct LocalMailbox {
    self_ref: Weak<LocalMailbox>,
    core: MailboxCore,
    lookup: Arc<MailboxLookupService>,
}

impl LocalMailbox {
    /// Create an inactive local mailbox and return the owner handle to it.
    ///
    /// Local addresses consist of the location type and the name only, so
    /// `find(local(name))` works without knowing this process's neid.
    pub fn create(fabric: &Arc<Fabric>, mailbox_name: &str) -> MailboxOwnerHandle {
        Self::create_with_address(fabric, MailboxAddress::local(mailbox_name))
    }

    pub(crate) fn create_with_address(
        fabric: &Arc<Fabric>,
        address: MailboxAddress,
    ) -> MailboxOwnerHandle {
        let mailbox = Arc::new_cyclic(|self_ref| LocalMailbox {
            self_ref: self_ref.clone(),
            core: MailboxCore::new(
                address,
                fabric.config().queue_depth,
                fabric.config().debug_value,
            ),
            lookup: Arc::clone(fabric.lookup()),
        });
        MailboxOwnerHandle::new(mailbox)
    }
}

#[async_trait]
impl Mailbox for LocalMailbox {
    fn address(&self) -> &MailboxAddress {
        self.core.address()
    }

    fn is_proxy(&self) -> bool {
        false
    }

    fn is_active(&self) -> bool {
        self.core.is_active()
    }

    fn debug_value(&self) -> i32 {
        self.core.debug_value()
    }

    fn set_debug_value(&self, value: i32) {
        self.core.set_debug_value(value);
    }

    fn sent_count(&self) -> u64 {
        self.core.sent_count()
    }

    fn received_count(&self) -> u64 {
        self.core.received_count()
    }

    fn active_timers(&self) -> u32 {
        self.core.active_timers()
    }

    async fn activate(&self) -> Result<()> {
        self.core.open().await?;
        let mailbox: Arc<dyn Mailbox> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::Inactive)?;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            self.core.close();
            return Err(e);
        }
        debug!("local mailbox {} activated", self.core.address());
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.core.close() {
            return Ok(());
        }
        self.lookup.deregister_mailbox(self.core.address()).await;
        debug!("local mailbox {} deactivated", self.core.address());
        Ok(())
    }

    async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        self.core.enqueue(message, None).await
    }

    async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<()> {
        self.core.enqueue(message, Some(timeout)).await
    }

    async fn get_message(&self, timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        self.core.dequeue(timeout).await
    }

    fn get_message_non_blocking(&self) -> Option<Box<dyn Message>> {
        self.core.dequeue_non_blocking()
    }

    async fn schedule_timer(&self, timer: TimerMessage) -> Result<TimerId> {
        self.core.schedule_timer(timer)
    }

    async fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        self.core.cancel_timer(timer_id)
    }

    async fn reset_timer_interval(&self, timer_id: TimerId, interval: Duration) -> Result<()> {
        self.core.reset_timer_interval(timer_id, interval)
    }

    fn acquire(&self) {
        self.core.acquire();
    }

    fn release(&self) -> u32 {
        self.core.release()
    }

    fn reference_count(&self) -> u32 {
        self.core.reference_count()
    }
}
