//! Drives a mailbox: dequeue, dispatch to the handler list, drop

use crate::error::{Error, Result};
use crate::msgmgr::handler::MessageHandlerList;
use crate::msgmgr::mailbox::MailboxOwnerHandle;
use crate::threadmgr::ThreadManager;
use std::sync::Arc;
use tracing::debug;

/// Binds a handler list to an owner handle and pumps the queue.
///
/// Messages are dropped after their handler returns; applications must not
/// hold on to them past the handler call. The loop ends when `get_message`
/// yields `None`, i.e. when the mailbox is deactivated.
pub struct MailboxProcessor {
    handlers: Arc<MessageHandlerList>,
    owner: MailboxOwnerHandle,
}

impl MailboxProcessor {
    pub fn new(handlers: Arc<MessageHandlerList>, owner: MailboxOwnerHandle) -> Self {
        Self { handlers, owner }
    }

    /// Process with one worker (the calling task, which blocks here) or
    /// with a pool of `workers` spawned through the thread manager; in the
    /// pooled case this waits for all of them. Dequeueing is serialized on
    /// the owner handle, so each message reaches exactly one worker.
    pub async fn process_mailbox(&self, workers: usize, threads: &ThreadManager) -> Result<()> {
        if workers == 0 {
            return Err(Error::InvalidArgument(
                "processMailbox needs at least one worker".into(),
            ));
        }

        if workers == 1 {
            Self::pump(Arc::clone(&self.handlers), self.owner.clone()).await;
            return Ok(());
        }

        let handlers = Arc::clone(&self.handlers);
        let owner = self.owner.clone();
        let ids = threads.create_worker_pool(
            workers,
            "mailbox-processor",
            false,
            Arc::new(move || {
                let handlers = Arc::clone(&handlers);
                let owner = owner.clone();
                Box::pin(Self::pump(handlers, owner))
            }),
        );
        for id in ids {
            threads.join(id).await;
        }
        Ok(())
    }

    async fn pump(handlers: Arc<MessageHandlerList>, owner: MailboxOwnerHandle) {
        while let Some(message) = owner.get_message(None).await {
            let handler = handlers.find(message.message_id());
            let code = handler(message.as_ref());
            if code != 0 {
                debug!(
                    "handler for message id {:#06x} returned {}",
                    message.message_id(),
                    code
                );
            }
        }
    }
}
