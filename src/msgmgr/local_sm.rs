//! Same-host cross-process mailbox over POSIX message queues

use crate::config::MAX_MESSAGE_LENGTH;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::lookup::MailboxLookupService;
use crate::msgmgr::mailbox::{Mailbox, MailboxCore, MailboxOwnerHandle, TimerId};
use crate::msgmgr::message::{Message, MessageFactory, TimerMessage};
use crate::opm::SyncObjectPool;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::mqueue::{MQ_OFlag, MqAttr, MqdT, mq_open, mq_send, mq_unlink};
use nix::sys::stat::Mode;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queue depth; a full queue fails the sender's non-blocking post
const SM_QUEUE_DEPTH: i64 = 8;

/// Each kernel message is a `u32 length ‖ bytes` frame
const SM_FRAME_SIZE: usize = MAX_MESSAGE_LENGTH + 4;

/// Backoff while the receiver polls an empty queue
const SM_POLL_INTERVAL: Duration = Duration::from_millis(2);

fn queue_name(mailbox_name: &str) -> String {
    // Kernel queue names are single-component paths
    format!("/postbus_{}", mailbox_name.replace('/', "_"))
}

fn open_queue(name: &str, flags: MQ_OFlag) -> Result<MqdT> {
    let attr = MqAttr::new(0, SM_QUEUE_DEPTH, SM_FRAME_SIZE as i64, 0);
    mq_open(
        name,
        flags | MQ_OFlag::O_CREAT | MQ_OFlag::O_NONBLOCK,
        Mode::from_bits_truncate(0o666),
        Some(&attr),
    )
    .map_err(|e| Error::TransportFatal(format!("mq_open {name}: {e}")))
}

/// Receiving side of a shared-memory mailbox. Owns the kernel queue named
/// after the mailbox; frames are drained, rebuilt through the factory and
/// posted into the local queue.
pub struct LocalSmMailbox {
    self_ref: Weak<LocalSmMailbox>,
    core: MailboxCore,
    lookup: Arc<MailboxLookupService>,
    factory: Arc<dyn MessageFactory>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    queue: Mutex<Option<Arc<MqdT>>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalSmMailbox {
    pub fn create(fabric: &Arc<Fabric>, mailbox_name: &str) -> MailboxOwnerHandle {
        let address =
            MailboxAddress::shared_memory(mailbox_name).with_neid(&fabric.config().neid);
        let mailbox = Arc::new_cyclic(|self_ref| LocalSmMailbox {
            self_ref: self_ref.clone(),
            core: MailboxCore::new(
                address,
                fabric.config().queue_depth,
                fabric.config().debug_value,
            ),
            lookup: Arc::clone(fabric.lookup()),
            factory: Arc::clone(fabric.factory()),
            buffer_pool: Arc::clone(fabric.buffer_pool()),
            queue: Mutex::new(None),
            io_tasks: Mutex::new(Vec::new()),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    async fn drain_loop(self: Arc<Self>, queue: Arc<MqdT>) {
        let mut frame = [0u8; SM_FRAME_SIZE];
        loop {
            let mut priority = 0u32;
            match nix::mqueue::mq_receive(&queue, &mut frame, &mut priority) {
                Ok(received) => self.handle_frame(&frame[..received]).await,
                Err(Errno::EAGAIN) => tokio::time::sleep(SM_POLL_INTERVAL).await,
                Err(e) => {
                    warn!("mq_receive failed on {}: {e}", self.core.address());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &[u8]) {
        if frame.len() < 6 {
            warn!("runt shared-memory frame ({} bytes) ignored", frame.len());
            return;
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&frame[..4]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        if payload_len != frame.len() - 4 || payload_len > MAX_MESSAGE_LENGTH {
            warn!(
                "shared-memory frame length mismatch ({payload_len} declared, {} present)",
                frame.len() - 4
            );
            return;
        }

        let mut buffer = match self.buffer_pool.reserve(true) {
            Ok(buffer) => buffer,
            Err(e) => {
                error!("no receive buffer available: {e}");
                return;
            }
        };
        match buffer.make_room(payload_len) {
            Ok(room) => room.copy_from_slice(&frame[4..]),
            Err(e) => {
                warn!("shared-memory frame rejected: {e}");
                return;
            }
        }

        if self.core.debug_value() != 0 {
            debug!("shared-memory frame: {}", buffer.hex_dump());
        }

        match self.factory.recreate_message_from_buffer(&mut buffer) {
            Ok(mut message) => {
                if buffer.remaining() >= 4
                    && let Ok(priority) = buffer.extract_u32()
                {
                    message.set_priority(priority);
                }
                if let Err(e) = self.core.enqueue(message, None).await {
                    warn!("shared-memory message dropped: {e}");
                }
            }
            Err(e) => warn!("failed to rebuild shared-memory message: {e}"),
        }
    }

    fn abort_io_tasks(&self) {
        for task in self
            .io_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

#[async_trait]
impl Mailbox for LocalSmMailbox {
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
        let name = queue_name(&self.core.address().mailbox_name);
        self.core.open().await?;

        let queue = match open_queue(&name, MQ_OFlag::O_RDONLY) {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                self.core.close();
                return Err(e);
            }
        };
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&queue));

        let this = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        let drain_task = tokio::spawn(Arc::clone(&this).drain_loop(queue));
        self.io_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(drain_task);

        let mailbox: Arc<dyn Mailbox> = this;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            self.abort_io_tasks();
            *self.queue.lock().unwrap_or_else(|p| p.into_inner()) = None;
            let _ = mq_unlink(name.as_str());
            self.core.close();
            return Err(e);
        }
        info!("shared-memory mailbox {} draining {}", self.core.address(), name);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.core.close() {
            return Ok(());
        }
        self.abort_io_tasks();
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = None;
        // The receiver owns the queue and removes it from the system
        let name = queue_name(&self.core.address().mailbox_name);
        if let Err(e) = mq_unlink(name.as_str()) {
            debug!("mq_unlink {name}: {e}");
        }
        self.lookup.deregister_mailbox(self.core.address()).await;
        info!("shared-memory mailbox {} deactivated", self.core.address());
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

/// Sending side of a shared-memory mailbox. Posts are non-blocking: a full
/// kernel queue surfaces as a transient error immediately.
pub struct LocalSmMailboxProxy {
    self_ref: Weak<LocalSmMailboxProxy>,
    address: MailboxAddress,
    lookup: Arc<MailboxLookupService>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    queue: Mutex<Option<Arc<MqdT>>>,
    active: AtomicBool,
    debug_value: AtomicI32,
    references: AtomicU32,
    sent: AtomicU64,
}

impl LocalSmMailboxProxy {
    pub(crate) fn create(
        lookup: &Arc<MailboxLookupService>,
        buffer_pool: &Arc<SyncObjectPool<MessageBuffer>>,
        address: MailboxAddress,
    ) -> MailboxOwnerHandle {
        let mailbox = Arc::new_cyclic(|self_ref| LocalSmMailboxProxy {
            self_ref: self_ref.clone(),
            address,
            lookup: Arc::clone(lookup),
            buffer_pool: Arc::clone(buffer_pool),
            queue: Mutex::new(None),
            active: AtomicBool::new(false),
            debug_value: AtomicI32::new(0),
            references: AtomicU32::new(0),
            sent: AtomicU64::new(0),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    fn current_queue(&self) -> Result<Arc<MqdT>> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::TransportTransient("shared-memory queue is not open".into()))
    }
}

#[async_trait]
impl Mailbox for LocalSmMailboxProxy {
    fn address(&self) -> &MailboxAddress {
        &self.address
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn debug_value(&self) -> i32 {
        self.debug_value.load(Ordering::Relaxed)
    }

    fn set_debug_value(&self, value: i32) {
        self.debug_value.store(value, Ordering::Relaxed);
    }

    fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn received_count(&self) -> u64 {
        0
    }

    fn active_timers(&self) -> u32 {
        0
    }

    async fn activate(&self) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            warn!("proxy {} activated twice", self.address);
            return Ok(());
        }
        let name = queue_name(&self.address.mailbox_name);
        let queue = match open_queue(&name, MQ_OFlag::O_WRONLY) {
            Ok(queue) => Arc::new(queue),
            Err(e) => {
                self.active.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = Some(queue);

        let mailbox: Arc<dyn Mailbox> = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            *self.queue.lock().unwrap_or_else(|p| p.into_inner()) = None;
            self.active.store(false, Ordering::Release);
            return Err(e);
        }
        info!("shared-memory proxy feeding {}", name);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        *self.queue.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.lookup.deregister_proxy(&self.address).await;
        info!("shared-memory proxy to {} deactivated", self.address);
        Ok(())
    }

    async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }

        let mut buffer = self.buffer_pool.reserve(true)?;
        buffer.insert_u16(message.message_id())?;
        message.serialize(&mut buffer)?;
        if message.priority() != 0 {
            buffer.insert_u32(message.priority())?;
        }

        if self.debug_value() != 0 {
            debug!(
                "posting message {:#06x} via {}: {}",
                message.message_id(),
                self.address,
                buffer.hex_dump()
            );
        }

        let mut frame = Vec::with_capacity(4 + buffer.len());
        frame.extend_from_slice(&(buffer.len() as u32).to_be_bytes());
        frame.extend_from_slice(buffer.as_slice());

        let queue = self.current_queue()?;
        match mq_send(&queue, &frame, 0) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(Errno::EAGAIN) => Err(Error::TransportTransient(
                "shared-memory queue is full".into(),
            )),
            Err(e) => Err(Error::TransportTransient(format!("mq_send failed: {e}"))),
        }
    }

    async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        _timeout: Duration,
    ) -> Result<()> {
        // Shared-memory posts are defined non-blocking
        self.post(message).await
    }

    async fn get_message(&self, _timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        error!("getMessage on a shared-memory proxy is illegal; post-only endpoint");
        None
    }

    fn get_message_non_blocking(&self) -> Option<Box<dyn Message>> {
        error!("getMessage on a shared-memory proxy is illegal; post-only endpoint");
        None
    }

    async fn schedule_timer(&self, _timer: TimerMessage) -> Result<TimerId> {
        Err(Error::ProgrammerError(
            "proxies have no reactor; schedule timers on the owning mailbox".into(),
        ))
    }

    async fn cancel_timer(&self, _timer_id: TimerId) -> Result<()> {
        Err(Error::ProgrammerError(
            "proxies have no reactor; schedule timers on the owning mailbox".into(),
        ))
    }

    async fn reset_timer_interval(&self, _timer_id: TimerId, _interval: Duration) -> Result<()> {
        Err(Error::ProgrammerError(
            "proxies have no reactor; schedule timers on the owning mailbox".into(),
        ))
    }

    fn acquire(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) -> u32 {
        self.references.fetch_sub(1, Ordering::AcqRel) - 1
    }

    fn reference_count(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }
}
