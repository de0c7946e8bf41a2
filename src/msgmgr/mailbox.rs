//! Mailbox contract, shared queue/timer core, and reference-counted handles

use crate::error::{Error, Result};
use crate::msgmgr::address::MailboxAddress;
use crate::msgmgr::message::{Message, TimerMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies a scheduled timer within one mailbox.
pub type TimerId = u64;

/// Uniform mailbox contract across all four transports.
///
/// Applications never hold a mailbox directly: they hold
/// [`MailboxHandle`]s / [`MailboxOwnerHandle`]s, which maintain the
/// mailbox's handle reference count. When the count reaches zero the
/// mailbox is deactivated (which deregisters it from the lookup service)
/// and its resources are torn down.
#[async_trait]
pub trait Mailbox: Send + Sync {
    fn address(&self) -> &MailboxAddress;

    /// True for sender-side stand-ins that serialize to a transport
    fn is_proxy(&self) -> bool;

    fn is_active(&self) -> bool;

    fn debug_value(&self) -> i32;

    fn set_debug_value(&self, value: i32);

    fn sent_count(&self) -> u64;

    fn received_count(&self) -> u64;

    fn active_timers(&self) -> u32;

    /// Open transports and register with the lookup service.
    async fn activate(&self) -> Result<()>;

    /// Close transports, cancel timers, unblock consumers, deregister.
    async fn deactivate(&self) -> Result<()>;

    /// Post with the default zero timeout: a full queue fails immediately.
    async fn post(&self, message: Box<dyn Message>) -> Result<()>;

    /// Post, waiting up to `timeout` for queue space or transport progress.
    async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<()>;

    /// Blocking receive; `None` once the mailbox is deactivated, or on
    /// timeout when one is given. Proxies diagnose and return `None`.
    async fn get_message(&self, timeout: Option<Duration>) -> Option<Box<dyn Message>>;

    fn get_message_non_blocking(&self) -> Option<Box<dyn Message>>;

    async fn schedule_timer(&self, timer: TimerMessage) -> Result<TimerId>;

    async fn cancel_timer(&self, timer_id: TimerId) -> Result<()>;

    async fn reset_timer_interval(&self, timer_id: TimerId, interval: Duration) -> Result<()>;

    /// Handle reference counting; used by the handle types only.
    fn acquire(&self);

    /// Decrement the handle count, returning the remaining count.
    fn release(&self) -> u32;

    fn reference_count(&self) -> u32;
}

struct TimerEntry {
    handle: tokio::task::JoinHandle<()>,
    interval_ms: Arc<AtomicU64>,
    reusable: Arc<AtomicBool>,
}

/// Queue, counters and timer table shared by every non-proxy mailbox.
pub(crate) struct MailboxCore {
    address: MailboxAddress,
    queue_depth: usize,
    sender: RwLock<Option<mpsc::Sender<Box<dyn Message>>>>,
    receiver: tokio::sync::Mutex<Option<mpsc::Receiver<Box<dyn Message>>>>,
    active: AtomicBool,
    debug_value: AtomicI32,
    references: AtomicU32,
    sent: AtomicU64,
    received: AtomicU64,
    active_timers: Arc<AtomicU32>,
    timers: Arc<Mutex<HashMap<TimerId, TimerEntry>>>,
    next_timer_id: AtomicU64,
}

impl MailboxCore {
    pub(crate) fn new(address: MailboxAddress, queue_depth: usize, debug_value: i32) -> Self {
        Self {
            address,
            queue_depth,
            sender: RwLock::new(None),
            receiver: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            debug_value: AtomicI32::new(debug_value),
            references: AtomicU32::new(0),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            active_timers: Arc::new(AtomicU32::new(0)),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_timer_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn address(&self) -> &MailboxAddress {
        &self.address
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn debug_value(&self) -> i32 {
        self.debug_value.load(Ordering::Relaxed)
    }

    pub(crate) fn set_debug_value(&self, value: i32) {
        self.debug_value.store(value, Ordering::Relaxed);
    }

    pub(crate) fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub(crate) fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn active_timers(&self) -> u32 {
        self.active_timers.load(Ordering::Relaxed)
    }

    pub(crate) fn acquire(&self) {
        self.references.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release(&self) -> u32 {
        self.references.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn reference_count(&self) -> u32 {
        self.references.load(Ordering::Acquire)
    }

    /// Install a fresh bounded queue and mark the mailbox active.
    pub(crate) async fn open(&self) -> Result<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            warn!("mailbox {} activated twice", self.address);
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(self.queue_depth.max(1));
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        *self.receiver.lock().await = Some(rx);
        Ok(())
    }

    /// Drop the queue sender (so blocked consumers drain to `None`), abort
    /// every timer. Returns false when the mailbox was already closed.
    pub(crate) fn close(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        *self.sender.write().unwrap_or_else(|e| e.into_inner()) = None;
        // One decrement per drained entry; a timer task that already
        // removed itself accounted for its own
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in timers.drain() {
            entry.handle.abort();
            self.active_timers.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    fn current_sender(&self) -> Result<mpsc::Sender<Box<dyn Message>>> {
        self.sender
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(Error::Inactive)
    }

    /// Enqueue onto the bounded local queue. `timeout` of `None` is the
    /// default zero timeout: a full queue is an immediate error.
    pub(crate) async fn enqueue(
        &self,
        message: Box<dyn Message>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        let sender = self.current_sender()?;
        match timeout {
            None => match sender.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => return Err(Error::QueueFull),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(Error::Inactive),
            },
            Some(timeout) => match tokio::time::timeout(timeout, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::Inactive),
                Err(_) => return Err(Error::QueueFull),
            },
        }
        self.increment_sent();
        Ok(())
    }

    /// Dequeue; consumers are serialized on the receiver mutex so exactly
    /// one of N workers sees any given message.
    pub(crate) async fn dequeue(&self, timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        let mut receiver = self.receiver.lock().await;
        let rx = receiver.as_mut()?;
        let message = match timeout {
            None => rx.recv().await,
            Some(timeout) => match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(message) => message,
                Err(_) => return None,
            },
        };
        if message.is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    pub(crate) fn dequeue_non_blocking(&self) -> Option<Box<dyn Message>> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let message = receiver.as_mut()?.try_recv().ok();
        if message.is_some() {
            self.received.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// Arm a timer task that posts the message into this mailbox's queue on
    /// expiry. One-shot timers retire themselves after delivery; reusable
    /// timers live until cancelled.
    pub(crate) fn schedule_timer(&self, mut timer: TimerMessage) -> Result<TimerId> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        let sender = self.current_sender()?;
        let timer_id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        timer.stamp(timer_id, self.address.clone());

        let interval_ms = Arc::new(AtomicU64::new(timer.restart_interval().as_millis() as u64));
        let reusable = Arc::new(AtomicBool::new(timer.is_reusable()));
        let one_shot = !timer.is_reusable();

        self.active_timers.fetch_add(1, Ordering::Relaxed);

        let task_interval = Arc::clone(&interval_ms);
        let task_reusable = Arc::clone(&reusable);
        let task_timers = Arc::clone(&self.timers);
        let task_active_timers = Arc::clone(&self.active_timers);
        let timeout = timer.timeout();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            loop {
                if sender.send(Box::new(timer.clone())).await.is_err() {
                    break;
                }
                if !task_reusable.load(Ordering::Acquire) {
                    break;
                }
                let interval = task_interval.load(Ordering::Acquire);
                if interval == 0 {
                    task_reusable.store(false, Ordering::Release);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(interval)).await;
                if task_interval.load(Ordering::Acquire) == 0
                    || !task_reusable.load(Ordering::Acquire)
                {
                    break;
                }
            }
            // Whichever path removes the entry retires the timer; a
            // concurrent cancel or close that got there first already
            // decremented the count
            if one_shot
                && task_timers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&timer_id)
                    .is_some()
            {
                task_active_timers.fetch_sub(1, Ordering::Relaxed);
            }
        });

        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(timer_id, TimerEntry { handle, interval_ms, reusable });
        Ok(timer_id)
    }

    pub(crate) fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        let entry = self
            .timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&timer_id);
        match entry {
            Some(entry) => {
                entry.handle.abort();
                self.active_timers.fetch_sub(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "timer {timer_id} has no outstanding instance"
            ))),
        }
    }

    /// Change a timer's restart interval; zero makes it non-reusable and
    /// stops further firings.
    pub(crate) fn reset_timer_interval(
        &self,
        timer_id: TimerId,
        interval: Duration,
    ) -> Result<()> {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let entry = timers.get(&timer_id).ok_or_else(|| {
            Error::NotFound(format!("timer {timer_id} has no outstanding instance"))
        })?;
        let millis = interval.as_millis() as u64;
        entry.interval_ms.store(millis, Ordering::Release);
        if millis == 0 {
            entry.reusable.store(false, Ordering::Release);
        }
        Ok(())
    }
}

fn release_handle(mailbox: &Arc<dyn Mailbox>) {
    let remaining = mailbox.release();
    if remaining == 0 && mailbox.is_active() {
        debug!(
            "last handle to mailbox {} dropped, deactivating",
            mailbox.address()
        );
        let mailbox = Arc::clone(mailbox);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = mailbox.deactivate().await {
                        warn!("deactivate after final release failed: {e}");
                    }
                });
            }
            Err(_) => warn!(
                "mailbox {} released outside a runtime; deactivate skipped",
                mailbox.address()
            ),
        }
    }
}

/// Posting reference to a mailbox. Owned by the application that received
/// it from the lookup service; dropping it releases the reference.
pub struct MailboxHandle {
    mailbox: Arc<dyn Mailbox>,
}

impl MailboxHandle {
    pub(crate) fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        mailbox.acquire();
        Self { mailbox }
    }

    pub fn address(&self) -> MailboxAddress {
        self.mailbox.address().clone()
    }

    pub fn is_proxy(&self) -> bool {
        self.mailbox.is_proxy()
    }

    pub fn is_active(&self) -> bool {
        self.mailbox.is_active()
    }

    pub fn sent_count(&self) -> u64 {
        self.mailbox.sent_count()
    }

    pub fn received_count(&self) -> u64 {
        self.mailbox.received_count()
    }

    pub fn debug_value(&self) -> i32 {
        self.mailbox.debug_value()
    }

    pub fn set_debug_value(&self, value: i32) {
        self.mailbox.set_debug_value(value);
    }

    pub async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        self.mailbox.post(message).await
    }

    pub async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<()> {
        self.mailbox.post_with_timeout(message, timeout).await
    }
}

impl Clone for MailboxHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.mailbox))
    }
}

impl Drop for MailboxHandle {
    fn drop(&mut self) {
        release_handle(&self.mailbox);
    }
}

/// Privileged reference: adds activate/deactivate, receive and timer
/// scheduling to the plain handle surface.
pub struct MailboxOwnerHandle {
    mailbox: Arc<dyn Mailbox>,
}

impl MailboxOwnerHandle {
    pub(crate) fn new(mailbox: Arc<dyn Mailbox>) -> Self {
        mailbox.acquire();
        Self { mailbox }
    }

    pub fn address(&self) -> MailboxAddress {
        self.mailbox.address().clone()
    }

    pub fn is_proxy(&self) -> bool {
        self.mailbox.is_proxy()
    }

    pub fn is_active(&self) -> bool {
        self.mailbox.is_active()
    }

    pub fn sent_count(&self) -> u64 {
        self.mailbox.sent_count()
    }

    pub fn received_count(&self) -> u64 {
        self.mailbox.received_count()
    }

    pub fn active_timers(&self) -> u32 {
        self.mailbox.active_timers()
    }

    pub fn reference_count(&self) -> u32 {
        self.mailbox.reference_count()
    }

    pub fn debug_value(&self) -> i32 {
        self.mailbox.debug_value()
    }

    pub fn set_debug_value(&self, value: i32) {
        self.mailbox.set_debug_value(value);
    }

    pub async fn activate(&self) -> Result<()> {
        self.mailbox.activate().await
    }

    pub async fn deactivate(&self) -> Result<()> {
        self.mailbox.deactivate().await
    }

    pub async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        self.mailbox.post(message).await
    }

    pub async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<()> {
        self.mailbox.post_with_timeout(message, timeout).await
    }

    pub async fn get_message(&self, timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        self.mailbox.get_message(timeout).await
    }

    pub fn get_message_non_blocking(&self) -> Option<Box<dyn Message>> {
        self.mailbox.get_message_non_blocking()
    }

    pub async fn schedule_timer(&self, timer: TimerMessage) -> Result<TimerId> {
        self.mailbox.schedule_timer(timer).await
    }

    pub async fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        self.mailbox.cancel_timer(timer_id).await
    }

    pub async fn reset_timer_interval(&self, timer_id: TimerId, interval: Duration) -> Result<()> {
        self.mailbox.reset_timer_interval(timer_id, interval).await
    }

    /// Demote to a posting handle (acquires its own reference).
    pub fn to_handle(&self) -> MailboxHandle {
        MailboxHandle::new(Arc::clone(&self.mailbox))
    }
}

impl Clone for MailboxOwnerHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.mailbox))
    }
}

impl Drop for MailboxOwnerHandle {
    fn drop(&mut self) {
        release_handle(&self.mailbox);
    }
}
