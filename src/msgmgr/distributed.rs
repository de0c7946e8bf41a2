//! Distributed mailbox: TCP stream server and its sender-side proxy

use crate::config::{DistributedMailboxConfig, MAX_MESSAGE_LENGTH};
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::msgmgr::address::{LocationType, MailboxAddress};
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::lookup::MailboxLookupService;
use crate::msgmgr::mailbox::{Mailbox, MailboxCore, MailboxOwnerHandle, TimerId};
use crate::msgmgr::message::{Message, MessageFactory, TimerMessage};
use crate::opm::SyncObjectPool;
use async_trait::async_trait;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// TCP server mailbox. Remote peers stream frames in; frames are rebuilt
/// into typed messages and land in the same local queue that same-process
/// senders post to directly (through the local-equivalent alias).
pub struct DistributedMailbox {
    self_ref: Weak<DistributedMailbox>,
    core: MailboxCore,
    lookup: Arc<MailboxLookupService>,
    factory: Arc<dyn MessageFactory>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    config: DistributedMailboxConfig,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DistributedMailbox {
    pub fn create(
        fabric: &Arc<Fabric>,
        mailbox_name: &str,
        endpoint: SocketAddrV4,
        config: DistributedMailboxConfig,
    ) -> MailboxOwnerHandle {
        let address =
            MailboxAddress::distributed(mailbox_name, endpoint).with_neid(&fabric.config().neid);
        let mailbox = Arc::new_cyclic(|self_ref| DistributedMailbox {
            self_ref: self_ref.clone(),
            core: MailboxCore::new(
                address,
                fabric.config().queue_depth,
                fabric.config().debug_value,
            ),
            lookup: Arc::clone(fabric.lookup()),
            factory: Arc::clone(fabric.factory()),
            buffer_pool: Arc::clone(fabric.buffer_pool()),
            config,
            io_tasks: Mutex::new(Vec::new()),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    fn endpoint(&self) -> Result<SocketAddrV4> {
        self.core.address().endpoint.ok_or_else(|| {
            Error::InvalidArgument("distributed mailbox address has no endpoint".into())
        })
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.io_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
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

    /// Read frames off one accepted stream until the peer goes away.
    async fn serve_stream(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        loop {
            let mut len_bytes = [0u8; 4];
            if let Err(e) = stream.read_exact(&mut len_bytes).await {
                info!("peer {} disconnected from {}: {}", peer, self.core.address(), e);
                return;
            }
            let frame_len = u32::from_be_bytes(len_bytes) as usize;
            if frame_len < 2 || frame_len > MAX_MESSAGE_LENGTH {
                warn!(
                    "peer {} sent a mis-sized frame ({} bytes), dropping the stream",
                    peer, frame_len
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
            let room = match buffer.make_room(frame_len) {
                Ok(room) => room,
                Err(e) => {
                    error!("frame of {} bytes rejected: {e}", frame_len);
                    return;
                }
            };
            if let Err(e) = stream.read_exact(room).await {
                info!("peer {} disconnected mid-frame: {}", peer, e);
                return;
            }

            if self.core.debug_value() != 0 {
                debug!("frame from {}: {}", peer, buffer.hex_dump());
            }

            match self.factory.recreate_message_from_buffer(&mut buffer) {
                Ok(mut message) => {
                    if buffer.remaining() >= 4
                        && let Ok(priority) = buffer.extract_u32()
                    {
                        message.set_priority(priority);
                    }
                    if message.source_address().location_type == LocationType::Unknown
                        && let SocketAddr::V4(peer_v4) = peer
                    {
                        message.set_source_address(MailboxAddress::distributed("", peer_v4));
                    }
                    if let Err(e) = self.core.enqueue(message, None).await {
                        warn!("inbound message from {} dropped: {e}", peer);
                    }
                }
                // A bad frame is transient: log it and keep the stream
                Err(e) => warn!("failed to rebuild message from {}: {e}", peer),
            }
        }
    }
}

#[async_trait]
impl Mailbox for DistributedMailbox {
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
        let endpoint = self.endpoint()?;
        self.core.open().await?;

        let listener = (|| -> Result<tokio::net::TcpListener> {
            let socket = TcpSocket::new_v4()?;
            if self.config.reuse_addr {
                socket.set_reuseaddr(true)?;
            }
            socket.bind(SocketAddr::V4(endpoint))?;
            Ok(socket.listen(128)?)
        })()
        .map_err(|e| {
            self.core.close();
            Error::TransportFatal(format!("cannot listen on {endpoint}: {e}"))
        })?;

        let this = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        let acceptor = Arc::clone(&this);
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("accepted stream from {} on {}", peer, acceptor.core.address());
                        let server = Arc::clone(&acceptor);
                        let task = tokio::spawn(server.clone().serve_stream(stream, peer));
                        server.track_task(task);
                    }
                    // Transient accept failures never stop the reactor
                    Err(e) => warn!("accept failed on {}: {e}", acceptor.core.address()),
                }
            }
        });
        self.track_task(accept_task);

        let mailbox: Arc<dyn Mailbox> = this;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            self.abort_io_tasks();
            self.core.close();
            return Err(e);
        }
        info!("distributed mailbox {} listening", self.core.address());
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.core.close() {
            return Ok(());
        }
        self.abort_io_tasks();
        self.lookup.deregister_mailbox(self.core.address()).await;
        info!("distributed mailbox {} deactivated", self.core.address());
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

/// Sender-side stand-in for a remote [`DistributedMailbox`]. Serializes
/// posted messages and writes them to a TCP stream; a failed send gets one
/// reconnect-and-retry before the error is surfaced, at which point the
/// caller's contract is to drop the handle and re-find.
pub struct DistributedMailboxProxy {
    self_ref: Weak<DistributedMailboxProxy>,
    address: MailboxAddress,
    lookup: Arc<MailboxLookupService>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    config: DistributedMailboxConfig,
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    active: AtomicBool,
    debug_value: AtomicI32,
    references: AtomicU32,
    sent: AtomicU64,
}

impl DistributedMailboxProxy {
    pub(crate) fn create(
        lookup: &Arc<MailboxLookupService>,
        buffer_pool: &Arc<SyncObjectPool<MessageBuffer>>,
        address: MailboxAddress,
        config: DistributedMailboxConfig,
    ) -> MailboxOwnerHandle {
        let mailbox = Arc::new_cyclic(|self_ref| DistributedMailboxProxy {
            self_ref: self_ref.clone(),
            address,
            lookup: Arc::clone(lookup),
            buffer_pool: Arc::clone(buffer_pool),
            config,
            stream: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            debug_value: AtomicI32::new(0),
            references: AtomicU32::new(0),
            sent: AtomicU64::new(0),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.config.io_timeout_ms)
    }

    async fn connect(&self) -> Result<TcpStream> {
        let endpoint = self.address.endpoint.ok_or_else(|| {
            Error::InvalidArgument("distributed proxy address has no endpoint".into())
        })?;
        match tokio::time::timeout(self.io_timeout(), TcpStream::connect(SocketAddr::V4(endpoint)))
            .await
        {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::TransportFatal(format!("connect to {endpoint}: {e}"))),
            Err(_) => Err(Error::TransportFatal(format!("connect to {endpoint} timed out"))),
        }
    }

    async fn send_frame(&self, frame: &[u8], timeout: Duration) -> Result<()> {
        let mut guard = self.stream.lock().await;
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::TransportTransient("proxy stream is not connected".into()))?;
        let len_bytes = (frame.len() as u32).to_be_bytes();
        let write = async {
            stream.write_all(&len_bytes).await?;
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                *guard = None;
                Err(Error::TransportTransient(format!("send failed: {e}")))
            }
            Err(_) => {
                *guard = None;
                Err(Error::TransportTransient("send timed out".into()))
            }
        }
    }

    async fn reconnect(&self) -> Result<()> {
        let stream = self.connect().await?;
        *self.stream.lock().await = Some(stream);
        Ok(())
    }

    async fn post_internal(&self, message: Box<dyn Message>, timeout: Duration) -> Result<()> {
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
                "posting message {:#06x} to {}: {}",
                message.message_id(),
                self.address,
                buffer.hex_dump()
            );
        }

        match self.send_frame(buffer.as_slice(), timeout).await {
            Ok(()) => {}
            Err(first) => {
                // One reconnect-and-retry, then the caller takes over
                warn!("send to {} failed ({first}), reconnecting once", self.address);
                self.reconnect().await.map_err(|e| {
                    Error::TransportTransient(format!("reconnect failed: {e}"))
                })?;
                self.send_frame(buffer.as_slice(), timeout).await?;
            }
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl Mailbox for DistributedMailboxProxy {
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
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                return Err(e);
            }
        };
        *self.stream.lock().await = Some(stream);

        let mailbox: Arc<dyn Mailbox> = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            *self.stream.lock().await = None;
            self.active.store(false, Ordering::Release);
            return Err(e);
        }
        info!("distributed proxy connected to {}", self.address);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        *self.stream.lock().await = None;
        self.lookup.deregister_proxy(&self.address).await;
        info!("distributed proxy to {} deactivated", self.address);
        Ok(())
    }

    async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        self.post_internal(message, self.io_timeout()).await
    }

    async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        timeout: Duration,
    ) -> Result<()> {
        self.post_internal(message, timeout).await
    }

    async fn get_message(&self, _timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        error!("getMessage on a distributed proxy is illegal; post-only endpoint");
        None
    }

    fn get_message_non_blocking(&self) -> Option<Box<dyn Message>> {
        error!("getMessage on a distributed proxy is illegal; post-only endpoint");
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
