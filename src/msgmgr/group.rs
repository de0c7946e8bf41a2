//! Group mailbox: UDP multicast or broadcast endpoint and its proxy

use crate::config::{GroupMailboxConfig, MAX_MESSAGE_LENGTH};
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::msgmgr::address::{LocationType, MailboxAddress};
use crate::msgmgr::buffer::MessageBuffer;
use crate::msgmgr::lookup::MailboxLookupService;
use crate::msgmgr::mailbox::{Mailbox, MailboxCore, MailboxOwnerHandle, TimerId};
use crate::msgmgr::message::{Message, MessageFactory, TimerMessage};
use crate::opm::SyncObjectPool;
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Destinations in 224.0.0.0/4 are joined as multicast groups; anything
/// else is treated as a broadcast target.
fn is_multicast(endpoint: &SocketAddrV4) -> bool {
    endpoint.ip().is_multicast()
}

/// Datagram socket bound with address reuse, so several group members on
/// one host can share the port.
fn bind_reusable(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Receiving member of a UDP group. Datagrams are rebuilt into typed
/// messages and enqueued locally; no per-sender state is kept.
pub struct GroupMailbox {
    self_ref: Weak<GroupMailbox>,
    core: MailboxCore,
    lookup: Arc<MailboxLookupService>,
    factory: Arc<dyn MessageFactory>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    config: GroupMailboxConfig,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GroupMailbox {
    pub fn create(
        fabric: &Arc<Fabric>,
        mailbox_name: &str,
        endpoint: SocketAddrV4,
        config: GroupMailboxConfig,
    ) -> MailboxOwnerHandle {
        let address = MailboxAddress::group(mailbox_name, endpoint).with_neid(&fabric.config().neid);
        Self::create_with_address(
            fabric.lookup(),
            fabric.factory(),
            fabric.buffer_pool(),
            fabric.config().queue_depth,
            fabric.config().debug_value,
            address,
            config,
        )
    }

    pub(crate) fn create_with_address(
        lookup: &Arc<MailboxLookupService>,
        factory: &Arc<dyn MessageFactory>,
        buffer_pool: &Arc<SyncObjectPool<MessageBuffer>>,
        queue_depth: usize,
        debug_value: i32,
        address: MailboxAddress,
        config: GroupMailboxConfig,
    ) -> MailboxOwnerHandle {
        let mailbox = Arc::new_cyclic(|self_ref| GroupMailbox {
            self_ref: self_ref.clone(),
            core: MailboxCore::new(address, queue_depth, debug_value),
            lookup: Arc::clone(lookup),
            factory: Arc::clone(factory),
            buffer_pool: Arc::clone(buffer_pool),
            config,
            io_tasks: Mutex::new(Vec::new()),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    fn endpoint(&self) -> Result<SocketAddrV4> {
        self.core.address().endpoint.ok_or_else(|| {
            Error::InvalidArgument("group mailbox address has no endpoint".into())
        })
    }

    fn open_member_socket(&self, endpoint: SocketAddrV4) -> Result<UdpSocket> {
        if self.config.multicast_ttl > 255 {
            return Err(Error::InvalidArgument(format!(
                "multicast ttl {} out of range",
                self.config.multicast_ttl
            )));
        }
        let socket = bind_reusable(endpoint.port())?;
        if is_multicast(&endpoint) {
            socket.set_multicast_loop_v4(self.config.multicast_loopback_enabled)?;
            socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
            socket.join_multicast_v4(*endpoint.ip(), self.config.interface)?;
            debug!(
                "joined multicast group {} (loopback {}, ttl {})",
                endpoint, self.config.multicast_loopback_enabled, self.config.multicast_ttl
            );
        } else {
            socket.set_broadcast(true)?;
            debug!("broadcast group mailbox listening on {}", endpoint);
        }
        Ok(socket)
    }

    async fn receive_loop(self: Arc<Self>, socket: UdpSocket) {
        let mut datagram = [0u8; MAX_MESSAGE_LENGTH];
        loop {
            let (len, peer) = match socket.recv_from(&mut datagram).await {
                Ok(received) => received,
                // Transient receive failures never stop the reactor
                Err(e) => {
                    warn!("group receive failed on {}: {e}", self.core.address());
                    continue;
                }
            };
            if len < 2 {
                warn!("runt datagram ({len} bytes) from {peer} ignored");
                continue;
            }

            let mut buffer = match self.buffer_pool.reserve(true) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!("no receive buffer available: {e}");
                    continue;
                }
            };
            match buffer.make_room(len) {
                Ok(room) => room.copy_from_slice(&datagram[..len]),
                Err(e) => {
                    warn!("datagram of {len} bytes rejected: {e}");
                    continue;
                }
            }

            if self.core.debug_value() != 0 {
                debug!("datagram from {}: {}", peer, buffer.hex_dump());
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
                        message.set_source_address(MailboxAddress::group("", peer_v4));
                    }
                    if let Err(e) = self.core.enqueue(message, None).await {
                        warn!("group message from {peer} dropped: {e}");
                    }
                }
                Err(e) => warn!("failed to rebuild datagram from {peer}: {e}"),
            }
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
impl Mailbox for GroupMailbox {
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

        let socket = match self.open_member_socket(endpoint) {
            Ok(socket) => socket,
            Err(e) => {
                self.core.close();
                return Err(match e {
                    Error::InvalidArgument(_) => e,
                    other => Error::TransportFatal(format!("cannot open group {endpoint}: {other}")),
                });
            }
        };

        let this = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        let receive_task = tokio::spawn(Arc::clone(&this).receive_loop(socket));
        self.io_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(receive_task);

        let mailbox: Arc<dyn Mailbox> = this;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            self.abort_io_tasks();
            self.core.close();
            return Err(e);
        }
        info!("group mailbox {} active", self.core.address());
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.core.close() {
            return Ok(());
        }
        self.abort_io_tasks();
        self.lookup.deregister_mailbox(self.core.address()).await;
        info!("group mailbox {} deactivated", self.core.address());
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

/// Sender-side stand-in for a UDP group. One datagram per post; a failed
/// send is an error with no retry.
pub struct GroupMailboxProxy {
    self_ref: Weak<GroupMailboxProxy>,
    address: MailboxAddress,
    lookup: Arc<MailboxLookupService>,
    buffer_pool: Arc<SyncObjectPool<MessageBuffer>>,
    config: GroupMailboxConfig,
    socket: tokio::sync::Mutex<Option<UdpSocket>>,
    active: AtomicBool,
    debug_value: AtomicI32,
    references: AtomicU32,
    sent: AtomicU64,
}

impl GroupMailboxProxy {
    pub(crate) fn create(
        lookup: &Arc<MailboxLookupService>,
        buffer_pool: &Arc<SyncObjectPool<MessageBuffer>>,
        address: MailboxAddress,
        config: GroupMailboxConfig,
    ) -> MailboxOwnerHandle {
        let mailbox = Arc::new_cyclic(|self_ref| GroupMailboxProxy {
            self_ref: self_ref.clone(),
            address,
            lookup: Arc::clone(lookup),
            buffer_pool: Arc::clone(buffer_pool),
            config,
            socket: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            debug_value: AtomicI32::new(0),
            references: AtomicU32::new(0),
            sent: AtomicU64::new(0),
        });
        MailboxOwnerHandle::new(mailbox)
    }

    fn open_sender_socket(&self, endpoint: SocketAddrV4) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into())?;
        if is_multicast(&endpoint) {
            socket.set_multicast_loop_v4(self.config.multicast_loopback_enabled)?;
            socket.set_multicast_ttl_v4(self.config.multicast_ttl)?;
            if !self.config.interface.is_unspecified() {
                socket.set_multicast_if_v4(&self.config.interface)?;
            }
        } else {
            socket.set_broadcast(true)?;
        }
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

#[async_trait]
impl Mailbox for GroupMailboxProxy {
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
        let endpoint = self.address.endpoint.ok_or_else(|| {
            self.active.store(false, Ordering::Release);
            Error::InvalidArgument("group proxy address has no endpoint".into())
        })?;
        let socket = match self.open_sender_socket(endpoint) {
            Ok(socket) => socket,
            Err(e) => {
                self.active.store(false, Ordering::Release);
                return Err(Error::TransportFatal(format!(
                    "cannot open group sender for {endpoint}: {e}"
                )));
            }
        };
        *self.socket.lock().await = Some(socket);

        let mailbox: Arc<dyn Mailbox> = self.self_ref.upgrade().ok_or(Error::Inactive)?;
        if let Err(e) = self.lookup.register_mailbox(mailbox).await {
            *self.socket.lock().await = None;
            self.active.store(false, Ordering::Release);
            return Err(e);
        }
        info!("group proxy sending to {}", self.address);
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        *self.socket.lock().await = None;
        self.lookup.deregister_proxy(&self.address).await;
        info!("group proxy to {} deactivated", self.address);
        Ok(())
    }

    async fn post(&self, message: Box<dyn Message>) -> Result<()> {
        if !self.is_active() {
            return Err(Error::Inactive);
        }
        let endpoint = self.address.endpoint.ok_or_else(|| {
            Error::InvalidArgument("group proxy address has no endpoint".into())
        })?;

        let mut buffer = self.buffer_pool.reserve(true)?;
        buffer.insert_u16(message.message_id())?;
        message.serialize(&mut buffer)?;
        if message.priority() != 0 {
            buffer.insert_u32(message.priority())?;
        }

        if self.debug_value() != 0 {
            debug!(
                "posting message {:#06x} to group {}: {}",
                message.message_id(),
                self.address,
                buffer.hex_dump()
            );
        }

        let guard = self.socket.lock().await;
        let socket = guard
            .as_ref()
            .ok_or_else(|| Error::TransportTransient("group socket is not open".into()))?;
        match socket.send_to(buffer.as_slice(), SocketAddr::V4(endpoint)).await {
            Ok(_) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(Error::TransportTransient(format!("group send failed: {e}"))),
        }
    }

    async fn post_with_timeout(
        &self,
        message: Box<dyn Message>,
        _timeout: Duration,
    ) -> Result<()> {
        // Datagram sends never block; the timeout has nothing to bound
        self.post(message).await
    }

    async fn get_message(&self, _timeout: Option<Duration>) -> Option<Box<dyn Message>> {
        error!("getMessage on a group proxy is illegal; post-only endpoint");
        None
    }

    fn get_message_non_blocking(&self) -> Option<Box<dyn Message>> {
        error!("getMessage on a group proxy is illegal; post-only endpoint");
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
