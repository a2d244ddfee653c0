// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! Wires a collection of [`Peer`]s into a multi-threaded packet pipeline
//! sitting on a virtual interface and a UDP socket pair.
//!
//! A [`Device`] owns the interface, the listening sockets, the peer tables
//! and the data-plane [`workers::Pipeline`]. One or more `event_loop`
//! threads (spawned by [`DeviceHandle`]) take turns blocking in
//! [`EventPoll::wait`], dispatching whichever event fires to its registered
//! [`Handler`]. Handshake-carrying datagrams are routed and processed
//! inline, on whichever thread receives them; everything else is handed off
//! to the encrypt/decrypt/writer pools in [`workers`].

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use rand_core::{OsRng, RngCore};
use socket2::{Domain, Protocol, Type};
use thiserror::Error as ThisError;

use crate::noise::handshake::{parse_handshake_anon, HalfHandshake};
use crate::noise::rate_limiter::RateLimiter;
use crate::noise::{HandshakeInit, Packet, Tunn, TunnResult};
use crate::x25519;

mod allowed_ips;
mod api;
mod buffer_pool;
mod dev_lock;
mod drop_privileges;
mod peer;
mod reorder;
pub(crate) mod workers;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
use epoll::{EventPoll, EventRef, WaitResult};

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
use kqueue::{EventPoll, EventRef, WaitResult};

#[cfg(target_os = "linux")]
mod tun_linux;
#[cfg(target_os = "linux")]
use tun_linux::TunSocket;

#[cfg(any(target_os = "macos", target_os = "ios"))]
mod tun_darwin;
#[cfg(any(target_os = "macos", target_os = "ios"))]
use tun_darwin::TunSocket;

#[cfg(all(test, not(target_os = "macos")))]
mod integration_tests;

use allowed_ips::AllowedIps;
use buffer_pool::BUFFER_SIZE;
use dev_lock::{Lock, LockReadGuard};
use workers::{DecryptJob, Decrypted, EncryptJob, Outcome, Pipeline};

pub use peer::AllowedIP;
pub(crate) use peer::Peer;

/// A tunnel peer never advertises a session index larger than this many
/// bits; the low byte is reserved so [`Tunn::new`] can fold in a session
/// slot without colliding with another peer's index.
const PEER_INDEX_BITS: u32 = 24;
const HANDSHAKE_RATE_LIMIT: u64 = 10;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("i/o error: {0}")]
    IoError(#[from] io::Error),
    #[error("socket error: {0}")]
    Socket(io::Error),
    #[error("bind error: {0}")]
    Bind(String),
    #[error("fcntl error: {0}")]
    FCntl(io::Error),
    #[error("event queue error: {0}")]
    EventQueue(io::Error),
    #[error("failed to drop privileges: {0}")]
    DropPrivileges(String),
    #[error("api socket error: {0}")]
    ApiSocket(io::Error),
    #[error("connect error: {0}")]
    Connect(String),
    #[error("ioctl error: {0}")]
    IOCtl(io::Error),
    #[error("timer error: {0}")]
    Timer(io::Error),
    #[error("invalid tunnel name")]
    InvalidTunnelName,
    #[error("failed to read from interface: {0}")]
    IfaceRead(io::Error),
}

/// What an event handler asks the event loop to do once it returns.
pub(crate) enum Action {
    Continue,
    Exit,
}

/// Scratch space reused by an `event_loop` thread across iterations, so
/// handshake processing on the hot path does not allocate.
pub(crate) struct ThreadData {
    dst_buf: [u8; BUFFER_SIZE],
}

impl ThreadData {
    fn new() -> Self {
        ThreadData {
            dst_buf: [0u8; BUFFER_SIZE],
        }
    }
}

/// A registered event's callback. Takes `&mut LockReadGuard<Device>` (rather
/// than `&Device`) so a handler that needs to change device configuration,
/// such as the uapi `set` command, can call [`LockReadGuard::try_writeable`]
/// on it directly.
pub(crate) type Handler =
    Box<dyn Fn(&mut LockReadGuard<'_, Device>, &mut ThreadData) -> Action + Sync + Send>;

/// Runtime configuration for a [`Device`], fixed for its lifetime.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Size of each of the encrypt/decrypt/interface-writer pools.
    pub n_threads: usize,
    /// Connect the per-peer endpoint socket once the handshake completes,
    /// rather than calling `send_to`/`recv_from` on the shared listener for
    /// every datagram.
    pub use_connected_socket: bool,
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    /// Bind the UDP listener with `SO_REUSEPORT` and one socket per worker.
    pub use_multi_queue: bool,
    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    /// A pre-opened uapi control socket fd, or -1 to have [`Device::new`]
    /// register the usual Unix socket under `/var/run/wireguard`.
    pub uapi_fd: i32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            n_threads: num_cpus::get().max(1),
            use_connected_socket: true,
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            use_multi_queue: true,
            #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
            uapi_fd: -1,
        }
    }
}

/// Owns the interface, sockets, peer tables and data-plane pipeline for a
/// single tunnel. Reached through a [`Lock`] so the control plane (uapi
/// `set` commands) can briefly pause the data plane to mutate it safely;
/// see [`dev_lock`] for how that handshake works.
pub struct Device {
    key_pair: Option<(x25519::StaticSecret, x25519::PublicKey)>,
    queue: EventPoll<Handler>,
    listen_port: u16,
    fwmark: Option<u32>,
    iface: Arc<TunSocket>,
    udp4: Option<Arc<socket2::Socket>>,
    udp6: Option<Arc<socket2::Socket>>,
    yield_notice: Option<EventRef>,
    exit_notice: Option<EventRef>,
    peers: HashMap<x25519::PublicKey, Arc<Mutex<Peer>>>,
    peers_by_idx: HashMap<u32, Arc<Mutex<Peer>>>,
    peers_by_ip: AllowedIps<Arc<Mutex<Peer>>>,
    rate_limiter: Option<Arc<RateLimiter>>,
    mtu: AtomicUsize,
    config: DeviceConfig,
    cleanup_paths: Vec<String>,
    pipeline: Arc<Pipeline>,
}

impl Device {
    pub fn new(name: &str, config: DeviceConfig) -> Result<Device, Error> {
        let iface = TunSocket::new(name)?.set_non_blocking()?;
        let mtu = iface.mtu()?;

        let queue = EventPoll::new()?;

        let mut device = Device {
            key_pair: None,
            queue,
            listen_port: 0,
            fwmark: None,
            iface: Arc::new(iface),
            udp4: None,
            udp6: None,
            yield_notice: None,
            exit_notice: None,
            peers: HashMap::new(),
            peers_by_idx: HashMap::new(),
            peers_by_ip: AllowedIps::new(),
            rate_limiter: None,
            mtu: AtomicUsize::new(mtu),
            config,
            cleanup_paths: Vec::new(),
            pipeline: Arc::new(Pipeline::new()),
        };

        device.register_notifiers()?;
        device.register_timers()?;
        device.register_iface_handler(Arc::clone(&device.iface))?;

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        if device.config.uapi_fd >= 0 {
            device.register_api_fd(device.config.uapi_fd)?;
        } else {
            device.register_api_handler()?;
        }
        #[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
        device.register_api_handler()?;

        device.pipeline.spawn_pools(device.config.n_threads);
        device
            .pipeline
            .spawn_writers(device.config.n_threads, Arc::clone(&device.iface));

        Ok(device)
    }

    fn register_notifiers(&mut self) -> Result<(), Error> {
        self.yield_notice = Some(
            self.queue
                .new_notifier(Box::new(move |_, _| Action::Continue))?,
        );
        self.exit_notice = Some(
            self.queue
                .new_notifier(Box::new(move |_, _| Action::Exit))?,
        );
        Ok(())
    }

    /// Sweeps every peer roughly four times a second, letting
    /// [`Tunn::update_timers`] drive retransmits, rekeys and keepalives.
    fn register_timers(&self) -> Result<(), Error> {
        self.queue.new_periodic_event(
            Box::new(move |d, t| {
                let peers: Vec<_> = d.peers.values().cloned().collect();
                for peer in peers {
                    let result = {
                        let mut peer_lock = peer.lock();
                        peer_lock.update_timers(&mut t.dst_buf)
                    };
                    match result {
                        TunnResult::Done => {}
                        TunnResult::Err(e) => {
                            tracing::debug!(message = "timer tick failed", error = ?e);
                        }
                        TunnResult::WriteToNetwork(packet) => {
                            if let Some(addr) = peer.lock().endpoint().addr {
                                d.send_to(addr, packet);
                            }
                        }
                        TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {}
                    }
                }
                Action::Continue
            }),
            Duration::from_millis(250),
        )?;
        Ok(())
    }

    fn register_iface_handler(&self, iface: Arc<TunSocket>) -> Result<(), Error> {
        self.queue.new_event(
            iface.as_raw_fd(),
            Box::new(move |d, _| {
                loop {
                    let mut buf = match d.pipeline.buffer_pool.acquire() {
                        Some(buf) => buf,
                        None => break,
                    };

                    let len = match d.iface.read(buf.as_mut_slice()) {
                        Ok(slice) => slice.len(),
                        Err(_) => {
                            d.pipeline.buffer_pool.release(buf);
                            break;
                        }
                    };
                    buf.set_len(len);

                    let dst_addr = match Tunn::dst_address(buf.as_slice()) {
                        Some(addr) => addr,
                        None => {
                            d.pipeline.buffer_pool.release(buf);
                            continue;
                        }
                    };

                    match d.peers_by_ip.find(dst_addr).cloned() {
                        Some(peer) => {
                            let seq = peer.lock().next_outbound_seq();
                            workers::send_encrypt_job_drop_oldest(
                                &d.pipeline.encrypt_tx,
                                &d.pipeline.encrypt_rx,
                                &d.pipeline.outcome_tx,
                                &d.pipeline.buffer_pool,
                                EncryptJob {
                                    peer,
                                    seq,
                                    packet: buf,
                                },
                            );
                        }
                        None => d.pipeline.buffer_pool.release(buf),
                    }
                }
                Action::Continue
            }),
        )?;
        Ok(())
    }

    fn register_udp_handler(&self, socket: Arc<socket2::Socket>) -> Result<(), Error> {
        self.queue.new_event(
            socket.as_raw_fd(),
            Box::new(move |d, t| {
                loop {
                    let mut buf = match d.pipeline.buffer_pool.acquire() {
                        Some(buf) => buf,
                        None => break,
                    };

                    let (len, from) =
                        match socket.recv_from(as_uninit_mut(buf.as_mut_slice())) {
                            Ok((len, addr)) => match addr.as_socket() {
                                Some(addr) => (len, addr),
                                None => {
                                    d.pipeline.buffer_pool.release(buf);
                                    continue;
                                }
                            },
                            Err(_) => {
                                d.pipeline.buffer_pool.release(buf);
                                break;
                            }
                        };
                    buf.set_len(len);

                    match Tunn::parse_incoming_packet(buf.as_slice()) {
                        Ok(Packet::HandshakeInit(ref hs)) => {
                            d.process_handshake_init(hs, from, buf.as_slice(), &mut t.dst_buf);
                            d.pipeline.buffer_pool.release(buf);
                        }
                        Ok(Packet::HandshakeResponse(ref r)) => {
                            d.route_to_decrypt_pool(r.receiver_idx, from, buf);
                        }
                        Ok(Packet::PacketCookieReply(ref r)) => {
                            d.route_to_decrypt_pool(r.receiver_idx, from, buf);
                        }
                        Ok(Packet::PacketData(ref r)) => {
                            d.route_to_decrypt_pool(r.receiver_idx, from, buf);
                        }
                        Err(_) => d.pipeline.buffer_pool.release(buf),
                    }
                }
                Action::Continue
            }),
        )?;
        Ok(())
    }

    /// Decrypts a handshake-initiation message synchronously, on whichever
    /// thread received it, rather than staging it through the decrypt pool:
    /// EPOLLONESHOT already serializes a single socket's deliveries, which
    /// is all the ordering the handshake state machine needs.
    fn process_handshake_init(
        &self,
        hs: &HandshakeInit,
        from: SocketAddr,
        datagram: &[u8],
        dst: &mut [u8],
    ) {
        let (static_private, static_public) = match &self.key_pair {
            Some(kp) => kp,
            None => return,
        };

        let half = match parse_handshake_anon(static_private, static_public, hs) {
            Ok(half) => half,
            Err(e) => {
                tracing::debug!(message = "rejected handshake initiation", error = ?e);
                return;
            }
        };
        let HalfHandshake {
            peer_static_public, ..
        } = half;

        let pub_key = x25519::PublicKey::from(peer_static_public);
        let peer = match self.peers.get(&pub_key).cloned() {
            Some(peer) => peer,
            None => return,
        };

        let result = {
            let mut peer_lock = peer.lock();
            peer_lock.tunnel.decapsulate(Some(from.ip()), datagram, dst)
        };
        match result {
            TunnResult::Done => {}
            TunnResult::Err(e) => {
                tracing::debug!(message = "handshake initiation rejected", error = ?e);
            }
            TunnResult::WriteToNetwork(packet) => {
                peer.lock().set_endpoint(from);
                self.send_to(from, packet);
            }
            TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                unreachable!("a handshake initiation never decapsulates to a tunnel packet")
            }
        }
    }

    /// Routes an indexed packet (everything but a handshake initiation) to
    /// the decrypt pool. On overflow the new datagram is dropped, not the
    /// oldest queued one: unlike the outbound path, dropping an
    /// already-staged inbound job would corrupt that peer's sequence
    /// numbering. The dropped job's sequence number is still completed as a
    /// gap (`None`), so it doesn't stall delivery of every later packet
    /// behind it until the reassembler's own backstop kicks in.
    fn route_to_decrypt_pool(
        &self,
        receiver_idx: u32,
        from: SocketAddr,
        datagram: buffer_pool::PoolBuf,
    ) {
        let index = receiver_idx >> 8;
        let peer = match self.peers_by_idx.get(&index).cloned() {
            Some(peer) => peer,
            None => {
                self.pipeline.buffer_pool.release(datagram);
                return;
            }
        };

        let seq = peer.lock().next_inbound_seq();
        let job = DecryptJob {
            peer,
            seq,
            from,
            datagram,
        };
        if let Err(crossbeam_channel::TrySendError::Full(job))
        | Err(crossbeam_channel::TrySendError::Disconnected(job)) =
            self.pipeline.decrypt_tx.try_send(job)
        {
            let drained = job.peer.lock().inbound_reorder.complete(job.seq, None);
            self.pipeline.buffer_pool.release(job.datagram);
            for item in drained {
                let outcome = match item {
                    Some(Decrypted::Network(addr, buf)) => Outcome::ToNetwork(addr, buf),
                    Some(Decrypted::Iface4(buf)) => Outcome::ToInterfaceV4(buf),
                    Some(Decrypted::Iface6(buf)) => Outcome::ToInterfaceV6(buf),
                    None => continue,
                };
                let _ = self.pipeline.outcome_tx.send(outcome);
            }
        }
    }

    fn send_to(&self, addr: SocketAddr, packet: &[u8]) {
        let socket = if addr.is_ipv4() {
            &self.udp4
        } else {
            &self.udp6
        };
        if let Some(socket) = socket {
            if let Err(e) = socket.send_to(packet, &addr.into()) {
                tracing::warn!(message = "udp send failed", error = %e, addr = %addr);
            }
        }
    }

    /// Opens (or reopens) the IPv4 and IPv6 listening sockets on `port`.
    /// `port == 0` lets the OS pick a port, mirroring the IPv4 socket's
    /// choice onto the IPv6 one.
    pub fn open_listen_socket(&mut self, port: u16) -> Result<(), Error> {
        let udp_sock4 = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        udp_sock4.set_reuse_address(true)?;
        udp_sock4.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        udp_sock4.set_nonblocking(true)?;

        let port = if port == 0 {
            match udp_sock4.local_addr()?.as_socket() {
                Some(SocketAddr::V4(addr)) => addr.port(),
                _ => port,
            }
        } else {
            port
        };

        let udp_sock6 = socket2::Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        udp_sock6.set_reuse_address(true)?;
        udp_sock6.bind(&SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0).into())?;
        udp_sock6.set_nonblocking(true)?;

        #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
        if let Some(fwmark) = self.fwmark {
            udp_sock4.set_mark(fwmark)?;
            udp_sock6.set_mark(fwmark)?;
        }

        let udp_sock4 = Arc::new(udp_sock4);
        let udp_sock6 = Arc::new(udp_sock6);

        self.listen_port = port;
        self.udp4 = Some(Arc::clone(&udp_sock4));
        self.udp6 = Some(Arc::clone(&udp_sock6));
        self.pipeline
            .set_udp_sockets(Some(Arc::clone(&udp_sock4)), Some(Arc::clone(&udp_sock6)));

        self.register_udp_handler(udp_sock4)?;
        self.register_udp_handler(udp_sock6)?;

        Ok(())
    }

    pub fn set_key(&mut self, private_key: x25519::StaticSecret) {
        let public_key = x25519::PublicKey::from(&private_key);
        if self.key_pair.as_ref().map(|(_, p)| p) == Some(&public_key) {
            return;
        }

        let rate_limiter = Arc::new(RateLimiter::new(&public_key, HANDSHAKE_RATE_LIMIT));
        for peer in self.peers.values() {
            peer.lock().tunnel.set_static_private(
                private_key.clone(),
                public_key,
                Some(Arc::clone(&rate_limiter)),
            );
        }

        self.rate_limiter = Some(rate_limiter);
        self.key_pair = Some((private_key, public_key));
    }

    #[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
    pub fn set_fwmark(&mut self, mark: u32) -> Result<(), Error> {
        self.fwmark = Some(mark);
        if let Some(ref sock) = self.udp4 {
            sock.set_mark(mark)?;
        }
        if let Some(ref sock) = self.udp6 {
            sock.set_mark(mark)?;
        }
        Ok(())
    }

    pub fn clear_peers(&mut self) {
        self.peers.clear();
        self.peers_by_idx.clear();
        self.peers_by_ip.clear();
    }

    pub fn remove_peer(&mut self, pub_key: &x25519::PublicKey) {
        if let Some(peer) = self.peers.remove(pub_key) {
            peer.lock().shutdown_endpoint();
            self.peers_by_idx.retain(|_, p| !Arc::ptr_eq(p, &peer));
            self.peers_by_ip.remove(&|p| Arc::ptr_eq(p, &peer));
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_peer(
        &mut self,
        pub_key: x25519::PublicKey,
        remove: bool,
        replace_ips: bool,
        endpoint: Option<SocketAddr>,
        allowed_ips: &[AllowedIP],
        keepalive: Option<u16>,
        preshared_key: Option<[u8; 32]>,
    ) {
        if remove {
            self.remove_peer(&pub_key);
            return;
        }

        if let Some(peer) = self.peers.get(&pub_key).cloned() {
            if let Some(endpoint) = endpoint {
                peer.lock().set_endpoint(endpoint);
            }
            if replace_ips {
                self.peers_by_ip.remove(&|p| Arc::ptr_eq(p, &peer));
            }
            for AllowedIP { addr, cidr } in allowed_ips {
                self.peers_by_ip
                    .insert(*addr, *cidr as u32, Arc::clone(&peer));
            }
            return;
        }

        let (static_private, _) = match &self.key_pair {
            Some(kp) => kp.clone(),
            None => return,
        };

        let index = self.next_peer_index();
        let tunn = Tunn::new(
            static_private,
            pub_key,
            preshared_key,
            keepalive,
            index,
            self.rate_limiter.clone(),
        );
        let peer = Arc::new(Mutex::new(Peer::new(
            tunn,
            index,
            endpoint,
            allowed_ips,
            preshared_key,
        )));

        self.peers.insert(pub_key, Arc::clone(&peer));
        self.peers_by_idx.insert(index, Arc::clone(&peer));
        for AllowedIP { addr, cidr } in allowed_ips {
            self.peers_by_ip
                .insert(*addr, *cidr as u32, Arc::clone(&peer));
        }
    }

    fn next_peer_index(&self) -> u32 {
        let mask = (1u32 << PEER_INDEX_BITS) - 1;
        loop {
            let candidate = OsRng.next_u32() & mask;
            if !self.peers_by_idx.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub(crate) fn trigger_yield(&self) {
        self.queue
            .trigger_notification(self.yield_notice.as_ref().unwrap())
    }

    pub(crate) fn cancel_yield(&self) {
        self.queue
            .stop_notification(self.yield_notice.as_ref().unwrap())
    }

    pub(crate) fn trigger_exit(&self) {
        self.queue
            .trigger_notification(self.exit_notice.as_ref().unwrap())
    }

    /// The interface's current MTU, refreshed roughly every second by
    /// [`api::register_monitor`].
    pub fn mtu(&self) -> usize {
        self.mtu.load(Ordering::Relaxed)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.pipeline.shutdown();
        for path in &self.cleanup_paths {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn as_uninit_mut(buf: &mut [u8]) -> &mut [std::mem::MaybeUninit<u8>] {
    // SAFETY: `u8` and `MaybeUninit<u8>` share the same layout; this only
    // widens what the compiler assumes is initialized, it never narrows it.
    unsafe {
        std::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<std::mem::MaybeUninit<u8>>(), buf.len())
    }
}

/// Owns the worker threads that drive a [`Device`]'s event loop and the
/// `Arc<Lock<Device>>` they share.
pub struct DeviceHandle {
    device: Arc<Lock<Device>>,
    threads: Vec<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn new(name: &str, config: DeviceConfig) -> Result<DeviceHandle, Error> {
        let n_threads = config.n_threads;
        let device = Arc::new(Lock::new(Device::new(name, config)?));

        let mut threads = Vec::with_capacity(n_threads);
        for i in 0..n_threads {
            let device = Arc::clone(&device);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("quietline-event-{}", i))
                    .spawn(move || event_loop(&device))
                    .expect("failed to spawn event loop thread"),
            );
        }

        Ok(DeviceHandle { device, threads })
    }

    /// Blocks until every event loop thread has exited.
    pub fn wait(&mut self) {
        while let Some(thread) = self.threads.pop() {
            let _ = thread.join();
        }
    }

    /// Triggers a clean shutdown of every event loop thread.
    pub fn trigger_exit(&self) {
        self.device.read().trigger_exit();
    }
}

fn event_loop(device: &Lock<Device>) {
    let mut thread_data = ThreadData::new();
    loop {
        let mut guard = device.read();
        let action = match guard.queue.wait() {
            WaitResult::Ok(handler) => handler(&mut guard, &mut thread_data),
            WaitResult::EoF(handler) => handler(&mut guard, &mut thread_data),
            WaitResult::Error(e) => {
                tracing::error!(message = "event loop error", error = %e);
                Action::Continue
            }
        };
        if let Action::Exit = action {
            break;
        }
    }
}
