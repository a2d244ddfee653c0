// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! The staged data-plane pipeline: a reader thread and UDP receive threads
//! stage work onto bounded channels, fixed worker pools perform the AEAD
//! work, and a per-peer [`super::reorder::Reassembler`] restores the order
//! packets arrived in before they reach the network or the interface.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use crate::device::buffer_pool::{BufferPool, PoolBuf};
use crate::device::peer::Peer;
use crate::noise::TunnResult;

/// Bounded depth for every staging channel in the pipeline. Chosen to match
/// [`crate::noise::Tunn`]'s own internal retransmit queue depth.
pub const QUEUE_DEPTH: usize = 1024;

pub(crate) struct EncryptJob {
    pub peer: Arc<Mutex<Peer>>,
    pub seq: u64,
    pub packet: PoolBuf,
}

pub(crate) struct DecryptJob {
    pub peer: Arc<Mutex<Peer>>,
    pub seq: u64,
    pub from: SocketAddr,
    pub datagram: PoolBuf,
}

/// A fully processed packet ready to leave the device, either onto the wire
/// or onto the local interface.
pub(crate) enum Outcome {
    ToNetwork(SocketAddr, Vec<u8>),
    ToInterfaceV4(Vec<u8>),
    ToInterfaceV6(Vec<u8>),
}

/// Try to enqueue `job`; if the channel is full, drop the single oldest
/// queued job to make room rather than blocking the reader thread. The
/// evicted job's sequence number is completed as a gap (`None`) rather than
/// silently forgotten, so it doesn't stall every later packet behind it in
/// the peer's [`super::reorder::Reassembler`] until the backstop there
/// kicks in, and its buffer is returned to the pool instead of leaking.
pub(crate) fn send_encrypt_job_drop_oldest(
    tx: &Sender<EncryptJob>,
    rx: &Receiver<EncryptJob>,
    outcome_tx: &Sender<Outcome>,
    buffer_pool: &BufferPool,
    mut job: EncryptJob,
) {
    loop {
        match tx.try_send(job) {
            Ok(()) => return,
            Err(TrySendError::Full(returned)) => {
                job = returned;
                if let Ok(evicted) = rx.try_recv() {
                    let endpoint_addr = evicted.peer.lock().endpoint().addr;
                    let drained = evicted.peer.lock().outbound_reorder.complete(evicted.seq, None);
                    for item in drained {
                        if let (Some(packet), Some(addr)) = (item, endpoint_addr) {
                            let _ = outcome_tx.send(Outcome::ToNetwork(addr, packet));
                        }
                    }
                    buffer_pool.release(evicted.packet);
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                buffer_pool.release(job.packet);
                return;
            }
        }
    }
}

/// Owns the channels and thread handles for the encryption, decryption and
/// interface-writer pools, plus the buffer pool they share.
pub(crate) struct Pipeline {
    pub buffer_pool: Arc<BufferPool>,
    pub encrypt_tx: Sender<EncryptJob>,
    pub encrypt_rx: Receiver<EncryptJob>,
    pub decrypt_tx: Sender<DecryptJob>,
    pub decrypt_rx: Receiver<DecryptJob>,
    pub outcome_tx: Sender<Outcome>,
    outcome_rx: Receiver<Outcome>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stop: Arc<AtomicBool>,
    /// The listening sockets the writer pool sends through. Held behind a
    /// lock rather than captured by value so [`Pipeline::set_udp_sockets`]
    /// can rebind them after the writer threads are already running.
    udp4: Arc<RwLock<Option<Arc<socket2::Socket>>>>,
    udp6: Arc<RwLock<Option<Arc<socket2::Socket>>>>,
}

impl Pipeline {
    pub fn new() -> Self {
        let (encrypt_tx, encrypt_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (decrypt_tx, decrypt_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        let (outcome_tx, outcome_rx) = crossbeam_channel::bounded(QUEUE_DEPTH);
        Pipeline {
            buffer_pool: Arc::new(BufferPool::new()),
            encrypt_tx,
            encrypt_rx,
            decrypt_tx,
            decrypt_rx,
            outcome_tx,
            outcome_rx,
            handles: Mutex::new(Vec::new()),
            stop: Arc::new(AtomicBool::new(false)),
            udp4: Arc::new(RwLock::new(None)),
            udp6: Arc::new(RwLock::new(None)),
        }
    }

    /// Swap in the sockets the writer pool sends through. Safe to call after
    /// the pool has started, e.g. when the listen port is (re)configured.
    pub fn set_udp_sockets(
        &self,
        udp4: Option<Arc<socket2::Socket>>,
        udp6: Option<Arc<socket2::Socket>>,
    ) {
        *self.udp4.write() = udp4;
        *self.udp6.write() = udp6;
    }

    pub fn outcomes(&self) -> Receiver<Outcome> {
        self.outcome_rx.clone()
    }

    /// Spawn the encryption and decryption pools, each sized to `n_threads`.
    pub fn spawn_pools(&self, n_threads: usize) {
        let pool_size = n_threads.max(1);

        let mut handles = self.handles.lock();
        for _ in 0..pool_size {
            handles.push(spawn_encrypt_worker(
                self.encrypt_rx.clone(),
                self.outcome_tx.clone(),
                Arc::clone(&self.buffer_pool),
                Arc::clone(&self.stop),
            ));
        }
        for _ in 0..pool_size {
            handles.push(spawn_decrypt_worker(
                self.decrypt_rx.clone(),
                self.outcome_tx.clone(),
                Arc::clone(&self.buffer_pool),
                Arc::clone(&self.stop),
            ));
        }
    }

    /// Spawn the interface-writer pool: threads that drain completed
    /// outcomes and perform the actual UDP send or TUN write. Kept separate
    /// from the encrypt/decrypt pools so a slow socket or interface never
    /// blocks cryptographic work from completing.
    pub fn spawn_writers(&self, n_threads: usize, iface: Arc<super::TunSocket>) {
        let pool_size = n_threads.max(1);
        let mut handles = self.handles.lock();
        for _ in 0..pool_size {
            handles.push(spawn_writer(
                self.outcome_rx.clone(),
                Arc::clone(&self.udp4),
                Arc::clone(&self.udp6),
                Arc::clone(&iface),
                Arc::clone(&self.stop),
            ));
        }
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `encapsulate`/`decapsulate` with a scratch buffer borrowed from the
/// pool for the duration of the call, then hands the pool buffer back.
fn with_scratch<R>(pool: &BufferPool, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
    let mut scratch = pool.acquire()?;
    let result = f(scratch.as_mut_slice());
    pool.release(scratch);
    Some(result)
}

fn spawn_encrypt_worker(
    rx: Receiver<EncryptJob>,
    outcome_tx: Sender<Outcome>,
    buffer_pool: Arc<BufferPool>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quietline-encrypt".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let job = match rx.recv_timeout(std::time::Duration::from_millis(250)) {
                    Ok(job) => job,
                    Err(_) => continue,
                };

                let sealed = with_scratch(&buffer_pool, |dst| {
                    let mut peer = job.peer.lock();
                    match peer.tunnel.encapsulate(job.packet.as_slice(), dst) {
                        TunnResult::Done => None,
                        TunnResult::Err(e) => {
                            tracing::warn!(message = "encapsulate failed", error = ?e);
                            None
                        }
                        TunnResult::WriteToNetwork(packet) => Some(packet.to_vec()),
                        TunnResult::WriteToTunnelV4(..) | TunnResult::WriteToTunnelV6(..) => {
                            unreachable!("encapsulate never returns a tunnel-bound packet")
                        }
                    }
                })
                .flatten();
                buffer_pool.release(job.packet);

                let endpoint_addr = job.peer.lock().endpoint().addr;
                let drained = job.peer.lock().outbound_reorder.complete(job.seq, sealed);
                for item in drained {
                    if let (Some(packet), Some(addr)) = (item, endpoint_addr) {
                        let _ = outcome_tx.send(Outcome::ToNetwork(addr, packet));
                    }
                }
            }
        })
        .expect("failed to spawn encryption worker")
}

fn spawn_writer(
    rx: Receiver<Outcome>,
    udp4: Arc<RwLock<Option<Arc<socket2::Socket>>>>,
    udp6: Arc<RwLock<Option<Arc<socket2::Socket>>>>,
    iface: Arc<super::TunSocket>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quietline-writer".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let outcome = match rx.recv_timeout(std::time::Duration::from_millis(250)) {
                    Ok(outcome) => outcome,
                    Err(_) => continue,
                };

                match outcome {
                    Outcome::ToNetwork(addr, packet) => {
                        let slot = if addr.is_ipv4() { &udp4 } else { &udp6 };
                        if let Some(socket) = slot.read().as_ref() {
                            if let Err(e) = socket.send_to(&packet, &addr.into()) {
                                tracing::warn!(message = "udp send failed", error = %e, addr = %addr);
                            }
                        }
                    }
                    Outcome::ToInterfaceV4(packet) => {
                        iface.write4(&packet);
                    }
                    Outcome::ToInterfaceV6(packet) => {
                        iface.write6(&packet);
                    }
                }
            }
        })
        .expect("failed to spawn interface-writer worker")
}

pub(crate) enum Decrypted {
    Network(SocketAddr, Vec<u8>),
    Iface4(Vec<u8>),
    Iface6(Vec<u8>),
}

fn spawn_decrypt_worker(
    rx: Receiver<DecryptJob>,
    outcome_tx: Sender<Outcome>,
    buffer_pool: Arc<BufferPool>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quietline-decrypt".into())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let job = match rx.recv_timeout(std::time::Duration::from_millis(250)) {
                    Ok(job) => job,
                    Err(_) => continue,
                };

                let from = job.from;
                let opened = with_scratch(&buffer_pool, |dst| {
                    let mut peer = job.peer.lock();
                    match peer
                        .tunnel
                        .decapsulate(Some(from.ip()), job.datagram.as_slice(), dst)
                    {
                        TunnResult::Done => None,
                        TunnResult::Err(e) => {
                            tracing::warn!(message = "decapsulate failed", error = ?e);
                            None
                        }
                        TunnResult::WriteToNetwork(packet) => {
                            // Authenticated (a handshake-response keepalive);
                            // learn the peer's roamed source address.
                            peer.set_endpoint(from);
                            Some(Decrypted::Network(from, packet.to_vec()))
                        }
                        TunnResult::WriteToTunnelV4(packet, addr) => {
                            if peer.is_allowed_ip(addr) {
                                peer.set_endpoint(from);
                                Some(Decrypted::Iface4(packet.to_vec()))
                            } else {
                                tracing::warn!(message = "source address not allowed", addr = %addr);
                                None
                            }
                        }
                        TunnResult::WriteToTunnelV6(packet, addr) => {
                            if peer.is_allowed_ip(addr) {
                                peer.set_endpoint(from);
                                Some(Decrypted::Iface6(packet.to_vec()))
                            } else {
                                tracing::warn!(message = "source address not allowed", addr = %addr);
                                None
                            }
                        }
                    }
                })
                .flatten();
                buffer_pool.release(job.datagram);

                let drained = job.peer.lock().inbound_reorder.complete(job.seq, opened);
                for item in drained {
                    let outcome = match item {
                        Some(Decrypted::Network(addr, buf)) => Outcome::ToNetwork(addr, buf),
                        Some(Decrypted::Iface4(buf)) => Outcome::ToInterfaceV4(buf),
                        Some(Decrypted::Iface6(buf)) => Outcome::ToInterfaceV6(buf),
                        None => continue,
                    };
                    let _ = outcome_tx.send(outcome);
                }
            }
        })
        .expect("failed to spawn decryption worker")
}
