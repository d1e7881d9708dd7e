//! UDP bus -- a shared multi-drop bus emulated over datagrams.
//!
//! Each bus frame is one 10-byte datagram, sent to every known station.
//! Stations are the configured peers plus any sender heard from. The
//! receive filter drops frames for other nodes unless the accept filter is
//! open.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::BytesMut;
use canbus_protocol::{BusFrameCodec, NodeAddress, Packet, BUS_FRAME_SIZE};
use canbus_transport::{Bus, Transport, TransportError};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio_util::codec::{Decoder, Encoder};

pub struct UdpBus {
    socket: Arc<UdpSocket>,
    stations: Arc<Mutex<Vec<SocketAddr>>>,
    accept_all: Arc<AtomicBool>,
}

impl UdpBus {
    pub async fn bind(listen: &str, peers: &[String]) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        let local = socket.local_addr()?;
        let mut stations = Vec::with_capacity(peers.len());
        for peer in peers {
            let addr: SocketAddr = tokio::net::lookup_host(peer.as_str())
                .await?
                .next()
                .ok_or_else(|| anyhow::anyhow!("peer {peer} did not resolve"))?;
            if addr != local && !stations.contains(&addr) {
                stations.push(addr);
            }
        }
        tracing::info!(%local, peers = stations.len(), "udp bus bound");
        Ok(Self {
            socket: Arc::new(socket),
            stations: Arc::new(Mutex::new(stations)),
            accept_all: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The receive side, to be run once the transport exists.
    pub fn receiver(&self) -> UdpReceiver {
        UdpReceiver {
            socket: self.socket.clone(),
            stations: self.stations.clone(),
            accept_all: self.accept_all.clone(),
        }
    }

    pub fn stations(&self) -> Vec<SocketAddr> {
        self.stations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Bus for UdpBus {
    fn transmit(&self, pkt: &Packet) -> canbus_transport::Result<()> {
        let mut frame = BytesMut::with_capacity(BUS_FRAME_SIZE);
        BusFrameCodec.encode(*pkt, &mut frame)?;

        let stations = self.stations();
        let mut failed = 0;
        for station in &stations {
            if let Err(e) = self.socket.try_send_to(&frame, *station) {
                tracing::debug!(%station, "datagram not sent: {e}");
                failed += 1;
            }
        }
        if failed > 0 && failed == stations.len() {
            return Err(TransportError::Bus(format!("frame reached none of {failed} stations")));
        }
        Ok(())
    }

    fn set_accept_all(&self, on: bool) {
        tracing::debug!(on, "bus accept filter");
        self.accept_all.store(on, Ordering::Relaxed);
    }
}

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    stations: Arc<Mutex<Vec<SocketAddr>>>,
    accept_all: Arc<AtomicBool>,
}

impl UdpReceiver {
    fn learn(&self, from: SocketAddr) {
        let mut stations = self.stations.lock().unwrap_or_else(PoisonError::into_inner);
        if !stations.contains(&from) {
            tracing::info!(station = %from, "new bus station");
            stations.push(from);
        }
    }

    /// Decode one datagram and decide whether the local node takes it.
    fn accept(&self, local: &NodeAddress, datagram: &[u8]) -> Option<Packet> {
        if datagram.len() != BUS_FRAME_SIZE {
            tracing::warn!(len = datagram.len(), "dropping datagram of wrong size");
            return None;
        }
        let mut buf = BytesMut::from(datagram);
        match BusFrameCodec.decode(&mut buf) {
            Ok(Some(pkt)) => {
                let wanted = pkt.std.dest == local.node || self.accept_all.load(Ordering::Relaxed);
                wanted.then_some(pkt)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(frame = %hex::encode(datagram), "malformed frame: {e}");
                None
            }
        }
    }

    pub async fn run(self, transport: Arc<Transport>, mut shutdown: broadcast::Receiver<()>) {
        let local = transport.local_address();
        let own = self.socket.local_addr().ok();
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (n, from) = match received {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!("udp receive failed: {e}");
                            continue;
                        }
                    };
                    if Some(from) == own {
                        continue;
                    }
                    self.learn(from);
                    if let Some(pkt) = self.accept(&local, &buf[..n]) {
                        transport.receive_from_bus(pkt);
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("udp receiver stopped");
                    return;
                }
            }
        }
    }
}
