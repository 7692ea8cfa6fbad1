//! QUIC mesh transport.
//!
//! Each pair of ranks shares one QUIC connection carrying a single
//! long-lived unidirectional stream per direction. Frames are
//! `[tag u64 LE][len u64 LE][payload]`; a stream preserves byte order, so
//! per-(sender, tag) FIFO delivery falls out of the framing. A fresh uni
//! stream per message would not give that guarantee — QUIC does not order
//! streams against each other.
//!
//! Mesh formation: every rank binds a loopback endpoint with an ephemeral
//! self-signed certificate, dials all higher ranks and accepts from all
//! lower ranks concurrently. The first bytes on every stream carry the
//! sender's rank, so accepted connections need no out-of-band attribution.

use crate::error::{CanopyError, Result};
use crate::transport::Transport;
use crate::transport::tls::{generate_self_signed_cert, make_client_config, make_server_config};
use crate::types::{Rank, Tag};
use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use tokio::sync::{Mutex, mpsc};

/// Maximum frame payload accepted from a peer (1 GiB).
const MAX_FRAME_SIZE: u64 = 1024 * 1024 * 1024;

/// One rank's endpoint of a QUIC mesh.
pub struct QuicTransport {
    rank: Rank,
    world_size: u32,
    peers: HashMap<Rank, PeerLink>,
    inboxes: HashMap<Rank, Mutex<PeerInbox>>,
    /// Keeps the endpoint, and with it every connection, alive.
    _endpoint: quinn::Endpoint,
    _recv_handles: Vec<tokio::task::JoinHandle<()>>,
}

/// Send side of one peer: the connection and the ordered frame stream.
struct PeerLink {
    _conn: quinn::Connection,
    stream: Mutex<quinn::SendStream>,
}

/// Frames from one peer: the live channel plus frames already drained
/// while looking for a different tag.
struct PeerInbox {
    rx: mpsc::UnboundedReceiver<(Tag, Bytes)>,
    stashed: HashMap<Tag, VecDeque<Bytes>>,
}

/// A fully established directed link pair to one peer.
struct Link {
    peer: Rank,
    conn: quinn::Connection,
    send_stream: quinn::SendStream,
    recv_stream: quinn::RecvStream,
}

impl QuicTransport {
    /// Form a loopback mesh of `world_size` ranks inside this process and
    /// return one transport per rank, sorted by rank.
    ///
    /// This is a convenience for tests and single-host runs; deployments
    /// that spread ranks across hosts form the same mesh from exchanged
    /// addresses.
    pub async fn bootstrap_local(world_size: u32) -> Result<Vec<QuicTransport>> {
        let n = world_size as usize;
        let mut endpoints = Vec::with_capacity(n);
        let mut addrs = Vec::with_capacity(n);
        for _ in 0..n {
            let (cert, key) = generate_self_signed_cert()?;
            let server_config = make_server_config(cert, key)?;
            let bind: SocketAddr = "127.0.0.1:0".parse().expect("hardcoded socket addr");
            let mut endpoint = quinn::Endpoint::server(server_config, bind)
                .map_err(|e| CanopyError::transport_with_source("bind mesh endpoint", e))?;
            endpoint.set_default_client_config(make_client_config()?);
            addrs.push(
                endpoint
                    .local_addr()
                    .map_err(|e| CanopyError::transport_with_source("mesh local_addr", e))?,
            );
            endpoints.push(endpoint);
        }

        let mut tasks = Vec::new();
        for (rank, endpoint) in endpoints.into_iter().enumerate() {
            let addrs = addrs.clone();
            tasks.push(tokio::spawn(build_rank(
                rank as Rank,
                world_size,
                endpoint,
                addrs,
            )));
        }

        let mut transports = Vec::with_capacity(n);
        for task in tasks {
            transports.push(task.await.map_err(|e| {
                CanopyError::transport_with_source("mesh formation task panicked", e)
            })??);
        }
        Ok(transports)
    }
}

/// Dial every higher rank and accept from every lower rank, concurrently.
async fn build_rank(
    rank: Rank,
    world_size: u32,
    endpoint: quinn::Endpoint,
    addrs: Vec<SocketAddr>,
) -> Result<QuicTransport> {
    let accept_fut = async {
        let mut links = Vec::new();
        for _ in 0..rank {
            let incoming = endpoint
                .accept()
                .await
                .ok_or_else(|| CanopyError::transport("endpoint closed during mesh formation"))?;
            let conn = incoming
                .await
                .map_err(|e| CanopyError::transport_with_source("accept mesh link", e))?;
            links.push(hello_accept(rank, conn).await?);
        }
        Ok::<_, CanopyError>(links)
    };

    let dial_fut = async {
        let mut links = Vec::new();
        for peer in rank + 1..world_size {
            let connecting = endpoint
                .connect(addrs[peer as usize], "localhost")
                .map_err(|e| CanopyError::transport_with_source("dial mesh peer", e))?;
            let conn = connecting
                .await
                .map_err(|e| CanopyError::transport_with_source("mesh handshake", e))?;
            links.push(hello_dial(rank, peer, conn).await?);
        }
        Ok::<_, CanopyError>(links)
    };

    let (accepted, dialed) = tokio::try_join!(accept_fut, dial_fut)?;

    let mut peers = HashMap::new();
    let mut inboxes = HashMap::new();
    let mut handles = Vec::new();
    for link in accepted.into_iter().chain(dialed) {
        let (tx, rx) = mpsc::unbounded_channel();
        handles.push(tokio::spawn(recv_loop(link.peer, link.recv_stream, tx)));
        inboxes.insert(
            link.peer,
            Mutex::new(PeerInbox {
                rx,
                stashed: HashMap::new(),
            }),
        );
        peers.insert(
            link.peer,
            PeerLink {
                _conn: link.conn,
                stream: Mutex::new(link.send_stream),
            },
        );
    }

    Ok(QuicTransport {
        rank,
        world_size,
        peers,
        inboxes,
        _endpoint: endpoint,
        _recv_handles: handles,
    })
}

/// Dialer side of the stream handshake: open our frame stream first, then
/// wait for the peer's and check it announces the rank we dialed.
async fn hello_dial(rank: Rank, peer: Rank, conn: quinn::Connection) -> Result<Link> {
    let mut send_stream = conn
        .open_uni()
        .await
        .map_err(|e| CanopyError::transport_with_source("open frame stream", e))?;
    send_stream
        .write_all(&rank.to_le_bytes())
        .await
        .map_err(|e| CanopyError::transport_with_source("announce rank", e))?;

    let (announced, recv_stream) = accept_frame_stream(&conn).await?;
    if announced != peer {
        return Err(CanopyError::transport(format!(
            "mesh peer announced rank {announced}, expected {peer}"
        )));
    }
    Ok(Link {
        peer,
        conn,
        send_stream,
        recv_stream,
    })
}

/// Acceptor side: the dialer's stream identifies the peer, then we open the
/// return stream.
async fn hello_accept(rank: Rank, conn: quinn::Connection) -> Result<Link> {
    let (peer, recv_stream) = accept_frame_stream(&conn).await?;
    let mut send_stream = conn
        .open_uni()
        .await
        .map_err(|e| CanopyError::transport_with_source("open frame stream", e))?;
    send_stream
        .write_all(&rank.to_le_bytes())
        .await
        .map_err(|e| CanopyError::transport_with_source("announce rank", e))?;
    Ok(Link {
        peer,
        conn,
        send_stream,
        recv_stream,
    })
}

/// Accept the peer's frame stream and read the rank announcement.
async fn accept_frame_stream(conn: &quinn::Connection) -> Result<(Rank, quinn::RecvStream)> {
    let mut stream = conn
        .accept_uni()
        .await
        .map_err(|e| CanopyError::transport_with_source("accept frame stream", e))?;
    let mut prologue = [0u8; 4];
    stream
        .read_exact(&mut prologue)
        .await
        .map_err(|e| CanopyError::transport_with_source("read rank announcement", e))?;
    Ok((Rank::from_le_bytes(prologue), stream))
}

/// Read frames off one peer's stream until it closes.
async fn recv_loop(
    peer: Rank,
    mut stream: quinn::RecvStream,
    tx: mpsc::UnboundedSender<(Tag, Bytes)>,
) {
    loop {
        let mut header = [0u8; 16];
        if stream.read_exact(&mut header).await.is_err() {
            // Stream closed: peer shut down.
            return;
        }
        let tag = u64::from_le_bytes(header[0..8].try_into().expect("header length fixed"));
        let len = u64::from_le_bytes(header[8..16].try_into().expect("header length fixed"));
        if len > MAX_FRAME_SIZE {
            tracing::warn!(peer, len, "oversized frame, dropping stream");
            return;
        }
        let mut payload = vec![0u8; len as usize];
        if stream.read_exact(&mut payload).await.is_err() {
            tracing::warn!(peer, "truncated frame, dropping stream");
            return;
        }
        if tx.send((tag, Bytes::from(payload))).is_err() {
            // Receiver dropped: transport is being torn down.
            return;
        }
    }
}

impl Transport for QuicTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.world_size
    }

    fn send<'a>(&'a self, dest: Rank, tag: Tag, payload: Bytes) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let link = self.peers.get(&dest).ok_or(CanopyError::InvalidRank {
                rank: dest,
                world_size: self.world_size,
            })?;
            let mut stream = link.stream.lock().await;
            let mut header = [0u8; 16];
            header[0..8].copy_from_slice(&tag.to_le_bytes());
            header[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
            stream
                .write_all(&header)
                .await
                .map_err(|e| CanopyError::transport_with_source("write frame header", e))?;
            stream
                .write_all(&payload)
                .await
                .map_err(|e| CanopyError::transport_with_source("write frame payload", e))?;
            Ok(())
        })
    }

    fn recv<'a>(&'a self, src: Rank, tag: Tag) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let inbox = self.inboxes.get(&src).ok_or(CanopyError::InvalidRank {
                rank: src,
                world_size: self.world_size,
            })?;
            let mut inbox = inbox.lock().await;
            if let Some(queue) = inbox.stashed.get_mut(&tag) {
                if let Some(payload) = queue.pop_front() {
                    return Ok(payload);
                }
            }
            loop {
                let (got_tag, payload) = inbox
                    .rx
                    .recv()
                    .await
                    .ok_or(CanopyError::PeerDisconnected { rank: src })?;
                if got_tag == tag {
                    return Ok(payload);
                }
                inbox.stashed.entry(got_tag).or_default().push_back(payload);
            }
        })
    }
}
