//! Star-topology all-reduce over WebSocket
//!
//! Rank 0 accepts one connection per peer on `ws://{addr}/collective`. Every
//! collective is a `rmp_serde`-encoded [`CollectiveMessage`] in a binary frame:
//! peers send their contribution, rank 0 sums, divides by the world size and
//! sends the mean back. The group owns a current-thread tokio runtime so the
//! training loop can stay synchronous.

use std::net::TcpListener as StdTcpListener;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::ProcessGroup;
use crate::{Error, Result};

const ROUTE: &str = "collective";
const RETRY_INTERVAL: Duration = Duration::from_millis(50);
const MB: usize = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum CollectiveMessage {
    Join { rank: usize },
    Contribute(Vec<f32>),
    Mean(Vec<f32>),
    Abort(String),
}

enum Role {
    /// Streams to ranks 1..world_size in rank order
    Root(Vec<WebSocketStream<TcpStream>>),
    Worker(WebSocketStream<MaybeTlsStream<TcpStream>>),
}

pub struct WsProcessGroup {
    rank: usize,
    world_size: usize,
    // Declared before the runtime so the streams are dropped first
    role: Role,
    runtime: Runtime,
}

fn ws_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .write_buffer_size(0)
        .max_message_size(None)
        .max_frame_size(Some(MB * 512))
        .read_buffer_size(64 * 1024)
}

fn runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

impl WsProcessGroup {
    /// Join the group: rank 0 listens on `addr`, other ranks connect to it
    pub fn connect(addr: &str, rank: usize, world_size: usize, timeout: Duration) -> Result<Self> {
        if rank == 0 {
            let listener = StdTcpListener::bind(addr)
                .map_err(|e| Error::Distributed(format!("rank 0 cannot listen on {addr}: {e}")))?;
            Self::accept_peers(listener, world_size, timeout)
        } else {
            Self::connect_to_root(addr, rank, world_size, timeout)
        }
    }

    /// Rank 0 side on an already bound listener
    pub fn accept_peers(listener: StdTcpListener, world_size: usize, timeout: Duration) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let runtime = runtime()?;
        let peers = runtime.block_on(accept_within(listener, world_size, timeout))?;

        Ok(Self {
            rank: 0,
            world_size,
            role: Role::Root(peers),
            runtime,
        })
    }

    fn connect_to_root(addr: &str, rank: usize, world_size: usize, timeout: Duration) -> Result<Self> {
        let runtime = runtime()?;
        let root = runtime.block_on(join_root(addr, rank, timeout))?;

        Ok(Self {
            rank,
            world_size,
            role: Role::Worker(root),
            runtime,
        })
    }
}

async fn accept_within(
    listener: StdTcpListener,
    world_size: usize,
    timeout: Duration,
) -> Result<Vec<WebSocketStream<TcpStream>>> {
    let listener = TcpListener::from_std(listener)?;
    match tokio::time::timeout(timeout, accept_all(&listener, world_size)).await {
        Ok(peers) => peers,
        Err(_) => Err(Error::Distributed(format!(
            "timed out waiting for {} peers",
            world_size.saturating_sub(1)
        ))),
    }
}

async fn join_root(
    addr: &str,
    rank: usize,
    timeout: Duration,
) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let url = format!("ws://{addr}/{ROUTE}");
    let deadline = Instant::now() + timeout;
    let mut stream = loop {
        match tokio_tungstenite::connect_async_with_config(url.as_str(), Some(ws_config()), true).await {
            Ok((stream, _)) => break stream,
            Err(e) if Instant::now() < deadline => {
                tracing::trace!("rank {rank} waiting for {url}: {e}");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
            Err(e) => {
                return Err(Error::Distributed(format!(
                    "rank {rank} could not reach {url}: {e}"
                )))
            }
        }
    };
    send(&mut stream, &CollectiveMessage::Join { rank }).await?;
    Ok(stream)
}

async fn accept_all(listener: &TcpListener, world_size: usize) -> Result<Vec<WebSocketStream<TcpStream>>> {
    let mut slots: Vec<Option<WebSocketStream<TcpStream>>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;

    while joined < slots.len() {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let mut ws = tokio_tungstenite::accept_async_with_config(stream, Some(ws_config()))
            .await
            .map_err(|e| Error::Distributed(format!("handshake with {peer} failed: {e}")))?;
        let peer_rank = match recv(&mut ws).await? {
            CollectiveMessage::Join { rank } => rank,
            other => {
                return Err(Error::Distributed(format!(
                    "{peer} sent {other:?} before joining"
                )))
            }
        };
        let slot = peer_rank
            .checked_sub(1)
            .and_then(|i| slots.get_mut(i))
            .ok_or_else(|| Error::Distributed(format!("{peer} announced invalid rank {peer_rank}")))?;
        if slot.is_some() {
            return Err(Error::Distributed(format!("rank {peer_rank} joined twice")));
        }
        *slot = Some(ws);
        joined += 1;
        tracing::debug!("rank {peer_rank} joined from {peer}");
    }

    Ok(slots.into_iter().flatten().collect())
}

async fn send<S>(ws: &mut WebSocketStream<S>, message: &CollectiveMessage) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let bytes = rmp_serde::to_vec(message)
        .map_err(|e| Error::Distributed(format!("cannot encode collective message: {e}")))?;
    ws.send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| Error::Distributed(format!("send failed: {e}")))
}

async fn recv<S>(ws: &mut WebSocketStream<S>) -> Result<CollectiveMessage>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return rmp_serde::from_slice(&data).map_err(|e| {
                    Error::Distributed(format!("cannot decode collective message: {e}"))
                })
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Distributed("peer closed the connection".to_string()))
            }
            Some(Ok(other)) => {
                return Err(Error::Distributed(format!("unexpected frame {other:?}")))
            }
            Some(Err(e)) => return Err(Error::Distributed(format!("receive failed: {e}"))),
        }
    }
}

fn check_len(expected: usize, got: usize) -> Result<()> {
    if got != expected {
        return Err(Error::Distributed(format!(
            "collective size mismatch: expected {expected} values, peer sent {got}"
        )));
    }
    Ok(())
}

async fn reduce_on_root(
    peers: &mut [WebSocketStream<TcpStream>],
    world_size: usize,
    values: &mut [f32],
) -> Result<()> {
    for i in 0..peers.len() {
        let incoming = match recv(&mut peers[i]).await? {
            CollectiveMessage::Contribute(v) => v,
            CollectiveMessage::Abort(reason) => return Err(Error::Distributed(reason)),
            other => return Err(Error::Distributed(format!("unexpected {other:?}"))),
        };
        if let Err(e) = check_len(values.len(), incoming.len()) {
            for peer in peers.iter_mut() {
                // Best effort: the peers may already be gone
                let _ = send(peer, &CollectiveMessage::Abort(e.to_string())).await;
            }
            return Err(e);
        }
        for (acc, v) in values.iter_mut().zip(incoming) {
            *acc += v;
        }
    }
    let n = world_size as f32;
    for v in values.iter_mut() {
        *v /= n;
    }
    let mean = CollectiveMessage::Mean(values.to_vec());
    for peer in peers.iter_mut() {
        send(peer, &mean).await?;
    }
    Ok(())
}

async fn reduce_on_worker<S>(root: &mut WebSocketStream<S>, values: &mut [f32]) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send(root, &CollectiveMessage::Contribute(values.to_vec())).await?;
    match recv(root).await? {
        CollectiveMessage::Mean(mean) => {
            check_len(values.len(), mean.len())?;
            values.copy_from_slice(&mean);
            Ok(())
        }
        CollectiveMessage::Abort(reason) => Err(Error::Distributed(reason)),
        other => Err(Error::Distributed(format!("unexpected {other:?}"))),
    }
}

impl ProcessGroup for WsProcessGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        let world_size = self.world_size;
        match &mut self.role {
            Role::Root(peers) => self
                .runtime
                .block_on(reduce_on_root(peers, world_size, values)),
            Role::Worker(root) => self.runtime.block_on(reduce_on_worker(root, values)),
        }
    }
}
