//! Multi-process bootstrap and gradient synchronization
//!
//! Workers are launched one per device with `WORLD_SIZE`, `RANK`,
//! `LOCAL_RANK`, `MASTER_ADDR` and `MASTER_PORT` in their environment. Rank 0
//! hosts a star-topology TCP group; every collective is a gather to rank 0
//! followed by a broadcast of the result.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::error::{Error, Result};

const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
const DEFAULT_MASTER_PORT: u16 = 29500;
const CONNECT_RETRY: Duration = Duration::from_millis(200);
const JOIN_ACK: u32 = 0x5352_4a4e;

/// Position of this process within the worker group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistInfo {
    pub world_size: usize,
    pub rank: usize,
    pub local_rank: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl DistInfo {
    /// A lone process
    pub fn single() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }

    /// Read the launcher environment; `local_rank_flag` backs up `LOCAL_RANK`
    pub fn from_env(local_rank_flag: usize) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), local_rank_flag)
    }

    /// Same as [`DistInfo::from_env`] over an arbitrary variable source
    pub fn from_lookup<F>(lookup: F, local_rank_flag: usize) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| -> Result<Option<usize>> {
            lookup(key)
                .map(|value| {
                    value.trim().parse::<usize>().map_err(|_| {
                        Error::distributed(format!("{} must be a non-negative integer, got '{}'", key, value))
                    })
                })
                .transpose()
        };

        let world_size = parse("WORLD_SIZE")?.unwrap_or(1).max(1);
        if world_size == 1 {
            return Ok(Self {
                local_rank: local_rank_flag,
                ..Self::single()
            });
        }

        let local_rank = parse("LOCAL_RANK")?.unwrap_or(local_rank_flag);
        let rank = parse("RANK")?.unwrap_or(local_rank);
        if rank >= world_size {
            return Err(Error::distributed(format!(
                "rank {} is outside world of size {}",
                rank, world_size
            )));
        }

        let master_port = match lookup("MASTER_PORT") {
            Some(port) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::distributed(format!("invalid MASTER_PORT '{}'", port)))?,
            None => DEFAULT_MASTER_PORT,
        };

        Ok(Self {
            world_size,
            rank,
            local_rank,
            master_addr: lookup("MASTER_ADDR").unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string()),
            master_port,
        })
    }

    /// More than one worker takes part in the run
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}

/// Way of assembling the worker group
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Block until every worker has joined, or fail
    async fn join(&self, info: &DistInfo, deadline: Duration) -> Result<ProcessGroup>;
}

/// Join the worker group when the launcher asked for more than one worker
///
/// A failed rendezvous is fatal for the run.
pub async fn bootstrap(
    info: &DistInfo,
    rendezvous: &dyn Rendezvous,
    deadline: Duration,
) -> Result<Option<ProcessGroup>> {
    if !info.is_distributed() {
        debug!("Single worker run, no process group");
        return Ok(None);
    }

    info!(
        rank = info.rank,
        world_size = info.world_size,
        "Joining process group at {}:{}",
        info.master_addr,
        info.master_port
    );
    let group = rendezvous
        .join(info, deadline)
        .await
        .map_err(|e| {
            let reason = match e {
                Error::Distributed(reason) => reason,
                other => other.to_string(),
            };
            Error::distributed(format!("rank {} failed to join: {}", info.rank, reason))
        })?;
    info!(rank = info.rank, "Process group ready");

    Ok(Some(group))
}

/// TCP rendezvous hosted by rank 0
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpRendezvous;

#[async_trait]
impl Rendezvous for TcpRendezvous {
    async fn join(&self, info: &DistInfo, deadline: Duration) -> Result<ProcessGroup> {
        let address = format!("{}:{}", info.master_addr, info.master_port);
        let peers = if info.rank == 0 {
            let listener = TcpListener::bind(&address).await?;
            timeout(deadline, accept_peers(listener, info.world_size))
                .await
                .map_err(|_| Error::distributed("timed out waiting for peers"))??
        } else {
            let stream = connect_with_retry(&address, info.rank, deadline).await?;
            vec![stream]
        };

        Ok(ProcessGroup {
            rank: info.rank,
            world_size: info.world_size,
            peers,
            op_timeout: deadline,
        })
    }
}

async fn accept_peers(listener: TcpListener, world_size: usize) -> Result<Vec<TcpStream>> {
    let mut slots: Vec<Option<TcpStream>> = (1..world_size).map(|_| None).collect();
    let mut joined = 0;
    while joined < slots.len() {
        let (mut stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;
        let rank = stream.read_u32_le().await? as usize;
        let slot = slots
            .get_mut(rank.wrapping_sub(1))
            .ok_or_else(|| Error::distributed(format!("unexpected rank {} from {}", rank, addr)))?;
        if slot.is_some() {
            return Err(Error::distributed(format!("rank {} joined twice", rank)));
        }
        debug!(rank, %addr, "Peer joined");
        *slot = Some(stream);
        joined += 1;
    }

    let mut peers: Vec<TcpStream> = slots.into_iter().flatten().collect();
    for stream in peers.iter_mut() {
        stream.write_u32_le(JOIN_ACK).await?;
    }
    Ok(peers)
}

async fn connect_with_retry(address: &str, rank: usize, deadline: Duration) -> Result<TcpStream> {
    let give_up = Instant::now() + deadline;
    let mut stream = loop {
        match TcpStream::connect(address).await {
            Ok(stream) => break stream,
            Err(e) if Instant::now() < give_up => {
                debug!("Rendezvous at {} not ready: {}", address, e);
                sleep(CONNECT_RETRY).await;
            }
            Err(e) => {
                return Err(Error::distributed(format!("could not reach {}: {}", address, e)));
            }
        }
    };
    stream.set_nodelay(true)?;
    stream.write_u32_le(rank as u32).await?;

    let remaining = give_up.saturating_duration_since(Instant::now());
    let ack = timeout(remaining, stream.read_u32_le())
        .await
        .map_err(|_| Error::distributed("timed out waiting for group to form"))??;
    if ack != JOIN_ACK {
        return Err(Error::distributed("malformed rendezvous acknowledgement"));
    }
    Ok(stream)
}

/// Connected worker group
///
/// Rank 0 holds one stream per peer (ordered by rank); every other rank holds
/// a single stream to rank 0.
#[derive(Debug)]
pub struct ProcessGroup {
    rank: usize,
    world_size: usize,
    peers: Vec<TcpStream>,
    op_timeout: Duration,
}

impl ProcessGroup {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Replace `values` with their element-wise mean over all workers
    pub async fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()> {
        let op_timeout = self.op_timeout;
        timeout(op_timeout, self.all_reduce_inner(values))
            .await
            .map_err(|_| Error::distributed("all-reduce timed out"))?
    }

    /// Wait until every worker reaches this point
    pub async fn barrier(&mut self) -> Result<()> {
        self.all_reduce_mean(&mut []).await
    }

    async fn all_reduce_inner(&mut self, values: &mut [f32]) -> Result<()> {
        if self.rank == 0 {
            let mut sum: Vec<f64> = values.iter().map(|&v| v as f64).collect();
            for stream in self.peers.iter_mut() {
                let incoming = read_frame(stream, sum.len()).await?;
                for (acc, value) in sum.iter_mut().zip(incoming) {
                    *acc += value as f64;
                }
            }
            let scale = 1.0 / self.world_size as f64;
            for (out, acc) in values.iter_mut().zip(&sum) {
                *out = (acc * scale) as f32;
            }
            for stream in self.peers.iter_mut() {
                write_frame(stream, values).await?;
            }
        } else {
            let stream = self
                .peers
                .first_mut()
                .ok_or_else(|| Error::internal("peer has no connection to rank 0"))?;
            write_frame(stream, values).await?;
            let reduced = read_frame(stream, values.len()).await?;
            values.copy_from_slice(&reduced);
        }
        Ok(())
    }
}

async fn write_frame(stream: &mut TcpStream, values: &[f32]) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8 + values.len() * 4);
    buf.put_u64_le(values.len() as u64);
    for value in values {
        buf.put_f32_le(*value);
    }
    stream.write_all(&buf).await?;
    Ok(())
}

/// Read one frame that must hold exactly `expected` values
///
/// The announced length is checked before anything is allocated.
async fn read_frame<R>(stream: &mut R, expected: usize) -> Result<Vec<f32>>
where
    R: AsyncRead + Unpin,
{
    let announced = stream.read_u64_le().await?;
    if announced != expected as u64 {
        return Err(Error::distributed(format!(
            "all-reduce length mismatch: peer sent {} values, expected {}",
            announced, expected
        )));
    }
    let len = expected;
    let mut raw = vec![0u8; len * 4];
    stream.read_exact(&mut raw).await?;
    let mut buf = &raw[..];
    let mut values = Vec::with_capacity(len);
    while buf.has_remaining() {
        values.push(buf.get_f32_le());
    }
    Ok(values)
}

/// Groups of `world_size` ranks joined over localhost, ordered by rank
#[cfg(test)]
pub(crate) async fn local_groups(world_size: usize) -> Vec<ProcessGroup> {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap();

    let handles: Vec<_> = (0..world_size)
        .map(|rank| {
            let info = DistInfo {
                world_size,
                rank,
                local_rank: rank,
                master_addr: "127.0.0.1".to_string(),
                master_port: port,
            };
            tokio::spawn(async move { TcpRendezvous.join(&info, Duration::from_secs(10)).await })
        })
        .collect();

    let mut groups = Vec::with_capacity(world_size);
    for handle in handles {
        groups.push(handle.await.unwrap().unwrap());
    }
    groups
}
