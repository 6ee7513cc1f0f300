//! Data-parallel process groups
//!
//! Training runs either as a single process or as one process per rank that
//! averages gradients with [`ProcessGroup::all_reduce_mean`] before every
//! optimizer step. Ranks find each other through the `MASTER_ADDR` /
//! `MASTER_PORT` environment variables, as set by [`DistributedEnv::apply`].

mod ws;

use std::env;
use std::time::Duration;

pub use ws::WsProcessGroup;

use crate::{Error, Result};

pub const DEFAULT_BACKEND: &str = "gloo";
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// How long non-zero ranks keep retrying to reach rank 0
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Collective operations over all ranks
pub trait ProcessGroup: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Replace `values` on every rank with the element-wise mean over ranks.
    /// Every rank must pass the same number of values.
    fn all_reduce_mean(&mut self, values: &mut [f32]) -> Result<()>;

    /// Block until every rank has reached this point
    fn barrier(&mut self) -> Result<()> {
        self.all_reduce_mean(&mut [])
    }

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }
}

/// World of one: every collective is the identity
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_mean(&mut self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }
}

/// Rendezvous settings exported to the environment before distributed setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedEnv {
    pub backend: String,
    pub master_addr: String,
    pub master_port: u16,
}

impl Default for DistributedEnv {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            master_addr: DEFAULT_MASTER_ADDR.to_string(),
            master_port: DEFAULT_MASTER_PORT,
        }
    }
}

impl DistributedEnv {
    /// Set `TORCH_DISTRIBUTED_BACKEND`, `MASTER_ADDR` and `MASTER_PORT`
    pub fn apply(&self) {
        env::set_var("TORCH_DISTRIBUTED_BACKEND", &self.backend);
        env::set_var("MASTER_ADDR", &self.master_addr);
        env::set_var("MASTER_PORT", self.master_port.to_string());
    }

    /// Read the rendezvous settings back, with defaults for unset variables
    pub fn from_env() -> Result<Self> {
        let master_port = match env::var("MASTER_PORT") {
            Ok(p) => p
                .parse()
                .map_err(|_| Error::Distributed(format!("invalid MASTER_PORT {p:?}")))?,
            Err(_) => DEFAULT_MASTER_PORT,
        };
        Ok(Self {
            backend: env::var("TORCH_DISTRIBUTED_BACKEND")
                .unwrap_or_else(|_| DEFAULT_BACKEND.to_string()),
            master_addr: env::var("MASTER_ADDR").unwrap_or_else(|_| DEFAULT_MASTER_ADDR.to_string()),
            master_port,
        })
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.master_addr, self.master_port)
    }
}

/// `$LOCAL_RANK`, or -1 when unset or unparsable
pub fn local_rank_from_env() -> i64 {
    env::var("LOCAL_RANK")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(-1)
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Distributed(format!("invalid {name} {v:?}"))),
        Err(_) => Ok(None),
    }
}

/// Create the process group for this run.
///
/// Distributed runs need a launcher-provided `local_rank`; `WORLD_SIZE`
/// defaults to 1 and `RANK` to `local_rank`.
pub fn init_process_group(distributed: bool, local_rank: i64) -> Result<Box<dyn ProcessGroup>> {
    if !distributed {
        return Ok(Box::new(SingleProcess));
    }
    if local_rank < 0 {
        return Err(Error::Distributed(
            "distributed training needs a local rank; start one process per rank with \
             LOCAL_RANK set (or pass --local_rank)"
                .to_string(),
        ));
    }

    let world_size = env_usize("WORLD_SIZE")?.unwrap_or(1);
    let rank = env_usize("RANK")?.unwrap_or(local_rank as usize);
    if world_size == 0 || rank >= world_size {
        return Err(Error::Distributed(format!(
            "rank {rank} is outside a world of size {world_size}"
        )));
    }
    if world_size == 1 {
        tracing::info!("distributed run with a single rank");
        return Ok(Box::new(SingleProcess));
    }

    let rendezvous = DistributedEnv::from_env()?;
    tracing::info!(
        "rank {rank}/{world_size} joining {} via {}",
        rendezvous.address(),
        rendezvous.backend
    );
    let group = WsProcessGroup::connect(&rendezvous.address(), rank, world_size, CONNECT_TIMEOUT)?;
    Ok(Box::new(group))
}
