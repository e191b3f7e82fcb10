//! Policies deciding which worker receives a record.
//!
//! A strategy is built fresh for every pool generation by a
//! [`DistributionStrategyFactory`] and initialized with that generation's
//! workers. Selection may suspend; every wait honours the caller's
//! cancellation token, and a cancelled selection yields no worker.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

pub type TaskCompletedCallback = Arc<dyn Fn() + Send + Sync>;

/// The view of a worker a strategy gets
pub trait Worker: Send + Sync {
    fn id(&self) -> usize;

    /// Register a callback fired after each record finishes, successfully or not
    fn on_task_completed(&self, callback: TaskCompletedCallback);
}

#[async_trait]
pub trait DistributionStrategy: Send + Sync {
    fn initialize(&mut self, workers: &[Arc<dyn Worker>]);

    /// Index of the worker that should receive a record with this key, or
    /// `None` if `cancel` fired first.
    async fn get_worker(&self, key: Option<&[u8]>, cancel: &CancellationToken) -> Option<usize>;
}

pub type DistributionStrategyFactory =
    Arc<dyn Fn() -> Box<dyn DistributionStrategy> + Send + Sync>;

/// Same key, same worker. Records without a key go to worker 0.
#[derive(Debug, Default)]
pub struct KeyHashStrategy {
    worker_count: usize,
}

impl KeyHashStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_for_key(key: Option<&[u8]>, worker_count: usize) -> usize {
        match key {
            None => 0,
            Some(key) => {
                let sum = key.iter().fold(0u64, |acc, b| acc.wrapping_add(u64::from(*b)));
                (sum % worker_count as u64) as usize
            }
        }
    }
}

#[async_trait]
impl DistributionStrategy for KeyHashStrategy {
    fn initialize(&mut self, workers: &[Arc<dyn Worker>]) {
        self.worker_count = workers.len();
    }

    async fn get_worker(&self, key: Option<&[u8]>, cancel: &CancellationToken) -> Option<usize> {
        if cancel.is_cancelled() || self.worker_count == 0 {
            return None;
        }
        Some(Self::worker_for_key(key, self.worker_count))
    }
}

/// Hands each record to whichever worker is idle, waiting for one to finish if
/// all are busy. Ordering per key is not preserved.
pub struct FreeWorkerStrategy {
    available_tx: mpsc::UnboundedSender<usize>,
    available_rx: Mutex<mpsc::UnboundedReceiver<usize>>,
}

impl Default for FreeWorkerStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl FreeWorkerStrategy {
    pub fn new() -> Self {
        let (available_tx, available_rx) = mpsc::unbounded_channel();
        Self {
            available_tx,
            available_rx: Mutex::new(available_rx),
        }
    }
}

#[async_trait]
impl DistributionStrategy for FreeWorkerStrategy {
    fn initialize(&mut self, workers: &[Arc<dyn Worker>]) {
        for (index, worker) in workers.iter().enumerate() {
            self.available_tx.send(index).ok();

            let available_tx = self.available_tx.clone();
            worker.on_task_completed(Arc::new(move || {
                available_tx.send(index).ok();
            }));
        }
    }

    async fn get_worker(&self, _key: Option<&[u8]>, cancel: &CancellationToken) -> Option<usize> {
        let mut available = tokio::select! {
            _ = cancel.cancelled() => return None,
            guard = self.available_rx.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            index = available.recv() => index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionStrategyKind {
    #[default]
    KeyHash,
    FreeWorker,
}

impl DistributionStrategyKind {
    pub fn factory(self) -> DistributionStrategyFactory {
        match self {
            Self::KeyHash => Arc::new(|| -> Box<dyn DistributionStrategy> {
                Box::new(KeyHashStrategy::new())
            }),
            Self::FreeWorker => Arc::new(|| -> Box<dyn DistributionStrategy> {
                Box::new(FreeWorkerStrategy::new())
            }),
        }
    }
}

impl FromStr for DistributionStrategyKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "key_hash" | "keyhash" | "bytes_sum" => Ok(Self::KeyHash),
            "free_worker" | "freeworker" => Ok(Self::FreeWorker),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for DistributionStrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyHash => write!(f, "key_hash"),
            Self::FreeWorker => write!(f, "free_worker"),
        }
    }
}
