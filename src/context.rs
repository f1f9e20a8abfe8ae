//! Lookup capabilities used by validation
//!
//! Validators depend on the smallest capability they need rather than on one
//! monolithic context. [`ChainContext`] answers all chain lookups for a single
//! branch of the block tree and caches what it has resolved; one is built per
//! validation attempt and dropped with it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chain::ChainSegments;
use crate::constants::MEDIAN_TIME_SPAN;
use crate::error::Result;
use crate::pow::ChainWork;
use crate::types::*;

/// Ancestor headers by height
pub trait HeaderLookup {
    fn header_at(&self, height: Natural) -> Result<Option<BlockHeader>>;
}

/// Cumulative chain work by height
pub trait ChainWorkLookup {
    fn chain_work_at(&self, height: Natural) -> Result<Option<ChainWork>>;
}

/// Median-time-past of the block at a height
pub trait MedianTimeLookup {
    fn median_time_past_at(&self, height: Natural) -> Result<Option<u32>>;
}

/// Resolves an outpoint to the output it currently names, if unspent
pub trait OutputLookup: Sync {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UTXO>>;
}

impl OutputLookup for UtxoSet {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UTXO>> {
        Ok(self.get(outpoint).cloned())
    }
}

/// Network-adjusted wall clock, in seconds since the epoch
pub trait NetworkTime: Send + Sync {
    fn now(&self) -> u64;
}

/// Local system clock with no peer adjustment
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNetworkTime;

impl NetworkTime for SystemNetworkTime {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// A settable clock
#[derive(Debug, Default)]
pub struct MutableNetworkTime {
    seconds: AtomicU64,
}

impl MutableNetworkTime {
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds: AtomicU64::new(seconds),
        }
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }
}

impl NetworkTime for MutableNetworkTime {
    fn now(&self) -> u64 {
        self.seconds.load(Ordering::SeqCst)
    }
}

/// Median of the timestamps of the block at `height` and up to ten ancestors
pub fn median_time_past<H: HeaderLookup + ?Sized>(headers: &H, height: Natural) -> Result<Option<u32>> {
    let mut timestamps = Vec::with_capacity(MEDIAN_TIME_SPAN);
    let first = height.saturating_sub(MEDIAN_TIME_SPAN as Natural - 1);
    for ancestor_height in first..=height {
        match headers.header_at(ancestor_height)? {
            Some(header) => timestamps.push(header.timestamp),
            None => return Ok(None),
        }
    }
    timestamps.sort_unstable();
    Ok(Some(timestamps[timestamps.len() / 2]))
}

/// Chain lookups along the branch ending at one block of the tree
pub struct ChainContext<'a> {
    chain: &'a ChainSegments,
    tip: Option<(Hash, Natural)>,
    headers: Mutex<HashMap<Natural, BlockHeader>>,
    median_times: Mutex<HashMap<Natural, u32>>,
}

impl<'a> ChainContext<'a> {
    /// Context for the branch ending at `tip`; `None` for an empty branch (genesis candidates)
    pub fn new(chain: &'a ChainSegments, tip: Option<&Hash>) -> Self {
        let tip = tip.and_then(|hash| chain.get(hash)).map(|node| (node.hash, node.height));
        Self {
            chain,
            tip,
            headers: Mutex::new(HashMap::new()),
            median_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn tip_height(&self) -> Option<Natural> {
        self.tip.map(|(_, height)| height)
    }

    fn node_at(&self, height: Natural) -> Option<&'a crate::chain::BlockNode> {
        let (tip, _) = self.tip?;
        self.chain.ancestor_at(&tip, height)
    }
}

impl HeaderLookup for ChainContext<'_> {
    fn header_at(&self, height: Natural) -> Result<Option<BlockHeader>> {
        if let Some(header) = self.headers.lock().get(&height) {
            return Ok(Some(header.clone()));
        }
        let header = self.node_at(height).map(|node| node.header.clone());
        if let Some(header) = &header {
            self.headers.lock().insert(height, header.clone());
        }
        Ok(header)
    }
}

impl ChainWorkLookup for ChainContext<'_> {
    fn chain_work_at(&self, height: Natural) -> Result<Option<ChainWork>> {
        Ok(self.node_at(height).map(|node| node.chain_work))
    }
}

impl MedianTimeLookup for ChainContext<'_> {
    fn median_time_past_at(&self, height: Natural) -> Result<Option<u32>> {
        if let Some(median) = self.median_times.lock().get(&height) {
            return Ok(Some(*median));
        }
        let median = median_time_past(self, height)?;
        if let Some(median) = median {
            self.median_times.lock().insert(height, median);
        }
        Ok(median)
    }
}
