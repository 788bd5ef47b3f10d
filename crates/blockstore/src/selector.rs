// blockstore/src/selector.rs

//! Capacity-aware placement shared by the hot and cold tiers.
//!
//! A selector keeps an active pool and an "unable" pool. Selection runs on a
//! blocking task and publishes exactly one result into a channel of
//! capacity one; a writer consumes it through [`Selector::acquire`] and the
//! returned [`Lease`] schedules the next selection when dropped, so that
//! selection for the next write overlaps with the current one.

use crate::config::Strategy;
use crate::{StorageError, StorageResult};
use parking_lot::Mutex;
use rand::Rng;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Something blocks can be placed on
pub trait Placement: Send + Sync {
    /// Stable identity, unique within a pool
    fn id(&self) -> &str;

    /// Eligibility for the next block. May have side effects such as
    /// advancing a directory cursor.
    fn is_able_to_store_block(&self) -> bool;

    fn blocks_count(&self) -> u64;

    fn blocks_size(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Volume,
    ColdStorage,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Volume => "volumes",
            PoolKind::ColdStorage => "cold storages",
        }
    }

    fn exhausted(&self) -> StorageError {
        match self {
            PoolKind::Volume => StorageError::UnableToSelectVolume,
            PoolKind::ColdStorage => StorageError::UnableToSelectColdStorage,
        }
    }
}

/// Active and unable members plus the round-robin position
pub struct Pool<T: ?Sized> {
    active: Vec<Arc<T>>,
    unable: Vec<Arc<T>>,
    prev: Option<usize>,
}

impl<T: ?Sized + Placement> Pool<T> {
    pub fn new(members: Vec<Arc<T>>) -> Self {
        Self::with_unable(members, Vec::new())
    }

    /// Pool whose `unable` members wait for [`Pool::revive`] before they
    /// are ever selected
    pub fn with_unable(active: Vec<Arc<T>>, unable: Vec<Arc<T>>) -> Self {
        Self {
            active,
            unable,
            prev: None,
        }
    }

    pub fn active(&self) -> &[Arc<T>] {
        &self.active
    }

    pub fn unable(&self) -> &[Arc<T>] {
        &self.unable
    }

    /// Run a strategy, evicting every member found ineligible on the way
    pub fn select(&mut self, strategy: Strategy) -> Option<Arc<T>> {
        let index = match strategy {
            Strategy::Random => self.random(),
            Strategy::RoundRobin => self.round_robin(),
            Strategy::MinSizeFirst => self.min_by(|t| t.blocks_size()),
            Strategy::MinCountFirst => self.min_by(|t| t.blocks_count()),
            Strategy::FillFirst => self.fill_first(),
        }?;
        self.prev = Some(index);
        Some(self.active[index].clone())
    }

    /// Move a member to the unable pool
    pub fn evict(&mut self, id: &str) -> bool {
        match self.active.iter().position(|m| m.id() == id) {
            Some(index) => {
                self.evict_at(index);
                true
            }
            None => false,
        }
    }

    /// Re-admit every unable member that is eligible again
    pub fn revive(&mut self) -> usize {
        let (ready, still_unable): (Vec<_>, Vec<_>) = std::mem::take(&mut self.unable)
            .into_iter()
            .partition(|m| m.is_able_to_store_block());
        self.unable = still_unable;

        for member in &ready {
            tracing::info!("{} is able to store blocks again", member.id());
        }
        let revived = ready.len();
        self.active.extend(ready);
        revived
    }

    fn evict_at(&mut self, index: usize) {
        let member = self.active.remove(index);
        self.prev = match self.prev {
            Some(p) if index < p => Some(p - 1),
            Some(p) if index == p => p.checked_sub(1),
            other => other,
        };
        tracing::warn!("{} removed from selection, unable to store blocks", member.id());
        self.unable.push(member);
    }

    fn random(&mut self) -> Option<usize> {
        let mut rng = rand::thread_rng();
        while !self.active.is_empty() {
            let index = rng.gen_range(0..self.active.len());
            if self.active[index].is_able_to_store_block() {
                return Some(index);
            }
            self.evict_at(index);
        }
        None
    }

    fn round_robin(&mut self) -> Option<usize> {
        let len = self.active.len();
        if len == 0 {
            return None;
        }
        let prev = self.prev.filter(|p| *p < len);

        // every member except the previous one, starting right after it
        let mut index = prev.map_or(0, |p| p + 1);
        let mut remaining = if prev.is_some() { len - 1 } else { len };
        while remaining > 0 {
            if index >= self.active.len() {
                index = 0;
            }
            if self.active[index].is_able_to_store_block() {
                return Some(index);
            }
            self.evict_at(index);
            remaining -= 1;
        }

        // fall back to the previous member
        let prev = self.prev.filter(|p| *p < self.active.len())?;
        if self.active[prev].is_able_to_store_block() {
            return Some(prev);
        }
        self.evict_at(prev);
        None
    }

    fn min_by(&mut self, key: impl Fn(&T) -> u64) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        let mut index = 0;
        while index < self.active.len() {
            if !self.active[index].is_able_to_store_block() {
                self.evict_at(index);
                continue;
            }
            let value = key(self.active[index].as_ref());
            if best.map_or(true, |(_, b)| value < b) {
                best = Some((index, value));
            }
            index += 1;
        }
        best.map(|(index, _)| index)
    }

    fn fill_first(&mut self) -> Option<usize> {
        if let Some(prev) = self.prev.filter(|p| *p < self.active.len()) {
            if self.active[prev].is_able_to_store_block() {
                return Some(prev);
            }
            self.evict_at(prev);
        }

        while !self.active.is_empty() {
            if self.active[0].is_able_to_store_block() {
                return Some(0);
            }
            self.evict_at(0);
        }
        None
    }
}

type Selection<T> = Option<Arc<T>>;

/// Single-producer selection pipeline over a pool.
///
/// Must be created and used inside a Tokio runtime.
pub struct Selector<T: ?Sized> {
    kind: PoolKind,
    strategy: Strategy,
    pool: Arc<Mutex<Pool<T>>>,
    tx: mpsc::Sender<Selection<T>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Selection<T>>>,
}

impl<T: ?Sized + Placement + 'static> Selector<T> {
    pub fn new(kind: PoolKind, strategy: Strategy, members: Vec<Arc<T>>) -> Self {
        Self::with_unable(kind, strategy, members, Vec::new())
    }

    pub fn with_unable(kind: PoolKind, strategy: Strategy, active: Vec<Arc<T>>, unable: Vec<Arc<T>>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let selector = Self {
            kind,
            strategy,
            pool: Arc::new(Mutex::new(Pool::with_unable(active, unable))),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        };
        selector.trigger();
        selector
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Schedule one selection run
    fn trigger(&self) {
        let pool = self.pool.clone();
        let tx = self.tx.clone();
        let strategy = self.strategy;
        tokio::task::spawn_blocking(move || {
            let selection = pool.lock().select(strategy);
            if tx.blocking_send(selection).is_err() {
                tracing::debug!("Selection receiver closed");
            }
        });
    }

    /// Wait for the published selection.
    ///
    /// Fails once the active pool is exhausted. Dropping the lease
    /// schedules the next selection.
    pub async fn acquire(&self) -> StorageResult<Lease<'_, T>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Some(Some(target)) => return Ok(Lease { selector: self, target }),
                Some(None) => {
                    self.trigger();
                    // a revival may have refilled the pool since that run
                    if self.pool.lock().active.is_empty() {
                        tracing::error!("No {} left to select from", self.kind.name());
                        return Err(self.kind.exhausted());
                    }
                }
                None => return Err(self.kind.exhausted()),
            }
        }
    }

    /// Take a member out of rotation after a failed write
    pub fn evict(&self, target: &T) {
        self.pool.lock().evict(target.id());
    }

    /// Re-admit eligible unable members
    pub fn revive(&self) -> usize {
        self.pool.lock().revive()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.pool.lock().active().iter().map(|m| m.id().to_string()).collect()
    }

    pub fn unable_ids(&self) -> Vec<String> {
        self.pool.lock().unable().iter().map(|m| m.id().to_string()).collect()
    }
}

/// A selected pool member; dropping it schedules the next selection
pub struct Lease<'a, T: ?Sized + Placement + 'static> {
    selector: &'a Selector<T>,
    target: Arc<T>,
}

impl<T: ?Sized + Placement + 'static> Lease<'_, T> {
    pub fn target(&self) -> &Arc<T> {
        &self.target
    }
}

impl<T: ?Sized + Placement + 'static> Deref for Lease<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.target
    }
}

impl<T: ?Sized + Placement + 'static> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        self.selector.trigger();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    pub(crate) struct FakeTarget {
        pub id: String,
        pub able: AtomicBool,
        pub count: AtomicU64,
        pub size: AtomicU64,
    }

    impl FakeTarget {
        pub fn new(id: &str, count: u64, size: u64) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                able: AtomicBool::new(true),
                count: AtomicU64::new(count),
                size: AtomicU64::new(size),
            })
        }

        pub fn set_able(&self, able: bool) {
            self.able.store(able, Ordering::SeqCst);
        }
    }

    impl Placement for FakeTarget {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_able_to_store_block(&self) -> bool {
            self.able.load(Ordering::SeqCst)
        }

        fn blocks_count(&self) -> u64 {
            self.count.load(Ordering::SeqCst)
        }

        fn blocks_size(&self) -> u64 {
            self.size.load(Ordering::SeqCst)
        }
    }

    fn targets(n: usize) -> Vec<Arc<FakeTarget>> {
        (0..n).map(|i| FakeTarget::new(&format!("v{}", i), 0, 0)).collect()
    }

    fn picks(pool: &mut Pool<FakeTarget>, strategy: Strategy, n: usize) -> Vec<String> {
        (0..n)
            .map(|_| pool.select(strategy).map(|t| t.id.clone()).unwrap_or_default())
            .collect()
    }

    #[test]
    fn test_round_robin_fairness() {
        let mut pool = Pool::new(targets(3));
        assert_eq!(
            picks(&mut pool, Strategy::RoundRobin, 7),
            vec!["v0", "v1", "v2", "v0", "v1", "v2", "v0"]
        );
    }

    #[test]
    fn test_round_robin_evicts_and_keeps_order() {
        let members = targets(4);
        let mut pool = Pool::new(members.clone());
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 2), vec!["v0", "v1"]);

        members[2].set_able(false);
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 3), vec!["v3", "v0", "v1"]);
        assert_eq!(pool.unable().len(), 1);
        assert_eq!(pool.unable()[0].id, "v2");
    }

    #[test]
    fn test_round_robin_falls_back_to_previous() {
        let members = targets(3);
        let mut pool = Pool::new(members.clone());
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 1), vec!["v0"]);

        members[1].set_able(false);
        members[2].set_able(false);
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 2), vec!["v0", "v0"]);

        members[0].set_able(false);
        assert!(pool.select(Strategy::RoundRobin).is_none());
        assert!(pool.active().is_empty());
        assert_eq!(pool.unable().len(), 3);
    }

    #[test]
    fn test_min_size_and_min_count() {
        let members = vec![
            FakeTarget::new("a", 5, 300),
            FakeTarget::new("b", 1, 900),
            FakeTarget::new("c", 9, 100),
        ];
        let mut pool = Pool::new(members.clone());
        assert_eq!(pool.select(Strategy::MinSizeFirst).unwrap().id, "c");
        assert_eq!(pool.select(Strategy::MinCountFirst).unwrap().id, "b");

        members[1].set_able(false);
        assert_eq!(pool.select(Strategy::MinCountFirst).unwrap().id, "a");
        assert_eq!(pool.unable().len(), 1);
    }

    #[test]
    fn test_random_only_picks_eligible() {
        let members = targets(5);
        members[0].set_able(false);
        members[3].set_able(false);
        let mut pool = Pool::new(members);
        for _ in 0..50 {
            let id = pool.select(Strategy::Random).unwrap().id.clone();
            assert!(id != "v0" && id != "v3");
        }
    }

    #[test]
    fn test_fill_first_sticks_until_ineligible() {
        let members = targets(3);
        let mut pool = Pool::new(members.clone());
        assert_eq!(picks(&mut pool, Strategy::FillFirst, 3), vec!["v0", "v0", "v0"]);

        members[0].set_able(false);
        assert_eq!(picks(&mut pool, Strategy::FillFirst, 2), vec!["v1", "v1"]);
    }

    #[test]
    fn test_revive_returns_members() {
        let members = targets(2);
        let mut pool = Pool::new(members.clone());
        members[1].set_able(false);
        assert!(pool.evict("v1"));
        assert!(!pool.evict("v1"));
        assert_eq!(pool.revive(), 0);

        members[1].set_able(true);
        assert_eq!(pool.revive(), 1);
        assert_eq!(pool.active().len(), 2);
        assert!(pool.unable().is_empty());
    }

    #[test]
    fn test_unable_members_wait_for_revive() {
        let members = targets(2);
        let mut pool = Pool::with_unable(vec![members[0].clone()], vec![members[1].clone()]);
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 3), vec!["v0", "v0", "v0"]);

        assert_eq!(pool.revive(), 1);
        assert_eq!(picks(&mut pool, Strategy::RoundRobin, 2), vec!["v1", "v0"]);
    }

    #[tokio::test]
    async fn test_selector_pipeline_hands_out_in_order() {
        let selector = Selector::new(PoolKind::Volume, Strategy::RoundRobin, targets(2));
        let mut seen = Vec::new();
        for _ in 0..4 {
            let lease = selector.acquire().await.unwrap();
            seen.push(lease.id.clone());
        }
        assert_eq!(seen, vec!["v0", "v1", "v0", "v1"]);
    }

    #[tokio::test]
    async fn test_selector_exhaustion_and_revival() {
        let members = targets(1);
        let selector = Selector::new(PoolKind::ColdStorage, Strategy::RoundRobin, members.clone());
        {
            let lease = selector.acquire().await.unwrap();
            selector.evict(&lease);
        }
        assert!(matches!(
            selector.acquire().await,
            Err(StorageError::UnableToSelectColdStorage)
        ));
        assert_eq!(selector.unable_ids(), vec!["v0"]);

        assert_eq!(selector.revive(), 1);
        let lease = selector.acquire().await.unwrap();
        assert_eq!(lease.id, "v0");
    }
}
