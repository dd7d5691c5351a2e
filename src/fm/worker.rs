use std::collections::HashMap;
use std::time::Instant;

/// The supervisor's view of one live worker process.
///
/// `index` is the stable pool slot; `generation` is the reload epoch the worker
/// was spawned under. `expected_exit` is set the instant the supervisor itself
/// initiates termination, so the exit handler never mistakes a deliberate kill
/// for a crash.
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub pid: u32,
    pub index: usize,
    pub generation: u64,
    pub started_at: Instant,
    pub expected_exit: bool,
}

impl WorkerRecord {
    pub fn new(pid: u32, index: usize, generation: u64) -> Self {
        Self {
            pid,
            index,
            generation,
            started_at: Instant::now(),
            expected_exit: false,
        }
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

/// Live worker set, keyed by pid. Owned and mutated exclusively by the
/// supervisor's control task; everything else sees snapshots.
#[derive(Debug, Default)]
pub struct Pool {
    workers: HashMap<u32, WorkerRecord>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rec: WorkerRecord) {
        self.workers.insert(rec.pid, rec);
    }

    pub fn remove(&mut self, pid: u32) -> Option<WorkerRecord> {
        self.workers.remove(&pid)
    }

    pub fn get(&self, pid: u32) -> Option<&WorkerRecord> {
        self.workers.get(&pid)
    }

    pub fn get_mut(&mut self, pid: u32) -> Option<&mut WorkerRecord> {
        self.workers.get_mut(&pid)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.workers.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.values()
    }

    /// Pids of workers occupying the same slot under a strictly older generation.
    ///
    /// Intentionally narrower than "any different generation": concurrent
    /// reloads for other slots, and workers still catching up from a previous
    /// reload, must not be retired by this one.
    pub fn predecessors_of(&self, index: usize, generation: u64) -> Vec<u32> {
        self.workers
            .values()
            .filter(|w| w.index == index && w.generation < generation)
            .map(|w| w.pid)
            .collect()
    }

    /// True when a live, not-yet-terminating worker already holds `index` at `generation`.
    pub fn occupied(&self, index: usize, generation: u64) -> bool {
        self.workers
            .values()
            .any(|w| w.index == index && w.generation == generation && !w.expected_exit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(pid: u32, index: usize, generation: u64) -> WorkerRecord {
        WorkerRecord::new(pid, index, generation)
    }

    #[test]
    fn predecessor_filter_is_same_index_older_generation_only() {
        let mut pool = Pool::new();
        pool.insert(rec(10, 0, 0)); // direct predecessor of slot 0 gen 1
        pool.insert(rec(11, 1, 0)); // other slot, must survive
        pool.insert(rec(12, 0, 1)); // same generation, must survive
        pool.insert(rec(13, 0, 2)); // newer generation, must survive

        let mut preds = pool.predecessors_of(0, 1);
        preds.sort_unstable();
        assert_eq!(preds, vec![10]);
    }

    #[test]
    fn multiple_stale_generations_are_all_retired() {
        let mut pool = Pool::new();
        pool.insert(rec(20, 0, 0));
        pool.insert(rec(21, 0, 1));
        let mut preds = pool.predecessors_of(0, 2);
        preds.sort_unstable();
        assert_eq!(preds, vec![20, 21]);
    }

    #[test]
    fn occupied_ignores_terminating_workers() {
        let mut pool = Pool::new();
        pool.insert(rec(30, 0, 1));
        assert!(pool.occupied(0, 1));
        assert!(!pool.occupied(0, 2));
        assert!(!pool.occupied(1, 1));

        pool.get_mut(30).unwrap().expected_exit = true;
        assert!(!pool.occupied(0, 1));
    }

    #[test]
    fn remove_returns_the_record() {
        let mut pool = Pool::new();
        pool.insert(rec(40, 2, 3));
        let got = pool.remove(40).unwrap();
        assert_eq!(got.index, 2);
        assert_eq!(got.generation, 3);
        assert!(pool.is_empty());
        assert!(pool.remove(40).is_none());
    }
}
