//! Disjoint sets of transcripts linked by multi-mapping fragments.
//!
//! Each transcript starts in its own cluster. Whenever a fragment could have
//! come from several transcripts their clusters are merged. Every cluster
//! carries the number of fragments assigned to it and their total log mass.
//! These figures are only reported, they do not feed back into assignment.
use std::sync::Mutex;

use petgraph::unionfind::UnionFind;

use crate::math::{log_add, LOG_0};

/// Summary of one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Transcripts in the cluster, sorted
    pub members: Vec<u32>,
    /// Fragments counted against the cluster
    pub count: u64,
    /// Log mass of those fragments
    pub log_mass: f64,
}

#[derive(Debug)]
struct Forest {
    sets: UnionFind<u32>,
    count: Vec<u64>,
    log_mass: Vec<f64>,
}

impl Forest {
    fn contains(&self, tid: u32) -> bool {
        (tid as usize) < self.count.len()
    }

    // The payload always lives on the current root
    fn union(&mut self, a: u32, b: u32) {
        let (ra, rb) = (self.sets.find_mut(a), self.sets.find_mut(b));
        if !self.sets.union(ra, rb) {
            return;
        }
        let root = self.sets.find_mut(ra);
        let child = if root == ra { rb } else { ra };
        let (root, child) = (root as usize, child as usize);
        self.count[root] += self.count[child];
        self.log_mass[root] = log_add(self.log_mass[root], self.log_mass[child]);
        self.count[child] = 0;
        self.log_mass[child] = LOG_0;
    }
}

/// Union-find over transcript ids with a count/mass payload
#[derive(Debug)]
pub struct ClusterForest {
    inner: Mutex<Forest>,
}

impl ClusterForest {
    /// One singleton cluster per transcript
    pub fn new(n_transcripts: usize) -> Self {
        Self {
            inner: Mutex::new(Forest {
                sets: UnionFind::new(n_transcripts),
                count: vec![0; n_transcripts],
                log_mass: vec![LOG_0; n_transcripts],
            }),
        }
    }

    /// Add a fragment to the cluster containing `tid`.
    ///
    /// The mass is always added. The count only changes if `update_count` is
    /// set, which the engine does in the first round. Ids outside the forest
    /// are ignored.
    pub fn update_cluster(&self, tid: u32, count: u64, log_mass: f64, update_count: bool) {
        let mut forest = self.lock();
        if !forest.contains(tid) {
            return;
        }
        let root = forest.sets.find_mut(tid) as usize;
        if update_count {
            forest.count[root] += count;
        }
        forest.log_mass[root] = log_add(forest.log_mass[root], log_mass);
    }

    /// Merge the clusters of every transcript in `tids`, skipping ids outside
    /// the forest
    pub fn merge_clusters(&self, tids: &[u32]) {
        let mut forest = self.lock();
        let valid: Vec<u32> = tids.iter().copied().filter(|t| forest.contains(*t)).collect();
        if let Some((first, rest)) = valid.split_first() {
            for tid in rest {
                forest.union(*first, *tid);
            }
        }
    }

    /// Root of the cluster containing `tid`, `None` if it is outside the forest
    pub fn find(&self, tid: u32) -> Option<u32> {
        let mut forest = self.lock();
        forest.contains(tid).then(|| forest.sets.find_mut(tid))
    }

    /// All clusters, ordered by their smallest member
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut forest = self.lock();
        let n = forest.count.len();
        let mut by_root: hashbrown::HashMap<u32, Vec<u32>> = hashbrown::HashMap::new();
        for tid in 0..n as u32 {
            let root = forest.sets.find_mut(tid);
            by_root.entry(root).or_default().push(tid);
        }
        let mut clusters: Vec<Cluster> = by_root
            .into_iter()
            .map(|(root, members)| Cluster {
                members,
                count: forest.count[root as usize],
                log_mass: forest.log_mass[root as usize],
            })
            .collect();
        clusters.sort_by_key(|c| c.members[0]);
        clusters
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Forest> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
