//! Process-wide registry of identifiers: each project is assembled once.
//!
//! The map is split into shards so that operations on different identifiers
//! rarely contend. Every operation holds exactly one shard lock for a few
//! instructions and never across an `.await`.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use mineassembler_shared::{Project, ProjectId, ProjectLead};

const SHARDS: usize = 16;

#[derive(Debug)]
enum Entry {
    /// Registered, resolution running. URLs from later leads wait here.
    Pending { urls: Vec<String> },
    Done(Arc<Project>),
    Failed { reason: String },
}

pub struct Ledger {
    shards: Vec<Mutex<HashMap<ProjectId, Entry>>>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, id: &ProjectId) -> MutexGuard<'_, HashMap<ProjectId, Entry>> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        self.shards[index].lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `lead.id` for resolution. Returns `true` when the identifier was
    /// already seen; its URLs are then merged into the existing entry and the
    /// caller must not resolve it again.
    pub fn register(&self, lead: &ProjectLead) -> bool {
        let mut shard = self.shard(&lead.id);
        match shard.get_mut(&lead.id) {
            None => {
                shard.insert(
                    lead.id.clone(),
                    Entry::Pending {
                        urls: lead.urls.clone(),
                    },
                );
                false
            }
            Some(entry) => {
                debug!(gid = %lead.id, "identifier already registered");
                merge_into(entry, &lead.urls);
                true
            }
        }
    }

    /// Store the finished project, folding in URLs gathered while it was
    /// being resolved. Returns the stored value.
    pub fn commit(&self, project: Project) -> Arc<Project> {
        let mut shard = self.shard(&project.id);
        let project = match shard.get(&project.id) {
            Some(Entry::Pending { urls }) if !urls.is_empty() => project.with_urls(urls.clone()),
            _ => project,
        };
        let project = Arc::new(project);
        shard.insert(project.id.clone(), Entry::Done(project.clone()));
        project
    }

    /// Record a terminal failure for `id`.
    pub fn fail(&self, id: &ProjectId, reason: &str) {
        self.shard(id).insert(
            id.clone(),
            Entry::Failed {
                reason: reason.to_string(),
            },
        );
    }

    pub fn get(&self, id: &ProjectId) -> Option<Arc<Project>> {
        match self.shard(id).get(id) {
            Some(Entry::Done(project)) => Some(project.clone()),
            _ => None,
        }
    }

    /// Every committed project, ordered by identifier.
    pub fn projects(&self) -> Vec<Arc<Project>> {
        let mut projects: Vec<Arc<Project>> = self
            .shards
            .iter()
            .flat_map(|shard| {
                let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
                shard
                    .values()
                    .filter_map(|entry| match entry {
                        Entry::Done(project) => Some(project.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        projects.sort_by(|a, b| a.id.cmp(&b.id));
        projects
    }

    /// Number of registered identifiers in any state.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn merge_into(entry: &mut Entry, urls: &[String]) {
    if urls.is_empty() {
        return;
    }
    match entry {
        Entry::Pending { urls: pending } => {
            pending.extend(urls.iter().cloned());
            pending.sort();
            pending.dedup();
        }
        Entry::Done(project) => {
            *project = Arc::new(project.with_urls(urls.iter().cloned()));
        }
        Entry::Failed { .. } => {}
    }
}
