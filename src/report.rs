//! Outcome of one backfill pass.

use crate::config::WalkOptions;
use crate::store::Collection;
use serde::Serialize;
use tracing::{info, warn};

/// Which catch scope absorbed a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureScope {
    User,
    Topic,
}

/// An error caught at a scope boundary; the pass continued past it.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub scope: FailureScope,
    pub id: String,
    pub message: String,
}

/// What happened to a list of dangling ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DanglingAction {
    /// Report mode: logged, list untouched.
    Reported,
    /// Removed from the reference list.
    Pruned,
    /// Prune mode during a dry run: would have been removed.
    PrunePlanned,
    /// Prune mode, but the removal write failed.
    PruneFailed,
}

/// Ids in a reference list whose target document does not exist.
#[derive(Debug, Clone, Serialize)]
pub struct DanglingRefs {
    pub collection: &'static str,
    pub owner_id: String,
    pub field: &'static str,
    pub ids: Vec<String>,
    pub action: DanglingAction,
}

/// Owner writes per collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TagCounts {
    pub topics: usize,
    pub notes: usize,
    pub audios: usize,
}

impl TagCounts {
    pub fn bump(&mut self, collection: Collection) {
        match collection {
            Collection::Topics => self.topics += 1,
            Collection::Notes => self.notes += 1,
            Collection::Audios => self.audios += 1,
            Collection::Users => {}
        }
    }

    pub fn total(&self) -> usize {
        self.topics + self.notes + self.audios
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub options: WalkOptions,
    pub users_seen: usize,
    pub users_without_topics: usize,
    /// `userId` writes sent to the store.
    pub written: TagCounts,
    /// `userId` writes skipped because of a dry run.
    pub planned: TagCounts,
    /// Documents found already owned.
    pub already_tagged: usize,
    /// Already-owned subtopics whose children were not visited.
    pub skipped_subtrees: usize,
    pub dangling: Vec<DanglingRefs>,
    pub failures: Vec<Failure>,
}

impl RunReport {
    pub fn new(options: WalkOptions) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            options,
            users_seen: 0,
            users_without_topics: 0,
            written: TagCounts::default(),
            planned: TagCounts::default(),
            already_tagged: 0,
            skipped_subtrees: 0,
            dangling: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn dangling_count(&self) -> usize {
        self.dangling.iter().map(|d| d.ids.len()).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Summary lines at the end of a pass.
    pub fn log_summary(&self) {
        info!(
            "Backfill {} finished: {} users ({} without topics), {} owner writes (topics={}, notes={}, audios={}), {} already owned",
            self.run_id,
            self.users_seen,
            self.users_without_topics,
            self.written.total(),
            self.written.topics,
            self.written.notes,
            self.written.audios,
            self.already_tagged,
        );

        if self.options.dry_run {
            info!("Dry run: {} owner writes planned, none sent", self.planned.total());
        }
        if self.skipped_subtrees > 0 {
            info!(
                "{} already-owned subtopics were trusted and not descended into",
                self.skipped_subtrees
            );
        }
        if !self.dangling.is_empty() {
            warn!(
                "{} dangling references in {} lists",
                self.dangling_count(),
                self.dangling.len()
            );
        }
        if !self.failures.is_empty() {
            warn!("{} scopes failed and were skipped", self.failures.len());
        }
    }
}
