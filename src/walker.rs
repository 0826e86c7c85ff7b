//! Backfill walker.
//!
//! Walks every user, follows `createdTopics` into `topics`, and from each topic
//! follows `subtopics`, `notes` and `audioRecording`. Any reachable document that
//! has no `userId` gets the owning user's id. Top-level topics and subtopics share
//! one shape, so a single [`Walker::process_children`] handles both.

use crate::config::{DanglingMode, TraversalPolicy, WalkOptions};
use crate::report::{DanglingAction, DanglingRefs, Failure, FailureScope, RunReport};
use crate::store::{
    is_valid_document_id, Collection, Document, DocumentStore, AUDIO_FIELD,
    CREATED_TOPICS_FIELD, NOTES_FIELD, SUBTOPICS_FIELD, USER_ID_FIELD,
};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, error, info, warn};

type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// The reference lists a topic-shaped document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildKind {
    Subtopic,
    Note,
    Audio,
}

impl ChildKind {
    const ALL: [ChildKind; 3] = [Self::Subtopic, Self::Note, Self::Audio];

    fn field(self) -> &'static str {
        match self {
            Self::Subtopic => SUBTOPICS_FIELD,
            Self::Note => NOTES_FIELD,
            Self::Audio => AUDIO_FIELD,
        }
    }

    fn collection(self) -> Collection {
        match self {
            Self::Subtopic => Collection::Topics,
            Self::Note => Collection::Notes,
            Self::Audio => Collection::Audios,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Subtopic => "subtopic",
            Self::Note => "note",
            Self::Audio => "audioRecording",
        }
    }
}

/// Mutable state of one pass.
struct Pass {
    report: RunReport,
    /// Topics whose children were fully processed in this pass.
    expanded: HashSet<String>,
    /// Topics whose children are being processed right now (cycle guard).
    in_progress: HashSet<String>,
}

impl Pass {
    fn fail(&mut self, scope: FailureScope, id: &str, err: &anyhow::Error) {
        self.report.failures.push(Failure {
            scope,
            id: id.to_string(),
            message: format!("{:#}", err),
        });
    }
}

pub struct Walker<'s, S: ?Sized> {
    store: &'s S,
    options: WalkOptions,
}

impl<'s, S: DocumentStore + ?Sized> Walker<'s, S> {
    pub fn new(store: &'s S, options: WalkOptions) -> Self {
        Self { store, options }
    }

    /// Run one full pass over the `users` collection.
    ///
    /// Only listing the users can fail the pass; per-user and per-topic errors are
    /// logged, recorded in the report, and skipped.
    pub async fn run(&self) -> Result<RunReport> {
        let mut pass = Pass {
            report: RunReport::new(self.options),
            expanded: HashSet::new(),
            in_progress: HashSet::new(),
        };

        info!(
            "Starting backfill {} (dangling={:?}, traversal={:?}, dry_run={})",
            pass.report.run_id, self.options.dangling, self.options.traversal, self.options.dry_run
        );

        let users = self
            .store
            .list_documents(Collection::Users)
            .await
            .context("Failed to list users")?;
        info!("Found {} users", users.len());

        for user in &users {
            pass.report.users_seen += 1;
            info!("Processing user: {}", user.id);

            if let Err(e) = self.process_user(user, &mut pass).await {
                error!("Error processing user {}: {:#}", user.id, e);
                pass.fail(FailureScope::User, &user.id, &e);
            }
        }

        Ok(pass.report)
    }

    async fn process_user(&self, user: &Document, pass: &mut Pass) -> Result<()> {
        let Some(topic_ids) = user.references(CREATED_TOPICS_FIELD)? else {
            debug!("User {} has no createdTopics, skipping", user.id);
            pass.report.users_without_topics += 1;
            return Ok(());
        };

        info!(
            "Processing created topics for user {}: {:?}",
            user.id, topic_ids
        );

        let mut missing = Vec::new();
        for topic_id in &topic_ids {
            if !is_valid_document_id(topic_id) {
                missing.push(topic_id.clone());
                continue;
            }

            let Some(topic) = self
                .store
                .get_document(Collection::Topics, topic_id)
                .await?
            else {
                missing.push(topic_id.clone());
                continue;
            };

            info!("Processing topic: {}", topic.id);
            if topic.is_tagged() {
                pass.report.already_tagged += 1;
                debug!("Topic {} already has an owner", topic.id);
            } else {
                self.tag(Collection::Topics, &topic.id, &user.id, pass)
                    .await?;
            }

            // Top-level topics are always descended into, owned or not
            self.process_children(&topic, &user.id, pass).await;
        }

        self.handle_dangling(Collection::Users, &user.id, CREATED_TOPICS_FIELD, missing, pass)
            .await
    }

    /// Process the subtopic, note and audio lists of a topic-shaped document.
    /// Errors are caught here so sibling topics still get processed.
    fn process_children<'a>(
        &'a self,
        topic: &'a Document,
        user_id: &'a str,
        pass: &'a mut Pass,
    ) -> LocalBoxFuture<'a, ()> {
        Box::pin(async move {
            if pass.expanded.contains(&topic.id) {
                debug!("Children of topic {} already processed in this pass", topic.id);
                return;
            }
            if !pass.in_progress.insert(topic.id.clone()) {
                debug!("Topic {} is its own ancestor, not descending again", topic.id);
                return;
            }

            let outcome = self.try_process_children(topic, user_id, pass).await;
            pass.in_progress.remove(&topic.id);

            match outcome {
                // A failed topic stays eligible for a later visit in this pass
                Ok(()) => {
                    pass.expanded.insert(topic.id.clone());
                }
                Err(e) => {
                    error!("Error updating subtopics/notes/audio of topic {}: {:#}", topic.id, e);
                    pass.fail(FailureScope::Topic, &topic.id, &e);
                }
            }
        })
    }

    async fn try_process_children(
        &self,
        topic: &Document,
        user_id: &str,
        pass: &mut Pass,
    ) -> Result<()> {
        for kind in ChildKind::ALL {
            let Some(child_ids) = topic.references(kind.field())? else {
                continue;
            };

            let mut missing = Vec::new();
            for child_id in &child_ids {
                if !is_valid_document_id(child_id) {
                    missing.push(child_id.clone());
                    continue;
                }

                let Some(child) = self
                    .store
                    .get_document(kind.collection(), child_id)
                    .await?
                else {
                    missing.push(child_id.clone());
                    continue;
                };

                match kind {
                    ChildKind::Subtopic => self.visit_subtopic(&child, user_id, pass).await?,
                    ChildKind::Note | ChildKind::Audio => {
                        self.visit_item(kind, &child, user_id, pass).await?
                    }
                }
            }

            self.handle_dangling(Collection::Topics, &topic.id, kind.field(), missing, pass)
                .await?;
        }

        Ok(())
    }

    async fn visit_subtopic(&self, subtopic: &Document, user_id: &str, pass: &mut Pass) -> Result<()> {
        if !subtopic.is_tagged() {
            self.tag(Collection::Topics, &subtopic.id, user_id, pass)
                .await?;
            self.process_children(subtopic, user_id, pass).await;
            return Ok(());
        }

        pass.report.already_tagged += 1;
        match self.options.traversal {
            TraversalPolicy::TrustTag => {
                pass.report.skipped_subtrees += 1;
                debug!("Subtopic {} already has an owner, not descending", subtopic.id);
            }
            TraversalPolicy::Exhaustive => {
                debug!("Subtopic {} already has an owner, descending anyway", subtopic.id);
                self.process_children(subtopic, user_id, pass).await;
            }
        }

        Ok(())
    }

    async fn visit_item(
        &self,
        kind: ChildKind,
        item: &Document,
        user_id: &str,
        pass: &mut Pass,
    ) -> Result<()> {
        if item.is_tagged() {
            pass.report.already_tagged += 1;
            debug!("{} {} already has an owner", kind.label(), item.id);
            return Ok(());
        }

        self.tag(kind.collection(), &item.id, user_id, pass).await
    }

    /// The single conditional write: set `userId` on a document that lacks it.
    async fn tag(
        &self,
        collection: Collection,
        id: &str,
        user_id: &str,
        pass: &mut Pass,
    ) -> Result<()> {
        if self.options.dry_run {
            info!("[dry run] Would add 'userId'={} to {}/{}", user_id, collection, id);
            pass.report.planned.bump(collection);
            return Ok(());
        }

        self.store
            .set_field(collection, id, USER_ID_FIELD, user_id)
            .await
            .with_context(|| format!("Failed to set userId on {}/{}", collection, id))?;

        info!("Added 'userId' to {}/{}", collection, id);
        pass.report.written.bump(collection);
        Ok(())
    }

    /// Report ids that did not resolve; in prune mode also strip them from the list.
    async fn handle_dangling(
        &self,
        collection: Collection,
        owner_id: &str,
        field: &'static str,
        ids: Vec<String>,
        pass: &mut Pass,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        warn!(
            "Invalid {} references on {}/{} -> {:?}",
            field, collection, owner_id, ids
        );

        let (action, outcome) = if self.options.dangling == DanglingMode::Report {
            (DanglingAction::Reported, Ok(()))
        } else if self.options.dry_run {
            info!(
                "[dry run] Would remove {} ids from {}/{}.{}",
                ids.len(),
                collection,
                owner_id,
                field
            );
            (DanglingAction::PrunePlanned, Ok(()))
        } else {
            let removed = self
                .store
                .remove_from_array(collection, owner_id, field, &ids)
                .await;
            match removed {
                Ok(()) => {
                    info!(
                        "Removed {} invalid {} references from {}/{}",
                        ids.len(),
                        field,
                        collection,
                        owner_id
                    );
                    (DanglingAction::Pruned, Ok(()))
                }
                Err(e) => (DanglingAction::PruneFailed, Err(e)),
            }
        };

        pass.report.dangling.push(DanglingRefs {
            collection: collection.as_str(),
            owner_id: owner_id.to_string(),
            field,
            ids,
            action,
        });

        outcome
    }
}
