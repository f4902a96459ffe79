//! Optimistic mutations for one signed-in user.
//!
//! The coordinator owns the user's predicted view: idea counters, vote
//! states, the comment arena and the influence balance. Every mutation runs
//! in two phases. `begin_*` applies the local delta synchronously and hands
//! back a pending handle; `commit` performs the durable write through the
//! [`Backend`] and either reconciles authoritative fields into the view or
//! fails with a [`Rollback`] token that [`MutationCoordinator::rollback`]
//! uses to undo the delta.
//!
//! Commits touching the same entity are serialized in the order they reach
//! the write lock. Authoritative fields are only reconciled by the last
//! outstanding mutation on an entity, so a confirmation never overwrites a
//! later prediction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::comments::{CommentArena, CommentThread};
use crate::vote::VoteTransition;
use crate::{
    Actor, Backend, Comment, EngineError, EntityRef, ForkOutcome, Idea, NewIdea, Profile,
    Result, VoteDirection, VoteOutcome, VoteState,
};

/// Prefix of ids given to comments that have not been saved yet.
pub const PENDING_PREFIX: &str = "pending:";

/// An idea as the signed-in user sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdeaView {
    pub idea: Idea,
    pub vote_state: VoteState,
}

#[derive(Debug, Default)]
struct ViewState {
    ideas: HashMap<String, IdeaView>,
    comments: CommentArena,
    comment_votes: HashMap<String, VoteState>,
    influence: Option<i64>,
    /// Outstanding mutations per entity key.
    pending: HashMap<String, usize>,
}

/// Something to fetch again because a delta could not be undone in place.
enum Reload {
    Idea(String),
    Comments(EntityRef),
}

impl ViewState {
    /// Undo the local delta behind `rollback`. An entity whose state has
    /// moved on since is left alone and returned for reloading.
    fn revert(&mut self, rollback: &Rollback) -> Option<Reload> {
        match rollback {
            Rollback::Vote {
                idea_id,
                transition,
            } => {
                let entry = self.ideas.get_mut(idea_id)?;
                if entry.vote_state != transition.to {
                    return Some(Reload::Idea(idea_id.clone()));
                }
                let undo = transition.inverse();
                entry.vote_state = undo.to;
                entry.idea.votes += undo.count_delta;
                self.influence = self.influence.map(|i| i + undo.influence_delta);
                None
            }
            Rollback::CommentVote {
                comment_id,
                transition,
            } => {
                let current = self
                    .comment_votes
                    .get(comment_id)
                    .copied()
                    .unwrap_or_default();
                if current != transition.to {
                    return self
                        .comments
                        .get(comment_id)
                        .map(|c| Reload::Comments(c.entity()));
                }
                let undo = transition.inverse();
                self.comment_votes.insert(comment_id.clone(), undo.to);
                self.comments.apply_vote_delta(comment_id, undo.count_delta);
                None
            }
            Rollback::Fork { idea_id, .. } => {
                if let Some(entry) = self.ideas.get_mut(idea_id) {
                    entry.idea.forks = entry.idea.forks.saturating_sub(1);
                }
                None
            }
            Rollback::Comment {
                placeholder_id,
                entity,
            } => {
                if self.comments.remove(placeholder_id).is_some() {
                    self.uncount_comment(entity);
                }
                None
            }
        }
    }

    fn uncount_comment(&mut self, entity: &EntityRef) {
        if let Some(entry) = entity.idea_id().and_then(|id| self.ideas.get_mut(id)) {
            entry.idea.comment_count = entry.idea.comment_count.saturating_sub(1);
        }
    }
}

struct Inner {
    backend: Arc<dyn Backend>,
    actor: Actor,
    view: Mutex<ViewState>,
    write_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl Inner {
    fn view(&self) -> MutexGuard<'_, ViewState> {
        self.view.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Settle one outstanding mutation on `key`. Returns whether it was the
    /// last one on that key, and whether nothing at all is outstanding.
    fn release(&self, key: &str) -> (bool, bool) {
        let mut view = self.view();
        let last = match view.pending.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                view.pending.remove(key);
                true
            }
        };
        (last, view.pending.is_empty())
    }
}

fn idea_key(idea_id: &str) -> String {
    EntityRef::idea(idea_id).to_string()
}

fn comment_key(comment_id: &str) -> String {
    format!("comment:{}", comment_id)
}

/// One outstanding mutation. Dropping it without settling undoes its local
/// delta and releases the slot so the entity can be reconciled again.
struct PendingSlot {
    inner: Arc<Inner>,
    key: String,
    undo: Rollback,
    settled: bool,
}

impl PendingSlot {
    fn open(inner: &Arc<Inner>, view: &mut ViewState, key: String, undo: Rollback) -> Self {
        *view.pending.entry(key.clone()).or_default() += 1;
        Self {
            inner: Arc::clone(inner),
            key,
            undo,
            settled: false,
        }
    }

    /// Serialize with other commits on the same key, then run `write`.
    async fn commit<T, F>(mut self, write: F) -> (Result<T>, bool, bool)
    where
        F: Future<Output = Result<T>>,
    {
        let lock = Arc::clone(&*self.inner.write_locks.entry(self.key.clone()).or_default());
        let _guard = lock.lock().await;
        let result = write.await;
        self.settled = true;
        let (last, idle) = self.inner.release(&self.key);
        (result, last, idle)
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if !self.settled {
            if self.inner.view().revert(&self.undo).is_some() {
                debug!(key = %self.key, "dropped mutation was overtaken, keeping later state");
            }
            self.inner.release(&self.key);
        }
    }
}

/// Undo information for a failed mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollback {
    Vote {
        idea_id: String,
        transition: VoteTransition,
    },
    CommentVote {
        comment_id: String,
        transition: VoteTransition,
    },
    Fork {
        idea_id: String,
        idempotency_key: String,
    },
    Comment {
        placeholder_id: String,
        entity: EntityRef,
    },
}

impl Rollback {
    /// The key to reuse when retrying a fork after an ambiguous failure.
    pub fn fork_key(&self) -> Option<&str> {
        match self {
            Self::Fork {
                idempotency_key, ..
            } => Some(idempotency_key),
            _ => None,
        }
    }
}

/// A commit that did not go through. The local delta is still applied until
/// `rollback` is passed to [`MutationCoordinator::rollback`].
#[derive(Debug, Error)]
#[error("mutation failed: {error}")]
pub struct MutationFailure {
    #[source]
    pub error: EngineError,
    pub rollback: Rollback,
}

pub type CommitResult<T> = std::result::Result<T, MutationFailure>;

/// A vote applied locally, waiting to be committed.
#[must_use = "a pending vote is not saved until committed, and dropping it undoes the prediction"]
pub struct PendingVote {
    slot: PendingSlot,
    idea_id: String,
    direction: VoteDirection,
    transition: VoteTransition,
    predicted: VoteOutcome,
}

impl PendingVote {
    pub fn predicted(&self) -> &VoteOutcome {
        &self.predicted
    }

    pub async fn commit(self) -> CommitResult<VoteOutcome> {
        let inner = Arc::clone(&self.slot.inner);
        let (result, last, idle) = self
            .slot
            .commit(inner.backend.vote(&inner.actor, &self.idea_id, self.direction))
            .await;

        match result {
            Ok(outcome) => {
                let mut view = inner.view();
                if last {
                    if let Some(entry) = view.ideas.get_mut(&self.idea_id) {
                        entry.idea.votes = outcome.votes;
                        entry.vote_state = outcome.state;
                    }
                }
                if idle && outcome.influence.is_some() {
                    view.influence = outcome.influence;
                }
                Ok(outcome)
            }
            Err(error) => {
                warn!(idea_id = %self.idea_id, error = %error, "vote commit failed");
                Err(MutationFailure {
                    error,
                    rollback: Rollback::Vote {
                        idea_id: self.idea_id,
                        transition: self.transition,
                    },
                })
            }
        }
    }
}

/// A comment vote applied locally, waiting to be committed.
#[must_use = "a pending vote is not saved until committed, and dropping it undoes the prediction"]
pub struct PendingCommentVote {
    slot: PendingSlot,
    comment_id: String,
    direction: VoteDirection,
    transition: VoteTransition,
    predicted: VoteOutcome,
}

impl PendingCommentVote {
    pub fn predicted(&self) -> &VoteOutcome {
        &self.predicted
    }

    pub async fn commit(self) -> CommitResult<VoteOutcome> {
        let inner = Arc::clone(&self.slot.inner);
        let (result, last, _) = self
            .slot
            .commit(
                inner
                    .backend
                    .vote_comment(&inner.actor, &self.comment_id, self.direction),
            )
            .await;

        match result {
            Ok(outcome) => {
                if last {
                    let mut view = inner.view();
                    view.comments.set_votes(&self.comment_id, outcome.votes);
                    view.comment_votes
                        .insert(self.comment_id.clone(), outcome.state);
                }
                Ok(outcome)
            }
            Err(error) => {
                warn!(comment_id = %self.comment_id, error = %error, "comment vote commit failed");
                Err(MutationFailure {
                    error,
                    rollback: Rollback::CommentVote {
                        comment_id: self.comment_id,
                        transition: self.transition,
                    },
                })
            }
        }
    }
}

/// A fork counted locally, waiting to be committed.
#[must_use = "a pending fork is not saved until committed, and dropping it undoes the prediction"]
pub struct PendingFork {
    slot: PendingSlot,
    idea_id: String,
    idempotency_key: String,
    predicted_forks: u64,
}

impl PendingFork {
    /// The source idea's fork counter as predicted.
    pub fn predicted_forks(&self) -> u64 {
        self.predicted_forks
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub async fn commit(self) -> CommitResult<ForkOutcome> {
        let inner = Arc::clone(&self.slot.inner);
        let (result, last, _) = self
            .slot
            .commit(
                inner
                    .backend
                    .fork(&inner.actor, &self.idea_id, &self.idempotency_key),
            )
            .await;

        match result {
            Ok(outcome) => {
                let mut view = inner.view();
                if last {
                    if let Some(entry) = view.ideas.get_mut(&self.idea_id) {
                        entry.idea.forks = outcome.source_forks;
                    }
                }
                view.ideas
                    .entry(outcome.fork.id.clone())
                    .or_insert_with(|| IdeaView {
                        idea: outcome.fork.clone(),
                        vote_state: VoteState::None,
                    });
                Ok(outcome)
            }
            Err(error) => {
                warn!(idea_id = %self.idea_id, key = %self.idempotency_key, error = %error, "fork commit failed");
                Err(MutationFailure {
                    error,
                    rollback: Rollback::Fork {
                        idea_id: self.idea_id,
                        idempotency_key: self.idempotency_key,
                    },
                })
            }
        }
    }
}

/// A comment or reply shown locally under a placeholder id, waiting to be
/// committed.
#[must_use = "a pending comment is not saved until committed, and dropping it removes the placeholder"]
pub struct PendingComment {
    slot: PendingSlot,
    placeholder: Comment,
    entity: EntityRef,
}

impl PendingComment {
    /// The locally inserted comment. Its id starts with [`PENDING_PREFIX`].
    pub fn predicted(&self) -> &Comment {
        &self.placeholder
    }

    pub async fn commit(self) -> CommitResult<Comment> {
        let inner = Arc::clone(&self.slot.inner);
        let (placeholder, entity) = (&self.placeholder, &self.entity);
        let write = async {
            match &placeholder.parent_comment_id {
                Some(parent) => {
                    inner
                        .backend
                        .add_reply(&inner.actor, parent, &placeholder.text)
                        .await
                }
                None => {
                    inner
                        .backend
                        .add_comment(&inner.actor, entity, &placeholder.text)
                        .await
                }
            }
        };
        let (result, _, _) = self.slot.commit(write).await;

        match result {
            Ok(comment) => {
                let mut view = inner.view();
                if let Err(e) = view.comments.rekey(&self.placeholder.id, comment.clone()) {
                    debug!(comment_id = %comment.id, error = %e, "saved comment already in view");
                }
                Ok(comment)
            }
            Err(error) => {
                warn!(entity = %self.entity, error = %error, "comment commit failed");
                Err(MutationFailure {
                    error,
                    rollback: Rollback::Comment {
                        placeholder_id: self.placeholder.id,
                        entity: self.entity,
                    },
                })
            }
        }
    }
}

/// Optimistic mutation coordinator for one user over any [`Backend`].
#[derive(Clone)]
pub struct MutationCoordinator {
    inner: Arc<Inner>,
}

impl MutationCoordinator {
    pub fn new(backend: Arc<dyn Backend>, actor: Actor) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                actor,
                view: Mutex::new(ViewState::default()),
                write_locks: DashMap::new(),
            }),
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.inner.actor
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.inner.backend
    }

    // =========================================================================
    // View
    // =========================================================================

    pub fn idea_view(&self, idea_id: &str) -> Option<IdeaView> {
        self.inner.view().ideas.get(idea_id).cloned()
    }

    pub fn comment(&self, comment_id: &str) -> Option<Comment> {
        self.inner.view().comments.get(comment_id).cloned()
    }

    pub fn comment_vote_state(&self, comment_id: &str) -> VoteState {
        self.inner
            .view()
            .comment_votes
            .get(comment_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn thread(&self, entity: &EntityRef) -> Vec<CommentThread> {
        self.inner.view().comments.thread(entity)
    }

    /// The predicted balance, once a profile has been loaded.
    pub fn influence(&self) -> Option<i64> {
        self.inner.view().influence
    }

    /// Number of mutations begun but not yet committed.
    pub fn pending_count(&self) -> usize {
        self.inner.view().pending.values().sum()
    }

    /// Pull an idea and the user's vote on it into the view. An idea with
    /// outstanding mutations keeps its predicted fields.
    pub async fn load_idea(&self, idea_id: &str) -> Result<IdeaView> {
        let idea = self
            .inner
            .backend
            .get_idea(idea_id)
            .await?
            .ok_or_else(|| EngineError::not_found("idea", idea_id))?;
        let vote_state = self
            .inner
            .backend
            .vote_state(&self.inner.actor, idea_id)
            .await?;

        let fresh = IdeaView { idea, vote_state };
        let mut view = self.inner.view();
        if view.pending.contains_key(&idea_key(idea_id)) {
            if let Some(current) = view.ideas.get(idea_id) {
                return Ok(current.clone());
            }
        }
        view.ideas.insert(idea_id.to_string(), fresh.clone());
        Ok(fresh)
    }

    /// Load the newest ideas into the view.
    pub async fn load_ideas(&self, limit: Option<usize>) -> Result<Vec<IdeaView>> {
        let ideas = self.inner.backend.list_ideas(limit).await?;
        let mut out = Vec::with_capacity(ideas.len());
        for idea in ideas {
            out.push(self.load_idea(&idea.id).await?);
        }
        Ok(out)
    }

    /// Pull `entity`'s comments and the user's votes on them into the view.
    /// Unsaved placeholders stay in place.
    pub async fn load_comments(&self, entity: &EntityRef) -> Result<Vec<CommentThread>> {
        let comments = self.inner.backend.list_comments(entity).await?;
        let mut states = Vec::with_capacity(comments.len());
        for comment in &comments {
            let state = self
                .inner
                .backend
                .comment_vote_state(&self.inner.actor, &comment.id)
                .await?;
            states.push((comment.id.clone(), state));
        }

        let mut view = self.inner.view();
        let placeholders: Vec<Comment> = view
            .comments
            .entity_comments(entity)
            .into_iter()
            .filter(|c| c.id.starts_with(PENDING_PREFIX))
            .cloned()
            .collect();
        view.comments.replace_entity(entity, comments);
        for placeholder in placeholders {
            let id = placeholder.id.clone();
            if let Err(e) = view.comments.insert(placeholder) {
                debug!(comment_id = %id, error = %e, "dropping placeholder whose parent is gone");
                view.uncount_comment(entity);
            }
        }
        for (id, state) in states {
            if !view.pending.contains_key(&comment_key(&id)) {
                view.comment_votes.insert(id, state);
            }
        }
        Ok(view.comments.thread(entity))
    }

    /// Pull the user's profile and balance into the view.
    pub async fn load_profile(&self) -> Result<Profile> {
        let profile = self.inner.backend.ensure_profile(&self.inner.actor).await?;
        let mut view = self.inner.view();
        if view.pending.is_empty() {
            view.influence = Some(profile.influence);
        }
        Ok(profile)
    }

    /// Reload the profile and every idea already in the view.
    pub async fn refresh(&self) -> Result<()> {
        self.load_profile().await?;
        let ids: Vec<String> = self.inner.view().ideas.keys().cloned().collect();
        for id in ids {
            self.load_idea(&id).await?;
        }
        Ok(())
    }

    pub async fn create_idea(&self, idea: NewIdea) -> Result<IdeaView> {
        let idea = self.inner.backend.create_idea(&self.inner.actor, idea).await?;
        let view = IdeaView {
            idea,
            vote_state: VoteState::None,
        };
        self.inner
            .view()
            .ideas
            .insert(view.idea.id.clone(), view.clone());
        Ok(view)
    }

    // =========================================================================
    // Two-phase mutations
    // =========================================================================

    /// Apply a vote to the view. The idea must already be loaded.
    pub fn begin_vote(&self, idea_id: &str, direction: VoteDirection) -> Result<PendingVote> {
        let mut view = self.inner.view();
        let influence = view.influence;
        let entry = view
            .ideas
            .get_mut(idea_id)
            .ok_or_else(|| EngineError::not_found("idea", idea_id))?;

        let transition = entry.vote_state.apply(direction);
        if let Some(available) = influence {
            transition.check_influence(available)?;
        }

        entry.vote_state = transition.to;
        entry.idea.votes += transition.count_delta;
        let votes = entry.idea.votes;
        let influence = influence.map(|i| i + transition.influence_delta);
        view.influence = influence;

        let undo = Rollback::Vote {
            idea_id: idea_id.to_string(),
            transition,
        };
        let slot = PendingSlot::open(&self.inner, &mut view, idea_key(idea_id), undo);
        debug!(idea_id, state = ?transition.to, votes, "predicted vote");
        Ok(PendingVote {
            slot,
            idea_id: idea_id.to_string(),
            direction,
            transition,
            predicted: VoteOutcome {
                entity_id: idea_id.to_string(),
                state: transition.to,
                votes,
                influence,
            },
        })
    }

    /// Apply a comment vote to the view. The comment must already be loaded.
    pub fn begin_comment_vote(
        &self,
        comment_id: &str,
        direction: VoteDirection,
    ) -> Result<PendingCommentVote> {
        if comment_id.starts_with(PENDING_PREFIX) {
            return Err(EngineError::Invalid(
                "cannot vote on a comment that is not saved yet".to_string(),
            ));
        }
        let mut view = self.inner.view();
        if !view.comments.contains(comment_id) {
            return Err(EngineError::not_found("comment", comment_id));
        }

        let current = view
            .comment_votes
            .get(comment_id)
            .copied()
            .unwrap_or_default();
        let transition = current.apply(direction);
        view.comment_votes
            .insert(comment_id.to_string(), transition.to);
        let votes = view
            .comments
            .apply_vote_delta(comment_id, transition.count_delta)
            .unwrap_or_default();

        let undo = Rollback::CommentVote {
            comment_id: comment_id.to_string(),
            transition,
        };
        let slot = PendingSlot::open(&self.inner, &mut view, comment_key(comment_id), undo);
        Ok(PendingCommentVote {
            slot,
            comment_id: comment_id.to_string(),
            direction,
            transition,
            predicted: VoteOutcome {
                entity_id: comment_id.to_string(),
                state: transition.to,
                votes,
                influence: None,
            },
        })
    }

    /// Count a fork in the view under a fresh idempotency key.
    pub fn begin_fork(&self, idea_id: &str) -> Result<PendingFork> {
        self.begin_fork_with_key(idea_id, uuid::Uuid::new_v4().to_string())
    }

    /// Count a fork in the view under `idempotency_key`. Reuse the key from a
    /// failed attempt to retry it without double counting.
    pub fn begin_fork_with_key(
        &self,
        idea_id: &str,
        idempotency_key: impl Into<String>,
    ) -> Result<PendingFork> {
        let mut view = self.inner.view();
        let entry = view
            .ideas
            .get_mut(idea_id)
            .ok_or_else(|| EngineError::not_found("idea", idea_id))?;
        entry.idea.forks += 1;
        let predicted_forks = entry.idea.forks;

        let idempotency_key = idempotency_key.into();
        let undo = Rollback::Fork {
            idea_id: idea_id.to_string(),
            idempotency_key: idempotency_key.clone(),
        };
        let slot = PendingSlot::open(&self.inner, &mut view, idea_key(idea_id), undo);
        Ok(PendingFork {
            slot,
            idea_id: idea_id.to_string(),
            idempotency_key,
            predicted_forks,
        })
    }

    /// Show a new top-level comment under a placeholder id.
    pub fn begin_comment(&self, entity: &EntityRef, text: &str) -> Result<PendingComment> {
        self.begin_comment_inner(entity.clone(), None, text)
    }

    /// Show a reply under a placeholder id. The parent must be loaded and
    /// saved.
    pub fn begin_reply(&self, parent_comment_id: &str, text: &str) -> Result<PendingComment> {
        if parent_comment_id.starts_with(PENDING_PREFIX) {
            return Err(EngineError::Invalid(
                "cannot reply to a comment that is not saved yet".to_string(),
            ));
        }
        let entity = self
            .inner
            .view()
            .comments
            .get(parent_comment_id)
            .map(Comment::entity)
            .ok_or_else(|| EngineError::not_found("comment", parent_comment_id))?;
        self.begin_comment_inner(entity, Some(parent_comment_id.to_string()), text)
    }

    fn begin_comment_inner(
        &self,
        entity: EntityRef,
        parent: Option<String>,
        text: &str,
    ) -> Result<PendingComment> {
        if text.trim().is_empty() {
            return Err(EngineError::Invalid("comment text cannot be empty".to_string()));
        }

        let placeholder = Comment::new(
            format!("{}{}", PENDING_PREFIX, uuid::Uuid::new_v4()),
            &self.inner.actor,
            &entity,
            parent,
            text,
        );

        let mut view = self.inner.view();
        view.comments.insert(placeholder.clone())?;
        if let Some(entry) = entity.idea_id().and_then(|id| view.ideas.get_mut(id)) {
            entry.idea.comment_count += 1;
        }

        let undo = Rollback::Comment {
            placeholder_id: placeholder.id.clone(),
            entity: entity.clone(),
        };
        let slot = PendingSlot::open(&self.inner, &mut view, entity.to_string(), undo);
        Ok(PendingComment {
            slot,
            placeholder,
            entity,
        })
    }

    /// Undo the local delta of a failed commit. If other mutations have
    /// moved the entity on since, the entity is reloaded instead.
    pub async fn rollback(&self, rollback: Rollback) -> Result<()> {
        let reload = self.inner.view().revert(&rollback);
        match reload {
            Some(Reload::Idea(idea_id)) => {
                debug!(idea_id = %idea_id, "vote moved on since failure, reloading");
                self.load_idea(&idea_id).await?;
                self.load_profile().await?;
            }
            Some(Reload::Comments(entity)) => {
                debug!(entity = %entity, "comment vote moved on since failure, reloading");
                self.load_comments(&entity).await?;
            }
            None => {}
        }
        Ok(())
    }

    // =========================================================================
    // One-shot mutations
    // =========================================================================

    /// Vote, loading the idea first if needed, and roll back on failure.
    pub async fn vote(&self, idea_id: &str, direction: VoteDirection) -> Result<VoteOutcome> {
        if self.idea_view(idea_id).is_none() {
            self.load_idea(idea_id).await?;
        }
        if self.influence().is_none() {
            self.load_profile().await?;
        }
        let pending = self.begin_vote(idea_id, direction)?;
        self.settle(pending.commit().await).await
    }

    pub async fn fork(&self, idea_id: &str) -> Result<ForkOutcome> {
        if self.idea_view(idea_id).is_none() {
            self.load_idea(idea_id).await?;
        }
        let pending = self.begin_fork(idea_id)?;
        self.settle(pending.commit().await).await
    }

    pub async fn add_comment(&self, entity: &EntityRef, text: &str) -> Result<Comment> {
        let pending = self.begin_comment(entity, text)?;
        self.settle(pending.commit().await).await
    }

    pub async fn add_reply(&self, parent_comment_id: &str, text: &str) -> Result<Comment> {
        if self.comment(parent_comment_id).is_none() {
            if let Some(parent) = self.inner.backend.get_comment(parent_comment_id).await? {
                self.load_comments(&parent.entity()).await?;
            }
        }
        let pending = self.begin_reply(parent_comment_id, text)?;
        self.settle(pending.commit().await).await
    }

    pub async fn vote_comment(
        &self,
        comment_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        let pending = self.begin_comment_vote(comment_id, direction)?;
        self.settle(pending.commit().await).await
    }

    async fn settle<T>(&self, result: CommitResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(failure) => {
                if let Err(e) = self.rollback(failure.rollback).await {
                    warn!(error = %e, "rollback after failed commit also failed");
                }
                Err(failure.error)
            }
        }
    }
}
