//! Backend over the remote row store.
//!
//! Every call goes through [`DataAccess`], so reads are cached and
//! coalesced and each row-store call is retried on abort-like failures.
//! Reads that feed a counter update are forced past the cache.
//!
//! Multi-row operations are not transactional. Counters are shifted
//! relative to a forced read, never set to a value computed earlier. Where a
//! retry could repeat a side effect the rows carry deterministic ids instead:
//! vote rows are keyed by (user, entity), and a fork's idea row, claim row
//! and notification row are all derived from its idempotency key. A vote row
//! is written last, and the counters it depends on are shifted back when it
//! cannot be written.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use ideaforge_store::{
    DataAccess, FetchOptions, Filters, Order, Row, StoreError, UpsertOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    Actor, ApplicationStatus, Backend, Comment, EngineError, EntityRef, ForkOutcome, Idea,
    NewIdea, NewPledge, Notification, NotificationKind, Profile, ResourcePledge, Result,
    RoleApplication, VoteDirection, VoteOutcome, VoteState,
};

/// Table names in the remote store.
pub mod tables {
    pub const IDEAS: &str = "ideas";
    pub const COMMENTS: &str = "comments";
    pub const IDEA_VOTES: &str = "idea_votes";
    pub const COMMENT_VOTES: &str = "comment_votes";
    pub const PROFILES: &str = "profiles";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const RESOURCE_PLEDGES: &str = "resource_pledges";
    pub const ROLE_APPLICATIONS: &str = "role_applications";
    pub const FORK_REQUESTS: &str = "fork_requests";
}

use tables::*;

/// The part of a stored vote row the backend reads back.
#[derive(Debug, Deserialize)]
struct VoteRow {
    direction: VoteDirection,
}

/// The claim recorded for each fork idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ForkRequest {
    id: String,
    idea_id: String,
    fork_id: String,
    user_id: String,
    /// The source idea's fork counter has been incremented for this claim.
    #[serde(default)]
    counted: bool,
    #[serde(default)]
    completed: bool,
}

fn decode<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(row)?)
}

fn decode_all<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode).collect()
}

fn encode<T: Serialize>(value: &T) -> Result<Row> {
    Ok(serde_json::to_value(value)?)
}

fn derived_id(scope: &str, key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("ideaforge:{}:{}", scope, key).as_bytes())
        .to_string()
}

/// Row id of `user_id`'s vote on `entity_id`.
pub fn vote_row_id(user_id: &str, entity_id: &str) -> String {
    derived_id("vote", &format!("{}:{}", user_id, entity_id))
}

/// Id of the idea created by the fork with this idempotency key.
pub fn fork_idea_id(idempotency_key: &str) -> String {
    derived_id("fork", idempotency_key)
}

fn require_text(text: &str, what: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{} cannot be empty", what)));
    }
    Ok(())
}

/// A [`Backend`] that stores entities as rows in the remote store.
pub struct RemoteBackend {
    access: Arc<DataAccess>,
}

impl RemoteBackend {
    pub fn new(access: Arc<DataAccess>) -> Self {
        Self { access }
    }

    pub fn access(&self) -> &Arc<DataAccess> {
        &self.access
    }

    async fn single<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
        force: bool,
    ) -> Result<Option<T>> {
        self.access
            .try_fetch_single(table, &Filters::by_id(id), force)
            .await?
            .map(decode)
            .transpose()
    }

    async fn idea(&self, id: &str, force: bool) -> Result<Idea> {
        self.single(IDEAS, id, force)
            .await?
            .ok_or_else(|| EngineError::not_found("idea", id))
    }

    async fn comment(&self, id: &str) -> Result<Comment> {
        self.single(COMMENTS, id, true)
            .await?
            .ok_or_else(|| EngineError::not_found("comment", id))
    }

    /// Apply `updates` to a row and decode the result.
    async fn update<T: DeserializeOwned>(
        &self,
        table: &str,
        kind: &'static str,
        id: &str,
        updates: Row,
    ) -> Result<T> {
        self.access
            .try_update_row(table, id, updates)
            .await?
            .map(decode)
            .transpose()?
            .ok_or_else(|| EngineError::not_found(kind, id))
    }

    /// Add `delta` to an integer column, reading the current value past the
    /// cache.
    async fn shift<T: DeserializeOwned>(
        &self,
        table: &str,
        kind: &'static str,
        id: &str,
        column: &str,
        delta: i64,
    ) -> Result<T> {
        let row = self
            .access
            .try_fetch_single(table, &Filters::by_id(id), true)
            .await?
            .ok_or_else(|| EngineError::not_found(kind, id))?;
        let current = row.get(column).and_then(Value::as_i64).unwrap_or_default();
        self.update(table, kind, id, json!({ column: current + delta }))
            .await
    }

    /// Undo an earlier `shift` after a later write of the same operation
    /// failed.
    async fn unshift(&self, table: &str, id: &str, column: &str, delta: i64) {
        if let Err(e) = self.shift::<Row>(table, "row", id, column, -delta).await {
            warn!(table, id, column, delta, error = %e, "could not undo counter change");
        }
    }

    async fn notify(
        &self,
        recipient: &str,
        kind: NotificationKind,
        actor: &Actor,
        idea: &Idea,
    ) -> Result<()> {
        if recipient == actor.id {
            return Ok(());
        }
        let notification = Notification::new(recipient, kind, actor, idea);
        self.access
            .try_insert_row(NOTIFICATIONS, encode(&notification)?)
            .await?;
        Ok(())
    }

    async fn stored_vote(&self, table: &str, row_id: &str) -> Result<VoteState> {
        let row: Option<VoteRow> = self.single(table, row_id, true).await?;
        Ok(VoteState::from_direction(row.map(|r| r.direction)))
    }

    /// Persist a vote state. `None` deletes the row.
    async fn write_vote(
        &self,
        table: &str,
        entity_column: &str,
        actor: &Actor,
        entity_id: &str,
        state: VoteState,
    ) -> Result<()> {
        let row_id = vote_row_id(&actor.id, entity_id);
        match state.direction() {
            None => {
                self.access
                    .try_delete_rows(table, &Filters::by_id(row_id))
                    .await?;
            }
            Some(direction) => {
                let row = json!({
                    "id": row_id,
                    "user_id": actor.id,
                    entity_column: entity_id,
                    "direction": direction,
                });
                self.access
                    .try_upsert_row(table, row, &UpsertOptions::on_conflict("id"))
                    .await?;
            }
        }
        Ok(())
    }

    async fn fresh_profile(&self, actor: &Actor) -> Result<Profile> {
        if let Some(profile) = self.single(PROFILES, &actor.id, true).await? {
            return Ok(profile);
        }
        match self
            .access
            .try_insert_row(PROFILES, encode(&Profile::new(actor))?)
            .await
        {
            Ok(row) => decode(row),
            // Created concurrently.
            Err(StoreError::Conflict { .. }) => self
                .single(PROFILES, &actor.id, true)
                .await?
                .ok_or_else(|| EngineError::not_found("profile", actor.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Count a claimed fork and notify the source author. Safe to repeat for
    /// an incomplete claim: the counter moves only while the claim is not
    /// yet marked counted, and the notification id is derived from the key.
    /// A hard failure between the increment and the mark is the one gap
    /// left: a retry then counts the fork again.
    async fn complete_fork(
        &self,
        actor: &Actor,
        source: &Idea,
        fork: &Idea,
        claim: &ForkRequest,
    ) -> Result<u64> {
        let source: Idea = if claim.counted {
            self.idea(&source.id, true).await?
        } else {
            let source: Idea = self.shift(IDEAS, "idea", &source.id, "forks", 1).await?;
            self.access
                .try_update_row(FORK_REQUESTS, &claim.id, json!({ "counted": true }))
                .await?;
            source
        };

        let mut notification =
            Notification::new(&source.author_id, NotificationKind::Fork, actor, fork);
        notification.id = derived_id("fork-notification", &claim.id);
        match self
            .access
            .try_insert_row(NOTIFICATIONS, encode(&notification)?)
            .await
        {
            Ok(_) | Err(StoreError::Conflict { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.access
            .try_update_row(FORK_REQUESTS, &claim.id, json!({ "completed": true }))
            .await?;
        Ok(source.forks)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn get_idea(&self, id: &str) -> Result<Option<Idea>> {
        self.single(IDEAS, id, false).await
    }

    async fn list_ideas(&self, limit: Option<usize>) -> Result<Vec<Idea>> {
        let mut options = FetchOptions::new().order(Order::desc("created_at"));
        if let Some(limit) = limit {
            options = options.limit(limit);
        }
        let rows = self
            .access
            .try_fetch_rows(IDEAS, &Filters::new(), &options)
            .await?;
        decode_all(rows)
    }

    async fn create_idea(&self, actor: &Actor, idea: NewIdea) -> Result<Idea> {
        require_text(&idea.title, "idea title")?;
        let idea = Idea::new(Uuid::new_v4().to_string(), actor, idea);
        let row = self.access.try_insert_row(IDEAS, encode(&idea)?).await?;
        info!(idea_id = %idea.id, author = %actor.id, "created idea");
        decode(row)
    }

    async fn record_view(&self, idea_id: &str) -> Result<Idea> {
        self.shift(IDEAS, "idea", idea_id, "views", 1).await
    }

    async fn record_share(&self, idea_id: &str) -> Result<Idea> {
        self.shift(IDEAS, "idea", idea_id, "shares", 1).await
    }

    async fn vote_state(&self, actor: &Actor, idea_id: &str) -> Result<VoteState> {
        self.stored_vote(IDEA_VOTES, &vote_row_id(&actor.id, idea_id))
            .await
    }

    async fn vote(
        &self,
        actor: &Actor,
        idea_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        self.idea(idea_id, true).await?;
        let transition = self
            .stored_vote(IDEA_VOTES, &vote_row_id(&actor.id, idea_id))
            .await?
            .apply(direction);

        let profile = self.fresh_profile(actor).await?;
        transition.check_influence(profile.influence)?;

        let idea: Idea = self
            .shift(IDEAS, "idea", idea_id, "votes", transition.count_delta)
            .await?;

        let mut influence = profile.influence;
        if transition.influence_delta != 0 {
            match self
                .shift::<Profile>(
                    PROFILES,
                    "profile",
                    &profile.id,
                    "influence",
                    transition.influence_delta,
                )
                .await
            {
                Ok(profile) => influence = profile.influence,
                Err(e) => {
                    self.unshift(IDEAS, idea_id, "votes", transition.count_delta)
                        .await;
                    return Err(e);
                }
            }
        }

        // The vote row is the commit point.
        if let Err(e) = self
            .write_vote(IDEA_VOTES, "idea_id", actor, idea_id, transition.to)
            .await
        {
            self.unshift(IDEAS, idea_id, "votes", transition.count_delta)
                .await;
            if transition.influence_delta != 0 {
                self.unshift(PROFILES, &profile.id, "influence", transition.influence_delta)
                    .await;
            }
            return Err(e);
        }

        debug!(idea_id, user = %actor.id, state = ?transition.to, votes = idea.votes, "recorded vote");
        Ok(VoteOutcome {
            entity_id: idea.id,
            state: transition.to,
            votes: idea.votes,
            influence: Some(influence),
        })
    }

    async fn fork(
        &self,
        actor: &Actor,
        idea_id: &str,
        idempotency_key: &str,
    ) -> Result<ForkOutcome> {
        let source = self.idea(idea_id, true).await?;

        let existing: Option<ForkRequest> =
            self.single(FORK_REQUESTS, idempotency_key, true).await?;
        if let Some(claim) = &existing {
            if claim.idea_id != idea_id {
                return Err(EngineError::Invalid(format!(
                    "fork key {} was used for a different idea",
                    idempotency_key
                )));
            }
        }

        let fork_id = existing
            .as_ref()
            .map(|claim| claim.fork_id.clone())
            .unwrap_or_else(|| fork_idea_id(idempotency_key));
        let fork = match self.single::<Idea>(IDEAS, &fork_id, true).await? {
            Some(fork) => fork,
            None => match self
                .access
                .try_insert_row(IDEAS, encode(&source.fork_as(fork_id.clone(), actor))?)
                .await
            {
                Ok(row) => decode(row)?,
                Err(StoreError::Conflict { .. }) => self.idea(&fork_id, true).await?,
                Err(e) => return Err(e.into()),
            },
        };

        let (claim, replayed) = match existing {
            Some(claim) => (claim, true),
            None => {
                let claim = ForkRequest {
                    id: idempotency_key.to_string(),
                    idea_id: idea_id.to_string(),
                    fork_id: fork.id.clone(),
                    user_id: actor.id.clone(),
                    counted: false,
                    completed: false,
                };
                let mut row = encode(&claim)?;
                row["created_at"] = json!(Utc::now());
                match self.access.try_insert_row(FORK_REQUESTS, row).await {
                    Ok(_) => (claim, false),
                    Err(StoreError::Conflict { .. }) => {
                        let claim = self
                            .single(FORK_REQUESTS, idempotency_key, true)
                            .await?
                            .ok_or_else(|| {
                                EngineError::not_found("fork request", idempotency_key)
                            })?;
                        (claim, true)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        let source_forks = if claim.completed {
            source.forks
        } else {
            self.complete_fork(actor, &source, &fork, &claim).await?
        };

        info!(idea_id, fork_id = %fork.id, replayed, "forked idea");
        Ok(ForkOutcome {
            fork,
            source_forks,
            replayed: replayed && claim.completed,
        })
    }

    async fn get_comment(&self, id: &str) -> Result<Option<Comment>> {
        self.single(COMMENTS, id, false).await
    }

    async fn list_comments(&self, entity: &EntityRef) -> Result<Vec<Comment>> {
        let filters = Filters::new()
            .eq("entity_kind", entity.kind.as_str())
            .eq("entity_id", entity.id.as_str());
        let rows = self
            .access
            .try_fetch_rows(
                COMMENTS,
                &filters,
                &FetchOptions::new().order(Order::asc("created_at")),
            )
            .await?;
        decode_all(rows)
    }

    async fn add_comment(&self, actor: &Actor, entity: &EntityRef, text: &str) -> Result<Comment> {
        require_text(text, "comment text")?;
        let idea = match entity.idea_id() {
            Some(idea_id) => Some(self.idea(idea_id, true).await?),
            None => None,
        };

        let comment = Comment::new(Uuid::new_v4().to_string(), actor, entity, None, text);
        let row = self
            .access
            .try_insert_row(COMMENTS, encode(&comment)?)
            .await?;

        if let Some(idea) = idea {
            let idea: Idea = self
                .shift(IDEAS, "idea", &idea.id, "comment_count", 1)
                .await?;
            self.notify(&idea.author_id, NotificationKind::Comment, actor, &idea)
                .await?;
        }
        decode(row)
    }

    async fn add_reply(
        &self,
        actor: &Actor,
        parent_comment_id: &str,
        text: &str,
    ) -> Result<Comment> {
        require_text(text, "reply text")?;
        let parent = self.comment(parent_comment_id).await?;
        let entity = parent.entity();

        let reply = Comment::new(
            Uuid::new_v4().to_string(),
            actor,
            &entity,
            Some(parent.id.clone()),
            text,
        );
        let row = self.access.try_insert_row(COMMENTS, encode(&reply)?).await?;

        if let Some(idea_id) = entity.idea_id() {
            let idea: Idea = self
                .shift(IDEAS, "idea", idea_id, "comment_count", 1)
                .await?;
            self.notify(&parent.author_id, NotificationKind::Reply, actor, &idea)
                .await?;
        }
        decode(row)
    }

    async fn vote_comment(
        &self,
        actor: &Actor,
        comment_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        self.comment(comment_id).await?;
        let transition = self
            .stored_vote(COMMENT_VOTES, &vote_row_id(&actor.id, comment_id))
            .await?
            .apply(direction);

        let comment: Comment = self
            .shift(COMMENTS, "comment", comment_id, "votes", transition.count_delta)
            .await?;
        if let Err(e) = self
            .write_vote(COMMENT_VOTES, "comment_id", actor, comment_id, transition.to)
            .await
        {
            self.unshift(COMMENTS, comment_id, "votes", transition.count_delta)
                .await;
            return Err(e);
        }

        Ok(VoteOutcome {
            entity_id: comment.id,
            state: transition.to,
            votes: comment.votes,
            influence: None,
        })
    }

    async fn comment_vote_state(&self, actor: &Actor, comment_id: &str) -> Result<VoteState> {
        self.stored_vote(COMMENT_VOTES, &vote_row_id(&actor.id, comment_id))
            .await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        self.single(PROFILES, user_id, false).await
    }

    async fn ensure_profile(&self, actor: &Actor) -> Result<Profile> {
        self.fresh_profile(actor).await
    }

    async fn notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let rows = self
            .access
            .try_fetch_rows(
                NOTIFICATIONS,
                &Filters::new().eq("recipient_id", user_id),
                &FetchOptions::new().order(Order::desc("created_at")),
            )
            .await?;
        decode_all(rows)
    }

    async fn mark_notification_read(
        &self,
        actor: &Actor,
        notification_id: &str,
    ) -> Result<Notification> {
        let notification: Notification = self
            .single(NOTIFICATIONS, notification_id, true)
            .await?
            .ok_or_else(|| EngineError::not_found("notification", notification_id))?;
        if notification.recipient_id != actor.id {
            return Err(EngineError::Forbidden(
                "notification belongs to another user".to_string(),
            ));
        }
        self.update(
            NOTIFICATIONS,
            "notification",
            notification_id,
            json!({ "read": true }),
        )
        .await
    }

    async fn pledge_resource(
        &self,
        actor: &Actor,
        idea_id: &str,
        pledge: NewPledge,
    ) -> Result<ResourcePledge> {
        if pledge.amount.is_some_and(|a| !a.is_finite() || a < 0.0) {
            return Err(EngineError::Invalid(
                "pledge amount must be a non-negative number".to_string(),
            ));
        }
        let idea = self.idea(idea_id, false).await?;
        let pledge = ResourcePledge {
            id: Uuid::new_v4().to_string(),
            idea_id: idea.id.clone(),
            user_id: actor.id.clone(),
            kind: pledge.kind,
            description: pledge.description,
            amount: pledge.amount,
            created_at: Utc::now(),
        };
        let row = self
            .access
            .try_insert_row(RESOURCE_PLEDGES, encode(&pledge)?)
            .await?;
        self.notify(&idea.author_id, NotificationKind::Pledge, actor, &idea)
            .await?;
        decode(row)
    }

    async fn list_pledges(&self, idea_id: &str) -> Result<Vec<ResourcePledge>> {
        let rows = self
            .access
            .try_fetch_rows(
                RESOURCE_PLEDGES,
                &Filters::new().eq("idea_id", idea_id),
                &FetchOptions::new().order(Order::asc("created_at")),
            )
            .await?;
        decode_all(rows)
    }

    async fn apply_for_role(
        &self,
        actor: &Actor,
        idea_id: &str,
        role: &str,
        message: &str,
    ) -> Result<RoleApplication> {
        require_text(role, "role")?;
        let idea = self.idea(idea_id, false).await?;
        let application = RoleApplication {
            id: Uuid::new_v4().to_string(),
            idea_id: idea.id.clone(),
            user_id: actor.id.clone(),
            role: role.to_string(),
            message: message.to_string(),
            status: ApplicationStatus::Pending,
            created_at: Utc::now(),
        };
        let row = self
            .access
            .try_insert_row(ROLE_APPLICATIONS, encode(&application)?)
            .await?;
        self.notify(&idea.author_id, NotificationKind::Application, actor, &idea)
            .await?;
        decode(row)
    }

    async fn list_applications(&self, idea_id: &str) -> Result<Vec<RoleApplication>> {
        let rows = self
            .access
            .try_fetch_rows(
                ROLE_APPLICATIONS,
                &Filters::new().eq("idea_id", idea_id),
                &FetchOptions::new().order(Order::asc("created_at")),
            )
            .await?;
        decode_all(rows)
    }

    async fn decide_application(
        &self,
        actor: &Actor,
        application_id: &str,
        accept: bool,
    ) -> Result<RoleApplication> {
        let application: RoleApplication = self
            .single(ROLE_APPLICATIONS, application_id, true)
            .await?
            .ok_or_else(|| EngineError::not_found("application", application_id))?;
        let idea = self.idea(&application.idea_id, false).await?;
        if idea.author_id != actor.id {
            return Err(EngineError::Forbidden(
                "only the idea's author can decide applications".to_string(),
            ));
        }
        if application.status != ApplicationStatus::Pending {
            return Err(EngineError::Invalid(format!(
                "application {} was already decided",
                application_id
            )));
        }

        let status = if accept {
            ApplicationStatus::Accepted
        } else {
            ApplicationStatus::Rejected
        };
        self.update(
            ROLE_APPLICATIONS,
            "application",
            application_id,
            json!({ "status": status }),
        )
        .await
    }
}
