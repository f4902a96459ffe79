//! Local-mode backend: every entity in one durable JSON file.
//!
//! The file is a single object with one collection per key (`ideas`,
//! `comments`, `idea_votes`, ...). Each mutation works on a copy of the state,
//! writes the copy to a temp file, renames it over the old file and only then
//! becomes visible, so a failed write leaves both disk and memory unchanged.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::comments::CommentArena;
use crate::vote::UserVotes;
use crate::{
    Actor, ApplicationStatus, Backend, Comment, EngineError, EntityRef, ForkOutcome, Idea,
    NewIdea, NewPledge, Notification, NotificationKind, Profile, ResourcePledge, Result,
    RoleApplication, VoteDirection, VoteOutcome, VoteState,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct LocalState {
    ideas: BTreeMap<String, Idea>,
    comments: CommentArena,
    /// Keyed by user id.
    idea_votes: HashMap<String, UserVotes>,
    comment_votes: HashMap<String, UserVotes>,
    profiles: HashMap<String, Profile>,
    notifications: Vec<Notification>,
    pledges: Vec<ResourcePledge>,
    applications: Vec<RoleApplication>,
    /// Fork idempotency key to the fork's id.
    fork_keys: HashMap<String, String>,
}

impl LocalState {
    fn idea(&self, id: &str) -> Result<&Idea> {
        self.ideas
            .get(id)
            .ok_or_else(|| EngineError::not_found("idea", id))
    }

    fn idea_mut(&mut self, id: &str) -> Result<&mut Idea> {
        self.ideas
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("idea", id))
    }

    fn ensure_profile(&mut self, actor: &Actor) -> &mut Profile {
        self.profiles
            .entry(actor.id.clone())
            .or_insert_with(|| Profile::new(actor))
    }

    /// Queue a notification for `recipient` about `idea_id`. Actors are
    /// never notified about their own activity.
    fn notify(
        &mut self,
        recipient: &str,
        kind: NotificationKind,
        actor: &Actor,
        idea_id: &str,
    ) -> Result<()> {
        if recipient == actor.id {
            return Ok(());
        }
        let notification = Notification::new(recipient, kind, actor, self.idea(idea_id)?);
        self.notifications.push(notification);
        Ok(())
    }

    /// Bump an idea's comment count and tell its author.
    fn comment_added(&mut self, actor: &Actor, entity: &EntityRef) -> Result<()> {
        let Some(idea_id) = entity.idea_id() else {
            return Ok(());
        };
        let idea = self.idea_mut(idea_id)?;
        idea.comment_count += 1;
        let author = idea.author_id.clone();
        self.notify(&author, NotificationKind::Comment, actor, idea_id)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn require_text(text: &str, what: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(EngineError::Invalid(format!("{} cannot be empty", what)));
    }
    Ok(())
}

/// A [`Backend`] that keeps everything in a local JSON file, or only in
/// memory.
#[derive(Debug)]
pub struct LocalBackend {
    path: Option<PathBuf>,
    state: Mutex<LocalState>,
}

impl LocalBackend {
    /// Load the store at `path`. A missing file starts empty and is created
    /// on the first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let state = if fs::try_exists(&path).await? {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            LocalState::default()
        };
        info!(path = %path.display(), ideas = state.ideas.len(), "opened local store");

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LocalState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against a copy of the state, persist the copy, then publish
    /// it. Errors from `f` or from the write leave the state untouched.
    async fn transact<T>(&self, f: impl FnOnce(&mut LocalState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&LocalState) -> T) -> T {
        let state = self.state.lock().await;
        f(&state)
    }

    async fn persist(&self, state: &LocalState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(state)?;

        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(content.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await?;
        debug!(path = %path.display(), bytes = content.len(), "persisted local store");

        Ok(())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn get_idea(&self, id: &str) -> Result<Option<Idea>> {
        Ok(self.read(|s| s.ideas.get(id).cloned()).await)
    }

    async fn list_ideas(&self, limit: Option<usize>) -> Result<Vec<Idea>> {
        let mut ideas: Vec<Idea> = self.read(|s| s.ideas.values().cloned().collect()).await;
        ideas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = limit {
            ideas.truncate(limit);
        }
        Ok(ideas)
    }

    async fn create_idea(&self, actor: &Actor, idea: NewIdea) -> Result<Idea> {
        require_text(&idea.title, "idea title")?;
        self.transact(|s| {
            s.ensure_profile(actor);
            let idea = Idea::new(new_id(), actor, idea);
            s.ideas.insert(idea.id.clone(), idea.clone());
            Ok(idea)
        })
        .await
    }

    async fn record_view(&self, idea_id: &str) -> Result<Idea> {
        self.transact(|s| {
            let idea = s.idea_mut(idea_id)?;
            idea.views += 1;
            Ok(idea.clone())
        })
        .await
    }

    async fn record_share(&self, idea_id: &str) -> Result<Idea> {
        self.transact(|s| {
            let idea = s.idea_mut(idea_id)?;
            idea.shares += 1;
            Ok(idea.clone())
        })
        .await
    }

    async fn vote_state(&self, actor: &Actor, idea_id: &str) -> Result<VoteState> {
        Ok(self
            .read(|s| {
                s.idea_votes
                    .get(&actor.id)
                    .map(|v| v.state(idea_id))
                    .unwrap_or_default()
            })
            .await)
    }

    async fn vote(
        &self,
        actor: &Actor,
        idea_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        self.transact(|s| {
            s.idea(idea_id)?;
            let transition = s
                .idea_votes
                .get(&actor.id)
                .map(|v| v.state(idea_id))
                .unwrap_or_default()
                .apply(direction);

            let profile = s.ensure_profile(actor);
            transition.check_influence(profile.influence)?;
            profile.influence += transition.influence_delta;
            let influence = profile.influence;

            s.idea_votes
                .entry(actor.id.clone())
                .or_default()
                .set(idea_id, transition.to);
            let idea = s.idea_mut(idea_id)?;
            idea.votes += transition.count_delta;

            Ok(VoteOutcome {
                entity_id: idea_id.to_string(),
                state: transition.to,
                votes: idea.votes,
                influence: Some(influence),
            })
        })
        .await
    }

    async fn fork(
        &self,
        actor: &Actor,
        idea_id: &str,
        idempotency_key: &str,
    ) -> Result<ForkOutcome> {
        self.transact(|s| {
            if let Some(fork_id) = s.fork_keys.get(idempotency_key) {
                let fork = s.idea(fork_id)?.clone();
                if fork.parent_idea_id.as_deref() != Some(idea_id) {
                    return Err(EngineError::Invalid(format!(
                        "fork key {} was used for a different idea",
                        idempotency_key
                    )));
                }
                debug!(idea_id, key = idempotency_key, "replaying fork");
                return Ok(ForkOutcome {
                    source_forks: s.idea(idea_id)?.forks,
                    fork,
                    replayed: true,
                });
            }

            let source = s.idea_mut(idea_id)?;
            source.forks += 1;
            let source_forks = source.forks;
            let source_author = source.author_id.clone();
            let fork = source.fork_as(new_id(), actor);

            s.ideas.insert(fork.id.clone(), fork.clone());
            s.fork_keys
                .insert(idempotency_key.to_string(), fork.id.clone());

            let notification = Notification::new(source_author, NotificationKind::Fork, actor, &fork);
            s.notifications.push(notification);

            Ok(ForkOutcome {
                fork,
                source_forks,
                replayed: false,
            })
        })
        .await
    }

    async fn get_comment(&self, id: &str) -> Result<Option<Comment>> {
        Ok(self.read(|s| s.comments.get(id).cloned()).await)
    }

    async fn list_comments(&self, entity: &EntityRef) -> Result<Vec<Comment>> {
        Ok(self
            .read(|s| {
                s.comments
                    .entity_comments(entity)
                    .into_iter()
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn add_comment(&self, actor: &Actor, entity: &EntityRef, text: &str) -> Result<Comment> {
        require_text(text, "comment text")?;
        self.transact(|s| {
            s.comment_added(actor, entity)?;
            let comment = Comment::new(new_id(), actor, entity, None, text);
            s.comments.insert(comment.clone())?;
            Ok(comment)
        })
        .await
    }

    async fn add_reply(
        &self,
        actor: &Actor,
        parent_comment_id: &str,
        text: &str,
    ) -> Result<Comment> {
        require_text(text, "reply text")?;
        self.transact(|s| {
            let parent = s
                .comments
                .get(parent_comment_id)
                .ok_or_else(|| EngineError::not_found("comment", parent_comment_id))?;
            let entity = parent.entity();
            let parent_author = parent.author_id.clone();

            let reply = Comment::new(
                new_id(),
                actor,
                &entity,
                Some(parent_comment_id.to_string()),
                text,
            );
            s.comments.insert(reply.clone())?;

            if let Some(idea_id) = entity.idea_id() {
                s.idea_mut(idea_id)?.comment_count += 1;
                s.notify(&parent_author, NotificationKind::Reply, actor, idea_id)?;
            }
            Ok(reply)
        })
        .await
    }

    async fn vote_comment(
        &self,
        actor: &Actor,
        comment_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome> {
        self.transact(|s| {
            if !s.comments.contains(comment_id) {
                return Err(EngineError::not_found("comment", comment_id));
            }
            let transition = s
                .comment_votes
                .entry(actor.id.clone())
                .or_default()
                .vote(comment_id, direction);
            let votes = s
                .comments
                .apply_vote_delta(comment_id, transition.count_delta)
                .unwrap_or_default();

            Ok(VoteOutcome {
                entity_id: comment_id.to_string(),
                state: transition.to,
                votes,
                influence: None,
            })
        })
        .await
    }

    async fn comment_vote_state(&self, actor: &Actor, comment_id: &str) -> Result<VoteState> {
        Ok(self
            .read(|s| {
                s.comment_votes
                    .get(&actor.id)
                    .map(|v| v.state(comment_id))
                    .unwrap_or_default()
            })
            .await)
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>> {
        Ok(self.read(|s| s.profiles.get(user_id).cloned()).await)
    }

    async fn ensure_profile(&self, actor: &Actor) -> Result<Profile> {
        if let Some(profile) = self.get_profile(&actor.id).await? {
            return Ok(profile);
        }
        self.transact(|s| Ok(s.ensure_profile(actor).clone()))
            .await
    }

    async fn notifications(&self, user_id: &str) -> Result<Vec<Notification>> {
        let mut out: Vec<Notification> = self
            .read(|s| {
                s.notifications
                    .iter()
                    .rev()
                    .filter(|n| n.recipient_id == user_id)
                    .cloned()
                    .collect()
            })
            .await;
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn mark_notification_read(
        &self,
        actor: &Actor,
        notification_id: &str,
    ) -> Result<Notification> {
        self.transact(|s| {
            let notification = s
                .notifications
                .iter_mut()
                .find(|n| n.id == notification_id)
                .ok_or_else(|| EngineError::not_found("notification", notification_id))?;
            if notification.recipient_id != actor.id {
                return Err(EngineError::Forbidden(
                    "notification belongs to another user".to_string(),
                ));
            }
            notification.read = true;
            Ok(notification.clone())
        })
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
        self.transact(|s| {
            let author = s.idea(idea_id)?.author_id.clone();
            let pledge = ResourcePledge {
                id: new_id(),
                idea_id: idea_id.to_string(),
                user_id: actor.id.clone(),
                kind: pledge.kind,
                description: pledge.description,
                amount: pledge.amount,
                created_at: Utc::now(),
            };
            s.pledges.push(pledge.clone());
            s.notify(&author, NotificationKind::Pledge, actor, idea_id)?;
            Ok(pledge)
        })
        .await
    }

    async fn list_pledges(&self, idea_id: &str) -> Result<Vec<ResourcePledge>> {
        Ok(self
            .read(|s| {
                s.pledges
                    .iter()
                    .filter(|p| p.idea_id == idea_id)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn apply_for_role(
        &self,
        actor: &Actor,
        idea_id: &str,
        role: &str,
        message: &str,
    ) -> Result<RoleApplication> {
        require_text(role, "role")?;
        self.transact(|s| {
            let author = s.idea(idea_id)?.author_id.clone();
            let application = RoleApplication {
                id: new_id(),
                idea_id: idea_id.to_string(),
                user_id: actor.id.clone(),
                role: role.to_string(),
                message: message.to_string(),
                status: ApplicationStatus::Pending,
                created_at: Utc::now(),
            };
            s.applications.push(application.clone());
            s.notify(&author, NotificationKind::Application, actor, idea_id)?;
            Ok(application)
        })
        .await
    }

    async fn list_applications(&self, idea_id: &str) -> Result<Vec<RoleApplication>> {
        Ok(self
            .read(|s| {
                s.applications
                    .iter()
                    .filter(|a| a.idea_id == idea_id)
                    .cloned()
                    .collect()
            })
            .await)
    }

    async fn decide_application(
        &self,
        actor: &Actor,
        application_id: &str,
        accept: bool,
    ) -> Result<RoleApplication> {
        self.transact(|s| {
            let idea_id = s
                .applications
                .iter()
                .find(|a| a.id == application_id)
                .map(|a| a.idea_id.clone())
                .ok_or_else(|| EngineError::not_found("application", application_id))?;
            if s.idea(&idea_id)?.author_id != actor.id {
                return Err(EngineError::Forbidden(
                    "only the idea's author can decide applications".to_string(),
                ));
            }

            let application = s
                .applications
                .iter_mut()
                .find(|a| a.id == application_id)
                .ok_or_else(|| EngineError::not_found("application", application_id))?;
            if application.status != ApplicationStatus::Pending {
                return Err(EngineError::Invalid(format!(
                    "application {} was already decided",
                    application_id
                )));
            }
            application.status = if accept {
                ApplicationStatus::Accepted
            } else {
                ApplicationStatus::Rejected
            };
            Ok(application.clone())
        })
        .await
    }
}
