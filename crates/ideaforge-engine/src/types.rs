//! Core entity types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::EngineError;
use crate::vote::VoteState;

/// Influence every new profile starts with.
pub const DEFAULT_INFLUENCE: i64 = 100;

/// The signed-in user performing an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub name: String,
}

impl Actor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// An idea, the primary content entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Idea {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub author_id: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub votes: i64,
    #[serde(default)]
    pub forks: u64,
    #[serde(default)]
    pub comment_count: u64,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub shares: u64,
    /// Set when this idea was forked from another.
    #[serde(default)]
    pub parent_idea_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Idea {
    /// A fresh idea authored by `actor`, with every counter at zero.
    pub fn new(id: impl Into<String>, actor: &Actor, new: NewIdea) -> Self {
        Self {
            id: id.into(),
            title: new.title,
            body: new.body,
            author_id: actor.id.clone(),
            author_name: actor.name.clone(),
            votes: 0,
            forks: 0,
            comment_count: 0,
            views: 0,
            shares: 0,
            parent_idea_id: None,
            created_at: Utc::now(),
        }
    }

    /// The derivative created when `actor` forks `self`.
    ///
    /// Content is copied verbatim, counters start at zero and the parent
    /// reference points back at `self`.
    pub fn fork_as(&self, id: impl Into<String>, actor: &Actor) -> Self {
        let mut fork = Self::new(
            id,
            actor,
            NewIdea {
                title: self.title.clone(),
                body: self.body.clone(),
            },
        );
        fork.parent_idea_id = Some(self.id.clone());
        fork
    }
}

/// Content for a new idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewIdea {
    pub title: String,
    pub body: String,
}

/// The kind of entity a comment thread hangs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Idea,
    Discussion,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idea => "idea",
            Self::Discussion => "discussion",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A commentable entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn idea(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Idea,
            id: id.into(),
        }
    }

    pub fn discussion(id: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Discussion,
            id: id.into(),
        }
    }

    /// The idea id, when this entity is an idea.
    pub fn idea_id(&self) -> Option<&str> {
        match self.kind {
            EntityKind::Idea => Some(&self.id),
            EntityKind::Discussion => None,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = EngineError;

    /// Parses `idea:<id>` or `discussion:<id>`. A bare id is an idea.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("idea", id)) if !id.is_empty() => Ok(Self::idea(id)),
            Some(("discussion", id)) if !id.is_empty() => Ok(Self::discussion(id)),
            None if !s.is_empty() => Ok(Self::idea(s)),
            _ => Err(EngineError::Invalid(format!("bad entity reference: {}", s))),
        }
    }
}

/// A comment on an idea or discussion, possibly a reply to another comment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub entity_kind: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub parent_comment_id: Option<String>,
    pub author_id: String,
    #[serde(default)]
    pub author_name: String,
    pub text: String,
    #[serde(default)]
    pub votes: i64,
    /// Reply ids in insertion order. Derived from parent references, never
    /// stored.
    #[serde(default, skip_serializing)]
    pub children: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(
        id: impl Into<String>,
        actor: &Actor,
        entity: &EntityRef,
        parent_comment_id: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_kind: entity.kind,
            entity_id: entity.id.clone(),
            parent_comment_id,
            author_id: actor.id.clone(),
            author_name: actor.name.clone(),
            text: text.into(),
            votes: 0,
            children: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn entity(&self) -> EntityRef {
        EntityRef {
            kind: self.entity_kind,
            id: self.entity_id.clone(),
        }
    }
}

/// A user's profile and influence balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_influence")]
    pub influence: i64,
}

fn default_influence() -> i64 {
    DEFAULT_INFLUENCE
}

impl Profile {
    pub fn new(actor: &Actor) -> Self {
        Self {
            id: actor.id.clone(),
            name: actor.name.clone(),
            influence: DEFAULT_INFLUENCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Fork,
    Comment,
    Reply,
    Pledge,
    Application,
}

/// An event addressed to one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub actor_name: String,
    pub idea_id: String,
    #[serde(default)]
    pub idea_title: String,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        recipient_id: impl Into<String>,
        kind: NotificationKind,
        actor: &Actor,
        idea: &Idea,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            recipient_id: recipient_id.into(),
            kind,
            actor_name: actor.name.clone(),
            idea_id: idea.id.clone(),
            idea_title: idea.title.clone(),
            read: false,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Money,
    Time,
    Skill,
    Other,
}

impl FromStr for ResourceKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "money" => Ok(Self::Money),
            "time" => Ok(Self::Time),
            "skill" => Ok(Self::Skill),
            "other" => Ok(Self::Other),
            _ => Err(EngineError::Invalid(format!("unknown resource kind: {}", s))),
        }
    }
}

/// What a user offers when pledging to an idea.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPledge {
    pub kind: ResourceKind,
    pub description: String,
    pub amount: Option<f64>,
}

/// A resource pledged to an idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePledge {
    pub id: String,
    pub idea_id: String,
    pub user_id: String,
    pub kind: ResourceKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub amount: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Accepted,
    Rejected,
}

/// A user's application for a role on an idea.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleApplication {
    pub id: String,
    pub idea_id: String,
    pub user_id: String,
    pub role: String,
    #[serde(default)]
    pub message: String,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
}

/// Authoritative result of a vote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteOutcome {
    pub entity_id: String,
    pub state: VoteState,
    pub votes: i64,
    /// The voter's balance after the vote. Comment votes leave it untouched
    /// and report `None`.
    pub influence: Option<i64>,
}

/// Authoritative result of a fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkOutcome {
    pub fork: Idea,
    /// The source idea's fork counter after the fork.
    pub source_forks: u64,
    /// True when the idempotency key had already been used and nothing
    /// changed.
    pub replayed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn fork_copies_content_and_zeroes_counters() {
        let alice = Actor::new("u1", "Alice");
        let bob = Actor::new("u2", "Bob");
        let mut source = Idea::new(
            "i2",
            &alice,
            NewIdea {
                title: "Tool library".into(),
                body: "Lend tools".into(),
            },
        );
        source.votes = 7;
        source.forks = 3;
        source.views = 40;

        let fork = source.fork_as("i3", &bob);
        assert_eq!(fork.title, source.title);
        assert_eq!(fork.body, source.body);
        assert_eq!(fork.author_id, "u2");
        assert_eq!(fork.parent_idea_id.as_deref(), Some("i2"));
        assert_eq!((fork.votes, fork.forks, fork.comment_count), (0, 0, 0));
    }

    #[test]
    fn entity_ref_parsing() {
        assert_eq!("idea:i1".parse::<EntityRef>().unwrap(), EntityRef::idea("i1"));
        assert_eq!(
            "discussion:d4".parse::<EntityRef>().unwrap(),
            EntityRef::discussion("d4")
        );
        assert_eq!("i7".parse::<EntityRef>().unwrap(), EntityRef::idea("i7"));
        assert!("thread:x".parse::<EntityRef>().is_err());
        assert!("idea:".parse::<EntityRef>().is_err());
    }

    #[test]
    fn sparse_rows_decode_with_defaults() {
        let idea: Idea = serde_json::from_value(json!({
            "id": "i1",
            "title": "t",
            "author_id": "u1",
            "created_at": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(idea.votes, 0);
        assert!(idea.parent_idea_id.is_none());

        let profile: Profile = serde_json::from_value(json!({"id": "u1"})).unwrap();
        assert_eq!(profile.influence, DEFAULT_INFLUENCE);
    }

    #[test]
    fn comment_children_are_not_serialized() {
        let actor = Actor::new("u1", "Alice");
        let mut comment = Comment::new("c1", &actor, &EntityRef::idea("i1"), None, "hi");
        comment.children.push("c2".into());

        let row = serde_json::to_value(&comment).unwrap();
        assert!(row.get("children").is_none());
        assert_eq!(row["entity_kind"], "idea");
    }
}
