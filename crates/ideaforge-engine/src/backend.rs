//! The durable side of every entity operation.

use async_trait::async_trait;

use crate::{
    Actor, Comment, EntityRef, ForkOutcome, Idea, NewIdea, NewPledge, Notification, Profile,
    ResourcePledge, Result, RoleApplication, VoteDirection, VoteOutcome, VoteState,
};

/// Entity operations, implemented once over the remote row store and once
/// over a local file.
///
/// The mutation coordinator talks only to this trait, so the two
/// implementations are interchangeable and chosen when the coordinator is
/// built.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_idea(&self, id: &str) -> Result<Option<Idea>>;

    /// Newest first.
    async fn list_ideas(&self, limit: Option<usize>) -> Result<Vec<Idea>>;

    async fn create_idea(&self, actor: &Actor, idea: NewIdea) -> Result<Idea>;

    async fn record_view(&self, idea_id: &str) -> Result<Idea>;

    async fn record_share(&self, idea_id: &str) -> Result<Idea>;

    async fn vote_state(&self, actor: &Actor, idea_id: &str) -> Result<VoteState>;

    /// Toggle-vote an idea. Upvotes spend influence, leaving an upvote
    /// refunds it.
    async fn vote(
        &self,
        actor: &Actor,
        idea_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome>;

    /// Fork an idea. A repeated `idempotency_key` returns the fork created
    /// the first time without counting or notifying again.
    async fn fork(&self, actor: &Actor, idea_id: &str, idempotency_key: &str)
    -> Result<ForkOutcome>;

    async fn get_comment(&self, id: &str) -> Result<Option<Comment>>;

    /// Comments on `entity`, in any order.
    async fn list_comments(&self, entity: &EntityRef) -> Result<Vec<Comment>>;

    async fn add_comment(&self, actor: &Actor, entity: &EntityRef, text: &str) -> Result<Comment>;

    async fn add_reply(&self, actor: &Actor, parent_comment_id: &str, text: &str)
    -> Result<Comment>;

    /// Toggle-vote a comment. Comment votes do not touch influence.
    async fn vote_comment(
        &self,
        actor: &Actor,
        comment_id: &str,
        direction: VoteDirection,
    ) -> Result<VoteOutcome>;

    async fn comment_vote_state(&self, actor: &Actor, comment_id: &str) -> Result<VoteState>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>>;

    /// The actor's profile, created with the starting balance if missing.
    async fn ensure_profile(&self, actor: &Actor) -> Result<Profile>;

    /// Newest first.
    async fn notifications(&self, user_id: &str) -> Result<Vec<Notification>>;

    /// Only the recipient may mark a notification read.
    async fn mark_notification_read(
        &self,
        actor: &Actor,
        notification_id: &str,
    ) -> Result<Notification>;

    async fn pledge_resource(
        &self,
        actor: &Actor,
        idea_id: &str,
        pledge: NewPledge,
    ) -> Result<ResourcePledge>;

    async fn list_pledges(&self, idea_id: &str) -> Result<Vec<ResourcePledge>>;

    async fn apply_for_role(
        &self,
        actor: &Actor,
        idea_id: &str,
        role: &str,
        message: &str,
    ) -> Result<RoleApplication>;

    async fn list_applications(&self, idea_id: &str) -> Result<Vec<RoleApplication>>;

    /// Accept or reject a pending application. Only the idea's author may
    /// decide.
    async fn decide_application(
        &self,
        actor: &Actor,
        application_id: &str,
        accept: bool,
    ) -> Result<RoleApplication>;
}
