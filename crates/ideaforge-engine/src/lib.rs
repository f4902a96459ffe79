//! Entities, voting rules and optimistic mutations for ideaforge.
//!
//! ## Features
//!
//! - **Entities**: ideas, comments, profiles, notifications, resource
//!   pledges and role applications
//! - **Voting**: toggle rules and the influence cost of holding an upvote
//!   ([`VoteState`], [`VoteTransition`])
//! - **Comment trees**: an id-indexed arena that renders nested threads
//!   ([`CommentArena`])
//! - **Backends**: the same operations over the remote row store
//!   ([`RemoteBackend`]) or a local JSON file ([`LocalBackend`])
//! - **Coordinator**: predict, commit, reconcile or roll back
//!   ([`MutationCoordinator`])

mod backend;
pub mod comments;
mod coordinator;
mod error;
mod local;
pub mod remote;
mod types;
pub mod vote;

pub use backend::Backend;
pub use comments::{CommentArena, CommentThread};
pub use coordinator::{
    CommitResult, IdeaView, MutationCoordinator, MutationFailure, PENDING_PREFIX, PendingComment,
    PendingCommentVote, PendingFork, PendingVote, Rollback,
};
pub use error::{EngineError, Result};
pub use local::LocalBackend;
pub use remote::RemoteBackend;
pub use types::*;
pub use vote::{UserVotes, VOTE_INFLUENCE_COST, VoteDirection, VoteState, VoteTransition};
