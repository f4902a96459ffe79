//! The per-(user, entity) vote state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Influence held by an active upvote.
pub const VOTE_INFLUENCE_COST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl FromStr for VoteDirection {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(EngineError::Invalid(format!("unknown vote direction: {}", s))),
        }
    }
}

impl fmt::Display for VoteDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Up => "up",
            Self::Down => "down",
        })
    }
}

/// A user's vote on one entity. Exactly one state at a time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteState {
    #[default]
    None,
    Upvoted,
    Downvoted,
}

impl VoteState {
    /// Contribution of this state to the entity's vote count.
    pub fn score(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Upvoted => 1,
            Self::Downvoted => -1,
        }
    }

    /// Influence locked up while in this state.
    pub fn influence_held(self) -> i64 {
        match self {
            Self::Upvoted => VOTE_INFLUENCE_COST,
            Self::None | Self::Downvoted => 0,
        }
    }

    /// Voting the current direction again toggles back to `None`; voting
    /// the other direction switches.
    pub fn apply(self, direction: VoteDirection) -> VoteTransition {
        let to = match (self, direction) {
            (Self::Upvoted, VoteDirection::Up) | (Self::Downvoted, VoteDirection::Down) => {
                Self::None
            }
            (_, VoteDirection::Up) => Self::Upvoted,
            (_, VoteDirection::Down) => Self::Downvoted,
        };
        VoteTransition::between(self, to)
    }

    /// The stored direction for this state, if any.
    pub fn direction(self) -> Option<VoteDirection> {
        match self {
            Self::None => None,
            Self::Upvoted => Some(VoteDirection::Up),
            Self::Downvoted => Some(VoteDirection::Down),
        }
    }

    pub fn from_direction(direction: Option<VoteDirection>) -> Self {
        match direction {
            None => Self::None,
            Some(VoteDirection::Up) => Self::Upvoted,
            Some(VoteDirection::Down) => Self::Downvoted,
        }
    }
}

/// The effect of one vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoteTransition {
    pub from: VoteState,
    pub to: VoteState,
    /// Change to the entity's vote count.
    pub count_delta: i64,
    /// Change to the voter's influence balance.
    pub influence_delta: i64,
}

impl VoteTransition {
    pub fn between(from: VoteState, to: VoteState) -> Self {
        Self {
            from,
            to,
            count_delta: to.score() - from.score(),
            influence_delta: from.influence_held() - to.influence_held(),
        }
    }

    /// The transition that undoes `self`.
    pub fn inverse(self) -> Self {
        Self::between(self.to, self.from)
    }

    /// Influence this transition needs available up front.
    pub fn influence_needed(self) -> i64 {
        (-self.influence_delta).max(0)
    }

    /// Check that a balance can pay for this transition.
    pub fn check_influence(self, available: i64) -> Result<(), EngineError> {
        let needed = self.influence_needed();
        if needed > available {
            return Err(EngineError::InsufficientInfluence { needed, available });
        }
        Ok(())
    }
}

/// One user's votes across entities. The two sets never share an id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVotes {
    #[serde(default)]
    upvoted: BTreeSet<String>,
    #[serde(default)]
    downvoted: BTreeSet<String>,
}

impl UserVotes {
    pub fn state(&self, entity_id: &str) -> VoteState {
        if self.upvoted.contains(entity_id) {
            VoteState::Upvoted
        } else if self.downvoted.contains(entity_id) {
            VoteState::Downvoted
        } else {
            VoteState::None
        }
    }

    pub fn set(&mut self, entity_id: &str, state: VoteState) {
        self.upvoted.remove(entity_id);
        self.downvoted.remove(entity_id);
        match state {
            VoteState::Upvoted => {
                self.upvoted.insert(entity_id.to_string());
            }
            VoteState::Downvoted => {
                self.downvoted.insert(entity_id.to_string());
            }
            VoteState::None => {}
        }
    }

    /// Apply `direction` to the stored state and return the transition.
    pub fn vote(&mut self, entity_id: &str, direction: VoteDirection) -> VoteTransition {
        let transition = self.state(entity_id).apply(direction);
        self.set(entity_id, transition.to);
        transition
    }

    pub fn upvote_count(&self) -> usize {
        self.upvoted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(VoteState::None, VoteDirection::Up, VoteState::Upvoted, 1 ; "none up")]
    #[test_case(VoteState::None, VoteDirection::Down, VoteState::Downvoted, -1 ; "none down")]
    #[test_case(VoteState::Upvoted, VoteDirection::Up, VoteState::None, -1 ; "upvoted up toggles off")]
    #[test_case(VoteState::Downvoted, VoteDirection::Down, VoteState::None, 1 ; "downvoted down toggles off")]
    #[test_case(VoteState::Upvoted, VoteDirection::Down, VoteState::Downvoted, -2 ; "upvoted down switches")]
    #[test_case(VoteState::Downvoted, VoteDirection::Up, VoteState::Upvoted, 2 ; "downvoted up switches")]
    fn transition_table(from: VoteState, direction: VoteDirection, to: VoteState, delta: i64) {
        let t = from.apply(direction);
        assert_eq!(t.to, to);
        assert_eq!(t.count_delta, delta);
    }

    #[test_case(VoteState::None, VoteDirection::Up, -1 ; "upvote spends")]
    #[test_case(VoteState::Upvoted, VoteDirection::Up, 1 ; "toggle off refunds")]
    #[test_case(VoteState::Upvoted, VoteDirection::Down, 1 ; "switch to down refunds")]
    #[test_case(VoteState::Downvoted, VoteDirection::Up, -1 ; "switch to up spends")]
    #[test_case(VoteState::None, VoteDirection::Down, 0 ; "downvote is free")]
    fn influence_follows_upvote(from: VoteState, direction: VoteDirection, delta: i64) {
        assert_eq!(from.apply(direction).influence_delta, delta);
    }

    #[test]
    fn same_direction_twice_is_a_round_trip() {
        for direction in [VoteDirection::Up, VoteDirection::Down] {
            let first = VoteState::None.apply(direction);
            let second = first.to.apply(direction);
            assert_eq!(second.to, VoteState::None);
            assert_eq!(first.count_delta + second.count_delta, 0);
            assert_eq!(first.influence_delta + second.influence_delta, 0);
        }
    }

    #[test]
    fn inverse_undoes() {
        let t = VoteState::Downvoted.apply(VoteDirection::Up);
        let back = t.inverse();
        assert_eq!(back.to, VoteState::Downvoted);
        assert_eq!(t.count_delta + back.count_delta, 0);
        assert_eq!(t.influence_delta + back.influence_delta, 0);
    }

    #[test]
    fn influence_check() {
        let up = VoteState::None.apply(VoteDirection::Up);
        assert!(up.check_influence(1).is_ok());
        assert!(matches!(
            up.check_influence(0),
            Err(EngineError::InsufficientInfluence {
                needed: 1,
                available: 0
            })
        ));
        // Refunds and downvotes never need a balance.
        assert!(VoteState::Upvoted.apply(VoteDirection::Up).check_influence(0).is_ok());
        assert!(VoteState::None.apply(VoteDirection::Down).check_influence(0).is_ok());
    }

    #[test]
    fn user_votes_keep_sets_exclusive() {
        let mut votes = UserVotes::default();
        votes.vote("i1", VoteDirection::Up);
        assert_eq!(votes.state("i1"), VoteState::Upvoted);
        votes.vote("i1", VoteDirection::Down);
        assert_eq!(votes.state("i1"), VoteState::Downvoted);
        assert_eq!(votes.upvote_count(), 0);
        votes.vote("i1", VoteDirection::Down);
        assert_eq!(votes.state("i1"), VoteState::None);
        assert_eq!(votes, UserVotes::default());
    }
}
