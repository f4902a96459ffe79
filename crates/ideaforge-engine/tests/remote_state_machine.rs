//! Stateful property testing for the remote backend under injected write
//! failures.
//!
//! Two users vote and fork over a shared in-memory row store. Any step may
//! have its next write to a chosen table fail; the harness retries the operation
//! (reusing the fork key) the way a client would, and every counter must
//! still match a reference model in which each operation happened once.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use serde_json::Value;
use tokio::runtime::Runtime;

use ideaforge_engine::remote::tables::{IDEA_VOTES, IDEAS, NOTIFICATIONS, PROFILES};
use ideaforge_engine::{
    Actor, Backend, DEFAULT_INFLUENCE, EngineError, MutationCoordinator, NewIdea, RemoteBackend,
    VoteDirection, VoteState,
};
use ideaforge_store::{DataAccess, MemoryRowStore, StoreError};

const USERS: usize = 2;
const IDEAS_N: usize = 2;
const KEYS: [&str; 3] = ["key-a", "key-b", "key-c"];
const FAILING_TABLES: [&str; 4] = [IDEAS, PROFILES, IDEA_VOTES, NOTIFICATIONS];
const ATTEMPTS: usize = 4;

#[derive(Debug, Clone)]
pub enum Operation {
    Vote {
        user: usize,
        idea: usize,
        direction: VoteDirection,
        fail: Option<usize>,
    },
    Fork {
        user: usize,
        idea: usize,
        key: usize,
        fail: Option<usize>,
    },
}

#[derive(Clone, Debug)]
pub struct Model {
    votes: [i64; IDEAS_N],
    forks: [u64; IDEAS_N],
    states: [[VoteState; IDEAS_N]; USERS],
    influence: [i64; USERS],
    /// Which idea each fork key was first used on.
    keys: HashMap<usize, usize>,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            votes: [0; IDEAS_N],
            forks: [0; IDEAS_N],
            states: [[VoteState::None; IDEAS_N]; USERS],
            influence: [DEFAULT_INFLUENCE; USERS],
            keys: HashMap::new(),
        }
    }
}

impl ReferenceStateMachine for Model {
    type State = Self;
    type Transition = Operation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let direction = prop_oneof![Just(VoteDirection::Up), Just(VoteDirection::Down)];
        let fail = || prop::option::weighted(0.4, 0..FAILING_TABLES.len());
        prop_oneof![
            4 => (0..USERS, 0..IDEAS_N, direction, fail()).prop_map(
                |(user, idea, direction, fail)| Operation::Vote { user, idea, direction, fail }
            ),
            1 => (0..USERS, 0..IDEAS_N, 0..KEYS.len(), fail()).prop_map(
                |(user, idea, key, fail)| Operation::Fork { user, idea, key, fail }
            ),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        match *transition {
            Operation::Vote {
                user,
                idea,
                direction,
                ..
            } => {
                let t = state.states[user][idea].apply(direction);
                if t.check_influence(state.influence[user]).is_ok() {
                    state.states[user][idea] = t.to;
                    state.votes[idea] += t.count_delta;
                    state.influence[user] += t.influence_delta;
                }
            }
            Operation::Fork { idea, key, .. } => {
                if !state.keys.contains_key(&key) {
                    state.keys.insert(key, idea);
                    state.forks[idea] += 1;
                }
            }
        }
        state
    }

    fn preconditions(_state: &Self::State, _transition: &Self::Transition) -> bool {
        true
    }
}

fn server_error() -> StoreError {
    StoreError::Remote {
        status: 500,
        code: None,
        message: "injected".into(),
        details: None,
        hint: None,
    }
}

fn stored_row(store: &MemoryRowStore, table: &str, id: &str) -> Option<Value> {
    store
        .rows(table)
        .into_iter()
        .find(|row| row["id"].as_str() == Some(id))
}

pub struct Harness {
    runtime: Runtime,
    store: Arc<MemoryRowStore>,
    backend: Arc<RemoteBackend>,
    users: Vec<MutationCoordinator>,
    ideas: Vec<String>,
}

impl Harness {
    fn new() -> Self {
        let runtime = Runtime::new().expect("Failed to create tokio runtime");
        let store = Arc::new(MemoryRowStore::new());
        let access = Arc::new(DataAccess::new(store.clone()));
        let backend = Arc::new(RemoteBackend::new(access));

        let ideas = runtime.block_on(async {
            let author = Actor::new("author", "Author");
            let mut ideas = Vec::new();
            for i in 0..IDEAS_N {
                let idea = backend
                    .create_idea(
                        &author,
                        NewIdea {
                            title: format!("Idea {}", i),
                            body: String::new(),
                        },
                    )
                    .await
                    .expect("create idea");
                ideas.push(idea.id);
            }
            ideas
        });

        let users = (0..USERS)
            .map(|i| {
                let backend: Arc<dyn Backend> = backend.clone();
                MutationCoordinator::new(backend, Actor::new(format!("u{}", i), format!("User {}", i)))
            })
            .collect();

        Self {
            runtime,
            store,
            backend,
            users,
            ideas,
        }
    }

    async fn vote(&self, user: usize, idea: usize, direction: VoteDirection) {
        let coordinator = &self.users[user];
        for _ in 0..ATTEMPTS {
            match coordinator.vote(&self.ideas[idea], direction).await {
                Ok(_) | Err(EngineError::InsufficientInfluence { .. }) => return,
                Err(EngineError::Store(_)) => continue,
                Err(e) => panic!("unexpected vote error: {:?}", e),
            }
        }
        panic!("vote did not go through after {} attempts", ATTEMPTS);
    }

    async fn fork(&self, user: usize, idea: usize, key: usize) {
        let coordinator = &self.users[user];
        let idea_id = &self.ideas[idea];
        for _ in 0..ATTEMPTS {
            if coordinator.idea_view(idea_id).is_none()
                && coordinator.load_idea(idea_id).await.is_err()
            {
                continue;
            }
            let pending = coordinator
                .begin_fork_with_key(idea_id, KEYS[key])
                .expect("begin fork");
            match pending.commit().await {
                Ok(_) => return,
                Err(failure) => {
                    let error = failure.error;
                    coordinator.rollback(failure.rollback).await.expect("rollback");
                    match error {
                        // Key already used on the other idea.
                        EngineError::Invalid(_) => return,
                        EngineError::Store(_) => continue,
                        e => panic!("unexpected fork error: {:?}", e),
                    }
                }
            }
        }
        panic!("fork did not go through after {} attempts", ATTEMPTS);
    }

    fn apply_operation(&self, op: &Operation) {
        let fail = match *op {
            Operation::Vote { fail, .. } | Operation::Fork { fail, .. } => fail,
        };
        if let Some(table) = fail {
            self.store.fail_write_on(FAILING_TABLES[table], server_error());
        }

        self.runtime.block_on(async {
            match *op {
                Operation::Vote {
                    user,
                    idea,
                    direction,
                    ..
                } => self.vote(user, idea, direction).await,
                Operation::Fork { user, idea, key, .. } => self.fork(user, idea, key).await,
            }
        });
        // A failure aimed at a table the operation never wrote stays queued.
        self.store.clear_failures();
    }
}

impl StateMachineTest for Harness {
    type SystemUnderTest = Self;
    type Reference = Model;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        state: Self::SystemUnderTest,
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_operation(&transition);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        for (i, id) in state.ideas.iter().enumerate() {
            let row = stored_row(&state.store, IDEAS, id).expect("idea row");
            assert_eq!(row["votes"].as_i64(), Some(ref_state.votes[i]), "votes of idea {}", i);
            assert_eq!(row["forks"].as_u64(), Some(ref_state.forks[i]), "forks of idea {}", i);
        }

        let fork_ideas = state
            .store
            .rows(IDEAS)
            .iter()
            .filter(|row| !row["parent_idea_id"].is_null())
            .count();
        assert_eq!(fork_ideas, ref_state.keys.len(), "one fork idea per key");

        state.runtime.block_on(async {
            for (u, coordinator) in state.users.iter().enumerate() {
                let actor = coordinator.actor();
                let influence = stored_row(&state.store, PROFILES, &actor.id)
                    .and_then(|row| row["influence"].as_i64())
                    .unwrap_or(DEFAULT_INFLUENCE);
                assert_eq!(influence, ref_state.influence[u], "influence of user {}", u);
                if let Some(predicted) = coordinator.influence() {
                    assert_eq!(predicted, influence, "view influence of user {}", u);
                }

                for (i, id) in state.ideas.iter().enumerate() {
                    let stored = state.backend.vote_state(actor, id).await.unwrap();
                    assert_eq!(stored, ref_state.states[u][i]);
                    if let Some(view) = coordinator.idea_view(id) {
                        assert_eq!(view.vote_state, stored);
                    }
                }
                assert_eq!(coordinator.pending_count(), 0);
            }
        });
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 5000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn remote_state_machine_test(sequential 1..30 => Harness);
}
