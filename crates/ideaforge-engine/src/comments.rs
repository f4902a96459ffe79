//! Comment trees stored as a flat arena.
//!
//! Nodes are keyed by id and reference each other by id: a reply knows its
//! parent, a parent lists its replies in insertion order, and each entity
//! lists its top-level comments. Inserting or voting touches only the target
//! node and, for replies, the parent's child list.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Comment, EngineError, EntityRef, Result};

/// A comment with its replies nested, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommentThread {
    pub comment: Comment,
    pub replies: Vec<CommentThread>,
}

impl Drop for CommentThread {
    // Replies are unlinked one level at a time so that long reply chains do
    // not drop recursively.
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.replies);
        while let Some(mut thread) = stack.pop() {
            stack.append(&mut thread.replies);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Comment>", into = "Vec<Comment>")]
pub struct CommentArena {
    nodes: HashMap<String, Comment>,
    roots: HashMap<EntityRef, Vec<String>>,
}

impl CommentArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an arena from rows in arbitrary order. Siblings are ordered by
    /// creation time.
    pub fn from_rows(mut comments: Vec<Comment>) -> Self {
        comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Self::from(comments)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Comment> {
        self.nodes.get(id)
    }

    /// Top-level comment ids for `entity`, oldest first.
    pub fn roots(&self, entity: &EntityRef) -> &[String] {
        self.roots.get(entity).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn children(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|c| c.children.as_slice())
            .unwrap_or(&[])
    }

    /// Number of ancestors above `id`.
    pub fn depth(&self, id: &str) -> Option<usize> {
        let mut node = self.nodes.get(id)?;
        let mut depth = 0;
        while let Some(parent) = node.parent_comment_id.as_deref() {
            node = self.nodes.get(parent)?;
            depth += 1;
            if depth > self.nodes.len() {
                return None;
            }
        }
        Some(depth)
    }

    /// Insert a top-level comment or a reply, depending on its parent
    /// reference.
    pub fn insert(&mut self, mut comment: Comment) -> Result<()> {
        if self.nodes.contains_key(&comment.id) {
            return Err(EngineError::Invalid(format!(
                "duplicate comment id: {}",
                comment.id
            )));
        }
        comment.children.clear();

        match comment.parent_comment_id.clone() {
            Some(parent_id) => {
                let parent = self
                    .nodes
                    .get_mut(&parent_id)
                    .ok_or_else(|| EngineError::not_found("comment", parent_id.clone()))?;
                parent.children.push(comment.id.clone());
            }
            None => {
                self.roots
                    .entry(comment.entity())
                    .or_default()
                    .push(comment.id.clone());
            }
        }
        self.nodes.insert(comment.id.clone(), comment);
        Ok(())
    }

    /// Add `delta` to a comment's vote count and return the new count.
    pub fn apply_vote_delta(&mut self, id: &str, delta: i64) -> Option<i64> {
        let node = self.nodes.get_mut(id)?;
        node.votes += delta;
        Some(node.votes)
    }

    pub fn set_votes(&mut self, id: &str, votes: i64) -> bool {
        match self.nodes.get_mut(id) {
            Some(node) => {
                node.votes = votes;
                true
            }
            None => false,
        }
    }

    /// Remove a comment and its replies, unlinking it from its parent or
    /// entity. Returns the removed comment.
    pub fn remove(&mut self, id: &str) -> Option<Comment> {
        let removed = self.nodes.remove(id)?;
        self.unlink(&removed);

        let mut stack = removed.children.clone();
        while let Some(child) = stack.pop() {
            if let Some(node) = self.nodes.remove(&child) {
                stack.extend(node.children);
            }
        }
        Some(removed)
    }

    /// Swap the node at `old_id` for `comment`, keeping its position and
    /// replies. Falls back to a plain insert when `old_id` is gone.
    pub fn rekey(&mut self, old_id: &str, mut comment: Comment) -> Result<()> {
        let Some(old) = self.nodes.remove(old_id) else {
            return self.insert(comment);
        };

        let siblings = match old.parent_comment_id.as_deref() {
            Some(parent) => self.nodes.get_mut(parent).map(|p| &mut p.children),
            None => self.roots.get_mut(&old.entity()),
        };
        if let Some(siblings) = siblings {
            for slot in siblings.iter_mut().filter(|s| *s == old_id) {
                *slot = comment.id.clone();
            }
        }
        for child in &old.children {
            if let Some(node) = self.nodes.get_mut(child) {
                node.parent_comment_id = Some(comment.id.clone());
            }
        }

        comment.children = old.children;
        self.nodes.insert(comment.id.clone(), comment);
        Ok(())
    }

    /// Replace everything stored for `entity` with `comments`.
    pub fn replace_entity(&mut self, entity: &EntityRef, comments: Vec<Comment>) {
        self.nodes.retain(|_, c| c.entity_kind != entity.kind || c.entity_id != entity.id);
        self.roots.remove(entity);

        let fresh = Self::from_rows(comments);
        for id in fresh.preorder() {
            if let Some(comment) = fresh.nodes.get(&id) {
                if comment.entity() == *entity {
                    if let Err(e) = self.insert(comment.clone()) {
                        debug!(comment_id = %comment.id, error = %e, "skipping comment row");
                    }
                }
            }
        }
    }

    /// Every comment on `entity`, parents before their replies.
    pub fn entity_comments(&self, entity: &EntityRef) -> Vec<&Comment> {
        let mut out = Vec::new();
        let mut stack: Vec<&str> = self.roots(entity).iter().rev().map(String::as_str).collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(id) {
                out.push(node);
                stack.extend(node.children.iter().rev().map(String::as_str));
            }
        }
        out
    }

    /// The nested view of `entity`'s comments.
    pub fn thread(&self, entity: &EntityRef) -> Vec<CommentThread> {
        self.roots(entity)
            .iter()
            .filter_map(|id| self.subtree(id))
            .collect()
    }

    /// Built with an explicit stack: reply chains can be arbitrarily deep.
    fn subtree(&self, id: &str) -> Option<CommentThread> {
        struct Frame<'a> {
            comment: &'a Comment,
            next: usize,
            replies: Vec<CommentThread>,
        }
        fn frame(comment: &Comment) -> Frame<'_> {
            Frame {
                comment,
                next: 0,
                replies: Vec::with_capacity(comment.children.len()),
            }
        }

        let mut stack = vec![frame(self.nodes.get(id)?)];
        while let Some(top) = stack.last_mut() {
            let comment = top.comment;
            if let Some(child) = comment.children.get(top.next) {
                top.next += 1;
                if let Some(child) = self.nodes.get(child) {
                    stack.push(frame(child));
                }
                continue;
            }

            let done = stack.pop()?;
            let thread = CommentThread {
                comment: done.comment.clone(),
                replies: done.replies,
            };
            match stack.last_mut() {
                Some(parent) => parent.replies.push(thread),
                None => return Some(thread),
            }
        }
        None
    }

    fn ancestry_loops(&self, id: &str) -> bool {
        let mut current = self.nodes.get(id).and_then(|c| c.parent_comment_id.as_deref());
        let mut steps = 0;
        while let Some(parent) = current {
            if steps > self.nodes.len() {
                return true;
            }
            steps += 1;
            current = self.nodes.get(parent).and_then(|c| c.parent_comment_id.as_deref());
        }
        false
    }

    fn unlink(&mut self, comment: &Comment) {
        let siblings = match comment.parent_comment_id.as_deref() {
            Some(parent) => self.nodes.get_mut(parent).map(|p| &mut p.children),
            None => self.roots.get_mut(&comment.entity()),
        };
        if let Some(siblings) = siblings {
            siblings.retain(|s| *s != comment.id);
        }
    }

    /// All ids, parents before replies, entities in a stable order.
    fn preorder(&self) -> Vec<String> {
        let mut entities: Vec<&EntityRef> = self.roots.keys().collect();
        entities.sort();
        entities
            .into_iter()
            .flat_map(|entity| self.entity_comments(entity))
            .map(|c| c.id.clone())
            .collect()
    }
}

impl From<Vec<Comment>> for CommentArena {
    /// Links comments in the given order. Replies whose parent is missing,
    /// or whose ancestry loops, become top-level comments rather than being
    /// dropped.
    fn from(comments: Vec<Comment>) -> Self {
        let ids: HashSet<String> = comments.iter().map(|c| c.id.clone()).collect();
        let mut arena = Self::new();
        let mut order = Vec::with_capacity(comments.len());

        for mut comment in comments {
            if arena.nodes.contains_key(&comment.id) {
                continue;
            }
            if comment
                .parent_comment_id
                .as_ref()
                .is_some_and(|p| !ids.contains(p))
            {
                comment.parent_comment_id = None;
            }
            comment.children.clear();
            order.push(comment.id.clone());
            arena.nodes.insert(comment.id.clone(), comment);
        }

        let cyclic: Vec<String> = order
            .iter()
            .filter(|id| arena.ancestry_loops(id))
            .cloned()
            .collect();
        for id in cyclic {
            if let Some(node) = arena.nodes.get_mut(&id) {
                node.parent_comment_id = None;
            }
        }

        // Parents listed after their replies are fine: every node exists
        // before linking starts.
        for id in order {
            let Some(node) = arena.nodes.get(&id) else {
                continue;
            };
            match node.parent_comment_id.clone() {
                Some(parent) => {
                    if let Some(parent) = arena.nodes.get_mut(&parent) {
                        parent.children.push(id);
                    }
                }
                None => {
                    let entity = node.entity();
                    arena.roots.entry(entity).or_default().push(id);
                }
            }
        }
        arena
    }
}

impl From<CommentArena> for Vec<Comment> {
    fn from(arena: CommentArena) -> Self {
        arena
            .preorder()
            .into_iter()
            .filter_map(|id| arena.nodes.get(&id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Actor;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn comment(id: &str, parent: Option<&str>) -> Comment {
        let actor = Actor::new("u1", "Alice");
        Comment::new(
            id,
            &actor,
            &EntityRef::idea("i1"),
            parent.map(str::to_string),
            format!("text of {}", id),
        )
    }

    fn sample() -> CommentArena {
        let mut arena = CommentArena::new();
        arena.insert(comment("a", None)).unwrap();
        arena.insert(comment("b", None)).unwrap();
        arena.insert(comment("a1", Some("a"))).unwrap();
        arena.insert(comment("a1x", Some("a1"))).unwrap();
        arena.insert(comment("a2", Some("a"))).unwrap();
        arena
    }

    #[test]
    fn replies_append_to_parent_in_order() {
        let arena = sample();
        let entity = EntityRef::idea("i1");
        assert_eq!(arena.roots(&entity), ["a", "b"]);
        assert_eq!(arena.children("a"), ["a1", "a2"]);
        assert_eq!(arena.depth("a1x"), Some(2));

        let ids: Vec<&str> = arena
            .entity_comments(&entity)
            .iter()
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(ids, ["a", "a1", "a1x", "a2", "b"]);
    }

    #[test]
    fn reply_to_missing_parent_is_not_found() {
        let mut arena = sample();
        let err = arena.insert(comment("z", Some("nope"))).unwrap_err();
        assert!(matches!(err, EngineError::NotFound { kind: "comment", .. }));
        assert!(!arena.contains("z"));
    }

    #[test]
    fn thread_nests_replies() {
        let arena = sample();
        let thread = arena.thread(&EntityRef::idea("i1"));
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0].replies.len(), 2);
        assert_eq!(thread[0].replies[0].replies[0].comment.id, "a1x");
        assert!(thread[1].replies.is_empty());
    }

    #[test]
    fn long_reply_chains_build_and_drop() {
        const DEPTH: usize = 100_000;
        let mut arena = CommentArena::new();
        arena.insert(comment("c0", None)).unwrap();
        for n in 1..DEPTH {
            let parent = format!("c{}", n - 1);
            arena.insert(comment(&format!("c{}", n), Some(parent.as_str()))).unwrap();
        }
        assert_eq!(arena.depth(&format!("c{}", DEPTH - 1)), Some(DEPTH - 1));

        let thread = arena.thread(&EntityRef::idea("i1"));
        assert_eq!(thread.len(), 1);
        let mut node = &thread[0];
        let mut depth = 0;
        while let Some(reply) = node.replies.first() {
            assert_eq!(reply.replies.len(), usize::from(depth + 2 < DEPTH));
            node = reply;
            depth += 1;
        }
        assert_eq!(depth, DEPTH - 1);
        assert_eq!(node.comment.id, format!("c{}", DEPTH - 1));
        drop(thread);
    }

    #[test]
    fn remove_unlinks_subtree() {
        let mut arena = sample();
        arena.remove("a1").unwrap();
        assert_eq!(arena.children("a"), ["a2"]);
        assert!(!arena.contains("a1x"));
        assert_eq!(arena.len(), 3);
    }

    #[test]
    fn rekey_keeps_position() {
        let mut arena = sample();
        let mut saved = comment("a1-real", Some("a"));
        saved.votes = 4;
        arena.rekey("a1", saved).unwrap();

        assert_eq!(arena.children("a"), ["a1-real", "a2"]);
        assert_eq!(arena.children("a1-real"), ["a1x"]);
        assert_eq!(
            arena.get("a1x").unwrap().parent_comment_id.as_deref(),
            Some("a1-real")
        );
        assert_eq!(arena.get("a1-real").unwrap().votes, 4);
    }

    #[test]
    fn rows_link_regardless_of_order() {
        let now = Utc::now();
        let mut parent = comment("p", None);
        parent.created_at = now;
        let mut late = comment("r2", Some("p"));
        late.created_at = now + Duration::seconds(2);
        let mut early = comment("r1", Some("p"));
        early.created_at = now + Duration::seconds(1);
        let orphan = comment("o", Some("gone"));

        let arena = CommentArena::from_rows(vec![late, orphan, early, parent]);
        assert_eq!(arena.children("p"), ["r1", "r2"]);
        assert!(arena.roots(&EntityRef::idea("i1")).contains(&"o".to_string()));
    }

    #[test]
    fn serde_round_trip_preserves_shape() {
        let arena = sample();
        let json = serde_json::to_string(&arena).unwrap();
        let back: CommentArena = serde_json::from_str(&json).unwrap();
        let entity = EntityRef::idea("i1");
        assert_eq!(back.thread(&entity), arena.thread(&entity));
    }

    #[test]
    fn looping_ancestry_is_broken() {
        let arena = CommentArena::from(vec![comment("x", Some("y")), comment("y", Some("x"))]);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.depth("x"), Some(0));
        assert_eq!(arena.entity_comments(&EntityRef::idea("i1")).len(), 2);
    }

    proptest! {
        /// Replying anywhere grows only the parent's child list.
        #[test]
        fn reply_touches_only_its_parent(parents in prop::collection::vec(any::<prop::sample::Index>(), 1..40), target in any::<prop::sample::Index>()) {
            let mut arena = CommentArena::new();
            arena.insert(comment("c0", None)).unwrap();
            let mut ids = vec!["c0".to_string()];
            for (n, parent) in parents.iter().enumerate() {
                let id = format!("c{}", n + 1);
                let parent = parent.get(&ids).clone();
                arena.insert(comment(&id, Some(parent.as_str()))).unwrap();
                arena.apply_vote_delta(&id, n as i64 % 3 - 1);
                ids.push(id);
            }

            let before: HashMap<String, (Vec<String>, i64)> = ids
                .iter()
                .map(|id| {
                    let c = arena.get(id).unwrap();
                    (id.clone(), (c.children.clone(), c.votes))
                })
                .collect();

            let parent = target.get(&ids).clone();
            arena.insert(comment("new", Some(parent.as_str()))).unwrap();

            for id in &ids {
                let c = arena.get(id).unwrap();
                let (children, votes) = &before[id];
                prop_assert_eq!(c.votes, *votes);
                if *id == parent {
                    prop_assert_eq!(c.children.len(), children.len() + 1);
                    prop_assert_eq!(&c.children[..children.len()], children.as_slice());
                } else {
                    prop_assert_eq!(&c.children, children);
                }
            }
        }
    }
}
