//! Hierarchical conversation scopes and their visibility projections.
//!
//! A scope is created whenever an orchestrator or capability starts working
//! and owns its own [`ConversationLog`]. Children point at their parent through
//! a `Weak` handle, so dropping an owner drops its scope without cycles.
//! Projections are computed on demand by walking the parent chain.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::log::ConversationLog;
use super::turn::{Turn, TurnKind, conversational_kinds};
use crate::budget::BudgetState;

/// Which part of the scope tree a prompt is built from.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Every ancestor's own log, root to leaf.
    #[default]
    Session,
    /// Session traversal filtered to the current entry name.
    Entry,
    /// This scope's own log only.
    Scope,
    /// Turns across the ancestor chain produced by this scope's owner.
    Owner,
}

/// A node in the conversation tree.
#[derive(Debug)]
pub struct ConversationScope {
    path: Vec<String>,
    owner: String,
    entry_name: Option<String>,
    parent: Option<Weak<ConversationScope>>,
    log: Mutex<ConversationLog>,
    budget: Mutex<BudgetState>,
    exposed_kinds: HashSet<TurnKind>,
    accepted_kinds: HashSet<TurnKind>,
}

/// Builder for [`ConversationScope`].
#[derive(Debug, Clone)]
pub struct ScopeBuilder {
    owner: String,
    entry_name: Option<String>,
    parent: Option<Arc<ConversationScope>>,
    exposed_kinds: HashSet<TurnKind>,
    accepted_kinds: HashSet<TurnKind>,
}

impl ScopeBuilder {
    pub fn entry_name(mut self, name: impl Into<String>) -> Self {
        self.entry_name = Some(name.into());
        self
    }

    pub fn parent(mut self, parent: &Arc<ConversationScope>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    /// Kinds this scope hands up to its parent on consolidation.
    pub fn exposed_kinds(mut self, kinds: impl IntoIterator<Item = TurnKind>) -> Self {
        self.exposed_kinds = kinds.into_iter().collect();
        self
    }

    /// Kinds this scope takes from children on consolidation.
    pub fn accepted_kinds(mut self, kinds: impl IntoIterator<Item = TurnKind>) -> Self {
        self.accepted_kinds = kinds.into_iter().collect();
        self
    }

    pub fn build(self) -> Arc<ConversationScope> {
        let (path, entry_name, parent) = match &self.parent {
            Some(parent) => {
                let mut path = parent.path.clone();
                path.push(self.owner.clone());
                let entry = self.entry_name.or_else(|| parent.entry_name.clone());
                (path, entry, Some(Arc::downgrade(parent)))
            }
            None => (vec![self.owner.clone()], self.entry_name, None),
        };
        Arc::new(ConversationScope {
            path,
            owner: self.owner,
            entry_name,
            parent,
            log: Mutex::new(ConversationLog::new()),
            budget: Mutex::new(BudgetState::default()),
            exposed_kinds: self.exposed_kinds,
            accepted_kinds: self.accepted_kinds,
        })
    }
}

impl ConversationScope {
    pub fn builder(owner: impl Into<String>) -> ScopeBuilder {
        ScopeBuilder {
            owner: owner.into(),
            entry_name: None,
            parent: None,
            exposed_kinds: conversational_kinds(),
            accepted_kinds: conversational_kinds(),
        }
    }

    /// A parentless scope with default kind filters.
    pub fn root(owner: impl Into<String>) -> Arc<Self> {
        Self::builder(owner).build()
    }

    /// A child scope bound to `self`; inherits the entry name.
    pub fn child(self: &Arc<Self>, owner: impl Into<String>) -> Arc<Self> {
        Self::builder(owner).parent(self).build()
    }

    /// Restore a detached scope from persisted parts.
    pub(crate) fn restore(
        path: Vec<String>,
        owner: String,
        entry_name: Option<String>,
        turns: Vec<Turn>,
        budget: BudgetState,
    ) -> Arc<Self> {
        let mut log = ConversationLog::new();
        log.extend(turns);
        Arc::new(Self {
            path,
            owner,
            entry_name,
            parent: None,
            log: Mutex::new(log),
            budget: Mutex::new(budget),
            exposed_kinds: conversational_kinds(),
            accepted_kinds: conversational_kinds(),
        })
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn entry_name(&self) -> Option<&str> {
        self.entry_name.as_deref()
    }

    pub fn parent(&self) -> Option<Arc<ConversationScope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    fn log(&self) -> MutexGuard<'_, ConversationLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock this scope's budget state.
    pub fn budget(&self) -> MutexGuard<'_, BudgetState> {
        self.budget.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live ancestors, root first, excluding `self`.
    fn ancestors(&self) -> Vec<Arc<ConversationScope>> {
        let mut chain = Vec::new();
        let mut cursor = self.parent();
        while let Some(scope) = cursor {
            cursor = scope.parent();
            chain.push(scope);
        }
        chain.reverse();
        chain
    }

    // ── Mutation ───────────────────────────────────────────────────

    fn stamp(&self, mut turn: Turn) -> Turn {
        if let Some(entry) = &self.entry_name {
            turn.entry_name = Some(entry.clone());
        }
        if turn.owner.is_none() {
            turn.owner = Some(self.owner.clone());
        }
        if turn.path.is_empty() {
            turn.path = self.path.clone();
        }
        turn
    }

    /// Stamp turns with this scope's metadata and append them.
    ///
    /// The entry name is always overwritten when the scope has one; owner and
    /// path are only filled in when absent. Returns the stamped turns.
    pub fn add_turns(&self, turns: Vec<Turn>) -> Vec<Turn> {
        let stamped: Vec<Turn> = turns.into_iter().map(|t| self.stamp(t)).collect();
        self.log().extend(stamped.iter().cloned());
        stamped
    }

    pub fn add_turn(&self, turn: Turn) -> Turn {
        let stamped = self.stamp(turn);
        self.log().push(stamped.clone());
        stamped
    }

    /// Pull a child's turns into this scope.
    ///
    /// Only kinds both exposed by the child and accepted here are copied.
    /// Sequence numbers and the child's path are preserved.
    pub fn consolidate(&self, child: &ConversationScope) {
        let retained: HashSet<TurnKind> = child
            .exposed_kinds
            .intersection(&self.accepted_kinds)
            .copied()
            .collect();
        let turns: Vec<Turn> = child
            .log()
            .turns()
            .iter()
            .filter(|t| retained.contains(&t.kind))
            .cloned()
            .collect();
        debug!(
            from = %child.path.join("/"),
            into = %self.path.join("/"),
            count = turns.len(),
            "Consolidating child scope"
        );
        self.add_turns(turns);
    }

    /// Apply `f` to every turn (in this scope or an ancestor) whose seq is in `seqs`.
    pub fn mark(&self, seqs: &HashSet<u64>, mut f: impl FnMut(&mut Turn)) -> usize {
        if seqs.is_empty() {
            return 0;
        }
        let mut touched = self.log().update_where(|t| seqs.contains(&t.seq()), &mut f);
        for scope in self.ancestors() {
            touched += scope.log().update_where(|t| seqs.contains(&t.seq()), &mut f);
        }
        touched
    }

    pub fn clear(&self) {
        self.log().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.log().is_empty()
    }

    /// Copy of this scope's own turns.
    pub fn own_turns(&self) -> Vec<Turn> {
        self.log().turns().to_vec()
    }

    // ── Projections ────────────────────────────────────────────────

    /// True when `turn` was produced in a descendant of this scope.
    fn is_from_child(&self, turn: &Turn) -> bool {
        turn.path.len() > self.path.len() && turn.path.starts_with(&self.path)
    }

    fn drop_children(&self, turns: Vec<Turn>, include_children: bool) -> Vec<Turn> {
        if include_children {
            turns
        } else {
            turns.into_iter().filter(|t| !self.is_from_child(t)).collect()
        }
    }

    /// Concatenated own logs, root to leaf, each filtered by `pred`.
    fn collect_chain(&self, pred: impl Fn(&Turn) -> bool) -> Vec<Turn> {
        let mut out = Vec::new();
        for scope in self.ancestors() {
            out.extend(scope.log().turns().iter().filter(|t| pred(t)).cloned());
        }
        out.extend(self.log().turns().iter().filter(|t| pred(t)).cloned());
        out
    }

    pub fn session(&self, include_children: bool) -> Vec<Turn> {
        self.drop_children(self.collect_chain(|_| true), include_children)
    }

    pub fn entry(&self, include_children: bool) -> Vec<Turn> {
        let Some(entry) = self.entry_name.as_deref() else {
            return Vec::new();
        };
        let turns = self.collect_chain(|t| t.entry_name.as_deref() == Some(entry));
        self.drop_children(turns, include_children)
    }

    pub fn scope(&self, include_children: bool) -> Vec<Turn> {
        self.drop_children(self.own_turns(), include_children)
    }

    pub fn owned(&self) -> Vec<Turn> {
        let owner = self.owner.as_str();
        self.collect_chain(|t| t.owner.as_deref() == Some(owner))
    }

    pub fn project(&self, visibility: Visibility, include_children: bool) -> Vec<Turn> {
        match visibility {
            Visibility::Session => self.session(include_children),
            Visibility::Entry => self.entry(include_children),
            Visibility::Scope => self.scope(include_children),
            Visibility::Owner => self.owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::turn::Turn;

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns.iter().map(Turn::text).collect()
    }

    #[test]
    fn child_path_extends_parent() {
        let root = ConversationScope::root("session");
        let child = root.child("bash");
        assert_eq!(child.path(), ["session".to_string(), "bash".to_string()]);
        assert!(child.parent().is_some());
    }

    #[test]
    fn session_concatenates_root_to_leaf() {
        let root = ConversationScope::root("root");
        let mid = root.child("mid");
        let leaf = mid.child("leaf");
        leaf.add_turn(Turn::human("leaf-1"));
        root.add_turn(Turn::human("root-1"));
        mid.add_turn(Turn::ai("mid-1"));

        let session = leaf.session(true);
        assert_eq!(texts(&session), vec!["root-1", "mid-1", "leaf-1"]);
    }

    #[test]
    fn own_log_is_subset_of_session() {
        let root = ConversationScope::root("root");
        let child = root.child("c");
        root.add_turn(Turn::human("a"));
        child.add_turn(Turn::ai("b"));
        let session: HashSet<u64> = child.session(true).iter().map(Turn::seq).collect();
        assert!(child.own_turns().iter().all(|t| session.contains(&t.seq())));
    }

    #[test]
    fn exclude_children_drops_descendant_turns() {
        let root = ConversationScope::root("root");
        let child = root.child("child");
        root.add_turn(Turn::human("mine"));
        child.add_turn(Turn::ai("from child"));
        root.consolidate(&child);

        assert_eq!(root.scope(true).len(), 2);
        assert_eq!(texts(&root.scope(false)), vec!["mine"]);
        assert_eq!(texts(&root.session(false)), vec!["mine"]);
    }

    #[test]
    fn entry_without_name_is_empty() {
        let root = ConversationScope::root("root");
        root.add_turn(Turn::human("x"));
        assert!(root.entry(true).is_empty());
    }

    #[test]
    fn entry_filters_by_entry_name() {
        let root = ConversationScope::root("root");
        root.add_turn(Turn::human("before entry"));
        let entry = ConversationScope::builder("agent")
            .parent(&root)
            .entry_name("chat")
            .build();
        entry.add_turn(Turn::human("in entry"));
        assert_eq!(texts(&entry.entry(true)), vec!["in entry"]);
        assert_eq!(entry.session(true).len(), 2);
    }

    #[test]
    fn owner_projection_filters_chain() {
        let root = ConversationScope::root("orchestrator");
        let child = root.child("bash");
        root.add_turn(Turn::human("from orchestrator"));
        root.add_turn(Turn::ai("tagged bash").with_owner("bash"));
        child.add_turn(Turn::ai("bash own"));
        assert_eq!(texts(&child.owned()), vec!["tagged bash", "bash own"]);
    }

    #[test]
    fn consolidate_intersects_kind_filters() {
        let parent = ConversationScope::builder("parent")
            .accepted_kinds([TurnKind::Human, TurnKind::Ai, TurnKind::Log])
            .build();
        let child = ConversationScope::builder("child")
            .parent(&parent)
            .exposed_kinds([TurnKind::Ai, TurnKind::Log, TurnKind::System])
            .build();
        child.add_turn(Turn::human("h"));
        child.add_turn(Turn::ai("a"));
        child.add_turn(Turn::new(TurnKind::Log, "l"));
        child.add_turn(Turn::system("s"));
        parent.consolidate(&child);
        assert_eq!(texts(&parent.own_turns()), vec!["a", "l"]);
    }

    #[test]
    fn consolidate_preserves_seq() {
        let parent = ConversationScope::root("p");
        let child = parent.child("c");
        let t = child.add_turn(Turn::ai("x"));
        parent.consolidate(&child);
        assert_eq!(parent.own_turns()[0].seq(), t.seq());
        assert_eq!(parent.own_turns()[0].path, child.path());
    }

    #[test]
    fn mark_reaches_ancestor_logs() {
        let root = ConversationScope::root("root");
        let child = root.child("c");
        let t = root.add_turn(Turn::human("x"));
        let n = child.mark(&HashSet::from([t.seq()]), |turn| {
            turn.flags.cache_breakpoint = true
        });
        assert_eq!(n, 1);
        assert!(root.own_turns()[0].flags.cache_breakpoint);
    }

    #[test]
    fn dropped_parent_detaches_child() {
        let root = ConversationScope::root("root");
        let child = root.child("c");
        root.add_turn(Turn::human("gone"));
        drop(root);
        assert!(child.parent().is_none());
        assert!(child.session(true).is_empty());
    }
}
