//! JSON snapshots of a single scope.
//!
//! Only the scope's own log is written; parents are not followed. Writes go
//! through a temp file and a rename so a crash never leaves a partial file.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::scope::ConversationScope;
use super::turn::{Turn, advance_seq_past};
use crate::budget::BudgetState;
use crate::error::OrchestratorError;

#[derive(Serialize, Deserialize, Debug)]
struct ScopeSnapshot {
    path: Vec<String>,
    owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entry_name: Option<String>,
    turns: Vec<Turn>,
    #[serde(default)]
    budget: BudgetState,
    saved_at: DateTime<Utc>,
}

impl ConversationScope {
    /// Write this scope's own log to `path`.
    ///
    /// Returns `Ok(false)` without touching disk when the scope is empty, or
    /// when the file exists and `overwrite` is false.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<bool, OrchestratorError> {
        if self.is_empty() {
            info!("No turns to save");
            return Ok(false);
        }
        if path.exists() && !overwrite {
            info!(path = %path.display(), "Snapshot exists, not overwriting");
            return Ok(false);
        }

        let snapshot = ScopeSnapshot {
            path: self.path().to_vec(),
            owner: self.owner().to_string(),
            entry_name: self.entry_name().map(str::to_string),
            turns: self.own_turns(),
            budget: self.budget().clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| OrchestratorError::Persistence(format!("serialize: {e}")))?;

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                OrchestratorError::Persistence(format!("create {}: {e}", dir.display()))
            })?;
        }
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)
            .map_err(|e| OrchestratorError::Persistence(format!("write temp file: {e}")))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| OrchestratorError::Persistence(format!("rename snapshot: {e}")))?;

        info!(path = %path.display(), turns = snapshot.turns.len(), "Saved conversation scope");
        Ok(true)
    }

    /// Read a snapshot back into a detached root scope.
    ///
    /// The global turn counter is advanced past the highest restored seq.
    pub fn load(path: &Path) -> Result<Arc<ConversationScope>, OrchestratorError> {
        info!(path = %path.display(), "Loading conversation scope");
        let raw = std::fs::read_to_string(path)
            .map_err(|e| OrchestratorError::Persistence(format!("read {}: {e}", path.display())))?;
        let snapshot: ScopeSnapshot = serde_json::from_str(&raw)
            .map_err(|e| OrchestratorError::Persistence(format!("parse snapshot: {e}")))?;

        if let Some(max) = snapshot.turns.iter().map(Turn::seq).max() {
            advance_seq_past(max);
        }
        Ok(ConversationScope::restore(
            snapshot.path,
            snapshot.owner,
            snapshot.entry_name,
            snapshot.turns,
            snapshot.budget,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_scope_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        let scope = ConversationScope::root("s");
        assert!(!scope.save(&path, false).unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn save_then_load_restores_turns_and_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("scope.json");
        let scope = ConversationScope::builder("agent").entry_name("chat").build();
        let a = scope.add_turn(Turn::human("hello"));
        let b = scope.add_turn(Turn::ai("hi there"));
        scope.budget().last_checkpoint = 12_000;

        assert!(scope.save(&path, false).unwrap());
        let restored = ConversationScope::load(&path).unwrap();

        let seqs: Vec<u64> = restored.own_turns().iter().map(Turn::seq).collect();
        assert_eq!(seqs, vec![a.seq(), b.seq()]);
        assert_eq!(restored.entry_name(), Some("chat"));
        assert_eq!(restored.budget().last_checkpoint, 12_000);
        assert!(Turn::human("after").seq() > b.seq());
    }

    #[test]
    fn existing_file_kept_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scope.json");
        std::fs::write(&path, "sentinel").unwrap();
        let scope = ConversationScope::root("s");
        scope.add_turn(Turn::human("x"));
        assert!(!scope.save(&path, false).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "sentinel");
        assert!(scope.save(&path, true).unwrap());
        assert!(ConversationScope::load(&path).is_ok());
    }
}
