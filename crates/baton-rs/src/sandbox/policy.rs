use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Allow and deny lists for shell commands.
///
/// Keys are command prefixes such as `"git status"` or `"rm -rf"`; they are
/// split on whitespace and matched token by token. Allow values describe the
/// command, deny values explain the refusal. An empty allow list permits
/// nothing.
///
/// ```toml
/// [sandbox.allow]
/// ls = "List directory contents"
/// grep = "Search file contents"
///
/// [sandbox.deny]
/// "rm -rf" = "destructive"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub allow: BTreeMap<String, String>,
    pub deny: BTreeMap<String, String>,
}

impl SandboxPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, command: impl Into<String>, description: impl Into<String>) -> Self {
        self.allow.insert(command.into(), description.into());
        self
    }

    pub fn deny(mut self, command: impl Into<String>, reason: impl Into<String>) -> Self {
        self.deny.insert(command.into(), reason.into());
        self
    }

    /// Markdown bullet list of the allowed commands, for prompts.
    pub fn describe_allowed(&self) -> String {
        self.allow
            .iter()
            .map(|(name, desc)| format!("- `{name}`: {desc}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Split a policy key or command into tokens.
pub(crate) fn tokenize(command: &str) -> Vec<String> {
    command.split_whitespace().map(String::from).collect()
}

/// True when one token sequence is a prefix of the other.
pub(crate) fn prefix_match(command: &[String], entry: &[String]) -> bool {
    if command.is_empty() || entry.is_empty() {
        return false;
    }
    let n = command.len().min(entry.len());
    command[..n] == entry[..n]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_match_is_token_wise_both_ways() {
        let t = tokenize;
        assert!(prefix_match(&t("rm -rf /tmp/x"), &t("rm -rf")));
        assert!(prefix_match(&t("git"), &t("git status")));
        assert!(!prefix_match(&t("cli1 --foo"), &t("cli")));
        assert!(!prefix_match(&t("git push"), &t("git status")));
    }

    #[test]
    fn policy_from_toml() {
        let policy: SandboxPolicy = toml::from_str(
            r#"
            [allow]
            ls = "List files"
            [deny]
            "rm -rf" = "destructive"
            "#,
        )
        .unwrap();
        assert_eq!(policy.allow["ls"], "List files");
        assert_eq!(policy.deny["rm -rf"], "destructive");
        assert_eq!(policy.describe_allowed(), "- `ls`: List files");
    }
}
