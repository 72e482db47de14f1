//! Command sandbox for shell-running capabilities.
//!
//! [`Sandbox::check`] parses a command line into simple commands, matches
//! each one against the [`SandboxPolicy`] deny list and then its allow list,
//! and finally runs any per-program [`CommandValidator`]. A command passes
//! only when nothing was denied and everything was allowed.
//!
//! ```ignore
//! let sandbox = Sandbox::new(
//!     SandboxPolicy::new()
//!         .allow("ls", "List files")
//!         .allow("grep", "Search")
//!         .deny("rm -rf", "destructive"),
//! );
//! assert!(sandbox.check("ls -la | grep TODO").is_ok());
//! ```

pub mod policy;
pub mod shell;
pub mod validators;

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::error::SandboxError;
use policy::{prefix_match, tokenize};

pub use policy::SandboxPolicy;
pub use validators::{
    CommandValidator, ParsedArgs, SortValidator, UniqValidator, ValidatorRegistry,
    default_validators, parse_posix_args,
};

const DEFAULT_DENY_REASON: &str = "This command is explicitly disallowed";

/// Outcome of matching a command line against the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verdict {
    /// Canonical allow entries that matched.
    pub allowed: BTreeSet<String>,
    /// Commands that matched no allow entry.
    pub disallowed: BTreeSet<String>,
    /// Canonical deny entries that matched.
    pub explicitly_disallowed: BTreeSet<String>,
    /// Reason per explicitly disallowed entry.
    pub reasons: BTreeMap<String, String>,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        self.disallowed.is_empty() && self.explicitly_disallowed.is_empty()
    }
}

/// Validates shell command lines against a [`SandboxPolicy`].
pub struct Sandbox {
    policy: SandboxPolicy,
    allow: Vec<Vec<String>>,
    deny: Vec<(Vec<String>, String)>,
    validators: ValidatorRegistry,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("policy", &self.policy)
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Sandbox {
    /// Create a sandbox with the built-in validators.
    pub fn new(policy: SandboxPolicy) -> Self {
        let allow = policy.allow.keys().map(|k| tokenize(k)).collect();
        let deny = policy
            .deny
            .iter()
            .map(|(k, reason)| (tokenize(k), reason.clone()))
            .collect();
        Self {
            policy,
            allow,
            deny,
            validators: default_validators(),
        }
    }

    /// Register (or replace) the validator for `program`.
    pub fn with_validator(
        mut self,
        program: impl Into<String>,
        validator: impl CommandValidator + 'static,
    ) -> Self {
        self.validators.insert(program.into(), Box::new(validator));
        self
    }

    /// Remove the validator for `program`, if any.
    pub fn without_validator(mut self, program: &str) -> Self {
        self.validators.remove(program);
        self
    }

    pub fn policy(&self) -> &SandboxPolicy {
        &self.policy
    }

    /// Match every simple command in `command` against the policy.
    pub fn validate(&self, command: &str) -> Result<Verdict, SandboxError> {
        let commands = shell::parse(command)?;
        Ok(self.verdict(&commands))
    }

    fn verdict(&self, commands: &[Vec<String>]) -> Verdict {
        let mut verdict = Verdict::default();
        for words in commands {
            let denied = self
                .deny
                .iter()
                .filter(|(entry, _)| prefix_match(words, entry))
                .map(|(entry, reason)| (entry.join(" "), reason))
                .collect::<Vec<_>>();
            if !denied.is_empty() {
                for (entry, reason) in denied {
                    let reason = if reason.is_empty() {
                        DEFAULT_DENY_REASON.to_string()
                    } else {
                        reason.clone()
                    };
                    verdict.reasons.insert(entry.clone(), reason);
                    verdict.explicitly_disallowed.insert(entry);
                }
                continue;
            }
            match self.allow.iter().find(|entry| prefix_match(words, entry)) {
                Some(entry) => {
                    verdict.allowed.insert(entry.join(" "));
                }
                None => {
                    verdict.disallowed.insert(words.join(" "));
                }
            }
        }
        verdict
    }

    /// Full check: policy match plus per-program validators.
    ///
    /// Returns the matched allow entries joined with `,`.
    pub fn check(&self, command: &str) -> Result<String, SandboxError> {
        let commands = shell::parse(command)?;
        let verdict = self.verdict(&commands);

        if let Some(entry) = verdict.explicitly_disallowed.iter().next() {
            let reason = verdict
                .reasons
                .get(entry)
                .cloned()
                .unwrap_or_else(|| DEFAULT_DENY_REASON.to_string());
            warn!("Rejected command `{command}`: `{entry}` is denied ({reason})");
            return Err(SandboxError::ExplicitlyDisallowed {
                command: command.to_string(),
                entry: entry.clone(),
                reason,
            });
        }
        if !verdict.disallowed.is_empty() {
            warn!(
                "Rejected command `{command}`: not allowed {:?}",
                verdict.disallowed
            );
            return Err(SandboxError::NotAllowed {
                command: command.to_string(),
                commands: verdict.disallowed.into_iter().collect(),
                allowed: self.policy.allow.keys().cloned().collect(),
            });
        }

        for words in &commands {
            if let Some(validator) = words.first().and_then(|p| self.validators.get(p)) {
                validator.validate(words)?;
            }
        }

        let names = verdict.allowed.into_iter().collect::<Vec<_>>().join(",");
        debug!("Command `{command}` allowed via {names}");
        Ok(names)
    }
}
