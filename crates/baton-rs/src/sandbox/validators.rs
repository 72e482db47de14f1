//! Per-program argument validators.
//!
//! Some allowed programs can still write to arbitrary files through their
//! arguments. A [`CommandValidator`] registered for a program name inspects
//! the parsed arguments of every invocation of that program.

use std::collections::HashMap;

use crate::error::SandboxError;

/// An option and its value. Flags without a value carry `None`.
pub type ParsedOption = (String, Option<String>);

/// POSIX-style parse of one simple command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedArgs {
    pub program: String,
    pub options: Vec<ParsedOption>,
    pub positional: Vec<String>,
}

impl ParsedArgs {
    pub fn has_option(&self, names: &[&str]) -> bool {
        self.options.iter().any(|(name, _)| names.contains(&name.as_str()))
    }
}

/// Parse `words` (program first) using `options_with_args` to decide which
/// options consume the following word.
///
/// - `--` ends option parsing; `-` alone is a value.
/// - `--name=value` carries its value inline.
/// - In a short group like `-rk2` only the last letter may take an argument.
/// - A pending option followed by another option is finalized as a flag.
pub fn parse_posix_args(words: &[String], options_with_args: &[&str]) -> ParsedArgs {
    let mut out = ParsedArgs::default();
    let Some((program, args)) = words.split_first() else {
        return out;
    };
    out.program = program.clone();

    let mut pending: Option<String> = None;
    let mut end_of_options = false;

    for arg in args {
        if end_of_options {
            out.positional.push(arg.clone());
            continue;
        }
        if arg == "--" {
            end_of_options = true;
            continue;
        }
        let is_option = arg.starts_with('-') && arg != "-";
        if is_option && let Some(name) = pending.take() {
            out.options.push((name, None));
        }

        if let Some(long) = arg.strip_prefix("--") {
            match long.split_once('=') {
                Some((name, value)) => {
                    out.options.push((format!("--{name}"), Some(value.to_string())));
                }
                None if options_with_args.contains(&arg.as_str()) => pending = Some(arg.clone()),
                None => out.options.push((arg.clone(), None)),
            }
        } else if is_option {
            let letters: Vec<char> = arg.chars().skip(1).collect();
            for (i, letter) in letters.iter().enumerate() {
                let name = format!("-{letter}");
                if i + 1 == letters.len() && options_with_args.contains(&name.as_str()) {
                    pending = Some(name);
                } else {
                    out.options.push((name, None));
                }
            }
        } else if let Some(name) = pending.take() {
            out.options.push((name, Some(arg.clone())));
        } else {
            out.positional.push(arg.clone());
        }
    }
    if let Some(name) = pending {
        out.options.push((name, None));
    }
    out
}

/// Validates the arguments of one program.
pub trait CommandValidator: Send + Sync {
    fn validate(&self, words: &[String]) -> Result<(), SandboxError>;
}

fn rejection(program: &str, detail: String) -> SandboxError {
    SandboxError::Arguments {
        program: program.to_string(),
        message: format!(
            "<warning>\n{detail}\nThis is considered a security risk as it can bypass\n\
             safeguards in place to protect sensitive data.\n</warning>"
        ),
    }
}

/// `sort` must not write its output to a file.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortValidator;

impl SortValidator {
    pub const OPTIONS_WITH_ARGS: &'static [&'static str] = &[
        "--random-source",
        "--sort",
        "--batch-size",
        "--check",
        "--compress-program",
        "--files0-from",
        "-k",
        "--key",
        "-o",
        "--output",
        "-S",
        "--buffer-size",
        "-t",
        "--field-separator",
        "-T",
        "--temporary-directory",
        "--parallel",
    ];
    const DISALLOWED: &'static [&'static str] = &["-o", "--output"];
}

impl CommandValidator for SortValidator {
    fn validate(&self, words: &[String]) -> Result<(), SandboxError> {
        let args = parse_posix_args(words, Self::OPTIONS_WITH_ARGS);
        match args
            .options
            .iter()
            .find(|(name, _)| Self::DISALLOWED.contains(&name.as_str()))
        {
            Some((name, _)) => Err(rejection(
                "sort",
                format!("You are not allowed to use the `{name}` option with `sort`."),
            )),
            None => Ok(()),
        }
    }
}

/// `uniq INPUT OUTPUT` writes to a file; only one positional is accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniqValidator;

impl UniqValidator {
    pub const OPTIONS_WITH_ARGS: &'static [&'static str] =
        &["-f", "--skip-fields", "-s", "--skip-chars", "-w", "--check-chars"];
}

impl CommandValidator for UniqValidator {
    fn validate(&self, words: &[String]) -> Result<(), SandboxError> {
        let args = parse_posix_args(words, Self::OPTIONS_WITH_ARGS);
        if args.positional.len() > 1 {
            return Err(rejection(
                "uniq",
                "You are not allowed to pass the output argument to `uniq`.".to_string(),
            ));
        }
        Ok(())
    }
}

/// Program name to validator.
pub type ValidatorRegistry = HashMap<String, Box<dyn CommandValidator>>;

/// The built-in validators.
pub fn default_validators() -> ValidatorRegistry {
    let mut registry: ValidatorRegistry = HashMap::new();
    registry.insert("sort".into(), Box::new(SortValidator));
    registry.insert("uniq".into(), Box::new(UniqValidator));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    fn opt(name: &str, value: Option<&str>) -> ParsedOption {
        (name.to_string(), value.map(String::from))
    }

    #[test]
    fn short_groups_and_values() {
        let args = parse_posix_args(&w("sort -rk 2 -t , data.csv"), SortValidator::OPTIONS_WITH_ARGS);
        assert_eq!(args.program, "sort");
        assert_eq!(
            args.options,
            vec![opt("-r", None), opt("-k", Some("2")), opt("-t", Some(","))]
        );
        assert_eq!(args.positional, vec!["data.csv"]);
    }

    #[test]
    fn long_options_inline_and_separate() {
        let args = parse_posix_args(
            &w("sort --key=2 --output out.txt --unique"),
            SortValidator::OPTIONS_WITH_ARGS,
        );
        assert_eq!(
            args.options,
            vec![
                opt("--key", Some("2")),
                opt("--output", Some("out.txt")),
                opt("--unique", None)
            ]
        );
    }

    #[test]
    fn pending_option_before_another_option_is_a_flag() {
        let args = parse_posix_args(&w("tool --draft --stack"), &["--draft"]);
        assert_eq!(args.options, vec![opt("--draft", None), opt("--stack", None)]);
    }

    #[test]
    fn double_dash_and_single_dash() {
        let args = parse_posix_args(&w("uniq -c - -- -weird"), UniqValidator::OPTIONS_WITH_ARGS);
        assert_eq!(args.options, vec![opt("-c", None)]);
        assert_eq!(args.positional, vec!["-", "-weird"]);
    }

    #[test]
    fn sort_rejects_output_flag() {
        assert!(SortValidator.validate(&w("sort -u names.txt")).is_ok());
        let err = SortValidator.validate(&w("sort -o /etc/passwd x")).unwrap_err();
        assert!(err.to_string().contains("`-o` option with `sort`"));
        assert!(SortValidator.validate(&w("sort --output=x y")).is_err());
    }

    #[test]
    fn uniq_rejects_output_file() {
        assert!(UniqValidator.validate(&w("uniq -c input.txt")).is_ok());
        assert!(UniqValidator.validate(&w("uniq -f 1 input.txt")).is_ok());
        assert!(UniqValidator.validate(&w("uniq input.txt output.txt")).is_err());
    }
}
