//! Extraction of simple commands from a shell command line.
//!
//! This is not a shell. It lexes just enough POSIX shell syntax to find every
//! simple command a line would run, including commands nested in `$(...)`,
//! backticks and process substitutions, and returns each command's leading
//! words with quotes removed. Leading assignments and redirections are
//! skipped; a redirection after the first word ends that command's words.
//! Expansions such as `$VAR` are kept literally, so they never match a policy
//! entry by accident.

use crate::error::SandboxError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word { text: String, assignment: bool },
    /// `|`, `||`, `&&`, `;`, `&`, newline, `(`, `)` and friends.
    Separator,
    /// Any redirection operator. The next word is its target.
    Redirect,
}

/// Reserved words skipped at command position.
const KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "{", "}", "!", "time",
    "esac",
];

/// Words that open a header whose words are not commands, and the words that close it.
const HEADERS: &[(&str, &[&str])] = &[
    ("for", &["do"]),
    ("select", &["do"]),
    ("case", &["in"]),
    ("function", &["{"]),
];

/// Return the leading word tokens of every simple command in `line`.
pub fn command_words(line: &str) -> Result<Vec<Vec<String>>, String> {
    let mut lexer = Lexer::new(line);
    let tokens = lexer.run()?;
    let mut commands = Vec::new();
    collect(&tokens, &mut commands);
    commands.extend(lexer.nested);
    Ok(commands)
}

/// Like [`command_words`] but with a sandbox error naming the line.
pub(crate) fn parse(line: &str) -> Result<Vec<Vec<String>>, SandboxError> {
    command_words(line).map_err(|message| SandboxError::Parse {
        command: line.to_string(),
        message,
    })
}

fn collect(tokens: &[Token], out: &mut Vec<Vec<String>>) {
    let mut current: Vec<String> = Vec::new();
    let mut closed = false;
    let mut redirect_target = false;
    let mut header_end: Option<&[&str]> = None;

    let flush = |current: &mut Vec<String>, out: &mut Vec<Vec<String>>| {
        if !current.is_empty() {
            out.push(std::mem::take(current));
        }
    };

    for token in tokens {
        match token {
            Token::Separator => {
                flush(&mut current, out);
                closed = false;
                redirect_target = false;
                header_end = None;
            }
            Token::Redirect => {
                if !current.is_empty() {
                    closed = true;
                }
                redirect_target = true;
            }
            Token::Word { text, assignment } => {
                if redirect_target {
                    redirect_target = false;
                    continue;
                }
                if let Some(end) = header_end {
                    if end.contains(&text.as_str()) {
                        header_end = None;
                    }
                    continue;
                }
                if current.is_empty() {
                    if *assignment {
                        continue;
                    }
                    if let Some((_, end)) = HEADERS.iter().find(|(w, _)| *w == text.as_str()) {
                        header_end = Some(*end);
                        continue;
                    }
                    if KEYWORDS.contains(&text.as_str()) {
                        continue;
                    }
                }
                if !closed {
                    current.push(text.clone());
                }
            }
        }
    }
    flush(&mut current, out);
}

struct Heredoc {
    delimiter: String,
    /// `<<-` strips leading tabs.
    strip: bool,
    /// Unquoted delimiters expand `$(...)` and backticks in the body.
    expand: bool,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    /// Commands found inside substitutions.
    nested: Vec<Vec<String>>,
    /// Here-document delimiters waiting for the next newline.
    heredocs: Vec<Heredoc>,
    heredoc_next: Option<bool>,
}

impl Lexer {
    fn new(line: &str) -> Self {
        Self {
            chars: line.chars().collect(),
            pos: 0,
            nested: Vec::new(),
            heredocs: Vec::new(),
            heredoc_next: None,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars().enumerate().all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn run(&mut self) -> Result<Vec<Token>, String> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '\\' if self.peek_at(1) == Some('\n') => self.pos += 2,
                '\n' => {
                    self.pos += 1;
                    self.skip_heredocs()?;
                    tokens.push(Token::Separator);
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '|' | ';' | '(' | ')' => {
                    self.pos += 1;
                    if matches!(self.peek(), Some('|' | '&' | ';')) && c != '(' && c != ')' {
                        self.pos += 1;
                    }
                    tokens.push(Token::Separator);
                }
                '&' => {
                    if self.starts_with("&>") {
                        self.pos += if self.starts_with("&>>") { 3 } else { 2 };
                        tokens.push(Token::Redirect);
                    } else {
                        self.pos += if self.starts_with("&&") { 2 } else { 1 };
                        tokens.push(Token::Separator);
                    }
                }
                '<' | '>' if self.peek_at(1) == Some('(') => {
                    let inner = self.balanced_parens(2)?;
                    self.nest(&inner)?;
                    tokens.push(Token::Word {
                        text: format!("{c}({inner})"),
                        assignment: false,
                    });
                }
                '<' | '>' => tokens.push(self.redirect()),
                c if c.is_ascii_digit() && self.is_fd_redirect() => {
                    while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.pos += 1;
                    }
                    tokens.push(self.redirect());
                }
                _ => {
                    let start = self.pos;
                    let word = self.word()?;
                    if let Some(strip) = self.heredoc_next.take()
                        && let Token::Word { text, .. } = &word
                    {
                        let quoted = self.chars[start..self.pos]
                            .iter()
                            .any(|c| matches!(c, '\'' | '"' | '\\'));
                        self.heredocs.push(Heredoc {
                            delimiter: text.clone(),
                            strip,
                            expand: !quoted,
                        });
                    }
                    tokens.push(word);
                }
            }
        }
        Ok(tokens)
    }

    fn is_fd_redirect(&self) -> bool {
        let mut i = 0;
        while self.peek_at(i).is_some_and(|c| c.is_ascii_digit()) {
            i += 1;
        }
        matches!(self.peek_at(i), Some('<' | '>'))
    }

    fn redirect(&mut self) -> Token {
        const OPS: &[&str] = &["<<<", "<<-", "<<", "<&", "<>", "<", ">>", ">&", ">|", ">"];
        for op in OPS {
            if self.starts_with(op) {
                self.pos += op.chars().count();
                match *op {
                    "<<" => self.heredoc_next = Some(false),
                    "<<-" => self.heredoc_next = Some(true),
                    _ => {}
                }
                break;
            }
        }
        Token::Redirect
    }

    fn skip_heredocs(&mut self) -> Result<(), String> {
        for heredoc in std::mem::take(&mut self.heredocs) {
            let mut body = String::new();
            loop {
                if self.pos >= self.chars.len() {
                    break;
                }
                let start = self.pos;
                while self.peek().is_some_and(|c| c != '\n') {
                    self.pos += 1;
                }
                let line: String = self.chars[start..self.pos].iter().collect();
                if self.peek() == Some('\n') {
                    self.pos += 1;
                }
                let candidate = if heredoc.strip {
                    line.trim_start_matches('\t')
                } else {
                    line.as_str()
                };
                if candidate == heredoc.delimiter {
                    break;
                }
                body.push_str(&line);
                body.push('\n');
            }
            if heredoc.expand {
                self.expansions(&body)?;
            }
        }
        Ok(())
    }

    fn word(&mut self) -> Result<Token, String> {
        let mut text = String::new();
        let mut quoted = false;
        let mut assignment = false;

        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | '|' | '&' | ';' | '(' | ')' | '<' | '>' => break,
                '\\' => {
                    self.pos += 1;
                    match self.peek() {
                        Some('\n') => self.pos += 1,
                        Some(next) => {
                            text.push(next);
                            quoted = true;
                            self.pos += 1;
                        }
                        None => {}
                    }
                }
                '\'' => {
                    self.pos += 1;
                    quoted = true;
                    loop {
                        match self.peek() {
                            Some('\'') => {
                                self.pos += 1;
                                break;
                            }
                            Some(c) => {
                                text.push(c);
                                self.pos += 1;
                            }
                            None => return Err("unterminated single quote".into()),
                        }
                    }
                }
                '"' => {
                    self.pos += 1;
                    quoted = true;
                    self.double_quoted(&mut text)?;
                }
                '$' => self.dollar(&mut text)?,
                '`' => {
                    let inner = self.backticks()?;
                    self.nest(&inner)?;
                    text.push('`');
                    text.push_str(&inner);
                    text.push('`');
                }
                '=' if !quoted && !assignment && is_name(&text) => {
                    assignment = true;
                    text.push(c);
                    self.pos += 1;
                }
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(Token::Word { text, assignment })
    }

    fn double_quoted(&mut self, text: &mut String) -> Result<(), String> {
        loop {
            match self.peek() {
                Some('"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c @ ('$' | '`' | '"' | '\\')) => {
                            text.push(c);
                            self.pos += 1;
                        }
                        Some('\n') => self.pos += 1,
                        _ => text.push('\\'),
                    }
                }
                Some('$') => self.dollar(text)?,
                Some('`') => {
                    let inner = self.backticks()?;
                    self.nest(&inner)?;
                    text.push('`');
                    text.push_str(&inner);
                    text.push('`');
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
                None => return Err("unterminated double quote".into()),
            }
        }
    }

    /// `$(...)`, `$((...))`, `${...}` or a plain `$`.
    fn dollar(&mut self, text: &mut String) -> Result<(), String> {
        if self.starts_with("$((") {
            let inner = self.balanced_parens(3)?;
            // Arithmetic closes with a second `)`.
            if self.peek() == Some(')') {
                self.pos += 1;
            }
            self.expansions(&inner)?;
            text.push_str("$((");
            text.push_str(&inner);
            text.push_str("))");
        } else if self.starts_with("$(") {
            let inner = self.balanced_parens(2)?;
            self.nest(&inner)?;
            text.push_str("$(");
            text.push_str(&inner);
            text.push(')');
        } else if self.starts_with("${") {
            self.pos += 2;
            text.push_str("${");
            loop {
                match self.peek() {
                    Some('}') => {
                        self.pos += 1;
                        text.push('}');
                        break;
                    }
                    Some('\\') => {
                        text.push('\\');
                        self.pos += 1;
                        if let Some(c) = self.peek() {
                            text.push(c);
                            self.pos += 1;
                        }
                    }
                    Some('"') => {
                        self.pos += 1;
                        text.push('"');
                        self.double_quoted(text)?;
                        text.push('"');
                    }
                    Some('$') => self.dollar(text)?,
                    Some('`') => {
                        let inner = self.backticks()?;
                        self.nest(&inner)?;
                        text.push('`');
                        text.push_str(&inner);
                        text.push('`');
                    }
                    Some(c) => {
                        text.push(c);
                        self.pos += 1;
                    }
                    None => return Err("unterminated parameter expansion".into()),
                }
            }
        } else {
            text.push('$');
            self.pos += 1;
        }
        Ok(())
    }

    /// Consume `skip` opening characters, then everything up to the matching `)`.
    fn balanced_parens(&mut self, skip: usize) -> Result<String, String> {
        self.pos += skip;
        let start = self.pos;
        let mut depth = 1usize;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match (quote, c) {
                (Some(q), c) if c == q => quote = None,
                (Some('"'), '\\') => self.pos += 1,
                (Some(_), _) => {}
                (None, '\\') => self.pos += 1,
                (None, '\'' | '"') => quote = Some(c),
                (None, '(') => depth += 1,
                (None, ')') => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.chars[start..self.pos - 1].iter().collect());
                    }
                }
                _ => {}
            }
        }
        Err("unterminated command substitution".into())
    }

    fn backticks(&mut self) -> Result<String, String> {
        self.pos += 1;
        let mut inner = String::new();
        loop {
            match self.peek() {
                Some('`') => {
                    self.pos += 1;
                    return Ok(inner);
                }
                Some('\\') if self.peek_at(1) == Some('`') => {
                    inner.push('`');
                    self.pos += 2;
                }
                Some(c) => {
                    inner.push(c);
                    self.pos += 1;
                }
                None => return Err("unterminated backquote".into()),
            }
        }
    }

    fn nest(&mut self, inner: &str) -> Result<(), String> {
        let commands = command_words(inner)?;
        self.nested.extend(commands);
        Ok(())
    }

    /// Collect the substitutions in text that is expanded but never split into
    /// commands: arithmetic and unquoted here-document bodies.
    fn expansions(&mut self, body: &str) -> Result<(), String> {
        let mut inner = Lexer::new(body);
        let mut scratch = String::new();
        while let Some(c) = inner.peek() {
            match c {
                '\\' => inner.pos += 2,
                '$' => inner.dollar(&mut scratch)?,
                '`' => {
                    let command = inner.backticks()?;
                    inner.nest(&command)?;
                }
                _ => inner.pos += 1,
            }
        }
        self.nested.extend(inner.nested);
        Ok(())
    }
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<Vec<String>> {
        command_words(line).unwrap()
    }

    fn cmds(expected: &[&[&str]]) -> Vec<Vec<String>> {
        expected
            .iter()
            .map(|c| c.iter().map(|w| w.to_string()).collect())
            .collect()
    }

    #[test]
    fn pipelines_and_lists() {
        assert_eq!(
            words("ls -la | grep TODO && echo done; pwd"),
            cmds(&[&["ls", "-la"], &["grep", "TODO"], &["echo", "done"], &["pwd"]])
        );
    }

    #[test]
    fn quotes_are_removed() {
        assert_eq!(
            words(r#"grep "hello world" 'a b' c\ d"#),
            cmds(&[&["grep", "hello world", "a b", "c d"]])
        );
    }

    #[test]
    fn assignments_and_leading_redirects_are_skipped() {
        assert_eq!(
            words("FOO=1 BAR='x y' 2>/dev/null env"),
            cmds(&[&["env"]])
        );
    }

    #[test]
    fn redirect_after_words_ends_command() {
        assert_eq!(
            words("cat a.txt > out.txt b.txt"),
            cmds(&[&["cat", "a.txt"]])
        );
        assert_eq!(words("make 2>&1 | tee log"), cmds(&[&["make"], &["tee", "log"]]));
    }

    #[test]
    fn substitutions_are_inspected() {
        let found = words("echo $(rm -rf /tmp/x) `whoami`");
        assert!(found.contains(&vec!["rm".to_string(), "-rf".into(), "/tmp/x".into()]));
        assert!(found.contains(&vec!["whoami".to_string()]));
        assert_eq!(found[0][0], "echo");
    }

    #[test]
    fn subshells_and_compound_commands() {
        assert_eq!(
            words("(cd src && ls) || if true; then echo ok; fi"),
            cmds(&[&["cd", "src"], &["ls"], &["true"], &["echo", "ok"]])
        );
        assert_eq!(
            words("for f in a b; do wc -l $f; done"),
            cmds(&[&["wc", "-l", "$f"]])
        );
    }

    #[test]
    fn heredoc_body_is_not_a_command() {
        assert_eq!(
            words("cat <<EOF\nrm -rf /\nEOF\nls"),
            cmds(&[&["cat"], &["ls"]])
        );
    }

    #[test]
    fn unquoted_heredoc_body_substitutions_are_inspected() {
        let found = words("cat <<EOF\nhello $(rm -rf /tmp/x)\n`whoami`\nEOF");
        assert_eq!(found[0], vec!["cat".to_string()]);
        assert!(found.contains(&vec!["rm".to_string(), "-rf".into(), "/tmp/x".into()]));
        assert!(found.contains(&vec!["whoami".to_string()]));

        assert_eq!(
            words("cat <<'EOF'\n$(rm -rf /tmp/x)\nEOF"),
            cmds(&[&["cat"]])
        );
        assert_eq!(
            words("cat <<\"EOF\"\n`whoami`\nEOF"),
            cmds(&[&["cat"]])
        );
    }

    #[test]
    fn parameter_and_arithmetic_expansions_are_inspected() {
        let found = words("ls ${x:-$(rm -rf /tmp/x)}");
        assert_eq!(found[0], vec!["ls".to_string(), "${x:-$(rm -rf /tmp/x)}".into()]);
        assert!(found.contains(&vec!["rm".to_string(), "-rf".into(), "/tmp/x".into()]));

        let found = words("ls ${a:-${b:-`whoami`}}");
        assert!(found.contains(&vec!["whoami".to_string()]));

        let found = words("echo $(( $(id -u) + 1 ))");
        assert!(found.contains(&vec!["id".to_string(), "-u".into()]));
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(words("ls # rm -rf /"), cmds(&[&["ls"]]));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(command_words("echo 'oops").is_err());
        assert!(command_words("echo $(ls").is_err());
    }
}
