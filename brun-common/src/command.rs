//! Command-line splitting, quoting and environment merging.
//!
//! Commands arrive either as a single shell-style string or as an argv list.
//! Both are normalised into [`CommandLine`], which can be rendered back into a
//! string that is safe to paste into (or send through) a POSIX shell.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("Empty command")]
    Empty,

    #[error("Unterminated {quote} quote in command: {command}")]
    UnterminatedQuote { quote: char, command: String },

    #[error("Trailing backslash in command: {command}")]
    TrailingBackslash { command: String },
}

/// A command as an argument vector with a non-empty program name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CommandSpec", into = "CommandSpec")]
pub struct CommandLine {
    argv: Vec<String>,
}

/// Wire form of a command: either a shell string or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandSpec {
    Shell(String),
    Argv(Vec<String>),
}

impl TryFrom<CommandSpec> for CommandLine {
    type Error = CommandLineError;

    fn try_from(spec: CommandSpec) -> Result<Self, Self::Error> {
        match spec {
            // Unparseable strings are kept whole; spawning them will fail with
            // a useful error instead of being silently mangled here.
            CommandSpec::Shell(s) => match CommandLine::parse(&s) {
                Err(CommandLineError::Empty) => Err(CommandLineError::Empty),
                Err(_) => Ok(CommandLine { argv: vec![s] }),
                Ok(cmd) => Ok(cmd),
            },
            CommandSpec::Argv(argv) => CommandLine::from_args(argv),
        }
    }
}

impl From<CommandLine> for CommandSpec {
    fn from(cmd: CommandLine) -> Self {
        CommandSpec::Argv(cmd.argv)
    }
}

impl CommandLine {
    /// Split a shell-style string into arguments.
    pub fn parse(command: &str) -> Result<Self, CommandLineError> {
        let argv = split_words(command)?;
        if argv.is_empty() {
            return Err(CommandLineError::Empty);
        }
        Ok(Self { argv })
    }

    /// Build from an argv list. Arguments are kept exactly as given; only a
    /// missing or empty program name is rejected.
    pub fn from_args<I, S>(args: I) -> Result<Self, CommandLineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = args.into_iter().map(Into::into).collect();
        match argv.first() {
            Some(program) if !program.is_empty() => Ok(Self { argv }),
            _ => Err(CommandLineError::Empty),
        }
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Prepend a wrapper invocation, e.g. a scheduler or `ssh`.
    pub fn wrapped<I, S>(&self, prefix: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv: Vec<String> = prefix.into_iter().map(Into::into).collect();
        argv.extend(self.argv.iter().cloned());
        Self { argv }
    }

    /// Render as a single shell-safe string.
    pub fn to_shell_string(&self) -> String {
        quote_join(&self.argv)
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell_string())
    }
}

/// Quote each argument as needed and join with spaces.
pub fn quote_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_escape::unix::escape(Cow::Borrowed(a.as_ref())).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a shell-style string into words. An empty string yields no words.
pub fn split_words(command: &str) -> Result<Vec<String>, CommandLineError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(CommandLineError::UnterminatedQuote {
                                quote: '\'',
                                command: command.to_string(),
                            });
                        }
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e @ ('"' | '\\' | '$' | '`')) => current.push(e),
                            Some('\n') => {}
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(CommandLineError::UnterminatedQuote {
                                    quote: '"',
                                    command: command.to_string(),
                                });
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(CommandLineError::UnterminatedQuote {
                                quote: '"',
                                command: command.to_string(),
                            });
                        }
                    }
                }
            }
            '\\' => match chars.next() {
                Some('\n') => {}
                Some(escaped) => {
                    in_word = true;
                    current.push(escaped);
                }
                None => {
                    return Err(CommandLineError::TrailingBackslash {
                        command: command.to_string(),
                    });
                }
            },
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        args.push(current);
    }
    Ok(args)
}

/// An environment override value; lists are joined with `:` like PATH.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Single(String),
    List(Vec<String>),
}

impl EnvValue {
    pub fn joined(&self) -> String {
        match self {
            EnvValue::Single(s) => s.clone(),
            EnvValue::List(items) => items.join(":"),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::Single(s.to_string())
    }
}

impl From<Vec<String>> for EnvValue {
    fn from(items: Vec<String>) -> Self {
        EnvValue::List(items)
    }
}

/// Environment overrides keyed by variable name.
pub type EnvOverrides = BTreeMap<String, EnvValue>;

/// Flatten overrides into plain `KEY=value` pairs.
pub fn flatten_env(overrides: &EnvOverrides) -> BTreeMap<String, String> {
    overrides
        .iter()
        .map(|(k, v)| (k.clone(), v.joined()))
        .collect()
}

/// The full environment a child sees: `base` updated with `overrides`.
pub fn merge_env(
    base: impl IntoIterator<Item = (String, String)>,
    overrides: &EnvOverrides,
) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = base.into_iter().collect();
    env.extend(flatten_env(overrides));
    env
}
