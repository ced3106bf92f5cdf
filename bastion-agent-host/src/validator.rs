//! Command validation
//!
//! Every command received from the kernel passes through here before it
//! gets anywhere near a process. Character screening comes first so shell
//! syntax is refused by name, then the text must parse as exactly one
//! canonical append rule. Nothing is ever handed to a shell.

use bastion_protocol::{GrammarError, RuleSpec};
use thiserror::Error;

pub const MAX_COMMAND_LEN: usize = 512;

const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '<', '>', '\\', '"', '\'', '*', '?', '[', ']', '{', '}', '~', '!', '#', '\n',
    '\r',
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("command is empty")]
    Empty,
    #[error("command is {0} bytes, limit is {MAX_COMMAND_LEN}")]
    TooLong(usize),
    #[error("shell metacharacter {0:?} is not allowed")]
    ShellMetacharacter(char),
    #[error("control character is not allowed")]
    ControlCharacter,
    #[error("character {0:?} is not allowed")]
    DisallowedCharacter(char),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

/// A command that passed every check; only these reach the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    rule: RuleSpec,
}

impl ValidatedCommand {
    pub fn rule(&self) -> &RuleSpec {
        &self.rule
    }
}

pub fn validate(text: &str) -> Result<ValidatedCommand, ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::Empty);
    }
    if text.len() > MAX_COMMAND_LEN {
        return Err(ValidationError::TooLong(text.len()));
    }
    for c in text.chars() {
        if SHELL_METACHARACTERS.contains(&c) {
            return Err(ValidationError::ShellMetacharacter(c));
        }
        if c.is_control() {
            return Err(ValidationError::ControlCharacter);
        }
        if !(c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '/' | '-')) {
            return Err(ValidationError::DisallowedCharacter(c));
        }
    }
    let rule = RuleSpec::parse(text)?;
    Ok(ValidatedCommand { rule })
}
