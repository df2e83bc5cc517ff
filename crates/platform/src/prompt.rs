//! Operator interaction seam.
//!
//! Several flows stop to ask the operator for input: vault passwords, SSH
//! key passphrases, and host-key trust decisions. All of them go through the
//! [`Prompter`] trait so the calling code never touches stdin directly and
//! tests can script the answers.

use crate::error::{DroverError, DroverResult};
use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;

/// Source of interactive operator answers.
pub trait Prompter: Send + Sync {
    /// Reads a secret without echoing it (passwords, passphrases).
    fn prompt_secret(&self, prompt: &str) -> DroverResult<String>;

    /// Reads one visible line, trimmed of the trailing newline.
    fn prompt_line(&self, prompt: &str) -> DroverResult<String>;
}

/// Prompter backed by the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn prompt_secret(&self, prompt: &str) -> DroverResult<String> {
        rpassword::prompt_password(prompt).map_err(DroverError::Io)
    }

    fn prompt_line(&self, prompt: &str) -> DroverResult<String> {
        print!("{}", prompt);
        std::io::stdout().flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;

        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Prompter that replays a fixed sequence of answers.
///
/// Intended for tests and non-interactive tooling; both secret and visible
/// prompts drain the same queue. Running out of answers is an error rather
/// than a hang.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: Mutex<VecDeque<String>>,
}

impl ScriptedPrompter {
    /// Creates a prompter that will return `answers` in order.
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
        }
    }

    fn next(&self) -> DroverResult<String> {
        self.answers
            .lock()
            .expect("prompter poisoned")
            .pop_front()
            .ok_or_else(|| DroverError::Config("no scripted prompt answer left".to_string()))
    }
}

impl Prompter for ScriptedPrompter {
    fn prompt_secret(&self, _prompt: &str) -> DroverResult<String> {
        self.next()
    }

    fn prompt_line(&self, _prompt: &str) -> DroverResult<String> {
        self.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_order() {
        let prompter = ScriptedPrompter::new(["first", "second"]);
        assert_eq!(prompter.prompt_secret("? ").unwrap(), "first");
        assert_eq!(prompter.prompt_line("? ").unwrap(), "second");
    }

    #[test]
    fn test_scripted_exhausted() {
        let prompter = ScriptedPrompter::new(Vec::<String>::new());
        assert!(prompter.prompt_line("? ").is_err());
    }
}
