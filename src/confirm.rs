//! User confirmation capability
//!
//! Push, pull, and init-repo ask before doing anything destructive. The
//! coordinator holds a [`UserConfirmer`] it was constructed with; tests and
//! non-interactive runs inject their own implementations instead of
//! touching process-global state.

use crate::error::{QfsError, QfsResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

#[async_trait]
pub trait UserConfirmer: Send + Sync {
	/// Ask a yes/no question; `default_yes` is the answer for bare Enter
	async fn confirm(&self, prompt: &str, default_yes: bool) -> QfsResult<bool>;
}

/// Prompt on stdout, read the answer from stdin
pub struct StdioConfirmer;

#[async_trait]
impl UserConfirmer for StdioConfirmer {
	async fn confirm(&self, prompt: &str, default_yes: bool) -> QfsResult<bool> {
		let prompt = format!("{} [{}] ", prompt, if default_yes { "Y/n" } else { "y/N" });
		let answer = tokio::task::spawn_blocking(move || {
			use std::io::{BufRead, Write};
			print!("{}", prompt);
			std::io::stdout().flush()?;
			let mut line = String::new();
			std::io::stdin().lock().read_line(&mut line)?;
			Ok::<String, std::io::Error>(line)
		})
		.await
		.map_err(|e| QfsError::other(format!("prompt task failed: {}", e)))?
		.map_err(|e| QfsError::other(format!("cannot read answer: {}", e)))?;

		let answer = answer.trim().to_lowercase();
		Ok(match answer.as_str() {
			"" => default_yes,
			"y" | "yes" => true,
			_ => false,
		})
	}
}

/// Fixed answer for non-interactive runs
pub struct AutoConfirmer {
	pub answer: bool,
}

#[async_trait]
impl UserConfirmer for AutoConfirmer {
	async fn confirm(&self, _prompt: &str, _default_yes: bool) -> QfsResult<bool> {
		Ok(self.answer)
	}
}

/// Takes every prompt's default, which is always its safe answer; used
/// when stdin is not a terminal
pub struct DefaultAnswer;

#[async_trait]
impl UserConfirmer for DefaultAnswer {
	async fn confirm(&self, _prompt: &str, default_yes: bool) -> QfsResult<bool> {
		Ok(default_yes)
	}
}

/// Scripted answers, consumed in order; used by tests
pub struct ScriptedConfirmer {
	answers: Mutex<VecDeque<bool>>,
}

impl ScriptedConfirmer {
	pub fn new(answers: Vec<bool>) -> ScriptedConfirmer {
		ScriptedConfirmer { answers: Mutex::new(answers.into_iter().collect()) }
	}
}

#[async_trait]
impl UserConfirmer for ScriptedConfirmer {
	async fn confirm(&self, prompt: &str, _default_yes: bool) -> QfsResult<bool> {
		self.answers
			.lock()
			.await
			.pop_front()
			.ok_or_else(|| QfsError::other(format!("unexpected prompt: {}", prompt)))
	}
}


// vim: ts=4
