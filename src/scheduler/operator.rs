//! Human checkpoints during a migration.

use crate::error::Result;
use parking_lot::Mutex;
use std::fmt::Debug;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// The person (or policy) supervising a scheduler run.
#[async_trait::async_trait]
pub trait Operator: Send + Sync + Debug {
    /// Ask to proceed. `force` means the run was started non-interactively.
    async fn confirm(&self, force: bool, message: &str) -> Result<bool>;

    /// Show one line of progress.
    fn progress(&self, line: &str);
}

/// Answers every prompt the same way and remembers what was asked.
#[derive(Debug)]
pub struct AutoConfirm {
    answer: bool,
    prompts: Mutex<Vec<String>>,
    progress: Mutex<Vec<String>>,
}

impl AutoConfirm {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            prompts: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    pub fn progress_lines(&self) -> Vec<String> {
        self.progress.lock().clone()
    }
}

impl Default for AutoConfirm {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait::async_trait]
impl Operator for AutoConfirm {
    async fn confirm(&self, _force: bool, message: &str) -> Result<bool> {
        self.prompts.lock().push(message.to_string());
        Ok(self.answer)
    }

    fn progress(&self, line: &str) {
        self.progress.lock().push(line.to_string());
    }
}

/// Prompts on stderr and reads `y`/`n` from stdin.
#[derive(Debug, Default)]
pub struct ConsoleOperator;

#[async_trait::async_trait]
impl Operator for ConsoleOperator {
    async fn confirm(&self, force: bool, message: &str) -> Result<bool> {
        if force {
            tracing::info!(message, "Confirmation skipped (forced)");
            return Ok(true);
        }

        let mut stderr = tokio::io::stderr();
        stderr.write_all(format!("{} [y/N] ", message).as_bytes()).await?;
        stderr.flush().await?;

        let mut answer = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut answer)
            .await?;
        Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
    }

    fn progress(&self, line: &str) {
        eprintln!("{}", line);
    }
}
