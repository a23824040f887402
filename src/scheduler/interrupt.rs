//! Escalating cancellation for the scheduler loop.

use std::fmt;
use tokio_util::sync::CancellationToken;

/// How far cancellation has escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterruptLevel {
    /// No interrupt received.
    Running,
    /// Pending jobs are dropped; in-flight jobs run to completion.
    Draining,
    /// The scheduler stops at once, possibly mid-migration.
    Forced,
}

impl fmt::Display for InterruptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptLevel::Running => write!(f, "running"),
            InterruptLevel::Draining => write!(f, "draining"),
            InterruptLevel::Forced => write!(f, "forced"),
        }
    }
}

/// Cloneable cancellation handle checked at the top of every scheduler iteration.
///
/// The first trigger cancels the drain token, any later one the force token.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    drain: CancellationToken,
    force: CancellationToken,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> InterruptLevel {
        if self.force.is_cancelled() {
            InterruptLevel::Forced
        } else if self.drain.is_cancelled() {
            InterruptLevel::Draining
        } else {
            InterruptLevel::Running
        }
    }

    /// Escalate one level.
    pub fn trigger(&self) -> InterruptLevel {
        if self.drain.is_cancelled() {
            self.force.cancel();
            tracing::error!(
                "Forced interrupt: stopping now, the nameserver may be left mid-migration"
            );
            InterruptLevel::Forced
        } else {
            self.drain.cancel();
            tracing::warn!(
                level = %InterruptLevel::Draining,
                "Interrupt received: dropping pending jobs, in-flight jobs will finish"
            );
            InterruptLevel::Draining
        }
    }

    /// Resolve once draining has started. Stays resolved afterwards.
    pub async fn drained(&self) {
        self.drain.cancelled().await;
    }

    /// Resolve once a forced exit was requested.
    pub async fn forced(&self) {
        self.force.cancelled().await;
    }

    /// Token cancelled on the first trigger, for tasks that should stop with the drain.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Escalate on every Ctrl-C until the process exits.
    pub fn listen_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let interrupt = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt.trigger() == InterruptLevel::Forced {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_escalation() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.level(), InterruptLevel::Running);

        assert_eq!(interrupt.trigger(), InterruptLevel::Draining);
        assert_eq!(interrupt.clone().trigger(), InterruptLevel::Forced);
        assert_eq!(interrupt.trigger(), InterruptLevel::Forced);
        assert_eq!(interrupt.level(), InterruptLevel::Forced);
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let interrupt = Interrupt::new();
        let drained = interrupt.clone();
        let forced = interrupt.clone();
        let drain_handle = tokio::spawn(async move { drained.drained().await });
        let force_handle = tokio::spawn(async move { forced.forced().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), drain_handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!force_handle.is_finished());
        assert!(interrupt.drain_token().is_cancelled());

        interrupt.trigger();
        tokio::time::timeout(Duration::from_secs(1), force_handle)
            .await
            .unwrap()
            .unwrap();
    }
}
