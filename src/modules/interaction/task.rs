use super::guard::InteractionGuard;
use crate::tasks::Task;
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::debug;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Forgets interactions whose followup window has closed.
#[derive(Debug, Clone)]
pub struct InteractionSweepTask {
    guard: Arc<InteractionGuard>,
}

impl InteractionSweepTask {
    pub fn new(guard: Arc<InteractionGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Task for InteractionSweepTask {
    fn name(&self) -> &str {
        "InteractionSweep"
    }

    fn schedule(&self) -> Option<Duration> {
        Some(SWEEP_INTERVAL)
    }

    async fn execute(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let removed = self.guard.sweep();
        if removed > 0 {
            debug!(
                "Swept {} finished interactions, {} still tracked",
                removed,
                self.guard.len()
            );
        }
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Task> {
        Box::new(self.clone())
    }
}
