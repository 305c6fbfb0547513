use async_trait::async_trait;
use futures::future::join_all;
use poise::serenity_prelude::{Context, FullEvent};
use std::fmt::Debug;
use tokio::sync::RwLock;
use tracing::{error, trace};

#[async_trait]
pub trait EventHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn handle(
        &self,
        ctx: &Context,
        event: &FullEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Fans gateway events out to every registered handler.
#[derive(Debug, Default)]
pub struct EventManager {
    handlers: RwLock<Vec<Box<dyn EventHandler>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_handler(&self, handler: impl EventHandler + 'static) {
        self.handlers.write().await.push(Box::new(handler));
    }

    pub async fn handle_event(&self, ctx: &Context, event: &FullEvent) {
        let handlers = self.handlers.read().await;
        trace!(
            "Dispatching {} to {} handlers",
            event.snake_case_name(),
            handlers.len()
        );

        let runs = handlers.iter().map(|handler| async move {
            if let Err(e) = handler.handle(ctx, event).await {
                error!(
                    "Error in event handler {} for {}: {}",
                    handler.name(),
                    event.snake_case_name(),
                    e
                );
            }
        });
        join_all(runs).await;
    }
}
