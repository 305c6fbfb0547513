use crate::events::EventHandler;
use async_trait::async_trait;
use poise::serenity_prelude::{ActivityData, Context, FullEvent, OnlineStatus};
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReadyHandler;

#[async_trait]
impl EventHandler for ReadyHandler {
    fn name(&self) -> &str {
        "Ready"
    }

    async fn handle(
        &self,
        ctx: &Context,
        event: &FullEvent,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let FullEvent::Ready { data_about_bot } = event {
            info!(
                "Connected as {} to {} guilds",
                data_about_bot.user.tag(),
                data_about_bot.guilds.len()
            );
            ctx.set_presence(
                Some(ActivityData::watching("Crafty Controller servers")),
                OnlineStatus::Online,
            );
        }
        Ok(())
    }
}
