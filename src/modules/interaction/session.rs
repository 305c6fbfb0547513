use super::guard::{InteractionSession, PlatformError};
use crate::{Context, Data, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use poise::serenity_prelude::{
    self as serenity, CreateInteractionResponse, CreateInteractionResponseFollowup,
    CreateInteractionResponseMessage,
};
use std::sync::atomic::Ordering;

/// Milliseconds between the Unix epoch and Discord's snowflake epoch (2015-01-01).
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

const ALREADY_ACKNOWLEDGED: isize = 40060;
const UNKNOWN_INTERACTION: isize = 10062;
const UNKNOWN_WEBHOOK: isize = 10015;

/// A slash command invocation seen through [`InteractionSession`].
pub struct SlashSession<'a> {
    ctx: poise::ApplicationContext<'a, Data, Error>,
    ephemeral: bool,
}

impl<'a> SlashSession<'a> {
    pub fn new(ctx: poise::ApplicationContext<'a, Data, Error>) -> Self {
        Self {
            ctx,
            ephemeral: false,
        }
    }

    /// `None` for prefix invocations, which have no interaction token.
    pub fn from_context(ctx: Context<'a>) -> Option<Self> {
        match ctx {
            poise::Context::Application(app) => Some(Self::new(app)),
            poise::Context::Prefix(_) => None,
        }
    }

    /// Only the invoking user will see messages sent through this session.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }
}

pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let millis = (id >> 22) as i64 + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
}

fn classify(error: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(serenity::HttpError::UnsuccessfulRequest(response)) = &error {
        match response.error.code {
            ALREADY_ACKNOWLEDGED => return PlatformError::AlreadyAcknowledged,
            UNKNOWN_INTERACTION | UNKNOWN_WEBHOOK => return PlatformError::UnknownInteraction,
            _ => {}
        }
    }
    PlatformError::Other(error.to_string())
}

#[async_trait]
impl<'a> InteractionSession for SlashSession<'a> {
    fn id(&self) -> u64 {
        self.ctx.interaction.id.get()
    }

    fn created_at(&self) -> DateTime<Utc> {
        snowflake_time(self.id())
    }

    fn is_acknowledged(&self) -> bool {
        self.ctx.has_sent_initial_response.load(Ordering::SeqCst)
    }

    async fn defer(&self) -> Result<(), PlatformError> {
        let response = CreateInteractionResponse::Defer(
            CreateInteractionResponseMessage::new().ephemeral(self.ephemeral),
        );
        self.ctx
            .interaction
            .create_response(self.ctx.serenity_context, response)
            .await
            .map_err(classify)?;
        self.ctx
            .has_sent_initial_response
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn respond(&self, message: &str) -> Result<(), PlatformError> {
        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(message)
                .ephemeral(self.ephemeral),
        );
        self.ctx
            .interaction
            .create_response(self.ctx.serenity_context, response)
            .await
            .map_err(classify)?;
        self.ctx
            .has_sent_initial_response
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn followup(&self, message: &str) -> Result<(), PlatformError> {
        let followup = CreateInteractionResponseFollowup::new()
            .content(message)
            .ephemeral(self.ephemeral);
        self.ctx
            .interaction
            .create_followup(self.ctx.serenity_context, followup)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}
