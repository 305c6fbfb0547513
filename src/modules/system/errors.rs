use crate::{
    modules::interaction::{guard::MESSAGE_LIMIT, session::SlashSession},
    Context, Data, Error,
};
use poise::FrameworkError;
use tracing::{debug, error};

const UNEXPECTED: &str = "❌ An unexpected error occurred. Please try again later.";

fn location(ctx: Context<'_>) -> String {
    ctx.guild_id()
        .map_or_else(|| "DM".to_string(), |id| id.to_string())
}

fn command_error_message(error: &Error) -> String {
    let message = format!("❌ {}", error);
    if message.chars().count() > MESSAGE_LIMIT {
        UNEXPECTED.to_string()
    } else {
        message
    }
}

/// Sends `message` to the invoking user without letting a second failure escape.
async fn report(ctx: Context<'_>, message: &str) {
    match SlashSession::from_context(ctx) {
        Some(session) => {
            ctx.data()
                .guard
                .report_error(&session.ephemeral(), message)
                .await
        }
        None => {
            if let Err(e) = ctx.say(message).await {
                error!("Failed to send error response: {}", e);
            }
        }
    }
}

pub async fn on_error(error: FrameworkError<'_, Data, Error>) {
    match error {
        FrameworkError::Command { error, ctx, .. } => {
            error!(
                "Command {} failed for {} in {}: {:?}",
                ctx.command().qualified_name,
                ctx.author().tag(),
                location(ctx),
                error
            );
            report(ctx, &command_error_message(&error)).await;
        }
        FrameworkError::MissingUserPermissions { ctx, .. } => {
            debug!(
                "{} lacks permissions for {}",
                ctx.author().tag(),
                ctx.command().qualified_name
            );
            report(ctx, "❌ You don't have permission to use this command.").await;
        }
        FrameworkError::CooldownHit {
            remaining_cooldown,
            ctx,
            ..
        } => {
            let message = format!(
                "❌ Command is on cooldown. Try again in {:.2} seconds.",
                remaining_cooldown.as_secs_f64()
            );
            report(ctx, &message).await;
        }
        FrameworkError::ArgumentParse { error, ctx, .. } => {
            debug!(
                "Bad arguments for {}: {}",
                ctx.command().qualified_name,
                error
            );
            report(ctx, "❌ Invalid argument provided. Please check your input.").await;
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_errors_are_replaced() {
        let small: Error = "server offline".into();
        assert_eq!(command_error_message(&small), "❌ server offline");

        let huge: Error = "x".repeat(MESSAGE_LIMIT).into();
        assert_eq!(command_error_message(&huge), UNEXPECTED);
    }
}
