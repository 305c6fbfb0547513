use super::api::{ApiError, ServerAction};
use crate::{
    modules::interaction::{
        guard::{InteractionGuard, SendError},
        session::SlashSession,
    },
    utils::correlation_id,
    Context, Error,
};
use poise::command;
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, warn};

/// What a user sees when a Crafty operation fails. The id ties the reply to the log line.
#[derive(Debug, Clone)]
pub struct Failure {
    pub message: String,
    pub correlation_id: String,
}

impl Failure {
    pub fn new(operation: &str, error: &ApiError) -> Self {
        let correlation_id = correlation_id();
        match error {
            ApiError::Validation(_) => {
                warn!(correlation_id = %correlation_id, "{} refused: {}", operation, error)
            }
            _ => error!(correlation_id = %correlation_id, "{} failed: {}", operation, error),
        }
        Self {
            message: error.user_message(),
            correlation_id,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n-# Reference: `{}`", self.message, self.correlation_id)
    }
}

fn action_reply(action: ServerAction, server_id: &str, data: &Value) -> String {
    let mut lines = vec![
        format!("✅ **{} Successful**", action.label()),
        format!("• Server ID: `{}`", server_id),
    ];
    if let Some(fields) = data.as_object() {
        for (key, value) in fields.iter().take(5) {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            lines.push(format!("• {}: {}", key, value));
        }
    }
    lines.join("\n")
}

async fn deliver(guard: &InteractionGuard, session: &SlashSession<'_>, message: &str) {
    match guard.safe_respond(session, message).await {
        Ok(()) => {}
        Err(SendError::Ignored(reason)) => debug!("Reply dropped: {}", reason),
        Err(SendError::Failed(e)) => error!("Could not deliver reply: {}", e),
    }
}

async fn run_action(ctx: Context<'_>, action: ServerAction) -> Result<(), Error> {
    let Some(session) = SlashSession::from_context(ctx) else {
        return Ok(());
    };
    let data = ctx.data();
    if let Err(e) = data.guard.safe_defer(&session).await {
        debug!("Defer for {} skipped: {}", action.label(), e);
    }

    let reply = match data.crafty.server_action(&data.server_id, action).await {
        Ok(result) => action_reply(action, &data.server_id, &result),
        Err(e) => Failure::new(action.label(), &e).to_string(),
    };
    deliver(&data.guard, &session, &reply).await;
    Ok(())
}

/// Start the Minecraft server
#[command(slash_command, guild_only)]
pub async fn start(ctx: Context<'_>) -> Result<(), Error> {
    run_action(ctx, ServerAction::Start).await
}

/// Stop the Minecraft server
#[command(slash_command, guild_only)]
pub async fn stop(ctx: Context<'_>) -> Result<(), Error> {
    run_action(ctx, ServerAction::Stop).await
}

/// Restart the Minecraft server
#[command(slash_command, guild_only)]
pub async fn restart(ctx: Context<'_>) -> Result<(), Error> {
    run_action(ctx, ServerAction::Restart).await
}

/// Force kill the Minecraft server
#[command(slash_command, guild_only)]
pub async fn kill(ctx: Context<'_>) -> Result<(), Error> {
    run_action(ctx, ServerAction::Kill).await
}

/// Create a backup of the Minecraft server
#[command(slash_command, guild_only)]
pub async fn backup(ctx: Context<'_>) -> Result<(), Error> {
    run_action(ctx, ServerAction::Backup).await
}

/// Show the Minecraft server status
#[command(slash_command, guild_only)]
pub async fn status(ctx: Context<'_>) -> Result<(), Error> {
    let Some(session) = SlashSession::from_context(ctx) else {
        return Ok(());
    };
    let data = ctx.data();
    if let Err(e) = data.guard.safe_defer(&session).await {
        debug!("Defer for status skipped: {}", e);
    }

    let reply = match data.crafty.server_stats(&data.server_id).await {
        Ok(stats) => stats.summary(),
        Err(e) => Failure::new("Server Status", &e).to_string(),
    };
    deliver(&data.guard, &session, &reply).await;
    Ok(())
}

/// Send a command to the server console
#[command(slash_command, guild_only, required_permissions = "ADMINISTRATOR")]
pub async fn console(
    ctx: Context<'_>,
    #[description = "Console command to run"] command: String,
) -> Result<(), Error> {
    let Some(session) = SlashSession::from_context(ctx) else {
        return Ok(());
    };
    let session = session.ephemeral();
    let data = ctx.data();
    if let Err(e) = data.guard.safe_defer(&session).await {
        debug!("Defer for console skipped: {}", e);
    }

    let reply = match data.crafty.send_command(&data.server_id, &command).await {
        Ok(()) => format!("✅ Sent `{}` to the server console", command.trim()),
        Err(e) => Failure::new("Console Command", &e).to_string(),
    };
    deliver(&data.guard, &session, &reply).await;
    Ok(())
}

const HELP: &str = "\
🎮 **Minecraft Server Commands**
• `/start`: start the server
• `/stop`: stop the server
• `/restart`: restart the server
• `/kill`: force kill the server
• `/backup`: create a backup
• `/status`: show server status
• `/console`: send a console command (administrators)";

/// List the available server commands
#[command(slash_command)]
pub async fn help(ctx: Context<'_>) -> Result<(), Error> {
    let Some(session) = SlashSession::from_context(ctx) else {
        ctx.say(HELP).await?;
        return Ok(());
    };
    deliver(&ctx.data().guard, &session.ephemeral(), HELP).await;
    Ok(())
}
