use config::Config;
use events::EventManager;
use modules::{
    crafty::{
        api::{build_http_client, CraftyClient, Timeouts},
        auth::{AuthManager, AuthSettings},
        commands::{backup, console, help, kill, restart, start, status, stop},
        database::TokenCache,
    },
    interaction::{guard::InteractionGuard, session::SlashSession, task::InteractionSweepTask},
    system::{errors, events::ReadyHandler},
};
use poise::serenity_prelude::{self as serenity, CreateAllowedMentions, GuildId};
use std::sync::Arc;
use tasks::TaskManager;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod database;
mod events;
mod modules;
mod tasks;
mod utils;

#[derive(Clone)]
pub struct Data {
    pub crafty: Arc<CraftyClient>,
    pub guard: Arc<InteractionGuard>,
    pub server_id: String,
    pub event_manager: Arc<EventManager>,
}

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

#[poise::command(slash_command, guild_only, required_permissions = "MANAGE_GUILD")]
async fn register(ctx: Context<'_>) -> Result<(), Error> {
    poise::builtins::register_application_commands_buttons(ctx).await?;
    Ok(())
}

/// Fails fast on bad credentials and checks the configured server exists.
async fn preflight(crafty: &CraftyClient, server_id: &str) -> Result<(), Error> {
    crafty.auth().get_valid_token().await?;
    match crafty.auth().refresh_scheduled_at().await {
        Some(at) => info!("Authenticated with Crafty, token refresh scheduled for {}", at),
        None => info!("Authenticated with Crafty"),
    }

    match crafty.server_stats(server_id).await {
        Ok(stats) => info!(
            "Managing server {} ({}), currently {}",
            stats.server_name,
            server_id,
            stats.state()
        ),
        Err(e) => warn!("Could not read stats for server {}: {}", server_id, e),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    info!("starting craftybot");

    let config = Config::from_env().inspect_err(|e| error!("Invalid configuration: {}", e))?;
    info!(
        "Using Crafty at {} with {} authentication",
        config.crafty_url,
        config.auth_mode()
    );

    let http = build_http_client(&Timeouts::default(), config.accept_invalid_certs)?;
    let auth = AuthManager::new(
        config.credential.clone(),
        &config.crafty_url,
        http.clone(),
        TokenCache::new(&config.token_cache),
        AuthSettings {
            default_lifetime: config.token_lifetime,
            ..Default::default()
        },
    );
    let crafty = Arc::new(CraftyClient::new(&config.crafty_url, http, auth.clone()));
    preflight(&crafty, &config.server_id)
        .await
        .inspect_err(|e| error!("Crafty pre-flight check failed: {}", e))?;

    let guard = Arc::new(InteractionGuard::new());
    let task_manager = Arc::new(TaskManager::new());
    task_manager
        .add_task(InteractionSweepTask::new(guard.clone()))
        .await;
    task_manager.start_tasks().await;
    info!("{} background tasks running", task_manager.running().await);

    let event_manager = Arc::new(EventManager::new());
    event_manager.add_handler(ReadyHandler).await;

    let data = Data {
        crafty,
        guard,
        server_id: config.server_id.clone(),
        event_manager,
    };
    let guild_id = config.guild_id;

    let intents = serenity::GatewayIntents::non_privileged();
    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions::<Data, Error> {
            allowed_mentions: Some(CreateAllowedMentions::new().empty_roles().empty_users()),
            commands: vec![
                register(),
                start(),
                stop(),
                restart(),
                kill(),
                backup(),
                status(),
                console(),
                help(),
            ],
            pre_command: |ctx| {
                Box::pin(async move {
                    trace!(
                        "Command {} used by {} in {}",
                        ctx.command().qualified_name,
                        ctx.author().tag(),
                        ctx.guild_id()
                            .map_or_else(|| "DM".to_string(), |id| id.to_string())
                    );
                    if let Some(session) = SlashSession::from_context(ctx) {
                        ctx.data().guard.begin(&session);
                    }
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command {} completed for {} in {}",
                        ctx.command().qualified_name,
                        ctx.author().tag(),
                        ctx.guild_id()
                            .map_or_else(|| "DM".to_string(), |id| id.to_string())
                    );
                })
            },
            on_error: |error| Box::pin(errors::on_error(error)),
            event_handler: |ctx, event, _framework, data| {
                Box::pin(async move {
                    data.event_manager.handle_event(ctx, event).await;
                    Ok(())
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, _ready, framework| {
            Box::pin(async move {
                let commands = &framework.options().commands;
                match guild_id {
                    Some(id) => {
                        info!("registering commands in guild {}", id);
                        poise::builtins::register_in_guild(ctx, commands, GuildId::new(id))
                            .await?;
                    }
                    None => {
                        info!("registering commands globally");
                        poise::builtins::register_globally(ctx, commands).await?;
                    }
                }
                Ok(data)
            })
        })
        .build();

    let mut client = serenity::ClientBuilder::new(&config.discord_token, intents)
        .framework(framework)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shard_manager.shutdown_all().await;
        }
    });

    let result = client.start().await;

    task_manager.shutdown().await;
    auth.shutdown().await;
    info!("craftybot stopped");
    result.map_err(Into::into)
}
