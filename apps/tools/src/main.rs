use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fanout::{ChannelAuthConfig, ChannelAuthorizer, ChannelHub, Fanout, PublishPolicy};
use server_api::ApiContext;
use shared::{domain::UserId, protocol::GuildSummary};
use storage::Storage;
use tracing_subscriber::EnvFilter;

/// Offline administration against the server's database.
#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision (or refresh) a user profile and print its id.
    CreateUser {
        handle: String,
        #[arg(long)]
        first_name: Option<String>,
        #[arg(long)]
        last_name: Option<String>,
        #[arg(long)]
        email: Option<String>,
    },
    CreateGuild {
        owner_user_id: i64,
        name: String,
    },
    /// Add a user to the guild behind an invite code.
    JoinGuild {
        user_id: i64,
        invite_code: String,
    },
    ListGuilds {
        user_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();
    let ctx = offline_context(Storage::new(&cli.database_url).await?);

    match cli.command {
        Command::CreateUser {
            handle,
            first_name,
            last_name,
            email,
        } => {
            let user_id = server_api::login(
                &ctx,
                &handle,
                first_name.as_deref(),
                last_name.as_deref(),
                email.as_deref(),
            )
            .await?;
            println!("user_id={user_id}");
        }
        Command::CreateGuild {
            owner_user_id,
            name,
        } => {
            let owner = existing_user(&ctx, owner_user_id).await?;
            let guild = server_api::create_guild(&ctx, owner, &name).await?;
            print_guild(&guild);
        }
        Command::JoinGuild {
            user_id,
            invite_code,
        } => {
            let user_id = existing_user(&ctx, user_id).await?;
            let guild = server_api::join_guild(&ctx, user_id, &invite_code).await?;
            print_guild(&guild);
        }
        Command::ListGuilds { user_id } => {
            let user_id = existing_user(&ctx, user_id).await?;
            for guild in server_api::list_guilds(&ctx, user_id).await? {
                print_guild(&guild);
            }
        }
    }

    Ok(())
}

/// Context for commands that never publish to live subscribers.
fn offline_context(storage: Storage) -> ApiContext {
    ApiContext {
        storage,
        fanout: Fanout::new(Arc::new(ChannelHub::new()), PublishPolicy::BestEffort),
        channel_auth: ChannelAuthorizer::new(ChannelAuthConfig {
            app_key: "tools".into(),
            app_secret: "tools".into(),
            ttl_seconds: 0,
        }),
    }
}

async fn existing_user(ctx: &ApiContext, raw: i64) -> Result<UserId> {
    let profile = server_api::current_user(ctx, Some(UserId(raw))).await?;
    Ok(profile.user_id)
}

fn print_guild(guild: &GuildSummary) {
    let role = guild.role.map(|role| role.as_str()).unwrap_or("-");
    println!(
        "guild_id={} name={:?} invite_code={} owner={} role={role}",
        guild.guild_id, guild.name, guild.invite_code, guild.owner_id
    );
}
