use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use client_core::{ChatClient, ClientEvent};
use shared::{
    domain::{MessageKind, MessageId},
    protocol::{MessagePayload, SendMessageRequest, ServerEvent},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod command;

use command::{parse, Input, HELP};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    handle: String,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();

    let client = Arc::new(ChatClient::new(&args.server_url)?);
    let user_id = client
        .login(
            &args.handle,
            args.first_name.as_deref(),
            args.last_name.as_deref(),
            args.email.as_deref(),
        )
        .await?;
    println!("logged in as user_id={user_id}");

    let printer = tokio::spawn(print_events(client.subscribe_events()));
    client.list_guilds().await?;
    client.switch_room(None).await?;
    print_history(&client.messages().await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let input = match parse(&line) {
            Ok(Some(input)) => input,
            Ok(None) => continue,
            Err(message) => {
                eprintln!("{message}");
                continue;
            }
        };
        if input == Input::Quit {
            break;
        }
        if let Err(error) = run(&client, input).await {
            eprintln!("error: {error}");
        }
    }

    client.disconnect().await;
    printer.abort();
    Ok(())
}

async fn run(client: &ChatClient, input: Input) -> Result<()> {
    match input {
        Input::Say(content) => {
            client.send_text(&content).await?;
        }
        Input::Guilds => {
            for guild in client.list_guilds().await? {
                println!(
                    "  {} {} (invite {})",
                    guild.guild_id, guild.name, guild.invite_code
                );
            }
        }
        Input::CreateGuild(name) => {
            let guild = client.create_guild(&name).await?;
            println!(
                "created {} {} (invite {})",
                guild.guild_id, guild.name, guild.invite_code
            );
        }
        Input::Join(code) => {
            let guild = client.join_guild(&code).await?;
            println!("joined {} {}", guild.guild_id, guild.name);
        }
        Input::Room(guild_id) => {
            client.switch_room(guild_id).await?;
            println!("now in {}", client.room().await);
            print_history(&client.messages().await);
        }
        Input::History => print_history(&client.messages().await),
        Input::Online => println!("{} online", client.online_users().await),
        Input::Edit { index, content } => {
            let id = message_at(client, index).await?.id;
            client.edit_message(id, &content).await?;
        }
        Input::Delete(index) => {
            let id = message_at(client, index).await?.id;
            client.delete_message(id).await?;
        }
        Input::Poll { question, options } => {
            client
                .send_message(SendMessageRequest {
                    kind: MessageKind::Poll,
                    poll_question: Some(question),
                    poll_options: options,
                    ..SendMessageRequest::default()
                })
                .await?;
        }
        Input::Vote { index, option } => {
            let message = message_at(client, index).await?;
            let poll = message
                .poll
                .as_ref()
                .ok_or_else(|| anyhow!("message {index} is not a poll"))?;
            let option_id = poll
                .options
                .get(option - 1)
                .ok_or_else(|| anyhow!("poll has no option {option}"))?
                .id;
            client.vote(message.id, option_id).await?;
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

async fn message_at(client: &ChatClient, index: usize) -> Result<MessagePayload> {
    client
        .messages()
        .await
        .into_iter()
        .nth(index - 1)
        .ok_or_else(|| anyhow!("no message {index}"))
}

fn print_history(messages: &[MessagePayload]) {
    for (position, message) in messages.iter().enumerate() {
        println!("{:>3}. {}", position + 1, render(message));
    }
}

fn render(message: &MessagePayload) -> String {
    let mut line = format!("[{}] ", message.author_name);
    match (&message.poll, &message.file) {
        (Some(poll), _) => {
            line.push_str(&format!("poll: {}", poll.question));
            for (n, option) in poll.options.iter().enumerate() {
                line.push_str(&format!(" | {}. {} ({})", n + 1, option.text, option.votes.len()));
            }
        }
        (None, Some(file)) => line.push_str(&format!(
            "{} <{}>",
            file.name.as_deref().unwrap_or("file"),
            file.url
        )),
        (None, None) => line.push_str(&message.content),
    }
    if message.updated_at.is_some() {
        line.push_str(" (edited)");
    }
    if !message.seen_by.is_empty() {
        line.push_str(&format!(" seen by {}", message.seen_by.len()));
    }
    line
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer lagged");
                continue;
            }
            Err(_) => break,
        };
        match event {
            ClientEvent::Server { event, .. } => match event {
                ServerEvent::MessageCreated { message } => println!("{}", render(&message)),
                ServerEvent::MessageUpdated { message } => {
                    println!("~ {}", render(&message))
                }
                ServerEvent::MessageDeleted { message_id, .. } => {
                    println!("- message {} removed", short(message_id))
                }
                _ => {}
            },
            ClientEvent::PresenceChanged { online, .. } => println!("* {online} online"),
            ClientEvent::RoomSwitched(room) => println!("* joined room {room}"),
            ClientEvent::Error(message) => eprintln!("! {message}"),
            ClientEvent::Disconnected => eprintln!("! gateway disconnected"),
        }
    }
}

fn short(id: MessageId) -> String {
    id.to_string().chars().take(8).collect()
}
