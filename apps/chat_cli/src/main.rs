use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use client_core::{
    ChatApiClient, LatestMessageSource, MessageTimeline, PollingClient, PollingConfig,
    RealtimeTransport, SyncEngine,
};
use shared::{
    domain::{ChatId, ChatType, MessageId, MessageType, UserId},
    protocol::{ChatEvent, CreateChatRequest, EventType, MessagePayload, SendMessageRequest},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[arg(long)]
    token: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List chats with unread counts.
    Chats,
    /// Open (or create) the direct chat with a user.
    Direct { recipient_id: i64 },
    CreateGroup { name: String, member_ids: Vec<i64> },
    Send { chat_id: i64, text: String },
    React { message_id: i64, emoji: String },
    /// Follow a chat live; lines typed on stdin are sent as messages.
    Tail {
        chat_id: i64,
        #[arg(long, default_value_t = 50)]
        history: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let api = ChatApiClient::new(args.server_url, args.token);

    match args.command {
        Command::Chats => {
            for chat in api.list_chats().await? {
                let title = chat.name.clone().unwrap_or_else(|| {
                    chat.members
                        .iter()
                        .map(|m| m.user.username.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                });
                let preview = chat
                    .last_message
                    .as_ref()
                    .map(|m| m.content.as_str())
                    .unwrap_or("");
                println!(
                    "#{} [{}] {title} ({} unread) {preview}",
                    chat.id, chat.chat_type, chat.unread_count
                );
            }
        }
        Command::Direct { recipient_id } => {
            let chat = api.direct_chat(UserId(recipient_id)).await?;
            println!("direct chat_id={}", chat.id);
        }
        Command::CreateGroup { name, member_ids } => {
            let chat = api
                .create_chat(&CreateChatRequest {
                    chat_type: ChatType::Group,
                    name: Some(name),
                    recipient_id: None,
                    member_ids: member_ids.into_iter().map(UserId).collect(),
                    project_id: None,
                    team_id: None,
                })
                .await?;
            println!("created chat_id={}", chat.id);
        }
        Command::Send { chat_id, text } => {
            let message = api.send_message(&text_message(ChatId(chat_id), text)).await?;
            println!("sent message_id={}", message.id);
        }
        Command::React { message_id, emoji } => {
            let toggled = api
                .toggle_reaction(MessageId(message_id), &emoji)
                .await?;
            let verb = if toggled.added { "added" } else { "removed" };
            println!("{verb} {emoji}");
        }
        Command::Tail { chat_id, history } => tail(api, ChatId(chat_id), history).await?,
    }

    Ok(())
}

fn text_message(chat_id: ChatId, content: String) -> SendMessageRequest {
    SendMessageRequest {
        chat_id,
        content,
        message_type: MessageType::Text,
        reply_to_id: None,
        metadata: None,
        attachment_ids: Vec::new(),
    }
}

fn render(message: &MessagePayload) {
    if message.is_deleted() {
        println!("[{}] (deleted)", message.id);
        return;
    }
    let edited = if message.edited_at.is_some() { " (edited)" } else { "" };
    let reactions: String = message.reactions.iter().map(|r| r.emoji.as_str()).collect();
    println!(
        "[{}] {}: {}{edited} {reactions}",
        message.id, message.sender.display_name, message.content
    );
}

async fn tail(api: ChatApiClient, chat_id: ChatId, history: u32) -> Result<()> {
    let mut timeline = MessageTimeline::new(chat_id);
    timeline.merge_page(api.list_messages(chat_id, history, None).await?);
    timeline.messages().for_each(render);

    let transport = RealtimeTransport::new(api.transport_config());
    let polling = PollingClient::new(
        Arc::new(api.clone()) as Arc<dyn LatestMessageSource>,
        PollingConfig::default(),
    );
    let engine = SyncEngine::new(transport, polling);

    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel::<ChatEvent>();
    engine.on(
        EventType::Message,
        Arc::new(move |event: &ChatEvent| {
            let _ = tx.send(event.clone());
        }),
    );
    engine.join(chat_id);
    if let Err(error) = engine.connect().await {
        warn!(%error, "live connection unavailable; retrying in the background");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => match &event {
                ChatEvent::Typing { chat_id: typing, user_id, data } if *typing == chat_id => {
                    if data.is_typing {
                        println!("... user {user_id} is typing");
                    }
                }
                ChatEvent::Error { error, .. } => eprintln!("! {error}"),
                _ => {
                    if timeline.apply(&event) {
                        if let Some(message) = message_of(&event).and_then(|id| timeline.get(id)) {
                            render(message);
                        }
                    }
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                if text.is_empty() {
                    continue;
                }
                match api.send_message(&text_message(chat_id, text.to_string())).await {
                    Ok(message) => {
                        if timeline.upsert(message.clone()) {
                            render(&message);
                        }
                    }
                    Err(error) => eprintln!("! send failed: {error:#}"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    engine.shutdown();
    if let Some(last) = timeline.last() {
        if let Err(error) = api.mark_read(chat_id, Some(last.created_at)).await {
            warn!(error = %format!("{error:#}"), "failed to mark chat read");
        }
    }
    Ok(())
}

fn message_of(event: &ChatEvent) -> Option<MessageId> {
    match event {
        ChatEvent::Message { message, .. }
        | ChatEvent::MessageSent { message, .. }
        | ChatEvent::MessageUpdated { message, .. }
        | ChatEvent::MessageDeleted { message, .. } => Some(message.id),
        ChatEvent::ReactionAdded { reaction, .. } | ChatEvent::ReactionRemoved { reaction, .. } => {
            Some(reaction.message_id)
        }
        _ => None,
    }
}
