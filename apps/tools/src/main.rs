use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use server_api::{
    create_chat, get_or_create_direct_chat, issue_session_token, ApiContext,
    MissingFileDirectory, SessionKeys,
};
use shared::{
    domain::{ChatType, ProjectId, TeamId, UserId},
    protocol::{CreateChatRequest, UserProfile},
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/chat.db")]
    database_url: String,
    #[arg(long, default_value = "dev-secret")]
    auth_secret: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    SeedUser {
        id: i64,
        username: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        avatar_url: Option<String>,
    },
    SeedProject {
        id: i64,
        name: String,
    },
    SeedTeam {
        id: i64,
        name: String,
    },
    MintToken {
        user_id: i64,
        #[arg(long, default_value_t = 86_400)]
        ttl_seconds: i64,
    },
    CreateGroup {
        creator_id: i64,
        name: String,
        member_ids: Vec<i64>,
    },
    DirectChat {
        user_id: i64,
        recipient_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let session = SessionKeys {
        secret: cli.auth_secret.clone(),
        ttl_seconds: 86_400,
    };

    if let Command::MintToken {
        user_id,
        ttl_seconds,
    } = cli.command
    {
        let keys = SessionKeys {
            ttl_seconds,
            ..session
        };
        println!("{}", issue_session_token(&keys, UserId(user_id))?);
        return Ok(());
    }

    let storage = Storage::new(&cli.database_url).await?;
    let ctx = ApiContext {
        storage: storage.clone(),
        files: Arc::new(MissingFileDirectory),
        session,
    };

    match cli.command {
        Command::SeedUser {
            id,
            username,
            email,
            full_name,
            avatar_url,
        } => {
            storage
                .upsert_user(&UserProfile {
                    id: UserId(id),
                    email,
                    username,
                    full_name,
                    avatar_url,
                })
                .await?;
            println!("seeded user_id={id}");
        }
        Command::SeedProject { id, name } => {
            storage.upsert_project(ProjectId(id), &name).await?;
            println!("seeded project_id={id}");
        }
        Command::SeedTeam { id, name } => {
            storage.upsert_team(TeamId(id), &name).await?;
            println!("seeded team_id={id}");
        }
        Command::CreateGroup {
            creator_id,
            name,
            member_ids,
        } => {
            let chat = create_chat(
                &ctx,
                UserId(creator_id),
                &CreateChatRequest {
                    chat_type: ChatType::Group,
                    name: Some(name),
                    recipient_id: None,
                    member_ids: member_ids.into_iter().map(UserId).collect(),
                    project_id: None,
                    team_id: None,
                },
            )
            .await?;
            println!("created chat_id={} members={}", chat.id, chat.members.len());
        }
        Command::DirectChat {
            user_id,
            recipient_id,
        } => {
            let chat =
                get_or_create_direct_chat(&ctx, UserId(user_id), UserId(recipient_id)).await?;
            println!("direct chat_id={}", chat.id);
        }
        Command::MintToken { .. } => {}
    }

    Ok(())
}
