use std::io::BufRead;
use std::sync::Arc;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use shared::{CreateWorkspaceRequest, InviteRequest, Role, WorkspaceInfo};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

mod api;
mod auth;
mod chat;
mod config;
mod session;

use api::ApiClient;
use chat::{ChatClient, ChatInput, ChatUpdate};
use session::SessionController;

#[derive(Parser)]
#[command(name = "docit")]
#[command(about = "DocIt command line client: sign in, manage workspaces, chat")]
#[command(version)]
struct Cli {
    /// Server URL (overrides config)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in with Google
    Login {
        /// Authorization code from the consent redirect
        #[arg(long)]
        code: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Show current login status
    Whoami,
    /// Manage workspaces
    Workspace {
        #[command(subcommand)]
        action: WorkspaceAction,
    },
    /// Join a workspace chat. Type `/reconnect` to retry now, `/quit` to leave.
    Chat {
        workspace_id: Uuid,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum WorkspaceAction {
    /// Create a workspace you own
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// Show a workspace and its members
    Show { id: Uuid },
    /// Add a registered user to a workspace
    Invite {
        id: Uuid,
        email: String,
        /// viewer, editor or admin
        #[arg(long, default_value = "viewer")]
        role: Role,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Set a configuration value
    Set {
        /// Configuration key (server, refresh_token)
        key: String,
        /// Configuration value
        value: String,
    },
    /// Get a configuration value
    Get {
        /// Configuration key
        key: String,
    },
    /// Show all configuration
    Show,
    /// Get the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Config { action } => return handle_config_command(action),
        other => other,
    };

    let config = config::Config::load().unwrap_or_default();
    let api = Arc::new(ApiClient::new(config.server_url(cli.server.as_deref())));
    let session = Arc::new(SessionController::new(
        api.clone(),
        Arc::new(config::ConfigTokenStore),
    ));

    match command {
        Commands::Login { code } => auth::login(&api, &session, code).await?,
        Commands::Logout => auth::logout(&session),
        Commands::Whoami => auth::whoami(&api, &session).await?,
        Commands::Workspace { action } => handle_workspace_command(&api, &session, action).await?,
        Commands::Chat { workspace_id } => run_chat(&api, session, workspace_id).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}

async fn handle_workspace_command(
    api: &ApiClient,
    session: &SessionController,
    action: WorkspaceAction,
) -> Result<()> {
    let workspace = match action {
        WorkspaceAction::Create { name, description } => {
            let body = CreateWorkspaceRequest { name, description };
            let body = &body;
            session
                .with_auth_retry(move |token| async move { api.create_workspace(&token, body).await })
                .await?
        }
        WorkspaceAction::Show { id } => {
            session
                .with_auth_retry(move |token| async move { api.workspace(&token, id).await })
                .await?
        }
        WorkspaceAction::Invite { id, email, role } => {
            let body = InviteRequest { email, role };
            let body = &body;
            session
                .with_auth_retry(move |token| async move { api.invite(&token, id, body).await })
                .await?
        }
    };

    print_workspace(&workspace);
    Ok(())
}

fn print_workspace(workspace: &WorkspaceInfo) {
    println!("\x1b[1m{}\x1b[0m \x1b[90m({})\x1b[0m", workspace.name, workspace.id);
    if let Some(description) = &workspace.description {
        println!("{}", description);
    }
    println!("Your role: {}", workspace.role);
    println!("Members:");
    for member in &workspace.members {
        let owner = if member.user_id == workspace.owner_id { " (owner)" } else { "" };
        println!("  {:<8} {} <{}>{}", member.role.as_str(), member.name, member.email, owner);
    }
}

async fn run_chat(api: &ApiClient, session: Arc<SessionController>, workspace_id: Uuid) -> Result<()> {
    if !session.has_session() {
        eprintln!("\x1b[33m🔐 Not logged in.\x1b[0m");
        eprintln!("   Run '\x1b[1mdocit login\x1b[0m' to authenticate.");
        return Ok(());
    }

    let (input_tx, input_rx) = mpsc::channel(32);
    let (update_tx, mut update_rx) = mpsc::channel(256);

    // Blocking stdin reader on its own thread so it never holds up runtime shutdown
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            let input = match line.trim() {
                "" => continue,
                "/quit" => ChatInput::Quit,
                "/reconnect" => ChatInput::Reconnect,
                body => ChatInput::Send(body.to_string()),
            };
            let quit = matches!(input, ChatInput::Quit);
            if input_tx.blocking_send(input).is_err() || quit {
                return;
            }
        }
        let _ = input_tx.blocking_send(ChatInput::Quit);
    });

    let printer = tokio::spawn(async move {
        while let Some(update) = update_rx.recv().await {
            match update {
                ChatUpdate::Status(status) => {
                    eprintln!("\x1b[90m[{}]\x1b[0m", status.as_str());
                }
                ChatUpdate::Message(message) => {
                    println!(
                        "\x1b[90m{}\x1b[0m \x1b[1m{}\x1b[0m: {}",
                        message.sent_at.with_timezone(&Local).format("%H:%M"),
                        message.sender_name,
                        message.body
                    );
                }
                ChatUpdate::Error(error) => {
                    eprintln!("\x1b[31m{:?}: {}\x1b[0m", error.code, error.message);
                }
                ChatUpdate::Notice(notice) => {
                    eprintln!("\x1b[33m{}\x1b[0m", notice);
                }
            }
        }
    });

    eprintln!(
        "\x1b[36m💬 Joining workspace {} (/reconnect, /quit)\x1b[0m",
        workspace_id
    );
    let client = ChatClient::new(api.chat_url(workspace_id), session);
    client.run(input_rx, update_tx).await;

    let _ = printer.await;
    Ok(())
}

fn handle_config_command(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            let mut config = config::Config::load().unwrap_or_default();
            match key.as_str() {
                "server" => config.remote.server = Some(value),
                "refresh_token" => config.remote.refresh_token = Some(value),
                _ => anyhow::bail!(
                    "Unknown config key: {}. Valid keys: server, refresh_token",
                    key
                ),
            }
            config.save()?;
            println!("Configuration saved");
        }
        ConfigAction::Get { key } => {
            let config = config::Config::load()?;
            let value = match key.as_str() {
                "server" => config.server_url(None),
                "refresh_token" => config
                    .remote
                    .refresh_token
                    .map(|_| "****")
                    .unwrap_or_default()
                    .to_string(),
                _ => anyhow::bail!("Unknown config key: {}", key),
            };
            println!("{}", value);
        }
        ConfigAction::Show => {
            let config = config::Config::load()?;
            println!("server: {}", config.server_url(None));
            println!(
                "refresh_token: {}",
                config.remote.refresh_token.map(|_| "****").unwrap_or_default()
            );
        }
        ConfigAction::Path => {
            let path = config::Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}
