//! Onebox - follows IMAP mailboxes and feeds new mail to search, AI and alerts

mod app;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use onebox_core::{EmailLabel, MessageFilter, NewAccount, Page};
use onebox_integrations::SearchRequest;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;
use config::AppConfig;

#[derive(Parser)]
#[command(name = "onebox")]
#[command(about = "Real-time IMAP ingestion with search, classification and alerts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow every account not in error until interrupted
    Run,

    /// Register a mailbox; the password is stored encrypted
    AddAccount {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = 993)]
        port: u16,
        #[arg(long)]
        username: String,
        #[arg(long, env = "ONEBOX_ACCOUNT_PASSWORD", hide_env_values = true)]
        password: String,
        /// Connect without TLS
        #[arg(long)]
        plain: bool,
    },

    ListAccounts,

    /// Follow a single account until interrupted, resuming it if it is in error
    SyncAccount { id: i64 },

    /// Replace an account's stored password
    SetPassword {
        id: i64,
        #[arg(long, env = "ONEBOX_ACCOUNT_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Delete an account together with its stored messages
    RemoveAccount { id: i64 },

    /// Full-text search over indexed messages
    Search {
        query: Option<String>,
        #[arg(long)]
        account: Option<i64>,
        #[arg(long)]
        folder: Option<String>,
        /// e.g. "Interested" or "Out of Office"
        #[arg(long)]
        label: Option<EmailLabel>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        size: u32,
    },

    /// Messages from the same account that read like the given one
    Similar {
        message_id: i64,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("onebox=info")))
        .init();

    let cli = Cli::parse();
    let app = App::open(AppConfig::from_env()?).await?;

    match cli.command {
        Commands::Run => {
            tracing::info!("Starting Onebox");
            app.run().await?;
        }
        Commands::AddAccount {
            name,
            host,
            port,
            username,
            password,
            plain,
        } => {
            let account = NewAccount {
                name,
                host,
                port,
                username,
                encrypted_password: String::new(),
                use_tls: !plain,
            };
            let id = app.add_account(account, &password).await?;
            println!("{}", id);
        }
        Commands::ListAccounts => {
            let accounts = app.database.list_accounts().await?;
            println!("{}", serde_json::to_string_pretty(&accounts)?);
        }
        Commands::SyncAccount { id } => {
            tracing::info!("Starting Onebox for account {}", id);
            app.sync_account(id).await?;
        }
        Commands::SetPassword { id, password } => {
            app.set_password(id, &password).await?;
        }
        Commands::RemoveAccount { id } => {
            app.remove_account(id).await?;
        }
        Commands::Search {
            query,
            account,
            folder,
            label,
            page,
            size,
        } => {
            let request = SearchRequest {
                query,
                filter: MessageFilter {
                    account_id: account,
                    folder,
                    label,
                    ..MessageFilter::default()
                },
                page: Page::new(page, size),
            };
            let results = app.search(&request).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Similar { message_id, limit } => {
            let hits = app.similar(message_id, limit).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
    }

    Ok(())
}
