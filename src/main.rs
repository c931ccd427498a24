use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

mod book;
mod client;
mod completion;
mod conversation;
mod error;
mod models;
mod repl;
mod server;
mod settings;
mod storage;

use crate::book::NewBook;
use crate::client::{HttpBookLookup, HttpChatCompletion};
use crate::conversation::ConversationSession;
use crate::models::OpenAICompatible;
use crate::settings::{GlobalConfigDefaults, SessionSettings};
use crate::storage::{BookRepository, SqliteBookRepository};

#[derive(Debug, Parser)]
#[command(name = "bookchat")]
#[command(about = "Book catalog with a per-book conversational assistant", long_about = None)]
struct Cli {
    /// SQLite URL for the catalog; defaults to the XDG data dir.
    #[arg(long, global = true, env = "BOOKCHAT_DATABASE_URL")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the catalog, chat and conversation endpoints.
    Serve {
        #[arg(long, default_value = "127.0.0.1:7171")]
        listen: String,
    },
    /// Chat about a book with a running server.
    Chat {
        book_id: String,
        #[arg(long, default_value = "http://127.0.0.1:7171")]
        server: String,
        #[arg(long)]
        name: Option<String>,
        /// Model for this conversation; the server's default otherwise.
        #[arg(long)]
        model: Option<String>,
    },
    AddBook {
        #[arg(long)]
        name: String,
        #[arg(long)]
        author: String,
        #[arg(long)]
        isbn: String,
        #[arg(long, default_value_t = 0.0)]
        price: f64,
        #[arg(long, default_value_t = 0)]
        quantity: i64,
        #[arg(long, default_value = "")]
        description: String,
    },
    ListBooks {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { listen } => {
            let addr: SocketAddr = listen.parse()?;
            let repo = SqliteBookRepository::initialize(cli.database_url).await?;
            let model = OpenAICompatible::from_env();
            if model.api_key.is_none() {
                warn!("no API key configured; chat replies will fall back to the error message");
            }
            let mut state = server::AppState::new(repo, Arc::new(model), GlobalConfigDefaults::from_env());
            match PrometheusBuilder::new().install_recorder() {
                Ok(handle) => state = state.with_metrics(handle),
                Err(e) => warn!(error = %e, "metrics recorder not installed"),
            }
            server::serve(addr, state).await?;
        }
        Commands::Chat { book_id, server, name, model } => {
            let settings = SessionSettings { display_name: name, default_model: model, model_params: None };
            let session = ConversationSession::new(
                book_id,
                Arc::new(HttpBookLookup::new(&server)?),
                Arc::new(HttpChatCompletion::new(&server)?),
            )
            .with_settings(settings);
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            repl::ChatRepl::new(&session).run(stdin, tokio::io::stdout()).await?;
        }
        Commands::AddBook { name, author, isbn, price, quantity, description } => {
            let repo = SqliteBookRepository::initialize(cli.database_url).await?;
            let book = repo
                .add_book(NewBook { book_name: name, author_name: author, isbn, price, quantity, description })
                .await?;
            info!(book_id = book.id, "book added");
            println!("{}", serde_json::to_string_pretty(&book)?);
        }
        Commands::ListBooks { page } => {
            let repo = SqliteBookRepository::initialize(cli.database_url).await?;
            let page = repo.list_books(page).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_and_chat_parse() {
        let cli = Cli::try_parse_from(["bookchat", "serve", "--listen", "0.0.0.0:8000"]).unwrap();
        assert!(matches!(cli.command, Commands::Serve { ref listen } if listen == "0.0.0.0:8000"));

        let cli = Cli::try_parse_from(["bookchat", "chat", "7", "--name", "Ada", "--model", "m"]).unwrap();
        match cli.command {
            Commands::Chat { book_id, name, model, .. } => {
                assert_eq!(book_id, "7");
                assert_eq!(name.as_deref(), Some("Ada"));
                assert_eq!(model.as_deref(), Some("m"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(Cli::try_parse_from(["bookchat", "start"]).is_err());
    }
}
