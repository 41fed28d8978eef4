use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::EnvFilter;

use transparency_chat::cli::{resolve_model, Args};
use transparency_chat::events::EventLogger;
use transparency_chat::session::new_session_store;
use transparency_chat::web::{self, App};
use transparency_chat::CompletionClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let model = resolve_model(&args.provider, &args.model);

    // A missing credential must fail here, before any participant can load
    // the page and lose a session to a dead chat backend.
    let client = match CompletionClient::new(args.provider, model.clone()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("{}", format!("  {e}").bright_red());
            std::process::exit(1);
        }
    };

    eprintln!(
        "{}",
        format!("  Provider: {} — model: {}", args.provider, model).bright_cyan()
    );

    let app = Arc::new(App {
        store: new_session_store(),
        logger: EventLogger::new(&args.events_path),
        client,
        targets: args.link_targets(),
        admin_password: args.admin_password.clone(),
    });

    web::serve(&args.bind, args.port, app).await
}
