use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use notifier_core::{EngineSettings, NotificationEngine, WsBackend};
use shared::{
    domain::{AppVisibility, Role, Session, SessionId, TopicId, UiContext},
    protocol::EngineEvent,
};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    backend_url: String,
    #[arg(long)]
    credential: String,
    #[arg(long, default_value = "agent")]
    role: String,
    #[arg(long)]
    identity_code: String,
    #[arg(long)]
    display_name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long, default_value = "sqlite://./data/notifier.db")]
    database_url: String,
    /// Topic treated as open on screen.
    #[arg(long)]
    viewing: Option<String>,
    #[arg(long)]
    background: bool,
    #[arg(long)]
    constrained_platform: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let role = Role::parse(&args.role).ok_or_else(|| anyhow!("unknown role '{}'", args.role))?;
    let storage = Storage::new(&args.database_url).await?;
    let backend = WsBackend::new(&args.backend_url)?;
    let engine = NotificationEngine::new(
        Arc::new(backend),
        Arc::new(storage),
        EngineSettings {
            constrained_platform: args.constrained_platform,
            ..EngineSettings::default()
        },
    );

    let session_id = SessionId::new(format!("cli-{}", std::process::id()));
    let mut events = engine.subscribe_events();
    let ui_context = UiContext {
        currently_viewed_topic_id: args.viewing.map(TopicId::new),
        app_visibility: if args.background {
            AppVisibility::Background
        } else {
            AppVisibility::Foreground
        },
        live_view: true,
    };
    engine
        .start_with_context(
            Session {
                session_id: session_id.clone(),
                role,
                identity_code: args.identity_code,
                display_name: args.display_name,
                email_address: args.email,
                credential: args.credential,
            },
            ui_context,
        )
        .await?;
    println!("Session {session_id} started; press Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = events.recv() => match received {
                Ok(EngineEvent::Qualifying(event)) => {
                    let unread = engine.get_unread_count(role, &event.event.topic_id).await?;
                    let sinks: Vec<String> = event
                        .sinks
                        .iter()
                        .map(|invocation| format!("{:?}", invocation.sink))
                        .collect();
                    let (title, body) = event
                        .sinks
                        .first()
                        .map(|invocation| (invocation.title.clone(), invocation.body.clone()))
                        .unwrap_or_default();
                    println!(
                        "[{}] {title}: {body} (sinks: {}; unread: {unread})",
                        event.event.topic_id,
                        sinks.join(", ")
                    );
                }
                Ok(EngineEvent::Disconnected { reason, .. }) => {
                    println!("Disconnected: {reason}");
                    break;
                }
                Ok(other) => println!("{}", serde_json::to_string(&other)?),
                Err(RecvError::Lagged(skipped)) => println!("Skipped {skipped} engine events."),
                Err(RecvError::Closed) => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}
