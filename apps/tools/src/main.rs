use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use shared::domain::{Role, TopicId};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/notifier.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lists non-zero unread counters for a role.
    List { role: String },
    Get { role: String, topic_id: String },
    MarkRead { role: String, topic_id: String },
}

fn parse_role(raw: &str) -> Result<Role> {
    Role::parse(raw).ok_or_else(|| anyhow!("unknown role '{raw}' (expected customer, agent or admin)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::List { role } => {
            let role = parse_role(&role)?;
            let entries = storage.list_unread(role).await?;
            if entries.is_empty() {
                println!("no unread topics for role={role}");
            }
            for entry in entries {
                println!("{}\t{}", entry.topic_id, entry.count);
            }
        }
        Command::Get { role, topic_id } => {
            let role = parse_role(&role)?;
            let count = storage.unread_count(role, &TopicId::new(topic_id)).await?;
            println!("{count}");
        }
        Command::MarkRead { role, topic_id } => {
            let role = parse_role(&role)?;
            storage.mark_read(role, &TopicId::new(topic_id.clone())).await?;
            println!("marked role={role} topic_id={topic_id} read");
        }
    }

    Ok(())
}
