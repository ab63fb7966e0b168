//! Courier CLI
//!
//! Thin wrapper around courier-core for inspecting and driving the local
//! message store. No transport is attached: messages are queued and planned,
//! never delivered.
//!
//! ## Usage
//!
//! ```bash
//! # Set our identity and server
//! courier init me@example.org --server example.org
//!
//! # Queue a text message
//! courier send bob@example.org "Hello!"
//!
//! # Show what is waiting to go out
//! courier queue list
//!
//! # Plan a resend scan
//! courier queue scan
//!
//! # Create a group
//! courier group create trip@example.org alice@example.org bob@example.org --subject Trip
//!
//! # Add an address book entry
//! courier contact add "+1 555 0100" --name Alice
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier_core::queue::{Dispatch, NoopNotifier, ScanOptions};
use courier_core::storage::{ContactStore, GroupStore, MessageQuery, MessageStore, ThreadStore};
use courier_core::types::{
    AddressBookEntry, Direction, Identity, Message, MessageId, MessageStatus,
};
use courier_core::{CourierConfig, EventBus, MessageQueue, PlaintextCrypto, RedbRepository};

const CONFIG_FILE: &str = "config.json";
const DATABASE_FILE: &str = "courier.redb";

/// Courier - secure messaging queue
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - outbound message queue and contact store")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.courier/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Print JSON instead of text where supported
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the client configuration
    Init {
        /// Our own identity
        identity: String,
        /// Server endpoint
        #[arg(short, long)]
        server: Option<String>,
        /// Do not flag outgoing messages for encryption
        #[arg(long)]
        no_encryption: bool,
    },

    /// Show configuration and store statistics
    Info,

    /// Queue a text message to a peer
    Send {
        /// Recipient identity
        peer: String,
        /// Message text
        text: String,
    },

    /// Outbound queue management
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Conversation threads
    Thread {
        #[command(subcommand)]
        action: ThreadAction,
    },

    /// Group management
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Address book and synced contacts
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List outbound messages that are not yet delivered
    List {
        /// Include sent and delivered messages
        #[arg(long)]
        all: bool,
    },
    /// Reset a message to sending and resend everything pending for its peer
    Retry {
        /// Message id
        id: i64,
    },
    /// Release every message held for review
    RetryAll,
    /// Run a resend scan and print its plan
    Scan {
        /// Only messages to this peer
        #[arg(long)]
        peer: Option<String>,
        /// Include messages held for review
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ThreadAction {
    /// List threads
    List,
    /// Show the messages of a thread
    Show {
        /// Peer or group identity
        peer: String,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Create a group and queue its create command
    Create {
        /// Group identity
        group: String,
        /// Member identities
        members: Vec<String>,
        /// Group subject
        #[arg(short, long)]
        subject: Option<String>,
    },
    /// Add members to a group
    Add {
        group: String,
        members: Vec<String>,
    },
    /// Remove members from a group
    Remove {
        group: String,
        members: Vec<String>,
    },
    /// Leave a group
    Leave { group: String },
    /// List groups
    List,
}

#[derive(Subcommand)]
enum ContactAction {
    /// Add a local address book entry
    Add {
        /// Phone number
        number: String,
        /// Display name
        #[arg(short, long)]
        name: Option<String>,
        /// Lookup key (default: the number)
        #[arg(long)]
        lookup_key: Option<String>,
    },
    /// List address book entries
    Book,
    /// List synced contacts
    List,
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.courier/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
        .join("data")
}

fn load_config(data_dir: &Path) -> Result<CourierConfig> {
    let path = data_dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(CourierConfig::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn save_config(data_dir: &Path, config: &CourierConfig) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    let path = data_dir.join(CONFIG_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("writing {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn identities(raw: &[String]) -> Vec<Identity> {
    raw.iter().map(Identity::new).collect()
}

/// Outgoing bodies stay plaintext until they are handed to the transport
fn preview(message: &Message) -> String {
    let plain = message.direction == Direction::Outgoing
        && message.group_command.is_none()
        && message.attachment.is_none()
        && message.location.is_none();
    match message.text() {
        Some(text) if plain => text.to_string(),
        _ => message.snippet(),
    }
}

fn short(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max.saturating_sub(1)).collect();
    cut.push('…');
    cut
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    if let Commands::Init {
        identity,
        server,
        no_encryption,
    } = &cli.command
    {
        let mut config = load_config(&data_dir)?;
        config.self_identity = Some(Identity::new(identity));
        config.endpoint_server = server.clone();
        config.encryption_enabled = !no_encryption;
        save_config(&data_dir, &config)?;
        println!(
            "Configuration written to {}",
            data_dir.join(CONFIG_FILE).display()
        );
        return Ok(());
    }

    let config = load_config(&data_dir)?;
    let repo = Arc::new(RedbRepository::open(data_dir.join(DATABASE_FILE))?);
    let bus = EventBus::new();
    let (queue, _triggers) = MessageQueue::spawn(
        repo.clone(),
        bus,
        Arc::new(PlaintextCrypto),
        Arc::new(NoopNotifier),
        config.clone(),
    );

    match cli.command {
        Commands::Init { .. } => {}

        Commands::Info => {
            let outgoing = repo.query_messages(&MessageQuery::outgoing())?;
            let waiting = outgoing
                .iter()
                .filter(|m| !m.status.is_acknowledged())
                .count();

            println!("Courier v0.1.0");
            println!();
            println!("Identity:");
            match &config.self_identity {
                Some(identity) => println!("  Self: {}", identity),
                None => println!("  Self: (not configured, run `courier init`)"),
            }
            match &config.endpoint_server {
                Some(server) => println!("  Server: {}", server),
                None => println!("  Server: (none)"),
            }
            println!();
            println!("Data directory: {}", data_dir.display());
            println!("Threads: {}", repo.threads()?.len());
            println!("Groups: {}", repo.groups()?.len());
            println!("Outgoing messages: {} ({} waiting)", outgoing.len(), waiting);
            println!("Synced contacts: {}", repo.contacts()?.len());
            if repo.is_resync_pending()? {
                println!("Contact sync: interrupted, will resync");
            }
        }

        Commands::Send { peer, text } => {
            let peer = Identity::new(&peer);
            let thread = repo.ensure_thread(&peer, false)?;
            let id = queue.send_text(thread.id, text, None).await?;
            let status = repo
                .message(id)?
                .map(|m| m.status)
                .unwrap_or(MessageStatus::Sending);
            println!("Queued message {} to {} ({})", id, peer, status);
        }

        Commands::Queue { action } => match action {
            QueueAction::List { all } => {
                let messages: Vec<_> = repo
                    .query_messages(&MessageQuery::outgoing())?
                    .into_iter()
                    .filter(|m| all || !m.status.is_acknowledged())
                    .collect();
                if cli.json {
                    print_json(&messages)?;
                } else if messages.is_empty() {
                    println!("Queue is empty");
                } else {
                    for m in &messages {
                        println!(
                            "{:>6}  {:<14} {:<32} {}",
                            m.id,
                            m.status,
                            m.peer,
                            short(&preview(m), 40)
                        );
                    }
                }
            }
            QueueAction::Retry { id } => {
                let count = queue.retry_message(MessageId(id)).await?;
                println!("Retried {} message(s)", count);
            }
            QueueAction::RetryAll => {
                let count = queue.retry_all().await?;
                println!("Released {} message(s)", count);
            }
            QueueAction::Scan { peer, force } => {
                let mut options = match peer {
                    Some(peer) => ScanOptions::for_peer(Identity::new(&peer)),
                    None => ScanOptions::default(),
                };
                options.force_pending = force;
                let plan = queue.resend(options).await?;
                if cli.json {
                    let dispatch: Vec<_> = plan
                        .dispatch
                        .iter()
                        .map(|d| match d {
                            Dispatch::Send(id) => serde_json::json!({"send": id.0}),
                            Dispatch::Upload(id) => serde_json::json!({"upload": id.0}),
                        })
                        .collect();
                    let skipped: Vec<_> = plan
                        .skipped
                        .iter()
                        .map(|(id, reason)| {
                            serde_json::json!({"id": id.0, "reason": format!("{:?}", reason)})
                        })
                        .collect();
                    let deleted: Vec<i64> = plan.delete.iter().map(|id| id.0).collect();
                    print_json(&serde_json::json!({
                        "dispatch": dispatch,
                        "skipped": skipped,
                        "deleted": deleted,
                    }))?;
                } else {
                    println!("Dispatched: {}", plan.dispatch.len());
                    for d in &plan.dispatch {
                        match d {
                            Dispatch::Send(id) => println!("  send    {}", id),
                            Dispatch::Upload(id) => println!("  upload  {}", id),
                        }
                    }
                    println!("Skipped: {}", plan.skipped.len());
                    for (id, reason) in &plan.skipped {
                        println!("  {:<7} {:?}", id, reason);
                    }
                    println!("Deleted: {}", plan.delete.len());
                }
            }
        },

        Commands::Thread { action } => match action {
            ThreadAction::List => {
                let threads = repo.threads()?;
                if cli.json {
                    print_json(&threads)?;
                } else if threads.is_empty() {
                    println!("No threads");
                } else {
                    for t in &threads {
                        let snippet = t
                            .last_message
                            .as_ref()
                            .map(|s| short(&s.snippet, 40))
                            .unwrap_or_default();
                        let kind = if t.is_group { "group" } else { "chat" };
                        println!(
                            "{:>4}  {:<5} {:<32} {:>4}  {}",
                            t.id, kind, t.peer, t.message_count, snippet
                        );
                    }
                }
            }
            ThreadAction::Show { peer } => {
                let peer = Identity::new(&peer);
                let Some(thread) = repo.thread_for_peer(&peer)? else {
                    bail!("No thread with {}", peer);
                };
                let messages = repo.query_messages(&MessageQuery::default().in_thread(thread.id))?;
                if cli.json {
                    print_json(&messages)?;
                } else {
                    for m in &messages {
                        let arrow = match m.direction {
                            Direction::Incoming => "<-",
                            Direction::Outgoing => "->",
                        };
                        println!("{:>6} {} [{}] {}", m.id, arrow, m.status, preview(m));
                    }
                }
            }
        },

        Commands::Group { action } => match action {
            GroupAction::Create {
                group,
                members,
                subject,
            } => {
                if config.self_identity.is_none() {
                    bail!("Self identity not configured, run `courier init` first");
                }
                let group = Identity::new(&group);
                let id = queue
                    .create_group(group.clone(), identities(&members), subject)
                    .await?;
                println!("Created group {} (command message {})", group, id);
            }
            GroupAction::Add { group, members } => {
                let id = queue
                    .add_group_members(Identity::new(&group), identities(&members))
                    .await?;
                println!("Queued add command {}", id);
            }
            GroupAction::Remove { group, members } => {
                let id = queue
                    .remove_group_members(Identity::new(&group), identities(&members))
                    .await?;
                println!("Queued remove command {}", id);
            }
            GroupAction::Leave { group } => {
                let id = queue.leave_group(Identity::new(&group)).await?;
                println!("Queued part command {}", id);
            }
            GroupAction::List => {
                let groups = repo.groups()?;
                if cli.json {
                    print_json(&groups)?;
                } else if groups.is_empty() {
                    println!("No groups");
                } else {
                    for g in &groups {
                        println!(
                            "{:<32} {:<20} members: {}",
                            g.id,
                            g.subject.as_deref().unwrap_or("-"),
                            g.live_members().len()
                        );
                    }
                }
            }
        },

        Commands::Contact { action } => match action {
            ContactAction::Add {
                number,
                name,
                lookup_key,
            } => {
                let entry = AddressBookEntry {
                    lookup_key: lookup_key.unwrap_or_else(|| number.clone()),
                    number,
                    display_name: name,
                };
                repo.add_address_book_entry(&entry)?;
                println!("Added {} to the address book", entry.number);
            }
            ContactAction::Book => {
                let entries = repo.sync_candidates()?;
                if cli.json {
                    print_json(&entries)?;
                } else {
                    for e in &entries {
                        println!(
                            "{:<20} {:<20} {}",
                            e.number,
                            e.display_name.as_deref().unwrap_or("-"),
                            e.lookup_key
                        );
                    }
                }
            }
            ContactAction::List => {
                let contacts = repo.contacts()?;
                if cli.json {
                    print_json(&contacts)?;
                } else if contacts.is_empty() {
                    println!("No synced contacts");
                } else {
                    for c in &contacts {
                        let blocked = if c.blocked { " (blocked)" } else { "" };
                        println!(
                            "{:<24} {:<44} {}{}",
                            c.display_name, c.identity, c.number, blocked
                        );
                    }
                }
            }
        },
    }

    queue.shutdown();
    Ok(())
}
