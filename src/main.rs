#![deny(dead_code)] // DO NOT REMOVE THIS EVER
use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

mod credentials;
mod utils;

use crate::credentials::{load_credentials, save_credentials, set_credentials_path, Credentials};
use huddle::config::{config_dir, ClientConfig};
use huddle::media::loopback::LoopbackEngine;
use huddle::models::{Conversation, ConversationKind, DeliveryStatus, Identity};
use huddle::realtime::{RealtimeSession, SessionEvent};
use huddle::store::MemoryStore;

/// Command line arguments for huddle
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "huddle: a terminal chat and call-signaling client.",
    long_about = "huddle connects to a relay, joins a conversation and lets you chat and place calls.\n\n\
    Commands once connected:\n\
    /join <room>   switch to another conversation\n\
    /call          call the current conversation\n\
    /accept        accept the incoming call\n\
    /reject        reject the incoming call\n\
    /hangup        end the current call\n\
    /quit          leave"
)]
struct Args {
    /// Relay websocket URL (overrides config and HUDDLE_RELAY_URL)
    #[arg(long, value_name = "URL")]
    relay: Option<String>,

    /// User id to sign in as
    #[arg(long)]
    user: Option<String>,

    /// Display name shown to others
    #[arg(long)]
    name: Option<String>,

    /// Bearer token for the relay handshake
    #[arg(long)]
    token: Option<String>,

    /// Conversation to open on start
    #[arg(long, default_value = "lobby")]
    room: String,

    /// Config file (defaults to <config dir>/huddle/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Cached identity file (defaults to <config dir>/huddle/identity.json)
    #[arg(long, value_name = "PATH")]
    identity_file: Option<PathBuf>,

    /// Log file (defaults to <config dir>/huddle/huddle.log)
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,
}

/// Flags first, then the cached identity, then ask
fn resolve_identity(args: &Args) -> Result<Identity> {
    let cached = load_credentials()?.map(Credentials::into_identity);

    let user_id = match (&args.user, &cached) {
        (Some(user), _) => user.clone(),
        (None, Some(identity)) => identity.user_id.clone(),
        (None, None) => format!("u-{}", uuid::Uuid::new_v4().simple()),
    };

    let display_name = match (&args.name, &cached) {
        (Some(name), _) => name.clone(),
        (None, Some(identity)) if identity.user_id == user_id => identity.display_name.clone(),
        _ => {
            let fallback = hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| user_id.clone());
            utils::prompt("Enter your display name", &fallback).unwrap_or(fallback)
        }
    };

    let mut identity = Identity::new(user_id, display_name);
    identity.token = args
        .token
        .clone()
        .or_else(|| cached.and_then(|c| c.token));
    Ok(identity)
}

fn ad_hoc_conversation(room: &str, identity: &Identity) -> Conversation {
    Conversation {
        id: room.to_string(),
        kind: ConversationKind::Group,
        participants: vec![identity.user_id.clone()],
        title: room.to_string(),
        avatar: None,
        last_message_id: None,
        last_message_preview: None,
        unread: 0,
    }
}

fn print_event(event: &SessionEvent, me: &str) {
    match event {
        SessionEvent::Connection(status) => println!("* connection {:?}", status),
        SessionEvent::MessageAppended(m) => {
            let marker = if m.delivery_status == DeliveryStatus::Pending { " (sending)" } else { "" };
            println!("[{}] {}: {}{}", m.conversation_id, m.sender_name, m.content, marker);
        }
        SessionEvent::MessageUpdated(m) => match m.delivery_status {
            DeliveryStatus::Failed => println!("! message \"{}\" was not sent", m.content),
            DeliveryStatus::Sent if m.sender_id == me => println!("  (delivered)"),
            _ => {}
        },
        SessionEvent::ConversationUpdated(c) if c.unread > 0 => {
            println!("* {} has {} unread", c.title, c.unread)
        }
        SessionEvent::ConversationUpdated(_) => {}
        SessionEvent::HistoryLoaded { room_id, messages } => {
            println!("* now in {} ({} earlier messages)", room_id, messages.len());
            for m in messages {
                println!("[{}] {}: {}", room_id, m.sender_name, m.content);
            }
        }
        SessionEvent::TypingChanged { room_id, users } if users.is_empty() => {
            println!("* nobody is typing in {}", room_id)
        }
        SessionEvent::TypingChanged { room_id, users } => {
            println!("* {} typing in {}", users.join(", "), room_id)
        }
        SessionEvent::IncomingCall { room_id, caller_name } => {
            println!("* {} is calling in {} (/accept or /reject)", caller_name, room_id)
        }
        SessionEvent::CallStateChanged { room_id, state } => println!("* call in {} is {}", room_id, state),
        SessionEvent::CallEnded { room_id, reason } => println!("* call in {} ended ({:?})", room_id, reason),
        SessionEvent::CallFailed { room_id, error } => println!("! call in {} failed: {}", room_id, error),
        SessionEvent::PeerStateChanged { room_id, state } => println!("* media in {} {:?}", room_id, state),
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<SessionEvent>, me: String) {
    while let Some(event) = events.recv().await {
        print_event(&event, &me);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file_path = match &args.log_file {
        Some(path) => path.clone(),
        None => config_dir()?.join("huddle.log"),
    };
    utils::setup_logging(Some(&log_file_path), LevelFilter::Debug)?;
    info!("huddle starting up");
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(path) = &args.identity_file {
        set_credentials_path(path.clone());
    }

    let mut config = match &args.config {
        Some(path) => {
            let mut config = ClientConfig::load_from(path)?;
            config.apply_env_with(|key| std::env::var(key).ok());
            config
        }
        None => ClientConfig::load()?,
    };
    if let Some(relay) = &args.relay {
        config.relay_url = relay.clone();
    }

    let identity = resolve_identity(&args)?;
    println!("Connecting to {} as {}... please wait...", config.relay_url, identity.display_name);

    let store = MemoryStore::new();
    store.insert_conversation(ad_hoc_conversation(&args.room, &identity)).await;
    let engine = Arc::new(LoopbackEngine::new());

    let (session, events) =
        match RealtimeSession::connect(&config, identity.clone(), engine, Arc::new(store.clone())).await {
            Ok(connected) => connected,
            Err(e) => {
                error!("Connection to relay failed: {}", e);
                eprintln!(
                    "Failed to connect to {}\nDetails: {}\nIs the relay running (huddle-relay)?",
                    config.relay_url, e
                );
                return Err(e.into());
            }
        };

    if let Err(e) = save_credentials(&Credentials::new(&identity)) {
        warn!("Failed to save identity: {}", e);
    }

    tokio::spawn(print_events(events, identity.user_id.clone()));

    session.load_conversations().await?;
    let mut room = args.room.clone();
    session.select_conversation(&room).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let outcome = match command {
            "" => continue,
            "/quit" => break,
            "/join" if !rest.trim().is_empty() => {
                let next = rest.trim().to_string();
                store.insert_conversation(ad_hoc_conversation(&next, &identity)).await;
                session.load_conversations().await?;
                match session.select_conversation(&next).await {
                    Ok(_) => {
                        room = next;
                        Ok(())
                    }
                    Err(e) => Err(anyhow::Error::from(e)),
                }
            }
            // Media acquisition can wait on a permission prompt; keep reading input meanwhile
            "/call" | "/accept" => {
                let session = session.clone();
                let room = room.clone();
                let accept = command == "/accept";
                tokio::spawn(async move {
                    let result = if accept {
                        session.accept_call(&room).await
                    } else {
                        session.start_call(&room).await
                    };
                    if let Err(e) = result {
                        println!("! {}", e);
                    }
                });
                Ok(())
            }
            "/reject" => session.reject_call(&room).await.map_err(Into::into),
            "/hangup" => session.hang_up(&room).await.map_err(Into::into),
            _ if command.starts_with('/') => {
                println!("Unknown command {}", command);
                Ok(())
            }
            _ => session.send_message(&room, line).await.map(|_| ()).map_err(Into::into),
        };
        if let Err(e) = outcome {
            warn!("Command {:?} failed: {}", line, e);
            println!("! {}", e);
        }
    }

    info!("Shutting down");
    session.shutdown().await;
    Ok(())
}
