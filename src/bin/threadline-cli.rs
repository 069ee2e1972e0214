use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use threadline::{
    ConnectionState, LocalUser, SendReceipt, Threadline, ThreadlineConfig, ThreadView,
};

/// Command line client for a Threadline messaging backend
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Id of the user to log in as
    #[clap(long, value_name = "ID", required = true)]
    user_id: String,

    /// Display name of the user
    #[clap(long, value_name = "NAME", default_value = "")]
    name: String,

    /// Only list conversations whose peer name starts with this text
    #[clap(long, value_name = "TEXT", default_value = "")]
    filter: String,

    /// Peer whose conversation should be opened
    #[clap(long, value_name = "ID")]
    peer: Option<String>,

    /// Message to send to `--peer`
    #[clap(long, value_name = "TEXT", requires = "peer")]
    message: Option<String>,

    /// Overrides THREADLINE_LOGS_DIR
    #[clap(long, value_name = "PATH")]
    logs_dir: Option<PathBuf>,

    /// Seconds to wait for the live connection before sending
    #[clap(long, value_name = "SECS", default_value_t = 5)]
    connect_timeout: u64,
}

fn print_thread(thread: &ThreadView) {
    println!("--- {} ({}) ---", thread.peer.name, thread.peer.id);
    for message in thread.messages.iter() {
        println!(
            "[{}] {} -> {}: {}",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.sender_id,
            message.receiver_id,
            message.summary()
        );
    }
    for echo in &thread.echoes {
        let marker = if echo.is_failed() { "not sent" } else { "sending" };
        println!("[{}] {}", marker, echo.content);
    }
}

async fn wait_until_connected(threadline: &Threadline, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        while threadline.connection_state() != ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ThreadlineConfig::from_env().context("Invalid configuration")?;
    if let Some(logs_dir) = &args.logs_dir {
        config = ThreadlineConfig {
            logs_dir: ThreadlineConfig::new(&config.api_base_url, &config.socket_url, logs_dir)
                .logs_dir,
            ..config
        };
    }

    let threadline = match Threadline::from_config(config) {
        Ok(threadline) => threadline,
        Err(err) => {
            eprintln!("Failed to initialize Threadline: {}", err);
            std::process::exit(1);
        }
    };

    let user = LocalUser::new(args.user_id.clone(), args.name.clone());
    if let Err(err) = threadline.login(user).await {
        eprintln!("Could not load conversations: {}", err);
    }

    for summary in threadline.list_conversations(&args.filter).await? {
        println!(
            "{:<24} {:<20} {}",
            summary.peer.id, summary.peer.name, summary.last_message_summary
        );
    }

    if let Some(peer) = &args.peer {
        let thread = threadline
            .open_conversation(peer)
            .await
            .with_context(|| format!("Failed to open conversation with {}", peer))?;
        print_thread(&thread);

        if let Some(text) = &args.message {
            if !wait_until_connected(&threadline, Duration::from_secs(args.connect_timeout)).await {
                println!("Live connection not ready, sending over HTTP");
            }
            match threadline.send_message(peer, text, None).await? {
                SendReceipt::Queued(echo) => println!("Queued {}", echo.local_id),
                SendReceipt::Delivered(message) => println!("Delivered {}", message.id),
            }
            // Give the acknowledgment a moment to arrive
            tokio::time::sleep(Duration::from_millis(500)).await;
            if let Some(thread) = threadline.current_thread().await? {
                print_thread(&thread);
            }
        }
    }

    threadline.logout().await;
    Ok(())
}
