use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use notification_sync::api::NotificationsApi;
use notification_sync::http::UreqHttpClient;
use notification_sync::transport::TungsteniteTransportFactory;
use notification_sync::types::events::{Event, EventKind};
use notification_sync::types::CreateNotification;
use notification_sync::{ClientConfig, ConnectOutcome, NotificationSync, TokenSession};
use std::process::ExitCode;
use std::sync::Arc;

// Usage:
//   cargo run -- --token <jwt>                          # watch pushes (default)
//   cargo run -- --token <jwt> list
//   cargo run -- --token <jwt> create --user u1 --title Hi --message "..."
//   cargo run -- --token <jwt> mark-read <id>

#[derive(Parser, Debug)]
#[command(version, about = "Realtime notification client")]
struct Cli {
    /// Server base URL. Defaults to $NOTIFY_API_URL or http://localhost:5001.
    #[arg(long, short)]
    server: Option<String>,

    /// Access token presented to the REST API and the realtime channel.
    #[arg(long, short, env = "NOTIFY_TOKEN", hide_env_values = true)]
    token: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load notifications, then print pushes until Ctrl-C.
    Watch,
    /// Print the current list.
    List,
    /// Create a notification.
    Create {
        #[arg(long)]
        user: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        message: String,
    },
    /// Mark one notification as read.
    MarkRead { id: String },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match cli.server {
        Some(server) => ClientConfig::new(server),
        None => ClientConfig::from_env(),
    };
    let session = Arc::new(TokenSession::with_token(cli.token));
    let http = Arc::new(UreqHttpClient::new());

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(config, http, session).await,
        Command::List => {
            let api = NotificationsApi::new(config, http, session);
            for n in api.fetch_all().await? {
                let marker = if n.read { " " } else { "*" };
                println!("{marker} {} {} {}: {}", n.id, n.created_at, n.title, n.message);
            }
            Ok(())
        }
        Command::Create {
            user,
            title,
            message,
        } => {
            let api = NotificationsApi::new(config, http, session);
            let created = api
                .create(&CreateNotification {
                    user_id: user,
                    title,
                    message,
                })
                .await?;
            println!("{}", created.id);
            Ok(())
        }
        Command::MarkRead { id } => {
            let api = NotificationsApi::new(config, http, session);
            api.mark_read(&id).await?;
            Ok(())
        }
    }
}

async fn watch(
    config: ClientConfig,
    http: Arc<UreqHttpClient>,
    session: Arc<TokenSession>,
) -> anyhow::Result<()> {
    let sync = NotificationSync::new(
        config,
        Arc::new(TungsteniteTransportFactory::new()),
        http,
        session,
    );

    let events = sync.connection().events();
    let _status = events.subscribe(EventKind::Status, |event| {
        if let Event::StatusChanged(status) = event {
            info!("Connection status: {status}");
        }
        Ok(())
    });
    let _pushes = events.subscribe(EventKind::Notification, |event| {
        if let Event::NotificationReceived(n) = event {
            info!("New notification {}: {} - {}", n.id, n.title, n.message);
        }
        Ok(())
    });

    let outcome = sync.start().await?;
    if outcome == ConnectOutcome::GaveUp {
        warn!("Realtime channel unavailable, showing the fetched list only");
    }
    info!("{} unread of {}", sync.cache().unread_count(), sync.cache().len());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    sync.stop().await;
    Ok(())
}
