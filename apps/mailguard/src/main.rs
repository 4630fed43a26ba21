use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use mailguard_sdk::{CurrentUser, MailboxRecord, MailguardClient};
use mailguard_session::{
    project, restore_registry, summarize, ChannelNotifier, CheckpointConfig, Checkpointer,
    ConnectionManager, ConnectionParams, FileSnapshotStore, MailboxSessionKey, MailboxStatusView,
    ManagerConfig, Notice, NoticeLevel, Reconciler, SnapshotStore, SyncReport,
};
use time::format_description::well_known::Rfc3339;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use transport_bus::{StompConfig, StompConnector};

mod telemetry;

#[derive(Debug, Clone)]
struct AppConfig {
    api_url: String,
    ws_url: String,
    token: String,
    state_file: PathBuf,
    checkpoint: CheckpointConfig,
    manager: ManagerConfig,
}

#[derive(Debug, Parser)]
#[command(
    name = "mailguard",
    author,
    version,
    about = "Start, watch and stop remote mailbox scans"
)]
struct Cli {
    /// Base URL of the mailguard REST API.
    #[arg(long, env = "MAILGUARD_API_URL", default_value = "http://localhost:8080")]
    api_url: String,

    /// WebSocket endpoint of the scanning backend.
    #[arg(long, env = "MAILGUARD_WS_URL", default_value = "ws://localhost:8080/ws")]
    ws_url: String,

    /// Bearer token used for both the API and the scanning connection.
    #[arg(long, env = "MAILGUARD_TOKEN", hide_env_values = true)]
    token: String,

    /// Where cached scanning status is kept between runs.
    #[arg(
        long,
        env = "MAILGUARD_STATE_FILE",
        default_value = "mailguard-sessions.json"
    )]
    state_file: PathBuf,

    /// Quiet period before a status change is written to the state file.
    #[arg(long, env = "MAILGUARD_CHECKPOINT_DEBOUNCE_MS", default_value_t = 500)]
    checkpoint_debounce_ms: u64,

    /// How long the backend has to acknowledge a scan request.
    #[arg(long, env = "MAILGUARD_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    handshake_timeout_secs: u64,

    /// Upper bound on closing a connection when a scan stops.
    #[arg(long, env = "MAILGUARD_TEARDOWN_TIMEOUT_SECS", default_value_t = 2)]
    teardown_timeout_secs: u64,

    /// Print the session counters in Prometheus text format on exit.
    #[arg(long, env = "MAILGUARD_DUMP_METRICS", default_value_t = false)]
    dump_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Show the scanning status of every registered mailbox.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Start scans and print notifications until interrupted.
    Watch {
        /// Restrict to these addresses; defaults to every registered mailbox.
        #[arg(long = "mailbox")]
        mailboxes: Vec<String>,
    },
    /// Stop every scan, save status and end the API session.
    Logout,
}

impl TryFrom<&Cli> for AppConfig {
    type Error = anyhow::Error;

    fn try_from(cli: &Cli) -> Result<Self, Self::Error> {
        if cli.token.trim().is_empty() {
            bail!("an API token is required");
        }
        if !(cli.ws_url.starts_with("ws://") || cli.ws_url.starts_with("wss://")) {
            bail!("invalid websocket url: {}", cli.ws_url);
        }
        if cli.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be greater than zero");
        }
        Ok(AppConfig {
            api_url: cli.api_url.clone(),
            ws_url: cli.ws_url.clone(),
            token: cli.token.clone(),
            state_file: cli.state_file.clone(),
            checkpoint: CheckpointConfig {
                debounce: Duration::from_millis(cli.checkpoint_debounce_ms),
            },
            manager: ManagerConfig {
                handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
                teardown_timeout: Duration::from_secs(cli.teardown_timeout_secs),
                ..ManagerConfig::default()
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = telemetry::Telemetry::init()?;

    let cli = Cli::parse();
    let config = AppConfig::try_from(&cli)?;
    info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        state_file = %config.state_file.display(),
        "starting mailguard"
    );

    let app = App::start(config).await?;
    let result = match cli.command {
        Command::Status { json } => app.status(json).await,
        Command::Watch { mailboxes } => app.watch(mailboxes).await,
        Command::Logout => app.logout().await,
    };

    if cli.dump_metrics {
        eprintln!("{}", telemetry.render_metrics());
    }
    result
}

struct App {
    client: MailguardClient,
    user: CurrentUser,
    manager: ConnectionManager,
    reconciler: Reconciler,
    checkpointer: Checkpointer,
    notices: mpsc::UnboundedReceiver<Notice>,
}

impl App {
    async fn start(config: AppConfig) -> Result<Self> {
        let client = MailguardClient::new(&config.api_url, &config.token);
        let user = client
            .current_user()
            .await
            .context("failed to fetch the current user")?;

        let store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(&config.state_file));
        let registry = restore_registry(store.as_ref()).await;

        let connector = StompConnector::new(
            StompConfig::new(&config.ws_url).with_bearer_token(&config.token),
        );
        let (notifier, notices) = ChannelNotifier::new();
        let manager = ConnectionManager::new(
            Arc::new(connector),
            registry.clone(),
            Arc::new(notifier),
            config.manager,
        );
        let reconciler = Reconciler::new(Arc::new(client.clone()), manager.clone());
        let checkpointer = Checkpointer::new(registry, store, config.checkpoint);

        Ok(Self {
            client,
            user,
            manager,
            reconciler,
            checkpointer,
            notices,
        })
    }

    /// Confirms cached status against the server. A failed fetch keeps the
    /// cached values.
    async fn synchronize(&self) -> Option<SyncReport> {
        self.reconciler.synchronize(&self.user.id).await.ok()
    }

    async fn views(&self) -> Result<(Vec<MailboxRecord>, Vec<MailboxStatusView>)> {
        let mailboxes = self
            .client
            .list_mailboxes(&self.user.id)
            .await
            .context("failed to list mailboxes")?;
        let views = project(&mailboxes, &self.user.id, self.manager.registry());
        Ok((mailboxes, views))
    }

    async fn status(self, json: bool) -> Result<()> {
        self.synchronize().await;
        let (_, views) = self.views().await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&views)?);
        } else {
            print_views(&views);
        }
        self.checkpointer
            .flush()
            .await
            .context("failed to write session state")
    }

    async fn watch(mut self, only: Vec<String>) -> Result<()> {
        let report = self.synchronize().await;
        let (mailboxes, _) = self.views().await?;
        let selected = select_mailboxes(&mailboxes, &only);
        if selected.is_empty() {
            bail!("no matching mailboxes to scan");
        }
        if let Some(report) = report {
            let reattaching = resumable_among(&report, &selected);
            if reattaching > 0 {
                info!(
                    resumable = reattaching,
                    "server reports scans without a local connection; reattaching"
                );
            }
        }

        let checkpoints = self.checkpointer.spawn();
        join_all(selected.iter().map(|mailbox| {
            let key = MailboxSessionKey::new(mailbox.email_address.clone(), self.user.id.clone());
            self.manager
                .start_scan(key, ConnectionParams::from_mailbox(mailbox))
        }))
        .await;

        let shutdown = signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                notice = self.notices.recv() => match notice {
                    Some(notice) => print_notice(&notice),
                    None => break,
                },
                res = &mut shutdown => {
                    if let Err(err) = res {
                        warn!(error = %err, "failed to listen for ctrl-c");
                    }
                    break;
                }
            }
        }

        info!("stopping scans");
        self.manager.stop_all(&self.user.id).await;
        self.manager.shutdown().await;
        checkpoints.stop().await;
        self.checkpointer
            .flush()
            .await
            .context("failed to write session state")?;
        let (_, views) = self.views().await?;
        print_views(&views);
        Ok(())
    }

    async fn logout(self) -> Result<()> {
        self.manager.stop_all(&self.user.id).await;
        self.manager.shutdown().await;
        self.checkpointer
            .flush()
            .await
            .context("failed to write session state")?;
        self.client.logout().await.context("logout failed")?;
        println!("logged out");
        Ok(())
    }
}

/// Resumable sessions that this run is about to restart.
fn resumable_among(report: &SyncReport, selected: &[&MailboxRecord]) -> usize {
    report
        .resumable
        .iter()
        .filter(|key| {
            selected
                .iter()
                .any(|mailbox| mailbox.email_address == key.email)
        })
        .count()
}

fn select_mailboxes<'a>(mailboxes: &'a [MailboxRecord], only: &[String]) -> Vec<&'a MailboxRecord> {
    if only.is_empty() {
        return mailboxes.iter().collect();
    }
    let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
    let known: BTreeSet<&str> = mailboxes
        .iter()
        .map(|mailbox| mailbox.email_address.as_str())
        .collect();
    for missing in wanted.difference(&known) {
        warn!(email = %missing, "mailbox is not registered; skipping");
    }
    mailboxes
        .iter()
        .filter(|mailbox| wanted.contains(mailbox.email_address.as_str()))
        .collect()
}

fn print_views(views: &[MailboxStatusView]) {
    println!(
        "{:<36} {:<8} {:>8} {:>8}  {}",
        "MAILBOX", "STATE", "SCANNED", "THREATS", "LAST SCAN"
    );
    for view in views {
        let last_scan = view
            .last_scan
            .and_then(|ts| ts.format(&Rfc3339).ok())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36} {:<8} {:>8} {:>8}  {}",
            view.email_address,
            view.state.label(),
            view.emails_scanned,
            view.threats_found,
            last_scan
        );
    }
    let summary = summarize(views);
    println!(
        "{} mailboxes, {} scanning, {} emails scanned, {} threats found",
        summary.mailboxes, summary.scanning, summary.emails_scanned, summary.threats_found
    );
}

fn print_notice(notice: &Notice) {
    let level = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    };
    println!("[{level}] {}", notice.message);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["mailguard", "--token", "t0k"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("valid arguments")
    }

    #[test]
    fn builds_config_from_flags() {
        let cli = cli(&["--handshake-timeout-secs", "5", "watch", "--mailbox", "a@x.com"]);
        let config = AppConfig::try_from(&cli).expect("config");
        assert_eq!(config.manager.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.manager.connect_destination, "/app/connect");
        assert_eq!(config.checkpoint.debounce, Duration::from_millis(500));
        match cli.command {
            Command::Watch { mailboxes } => assert_eq!(mailboxes, vec!["a@x.com".to_string()]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_non_websocket_urls() {
        let cli = cli(&["--ws-url", "http://localhost/ws", "status"]);
        assert!(AppConfig::try_from(&cli).is_err());
    }

    #[test]
    fn counts_only_selected_resumable_sessions() {
        let mailboxes = vec![MailboxRecord {
            id: 1,
            email_address: "a@x.com".into(),
            mail_server_type: "gmail".into(),
        }];
        let report = SyncReport {
            reported: 2,
            changed: Vec::new(),
            resumable: vec![
                MailboxSessionKey::new("a@x.com", "u1"),
                MailboxSessionKey::new("b@x.com", "u1"),
            ],
        };
        let selected = select_mailboxes(&mailboxes, &[]);
        assert_eq!(resumable_among(&report, &selected), 1);
        assert_eq!(resumable_among(&report, &[]), 0);
    }

    #[test]
    fn selects_only_registered_mailboxes() {
        let mailboxes = vec![
            MailboxRecord {
                id: 1,
                email_address: "a@x.com".into(),
                mail_server_type: "gmail".into(),
            },
            MailboxRecord {
                id: 2,
                email_address: "b@x.com".into(),
                mail_server_type: "wp".into(),
            },
        ];
        assert_eq!(select_mailboxes(&mailboxes, &[]).len(), 2);
        let picked = select_mailboxes(&mailboxes, &["b@x.com".into(), "zzz@x.com".into()]);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, 2);
    }
}
