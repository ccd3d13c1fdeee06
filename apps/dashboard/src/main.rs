use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::domain::{LanePair, Side};
use sync_core::{load_settings, SyncEvent, SyncSession, SyncSettings, ViewStateStore};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dashboard", about = "Mirror the left and right sequencing lanes")]
struct Cli {
    /// Settings file; defaults to ./dashboard.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long)]
    poll_interval_ms: Option<u64>,
    #[arg(long)]
    channel_origin: Option<String>,
    #[arg(long)]
    left_url: Option<String>,
    #[arg(long)]
    right_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow both lanes until Ctrl-C.
    Watch {
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        tentative_only: bool,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Write the filtered rows of one lane to a CSV file.
    Export {
        #[arg(long)]
        side: Side,
        #[arg(long, default_value = "")]
        search: String,
        #[arg(long)]
        tentative_only: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    Flush {
        #[arg(long)]
        side: Side,
    },
    Refresh,
}

impl Cli {
    fn settings(&self) -> Result<SyncSettings> {
        let mut settings = load_settings(self.config.as_deref())?;
        if let Some(api_base) = &self.api_base {
            settings.api_base_url = api_base.clone();
        }
        if let Some(poll_interval_ms) = self.poll_interval_ms {
            settings.poll_interval_ms = poll_interval_ms;
        }
        if let Some(origin) = &self.channel_origin {
            settings.channel_origin = Some(origin.clone());
        }
        if let Some(url) = &self.left_url {
            settings.left_lane_url = Some(url.clone());
        }
        if let Some(url) = &self.right_url {
            settings.right_lane_url = Some(url.clone());
        }
        if let Command::Watch {
            page_size: Some(page_size),
            ..
        } = &self.command
        {
            settings.page_size = *page_size;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let settings = cli.settings()?;
    let session = SyncSession::new(settings).context("invalid dashboard settings")?;

    match cli.command {
        Command::Watch {
            search,
            tentative_only,
            ..
        } => watch(session, search, tentative_only).await?,
        Command::Export {
            side,
            search,
            tentative_only,
            out,
        } => {
            session
                .update_view(|store| {
                    store.set_search(search);
                    store.set_tentative_only(tentative_only);
                })
                .await;
            let fetched = session.fetch_all().await;
            if !*fetched.get(side) {
                warn!(%side, "lane fetch failed, exporting whatever is held");
            }
            match session.export_csv(side).await? {
                Some(export) => {
                    let path = out.unwrap_or_else(|| PathBuf::from(&export.filename));
                    fs::write(&path, &export.contents)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {}", path.display());
                }
                None => println!("nothing to export for the {side} lane"),
            }
        }
        Command::Flush { side } => {
            let result = session.flush(side).await;
            print_counts(&session, &result).await;
            result.with_context(|| format!("flush of the {side} lane failed"))?;
        }
        Command::Refresh => {
            let result = session.refresh().await;
            print_counts(&session, &result).await;
            result.context("refresh failed")?;
        }
    }

    Ok(())
}

async fn watch(session: Arc<SyncSession>, search: String, tentative_only: bool) -> Result<()> {
    session
        .update_view(|store| {
            store.set_search(search);
            store.set_tentative_only(tentative_only);
        })
        .await;
    let mut events = session.subscribe();
    println!("status: {}", session.status().await);

    let start = Arc::clone(&session);
    tokio::spawn(async move {
        start.start().await;
    });

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            event = events.recv() => match event {
                Ok(SyncEvent::StatusChanged(status)) => println!("status: {status}"),
                Ok(SyncEvent::LaneUpdated { side, .. }) => {
                    let summary = session.read(|store| render_lane(store, side)).await;
                    println!("{summary}");
                }
                Ok(SyncEvent::FetchFailed { side, error }) => {
                    println!("[{side}] fetch failed, showing last good rows: {error}");
                }
                Ok(SyncEvent::ActionFailed { action, error }) => {
                    println!("{action} failed: {error}");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "dashboard: event receiver lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.teardown().await;
    Ok(())
}

async fn print_counts<E>(session: &SyncSession, result: &Result<LanePair<bool>, E>) {
    let counts = session
        .read(|store| {
            Side::BOTH.map(|side| {
                let lane = store.lane(side);
                (side, lane.rows.len(), lane.pending.len())
            })
        })
        .await;
    for (side, rows, pending) in counts {
        let fresh = match result {
            Ok(fetched) if !*fetched.get(side) => " (stale)",
            _ => "",
        };
        println!("[{side}] {rows} rows, {pending} pending{fresh}");
    }
}

fn render_lane(store: &ViewStateStore, side: Side) -> String {
    let view = store.derive(side);
    let buffer = view
        .buffer
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    let mut lines = vec![format!(
        "[{side}] {} rows, page {}/{}, {} pending, buffer {buffer}",
        view.filtered_total,
        view.page + 1,
        view.page_count,
        view.pending.len(),
    )];
    for row in &view.rows {
        let text = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        lines.push(format!(
            "  {:>10}  wagon {:<10} train {:<8} {} {} / {} {}  {}",
            row.id.to_string(),
            text(&row.wagon_no),
            text(&row.train_no),
            text(&row.container_no_1),
            text(&row.iso_code_1),
            text(&row.container_no_2),
            text(&row.iso_code_2),
            if row.is_final() { "final" } else { "tentative" },
        ));
    }
    lines.join("\n")
}
