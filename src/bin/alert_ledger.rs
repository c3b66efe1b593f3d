//! alert_ledger - inspect the alert ledger and re-send failed alerts

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use guard_pipeline::ledger::AlertStatus;
use guard_pipeline::{
    AlertDispatcher, AlertLedger, GuardConfig, SqliteAlertLedger, TelegramTransport,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the alert ledger database (defaults to `ledger.db_path` from config).
    #[arg(long, env = "GUARD_LEDGER_DB")]
    db: Option<String>,
    /// Config file, used for the ledger path and Telegram credentials.
    #[arg(long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List alert records, oldest first.
    List {
        /// Only records with this status (pending|sent|failed|exhausted).
        #[arg(long)]
        status: Option<String>,
        /// Only records created at or after this unix time in milliseconds.
        #[arg(long, default_value_t = 0)]
        since_ms: u64,
        /// Print records as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Print one record as JSON.
    Show { alert_id: String },
    /// Re-send a failed or exhausted alert through Telegram.
    Resend { alert_id: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let cfg = GuardConfig::load_from(args.config.as_deref())?;
    let db_path = args
        .db
        .clone()
        .or_else(|| cfg.ledger_db_path.clone())
        .ok_or_else(|| anyhow!("no ledger database; pass --db or set GUARD_LEDGER_DB"))?;

    let ledger: Arc<dyn AlertLedger> = {
        let _stage = ui.stage("Open alert ledger");
        Arc::new(
            SqliteAlertLedger::open(&db_path)
                .with_context(|| format!("open alert ledger {}", db_path))?,
        )
    };

    match args.command {
        Command::List {
            status,
            since_ms,
            json,
        } => {
            let records = {
                let _stage = ui.stage("Query records");
                match status.as_deref() {
                    Some(raw) => {
                        let status = AlertStatus::parse(raw)
                            .ok_or_else(|| anyhow!("unknown status {:?}", raw))?;
                        ledger
                            .list_by_status(status)?
                            .into_iter()
                            .filter(|r| r.created_at_ms >= since_ms)
                            .collect::<Vec<_>>()
                    }
                    None => ledger.list_since(since_ms)?,
                }
            };
            for record in &records {
                if json {
                    println!("{}", serde_json::to_string(record)?);
                } else {
                    println!("{}", ui.record_line(record));
                }
            }
            if !json {
                eprintln!("{} record(s)", records.len());
            }
        }
        Command::Show { alert_id } => {
            let record = ledger
                .get(&alert_id)?
                .ok_or_else(|| anyhow!("no alert record {}", alert_id))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Resend { alert_id } => {
            let telegram = cfg.telegram_config().ok_or_else(|| {
                anyhow!("GUARD_TELEGRAM_BOT_TOKEN and GUARD_TELEGRAM_CHAT_ID must be set")
            })?;
            let transport = Arc::new(TelegramTransport::new(telegram)?);
            let dispatcher = AlertDispatcher::new(transport, ledger, cfg.dispatch.retry.clone())
                .with_map_link_base(cfg.map_link_base());
            let record = {
                let _stage = ui.stage("Re-send alert");
                dispatcher.resend(&alert_id)?
            };
            println!("{}", ui.record_line(&record));
            if record.status != AlertStatus::Sent {
                return Err(anyhow!(
                    "alert {} still {} after {} attempts: {}",
                    record.alert_id,
                    record.status,
                    record.attempt_count,
                    record.last_error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
    }
    Ok(())
}
