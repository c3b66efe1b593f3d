//! guardd - detection-to-alert daemon
//!
//! This daemon:
//! 1. Loads configuration (`$GUARD_CONFIG` / `--config`, then `GUARD_*` overrides)
//! 2. Opens the alert ledger (SQLite when `ledger.db_path` is set, else in-memory)
//! 3. Wires the Telegram transport and the satellite -> IP -> last-known location chain
//! 4. Feeds synthetic frames through the recognition lane, optionally replaying a
//!    recognition script
//! 5. Logs alert signals until Ctrl-C, then shuts down within the configured grace

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use guard_pipeline::dispatch::AlertMessage;
use guard_pipeline::geo::LocationSource;
use guard_pipeline::pipeline::PipelineParts;
use guard_pipeline::recognize::{ScriptedRecognizer, StubRecognizer};
use guard_pipeline::{
    AlertDispatcher, AlertLedger, AlertSignal, AlertTransport, DeliveryReceipt, DeviceFixFeed,
    DeviceLocationSource, FixSource, GeoFix, GeolocationResolver, GuardConfig,
    InMemoryAlertLedger, IpLocationSource, Pipeline, RecognitionAdapter, RecognizerRegistry,
    SqliteAlertLedger, SyntheticConfig, SyntheticSource, TelegramTransport, TransportError,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (TOML, or JSON with a .json extension).
    #[arg(long, env = "GUARD_CONFIG")]
    config: Option<PathBuf>,
    /// JSON-lines recognition script replayed one step per frame.
    #[arg(long)]
    script: Option<PathBuf>,
    /// Restart the script when it runs out.
    #[arg(long)]
    loop_script: bool,
    /// Synthetic frame rate.
    #[arg(long, default_value_t = 5)]
    fps: u32,
    /// Stop after this many frames (0 = run until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    max_frames: u64,
    /// Publish a fixed device position "lat,lon" (stands in for the platform GPS).
    #[arg(long, value_name = "LAT,LON")]
    device_fix: Option<String>,
    /// Log alerts instead of sending them to Telegram.
    #[arg(long)]
    dry_run: bool,
}

/// Transport for `--dry-run`: logs the message and reports success.
struct LogTransport {
    sent: AtomicU64,
}

impl AlertTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    fn send(&self, message: &AlertMessage) -> Result<DeliveryReceipt, TransportError> {
        let n = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        log::info!("[dry-run] alert {}:\n{}", message.alert_id, message.text);
        Ok(DeliveryReceipt {
            message_id: format!("dry-run-{}", n),
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = GuardConfig::load_from(args.config.as_deref())?;
    log::info!("guardd {} starting", env!("CARGO_PKG_VERSION"));

    let ledger: Arc<dyn AlertLedger> = match &cfg.ledger_db_path {
        Some(path) => {
            log::info!("alert ledger: {}", path);
            Arc::new(
                SqliteAlertLedger::open(path)
                    .with_context(|| format!("open alert ledger {}", path))?,
            )
        }
        None => {
            log::warn!("alert ledger is in-memory; records are lost on exit");
            Arc::new(InMemoryAlertLedger::new())
        }
    };

    let transport: Arc<dyn AlertTransport> = if args.dry_run {
        Arc::new(LogTransport {
            sent: AtomicU64::new(0),
        })
    } else {
        let telegram = cfg.telegram_config().ok_or_else(|| {
            anyhow!("GUARD_TELEGRAM_BOT_TOKEN and GUARD_TELEGRAM_CHAT_ID must be set (or use --dry-run)")
        })?;
        Arc::new(TelegramTransport::new(telegram)?)
    };

    let dispatcher = Arc::new(
        AlertDispatcher::new(transport, ledger, cfg.dispatch.retry.clone())
            .with_map_link_base(cfg.map_link_base()),
    );

    let feed = DeviceFixFeed::new();
    if let Some(raw) = &args.device_fix {
        let (lat, lon) = parse_lat_lon(raw)?;
        feed.publish(GeoFix::new(lat, lon, 10.0, FixSource::Satellite));
    }
    let satellite: Arc<dyn LocationSource> = Arc::new(DeviceLocationSource::new(
        "satellite",
        FixSource::Satellite,
        feed.clone(),
        cfg.geolocation.device_max_fix_age,
    ));
    let ip: Arc<dyn LocationSource> = Arc::new(IpLocationSource::new(
        &cfg.geolocation.ip_lookup_url,
        cfg.geolocation.ip_token.as_deref(),
    )?);
    let resolver = Arc::new(
        GeolocationResolver::new(cfg.geolocation.staleness_ceiling)
            .with_source(satellite, cfg.geolocation.device_timeout)
            .with_source(ip, cfg.geolocation.ip_timeout),
    );
    log::info!(
        "location chain: {} (deadline {:?})",
        resolver.source_names().join(" -> "),
        cfg.geolocation.deadline
    );

    let mut registry = RecognizerRegistry::new();
    match &args.script {
        Some(path) => {
            registry.register(ScriptedRecognizer::load(path)?.looping(args.loop_script));
            log::info!("replaying recognition script {}", path.display());
        }
        None => {
            registry.register(StubRecognizer::new());
            log::warn!("no recognition script; stub recognizer produces no detections");
        }
    }

    let handle = Pipeline::start(PipelineParts {
        adapter: RecognitionAdapter::new(registry, cfg.adapter_config()),
        debounce: cfg.debounce.clone(),
        trigger: cfg.alert_trigger(),
        resolver,
        dispatcher,
        settings: cfg.pipeline_settings(),
    })?;

    if let Some(signals) = handle.take_signals() {
        std::thread::Builder::new()
            .name("guard-signals".into())
            .spawn(move || {
                for signal in signals {
                    log_signal(&signal);
                }
            })
            .context("spawn signal logger")?;
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    let mut source = SyntheticSource::new(SyntheticConfig {
        target_fps: args.fps,
        ..SyntheticConfig::default()
    })?;
    log::info!("guardd running; Ctrl-C to stop");
    loop {
        if stop_rx.try_recv().is_ok() {
            log::info!("shutdown signal received");
            break;
        }
        if args.max_frames > 0 && source.stats().frames_captured >= args.max_frames {
            log::info!("frame limit reached ({})", args.max_frames);
            break;
        }
        // Re-publish the fixed position so it never ages out.
        if let Some(fix) = feed.latest() {
            if source.stats().frames_captured % 50 == 0 {
                feed.publish(GeoFix::new(
                    fix.latitude,
                    fix.longitude,
                    fix.accuracy_m,
                    fix.source,
                ));
            }
        }
        if !handle.submit_frame(source.next_frame()) {
            break;
        }
    }

    let report = handle.shutdown(cfg.dispatch.shutdown_grace);
    if report.marked_failed > 0 {
        log::warn!(
            "{} alerts left unresolved; re-send with `alert_ledger resend <id>`",
            report.marked_failed
        );
    }
    Ok(())
}

fn log_signal(signal: &AlertSignal) {
    match signal {
        AlertSignal::DeliveryConfirmed {
            alert_id,
            message_id,
            ..
        } => log::info!("alert {} delivered (message {})", alert_id, message_id),
        AlertSignal::DeliveryFailed {
            alert_id,
            attempts,
            last_error,
        } => log::error!(
            "alert {} not delivered after {} attempts: {}",
            alert_id,
            attempts,
            last_error
        ),
        AlertSignal::LocationUnavailable { alert_id } => {
            log::warn!("alert {} sent without location", alert_id)
        }
        AlertSignal::ShowOnMap(pin) => log::info!(
            "map pin {:.5},{:.5} ({})",
            pin.latitude,
            pin.longitude,
            pin.label
        ),
    }
}

fn parse_lat_lon(raw: &str) -> Result<(f64, f64)> {
    let (lat, lon) = raw
        .split_once(',')
        .ok_or_else(|| anyhow!("--device-fix must be LAT,LON"))?;
    let lat: f64 = lat.trim().parse().context("--device-fix latitude")?;
    let lon: f64 = lon.trim().parse().context("--device-fix longitude")?;
    if !GeoFix::new(lat, lon, 0.0, FixSource::Satellite).is_valid() {
        return Err(anyhow!("--device-fix out of range: {}", raw));
    }
    Ok((lat, lon))
}
