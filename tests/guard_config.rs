use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use guard_pipeline::config::GuardConfig;
use guard_pipeline::DetectionKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GUARD_CONFIG",
        "GUARD_TELEGRAM_BOT_TOKEN",
        "GUARD_TELEGRAM_CHAT_ID",
        "GUARD_IPINFO_TOKEN",
        "GUARD_LEDGER_DB",
        "GUARD_COOLDOWN_MS",
        "GUARD_MAX_ATTEMPTS",
        "GUARD_WORKERS",
        "GUARD_WATCHLIST",
    ] {
        std::env::remove_var(key);
    }
}

fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn loads_toml_file_and_env_overrides() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let toml = r#"
        [recognition]
        min_confidence = 0.6
        queue_capacity = 3

        [debounce]
        cooldown_ms = 4000
        inactivity_timeout_ms = 9000
        realert_threshold = 10

        [trigger]
        kinds = ["barcode"]
        watchlist = ["ABC123"]

        [geolocation]
        device_timeout_ms = 1500
        ip_timeout_ms = 2500

        [dispatch]
        max_attempts = 4
        base_delay_ms = 250
        workers = 3
        job_capacity = 8

        [telegram]
        bot_token = "file-token"
        chat_id = "-100200"

        [ledger]
        db_path = "alerts_file.db"
    "#;
    file.write_all(toml.as_bytes()).expect("write config");

    std::env::set_var("GUARD_CONFIG", file.path());
    std::env::set_var("GUARD_TELEGRAM_BOT_TOKEN", "env-token");
    std::env::set_var("GUARD_COOLDOWN_MS", "7000");
    std::env::set_var("GUARD_LEDGER_DB", "alerts_env.db");

    let cfg = GuardConfig::load().expect("load config");

    assert_eq!(cfg.recognition.min_confidence, 0.6);
    assert_eq!(cfg.recognition.queue_capacity, 3);
    assert_eq!(cfg.debounce.cooldown, Duration::from_millis(7000));
    assert_eq!(cfg.debounce.inactivity_timeout, Duration::from_millis(9000));
    assert_eq!(cfg.debounce.realert_threshold, 10);
    assert_eq!(cfg.trigger.kinds, vec![DetectionKind::Barcode]);
    assert_eq!(cfg.trigger.watchlist, vec!["ABC123"]);
    assert_eq!(cfg.geolocation.device_timeout, Duration::from_millis(1500));
    assert_eq!(cfg.geolocation.ip_timeout, Duration::from_millis(2500));
    assert_eq!(cfg.dispatch.retry.max_attempts, 4);
    assert_eq!(cfg.dispatch.retry.base_delay, Duration::from_millis(250));
    assert_eq!(cfg.dispatch.workers, 3);
    assert_eq!(cfg.ledger_db_path.as_deref(), Some("alerts_env.db"));

    let telegram = cfg.telegram_config().expect("telegram configured");
    assert_eq!(telegram.bot_token, "env-token");
    assert_eq!(telegram.chat_id, "-100200");

    let settings = cfg.pipeline_settings();
    assert_eq!(settings.workers, 3);
    assert_eq!(settings.queue_capacity, 3);
    assert_eq!(settings.job_capacity, 8);

    clear_env();
}

#[test]
fn loads_json_file_by_extension() {
    let _guard = lock_env();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("temp config");
    let json = r#"{
        "debounce": { "cooldown_ms": 2500 },
        "map": { "link_base": "" },
        "trigger": { "watchlist": ["stolen", "  "] }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    let cfg = GuardConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.debounce.cooldown, Duration::from_millis(2500));
    assert!(cfg.map_link_base().is_none());
    let trigger = cfg.alert_trigger();
    assert_eq!(trigger.watchlist(), ["stolen".to_string()]);

    clear_env();
}

#[test]
fn missing_file_uses_defaults() {
    let _guard = lock_env();
    clear_env();

    let cfg = GuardConfig::load().expect("load defaults");
    assert_eq!(cfg.debounce.cooldown, Duration::from_secs(5));
    assert_eq!(cfg.dispatch.retry.max_attempts, 5);
    assert_eq!(
        cfg.trigger.kinds,
        vec![DetectionKind::Text, DetectionKind::Barcode]
    );
    assert!(cfg.telegram_config().is_none());
    assert!(cfg.ledger_db_path.is_none());
}

#[test]
fn rejects_invalid_values() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[dispatch]\nmax_attempts = 0\n")
        .expect("write config");
    let err = GuardConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("dispatch.max_attempts"));

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[recognition]\nmin_confidence = 1.5\n")
        .expect("write config");
    let err = GuardConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("min_confidence"));

    std::env::set_var("GUARD_WORKERS", "many");
    let err = GuardConfig::load_from(None).unwrap_err();
    assert!(err.to_string().contains("GUARD_WORKERS"));

    clear_env();
}

#[test]
fn rejects_any_unknown_trigger_kind() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[trigger]\nkinds = [\"qr\", \"text\"]\n")
        .expect("write config");
    let err = GuardConfig::load_from(Some(file.path())).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("trigger.kinds"), "{}", message);
    assert!(message.contains("qr"), "{}", message);

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[dispatch]\njob_capacity = 0\n")
        .expect("write config");
    let err = GuardConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("dispatch.job_capacity"));
}

#[test]
fn malformed_file_names_the_path() {
    let _guard = lock_env();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"[debounce\ncooldown_ms = ").expect("write config");
    let err = GuardConfig::from_path(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));
}
