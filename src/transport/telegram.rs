//! Telegram Bot API transport.
//!
//! `POST {api_base}/bot{token}/sendMessage` with `{chat_id, text}`. A delivery counts
//! only when the endpoint answers 2xx with `{"ok": true, "result": {"message_id": N}}`.
//! When the alert carries coordinates a `sendLocation` reply follows; its failure is
//! logged and does not fail the delivery.

use serde::Deserialize;
use serde_json::json;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use crate::dispatch::AlertMessage;
use crate::error::TransportError;

use super::{AlertTransport, DeliveryReceipt};

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ERROR_BODY: usize = 512;

#[derive(Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    /// Follow each alert with a location pin when coordinates are known.
    pub send_location: bool,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            send_location: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

// The bot token is a credential; keep it out of Debug output.
impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("send_location", &self.send_location)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
}

pub struct TelegramTransport {
    config: TelegramConfig,
    agent: ureq::Agent,
}

impl TelegramTransport {
    pub fn new(config: TelegramConfig) -> Result<Self, TransportError> {
        if config.bot_token.trim().is_empty() {
            return Err(TransportError::NotConfigured("telegram bot token"));
        }
        if config.chat_id.trim().is_empty() {
            return Err(TransportError::NotConfigured("telegram chat id"));
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self { config, agent })
    }

    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }

    /// Call one Bot API method and return the resulting message id.
    fn call(&self, method: &str, body: serde_json::Value) -> Result<String, TransportError> {
        log::debug!("telegram {} -> chat {}", method, self.config.chat_id);
        match self.agent.post(&self.method_url(method)).send_json(body) {
            Ok(response) => {
                let raw = response
                    .into_string()
                    .map_err(|e| TransportError::Malformed(format!("read body: {}", e)))?;
                parse_send_response(&raw)
            }
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                Err(TransportError::Status {
                    code,
                    body: truncate(&self.redact(&body), MAX_ERROR_BODY),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                let deadline_hit = matches!(
                    transport.kind(),
                    ureq::ErrorKind::Io | ureq::ErrorKind::ConnectionFailed
                ) && caused_by_timeout(&transport);
                if deadline_hit {
                    Err(TransportError::Timeout(self.config.timeout))
                } else {
                    Err(TransportError::Network(self.redact(&transport.to_string())))
                }
            }
        }
    }

    fn redact(&self, text: &str) -> String {
        if self.config.bot_token.is_empty() {
            return text.to_string();
        }
        text.replace(&self.config.bot_token, "<redacted>")
    }
}

impl AlertTransport for TelegramTransport {
    fn name(&self) -> &'static str {
        "telegram"
    }

    fn send(&self, message: &AlertMessage) -> Result<DeliveryReceipt, TransportError> {
        let message_id = self.call(
            "sendMessage",
            json!({
                "chat_id": self.config.chat_id,
                "text": message.text,
                "disable_web_page_preview": true,
            }),
        )?;

        if self.config.send_location {
            if let Some((latitude, longitude)) = message.coordinates {
                let pin = self.call(
                    "sendLocation",
                    json!({
                        "chat_id": self.config.chat_id,
                        "latitude": latitude,
                        "longitude": longitude,
                        "reply_to_message_id": message_id.parse::<i64>().unwrap_or_default(),
                    }),
                );
                if let Err(e) = pin {
                    log::warn!(
                        "alert {}: location attachment failed: {}",
                        message.alert_id,
                        e
                    );
                }
            }
        }

        Ok(DeliveryReceipt { message_id })
    }
}

fn parse_send_response(raw: &str) -> Result<String, TransportError> {
    let response: ApiResponse = serde_json::from_str(raw)
        .map_err(|e| TransportError::Malformed(format!("invalid json: {}", e)))?;
    if !response.ok {
        return Err(TransportError::Rejected {
            description: response
                .description
                .unwrap_or_else(|| "ok=false without description".to_string()),
        });
    }
    response
        .result
        .map(|m| m.message_id.to_string())
        .ok_or_else(|| TransportError::Malformed("ok=true without result.message_id".into()))
}

/// Walks the source chain for an io error raised by a connect or read deadline.
/// A socket read timeout surfaces as `WouldBlock` on Unix.
fn caused_by_timeout(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_successful_send() {
        let raw = r#"{"ok":true,"result":{"message_id":4711,"chat":{"id":-100}}}"#;
        assert_eq!(parse_send_response(raw).unwrap(), "4711");
    }

    #[test]
    fn ok_false_is_rejected() {
        let raw = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        match parse_send_response(raw) {
            Err(TransportError::Rejected { description }) => {
                assert!(description.contains("chat not found"))
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            parse_send_response("<html>502</html>"),
            Err(TransportError::Malformed(_))
        ));
        assert!(matches!(
            parse_send_response(r#"{"ok":true}"#),
            Err(TransportError::Malformed(_))
        ));
    }

    #[test]
    fn requires_credentials() {
        assert!(matches!(
            TelegramTransport::new(TelegramConfig::new("", "42")),
            Err(TransportError::NotConfigured(_))
        ));
        assert!(matches!(
            TelegramTransport::new(TelegramConfig::new("123:abc", " ")),
            Err(TransportError::NotConfigured(_))
        ));
    }

    #[test]
    fn timeout_is_recognized_by_io_kind() {
        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert!(caused_by_timeout(&timed_out));
        let would_block = io::Error::new(io::ErrorKind::WouldBlock, "read timeout");
        assert!(caused_by_timeout(&would_block));

        // Wording alone does not count.
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "timed out");
        assert!(!caused_by_timeout(&refused));
    }

    #[test]
    fn silent_endpoint_times_out() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            // Accept and hold the connection without answering.
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(1_000));
            drop(stream);
        });

        let mut config = TelegramConfig::new("123:abc", "42");
        config.api_base = format!("http://{}", addr);
        config.timeout = Duration::from_millis(200);
        let transport = TelegramTransport::new(config).unwrap();
        let message = AlertMessage {
            alert_id: "a1".into(),
            text: "ALERT".into(),
            coordinates: None,
            map_link: None,
        };
        match transport.send(&message) {
            Err(TransportError::Timeout(limit)) => {
                assert_eq!(limit, Duration::from_millis(200))
            }
            other => panic!("unexpected: {:?}", other),
        }
        server.join().unwrap();
    }

    #[test]
    fn token_never_leaks() {
        let mut config = TelegramConfig::new("123:secret", "42");
        config.api_base = "http://localhost:9/".into();
        let transport = TelegramTransport::new(config).unwrap();
        assert_eq!(
            transport.method_url("sendMessage"),
            "http://localhost:9/bot123:secret/sendMessage"
        );
        assert_eq!(
            transport.redact("POST http://localhost:9/bot123:secret/sendMessage failed"),
            "POST http://localhost:9/bot<redacted>/sendMessage failed"
        );
        assert!(!format!("{:?}", transport.config()).contains("secret"));
    }
}
