use chrono::{DateTime, Utc};

use crate::ledger::AlertRecord;
use crate::DetectionKind;

pub const DEFAULT_MAP_LINK_BASE: &str = "https://maps.google.com/?q=";

/// Formatted alert payload handed to the transport.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertMessage {
    pub alert_id: String,
    pub text: String,
    /// `(latitude, longitude)` when a location was resolved.
    pub coordinates: Option<(f64, f64)>,
    pub map_link: Option<String>,
}

impl AlertMessage {
    pub fn from_record(record: &AlertRecord, map_link_base: Option<&str>) -> Self {
        let coordinates = record
            .geo_fix
            .as_ref()
            .map(|fix| (fix.latitude, fix.longitude));
        let map_link = match (coordinates, map_link_base) {
            (Some((lat, lon)), Some(base)) if !base.is_empty() => {
                Some(format!("{}{:.6},{:.6}", base, lat, lon))
            }
            _ => None,
        };

        let mut text = String::new();
        text.push_str("🚨 SAFETY ALERT 🚨\n");
        let label = match record.kind {
            DetectionKind::Barcode => "Barcode",
            DetectionKind::Text => "Text",
        };
        text.push_str(&format!("{} detected: {}\n", label, record.content));
        if record.round > 0 {
            text.push_str(&format!("Repeat alert #{}\n", record.round));
        }
        text.push('\n');

        text.push_str("📍 Location: ");
        match &record.geo_fix {
            Some(fix) => {
                text.push_str(&format!(
                    "{:.6}, {:.6} (±{:.0} m, {})\n",
                    fix.latitude, fix.longitude, fix.accuracy_m, fix.source
                ));
                if let Some(locality) = &fix.locality {
                    text.push_str(&format!("Area: {}\n", locality));
                }
            }
            None => text.push_str("unavailable\n"),
        }
        if let Some(link) = &map_link {
            text.push_str(&format!("Map: {}\n", link));
        }
        text.push_str(&format!("🕒 {}", format_timestamp(record.created_at_ms)));

        Self {
            alert_id: record.alert_id.clone(),
            text,
            coordinates,
            map_link,
        }
    }
}

fn format_timestamp(ms: u64) -> String {
    i64::try_from(ms)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{} ms", ms))
}
