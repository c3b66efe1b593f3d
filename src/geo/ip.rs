//! Coarse location from the public IP address (ipinfo.io response shape).

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::{FixSource, GeoFix};

use super::LocationSource;

pub const DEFAULT_IP_LOOKUP_URL: &str = "https://ipinfo.io";

/// IP geolocation is city-level at best.
pub const IP_FIX_ACCURACY_M: f64 = 5_000.0;

#[derive(Debug, Deserialize)]
struct IpInfo {
    #[serde(default)]
    loc: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

pub struct IpLocationSource {
    lookup_url: Url,
    agent: ureq::Agent,
}

impl IpLocationSource {
    /// `base_url` is the lookup service root; `/json` is appended. `token` is sent as the
    /// `token` query parameter when present.
    pub fn new(base_url: &str, token: Option<&str>) -> Result<Self> {
        let base = Url::parse(&format!("{}/", base_url.trim_end_matches('/')))
            .with_context(|| format!("invalid ip lookup url: {}", base_url))?;
        let mut lookup_url = base.join("json").context("build ip lookup url")?;
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            lookup_url.query_pairs_mut().append_pair("token", token.trim());
        }
        Ok(Self {
            lookup_url,
            agent: ureq::AgentBuilder::new().build(),
        })
    }

    pub fn lookup_url(&self) -> &Url {
        &self.lookup_url
    }
}

impl LocationSource for IpLocationSource {
    fn name(&self) -> &str {
        "ip"
    }

    fn source(&self) -> FixSource {
        FixSource::Ip
    }

    fn locate(&self, timeout: Duration) -> Result<GeoFix> {
        let body = self
            .agent
            .get(self.lookup_url.as_str())
            .timeout(timeout)
            .call()
            .map_err(|e| anyhow!("ip lookup failed: {}", redact_token(&e.to_string())))?
            .into_string()
            .context("read ip lookup response")?;
        parse_ipinfo(&body)
    }
}

/// Parse an ipinfo-style body: `"loc": "lat,lon"` plus optional city/region/country.
pub fn parse_ipinfo(body: &str) -> Result<GeoFix> {
    let info: IpInfo = serde_json::from_str(body).context("ip lookup response is not json")?;
    let loc = info
        .loc
        .as_deref()
        .ok_or_else(|| anyhow!("ip lookup response has no loc"))?;
    let (lat, lon) = loc
        .split_once(',')
        .ok_or_else(|| anyhow!("malformed loc: {}", loc))?;
    let latitude: f64 = lat.trim().parse().context("malformed loc latitude")?;
    let longitude: f64 = lon.trim().parse().context("malformed loc longitude")?;

    let mut fix = GeoFix::new(latitude, longitude, IP_FIX_ACCURACY_M, FixSource::Ip);
    let parts: Vec<&str> = [&info.city, &info.region, &info.country]
        .into_iter()
        .filter_map(|p| p.as_deref())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if !parts.is_empty() {
        fix = fix.with_locality(parts.join(", "));
    }
    Ok(fix)
}

fn redact_token(message: &str) -> String {
    match message.find("token=") {
        Some(idx) => {
            let rest = &message[idx + 6..];
            let end = rest
                .find(|c: char| c == '&' || c.is_whitespace() || c == ':')
                .unwrap_or(rest.len());
            format!("{}token=<redacted>{}", &message[..idx], &rest[end..])
        }
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ipinfo_body() {
        let fix = parse_ipinfo(
            r#"{"ip":"1.2.3.4","city":"Hanoi","region":"Hanoi","country":"VN","loc":"21.0245,105.8412"}"#,
        )
        .unwrap();
        assert_eq!(fix.source, FixSource::Ip);
        assert_eq!(fix.latitude, 21.0245);
        assert_eq!(fix.longitude, 105.8412);
        assert_eq!(fix.accuracy_m, IP_FIX_ACCURACY_M);
        assert_eq!(fix.locality.as_deref(), Some("Hanoi, Hanoi, VN"));
    }

    #[test]
    fn rejects_missing_or_bad_loc() {
        assert!(parse_ipinfo(r#"{"city":"Nowhere"}"#).is_err());
        assert!(parse_ipinfo(r#"{"loc":"abc"}"#).is_err());
        assert!(parse_ipinfo(r#"{"loc":"1.0,east"}"#).is_err());
        assert!(parse_ipinfo("not json").is_err());
    }

    #[test]
    fn builds_lookup_url_with_token() {
        let source = IpLocationSource::new("https://ipinfo.io/", Some("abc123")).unwrap();
        assert_eq!(
            source.lookup_url().as_str(),
            "https://ipinfo.io/json?token=abc123"
        );
        let bare = IpLocationSource::new(DEFAULT_IP_LOOKUP_URL, None).unwrap();
        assert_eq!(bare.lookup_url().as_str(), "https://ipinfo.io/json");
        assert!(IpLocationSource::new("not a url", None).is_err());
    }

    #[test]
    fn token_is_redacted_from_errors() {
        assert_eq!(
            redact_token("https://ipinfo.io/json?token=abc123: Connection Failed"),
            "https://ipinfo.io/json?token=<redacted>: Connection Failed"
        );
    }
}
