use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::IntelConfig;
use crate::error::{Error, Result};

/// Location details used to enrich notifications
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
}

/// Source of geolocation data for an address
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo>;
}

/// HTTP geolocation client (ip-api.com compatible JSON)
pub struct IpInfoClient {
    config: IntelConfig,
    client: Client,
}

impl IpInfoClient {
    pub fn new(config: IntelConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("sshwarden/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { config, client })
    }

    fn url_for(&self, ip: IpAddr) -> String {
        format!(
            "{}/{}?lang={}",
            self.config.api_url.trim_end_matches('/'),
            ip,
            self.config.language
        )
    }

    async fn fetch(&self, ip: IpAddr) -> std::result::Result<GeoInfo, String> {
        let resp = self
            .client
            .get(self.url_for(ip))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }

        let body: GeoApiResponse = resp.json().await.map_err(|e| e.to_string())?;
        body.into_geo()
    }
}

#[async_trait]
impl GeoLookup for IpInfoClient {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo> {
        let attempts = self.config.retry_count + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.fetch(ip).await {
                Ok(geo) => return Ok(geo),
                Err(e) => {
                    debug!(ip = %ip, attempt, "Geolocation lookup failed: {}", e);
                    last_error = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_secs(self.config.retry_interval_secs)).await;
            }
        }

        Err(Error::Lookup {
            ip,
            reason: last_error,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: Option<String>,
    message: Option<String>,
    country: Option<String>,
    region: Option<String>,
    #[serde(rename = "regionName")]
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
}

impl GeoApiResponse {
    fn into_geo(self) -> std::result::Result<GeoInfo, String> {
        if let Some(status) = &self.status {
            if status != "success" {
                return Err(self.message.unwrap_or_else(|| status.clone()));
            }
        }

        Ok(GeoInfo {
            country: self.country,
            region: self.region_name.or(self.region),
            city: self.city,
            isp: self.isp,
        })
    }
}

/// Human-readable location block for `ip`.
///
/// Lookup failures never surface; they degrade to a placeholder line.
pub async fn describe(geo: Option<&dyn GeoLookup>, ip: IpAddr) -> String {
    let Some(geo) = geo else {
        return format!("IP: {}", ip);
    };

    match geo.lookup(ip).await {
        Ok(info) => format_geo(ip, &info),
        Err(e) => {
            warn!(ip = %ip, "Geolocation unavailable: {}", e);
            format!("IP: {} (location unavailable)", ip)
        }
    }
}

pub fn format_geo(ip: IpAddr, info: &GeoInfo) -> String {
    let location: Vec<&str> = [
        info.country.as_deref(),
        info.region.as_deref(),
        info.city.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect();

    format!(
        "IP: {}\nLocation: {}\nISP: {}",
        ip,
        if location.is_empty() {
            "unknown".to_string()
        } else {
            location.join(" ")
        },
        info.isp.as_deref().unwrap_or("unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingLookup;

    #[async_trait]
    impl GeoLookup for FailingLookup {
        async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo> {
            Err(Error::Lookup {
                ip,
                reason: "timeout".to_string(),
            })
        }
    }

    struct FixedLookup(GeoInfo);

    #[async_trait]
    impl GeoLookup for FixedLookup {
        async fn lookup(&self, _ip: IpAddr) -> Result<GeoInfo> {
            Ok(self.0.clone())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_api_response_parsing() {
        let body: GeoApiResponse = serde_json::from_str(
            r#"{"status":"success","country":"Germany","region":"BE","regionName":"Berlin","city":"Berlin","isp":"Example GmbH"}"#,
        )
        .unwrap();
        let geo = body.into_geo().unwrap();
        assert_eq!(geo.region.as_deref(), Some("Berlin"));
        assert_eq!(geo.isp.as_deref(), Some("Example GmbH"));
    }

    #[test]
    fn test_api_failure_status() {
        let body: GeoApiResponse =
            serde_json::from_str(r#"{"status":"fail","message":"private range"}"#).unwrap();
        assert_eq!(body.into_geo().unwrap_err(), "private range");
    }

    #[test]
    fn test_plain_response_without_status() {
        let body: GeoApiResponse =
            serde_json::from_str(r#"{"country":"Japan","region":"Tokyo","isp":"ISP"}"#).unwrap();
        let geo = body.into_geo().unwrap();
        assert_eq!(geo.region.as_deref(), Some("Tokyo"));
        assert_eq!(geo.city, None);
    }

    #[test]
    fn test_url_building() {
        let client = IpInfoClient::new(IntelConfig {
            api_url: "http://geo.example/json/".to_string(),
            language: "zh-CN".to_string(),
            ..IntelConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.url_for(ip("8.8.8.8")),
            "http://geo.example/json/8.8.8.8?lang=zh-CN"
        );
    }

    #[tokio::test]
    async fn test_describe_degrades_to_placeholder() {
        let text = describe(Some(&FailingLookup), ip("10.0.0.1")).await;
        assert_eq!(text, "IP: 10.0.0.1 (location unavailable)");
    }

    #[tokio::test]
    async fn test_describe_formats_location() {
        let lookup = FixedLookup(GeoInfo {
            country: Some("France".to_string()),
            region: None,
            city: Some("Paris".to_string()),
            isp: None,
        });
        let text = describe(Some(&lookup), ip("10.0.0.1")).await;
        assert_eq!(text, "IP: 10.0.0.1\nLocation: France Paris\nISP: unknown");
        assert_eq!(describe(None, ip("10.0.0.1")).await, "IP: 10.0.0.1");
    }

    #[tokio::test]
    async fn test_lookup_retries_then_fails() {
        // Nothing listens on port 9 of the loopback; every attempt fails fast
        let client = IpInfoClient::new(IntelConfig {
            api_url: "http://127.0.0.1:9".to_string(),
            retry_count: 2,
            retry_interval_secs: 0,
            timeout_secs: 2,
            ..IntelConfig::default()
        })
        .unwrap();
        let err = client.lookup(ip("10.0.0.1")).await.unwrap_err();
        assert!(matches!(err, Error::Lookup { .. }));
    }
}
