//! nsqlookupd discovery over HTTP.

use reqwest::StatusCode;
use serde::Deserialize;

use crate::core::error::BrokerError;

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    producers: Vec<LookupProducer>,
    /// Pre-1.0 nsqlookupd wraps the payload in `{"status_code", "data"}`.
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<LookupProducer>,
}

#[derive(Debug, Deserialize)]
struct LookupProducer {
    broadcast_address: String,
    tcp_port: u16,
}

impl LookupProducer {
    fn tcp_address(&self) -> String {
        if self.broadcast_address.contains(':') {
            format!("[{}]:{}", self.broadcast_address, self.tcp_port)
        } else {
            format!("{}:{}", self.broadcast_address, self.tcp_port)
        }
    }
}

/// Builds `<base>/lookup?topic=<topic>`; a bare `host:port` gets `http://`.
pub fn lookup_url(base: &str, topic: &str) -> String {
    let base = base.trim_end_matches('/');
    let topic = topic.replace('#', "%23");
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/lookup?topic={topic}")
    } else {
        format!("http://{base}/lookup?topic={topic}")
    }
}

/// Extracts nsqd TCP addresses from a lookup reply.
pub fn parse_lookup_response(body: &[u8]) -> Result<Vec<String>, BrokerError> {
    let resp: LookupResponse = serde_json::from_slice(body)
        .map_err(|e| BrokerError::Lookup(format!("invalid lookup response: {e}")))?;
    let producers = match resp.data {
        Some(data) if resp.producers.is_empty() => data.producers,
        _ => resp.producers,
    };
    Ok(producers.iter().map(LookupProducer::tcp_address).collect())
}

/// Asks one nsqlookupd which nsqd nodes carry `topic`. An unknown topic is
/// not an error; it yields no addresses.
pub async fn lookup(
    client: &reqwest::Client,
    base: &str,
    topic: &str,
) -> Result<Vec<String>, BrokerError> {
    let url = lookup_url(base, topic);
    let resp = client
        .get(&url)
        .header("Accept", "application/vnd.nsq; version=1.0")
        .send()
        .await
        .map_err(|e| BrokerError::Lookup(format!("{url}: {e}")))?;

    if resp.status() == StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }
    if !resp.status().is_success() {
        return Err(BrokerError::Lookup(format!("{url}: HTTP {}", resp.status())));
    }

    let body = resp
        .bytes()
        .await
        .map_err(|e| BrokerError::Lookup(format!("{url}: {e}")))?;
    parse_lookup_response(&body)
}
