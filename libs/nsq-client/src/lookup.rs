use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::NsqError;

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Deserialize)]
struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// Два формата ответа `/lookup`: текущий и старый (`status_code` + `data`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Legacy { data: LookupData },
    Current { producers: Vec<Producer> },
}

impl LookupResponse {
    fn into_addresses(self) -> Vec<String> {
        let producers = match self {
            LookupResponse::Legacy { data } => data.producers,
            LookupResponse::Current { producers } => producers,
        };
        producers
            .into_iter()
            .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
            .collect()
    }
}

/// `host:port` → `http://host:port/lookup?topic=...`.
/// Явно заданные схема и путь сохраняются.
pub fn lookup_url(addr: &str, topic: &str) -> Result<Url, NsqError> {
    let raw = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let mut url = Url::parse(&raw).map_err(|e| NsqError::Lookup {
        addr: addr.to_string(),
        detail: format!("bad address: {e}"),
    })?;
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/lookup");
    }
    url.query_pairs_mut().append_pair("topic", topic);
    Ok(url)
}

/// Запросить у lookupd адреса nsqd, на которых есть topic.
/// Неизвестный lookupd'у topic: пустой список, не ошибка.
pub async fn query_lookupd(
    client: &reqwest::Client,
    addr: &str,
    topic: &str,
) -> Result<Vec<String>, NsqError> {
    let url = lookup_url(addr, topic)?;
    tracing::debug!(lookupd = %addr, %url, "querying lookupd");

    let resp = client.get(url).header("Accept", "application/vnd.nsq; version=1.0").send().await?;
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        tracing::debug!(lookupd = %addr, %topic, "topic not found");
        return Ok(Vec::new());
    }
    if !status.is_success() {
        return Err(NsqError::Lookup {
            addr: addr.to_string(),
            detail: format!("unexpected status {status}"),
        });
    }

    let body = resp.bytes().await?;
    parse_lookup_response(&body).map_err(|e| NsqError::Lookup {
        addr: addr.to_string(),
        detail: format!("bad response: {e}"),
    })
}

fn parse_lookup_response(body: &[u8]) -> Result<Vec<String>, serde_json::Error> {
    let resp: LookupResponse = serde_json::from_slice(body)?;
    Ok(resp.into_addresses())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builds_lookup_url_from_host_port() {
        let url = lookup_url("localhost:4161", "LOG").unwrap();
        assert_eq!(url.as_str(), "http://localhost:4161/lookup?topic=LOG");
    }

    #[test]
    fn keeps_explicit_scheme_and_path() {
        let url = lookup_url("https://lookupd.internal/v1/lookup", "a.b").unwrap();
        assert_eq!(url.as_str(), "https://lookupd.internal/v1/lookup?topic=a.b");
    }

    #[test]
    fn parses_current_response() {
        let body = br#"{"channels":["tailn"],"producers":[
            {"remote_address":"10.0.0.5:51234","hostname":"n1","broadcast_address":"n1.local","tcp_port":4150,"http_port":4151,"version":"1.2.1"},
            {"broadcast_address":"n2.local","tcp_port":4250}
        ]}"#;
        assert_eq!(parse_lookup_response(body).unwrap(), vec!["n1.local:4150", "n2.local:4250"]);
    }

    #[test]
    fn parses_legacy_response() {
        let body = br#"{"status_code":200,"status_txt":"OK","data":{"channels":[],"producers":[{"broadcast_address":"old","tcp_port":4150}]}}"#;
        assert_eq!(parse_lookup_response(body).unwrap(), vec!["old:4150"]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_lookup_response(b"<html>").is_err());
    }
}
