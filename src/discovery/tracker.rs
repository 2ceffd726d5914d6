// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::AnnounceRequest;

use crate::errors::DiscoveryError;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde_bencode::value::Value;
use tracing::{event, Level};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnnounceResponse {
    /// Seconds the endpoint asks us to wait before the next announce.
    pub interval: Option<u64>,
    pub peers: Vec<SocketAddr>,
}

pub fn build_announce_url(endpoint: &str, request: &AnnounceRequest) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        endpoint,
        separator,
        urlencoding::encode_binary(request.content_id.as_bytes()),
        urlencoding::encode_binary(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    );
    if let Some(announce_event) = request.event {
        url.push_str("&event=");
        url.push_str(announce_event.as_str());
    }
    url
}

pub async fn announce(
    client: &reqwest::Client,
    endpoint: &str,
    request: &AnnounceRequest,
) -> Result<AnnounceResponse, DiscoveryError> {
    let url = build_announce_url(endpoint, request);
    event!(Level::DEBUG, %endpoint, "Announcing");

    let http_error = |e: reqwest::Error| DiscoveryError::Http {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    };

    let response = client.get(&url).send().await.map_err(http_error)?;
    let status = response.status();
    if !status.is_success() {
        return Err(DiscoveryError::Http {
            endpoint: endpoint.to_string(),
            reason: format!("HTTP status {}", status),
        });
    }
    let body = response.bytes().await.map_err(http_error)?;
    parse_announce_response(endpoint, &body)
}

pub fn parse_announce_response(
    endpoint: &str,
    body: &[u8],
) -> Result<AnnounceResponse, DiscoveryError> {
    let decode_error = |reason: &str| DiscoveryError::Decode {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    };

    let value: Value =
        serde_bencode::from_bytes(body).map_err(|e| decode_error(&e.to_string()))?;
    let Value::Dict(dict) = value else {
        return Err(decode_error("response is not a dictionary"));
    };

    if let Some(Value::Bytes(reason)) = dict.get(b"failure reason".as_slice()) {
        return Err(DiscoveryError::Refused {
            endpoint: endpoint.to_string(),
            reason: String::from_utf8_lossy(reason).into_owned(),
        });
    }

    let interval = match dict.get(b"interval".as_slice()) {
        Some(Value::Int(secs)) if *secs >= 0 => Some(*secs as u64),
        _ => None,
    };

    let peers = match dict.get(b"peers".as_slice()) {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact)
            .ok_or_else(|| decode_error("compact peer list is not a multiple of 6 bytes"))?,
        Some(Value::List(entries)) => entries.iter().filter_map(parse_peer_entry).collect(),
        Some(_) => return Err(decode_error("peers has an unexpected type")),
        None => Vec::new(),
    };

    Ok(AnnounceResponse { interval, peers })
}

fn parse_compact_peers(bytes: &[u8]) -> Option<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(6)
            .map(|chunk| {
                let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect(),
    )
}

fn parse_peer_entry(entry: &Value) -> Option<SocketAddr> {
    let Value::Dict(peer) = entry else {
        return None;
    };
    let ip = match peer.get(b"ip".as_slice()) {
        Some(Value::Bytes(ip)) => std::str::from_utf8(ip).ok()?.parse::<IpAddr>().ok()?,
        _ => return None,
    };
    let port = match peer.get(b"port".as_slice()) {
        Some(Value::Int(port)) => u16::try_from(*port).ok()?,
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentId;
    use crate::discovery::AnnounceEvent;
    use std::collections::HashMap;

    fn request() -> AnnounceRequest {
        AnnounceRequest {
            content_id: ContentId([0xAB; 20]),
            peer_id: *b"-SL0100-abcdefghijkl",
            port: 6691,
            uploaded: 0,
            downloaded: 10,
            left: 90,
            event: Some(AnnounceEvent::Started),
        }
    }

    fn encode(entries: Vec<(&str, Value)>) -> Vec<u8> {
        let dict: HashMap<Vec<u8>, Value> = entries
            .into_iter()
            .map(|(k, v)| (k.as_bytes().to_vec(), v))
            .collect();
        serde_bencode::to_bytes(&Value::Dict(dict)).unwrap()
    }

    #[test]
    fn test_announce_url_carries_all_parameters() {
        let url = build_announce_url("http://tracker.test/announce", &request());
        assert!(url.starts_with("http://tracker.test/announce?info_hash=%AB%AB"));
        assert!(url.contains("&peer_id=-SL0100-abcdefghijkl"));
        assert!(url.contains("&port=6691"));
        assert!(url.contains("&left=90"));
        assert!(url.contains("&compact=1"));
        assert!(url.ends_with("&event=started"));
    }

    #[test]
    fn test_announce_url_extends_existing_query() {
        let mut req = request();
        req.event = None;
        let url = build_announce_url("http://tracker.test/announce?key=1", &req);
        assert!(url.starts_with("http://tracker.test/announce?key=1&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn test_compact_peers_are_decoded() {
        let body = encode(vec![
            ("interval", Value::Int(900)),
            ("peers", Value::Bytes(vec![127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0, 80])),
        ]);
        let response = parse_announce_response("t", &body).unwrap();
        assert_eq!(response.interval, Some(900));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:80".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_dictionary_peers_are_decoded() {
        let peer = |ip: &str, port: i64| {
            let mut d = HashMap::new();
            d.insert(b"ip".to_vec(), Value::Bytes(ip.as_bytes().to_vec()));
            d.insert(b"port".to_vec(), Value::Int(port));
            Value::Dict(d)
        };
        let body = encode(vec![(
            "peers",
            Value::List(vec![peer("192.168.1.4", 7000), peer("not-an-ip", 1), peer("::1", 9000)]),
        )]);
        let response = parse_announce_response("t", &body).unwrap();
        assert_eq!(
            response.peers,
            vec![
                "192.168.1.4:7000".parse().unwrap(),
                "[::1]:9000".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_failure_reason_is_a_refusal() {
        let body = encode(vec![(
            "failure reason",
            Value::Bytes(b"unregistered content".to_vec()),
        )]);
        match parse_announce_response("t", &body) {
            Err(DiscoveryError::Refused { reason, .. }) => assert_eq!(reason, "unregistered content"),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_a_decode_error() {
        assert!(matches!(
            parse_announce_response("t", b"<html>nope</html>"),
            Err(DiscoveryError::Decode { .. })
        ));
        let body = encode(vec![("peers", Value::Bytes(vec![1, 2, 3]))]);
        assert!(matches!(
            parse_announce_response("t", &body),
            Err(DiscoveryError::Decode { .. })
        ));
    }
}
