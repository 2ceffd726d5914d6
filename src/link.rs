// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::content::{ContentDescriptor, ContentId};
use crate::errors::EngineError;

use data_encoding::BASE32;
use magnet_url::Magnet;
use reqwest::Url;
use urlencoding::{decode, encode};

use std::fmt;
use std::str::FromStr;

use tracing::{event, Level};

/// Shareable reference to a piece of content.
///
/// Rendered as `magnet:?xt=urn:btih:<hex id>&dn=<name>&xl=<size>&tr=<endpoint>...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareLink {
    pub content_id: ContentId,
    pub display_name: String,
    pub total_length: u64,
    pub endpoints: Vec<String>,
}

impl ShareLink {
    pub fn publish(descriptor: &ContentDescriptor, endpoints: &[String]) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            if !unique.contains(endpoint) {
                unique.push(endpoint.clone());
            }
        }
        Self {
            content_id: descriptor.content_id,
            display_name: descriptor.name.clone(),
            total_length: descriptor.total_length,
            endpoints: unique,
        }
    }

    pub fn resolve(link: &str) -> Result<Self, EngineError> {
        let link = link.trim();
        if !link.starts_with("magnet:?") {
            return Err(EngineError::malformed_link("not a magnet URI"));
        }

        let magnet = Magnet::new(link)
            .map_err(|e| EngineError::malformed_link(format!("unparsable link: {:?}", e)))?;

        match magnet.hash_type() {
            Some("btih") => {}
            Some(other) => {
                return Err(EngineError::malformed_link(format!(
                    "unsupported identifier type '{}'",
                    other
                )))
            }
            None => return Err(EngineError::malformed_link("missing content identifier")),
        }
        let hash = magnet
            .hash()
            .ok_or_else(|| EngineError::malformed_link("missing content identifier"))?;
        let content_id = decode_content_id(&hash)?;

        let mut endpoints: Vec<String> = Vec::new();
        for raw in magnet.trackers() {
            let decoded = decode(raw)
                .map_err(|e| EngineError::malformed_link(format!("endpoint is not UTF-8: {}", e)))?
                .into_owned();
            Url::parse(&decoded).map_err(|e| {
                EngineError::malformed_link(format!("endpoint '{}' is not a URL: {}", decoded, e))
            })?;
            if !endpoints.contains(&decoded) {
                endpoints.push(decoded);
            }
        }

        let display_name = match magnet.display_name() {
            Some(name) => decode(&name.replace('+', " "))
                .map(|n| n.into_owned())
                .unwrap_or_else(|_| name.to_string()),
            None => content_id.to_hex(),
        };

        event!(
            Level::DEBUG,
            content_id = %content_id,
            endpoints = endpoints.len(),
            "Share link resolved"
        );

        Ok(Self {
            content_id,
            display_name,
            total_length: magnet.length().unwrap_or(0),
            endpoints,
        })
    }

    pub fn to_uri(&self) -> String {
        let mut uri = format!(
            "magnet:?xt=urn:btih:{}&dn={}&xl={}",
            self.content_id.to_hex(),
            encode(&self.display_name),
            self.total_length
        );
        for endpoint in &self.endpoints {
            uri.push_str("&tr=");
            uri.push_str(&encode(endpoint));
        }
        uri
    }
}

fn decode_content_id(hash: &str) -> Result<ContentId, EngineError> {
    let bytes = match hash.len() {
        40 => hex::decode(hash)
            .map_err(|e| EngineError::malformed_link(format!("invalid hex identifier: {}", e)))?,
        32 => BASE32
            .decode(hash.to_uppercase().as_bytes())
            .map_err(|e| EngineError::malformed_link(format!("invalid base32 identifier: {}", e)))?,
        n => {
            return Err(EngineError::malformed_link(format!(
                "identifier has length {}, expected 40 hex or 32 base32 characters",
                n
            )))
        }
    };
    ContentId::from_slice(&bytes)
        .ok_or_else(|| EngineError::malformed_link("identifier is not 20 bytes"))
}

impl fmt::Display for ShareLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for ShareLink {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::addresser::address_buffers;

    fn descriptor() -> ContentDescriptor {
        address_buffers(
            &[("holiday photos.zip".to_string(), vec![42u8; 3000])],
            1024,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_publish_then_resolve_recovers_the_link() {
        let d = descriptor();
        let link = ShareLink::publish(
            &d,
            &[
                "http://tracker.example:8080/announce".to_string(),
                "http://backup.example/announce?key=a&b=c".to_string(),
            ],
        );

        let resolved = ShareLink::resolve(&link.to_string()).unwrap();
        assert_eq!(resolved.content_id, d.content_id);
        assert_eq!(resolved.display_name, "holiday photos.zip");
        assert_eq!(resolved.total_length, 3000);
        assert_eq!(resolved.endpoints, link.endpoints);
    }

    #[test]
    fn test_base32_identifier_is_accepted() {
        let d = descriptor();
        let b32 = BASE32.encode(d.content_id.as_bytes());
        let uri = format!("magnet:?xt=urn:btih:{}&dn=x", b32);
        let resolved: ShareLink = uri.parse().unwrap();
        assert_eq!(resolved.content_id, d.content_id);
        assert!(resolved.endpoints.is_empty());
    }

    #[test]
    fn test_missing_identifier_is_malformed() {
        let result = ShareLink::resolve("magnet:?dn=nothing&tr=http%3A%2F%2Fa.example%2Fannounce");
        assert!(matches!(result, Err(EngineError::MalformedLink { .. })));
    }

    #[test]
    fn test_garbage_is_malformed() {
        for input in ["", "hello", "http://example.com", "magnet:?xt=urn:btih:zz"] {
            assert!(
                matches!(ShareLink::resolve(input), Err(EngineError::MalformedLink { .. })),
                "'{}' should be rejected",
                input
            );
        }
    }

    #[test]
    fn test_unparsable_endpoint_is_malformed() {
        let d = descriptor();
        let uri = format!("magnet:?xt=urn:btih:{}&tr=not%20a%20url", d.content_id.to_hex());
        assert!(matches!(
            ShareLink::resolve(&uri),
            Err(EngineError::MalformedLink { .. })
        ));
    }

    #[test]
    fn test_duplicate_endpoints_collapse() {
        let d = descriptor();
        let endpoint = "http://tracker.example/announce".to_string();
        let link = ShareLink::publish(&d, &[endpoint.clone(), endpoint.clone()]);
        assert_eq!(link.endpoints, vec![endpoint]);
    }

    #[test]
    fn test_endpoints_round_trip_without_normalisation() {
        let d = descriptor();
        let endpoints = vec![
            "http://tracker.example".to_string(),
            "http://TRACKER.example:80/announce".to_string(),
        ];
        let link = ShareLink::publish(&d, &endpoints);
        assert_eq!(link.endpoints, endpoints);

        let resolved = ShareLink::resolve(&link.to_string()).unwrap();
        assert_eq!(resolved.endpoints, endpoints);
        assert_eq!(resolved, link);
    }
}
