// SPDX-FileCopyrightText: 2025 The seedlink Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use super::ContentDescriptor;
use crate::errors::MetainfoError;

use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;

/// A descriptor bundled with its discovery endpoints, stored as a bencoded
/// `{announce, announce-list, created by, info}` dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct Metainfo {
    pub descriptor: ContentDescriptor,
    pub endpoints: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct RawMetainfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    announce: Option<String>,

    #[serde(rename = "announce-list", default, skip_serializing_if = "Option::is_none")]
    announce_list: Option<Vec<Vec<String>>>,

    #[serde(rename = "created by", default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,

    info: Value,
}

impl Metainfo {
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetainfoError> {
        let info: Value = serde_bencode::from_bytes(self.descriptor.info_bytes())?;
        let raw = RawMetainfo {
            announce: self.endpoints.first().cloned(),
            announce_list: if self.endpoints.is_empty() {
                None
            } else {
                Some(self.endpoints.iter().map(|e| vec![e.clone()]).collect())
            },
            created_by: Some(concat!("seedlink/", env!("CARGO_PKG_VERSION")).to_string()),
            info,
        };
        Ok(serde_bencode::to_bytes(&raw)?)
    }

    pub fn from_bytes(bencode_data: &[u8]) -> Result<Self, MetainfoError> {
        let generic: Value = serde_bencode::from_bytes(bencode_data)?;
        let Value::Dict(mut top_level) = generic else {
            return Err(MetainfoError::MissingInfoDict);
        };
        let info_value = top_level
            .remove("info".as_bytes())
            .ok_or(MetainfoError::MissingInfoDict)?;

        // Re-encoding yields the canonical (sorted) form the identifier is taken over.
        let info_bytes = serde_bencode::to_bytes(&info_value)?;
        let descriptor = ContentDescriptor::from_info_bytes(&info_bytes)?;

        let raw: RawMetainfo = serde_bencode::from_bytes(bencode_data)?;
        let mut endpoints: Vec<String> = Vec::new();
        let tiers = raw.announce_list.unwrap_or_default();
        for url in raw.announce.into_iter().chain(tiers.into_iter().flatten()) {
            if !endpoints.contains(&url) {
                endpoints.push(url);
            }
        }

        Ok(Self {
            descriptor,
            endpoints,
        })
    }
}
