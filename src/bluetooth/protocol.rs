// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line protocol spoken between a mobile and a sidekick beacon.
//!
//! Messages are plain ASCII, space delimited, one command per line:
//!
//! ```text
//! REGISTER                      mobile -> beacon
//! REPORT                        mobile -> beacon
//! LIST                          mobile -> beacon
//! DELETE <addr,addr,...>        mobile -> beacon
//! RWO <window_ms>               beacon -> mobile
//! RLIST <name|addr|status,...>  beacon -> mobile
//! OK <data>                     beacon -> mobile
//! ERR:<data>                    beacon -> mobile
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{FinderError, FinderResult};

/// Report window used when an RWO value is missing or unparsable.
pub const DEFAULT_REPORT_WINDOW_MS: u64 = 10_000;

/// Registration status carried by an RLIST item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GuardStatus {
    Guarded,
    NotGuarded,
}

impl GuardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Guarded => "Guarded",
            Self::NotGuarded => "Not Guarded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Guarded" => Some(Self::Guarded),
            "Not Guarded" => Some(Self::NotGuarded),
            _ => None,
        }
    }
}

/// One entry of an RLIST response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub name: String,
    pub address: String,
    pub status: GuardStatus,
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register,
    Report,
    List,
    Delete(Vec<String>),
    /// Report window offset in milliseconds.
    Rwo(u64),
    RList(Vec<ListItem>),
    Ok(String),
    Err(String),
}

impl Message {
    /// Command keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::Report => "REPORT",
            Self::List => "LIST",
            Self::Delete(_) => "DELETE",
            Self::Rwo(_) => "RWO",
            Self::RList(_) => "RLIST",
            Self::Ok(_) => "OK",
            Self::Err(_) => "ERR",
        }
    }

    /// Requests travel mobile -> beacon, everything else is a response.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::Register | Self::Report | Self::List | Self::Delete(_)
        )
    }

    /// Serialize to the wire text, without a terminator.
    pub fn encode(&self) -> String {
        match self {
            Self::Register | Self::Report | Self::List => self.keyword().to_string(),
            Self::Delete(addresses) => format!("DELETE {}", addresses.join(",")),
            Self::Rwo(window) => format!("RWO {}", window),
            Self::RList(items) => {
                let items: Vec<String> = items.iter().map(encode_list_item).collect();
                if items.is_empty() {
                    "RLIST".to_string()
                } else {
                    format!("RLIST {}", items.join(","))
                }
            }
            Self::Ok(data) if data.is_empty() => "OK".to_string(),
            Self::Ok(data) => format!("OK {}", data),
            Self::Err(data) => format!("ERR:{}", data),
        }
    }

    /// An RLIST holding the leading `items` whose line stays within
    /// `max_line` bytes, newline excluded. Also returns how many were left out.
    pub fn rlist_within(items: Vec<ListItem>, max_line: usize) -> (Self, usize) {
        let mut len = "RLIST".len();
        let mut kept = Vec::with_capacity(items.len());
        let total = items.len();
        for item in items {
            let item_len = 1 + encode_list_item(&item).len();
            if len + item_len > max_line {
                break;
            }
            len += item_len;
            kept.push(item);
        }
        let left_out = total - kept.len();
        (Self::RList(kept), left_out)
    }

    /// Serialize to bytes, newline terminated.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut line = self.encode();
        line.push('\n');
        line.into_bytes()
    }

    /// Parse a single message.
    pub fn parse(text: &str) -> FinderResult<Self> {
        let trimmed = text.trim_matches(|c: char| c.is_whitespace() || c == '\0' || c == ';');
        if trimmed.is_empty() {
            return Err(FinderError::MalformedMessage("empty message".to_string()));
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "ERR:") {
            return Ok(Self::Err(rest.trim().to_string()));
        }

        let (keyword, args) = match trimmed.split_once(char::is_whitespace) {
            Some((keyword, args)) => (keyword, args.trim()),
            None => (trimmed, ""),
        };

        match keyword.to_ascii_uppercase().as_str() {
            "REGISTER" => no_arguments(Self::Register, args),
            "REPORT" => no_arguments(Self::Report, args),
            "LIST" => no_arguments(Self::List, args),
            "DELETE" => {
                let addresses = split_list(args);
                if addresses.is_empty() {
                    return Err(FinderError::MalformedMessage(
                        "DELETE without addresses".to_string(),
                    ));
                }
                Ok(Self::Delete(addresses))
            }
            "RWO" => {
                let fields: Vec<&str> = args.split_whitespace().collect();
                if fields.len() != 1 {
                    return Err(FinderError::MalformedMessage(format!(
                        "RWO expects 1 field, got {}",
                        fields.len()
                    )));
                }
                let window = fields[0].parse::<u64>().unwrap_or_else(|_| {
                    warn!(
                        "Unparsable report window {:?}, using {} ms",
                        fields[0], DEFAULT_REPORT_WINDOW_MS
                    );
                    DEFAULT_REPORT_WINDOW_MS
                });
                Ok(Self::Rwo(window))
            }
            "RLIST" => {
                let mut items = Vec::new();
                for raw in split_list(args) {
                    items.push(parse_list_item(&raw)?);
                }
                Ok(Self::RList(items))
            }
            "OK" => Ok(Self::Ok(args.to_string())),
            "ERR" => Ok(Self::Err(args.to_string())),
            other => Err(FinderError::MalformedMessage(format!(
                "unknown command {:?}",
                other
            ))),
        }
    }

    /// Parse raw bytes holding a single message.
    pub fn from_bytes(data: &[u8]) -> FinderResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| FinderError::MalformedMessage(format!("invalid UTF-8: {}", e)))?;
        Self::parse(text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Decode every message in a received chunk.
///
/// A chunk may carry several newline or `;` separated messages. Malformed
/// ones are logged and dropped.
pub fn decode_stream(data: &[u8]) -> Vec<Message> {
    let text = String::from_utf8_lossy(data);
    text.split(|c| c == '\n' || c == '\r' || c == ';')
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match Message::parse(line) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping message {:?}: {}", line.trim(), e);
                None
            }
        })
        .collect()
}

fn no_arguments(message: Message, args: &str) -> FinderResult<Message> {
    if args.is_empty() {
        Ok(message)
    } else {
        Err(FinderError::MalformedMessage(format!(
            "{} takes no arguments, got {:?}",
            message.keyword(),
            args
        )))
    }
}

fn split_list(args: &str) -> Vec<String> {
    args.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn encode_list_item(item: &ListItem) -> String {
    format!(
        "{}|{}|{}",
        sanitize_field(&item.name),
        item.address,
        item.status.as_str()
    )
}

fn parse_list_item(raw: &str) -> FinderResult<ListItem> {
    let fields: Vec<&str> = raw.split('|').collect();
    if fields.len() != 3 {
        return Err(FinderError::MalformedMessage(format!(
            "RLIST item {:?} has {} fields",
            raw,
            fields.len()
        )));
    }
    let status = GuardStatus::parse(fields[2]).ok_or_else(|| {
        FinderError::MalformedMessage(format!("unknown guard status {:?}", fields[2]))
    })?;
    Ok(ListItem {
        name: fields[0].trim().to_string(),
        address: fields[1].trim().to_string(),
        status,
    })
}

fn sanitize_field(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            ',' | '|' | ';' | '\n' | '\r' => '_',
            c => c,
        })
        .collect()
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if text.len() >= prefix.len()
        && text.is_char_boundary(prefix.len())
        && text[..prefix.len()].eq_ignore_ascii_case(prefix)
    {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}
