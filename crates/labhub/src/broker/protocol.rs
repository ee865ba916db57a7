// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker wire protocol.
//!
//! Messages are JSON objects prefixed with a big-endian u32 length. Every
//! request carries a 64-bit `request_id`; the matching reply echoes it.
//! Binary values (secrets, schema hashes) travel as hex strings so no JSON
//! number-precision rules apply to them. Unknown reply tags are rejected.

use std::io;

/// Requests sent to the broker.
#[derive(Debug, Clone)]
pub enum BrokerRequest {
    /// Register a channel and obtain its segment name and secret.
    Register {
        name: String,
        size: u64,
        flex_size: u64,
        policy: String,
        datablock_schema_hash: [u8; 32],
        flexzone_schema_hash: [u8; 32],
    },

    /// Look up a registered channel.
    Discover { name: String },

    /// Remove a registration.
    Unregister { name: String },
}

/// Replies received from the broker.
#[derive(Debug, Clone)]
pub enum BrokerReply {
    /// Registration accepted.
    Registered {
        request_id: u64,
        shm_name: String,
        secret: u64,
    },

    /// Lookup result.
    Discovered {
        request_id: u64,
        shm_name: String,
        size: u64,
        secret: u64,
    },

    /// Registration removed.
    Unregistered { request_id: u64 },

    /// Broker-side failure.
    Error {
        request_id: u64,
        code: u32,
        message: String,
    },
}

impl BrokerRequest {
    /// Encode to wire format (length prefix + JSON).
    pub fn encode(&self, request_id: u64) -> Vec<u8> {
        let json = self.to_json(request_id);
        let len = json.len() as u32;

        let mut buf = Vec::with_capacity(4 + json.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(json.as_bytes());
        buf
    }

    fn to_json(&self, request_id: u64) -> String {
        match self {
            Self::Register {
                name,
                size,
                flex_size,
                policy,
                datablock_schema_hash,
                flexzone_schema_hash,
            } => format!(
                r#"{{"type":"register","request_id":{},"name":"{}","size":{},"flex_size":{},"policy":"{}","datablock_schema_hash":"{}","flexzone_schema_hash":"{}"}}"#,
                request_id,
                escape(name),
                size,
                flex_size,
                escape(policy),
                hex_encode(datablock_schema_hash),
                hex_encode(flexzone_schema_hash),
            ),

            Self::Discover { name } => format!(
                r#"{{"type":"discover","request_id":{},"name":"{}"}}"#,
                request_id,
                escape(name),
            ),

            Self::Unregister { name } => format!(
                r#"{{"type":"unregister","request_id":{},"name":"{}"}}"#,
                request_id,
                escape(name),
            ),
        }
    }
}

impl BrokerReply {
    /// Decode a reply body (without the length prefix).
    ///
    /// Every reply must be a well-formed object carrying `status`,
    /// `request_id`, and the fields its tag promises; anything else is
    /// rejected before the caller can act on it.
    pub fn decode(data: &[u8]) -> io::Result<Self> {
        let s =
            std::str::from_utf8(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Self::from_json(s)
    }

    fn from_json(s: &str) -> io::Result<Self> {
        let status = extract_string_field(s, "status")?;
        let request_id = extract_u64_field(s, "request_id").ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "Reply missing request_id")
        })?;

        if status == "error" {
            let code = extract_u64_field(s, "code").unwrap_or(0) as u32;
            let message = extract_string_field(s, "message").unwrap_or_default();
            return Ok(Self::Error {
                request_id,
                code,
                message,
            });
        }
        if status != "ok" {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown status: {status}"),
            ));
        }

        let reply_type = extract_string_field(s, "type")?;
        match reply_type.as_str() {
            "registered" => {
                let shm_name = extract_string_field(s, "shm_name")?;
                let secret = extract_hex_u64_field(s, "secret")?;
                Ok(Self::Registered {
                    request_id,
                    shm_name,
                    secret,
                })
            }

            "discovered" => {
                let shm_name = extract_string_field(s, "shm_name")?;
                let size = extract_u64_field(s, "size").ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "Reply missing size")
                })?;
                let secret = extract_hex_u64_field(s, "secret")?;
                Ok(Self::Discovered {
                    request_id,
                    shm_name,
                    size,
                    secret,
                })
            }

            "unregistered" => Ok(Self::Unregistered { request_id }),

            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Unknown reply type: {reply_type}"),
            )),
        }
    }

    /// The echoed request id.
    #[must_use]
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Registered { request_id, .. }
            | Self::Discovered { request_id, .. }
            | Self::Unregistered { request_id }
            | Self::Error { request_id, .. } => *request_id,
        }
    }
}

// ============================================================================
// JSON parsing helpers (minimal, no serde)
// ============================================================================

fn extract_string_field(json: &str, field: &str) -> io::Result<String> {
    let pattern = format!("\"{}\":\"", field);
    if let Some(start) = json.find(&pattern) {
        let value_start = start + pattern.len();
        if let Some(end) = json[value_start..].find('"') {
            return Ok(json[value_start..value_start + end].to_string());
        }
    }
    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Field '{}' not found", field),
    ))
}

fn extract_u64_field(json: &str, field: &str) -> Option<u64> {
    let pattern = format!("\"{}\":", field);
    let start = json.find(&pattern)?;
    let remaining = json[start + pattern.len()..].trim_start();
    let end = remaining
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(remaining.len());
    if end > 0 {
        remaining[..end].parse().ok()
    } else {
        None
    }
}

fn extract_hex_u64_field(json: &str, field: &str) -> io::Result<u64> {
    let hex = extract_string_field(json, field)?;
    u64::from_str_radix(&hex, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, format!("Bad hex in '{field}'")))
}

/// Escape the characters JSON strings cannot carry raw. Channel names are
/// sanitised upstream; this keeps the encoder safe for arbitrary input.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_encode() {
        let msg = BrokerRequest::Register {
            name: "t1".into(),
            size: 8192,
            flex_size: 64,
            policy: "ring_buffer".into(),
            datablock_schema_hash: [0xab; 32],
            flexzone_schema_hash: [0; 32],
        };

        let encoded = msg.encode(42);
        let len = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(len as usize, encoded.len() - 4);

        let json = std::str::from_utf8(&encoded[4..]).unwrap();
        assert!(json.contains(r#""type":"register""#));
        assert!(json.contains(r#""request_id":42"#));
        assert!(json.contains(&"ab".repeat(32)));
    }

    #[test]
    fn test_discover_encode() {
        let msg = BrokerRequest::Discover { name: "t1".into() };
        let encoded = msg.encode(7);
        let json = std::str::from_utf8(&encoded[4..]).unwrap();
        assert_eq!(
            json,
            r#"{"type":"discover","request_id":7,"name":"t1"}"#
        );
    }

    #[test]
    fn test_decode_registered() {
        let json = r#"{"status":"ok","type":"registered","request_id":42,"shm_name":"/labhub_t1","secret":"00000000deadbeef"}"#;
        let reply = BrokerReply::decode(json.as_bytes()).unwrap();

        match reply {
            BrokerReply::Registered {
                request_id,
                shm_name,
                secret,
            } => {
                assert_eq!(request_id, 42);
                assert_eq!(shm_name, "/labhub_t1");
                assert_eq!(secret, 0xdead_beef);
            }
            other => panic!("Expected Registered, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_discovered() {
        let json = r#"{"status":"ok","type":"discovered","request_id":3,"shm_name":"/labhub_t2","size":16384,"secret":"1"}"#;
        let reply = BrokerReply::decode(json.as_bytes()).unwrap();

        match reply {
            BrokerReply::Discovered {
                request_id,
                shm_name,
                size,
                secret,
            } => {
                assert_eq!(request_id, 3);
                assert_eq!(shm_name, "/labhub_t2");
                assert_eq!(size, 16384);
                assert_eq!(secret, 1);
            }
            other => panic!("Expected Discovered, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_reply() {
        let json = r#"{"status":"error","request_id":9,"code":11,"message":"unknown channel"}"#;
        let reply = BrokerReply::decode(json.as_bytes()).unwrap();

        match reply {
            BrokerReply::Error {
                request_id,
                code,
                message,
            } => {
                assert_eq!(request_id, 9);
                assert_eq!(code, 11);
                assert_eq!(message, "unknown channel");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        let json = r#"{"status":"ok","type":"surprise","request_id":1}"#;
        assert!(BrokerReply::decode(json.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_request_id() {
        let json = r#"{"status":"ok","type":"unregistered"}"#;
        assert!(BrokerReply::decode(json.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let json = r#"{"status":"ok","type":"registered","request_id":1}"#;
        assert!(BrokerReply::decode(json.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(BrokerReply::decode(b"not json at all").is_err());
        assert!(BrokerReply::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape("a\\b"), r"a\\b");
        assert_eq!(escape("a\nb"), r"a\nb");
    }
}
