//! Handler keys.
//!
//! A key names an operation by effect and op name, optionally pinned to one
//! signature: `rill.time::sleep` or `rill.time::sleep::0x1a2b3c4d`. The
//! signature hash may be written in decimal or `0x` hex; it is always
//! normalized to `0x%08x`.

use std::fmt;
use std::str::FromStr;

use rill_runtime::format_signature_hash;

use crate::error::{HostError, Result};
use crate::protocol::EffectOpQuery;

const SEPARATOR: &str = "::";

/// A parsed handler key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerKey {
    pub effect_id: String,
    pub op_name: String,
    /// Normalized `0x%08x`.
    pub signature_hash: Option<String>,
}

impl HandlerKey {
    pub fn new(effect_id: impl Into<String>, op_name: impl Into<String>) -> Self {
        Self {
            effect_id: effect_id.into(),
            op_name: op_name.into(),
            signature_hash: None,
        }
    }

    pub fn with_signature(mut self, hash: u32) -> Self {
        self.signature_hash = Some(format_signature_hash(hash));
        self
    }

    pub fn parse(key: &str) -> Result<Self> {
        let invalid = |reason: &str| HostError::InvalidKey {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        let (effect_id, op_name, hash) = match parts.as_slice() {
            [effect, op] => (*effect, *op, None),
            [effect, op, hash] => (*effect, *op, Some(*hash)),
            _ => return Err(invalid("expected `effect::op` or `effect::op::signature`")),
        };
        if effect_id.is_empty() {
            return Err(invalid("empty effect id"));
        }
        if op_name.is_empty() {
            return Err(invalid("empty op name"));
        }
        let signature_hash = hash
            .map(|h| normalize_signature_hash(h).map_err(|_| invalid("signature hash is not a u32")))
            .transpose()?;
        Ok(Self {
            effect_id: effect_id.to_string(),
            op_name: op_name.to_string(),
            signature_hash,
        })
    }

    pub fn to_query(&self) -> EffectOpQuery {
        EffectOpQuery {
            effect_id: self.effect_id.clone(),
            op_name: self.op_name.clone(),
            signature_hash: self.signature_hash.clone(),
        }
    }
}

impl FromStr for HandlerKey {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.effect_id, SEPARATOR, self.op_name)?;
        if let Some(hash) = &self.signature_hash {
            write!(f, "{}{}", SEPARATOR, hash)?;
        }
        Ok(())
    }
}

/// Parse a decimal or `0x` hex hash.
pub fn parse_signature_hash(text: &str) -> Result<u32> {
    let text = text.trim();
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    parsed.map_err(|_| HostError::InvalidKey {
        key: text.to_string(),
        reason: "signature hash is not a u32".to_string(),
    })
}

/// Parse and render as `0x%08x`.
pub fn normalize_signature_hash(text: &str) -> Result<String> {
    parse_signature_hash(text).map(format_signature_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decimal_hash_is_normalized() {
        let key = HandlerKey::parse("rill.time::sleep::18").unwrap();
        assert_eq!(key.signature_hash.as_deref(), Some("0x00000012"));
        assert_eq!(key.to_string(), "rill.time::sleep::0x00000012");
    }

    #[test]
    fn test_hex_hash_and_plain_key() {
        let key: HandlerKey = "rill.fs::read::0xABCD".parse().unwrap();
        assert_eq!(key.signature_hash.as_deref(), Some("0x0000abcd"));

        let key = HandlerKey::parse("rill.fs::read").unwrap();
        assert_eq!(key.signature_hash, None);
        assert_eq!(key.effect_id, "rill.fs");
    }

    #[test]
    fn test_malformed_keys() {
        for bad in ["rill.fs", "::read", "rill.fs::", "a::b::c::d", "a::b::0xnope", "a::b::4294967296"] {
            assert!(
                matches!(HandlerKey::parse(bad), Err(HostError::InvalidKey { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_builder_matches_parse() {
        let built = HandlerKey::new("rill.time", "now").with_signature(0x12);
        assert_eq!(built, HandlerKey::parse("rill.time::now::0x12").unwrap());
    }
}
