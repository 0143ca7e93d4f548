//! Stack types and decoding for the Subscription contract getter.
//!
//! A getter returns an ordered stack of `(type, value)` entries with hex-encoded numbers.
//! `get_subscription(addr)` returns `[num tier, num expires_at]`; a record-less address
//! returns `[num 0x0, num 0x0]` (or a leading `null` from gateways that collapse it).
//! Decoding is total over tier codes: anything unknown is `Free`.

use crate::tier::Tier;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Type tag for integer entries.
pub const TAG_NUM: &str = "num";
/// Alternate integer tag used by some gateways.
pub const TAG_INT: &str = "int";
/// Explicit absence marker.
pub const TAG_NULL: &str = "null";
/// Wallet address argument. The HTTP client sends it as a `tvm.Slice` cell.
pub const TAG_ADDR: &str = "addr";

/// Largest expiry a decoder accepts. Stores keep timestamps as signed 64-bit integers.
pub const MAX_EXPIRY: u64 = i64::MAX as u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("stack too short: expected at least 2 entries, got {len}")]
    ShortStack { len: usize },
    #[error("entry {index}: expected num, got {tag}")]
    UnexpectedType { index: usize, tag: String },
    #[error("entry {index}: invalid hex number {value:?}")]
    InvalidNumber { index: usize, value: String },
    #[error("expiry {0} is past the largest storable timestamp")]
    ExpiryOutOfRange(u64),
}

/// One typed stack entry. Serializes as `{"type": .., "value": ..}`; deserializes from that
/// or from the `["num", "0x1"]` pair form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackEntry {
    #[serde(rename = "type")]
    pub type_tag: String,
    pub value: String,
}

/// Classified view of a [StackEntry].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackValue<'a> {
    Num(&'a str),
    Null,
    Other(&'a str),
}

impl StackEntry {
    pub fn new(type_tag: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            value: value.into(),
        }
    }

    pub fn num(n: u64) -> Self {
        Self::new(TAG_NUM, format!("0x{:x}", n))
    }

    pub fn null() -> Self {
        Self::new(TAG_NULL, "")
    }

    pub fn address(addr: &str) -> Self {
        Self::new(TAG_ADDR, addr)
    }

    pub fn classify(&self) -> StackValue<'_> {
        match self.type_tag.as_str() {
            TAG_NUM | TAG_INT => StackValue::Num(&self.value),
            TAG_NULL => StackValue::Null,
            other => StackValue::Other(other),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStackEntry {
    Object {
        #[serde(rename = "type")]
        type_tag: String,
        #[serde(default)]
        value: Value,
    },
    Array(Vec<Value>),
}

fn value_to_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl<'de> Deserialize<'de> for StackEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match RawStackEntry::deserialize(deserializer)? {
            RawStackEntry::Object { type_tag, value } => Ok(StackEntry {
                type_tag,
                value: value_to_string(value),
            }),
            RawStackEntry::Array(items) => {
                let mut items = items.into_iter();
                let type_tag = match items.next() {
                    Some(Value::String(s)) => s,
                    _ => return Err(serde::de::Error::custom("stack entry: missing type tag")),
                };
                let value = items.next().map(value_to_string).unwrap_or_default();
                Ok(StackEntry { type_tag, value })
            }
        }
    }
}

/// Decoded getter result: tier and absolute expiry (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedSubscription {
    pub tier: Tier,
    pub expires_at: u64,
}

impl DecodedSubscription {
    pub fn absent() -> Self {
        Self {
            tier: Tier::Free,
            expires_at: 0,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.tier == Tier::Free && self.expires_at == 0
    }
}

/// Decode a `get_subscription` stack into tier and expiry.
pub fn decode_subscription(stack: &[StackEntry]) -> Result<DecodedSubscription, DecodeError> {
    if let Some(StackValue::Null) = stack.first().map(StackEntry::classify) {
        return Ok(DecodedSubscription::absent());
    }
    if stack.len() < 2 {
        return Err(DecodeError::ShortStack { len: stack.len() });
    }
    let tier = decode_tier(&stack[0], 0)?;
    let expires_at = decode_u64(&stack[1], 1)?;
    if expires_at > MAX_EXPIRY {
        return Err(DecodeError::ExpiryOutOfRange(expires_at));
    }
    Ok(DecodedSubscription { tier, expires_at })
}

/// Encode a subscription into the getter's stack shape.
pub fn encode_subscription(sub: &DecodedSubscription) -> Vec<StackEntry> {
    vec![
        StackEntry::num(sub.tier.code() as u64),
        StackEntry::num(sub.expires_at),
    ]
}

fn num_str(entry: &StackEntry, index: usize) -> Result<&str, DecodeError> {
    match entry.classify() {
        StackValue::Num(s) => Ok(s),
        StackValue::Null => Err(DecodeError::UnexpectedType {
            index,
            tag: TAG_NULL.to_string(),
        }),
        StackValue::Other(tag) => Err(DecodeError::UnexpectedType {
            index,
            tag: tag.to_string(),
        }),
    }
}

/// Split sign and `0x` prefix, validate digits. Returns (negative, digits).
fn split_hex(s: &str, index: usize) -> Result<(bool, &str), DecodeError> {
    let invalid = || DecodeError::InvalidNumber {
        index,
        value: s.to_string(),
    };
    let trimmed = s.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, trimmed),
    };
    let digits = rest
        .strip_prefix("0x")
        .or_else(|| rest.strip_prefix("0X"))
        .unwrap_or(rest);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    Ok((negative, digits))
}

fn decode_tier(entry: &StackEntry, index: usize) -> Result<Tier, DecodeError> {
    let (negative, digits) = split_hex(num_str(entry, index)?, index)?;
    if negative {
        return Ok(Tier::Free);
    }
    // Overflowing codes are out of range as well.
    let code = u128::from_str_radix(digits, 16)
        .ok()
        .and_then(|c| i128::try_from(c).ok())
        .unwrap_or(i128::MAX);
    Ok(Tier::from_code(code))
}

fn decode_u64(entry: &StackEntry, index: usize) -> Result<u64, DecodeError> {
    let raw = num_str(entry, index)?;
    let (negative, digits) = split_hex(raw, index)?;
    let invalid = || DecodeError::InvalidNumber {
        index,
        value: raw.to_string(),
    };
    if negative {
        return Err(invalid());
    }
    u64::from_str_radix(digits, 16).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stack(entries: &[(&str, &str)]) -> Vec<StackEntry> {
        entries.iter().map(|(t, v)| StackEntry::new(*t, *v)).collect()
    }

    #[test]
    fn decodes_tier_and_expiry() {
        let s = stack(&[("num", "0x2"), ("num", "0x6553f100")]);
        let d = decode_subscription(&s).unwrap();
        assert_eq!(d.tier, Tier::Pro);
        assert_eq!(d.expires_at, 0x6553f100);
    }

    #[test]
    fn prefix_is_optional() {
        let s = stack(&[("int", "3"), ("num", "ff")]);
        let d = decode_subscription(&s).unwrap();
        assert_eq!(d.tier, Tier::Elite);
        assert_eq!(d.expires_at, 255);
    }

    #[test]
    fn zero_pair_is_absence() {
        let d = decode_subscription(&encode_subscription(&DecodedSubscription::absent())).unwrap();
        assert!(d.is_absent());
        assert_eq!(d.tier, Tier::Free);
    }

    #[test]
    fn leading_null_is_absence() {
        let d = decode_subscription(&[StackEntry::null()]).unwrap();
        assert!(d.is_absent());
    }

    #[test]
    fn unknown_tier_codes_decode_to_free() {
        for code in ["0x4", "0xff", "-0x1", "0xffffffffffffffffffffffffffffffffffffffff"] {
            let s = stack(&[("num", code), ("num", "0x10")]);
            let d = decode_subscription(&s).unwrap();
            assert_eq!(d.tier, Tier::Free, "code {code}");
            assert_eq!(d.expires_at, 16);
        }
    }

    #[test]
    fn short_stack_is_error() {
        assert_eq!(
            decode_subscription(&[]),
            Err(DecodeError::ShortStack { len: 0 })
        );
        assert_eq!(
            decode_subscription(&stack(&[("num", "0x1")])),
            Err(DecodeError::ShortStack { len: 1 })
        );
    }

    #[test]
    fn wrong_type_and_bad_hex_are_errors() {
        let s = stack(&[("cell", "te6cc"), ("num", "0x1")]);
        assert!(matches!(
            decode_subscription(&s),
            Err(DecodeError::UnexpectedType { index: 0, .. })
        ));
        let s = stack(&[("num", "0x1"), ("num", "0xzz")]);
        assert!(matches!(
            decode_subscription(&s),
            Err(DecodeError::InvalidNumber { index: 1, .. })
        ));
        let s = stack(&[("num", "0x1"), ("num", "-0x5")]);
        assert!(matches!(
            decode_subscription(&s),
            Err(DecodeError::InvalidNumber { index: 1, .. })
        ));
    }

    #[test]
    fn round_trips_every_tier() {
        for tier in Tier::ALL {
            for expires_at in [0, 1, 1_700_000_000, MAX_EXPIRY] {
                let sub = DecodedSubscription { tier, expires_at };
                assert_eq!(decode_subscription(&encode_subscription(&sub)).unwrap(), sub);
            }
        }
    }

    #[test]
    fn expiry_past_signed_range_is_error() {
        let s = stack(&[("num", "0x2"), ("num", "0x8000000000000000")]);
        assert_eq!(
            decode_subscription(&s),
            Err(DecodeError::ExpiryOutOfRange(1 << 63))
        );
        let s = stack(&[("num", "0x2"), ("num", "0x7fffffffffffffff")]);
        assert_eq!(decode_subscription(&s).unwrap().expires_at, MAX_EXPIRY);
    }

    #[test]
    fn deserializes_object_and_pair_forms() {
        let v = json!([{"type": "num", "value": "0x1"}, ["num", "0x2a"], ["null"]]);
        let entries: Vec<StackEntry> = serde_json::from_value(v).unwrap();
        assert_eq!(entries[0], StackEntry::new("num", "0x1"));
        assert_eq!(entries[1], StackEntry::new("num", "0x2a"));
        assert_eq!(entries[2].classify(), StackValue::Null);
    }

    #[test]
    fn serializes_object_form() {
        let v = serde_json::to_value(StackEntry::num(26)).unwrap();
        assert_eq!(v, json!({"type": "num", "value": "0x1a"}));
    }
}
