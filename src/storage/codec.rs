//! Pluggable compression for stored values.
//!
//! The storage manager only sees bytes in and bytes out, so a real algorithm
//! can replace the textual codecs here without touching quota or eviction
//! logic. Textual codecs keep their output inside the JSON envelope as-is;
//! binary codecs are base64-encoded by the manager.

use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub trait Codec: Send + Sync {
  /// Identifier recorded in the envelope so readers can refuse a mismatch.
  fn name(&self) -> &'static str;

  /// Whether the output is always valid UTF-8.
  fn is_textual(&self) -> bool {
    false
  }

  fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;

  fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Drops whitespace outside of JSON string literals.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinifyCodec;

impl Codec for MinifyCodec {
  fn name(&self) -> &'static str {
    "minify"
  }

  fn is_textual(&self) -> bool {
    true
  }

  fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;

    for &b in input {
      if in_string {
        out.push(b);
        if escaped {
          escaped = false;
        } else if b == b'\\' {
          escaped = true;
        } else if b == b'"' {
          in_string = false;
        }
        continue;
      }
      match b {
        b' ' | b'\n' | b'\r' | b'\t' => {}
        b'"' => {
          in_string = true;
          out.push(b);
        }
        _ => out.push(b),
      }
    }

    Ok(out)
  }

  fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
    Ok(input.to_vec())
  }
}

/// Minifies and replaces object keys with short tokens.
///
/// Cached record lists repeat the same field names in every element, so a
/// key dictionary removes most of their structural overhead. Output layout:
/// `{"k":["created_at","id",...],"v":<value with keys replaced by indexes>}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyTokenCodec;

impl KeyTokenCodec {
  fn collect_keys(value: &Value, keys: &mut BTreeMap<String, usize>) {
    match value {
      Value::Object(map) => {
        for (k, v) in map {
          *keys.entry(k.clone()).or_insert(0) += 1;
          Self::collect_keys(v, keys);
        }
      }
      Value::Array(items) => items.iter().for_each(|v| Self::collect_keys(v, keys)),
      _ => {}
    }
  }

  fn encode(value: Value, tokens: &BTreeMap<String, String>) -> Value {
    match value {
      Value::Object(map) => Value::Object(
        map
          .into_iter()
          .map(|(k, v)| {
            let token = tokens.get(&k).cloned().unwrap_or(k);
            (token, Self::encode(v, tokens))
          })
          .collect(),
      ),
      Value::Array(items) => {
        Value::Array(items.into_iter().map(|v| Self::encode(v, tokens)).collect())
      }
      other => other,
    }
  }

  fn decode(value: Value, dictionary: &[String]) -> Result<Value> {
    match value {
      Value::Object(map) => {
        let mut out = Map::with_capacity(map.len());
        for (token, v) in map {
          let key = token
            .parse::<usize>()
            .ok()
            .and_then(|i| dictionary.get(i))
            .ok_or_else(|| eyre!("Unknown key token '{}'", token))?;
          out.insert(key.clone(), Self::decode(v, dictionary)?);
        }
        Ok(Value::Object(out))
      }
      Value::Array(items) => Ok(Value::Array(
        items
          .into_iter()
          .map(|v| Self::decode(v, dictionary))
          .collect::<Result<_>>()?,
      )),
      other => Ok(other),
    }
  }
}

impl Codec for KeyTokenCodec {
  fn name(&self) -> &'static str {
    "keytoken"
  }

  fn is_textual(&self) -> bool {
    true
  }

  fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
    let value: Value =
      serde_json::from_slice(input).map_err(|e| eyre!("Failed to parse value: {}", e))?;

    let mut counts = BTreeMap::new();
    Self::collect_keys(&value, &mut counts);

    // Most frequent keys get the shortest tokens.
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let dictionary: Vec<String> = ranked.into_iter().map(|(k, _)| k).collect();
    let tokens: BTreeMap<String, String> = dictionary
      .iter()
      .enumerate()
      .map(|(i, k)| (k.clone(), i.to_string()))
      .collect();

    let packed = serde_json::json!({
      "k": dictionary,
      "v": Self::encode(value, &tokens),
    });
    serde_json::to_vec(&packed).map_err(|e| eyre!("Failed to serialize packed value: {}", e))
  }

  fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
    let mut packed: Map<String, Value> =
      serde_json::from_slice(input).map_err(|e| eyre!("Failed to parse packed value: {}", e))?;

    let dictionary: Vec<String> = packed
      .remove("k")
      .map(serde_json::from_value)
      .transpose()
      .map_err(|e| eyre!("Malformed key dictionary: {}", e))?
      .ok_or_else(|| eyre!("Packed value has no key dictionary"))?;
    let value = packed
      .remove("v")
      .ok_or_else(|| eyre!("Packed value has no body"))?;

    let decoded = Self::decode(value, &dictionary)?;
    serde_json::to_vec(&decoded).map_err(|e| eyre!("Failed to serialize value: {}", e))
  }
}
