//! Canonical byte form and content hashing.
//!
//! Every hashed record is first lowered into a [`Canon`] tree. Maps are
//! `BTreeMap`s, so two records built in a different order lower to the same
//! tree and encode to the same bytes. Floats are written in the shortest
//! round-trip scientific form produced by `core::fmt`, which is exact and
//! platform-independent. Non-finite floats are rejected rather than encoded.

use std::{collections::BTreeMap, fmt::Write as _};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Significant digits kept by [`round_sig`].
pub const SIGNIFICANT_DIGITS: usize = 6;

// ─── Canon tree ──────────────────────────────────────────────────────────────

/// A structured value in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum Canon {
  Null,
  Bool(bool),
  Int(i64),
  Num(f64),
  Str(String),
  List(Vec<Canon>),
  Map(BTreeMap<String, Canon>),
}

impl Canon {
  /// Build a map from `(key, value)` pairs; later duplicates win.
  pub fn map<K, I>(entries: I) -> Self
  where
    K: Into<String>,
    I: IntoIterator<Item = (K, Canon)>,
  {
    Self::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }

  pub fn list<I: IntoIterator<Item = Canon>>(items: I) -> Self {
    Self::List(items.into_iter().collect())
  }

  pub fn str(s: impl Into<String>) -> Self { Self::Str(s.into()) }

  pub fn opt_num(v: Option<f64>) -> Self { v.map_or(Self::Null, Self::Num) }

  pub fn opt_str(v: Option<&str>) -> Self {
    v.map_or(Self::Null, |s| Self::Str(s.to_owned()))
  }

  pub fn instant(dt: DateTime<Utc>) -> Self { Self::Str(format_instant(dt)) }

  pub fn date(d: NaiveDate) -> Self { Self::Str(format_date(d)) }

  pub fn uint(v: u64) -> Result<Self> {
    i64::try_from(v)
      .map(Self::Int)
      .map_err(|_| Error::NonCanonical(format!("integer {v} exceeds i64")))
  }
}

/// Implemented by every record whose identity is a content hash.
pub trait ToCanon {
  fn to_canon(&self) -> Result<Canon>;

  /// SHA-256 over the canonical bytes, lowercase hex.
  fn content_hash(&self) -> Result<String> {
    hash_canon(&self.to_canon()?)
  }
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Lower a [`Canon`] tree to its canonical bytes.
///
/// Fails on NaN or infinite floats.
pub fn canonical_bytes(value: &Canon) -> Result<Vec<u8>> {
  let mut out = String::new();
  write_canon(&mut out, value)?;
  Ok(out.into_bytes())
}

fn write_canon(out: &mut String, value: &Canon) -> Result<()> {
  match value {
    Canon::Null => out.push_str("null"),
    Canon::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
    Canon::Int(i) => {
      let _ = write!(out, "{i}");
    }
    Canon::Num(n) => out.push_str(&format_number(*n)?),
    Canon::Str(s) => write_str(out, s)?,
    Canon::List(items) => {
      out.push('[');
      for (i, item) in items.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_canon(out, item)?;
      }
      out.push(']');
    }
    Canon::Map(entries) => {
      out.push('{');
      for (i, (k, v)) in entries.iter().enumerate() {
        if i > 0 {
          out.push(',');
        }
        write_str(out, k)?;
        out.push(':');
        write_canon(out, v)?;
      }
      out.push('}');
    }
  }
  Ok(())
}

fn write_str(out: &mut String, s: &str) -> Result<()> {
  out.push_str(&serde_json::to_string(s)?);
  Ok(())
}

/// The canonical text of a float: shortest round-trip scientific notation.
pub fn format_number(n: f64) -> Result<String> {
  if !n.is_finite() {
    return Err(Error::NonCanonical(format!("non-finite number {n}")));
  }
  // -0.0 and 0.0 are logically equal.
  let n = if n == 0.0 { 0.0 } else { n };
  Ok(format!("{n:e}"))
}

pub fn format_instant(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn format_date(d: NaiveDate) -> String { d.format("%Y-%m-%d").to_string() }

// ─── Hashing ─────────────────────────────────────────────────────────────────

pub fn sha256_hex(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

pub fn hash_canon(value: &Canon) -> Result<String> {
  Ok(sha256_hex(&canonical_bytes(value)?))
}

// ─── Rounding ────────────────────────────────────────────────────────────────

/// Round half-to-even to [`SIGNIFICANT_DIGITS`] significant digits.
///
/// Goes through exact decimal formatting so the result does not depend on
/// the host's `log10`/`powi`. Non-finite inputs come back unchanged and are
/// caught at encoding time.
pub fn round_sig(x: f64) -> f64 {
  if !x.is_finite() || x == 0.0 {
    return if x == 0.0 { 0.0 } else { x };
  }
  let text = format!("{:.*e}", SIGNIFICANT_DIGITS - 1, x);
  text.parse().unwrap_or(x)
}

/// [`round_sig`] that maps non-finite results to `None`.
pub fn round_finite(x: f64) -> Option<f64> {
  x.is_finite().then(|| round_sig(x))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn map_order_does_not_matter() {
    let a = Canon::map([("b", Canon::Int(2)), ("a", Canon::Int(1))]);
    let b = Canon::map([("a", Canon::Int(1)), ("b", Canon::Int(2))]);
    assert_eq!(canonical_bytes(&a).unwrap(), canonical_bytes(&b).unwrap());
    assert_eq!(hash_canon(&a).unwrap(), hash_canon(&b).unwrap());
  }

  #[test]
  fn encoding_is_pinned() {
    let v = Canon::map([
      ("n", Canon::Num(101.5)),
      ("z", Canon::Num(-0.0)),
      ("s", Canon::str("a\"b")),
      ("l", Canon::list([Canon::Null, Canon::Bool(true), Canon::Int(-3)])),
    ]);
    let text = String::from_utf8(canonical_bytes(&v).unwrap()).unwrap();
    assert_eq!(text, r#"{"l":[null,true,-3],"n":1.015e2,"s":"a\"b","z":0e0}"#);
  }

  #[test]
  fn nan_is_rejected() {
    let err = canonical_bytes(&Canon::Num(f64::NAN)).unwrap_err();
    assert!(matches!(err, Error::NonCanonical(_)));
    assert!(canonical_bytes(&Canon::Num(f64::INFINITY)).is_err());
  }

  #[test]
  fn sha256_of_empty_input() {
    assert_eq!(
      sha256_hex(b""),
      "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
  }

  #[test]
  fn rounding_keeps_six_significant_digits() {
    assert_eq!(round_sig(0.123456789), 0.123457);
    assert_eq!(round_sig(123456789.0), 123457000.0);
    assert_eq!(round_sig(-0.000012345678), -0.0000123457);
    assert_eq!(round_sig(1.0), 1.0);
    assert_eq!(round_sig(-0.0), 0.0);
  }

  #[test]
  fn rounding_is_idempotent() {
    for x in [0.1 + 0.2, 1.0 / 3.0, 98765.4321, 2.5e-9] {
      let once = round_sig(x);
      assert_eq!(round_sig(once), once);
    }
  }

  #[test]
  fn instants_use_second_precision_utc() {
    let dt = DateTime::parse_from_rfc3339("2026-01-29T16:00:00-05:00")
      .unwrap()
      .with_timezone(&Utc);
    assert_eq!(format_instant(dt), "2026-01-29T21:00:00Z");
  }
}
