//! Reconciliation primitives.
//!
//! Helpers shared by the container backends when converging a planned set of
//! services onto the containers that actually exist:
//!
//! - **Spec hash**: a stable digest of a service definition, stored on the
//!   container it produced.
//! - **Convergence**: comparing the stored digest against the planned one
//!   decides whether a container is kept or recreated.
//! - **Backoff**: delays for retrying a failed stream or call.
//!
//! # Invariants
//!
//! - Hashes are deterministic: key order in the input never matters
//! - Classification is pure; the same inputs always give the same decision

use std::time::{Duration, SystemTime};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// A spec hash for deterministic comparison.
///
/// Used to detect when a service definition has changed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(hex::encode(result))
    }

    /// Compute a spec hash of any serializable value.
    pub fn of<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_value(value)?;
        Ok(Self::from_json(&json))
    }

    /// Wrap a hash previously produced by this type (e.g. read back from a label).
    pub fn from_stored(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Convergence status of one planned service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// A container exists and was built from the planned definition.
    Converged,

    /// A container exists but was built from a different definition.
    Diverged,

    /// No container exists yet.
    Missing,
}

impl ConvergenceStatus {
    /// Returns true if the existing container can be kept.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if a container must be (re)created.
    pub fn needs_create(&self) -> bool {
        !self.is_converged()
    }
}

/// Classify a service given the hash stored on its current container (if any).
pub fn classify(current: Option<&SpecHash>, desired: &SpecHash) -> ConvergenceStatus {
    match current {
        None => ConvergenceStatus::Missing,
        Some(hash) if hash == desired => ConvergenceStatus::Converged,
        Some(_) => ConvergenceStatus::Diverged,
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter;
        let final_delay = (delay + rand_jitter(jitter_range)).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Simple jitter using a basic LCG (for no external deps).
fn rand_jitter(range: f64) -> f64 {
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0; // -1.0 to 1.0
    normalized * range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
    }

    #[test]
    fn test_spec_hash_detects_change() {
        #[derive(Serialize)]
        struct Service<'a> {
            image: &'a str,
            command: Vec<&'a str>,
        }

        let v1 = SpecHash::of(&Service { image: "ubuntu", command: vec!["sleep", "1"] }).unwrap();
        let v2 = SpecHash::of(&Service { image: "ubuntu", command: vec!["sleep", "2"] }).unwrap();
        let v1_again = SpecHash::of(&Service { image: "ubuntu", command: vec!["sleep", "1"] }).unwrap();

        assert_ne!(v1, v2);
        assert_eq!(v1, v1_again);
        assert_eq!(SpecHash::from_stored(v1.as_str()), v1);
    }

    #[test]
    fn test_classify() {
        let desired = SpecHash::from_stored("abc");
        let old = SpecHash::from_stored("old");

        assert_eq!(classify(None, &desired), ConvergenceStatus::Missing);
        assert_eq!(classify(Some(&desired), &desired), ConvergenceStatus::Converged);
        assert_eq!(classify(Some(&old), &desired), ConvergenceStatus::Diverged);

        assert!(classify(Some(&desired), &desired).is_converged());
        assert!(classify(Some(&old), &desired).needs_create());
        assert!(classify(None, &desired).needs_create());
    }

    #[test]
    fn test_backoff_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(10), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_within_range() {
        let policy = BackoffPolicy::default();
        for attempt in 0..8 {
            let delay = policy.delay(attempt).as_millis() as f64;
            let nominal = (100.0 * 2.0_f64.powi(attempt as i32)).min(30_000.0);
            assert!(delay >= nominal * 0.75 - 1.0);
            assert!(delay <= nominal * 1.25 + 1.0);
        }
    }
}
