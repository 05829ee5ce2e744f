use super::replay::ReplayCache;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: u64 = 180;
const REPLAY_KEY_PREFIX: &str = "wx:m:n:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("missing query parameter `{0}`")]
    MissingParameter(&'static str),
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("timestamp outside the tolerance window")]
    StaleRequest,
    #[error("request replayed within the tolerance window")]
    ReplayedRequest,
}

/// Query parameters WeChat attaches to every callback.
#[derive(Debug, Clone, Copy)]
pub struct CallbackParams<'a> {
    pub signature: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
}

/// SHA1 over the lexicographically sorted, concatenated parts, hex encoded.
pub fn compute_signature(parts: &[&str]) -> String {
    let mut parts = parts.to_vec();
    parts.sort_unstable();
    let mut sha = Sha1::new();
    sha.update(parts.concat());
    hex::encode(sha.finalize())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Validates callback signatures, the timestamp window and replays.
///
/// Replay protection is best-effort: without a cache the verifier still
/// checks signature and timestamp, it just cannot detect resubmissions.
#[derive(Clone)]
pub struct SignatureVerifier {
    tolerance: Duration,
    replay: Option<Arc<dyn ReplayCache>>,
}

impl SignatureVerifier {
    pub fn new(tolerance: Duration, replay: Option<Arc<dyn ReplayCache>>) -> Self {
        Self { tolerance, replay }
    }

    pub fn verify(&self, token: &str, params: CallbackParams<'_>) -> Result<(), VerifyError> {
        self.verify_at(token, params, unix_now())
    }

    /// Same as [`verify`](Self::verify) against an explicit clock reading.
    pub fn verify_at(
        &self,
        token: &str,
        params: CallbackParams<'_>,
        now: i64,
    ) -> Result<(), VerifyError> {
        let timestamp = params
            .timestamp
            .trim()
            .parse::<i64>()
            .map_err(|_| VerifyError::StaleRequest)?;
        if timestamp.abs_diff(now) > self.tolerance.as_secs() {
            return Err(VerifyError::StaleRequest);
        }

        let expected = compute_signature(&[token, params.timestamp.trim(), params.nonce.trim()]);
        if !constant_time_eq(expected.as_bytes(), params.signature.trim().as_bytes()) {
            return Err(VerifyError::InvalidSignature);
        }

        if let Some(cache) = self.replay.as_deref() {
            let key = format!("{REPLAY_KEY_PREFIX}{}", params.signature.trim());
            if !cache.record_if_new(&key, params.nonce.trim(), self.tolerance) {
                return Err(VerifyError::ReplayedRequest);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::MemoryReplayCache;

    const TOKEN: &str = "token";

    fn verifier(tolerance_secs: u64) -> SignatureVerifier {
        SignatureVerifier::new(
            Duration::from_secs(tolerance_secs),
            Some(Arc::new(MemoryReplayCache::new())),
        )
    }

    fn params<'a>(signature: &'a str, timestamp: &'a str, nonce: &'a str) -> CallbackParams<'a> {
        CallbackParams {
            signature,
            timestamp,
            nonce,
        }
    }

    #[test]
    fn compute_signature_matches_sorted_sha1() {
        let mut parts = vec![TOKEN, "1700000000", "nonce123"];
        parts.sort_unstable();
        let mut sha = Sha1::new();
        sha.update(parts.join(""));
        let expected = hex::encode(sha.finalize());

        assert_eq!(
            compute_signature(&["nonce123", TOKEN, "1700000000"]),
            expected
        );
    }

    #[test]
    fn valid_signature_passes() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        assert_eq!(verifier(180).verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
    }

    #[test]
    fn every_single_character_mutation_is_rejected() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        let v = SignatureVerifier::new(Duration::from_secs(180), None);

        for idx in 0..sig.len() {
            for replacement in ['0', 'f', 'A', 'z'] {
                let mut mutated: Vec<char> = sig.chars().collect();
                if mutated[idx] == replacement {
                    continue;
                }
                mutated[idx] = replacement;
                let mutated: String = mutated.into_iter().collect();
                assert_eq!(
                    v.verify_at(TOKEN, params(&mutated, &ts, "n1"), now),
                    Err(VerifyError::InvalidSignature),
                    "mutation at {idx} accepted"
                );
            }
        }
    }

    #[test]
    fn stale_timestamp_rejected_regardless_of_signature() {
        let now = 1_700_000_000;
        let v = verifier(10);
        for skew in [-11_i64, 11, 3600] {
            let ts = (now + skew).to_string();
            let good = compute_signature(&[TOKEN, &ts, "n1"]);
            assert_eq!(
                v.verify_at(TOKEN, params(&good, &ts, "n1"), now),
                Err(VerifyError::StaleRequest)
            );
            assert_eq!(
                v.verify_at(TOKEN, params("bogus", &ts, "n1"), now),
                Err(VerifyError::StaleRequest)
            );
        }
    }

    #[test]
    fn unparseable_timestamp_is_stale() {
        let v = verifier(10);
        assert_eq!(
            v.verify_at(TOKEN, params("x", "yesterday", "n1"), 0),
            Err(VerifyError::StaleRequest)
        );
    }

    #[test]
    fn skew_at_tolerance_boundary_is_accepted() {
        let now = 1_700_000_000;
        let ts = (now - 10).to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        assert_eq!(verifier(10).verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
    }

    #[test]
    fn replay_within_ttl_rejected() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        let v = verifier(180);
        assert_eq!(v.verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
        assert_eq!(
            v.verify_at(TOKEN, params(&sig, &ts, "n1"), now),
            Err(VerifyError::ReplayedRequest)
        );
    }

    #[test]
    fn replay_after_ttl_expiry_succeeds() {
        let now = unix_now();
        let ts = now.to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        let v = verifier(1);
        assert_eq!(v.verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
        std::thread::sleep(Duration::from_millis(1_100));
        assert_eq!(v.verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
    }

    #[test]
    fn missing_cache_skips_replay_protection() {
        let now = 1_700_000_000;
        let ts = now.to_string();
        let sig = compute_signature(&[TOKEN, &ts, "n1"]);
        let v = SignatureVerifier::new(Duration::from_secs(180), None);
        assert_eq!(v.verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
        assert_eq!(v.verify_at(TOKEN, params(&sig, &ts, "n1"), now), Ok(()));
    }
}
