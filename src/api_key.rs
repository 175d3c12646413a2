use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";

const TAG_MESSAGE: &[u8] = b"statelog/api-key/v1";

/// The pre-shared secret guarding mutations.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

/// Empty or whitespace-only input means auth is disabled.
pub fn parse_api_key(raw: &str) -> Option<ApiKey> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    Some(ApiKey(raw.to_string()))
}

fn tag(key: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(TAG_MESSAGE);
    Some(mac)
}

/// Compares HMAC tags keyed by each secret so the check runs in constant time.
pub fn verify_api_key(presented: &str, expected: &ApiKey) -> bool {
    if presented.is_empty() {
        return false;
    }
    let (Some(presented), Some(expected)) = (tag(presented.as_bytes()), tag(expected.0.as_bytes()))
    else {
        return false;
    };
    let expected = expected.finalize().into_bytes();
    presented.verify_slice(&expected).is_ok()
}
