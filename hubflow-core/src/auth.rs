//! Shared-access-signature minting for hub endpoints.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;

use crate::config::{HubConfig, SharedAccessPolicy};
use crate::{Error, Result};

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// Cached tokens are re-minted once they are within this margin of expiry,
/// so a token handed out is always valid for at least the margin.
const RENEWAL_MARGIN: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
struct SasToken {
    value: String,
    expires_at: i64,
}

/// Mints time-bounded `SharedAccessSignature` authorization strings for one
/// hub. Tokens are cached and renewed lazily on access rather than minted
/// once for the process lifetime.
pub struct SasTokenProvider {
    resource_uri: String,
    policy: SharedAccessPolicy,
    ttl: Duration,
    cached: Mutex<Option<SasToken>>,
}

impl SasTokenProvider {
    pub fn new(hub: &HubConfig) -> Self {
        Self::with_ttl(hub, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(hub: &HubConfig, ttl: Duration) -> Self {
        SasTokenProvider {
            resource_uri: hub.base_https_uri(),
            policy: hub.policy.clone(),
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Returns a signed token for the hub, minting a fresh one when the
    /// cached token is missing or close to expiry.
    pub fn token(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref()
            && token.expires_at - now > RENEWAL_MARGIN.as_secs() as i64
        {
            return Ok(token.value.clone());
        }
        let token = self.mint(now)?;
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    fn mint(&self, now: i64) -> Result<SasToken> {
        let expires_at = now + self.ttl.as_secs() as i64;
        let encoded_uri = percent_encode(&self.resource_uri);
        let to_sign = format!("{encoded_uri}\n{expires_at}");
        let mut mac = Hmac::<Sha256>::new_from_slice(self.policy.key.as_bytes())
            .map_err(|e| Error::Config(format!("invalid shared access key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        let value = format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_uri,
            percent_encode(&signature),
            expires_at,
            self.policy.name
        );
        Ok(SasToken { value, expires_at })
    }
}

/// Percent-encodes everything outside the RFC 3986 unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
