//! Exit-identity lookups and their time-boxed cache.
//!
//! An identity is the public address traffic appears to come from when it
//! leaves a circuit. It is discovered by asking an address-echo service
//! *through* the circuit's SOCKS port; the geolocation of that address is
//! looked up over a direct, unproxied path.

use serde_json::Value;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rendered in place of an identity that has not been resolved yet.
pub const PENDING: &str = "pending";

/// Rendered in place of an unknown country code.
pub const UNKNOWN_COUNTRY: &str = "-";

#[derive(Debug, Default)]
struct CacheState {
    entry: Option<(IpAddr, Instant)>,
    generation: u64,
}

/// Identity cache with a fixed time-to-live.
///
/// Every invalidation bumps a generation counter. A lookup records the
/// generation before it starts and may only store its result if no
/// invalidation happened in between, so a slow lookup that raced with a
/// renewal never resurrects the old address.
#[derive(Debug)]
pub struct IdentityCache {
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl IdentityCache {
    /// Create an empty cache whose entries stay fresh for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// The cached identity, if one exists and is younger than the TTL.
    pub fn fresh(&self) -> Option<IpAddr> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .entry
            .filter(|(_, observed_at)| observed_at.elapsed() < self.ttl)
            .map(|(ip, _)| ip)
    }

    /// Current generation, to be passed back to [`IdentityCache::store`].
    pub fn generation(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .generation
    }

    /// Store `ip` if the cache was not invalidated since `generation`.
    ///
    /// Returns whether the value was stored.
    pub fn store(&self, ip: IpAddr, generation: u64) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.generation != generation {
            return false;
        }
        state.entry = Some((ip, Instant::now()));
        true
    }

    /// Drop the cached identity.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entry = None;
        state.generation = state.generation.wrapping_add(1);
    }
}

/// HTTP clients for the two lookup paths of one circuit.
pub struct IdentityLookup {
    via_socks: reqwest::Client,
    direct: reqwest::Client,
    identity_url: String,
    geo_url: String,
}

impl IdentityLookup {
    /// Build clients for a circuit listening on `socks_port`.
    ///
    /// # Errors
    /// Returns the underlying `reqwest::Error` if a client cannot be built
    /// (for example when TLS initialisation fails).
    pub fn new(
        socks_port: u16,
        identity_url: impl Into<String>,
        geo_url: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        // socks5h: the hostname is resolved by the circuit, never locally.
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))?;
        let via_socks = reqwest::Client::builder()
            .proxy(proxy)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        let direct = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            via_socks,
            direct,
            identity_url: identity_url.into(),
            geo_url: geo_url.into(),
        })
    }

    /// Ask the address-echo service, through the circuit, for the exit address.
    pub async fn echo_through_circuit(&self, timeout: Duration) -> Option<IpAddr> {
        let body = fetch_json(&self.via_socks, &self.identity_url, timeout).await?;
        parse_identity(&body)
    }

    /// Look up the country code of `ip` over the direct path.
    pub async fn country_of(&self, ip: IpAddr, timeout: Duration) -> Option<String> {
        let url = self.geo_url.replace("{ip}", &ip.to_string());
        let body = fetch_json(&self.direct, &url, timeout).await?;
        parse_country(&body)
    }
}

async fn fetch_json(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<Value> {
    let response = match client.get(url).timeout(timeout).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::trace!(url, error = %e, "lookup request failed");
            return None;
        }
    };
    if response.status() != reqwest::StatusCode::OK {
        tracing::trace!(url, status = %response.status(), "lookup returned non-200");
        return None;
    }
    response.json::<Value>().await.ok()
}

/// Extract the `ip` string of an address-echo reply.
///
/// Anything but a JSON object with a string field holding a valid address
/// is rejected.
pub fn parse_identity(body: &Value) -> Option<IpAddr> {
    body.as_object()?
        .get("ip")?
        .as_str()?
        .trim()
        .parse()
        .ok()
}

/// Extract the `countryCode` string of a geolocation reply.
pub fn parse_country(body: &Value) -> Option<String> {
    let code = body.as_object()?.get("countryCode")?.as_str()?.trim();
    if code.is_empty() {
        None
    } else {
        Some(code.to_string())
    }
}

/// Render an optional identity, using [`PENDING`] for `None`.
pub fn display_identity(ip: Option<IpAddr>) -> String {
    ip.map_or_else(|| PENDING.to_string(), |ip| ip.to_string())
}
