//! Helper utilities
//!
//! Small shared functions used throughout the crate: randomized timer
//! periods, random padding, session id generation and address parsing.

use rand::Rng;
use std::time::Duration;

/// Length in bytes of the random session id (hex-encoded to twice this)
pub const SESSION_ID_BYTES: usize = 16;

/// Draw a uniformly random duration from `[min, max]`
///
/// Each caller is expected to draw a fresh period before re-arming a
/// timer; fixed-period tickers would make the traffic fingerprintable.
pub fn make_random_period(min: Duration, max: Duration) -> Duration {
    if min >= max {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(millis as u64)
}

/// Produce a random byte string with length uniform in `[min, max]`
pub fn make_random_padding(min: usize, max: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let len = if min >= max {
        min
    } else {
        rng.gen_range(min..=max)
    };
    let mut padding = vec![0u8; len];
    rng.fill(&mut padding[..]);
    padding
}

/// Generate a fresh random session id as a lowercase hex string
pub fn make_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split a `"host:port"` address into its parts
///
/// The host may itself contain colons (IPv6); the port is taken after the
/// last colon.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}
