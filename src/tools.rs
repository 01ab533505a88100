//! Some tools and enhancements to the used libraries, there should be
//! no references to Context and other "larger" entities here.

use std::time::{Duration, SystemTime};

use base64::Engine as _;
use rand::{thread_rng, Rng};

/// Generates a random identifier.
///
/// The generated ID is URL-safe base64 of 66 random bits, so it can be used
/// in request identifiers and content identifiers alike.
pub(crate) fn create_id() -> String {
    // ThreadRng implements CryptoRng trait and is supposed to be cryptographically secure.
    let mut rng = thread_rng();

    // Generate 72 random bits.
    let mut arr = [0u8; 9];
    rng.fill(&mut arr[..]);

    // Take 11 base64 characters containing 66 random bits.
    base64::engine::general_purpose::URL_SAFE
        .encode(arr)
        .chars()
        .take(11)
        .collect()
}

/// Returns the current unix timestamp in milliseconds.
pub(crate) fn time_ms() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
}

/// Returns the domain part of an address, if there is one.
pub(crate) fn addr_domain(addr: &str) -> Option<&str> {
    let (_, domain) = addr.rsplit_once('@')?;
    let domain = domain.trim_end_matches('>').trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}

/// Truncates `buf` to at most `approx_chars` characters, appending an ellipsis
/// when something was cut.
pub(crate) fn truncate(buf: &str, approx_chars: usize) -> std::borrow::Cow<str> {
    let count = buf.chars().count();
    if count > approx_chars + 3 {
        let end_pos = buf
            .char_indices()
            .nth(approx_chars)
            .map(|(n, _)| n)
            .unwrap_or_default();
        format!("{}[...]", buf.get(..end_pos).unwrap_or_default()).into()
    } else {
        buf.into()
    }
}
