//! Address normalization
//!
//! Externally stored addresses come in several shorthand forms (`:5550`,
//! `127.0.0.1:5550`, `http://host:5550/`). Every outbound URL and every
//! hash-ring identity is built from the normalized form.

/// Normalize an address shorthand into a full base URL.
///
/// A bare `:port` becomes `http://127.0.0.1:port`; a missing scheme gets an
/// `http://` prefix; a trailing slash is stripped.
#[must_use]
pub fn normalize_url(addr: &str) -> String {
    let full = if addr.starts_with(':') {
        format!("http://127.0.0.1{addr}")
    } else if !addr.starts_with("http://") && !addr.starts_with("https://") {
        format!("http://{addr}")
    } else {
        addr.to_string()
    };

    full.trim_end_matches('/').to_string()
}
