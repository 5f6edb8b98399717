//! Token value generation.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;

/// Generate an opaque token value from `bytes` random bytes.
///
/// Bytes come from the thread-local CSPRNG and are encoded as URL-safe base64
/// without padding, so values are safe in headers, cookies and query strings.
pub fn generate_token_value(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(&buf)
}
