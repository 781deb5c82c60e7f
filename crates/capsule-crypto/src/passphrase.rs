//! Random passphrase generation
//!
//! A generated passphrase carries 256 bits of entropy, rendered as URL-safe
//! base64 without padding so it survives copy/paste and QR transport.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use secrecy::SecretString;
use zeroize::Zeroize;

/// Generate a fresh 43-character passphrase from 32 random bytes.
pub fn generate_passphrase() -> SecretString {
    let mut entropy = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut entropy);
    let encoded = URL_SAFE_NO_PAD.encode(entropy);
    entropy.zeroize();
    SecretString::from(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_passphrase_shape() {
        let pass = generate_passphrase();
        let text = pass.expose_secret();

        assert_eq!(text.len(), 43);
        assert!(text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_passphrases_differ() {
        let a = generate_passphrase();
        let b = generate_passphrase();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }
}
