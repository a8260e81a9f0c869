use std::fmt;
use zeroize::Zeroize;

use crate::errors::{BackupError, Result};

pub const KEY_LEN: usize = 32;

/// 256-bit symmetric key. Zeroized on drop, never printed.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        EncryptionKey(bytes)
    }

    /// Parses a 64-character hex string. The key material never ends up in the error text.
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        if encoded.len() != KEY_LEN * 2 {
            return Err(BackupError::Configuration(format!(
                "ENCRYPTION_KEY must be {} hex characters (256 bits), got {}",
                KEY_LEN * 2,
                encoded.len()
            )));
        }
        let mut bytes = [0u8; KEY_LEN];
        if hex::decode_to_slice(encoded, &mut bytes).is_err() {
            bytes.zeroize();
            return Err(BackupError::Configuration(
                "ENCRYPTION_KEY contains non-hex characters".to_string(),
            ));
        }
        Ok(EncryptionKey(bytes))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    #[test]
    fn test_from_hex_accepts_64_chars() -> anyhow::Result<()> {
        let key = EncryptionKey::from_hex(HEX_KEY)?;
        assert_eq!(key.as_bytes()[0], 0x00);
        assert_eq!(key.as_bytes()[31], 0x1f);
        Ok(())
    }

    #[test]
    fn test_from_hex_trims_whitespace_and_accepts_uppercase() -> anyhow::Result<()> {
        let key = EncryptionKey::from_hex(&format!("  {}\n", HEX_KEY.to_uppercase()))?;
        assert_eq!(key.as_bytes()[10], 0x0a);
        Ok(())
    }

    #[test]
    fn test_from_hex_rejects_short_key() {
        let err = EncryptionKey::from_hex("abcd").unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_from_hex_rejects_non_hex_without_echoing_it() {
        let bad = format!("zz{}", &HEX_KEY[2..]);
        let err = EncryptionKey::from_hex(&bad).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(!err.to_string().contains(&bad));
    }

    #[test]
    fn test_debug_is_redacted() -> anyhow::Result<()> {
        let key = EncryptionKey::from_hex(HEX_KEY)?;
        assert_eq!(format!("{:?}", key), "EncryptionKey(<redacted>)");
        Ok(())
    }
}
