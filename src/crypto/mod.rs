//! AES-256-GCM primitives used by the artifact container.
pub mod gcm;
pub mod key;

pub use gcm::{CipherSession, DecipherSession, IV_LEN, Iv, TAG_LEN, Tag};
pub use key::{EncryptionKey, KEY_LEN};
