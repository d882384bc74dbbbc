use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;

/// CIDv1, raw codec 0x00, sha3-256 multihash (0x16), 32-byte digest.
/// Changing this or the hash is a wire protocol break.
pub const CONTENT_KEY_PREFIX: [u8; 4] = [0x01, 0x00, 0x16, 0x20];

/// Multibase prefix of the lowercase base32 text form
const MULTIBASE_BASE32: char = 'b';

/// The routing key announced and looked up for an opaque identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentKey {
    digest: [u8; 32],
}

impl ContentKey {
    /// SHA3-256 of the identifier bytes
    pub fn from_id(id: impl AsRef<[u8]>) -> Self {
        let digest: [u8; 32] = Sha3_256::digest(id.as_ref()).into();
        Self { digest }
    }

    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Binary form: prefix followed by the digest
    pub fn to_bytes(&self) -> [u8; 36] {
        let mut bytes = [0u8; 36];
        bytes[..4].copy_from_slice(&CONTENT_KEY_PREFIX);
        bytes[4..].copy_from_slice(&self.digest);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContentKeyError> {
        let digest = bytes
            .strip_prefix(&CONTENT_KEY_PREFIX[..])
            .ok_or(ContentKeyError::UnknownPrefix)?;
        let digest: [u8; 32] = digest
            .try_into()
            .map_err(|_| ContentKeyError::InvalidLength(bytes.len()))?;
        Ok(Self { digest })
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = data_encoding::BASE32_NOPAD.encode(&self.to_bytes());
        write!(f, "{}{}", MULTIBASE_BASE32, encoded.to_lowercase())
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", self)
    }
}

impl FromStr for ContentKey {
    type Err = ContentKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix(MULTIBASE_BASE32)
            .ok_or(ContentKeyError::UnknownMultibase)?;
        let bytes = data_encoding::BASE32_NOPAD
            .decode(body.to_uppercase().as_bytes())
            .map_err(|_| ContentKeyError::InvalidEncoding)?;
        Self::from_bytes(&bytes)
    }
}

impl TryFrom<String> for ContentKey {
    type Error = ContentKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentKey> for String {
    fn from(value: ContentKey) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContentKeyError {
    #[error("Content key must use base32 multibase ('b')")]
    UnknownMultibase,

    #[error("Invalid base32 encoding")]
    InvalidEncoding,

    #[error("Content key prefix is not CIDv1/sha3-256")]
    UnknownPrefix,

    #[error("Invalid content key length: {0} bytes")]
    InvalidLength(usize),
}
