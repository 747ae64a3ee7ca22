//! Model files: magic + kind + length prefix (4 bytes LE) + SHA-256 digest + bincode payload.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};

const MAGIC: &[u8; 4] = b"DSMD";
const HEADER_LEN: usize = MAGIC.len() + 1 + 4 + 32;
const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

/// What a model file holds. Stored as one byte after the magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModelKind {
    NearestCentroid = 1,
    Markov = 2,
    Transformer = 3,
}

impl ModelKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(ModelKind::NearestCentroid),
            2 => Some(ModelKind::Markov),
            3 => Some(ModelKind::Transformer),
            _ => None,
        }
    }
}

/// Error fitting, encoding or loading a model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("not a model file")]
    BadMagic,
    #[error("expected {expected:?} model, found kind byte {found}")]
    WrongKind { expected: ModelKind, found: u8 },
    #[error("model file truncated")]
    Truncated,
    #[error("model payload too large")]
    TooLarge,
    #[error("model digest mismatch")]
    Integrity,
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("nothing to fit")]
    Empty,
}

/// SHA-256 of a payload.
pub fn digest(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}

/// Encode a model into its file representation.
pub fn encode_model<T: Serialize>(kind: ModelKind, model: &T) -> Result<Vec<u8>, ModelError> {
    let payload = bincode::serialize(model)?;
    let len = u32::try_from(payload.len()).map_err(|_| ModelError::TooLarge)?;
    if len > MAX_PAYLOAD_LEN {
        return Err(ModelError::TooLarge);
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(kind as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&digest(&payload));
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode and verify a model of `kind`.
pub fn decode_model<T: DeserializeOwned>(kind: ModelKind, bytes: &[u8]) -> Result<T, ModelError> {
    if bytes.len() < HEADER_LEN {
        return Err(ModelError::Truncated);
    }
    if &bytes[..4] != MAGIC {
        return Err(ModelError::BadMagic);
    }
    if ModelKind::from_byte(bytes[4]) != Some(kind) {
        return Err(ModelError::WrongKind {
            expected: kind,
            found: bytes[4],
        });
    }
    let len = u32::from_le_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(ModelError::TooLarge);
    }
    let expected: [u8; 32] = bytes[9..HEADER_LEN]
        .try_into()
        .map_err(|_| ModelError::Truncated)?;
    let payload = bytes
        .get(HEADER_LEN..HEADER_LEN + len as usize)
        .ok_or(ModelError::Truncated)?;
    if digest(payload) != expected {
        return Err(ModelError::Integrity);
    }
    Ok(bincode::deserialize(payload)?)
}

pub fn save_model<T: Serialize>(path: &Path, kind: ModelKind, model: &T) -> Result<(), ModelError> {
    std::fs::write(path, encode_model(kind, model)?)?;
    tracing::info!(path = %path.display(), ?kind, "model saved");
    Ok(())
}

pub fn load_model<T: DeserializeOwned>(path: &Path, kind: ModelKind) -> Result<T, ModelError> {
    let bytes = std::fs::read(path)?;
    decode_model(kind, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode() {
        let model = vec![vec![1.0f64, 2.0], vec![3.0]];
        let bytes = encode_model(ModelKind::Markov, &model).unwrap();
        let back: Vec<Vec<f64>> = decode_model(ModelKind::Markov, &bytes).unwrap();
        assert_eq!(back, model);
    }

    #[test]
    fn rejects_tampered_payload() {
        let mut bytes = encode_model(ModelKind::Markov, &vec![1u32, 2, 3]).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(matches!(
            decode_model::<Vec<u32>>(ModelKind::Markov, &bytes),
            Err(ModelError::Integrity)
        ));
    }

    #[test]
    fn rejects_wrong_kind_and_magic() {
        let bytes = encode_model(ModelKind::Markov, &7u8).unwrap();
        assert!(matches!(
            decode_model::<u8>(ModelKind::Transformer, &bytes),
            Err(ModelError::WrongKind { found: 2, .. })
        ));
        let mut bad = bytes.clone();
        bad[0] = b'X';
        assert!(matches!(
            decode_model::<u8>(ModelKind::Markov, &bad),
            Err(ModelError::BadMagic)
        ));
    }

    #[test]
    fn rejects_truncated() {
        let bytes = encode_model(ModelKind::NearestCentroid, &vec![0u64; 16]).unwrap();
        assert!(matches!(
            decode_model::<Vec<u64>>(ModelKind::NearestCentroid, &bytes[..10]),
            Err(ModelError::Truncated)
        ));
        assert!(matches!(
            decode_model::<Vec<u64>>(ModelKind::NearestCentroid, &bytes[..bytes.len() - 1]),
            Err(ModelError::Truncated)
        ));
    }
}
