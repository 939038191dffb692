//! Compact id lists for query strings.
//!
//! A token is a big-endian stream of 10-bit ids, zero padded to a whole
//! byte, zlib compressed and written as unpadded base64url. Trailing bits
//! that do not fill a whole id are ignored when decoding.

use std::io::{Read, Write};

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

const ID_BITS: u32 = 10;
pub const MAX_TOKEN_ID: i64 = (1 << ID_BITS) - 1;

/// Accepts tokens with or without `=` padding.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("token is not base64url: {0}")]
    Encoding(String),
    #[error("token does not inflate: {0}")]
    Compression(String),
    #[error("id {0} does not fit in {ID_BITS} bits")]
    OutOfRange(i64),
}

pub fn decode_id_token(token: &str) -> Result<Vec<i64>, TokenError> {
    let packed = TOKEN_ENGINE
        .decode(token.trim())
        .map_err(|e| TokenError::Encoding(e.to_string()))?;
    let mut bytes = Vec::new();
    ZlibDecoder::new(packed.as_slice())
        .read_to_end(&mut bytes)
        .map_err(|e| TokenError::Compression(e.to_string()))?;
    Ok(unpack_ids(&bytes))
}

pub fn encode_id_token(ids: &[i64]) -> Result<String, TokenError> {
    if let Some(&bad) = ids.iter().find(|&&id| !(0..=MAX_TOKEN_ID).contains(&id)) {
        return Err(TokenError::OutOfRange(bad));
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder
        .write_all(&pack_ids(ids))
        .map_err(|e| TokenError::Compression(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| TokenError::Compression(e.to_string()))?;
    Ok(TOKEN_ENGINE.encode(compressed))
}

fn unpack_ids(bytes: &[u8]) -> Vec<i64> {
    let mut ids = Vec::with_capacity(bytes.len() * 8 / ID_BITS as usize);
    let mut buffer: u32 = 0;
    let mut buffered = 0;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        buffered += 8;
        while buffered >= ID_BITS {
            buffered -= ID_BITS;
            ids.push(i64::from((buffer >> buffered) & MAX_TOKEN_ID as u32));
        }
        buffer &= (1 << buffered) - 1;
    }
    ids
}

/// Callers have already range checked `ids`.
fn pack_ids(ids: &[i64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity((ids.len() * ID_BITS as usize).div_ceil(8));
    let mut buffer: u32 = 0;
    let mut buffered = 0;
    for &id in ids {
        buffer = (buffer << ID_BITS) | (id as u32 & MAX_TOKEN_ID as u32);
        buffered += ID_BITS;
        while buffered >= 8 {
            buffered -= 8;
            bytes.push((buffer >> buffered) as u8);
        }
        buffer &= (1 << buffered) - 1;
    }
    if buffered > 0 {
        bytes.push((buffer << (8 - buffered)) as u8);
    }
    bytes
}
