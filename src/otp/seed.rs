//! OTP seed normalization and generation.
//!
//! Seeds arrive from the UI in whatever form the user pasted: Base32
//! (RFC 4648, case-insensitive, `=` padding), hex, Base64, bare text, or a
//! CSV row whose first column is Base32. Everything normalizes to raw key
//! bytes; re-encoding always yields canonical Base32.
use base32::Alphabet;
use base64::Engine;

use crate::crypto::rand_bytes;
use crate::error::{AgentError, Result};

/// Default generated seed length, in bytes (SHA-1 HOTP key size).
pub const DEFAULT_SEED_LEN: usize = 20;
/// Largest secret the slot structure can carry.
pub const MAX_SEED_LEN: usize = 64;

const B32: Alphabet = Alphabet::RFC4648 { padding: true };
const B32_NOPAD: Alphabet = Alphabet::RFC4648 { padding: false };

/// Seed input encodings accepted by `otpWriteSlot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedFormat {
    /// Try Base32, then hex, then Base64, then fall back to text.
    #[default]
    Auto,
    Base32,
    Hex,
    Base64,
    Text,
    Csv,
}

impl SeedFormat {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "auto" => SeedFormat::Auto,
            "base32" => SeedFormat::Base32,
            "hex" => SeedFormat::Hex,
            "base64" => SeedFormat::Base64,
            "text" => SeedFormat::Text,
            "csv" => SeedFormat::Csv,
            other => {
                return Err(AgentError::InvalidParams(format!(
                    "unknown seed format: {other}"
                )))
            }
        })
    }
}

/// A decoded seed, with a warning when the decode was a lossy guess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSeed {
    pub bytes: Vec<u8>,
    pub warning: Option<String>,
}

/// Decodes `input` according to `format`.
pub fn normalize(input: &str, format: SeedFormat) -> Result<NormalizedSeed> {
    let seed = match format {
        SeedFormat::Base32 => plain(decode_base32(input)?),
        SeedFormat::Hex => plain(decode_hex(input)?),
        SeedFormat::Base64 => plain(decode_base64(input)?),
        SeedFormat::Text => text_seed(input),
        SeedFormat::Csv => {
            let first = input
                .lines()
                .next()
                .unwrap_or("")
                .split(',')
                .next()
                .unwrap_or("")
                .trim();
            plain(decode_base32(first)?)
        }
        SeedFormat::Auto => {
            if input.contains(',') {
                return normalize(input, SeedFormat::Csv);
            }
            if let Ok(b) = decode_base32(input) {
                plain(b)
            } else if let Ok(b) = decode_hex(input) {
                plain(b)
            } else if let Ok(b) = decode_base64(input) {
                plain(b)
            } else {
                text_seed(input)
            }
        }
    };

    if seed.bytes.is_empty() {
        return Err(AgentError::Format("seed is empty".to_string()));
    }
    if seed.bytes.len() > MAX_SEED_LEN {
        return Err(AgentError::Format(format!(
            "seed is {} bytes, maximum is {MAX_SEED_LEN}",
            seed.bytes.len()
        )));
    }
    Ok(seed)
}

fn plain(bytes: Vec<u8>) -> NormalizedSeed {
    NormalizedSeed {
        bytes,
        warning: None,
    }
}

fn text_seed(input: &str) -> NormalizedSeed {
    NormalizedSeed {
        bytes: input.as_bytes().to_vec(),
        warning: Some(
            "seed was not valid Base32/hex/Base64; using its UTF-8 bytes verbatim".to_string(),
        ),
    }
}

fn decode_base32(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if cleaned.is_empty() {
        return Err(AgentError::Format("empty Base32 seed".to_string()));
    }
    base32::decode(B32_NOPAD, &cleaned)
        .ok_or_else(|| AgentError::Format("seed is not valid Base32".to_string()))
}

fn decode_hex(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() % 2 != 0 {
        return Err(AgentError::Format(
            "hex seed must have an even number of digits".to_string(),
        ));
    }
    hex::decode(&cleaned).map_err(|_| AgentError::Format("seed is not valid hex".to_string()))
}

fn decode_base64(input: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|_| AgentError::Format("seed is not valid Base64".to_string()))
}

/// Canonical Base32 form: uppercase RFC 4648 with padding.
pub fn to_base32(bytes: &[u8]) -> String {
    base32::encode(B32, bytes)
}

/// `otpGenerateSeed`: `length` random bytes from the platform CSPRNG,
/// returned as canonical Base32.
pub fn generate(length: usize) -> Result<String> {
    if length == 0 || length > MAX_SEED_LEN {
        return Err(AgentError::InvalidParams(format!(
            "seed length must be between 1 and {MAX_SEED_LEN} bytes"
        )));
    }
    let mut buf = vec![0u8; length];
    rand_bytes(&mut buf)?;
    Ok(to_base32(&buf))
}
