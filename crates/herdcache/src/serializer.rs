//! Payload encoding for the remote tier.
//!
//! Values are MessagePack-encoded; payloads above the configured threshold are
//! gzip-compressed. Reads try to inflate first and fall back to the raw bytes,
//! so entries written with compression off (or below the threshold) stay
//! readable after the setting changes.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use herdcache_config::SerializerConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone)]
pub struct Serializer {
    compression_enabled: bool,
    threshold: usize,
    level: Compression,
}

impl Default for Serializer {
    fn default() -> Self {
        Self::new(&SerializerConfig::default())
    }
}

impl Serializer {
    pub fn new(config: &SerializerConfig) -> Self {
        Self {
            compression_enabled: config.compression_enabled,
            threshold: config.compression_threshold_bytes,
            level: Compression::new(config.compression_level.min(9)),
        }
    }

    /// Plain MessagePack, never compressed. Used for the local tier.
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(value)?)
    }

    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Encode for the remote tier, compressing above the threshold.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = self.to_bytes(value)?;
        if self.compression_enabled && raw.len() > self.threshold {
            return self.compress(&raw);
        }
        Ok(raw)
    }

    /// Decode a remote payload.
    ///
    /// A payload that does not inflate is taken to be uncompressed.
    pub fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T> {
        if self.compression_enabled {
            match Self::decompress(payload) {
                Ok(inflated) => match rmp_serde::from_slice(&inflated) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::debug!(
                            error = %e,
                            "inflated payload did not decode, retrying raw"
                        );
                    }
                },
                Err(_) => {
                    tracing::trace!("payload not compressed");
                }
            }
        }
        self.from_bytes(payload)
    }

    fn compress(&self, raw: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2), self.level);
        encoder
            .write_all(raw)
            .map_err(|e| CacheError::Serialization(format!("gzip write failed: {e}")))?;
        encoder
            .finish()
            .map_err(|e| CacheError::Serialization(format!("gzip finish failed: {e}")))
    }

    fn decompress(payload: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(payload);
        let mut out = Vec::with_capacity(payload.len() * 2);
        decoder.read_to_end(&mut out)?;
        Ok(out)
    }
}
