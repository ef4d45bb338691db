//! Freeze/thaw of a Context's correlation state
//!
//! A portable token is `[b'L', version, flags, payload...]`. Flag bit 0
//! selects a bincode payload (JSON otherwise), bit 1 marks the payload as
//! zstd-compressed. Both directions are pure: no manager call, no shared
//! state, safe to run any number of times concurrently on the same token.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::debug;

use crate::context::{AccessIntent, Context, Locale, Retention, StateToken};
use crate::core::config::{CoordinatorConfig, TokenFormat, DEFAULT_MAX_TOKEN_BYTES};
use crate::core::errors::{BridgeError, Result};

const MAGIC: u8 = b'L';
const VERSION: u8 = 1;
const FLAG_BINARY: u8 = 0b01;
const FLAG_ZSTD: u8 = 0b10;
const HEADER_LEN: usize = 3;

/// Opaque, process-transferable form of a Context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortableToken(Vec<u8>);

impl PortableToken {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for PortableToken {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PortableToken {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Serialize, Deserialize)]
struct FrozenContext {
    state: StateToken,
    access: AccessIntent,
    retention: Retention,
    locale: Locale,
}

/// Encodes Contexts into portable tokens and back
#[derive(Debug, Clone)]
pub struct StateTokenCodec {
    format: TokenFormat,
    compression_level: Option<i32>,
    max_token_bytes: usize,
}

impl Default for StateTokenCodec {
    fn default() -> Self {
        Self::new(TokenFormat::default())
    }
}

impl StateTokenCodec {
    pub fn new(format: TokenFormat) -> Self {
        Self {
            format,
            compression_level: None,
            max_token_bytes: DEFAULT_MAX_TOKEN_BYTES,
        }
    }

    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            format: config.token_format,
            compression_level: config.compression_level,
            max_token_bytes: config.max_token_bytes,
        }
    }

    pub fn with_compression(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn with_max_token_bytes(mut self, bytes: usize) -> Self {
        self.max_token_bytes = bytes;
        self
    }

    pub fn format(&self) -> TokenFormat {
        self.format
    }

    /// Capture the portable fields of `context` verbatim
    pub fn freeze(&self, context: &Context) -> Result<PortableToken> {
        if context.state_token().is_empty() {
            return Err(BridgeError::codec("cannot freeze an empty state token"));
        }
        let frozen = FrozenContext {
            state: context.state_token().clone(),
            access: context.access(),
            retention: context.retention(),
            locale: context.locale().clone(),
        };

        let mut flags = 0;
        let payload = match self.format {
            TokenFormat::Json => serde_json::to_vec(&frozen)?,
            TokenFormat::Binary => {
                flags |= FLAG_BINARY;
                bincode::serialize(&frozen)?
            }
        };
        // thaw caps decompression at the same limit
        self.check_size("payload", payload.len())?;

        let payload = match self.compression_level {
            Some(level) => {
                flags |= FLAG_ZSTD;
                zstd::bulk::compress(&payload, level)
                    .map_err(|e| BridgeError::codec_with_source("zstd compression failed", e))?
            }
            None => payload,
        };

        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&[MAGIC, VERSION, flags]);
        bytes.extend_from_slice(&payload);
        self.check_size("token", bytes.len())?;

        debug!("Froze state {} into {} byte token", context.state_token(), bytes.len());
        Ok(PortableToken(bytes))
    }

    /// Rebuild a Context from a portable token. Either payload format is
    /// accepted regardless of this codec's own output format.
    pub fn thaw(&self, token: &PortableToken) -> Result<Context> {
        let bytes = token.as_bytes();
        self.check_size("token", bytes.len())?;
        if bytes.len() < HEADER_LEN {
            return Err(BridgeError::codec(format!(
                "token truncated: {} bytes is shorter than the header",
                bytes.len()
            )));
        }

        let (header, body) = bytes.split_at(HEADER_LEN);
        if header[0] != MAGIC {
            return Err(BridgeError::codec("not a portable state token"));
        }
        if header[1] != VERSION {
            return Err(BridgeError::codec(format!(
                "unsupported token version {} (expected {})",
                header[1], VERSION
            )));
        }
        let flags = header[2];
        if flags & !(FLAG_BINARY | FLAG_ZSTD) != 0 {
            return Err(BridgeError::codec(format!("unknown token flags {:#04x}", flags)));
        }

        let payload: Cow<'_, [u8]> = if flags & FLAG_ZSTD != 0 {
            let decompressed = zstd::bulk::decompress(body, self.max_token_bytes)
                .map_err(|e| BridgeError::codec_with_source("zstd decompression failed", e))?;
            Cow::Owned(decompressed)
        } else {
            Cow::Borrowed(body)
        };

        let frozen: FrozenContext = if flags & FLAG_BINARY != 0 {
            bincode::deserialize(&payload)?
        } else {
            serde_json::from_slice(&payload)?
        };
        if frozen.state.is_empty() {
            return Err(BridgeError::codec("token carries an empty state token"));
        }

        debug!("Thawed state {} from {} byte token", frozen.state, bytes.len());
        Ok(Context::from_parts(
            frozen.state,
            frozen.access,
            frozen.retention,
            frozen.locale,
        ))
    }

    fn check_size(&self, what: &str, len: usize) -> Result<()> {
        if len > self.max_token_bytes {
            return Err(BridgeError::codec(format!(
                "{} of {} bytes exceeds limit of {} bytes",
                what, len, self.max_token_bytes
            )));
        }
        Ok(())
    }
}
