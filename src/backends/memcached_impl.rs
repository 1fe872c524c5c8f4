use std::{
    borrow::Cow,
    fmt,
    io::{Read, Write},
};

use bytes::Bytes;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use memcache::{CommandError, MemcacheError, Url, UrlParseError};

use crate::{
    BackendError, ClientFactory, ClientHandle, ConnectionSettings, Result, SetOptions,
    error::BoxError,
};

/// Flag bit marking a zlib-compressed value, the same bit pylibmc uses.
const COMPRESSED_FLAG: u32 = 1 << 3;
const DEFAULT_PORT: u16 = 11211;
/// Largest value `decode` will inflate to: memcached's default 1 MiB item
/// limit times the best ratio zlib reaches on repetitive data, rounded up.
const MAX_INFLATED_LEN: u64 = 32 * 1024 * 1024;

/// Opens [`MemcachedClient`]s with the `memcache` crate.
///
/// Endpoints without a scheme are taken as `host[:port]` and turned into
/// `memcache://` URLs. Behaviors become URL query parameters, which is how the
/// `memcache` crate takes its tuning options (`timeout`, `tcp_nodelay`, ...).
/// The text protocol is selected with `protocol=ascii` when
/// `binary_protocol` is off.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemcachedClientFactory;

impl MemcachedClientFactory {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// The connection URLs the factory derives from `settings`.
    ///
    /// Behavior names and values are percent-encoded into the query string.
    pub fn urls(settings: &ConnectionSettings) -> Result<Vec<String>, UrlParseError> {
        let mut params: Vec<(String, String)> = settings
            .behaviors
            .iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (name.clone(), value)
            })
            .collect();
        if !settings.binary_protocol {
            params.push(("protocol".to_string(), "ascii".to_string()));
        }

        settings
            .endpoints
            .as_slice()
            .iter()
            .map(|endpoint| endpoint_url(endpoint, &params))
            .collect()
    }
}

fn endpoint_url(endpoint: &str, params: &[(String, String)]) -> Result<String, UrlParseError> {
    let base = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        let has_port = !endpoint.ends_with(']')
            && endpoint
                .rsplit_once(':')
                .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
        if has_port {
            format!("memcache://{endpoint}")
        } else {
            format!("memcache://{endpoint}:{DEFAULT_PORT}")
        }
    };

    let mut url = Url::parse(&base)?;
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url.to_string())
}

impl ClientFactory for MemcachedClientFactory {
    type Handle = MemcachedClient;

    fn connect(&self, settings: &ConnectionSettings) -> Result<MemcachedClient> {
        let connection_error = |source: BoxError| BackendError::Connection {
            endpoints: settings.endpoints.to_vec(),
            source,
        };
        let urls = Self::urls(settings).map_err(|e| connection_error(Box::new(e)))?;
        let client =
            memcache::Client::connect(urls.clone()).map_err(|e| connection_error(Box::new(e)))?;

        Ok(MemcachedClient {
            client,
            urls,
            binary_protocol: settings.binary_protocol,
        })
    }
}

pub struct MemcachedClient {
    client: memcache::Client,
    urls: Vec<String>,
    binary_protocol: bool,
}

impl MemcachedClient {
    /// Text-protocol `add` reports a refused store as success, so the marker
    /// is made unique and read back to learn whether this client won.
    fn add_verified(&self, key: &str, value: &[u8]) -> Result<bool> {
        let token = lock_token(value, rand::random());

        self.client
            .add(key, token.as_slice(), 0)
            .map_err(BackendError::remote)?;

        let current: Option<Vec<u8>> = self.client.get(key).map_err(BackendError::remote)?;
        Ok(won_add(current.as_deref(), &token))
    }
}

fn lock_token(value: &[u8], suffix: u64) -> Vec<u8> {
    let mut token = value.to_vec();
    token.extend_from_slice(format!(":{suffix:016x}").as_bytes());
    token
}

/// Whether the entry read back after an `add` is the token this client wrote.
/// A missing entry means the holder released in between, which is a loss.
fn won_add(current: Option<&[u8]>, token: &[u8]) -> bool {
    current == Some(token)
}

impl fmt::Debug for MemcachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedClient")
            .field("urls", &self.urls)
            .field("binary_protocol", &self.binary_protocol)
            .finish_non_exhaustive()
    }
}

impl ClientHandle for MemcachedClient {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let raw: Option<(Vec<u8>, u32)> = self.client.get(key).map_err(BackendError::remote)?;
        raw.map(|(value, flags)| decode(value, flags)).transpose()
    }

    fn get_multi(&self, keys: &[&str]) -> Result<Vec<(String, Bytes)>> {
        let mut found = self
            .client
            .gets::<(Vec<u8>, u32)>(keys)
            .map_err(BackendError::remote)?;

        keys.iter()
            .filter_map(|key| found.remove_entry(*key))
            .map(|(key, (value, flags))| Ok((key, decode(value, flags)?)))
            .collect()
    }

    fn set(&self, key: &str, value: &[u8], options: &SetOptions) -> Result<()> {
        let payload = encode(value, options.compress_threshold)?;
        self.client
            .set(key, payload, options.ttl_seconds.unwrap_or(0))
            .map_err(BackendError::remote)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete(key)
            .map(|_existed| ())
            .map_err(BackendError::remote)
    }

    fn add_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        if !self.binary_protocol {
            return self.add_verified(key, value);
        }

        match self.client.add(key, value, 0) {
            Ok(()) => Ok(true),
            Err(MemcacheError::CommandError(CommandError::KeyExists)) => Ok(false),
            Err(err) => Err(BackendError::remote(err)),
        }
    }
}

struct Payload<'a> {
    bytes: Cow<'a, [u8]>,
    flags: u32,
}

impl<W: Write> memcache::ToMemcacheValue<W> for Payload<'_> {
    fn get_flags(&self) -> u32 {
        self.flags
    }

    fn get_length(&self) -> usize {
        self.bytes.len()
    }

    fn write_to(&self, stream: &mut W) -> std::io::Result<()> {
        stream.write_all(&self.bytes)
    }
}

fn encode(value: &[u8], threshold: Option<usize>) -> Result<Payload<'_>> {
    let plain = Payload {
        bytes: Cow::Borrowed(value),
        flags: 0,
    };
    let Some(threshold) = threshold else {
        return Ok(plain);
    };
    if value.len() < threshold {
        return Ok(plain);
    }

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(value.len() / 2), Compression::default());
    encoder
        .write_all(value)
        .map_err(|e| BackendError::Serialization(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| BackendError::Serialization(e.to_string()))?;

    if compressed.len() >= value.len() {
        return Ok(plain);
    }
    Ok(Payload {
        bytes: Cow::Owned(compressed),
        flags: COMPRESSED_FLAG,
    })
}

fn decode(value: Vec<u8>, flags: u32) -> Result<Bytes> {
    if flags & COMPRESSED_FLAG == 0 {
        return Ok(Bytes::from(value));
    }

    inflate(&value, MAX_INFLATED_LEN).map(Bytes::from)
}

fn inflate(compressed: &[u8], limit: u64) -> Result<Vec<u8>> {
    let mut inflated = Vec::with_capacity(compressed.len() * 2);
    // One byte past the limit tells an exact fit from an overflow.
    ZlibDecoder::new(compressed)
        .take(limit + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| BackendError::Serialization(e.to_string()))?;

    if inflated.len() as u64 > limit {
        return Err(BackendError::Serialization(format!(
            "compressed value inflates past {limit} bytes"
        )));
    }
    Ok(inflated)
}
