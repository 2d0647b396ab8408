//! Gzip compression for cache payloads. Compressed payloads carry a marker
//! prefix so reads can tell them apart from plain JSON.

use super::CacheResult;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

pub const COMPRESSION_MARKER: &[u8] = b"__gz__:";

pub fn compress(data: &[u8]) -> CacheResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + COMPRESSION_MARKER.len()), Compression::default());
    encoder.write_all(data)?;
    let body = encoder.finish()?;

    let mut out = Vec::with_capacity(COMPRESSION_MARKER.len() + body.len());
    out.extend_from_slice(COMPRESSION_MARKER);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn is_compressed(data: &[u8]) -> bool {
    data.starts_with(COMPRESSION_MARKER)
}

/// Strip the marker and inflate; unmarked payloads are returned as-is
pub fn decompress(data: &[u8]) -> CacheResult<Vec<u8>> {
    if !is_compressed(data) {
        return Ok(data.to_vec());
    }
    let mut decoder = GzDecoder::new(&data[COMPRESSION_MARKER.len()..]);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
