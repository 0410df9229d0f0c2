//! Gzip/DEFLATE layer applied on top of the JSON envelope (spec.md §6
//! `persistence.compression_enabled`).

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use task_queue_common::error::Result;

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_arbitrary_bytes() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(50);
        let compressed = compress(&original).unwrap();
        assert!(compressed.len() < original.len());
        assert_eq!(decompress(&compressed).unwrap(), original);
    }
}
