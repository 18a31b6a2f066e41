/// LZMA/XZ stream decompression
use crate::config::types::{InitError, Result};
use std::io::{self, Write};
use xz2::read::XzDecoder;
use xz2::stream::Stream;

/// Decompress an xz or legacy lzma stream from `input` into `out`.
///
/// Returns the number of decompressed bytes written.
pub fn unxz<W: Write + ?Sized>(input: &[u8], out: &mut W) -> Result<u64> {
    let stream = Stream::new_auto_decoder(u64::MAX, 0)
        .map_err(|e| InitError::Archive(format!("Failed to initialize lzma decoder: {}", e)))?;
    let mut decoder = XzDecoder::new_stream(input, stream);

    let written = io::copy(&mut decoder, out)
        .map_err(|e| InitError::Archive(format!("lzma decompression failed: {}", e)))?;
    out.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = xz2::read::XzEncoder::new(data, 6);
        let mut out = Vec::new();
        encoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_unxz_restores_payload() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut out = Vec::new();
        let written = unxz(&compress(&payload), &mut out).unwrap();
        assert_eq!(written as usize, payload.len());
        assert_eq!(out, payload);
    }

    #[test]
    fn test_unxz_rejects_garbage() {
        let mut out = Vec::new();
        assert!(matches!(
            unxz(b"definitely not xz", &mut out),
            Err(InitError::Archive(_))
        ));
    }
}
