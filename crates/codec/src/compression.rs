//! Compression backends for the four supported algorithms.
//!
//! Every algorithm round-trips arbitrary bytes; the pipeline above decides
//! whether compressing was worth it (ratio < 0.95) and may discard the
//! result, reporting `None` in the flags.

use crate::{CodecError, CodecResult};
use emdb_types::CompressionAlgorithm;
use std::io::{Read, Write};

/// Compresses `data` with `algo`. `CompressionAlgorithm::None` is a
/// caller bug, not a storage format.
pub fn compress(algo: CompressionAlgorithm, data: &[u8]) -> CodecResult<Vec<u8>> {
    match algo {
        CompressionAlgorithm::None => Err(CodecError::CompressionFailed(
            "compress called with algorithm None".into(),
        )),
        CompressionAlgorithm::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| CodecError::CompressionFailed(e.to_string()))
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionAlgorithm::Zstd => zstd::stream::encode_all(data, 0)
            .map_err(|e| CodecError::CompressionFailed(e.to_string())),
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams::default();
            brotli::BrotliCompress(&mut &data[..], &mut out, &params)
                .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
            Ok(out)
        }
    }
}

/// Decompresses `data`. `expected_size` is the extended header's
/// `uncompressed_size` and is enforced: a mismatch means the block lies
/// about itself and is treated as corruption.
pub fn decompress(
    algo: CompressionAlgorithm,
    data: &[u8],
    expected_size: usize,
) -> CodecResult<Vec<u8>> {
    let out = match algo {
        CompressionAlgorithm::None => {
            return Err(CodecError::DecompressionFailed(
                "decompress called with algorithm None".into(),
            ))
        }
        CompressionAlgorithm::Gzip => {
            let mut out = Vec::with_capacity(expected_size);
            flate2::read::GzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
            out
        }
        CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?,
        CompressionAlgorithm::Zstd => zstd::stream::decode_all(data)
            .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?,
        CompressionAlgorithm::Brotli => {
            let mut out = Vec::with_capacity(expected_size);
            brotli::BrotliDecompress(&mut &data[..], &mut out)
                .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
            out
        }
    };

    if out.len() != expected_size {
        return Err(CodecError::DecompressionFailed(format!(
            "decompressed to {} bytes, header declares {expected_size}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    const ALGOS: [CompressionAlgorithm; 4] = [
        CompressionAlgorithm::Gzip,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
        CompressionAlgorithm::Brotli,
    ];

    #[test]
    fn roundtrip_repetitive_text() {
        let line = "From: alice@example.com\nTo: bob@example.com\nSubject: weekly report\n";
        let data = line.repeat(5000).into_bytes();
        for algo in ALGOS {
            let compressed = compress(algo, &data).unwrap();
            assert!(
                compressed.len() < data.len() / 5,
                "{algo:?} compressed {} -> {}",
                data.len(),
                compressed.len()
            );
            assert_eq!(decompress(algo, &compressed, data.len()).unwrap(), data);
        }
    }

    #[test]
    fn empty_input_roundtrips() {
        for algo in ALGOS {
            let compressed = compress(algo, b"").unwrap();
            assert_eq!(decompress(algo, &compressed, 0).unwrap(), b"");
        }
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let data = b"some plain bytes".to_vec();
        let compressed = compress(CompressionAlgorithm::Zstd, &data).unwrap();
        assert!(matches!(
            decompress(CompressionAlgorithm::Zstd, &compressed, data.len() + 1),
            Err(CodecError::DecompressionFailed(_))
        ));
    }

    proptest! {
        /// `decompress(compress(p)) == p` for every algorithm.
        #[test]
        fn roundtrip_any_payload(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
            for algo in ALGOS {
                let compressed = compress(algo, &data).unwrap();
                prop_assert_eq!(decompress(algo, &compressed, data.len()).unwrap(), data.clone());
            }
        }
    }
}
