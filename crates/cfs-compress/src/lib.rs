#![forbid(unsafe_code)]
//! Extent compression codec.
//!
//! Compressed extents are stored as one opaque codec stream per extent. The
//! writer gives up (returns `Ok(None)`) as soon as the output would not fit
//! in `max_out` bytes; callers decide whether that means "store raw" or
//! "mark the inode NOCOMPRESS".
//!
//! [`looks_compressible`] is a cheap sampling heuristic run before the codec
//! so obviously random data does not burn CPU on a doomed attempt.

use cfs_error::{CfsError, Result};
use cfs_types::CompressionType;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use std::io::{Read, Write};
use tracing::trace;

/// Default level when none is given (`compress=zstd`).
pub const DEFAULT_LEVEL: u32 = 3;

/// Valid levels for an algorithm.
#[must_use]
pub fn level_range(kind: CompressionType) -> std::ops::RangeInclusive<u32> {
    match kind {
        CompressionType::None => 0..=0,
        CompressionType::Zlib => 1..=9,
        CompressionType::Zstd => 1..=15,
    }
}

/// Parse an algorithm name as used in mount options.
pub fn parse_kind(name: &str) -> Result<CompressionType> {
    match name {
        "zlib" => Ok(CompressionType::Zlib),
        "zstd" => Ok(CompressionType::Zstd),
        "no" | "none" => Ok(CompressionType::None),
        "lzo" => Err(CfsError::UnsupportedFeature("lzo compression".to_owned())),
        other => Err(CfsError::InvalidArgument(format!(
            "unknown compression algorithm {other:?}"
        ))),
    }
}

fn codec_error(kind: CompressionType, err: &std::io::Error) -> CfsError {
    CfsError::Corruption {
        location: 0,
        detail: format!("{} stream: {err}", kind.name()),
    }
}

/// Compress `input`. Returns `Ok(None)` when the result would be larger
/// than `max_out` bytes.
pub fn compress(
    kind: CompressionType,
    level: u32,
    input: &[u8],
    max_out: usize,
) -> Result<Option<Vec<u8>>> {
    let level = level.clamp(*level_range(kind).start(), *level_range(kind).end());
    let out = match kind {
        CompressionType::None => {
            return Err(CfsError::InvalidArgument(
                "compress called without an algorithm".to_owned(),
            ));
        }
        CompressionType::Zlib => {
            let mut enc = ZlibEncoder::new(Vec::with_capacity(max_out), Compression::new(level));
            enc.write_all(input)?;
            enc.finish()?
        }
        CompressionType::Zstd => {
            let level = i32::try_from(level).unwrap_or(3);
            zstd::bulk::compress(input, level)?
        }
    };
    trace!(
        algo = kind.name(),
        level,
        in_len = input.len(),
        out_len = out.len(),
        "compressed"
    );
    if out.len() > max_out {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Decompress a whole stream into exactly `out_len` bytes. A stream that
/// decodes short is zero-padded; one that decodes long is an error.
pub fn decompress(kind: CompressionType, input: &[u8], out_len: usize) -> Result<Vec<u8>> {
    let mut out = match kind {
        CompressionType::None => input.to_vec(),
        CompressionType::Zlib => {
            let mut out = Vec::with_capacity(out_len);
            ZlibDecoder::new(input)
                .take(out_len as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|e| codec_error(kind, &e))?;
            out
        }
        CompressionType::Zstd => {
            zstd::stream::decode_all(input).map_err(|e| codec_error(kind, &e))?
        }
    };
    if out.len() > out_len {
        return Err(CfsError::Corruption {
            location: 0,
            detail: format!(
                "{} stream decoded to {} bytes, expected at most {out_len}",
                kind.name(),
                out.len()
            ),
        });
    }
    out.resize(out_len, 0);
    Ok(out)
}

/// Decompress and copy the bytes starting at `start` of the decoded stream
/// into `dest`.
pub fn decompress_into(
    kind: CompressionType,
    input: &[u8],
    ram_len: usize,
    start: usize,
    dest: &mut [u8],
) -> Result<()> {
    let full = decompress(kind, input, ram_len)?;
    let end = start.saturating_add(dest.len()).min(full.len());
    let avail = end.saturating_sub(start);
    dest[..avail].copy_from_slice(&full[start.min(end)..end]);
    dest[avail..].fill(0);
    Ok(())
}

// ── Heuristic ───────────────────────────────────────────────────────────────

const SAMPLING_READ_SIZE: usize = 16;
const SAMPLING_INTERVAL: usize = 256;
const BYTE_SET_THRESHOLD: usize = 64;
const BYTE_CORE_SET_LOW: usize = 64;
const BYTE_CORE_SET_HIGH: usize = 200;
const ENTROPY_LVL_ACCEPTABLE: u64 = 65;
const ENTROPY_LVL_HIGH: u64 = 80;

fn sample(data: &[u8]) -> Vec<u8> {
    if data.len() <= SAMPLING_INTERVAL * 4 {
        return data.to_vec();
    }
    let mut out = Vec::with_capacity(data.len() / SAMPLING_INTERVAL * SAMPLING_READ_SIZE);
    let mut pos = 0;
    while pos + SAMPLING_READ_SIZE <= data.len() {
        out.extend_from_slice(&data[pos..pos + SAMPLING_READ_SIZE]);
        pos += SAMPLING_INTERVAL;
    }
    out
}

/// Shannon entropy of `counts` as a percentage of 8 bits per byte.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn entropy_percent(counts: &[u32; 256], total: usize) -> u64 {
    let total = total as f64;
    let bits: f64 = counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = f64::from(c) / total;
            -p * p.log2()
        })
        .sum();
    (bits * 100.0 / 8.0) as u64
}

/// Whether `data` is worth handing to the codec.
#[must_use]
pub fn looks_compressible(data: &[u8]) -> bool {
    let s = sample(data);
    if s.len() < SAMPLING_READ_SIZE * 2 {
        return true;
    }
    let half = s.len() / 2;
    if s[..half] == s[half..half * 2] {
        return true;
    }
    let mut counts = [0_u32; 256];
    for &b in &s {
        counts[usize::from(b)] += 1;
    }
    let set_size = counts.iter().filter(|&&c| c > 0).count();
    if set_size < BYTE_SET_THRESHOLD {
        return true;
    }
    let entropy = entropy_percent(&counts, s.len());
    if entropy < ENTROPY_LVL_ACCEPTABLE {
        return true;
    }
    let mut sorted = counts;
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let threshold = s.len() * 90 / 100;
    let mut covered = 0_usize;
    let mut core = 0_usize;
    for c in sorted {
        if covered >= threshold {
            break;
        }
        covered += c as usize;
        core += 1;
    }
    if core <= BYTE_CORE_SET_LOW {
        return true;
    }
    if core >= BYTE_CORE_SET_HIGH {
        return false;
    }
    entropy < ENTROPY_LVL_HIGH
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pattern(len: usize) -> Vec<u8> {
        b"abcd".iter().copied().cycle().take(len).collect()
    }

    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed.to_le_bytes()[3]
            })
            .collect()
    }

    #[test]
    fn pattern_compresses_with_both_codecs() {
        let input = pattern(128 * 1024);
        for kind in [CompressionType::Zlib, CompressionType::Zstd] {
            let out = compress(kind, DEFAULT_LEVEL, &input, input.len())
                .expect("compress")
                .expect("fits");
            assert!(out.len() < 4096, "{kind:?} produced {} bytes", out.len());
            assert_eq!(decompress(kind, &out, input.len()).expect("decompress"), input);
        }
    }

    #[test]
    fn gives_up_when_output_exceeds_limit() {
        let input = noise(64 * 1024, 7);
        for kind in [CompressionType::Zlib, CompressionType::Zstd] {
            assert!(
                compress(kind, DEFAULT_LEVEL, &input, input.len() - 4096)
                    .expect("compress")
                    .is_none()
            );
        }
    }

    #[test]
    fn decompress_pads_short_streams_and_rejects_long_ones() {
        let input = pattern(1000);
        let out = compress(CompressionType::Zstd, 3, &input, 4096)
            .expect("compress")
            .expect("fits");
        let padded = decompress(CompressionType::Zstd, &out, 4096).expect("pad");
        assert_eq!(&padded[..1000], &input[..]);
        assert!(padded[1000..].iter().all(|&b| b == 0));
        assert!(decompress(CompressionType::Zstd, &out, 10).is_err());
        assert!(decompress(CompressionType::Zlib, b"not zlib", 10).is_err());
    }

    #[test]
    fn decompress_into_slices_the_stream() {
        let input: Vec<u8> = (0..8192_u32).map(|i| (i % 251) as u8).collect();
        let out = compress(CompressionType::Zlib, 6, &input, input.len())
            .expect("compress")
            .expect("fits");
        let mut dest = vec![0xff_u8; 100];
        decompress_into(CompressionType::Zlib, &out, input.len(), 4000, &mut dest).expect("into");
        assert_eq!(&dest[..], &input[4000..4100]);
        decompress_into(CompressionType::Zlib, &out, input.len(), 8150, &mut dest).expect("tail");
        assert_eq!(&dest[..42], &input[8150..]);
        assert!(dest[42..].iter().all(|&b| b == 0));
    }

    #[test]
    fn parse_kind_names() {
        assert_eq!(parse_kind("zstd").expect("zstd"), CompressionType::Zstd);
        assert_eq!(parse_kind("zlib").expect("zlib"), CompressionType::Zlib);
        assert_eq!(parse_kind("no").expect("no"), CompressionType::None);
        assert!(matches!(parse_kind("lzo"), Err(CfsError::UnsupportedFeature(_))));
        assert!(matches!(parse_kind("lz4"), Err(CfsError::InvalidArgument(_))));
    }

    #[test]
    fn heuristic_separates_text_from_noise() {
        assert!(looks_compressible(&pattern(256 * 1024)));
        let text = b"the quick brown fox jumps over the lazy dog. ".repeat(4000);
        assert!(looks_compressible(&text));
        assert!(!looks_compressible(&noise(256 * 1024, 99)));
        assert!(looks_compressible(b"tiny"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn stored_compressed_round_trips(
            seed in any::<u64>(),
            len in 1_usize..64 * 1024,
            zstd in any::<bool>(),
        ) {
            let kind = if zstd { CompressionType::Zstd } else { CompressionType::Zlib };
            // Low-entropy input: a handful of distinct bytes.
            let input: Vec<u8> = noise(len, seed | 1).iter().map(|b| b % 4).collect();
            if let Some(out) = compress(kind, DEFAULT_LEVEL, &input, len).expect("compress") {
                prop_assert!(out.len() <= len);
                prop_assert_eq!(decompress(kind, &out, len).expect("decompress"), input);
            }
        }
    }
}
