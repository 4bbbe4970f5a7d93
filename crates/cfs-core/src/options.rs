//! Mount options.
//!
//! Options are layered: built-in defaults, then an optional JSON file,
//! then a btrfs-style `-o` string such as
//! `compress=zstd:3,nodatasum,max_inline=2048`. Every layer is validated
//! before the filesystem sees it.

use cfs_error::{CfsError, Result};
use cfs_inode::FsConfig;
use cfs_types::{
    CompressionType, DEFAULT_MAX_INLINE, DEFAULT_NODESIZE, DEFAULT_SECTORSIZE, SectorSize,
    max_inline_data_size,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Largest accepted copy count.
pub const MAX_MIRRORS: u32 = 4;

/// Compression worker cap when `thread_pool` is 0.
pub const MAX_AUTO_THREADS: usize = 8;

/// How writes reach the devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Writes complete on the submitting thread.
    Inline,
    /// A pool of IO threads, sized by `endio_threads`.
    #[default]
    Threaded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompressionOptions {
    #[serde(rename = "type")]
    pub kind: CompressionType,
    /// `None` picks the algorithm default.
    pub level: Option<u32>,
    /// Compress even data the heuristic rejects.
    pub force: bool,
}

impl CompressionOptions {
    #[must_use]
    pub fn resolved_level(&self) -> u32 {
        self.level.unwrap_or(cfs_compress::DEFAULT_LEVEL)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountOptions {
    pub sectorsize: u32,
    pub nodesize: u32,
    pub max_inline: u64,
    pub compression: CompressionOptions,
    pub datacow: bool,
    pub datasum: bool,
    /// Compression workers; 0 means one per CPU, capped at
    /// [`MAX_AUTO_THREADS`].
    pub thread_pool: usize,
    pub endio_threads: usize,
    pub max_bio_size: u64,
    pub block_group_size: u64,
    pub metadata_reserve_per_extent: u64,
    /// Copies of every data byte; one device per copy.
    pub mirrors: u32,
    pub engine: EngineKind,
}

impl Default for MountOptions {
    fn default() -> Self {
        let config = FsConfig::default();
        Self {
            sectorsize: DEFAULT_SECTORSIZE,
            nodesize: DEFAULT_NODESIZE,
            max_inline: DEFAULT_MAX_INLINE,
            compression: CompressionOptions::default(),
            datacow: true,
            datasum: true,
            thread_pool: 0,
            endio_threads: config.endio_threads,
            max_bio_size: config.max_bio_size,
            block_group_size: 256 * 1024 * 1024,
            metadata_reserve_per_extent: config.metadata_reserve_per_extent,
            mirrors: 1,
            engine: EngineKind::default(),
        }
    }
}

fn invalid(msg: impl Into<String>) -> CfsError {
    CfsError::InvalidArgument(msg.into())
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix.
pub fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, shift) = match value.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let shift = match c.to_ascii_lowercase() {
                'k' => 10,
                'm' => 20,
                'g' => 30,
                _ => return Err(invalid(format!("bad size suffix in {value:?}"))),
            };
            (&value[..idx], shift)
        }
        _ => (value, 0),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| invalid(format!("bad size {value:?}")))?;
    n.checked_mul(1_u64 << shift)
        .ok_or_else(|| invalid(format!("size {value:?} overflows")))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("option {key}: bad number {value:?}")))
}

fn need<'a>(key: &str, value: Option<&'a str>) -> Result<&'a str> {
    value.ok_or_else(|| invalid(format!("option {key} needs a value")))
}

/// `alg[:level]` as accepted by `compress=` and `compress-force=`.
fn parse_compress(value: &str) -> Result<(CompressionType, Option<u32>)> {
    let (name, level) = match value.split_once(':') {
        Some((name, level)) => (name, Some(parse_number("compress", level)?)),
        None => (value, None),
    };
    Ok((cfs_compress::parse_kind(name)?, level))
}

impl MountOptions {
    /// Options from a JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| invalid(format!("mount options: {e}")))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Defaults, then `json` if given, then the `-o` string if given.
    pub fn load(json: Option<&Path>, opts: Option<&str>) -> Result<Self> {
        let mut options = match json {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };
        if let Some(opts) = opts {
            options.apply_option_string(opts)?;
        }
        options.validate()?;
        Ok(options)
    }

    /// Apply a comma separated `-o` option string on top of `self`.
    pub fn apply_option_string(&mut self, opts: &str) -> Result<()> {
        for opt in opts.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            self.apply_option(opt)?;
        }
        debug!(target: "cfs::mount", opts, "option string applied");
        Ok(())
    }

    fn apply_option(&mut self, opt: &str) -> Result<()> {
        let (key, value) = match opt.split_once('=') {
            Some((k, v)) => (k.trim(), Some(v.trim())),
            None => (opt, None),
        };
        match (key, value) {
            ("compress", None) => {
                self.compression = CompressionOptions {
                    kind: CompressionType::Zlib,
                    level: None,
                    force: false,
                };
            }
            ("compress-force", None) => {
                self.compression = CompressionOptions {
                    kind: CompressionType::Zlib,
                    level: None,
                    force: true,
                };
            }
            ("compress" | "compress-force", Some(v)) => {
                let (kind, level) = parse_compress(v)?;
                self.compression = CompressionOptions {
                    kind,
                    level,
                    force: key == "compress-force" && kind.is_compressed(),
                };
            }
            ("datacow", None) => self.datacow = true,
            ("nodatacow", None) => {
                self.datacow = false;
                self.datasum = false;
            }
            ("datasum", None) => self.datasum = true,
            ("nodatasum", None) => self.datasum = false,
            ("max_inline", v) => self.max_inline = parse_size(need(key, v)?)?,
            ("thread_pool", v) => self.thread_pool = parse_number(key, need(key, v)?)?,
            ("endio_threads", v) => self.endio_threads = parse_number(key, need(key, v)?)?,
            ("max_bio_size", v) => self.max_bio_size = parse_size(need(key, v)?)?,
            ("block_group_size", v) => self.block_group_size = parse_size(need(key, v)?)?,
            ("metadata_reserve_per_extent", v) => {
                self.metadata_reserve_per_extent = parse_size(need(key, v)?)?;
            }
            ("sectorsize", v) => {
                self.sectorsize = u32::try_from(parse_size(need(key, v)?)?)
                    .map_err(|_| invalid("sectorsize too large"))?;
            }
            ("nodesize", v) => {
                self.nodesize = u32::try_from(parse_size(need(key, v)?)?)
                    .map_err(|_| invalid("nodesize too large"))?;
            }
            ("mirrors", v) => self.mirrors = parse_number(key, need(key, v)?)?,
            ("io_engine", Some("inline")) => self.engine = EngineKind::Inline,
            ("io_engine", Some("threaded")) => self.engine = EngineKind::Threaded,
            _ => return Err(invalid(format!("unknown mount option {opt:?}"))),
        }
        Ok(())
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<SectorSize> {
        let ss = SectorSize::new(self.sectorsize)
            .map_err(|e| invalid(format!("sectorsize {}: {e}", self.sectorsize)))?;
        if !self.nodesize.is_power_of_two()
            || self.nodesize < self.sectorsize
            || self.nodesize > 64 * 1024
        {
            return Err(invalid(format!(
                "nodesize {} must be a power of two between sectorsize and 64K",
                self.nodesize
            )));
        }
        if self.max_inline > max_inline_data_size(self.nodesize) {
            return Err(invalid(format!(
                "max_inline {} exceeds what a {} byte node holds",
                self.max_inline, self.nodesize
            )));
        }
        let kind = self.compression.kind;
        if let Some(level) = self.compression.level {
            if kind.is_compressed() && !cfs_compress::level_range(kind).contains(&level) {
                return Err(invalid(format!(
                    "{} level {level} out of range {:?}",
                    kind.name(),
                    cfs_compress::level_range(kind)
                )));
            }
        }
        if self.endio_threads == 0 {
            return Err(invalid("endio_threads must be at least 1"));
        }
        if self.max_bio_size < ss.bytes() || !ss.is_aligned(self.max_bio_size) {
            return Err(invalid(format!(
                "max_bio_size {} must be a sector multiple",
                self.max_bio_size
            )));
        }
        if self.block_group_size < ss.bytes() || !ss.is_aligned(self.block_group_size) {
            return Err(invalid(format!(
                "block_group_size {} must be a sector multiple",
                self.block_group_size
            )));
        }
        if !(1..=MAX_MIRRORS).contains(&self.mirrors) {
            return Err(invalid(format!(
                "mirrors {} must be in 1..={MAX_MIRRORS}",
                self.mirrors
            )));
        }
        Ok(ss)
    }

    /// Resolved compression worker count.
    #[must_use]
    pub fn resolved_thread_pool(&self) -> usize {
        if self.thread_pool == 0 {
            std::thread::available_parallelism()
                .map_or(1, usize::from)
                .min(MAX_AUTO_THREADS)
        } else {
            self.thread_pool
        }
    }

    /// Engine configuration for these options.
    pub fn to_fs_config(&self) -> Result<FsConfig> {
        let sectorsize = self.validate()?;
        let compression = self.compression.kind;
        Ok(FsConfig {
            sectorsize,
            nodesize: self.nodesize,
            max_inline: self.max_inline,
            compression,
            compress_level: if compression.is_compressed() {
                self.compression.resolved_level()
            } else {
                0
            },
            compress_force: self.compression.force,
            datacow: self.datacow,
            datasum: self.datasum,
            thread_pool: self.resolved_thread_pool(),
            endio_threads: self.endio_threads,
            max_bio_size: self.max_bio_size,
            metadata_reserve_per_extent: self.metadata_reserve_per_extent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn option_string_layers_over_defaults() {
        let mut opts = MountOptions::default();
        opts.apply_option_string("compress=zstd:3,compress-force=zlib,nodatacow,nodatasum,max_inline=2048,thread_pool=4")
            .expect("parse");
        assert_eq!(opts.compression.kind, CompressionType::Zlib);
        assert_eq!(opts.compression.level, None);
        assert!(opts.compression.force);
        assert!(!opts.datacow);
        assert!(!opts.datasum);
        assert_eq!(opts.max_inline, 2048);
        assert_eq!(opts.thread_pool, 4);
        opts.validate().expect("valid");
    }

    #[test]
    fn unknown_option_is_rejected() {
        let mut opts = MountOptions::default();
        let err = opts.apply_option_string("compress=zstd,autodefrag").expect_err("unknown");
        assert!(matches!(err, CfsError::InvalidArgument(_)));
        assert!(matches!(
            opts.apply_option_string("max_inline"),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            opts.apply_option_string("compress=lzo"),
            Err(CfsError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn json_fields_default_and_unknown_fields_fail() {
        let opts = MountOptions::from_json_str(
            r#"{"compression": {"type": "zstd", "level": 7}, "mirrors": 2}"#,
        )
        .expect("json");
        assert_eq!(opts.compression.kind, CompressionType::Zstd);
        assert_eq!(opts.compression.resolved_level(), 7);
        assert_eq!(opts.mirrors, 2);
        assert_eq!(opts.max_inline, DEFAULT_MAX_INLINE);
        assert!(MountOptions::from_json_str(r#"{"compresion": {}}"#).is_err());
    }

    #[test]
    fn json_file_then_option_string() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mount.json");
        std::fs::write(&path, r#"{"datasum": false, "max_bio_size": 131072}"#).expect("write");
        let opts = MountOptions::load(Some(&path), Some("datasum,io_engine=inline")).expect("load");
        assert!(opts.datasum);
        assert_eq!(opts.max_bio_size, 128 * 1024);
        assert_eq!(opts.engine, EngineKind::Inline);
    }

    #[test]
    fn validation_catches_bad_geometry() {
        let bad = [
            MountOptions {
                sectorsize: 3000,
                ..MountOptions::default()
            },
            MountOptions {
                nodesize: 2048,
                ..MountOptions::default()
            },
            MountOptions {
                max_bio_size: 1000,
                ..MountOptions::default()
            },
            MountOptions {
                mirrors: 0,
                ..MountOptions::default()
            },
            MountOptions {
                compression: CompressionOptions {
                    kind: CompressionType::Zlib,
                    level: Some(12),
                    force: false,
                },
                ..MountOptions::default()
            },
        ];
        for opts in bad {
            assert!(opts.validate().is_err(), "{opts:?}");
        }
    }

    #[test]
    fn fs_config_resolves_threads_and_level() {
        let mut opts = MountOptions::default();
        opts.apply_option_string("compress=zstd").expect("parse");
        let config = opts.to_fs_config().expect("config");
        assert_eq!(config.compression, CompressionType::Zstd);
        assert_eq!(config.compress_level, cfs_compress::DEFAULT_LEVEL);
        assert!((1..=MAX_AUTO_THREADS).contains(&config.thread_pool));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn sizes_accept_suffixes(n in 0_u64..1_000_000, suffix in prop::sample::select(vec!["", "k", "K", "m", "g"])) {
            let shift = match suffix.to_ascii_lowercase().as_str() {
                "k" => 10,
                "m" => 20,
                "g" => 30,
                _ => 0,
            };
            prop_assert_eq!(parse_size(&format!("{n}{suffix}")).expect("size"), n << shift);
        }
    }
}
