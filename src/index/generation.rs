//! Generation arithmetic, manifest file naming, and reader-side discovery.
//!
//! Readers cannot trust any single source for "the current generation": the
//! directory listing and the `segments.gen` hint file may each be stale in
//! either direction, and a concurrent writer may delete the manifest between
//! the moment it is located and the moment it is opened. [`GenerationFinder`]
//! runs the retry loop that copes with all of that.

use std::cmp;

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{FalxError, Result};
use crate::storage::Storage;

/// Prefix of every manifest file name.
pub const SEGMENTS: &str = "segments";

/// Name of the advisory generation hint file.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Format tag of the `segments.gen` file. New formats are one smaller.
pub const FORMAT_SEGMENTS_GEN_CURRENT: i32 = -2;

/// Encode a non-negative integer in lower-case base-36.
pub fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize] as char);
        value /= 36;
    }
    out.reverse();
    out.into_iter().collect()
}

/// Parse a base-36 integer (either case accepted).
pub fn parse_base36(text: &str) -> Result<i64> {
    if text.is_empty() {
        return Err(FalxError::corrupt("empty base-36 number"));
    }
    let mut value: i64 = 0;
    for c in text.chars() {
        let digit = c
            .to_digit(36)
            .ok_or_else(|| FalxError::corrupt(format!("invalid base-36 digit '{c}' in {text}")))?;
        value = value
            .checked_mul(36)
            .and_then(|v| v.checked_add(digit as i64))
            .ok_or_else(|| FalxError::corrupt(format!("base-36 overflow in {text}")))?;
    }
    Ok(value)
}

/// Compute the manifest file name for a generation.
///
/// Returns `None` for generation -1 (no commit exists), the bare `segments`
/// name for generation 0, and `segments_<base36>` otherwise.
pub fn file_name_from_generation(generation: i64) -> Option<String> {
    match generation {
        -1 => None,
        0 => Some(SEGMENTS.to_string()),
        gen => Some(format!("{}_{}", SEGMENTS, to_base36(gen as u64))),
    }
}

/// Parse the generation off a manifest file name.
pub fn generation_from_segments_file_name(file_name: &str) -> Result<i64> {
    if file_name == SEGMENTS {
        return Ok(0);
    }
    if let Some(suffix) = file_name.strip_prefix(SEGMENTS) {
        if let Some(digits) = suffix.strip_prefix('_') {
            return parse_base36(digits);
        }
    }
    Err(FalxError::corrupt(format!(
        "file name \"{file_name}\" is not a segments file"
    )))
}

/// Highest committed generation among the given file names, or -1 when none
/// of them is a manifest.
pub fn last_commit_generation(files: &[String]) -> i64 {
    let mut max = -1;
    for file in files {
        if file.starts_with(SEGMENTS) && file != SEGMENTS_GEN {
            if let Ok(gen) = generation_from_segments_file_name(file) {
                if gen > max {
                    max = gen;
                }
            }
        }
    }
    max
}

/// Highest committed generation in a directory, or -1 when the directory is
/// missing or holds no manifest.
pub fn last_commit_generation_in(storage: &dyn Storage) -> Result<i64> {
    match storage.list_files() {
        Ok(files) => Ok(last_commit_generation(&files)),
        Err(FalxError::NoSuchDirectory(_)) => Ok(-1),
        Err(e) => Err(e),
    }
}

/// File name of the most recent committed manifest in a directory, if any.
pub fn last_commit_segments_file_name(storage: &dyn Storage) -> Result<Option<String>> {
    Ok(file_name_from_generation(last_commit_generation_in(
        storage,
    )?))
}

/// Configuration for [`GenerationFinder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinderConfig {
    /// How many generations to probe past the best known one once both the
    /// directory listing and the hint file look stale. Bounds the retry loop
    /// on a genuinely broken index.
    pub lookahead_count: usize,
}

impl Default for FinderConfig {
    fn default() -> Self {
        FinderConfig { lookahead_count: 10 }
    }
}

/// A caller-supplied reference to one specific commit, bypassing discovery.
#[derive(Debug, Clone)]
pub struct CommitAnchor {
    /// Name of the manifest file of the anchored commit.
    pub segments_file: String,
}

/// Locates the current manifest and runs caller code against it, retrying
/// through stale caches and concurrent commits.
///
/// Lock-less commits mean that between locating the current manifest and
/// opening it, a writer may finish a commit and delete it. The caller's body
/// must fail on any I/O or corruption problem; the finder treats such
/// failures as "possibly stale, try again" and only re-raises the first one
/// once every strategy is exhausted.
#[derive(Debug)]
pub struct GenerationFinder<'a> {
    storage: &'a dyn Storage,
    config: FinderConfig,
}

impl<'a> GenerationFinder<'a> {
    /// Create a finder over a directory.
    pub fn new(storage: &'a dyn Storage, config: FinderConfig) -> Self {
        GenerationFinder { storage, config }
    }

    /// Run `body` against the current manifest.
    pub fn run<T>(&self, body: impl FnMut(&str) -> Result<T>) -> Result<T> {
        self.run_with_anchor(None, body)
    }

    /// Run `body` against a specific commit when an anchor is given,
    /// otherwise against the discovered current manifest.
    pub fn run_with_anchor<T>(
        &self,
        anchor: Option<&CommitAnchor>,
        mut body: impl FnMut(&str) -> Result<T>,
    ) -> Result<T> {
        if let Some(anchor) = anchor {
            return body(&anchor.segments_file);
        }

        let mut gen: i64 = 0;
        let mut last_gen: i64 = -1;
        let mut listed_gen: i64 = -1;
        let mut retry_count = 0;
        let mut lookahead_count = 0;
        let mut use_first_method = true;
        let mut saved_exc: Option<FalxError> = None;

        // Three strategies for locating the current generation: directory
        // listing (A) and the segments.gen hint (B) run together until they
        // stop making progress, then look-ahead (C) takes over.
        loop {
            if use_first_method {
                let files = self.storage.list_files()?;
                let gen_a = last_commit_generation(&files);
                debug!("directory listing gen_a={gen_a}");
                listed_gen = gen_a;

                let gen_b = self.read_segments_gen()?;
                debug!("{SEGMENTS_GEN} check: gen_b={gen_b}");

                gen = cmp::max(gen_a, gen_b);
                if gen == -1 {
                    return Err(FalxError::index_not_found(format!(
                        "no segments* file found; files: {files:?}"
                    )));
                }
            }

            if use_first_method && last_gen == gen && retry_count >= 2 {
                // Third cycle of listing the directory and checking the hint
                // file without progress; both caches must be stale.
                use_first_method = false;
            }

            if !use_first_method {
                if lookahead_count < self.config.lookahead_count {
                    gen += 1;
                    lookahead_count += 1;
                    debug!("look ahead: increment gen to {gen}");
                } else {
                    return Err(saved_exc.unwrap_or_else(|| {
                        FalxError::index_not_found("look-ahead exhausted without an error to re-raise")
                    }));
                }
            } else if last_gen == gen {
                // About to retry the same segments_N as last time.
                retry_count += 1;
            } else {
                // Progress was made; the original error was stale caching,
                // not corruption.
                retry_count = 0;
            }

            last_gen = gen;

            let segment_file_name = match file_name_from_generation(gen) {
                Some(name) => name,
                None => {
                    return Err(FalxError::illegal_state(format!(
                        "cannot compute a file name for generation {gen}"
                    )))
                }
            };

            match body(&segment_file_name) {
                Ok(value) => {
                    debug!("success on {segment_file_name}");
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    debug!(
                        "exception on '{segment_file_name}': {err}; will retry: \
                         retry_count={retry_count} gen={gen}"
                    );

                    if saved_exc.is_none() {
                        saved_exc = Some(err);
                    }

                    if gen > 1 && use_first_method && retry_count == 1 {
                        // Second failure at this same generation, and a
                        // prior generation may still exist: try one. When
                        // the hint file led the listing here, the listing's
                        // own best generation is the candidate below.
                        let prev_gen = [gen - 1, listed_gen].into_iter().find(|&candidate| {
                            candidate >= 1
                                && candidate < gen
                                && file_name_from_generation(candidate)
                                    .map(|name| self.storage.file_exists(&name))
                                    .unwrap_or(false)
                        });
                        if let Some(prev_name) = prev_gen.and_then(file_name_from_generation) {
                            debug!("fallback to prior segment file '{prev_name}'");
                            match body(&prev_name) {
                                Ok(value) => {
                                    debug!("success on fallback {prev_name}");
                                    return Ok(value);
                                }
                                Err(err2) if err2.is_retryable() => {
                                    debug!(
                                        "secondary exception on '{prev_name}': {err2}; \
                                         will retry"
                                    );
                                }
                                Err(err2) => return Err(err2),
                            }
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Read the generation recorded in `segments.gen`.
    ///
    /// Returns -1 when the file is absent, unreadable, or torn (the two
    /// recorded generations disagree). A format tag other than the current
    /// one fails with [`FalxError::FormatTooNew`].
    fn read_segments_gen(&self) -> Result<i64> {
        let mut input = match self.storage.open_input(SEGMENTS_GEN) {
            Ok(input) => input,
            Err(e) => {
                debug!("{SEGMENTS_GEN} open: {e}");
                return Ok(-1);
            }
        };

        let parsed: std::io::Result<(i32, i64, i64)> = (|| {
            let version = input.read_i32::<BigEndian>()?;
            let gen0 = input.read_i64::<BigEndian>()?;
            let gen1 = input.read_i64::<BigEndian>()?;
            Ok((version, gen0, gen1))
        })();

        match parsed {
            Ok((version, gen0, gen1)) => {
                if version != FORMAT_SEGMENTS_GEN_CURRENT {
                    return Err(FalxError::format_too_new(format!(
                        "{SEGMENTS_GEN} format {version}, expected {FORMAT_SEGMENTS_GEN_CURRENT}"
                    )));
                }
                debug!("fallback check: {gen0}; {gen1}");
                if gen0 == gen1 {
                    Ok(gen0)
                } else {
                    // Torn write; the file is advisory, ignore it.
                    Ok(-1)
                }
            }
            Err(e) => {
                debug!("{SEGMENTS_GEN} read: {e}");
                Ok(-1)
            }
        }
    }
}
