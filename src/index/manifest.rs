//! The `segments_N` manifest wire format.
//!
//! A manifest lists every live segment by name together with its codec name
//! and deletion state, framed by a codec header and a trailing checksum. All
//! other per-segment attributes live in `<name>.si` sidecars written by the
//! per-segment codec when the segment is flushed; the manifest does not
//! re-carry them.
//!
//! ```text
//! magic               i32    CODEC_MAGIC
//! codec name          string "segments"
//! format version      i32    VERSION_CURRENT
//! commit version      i64
//! counter             i32
//! num_segments        i32
//! per segment:
//!   name              string
//!   codec name        string
//!   del_gen           i64
//!   del_count         i32
//! user_data           map<string,string>
//! checksum            i64    covers everything above
//! ```
//!
//! A file whose first i32 is not the codec magic is a legacy manifest: its
//! format tag selects the legacy reader, which parses inline segment records
//! and stamps every descriptor with the legacy codec.

use std::sync::Arc;

use log::warn;

use crate::error::{FalxError, Result};
use crate::index::codec::{
    check_header_no_magic, read_legacy_record, write_header, CodecRegistry, CODEC_MAGIC,
    LEGACY_CODEC,
};
use crate::index::generation::{generation_from_segments_file_name, FinderConfig, GenerationFinder};
use crate::index::segment_set::SegmentSet;
use crate::storage::{ChecksumInput, ChecksumOutput, Storage};

/// Codec name in the manifest header.
pub const SEGMENTS_CODEC: &str = "segments";

/// Current manifest format version.
pub const VERSION_CURRENT: i32 = 0;

/// Format tag of the supported legacy manifest layout. Older or newer
/// legacy tags are rejected.
pub const FORMAT_3X: i32 = -11;

/// A manifest written up to, but not including, its valid checksum.
///
/// Held by the commit engine between `prepare` and `finish`/`rollback`.
#[derive(Debug)]
pub(crate) struct PendingManifest {
    pub(crate) file_name: String,
    pub(crate) output: ChecksumOutput,
}

/// Serializer/deserializer between a [`SegmentSet`] and `segments_N` files.
#[derive(Debug)]
pub struct ManifestCodec<'a> {
    registry: &'a CodecRegistry,
}

impl<'a> ManifestCodec<'a> {
    /// Create a codec dispatching per-segment reads through a registry.
    pub fn new(registry: &'a CodecRegistry) -> Self {
        ManifestCodec { registry }
    }

    /// Read a particular manifest file into `set`, replacing its contents.
    ///
    /// On any failure the set is left cleared, so a retrying caller starts
    /// from a clean slate.
    pub fn read(
        &self,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
        segment_file_name: &str,
    ) -> Result<()> {
        set.clear();

        let generation = generation_from_segments_file_name(segment_file_name)?;
        set.set_generation(generation);
        set.set_last_generation(generation);

        let result = self.read_inner(set, dir, segment_file_name);
        if result.is_err() {
            set.clear();
        }
        result
    }

    fn read_inner(
        &self,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
        segment_file_name: &str,
    ) -> Result<()> {
        let mut input = ChecksumInput::new(dir.open_input(segment_file_name)?)?;

        let format = input.read_i32()?;
        if format == CODEC_MAGIC {
            check_header_no_magic(&mut input, SEGMENTS_CODEC, VERSION_CURRENT, VERSION_CURRENT)?;
            self.read_current(set, dir, &mut input)?;
            set.set_format(VERSION_CURRENT);
        } else if format == FORMAT_3X {
            self.read_legacy(set, dir, &mut input)?;
            set.set_format(format);
        } else if format < FORMAT_3X {
            return Err(FalxError::format_too_new(format!(
                "manifest format {format}, this reader supports {FORMAT_3X} and newer"
            )));
        } else {
            return Err(FalxError::corrupt(format!(
                "unrecognized manifest format {format} in {segment_file_name}"
            )));
        }

        input.verify_checksum()
    }

    fn read_current(
        &self,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
        input: &mut ChecksumInput,
    ) -> Result<()> {
        let version = input.read_i64()?;
        let counter = input.read_i32()?;
        let num_segments = input.read_i32()?;
        if counter < 0 || num_segments < 0 {
            return Err(FalxError::corrupt(format!(
                "negative counter ({counter}) or segment count ({num_segments})"
            )));
        }

        for _ in 0..num_segments {
            let name = input.read_string()?;
            let codec_name = input.read_string()?;
            let codec = self.registry.lookup(&codec_name)?;

            let mut descriptor = codec.read_sidecar(dir, &name)?;
            descriptor.set_codec_name(&codec_name);
            descriptor.set_del_gen(input.read_i64()?);

            let del_count = input.read_i32()?;
            if del_count < 0 {
                return Err(FalxError::corrupt(format!(
                    "negative del_count {del_count} for segment {name}"
                )));
            }
            descriptor
                .set_del_count(del_count as u32)
                .map_err(|_| {
                    FalxError::corrupt(format!(
                        "del_count {del_count} exceeds doc_count for segment {name}"
                    ))
                })?;

            set.add(descriptor)?;
        }

        set.set_user_data(Some(input.read_string_map()?));
        set.set_version(version);
        set.set_counter(counter);
        Ok(())
    }

    fn read_legacy(
        &self,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
        input: &mut ChecksumInput,
    ) -> Result<()> {
        let version = input.read_i64()?;
        let counter = input.read_i32()?;
        let num_segments = input.read_i32()?;
        if counter < 0 || num_segments < 0 {
            return Err(FalxError::corrupt(format!(
                "negative counter ({counter}) or segment count ({num_segments})"
            )));
        }

        for _ in 0..num_segments {
            let descriptor = read_legacy_record(input, dir)?;
            set.add(descriptor)?;
        }

        set.set_user_data(Some(input.read_string_map()?));
        set.set_version(version);
        set.set_counter(counter);
        Ok(())
    }

    /// Discover the current manifest in a directory and read it.
    pub fn read_latest(&self, dir: &Arc<dyn Storage>, config: FinderConfig) -> Result<SegmentSet> {
        let finder = GenerationFinder::new(dir.as_ref(), config);
        finder.run(|segment_file_name| {
            let mut set = SegmentSet::new();
            self.read(&mut set, dir, segment_file_name)?;
            Ok(set)
        })
    }

    /// Write the next manifest generation, leaving the trailing checksum
    /// deliberately invalid.
    ///
    /// The set's generation is advanced as soon as the pending output
    /// exists, and it is never wound back: a rolled-back or failed attempt
    /// burns its file name so no `segments_N` is ever written twice.
    ///
    /// Any legacy descriptor whose sidecar is missing gets a legacy-layout
    /// sidecar written here, once. On failure every sidecar created by this
    /// attempt and the partial manifest are deleted before the error
    /// propagates.
    pub(crate) fn write(
        &self,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
    ) -> Result<PendingManifest> {
        let segment_file_name = set.next_segments_file_name();
        let next_generation = if set.generation() == -1 {
            1
        } else {
            set.generation() + 1
        };

        let raw_output = dir.create_output(&segment_file_name)?;
        set.set_generation(next_generation);

        let mut output = ChecksumOutput::new(raw_output);
        let mut upgraded_sidecars: Vec<String> = Vec::new();

        let result = self.write_inner(set, dir, &mut output, &mut upgraded_sidecars);
        match result {
            Ok(()) => Ok(PendingManifest {
                file_name: segment_file_name,
                output,
            }),
            Err(err) => {
                if let Err(close_err) = output.close() {
                    warn!("suppressed close error on partial manifest: {close_err}");
                }
                for sidecar in &upgraded_sidecars {
                    if let Err(del_err) = dir.delete_file(sidecar) {
                        warn!("suppressed delete error on upgraded sidecar {sidecar}: {del_err}");
                    }
                }
                if let Err(del_err) = dir.delete_file(&segment_file_name) {
                    warn!(
                        "suppressed delete error on partial manifest {segment_file_name}: \
                         {del_err}"
                    );
                }
                Err(err)
            }
        }
    }

    fn write_inner(
        &self,
        set: &SegmentSet,
        dir: &Arc<dyn Storage>,
        output: &mut ChecksumOutput,
        upgraded_sidecars: &mut Vec<String>,
    ) -> Result<()> {
        write_header(output, SEGMENTS_CODEC, VERSION_CURRENT)?;
        output.write_i64(set.version())?;
        output.write_i32(set.counter())?;
        output.write_i32(set.len() as i32)?;

        for descriptor in set.iter() {
            if !descriptor.is_in_dir(dir) {
                return Err(FalxError::illegal_state(format!(
                    "segment {} belongs to a different directory",
                    descriptor.name()
                )));
            }

            output.write_string(descriptor.name())?;
            output.write_string(descriptor.codec_name())?;
            output.write_i64(descriptor.del_gen())?;
            output.write_i32(descriptor.del_count() as i32)?;

            // One-time upgrade: a pre-current segment with no sidecar on
            // disk gets one in the legacy layout before the manifest that
            // references it can become visible.
            if descriptor.is_legacy() && !dir.file_exists(&descriptor.sidecar_file_name()) {
                let legacy = self.registry.lookup(LEGACY_CODEC)?;
                upgraded_sidecars.push(legacy.write_sidecar(dir, descriptor)?);
            }
        }

        output.write_string_map(set.user_data())?;
        output.write_invalid_checksum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::codec::{CurrentCodec, SegmentCodec, CURRENT_CODEC};
    use crate::index::segment::SegmentDescriptor;
    use crate::storage::MemoryStorage;

    fn setup() -> (Arc<MemoryStorage>, Arc<dyn Storage>, CodecRegistry) {
        let mem = Arc::new(MemoryStorage::new());
        let dir: Arc<dyn Storage> = Arc::<MemoryStorage>::clone(&mem);
        (mem, dir, CodecRegistry::with_defaults())
    }

    fn add_current_segment(
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
        name: &str,
        docs: u32,
    ) {
        let descriptor = SegmentDescriptor::new(name, CURRENT_CODEC, docs, Arc::clone(dir));
        CurrentCodec.write_sidecar(dir, &descriptor).unwrap();
        set.add(descriptor).unwrap();
    }

    fn write_and_finish(
        codec: &ManifestCodec<'_>,
        set: &mut SegmentSet,
        dir: &Arc<dyn Storage>,
    ) -> String {
        let mut pending = codec.write(set, dir).unwrap();
        pending.output.finish_checksum().unwrap();
        pending.output.close().unwrap();
        pending.file_name
    }

    #[test]
    fn test_empty_set_roundtrip() {
        let (_mem, dir, registry) = setup();
        let codec = ManifestCodec::new(&registry);

        let mut set = SegmentSet::new();
        let file_name = write_and_finish(&codec, &mut set, &dir);
        assert_eq!(file_name, "segments_1");
        assert_eq!(set.generation(), 1);

        let mut read_back = SegmentSet::new();
        codec.read(&mut read_back, &dir, &file_name).unwrap();
        assert!(read_back.is_empty());
        assert_eq!(read_back.version(), 0);
        assert_eq!(read_back.generation(), 1);
        assert_eq!(read_back.last_generation(), 1);
        assert_eq!(read_back.format(), VERSION_CURRENT);
    }

    #[test]
    fn test_populated_roundtrip() {
        let (_mem, dir, registry) = setup();
        let codec = ManifestCodec::new(&registry);

        let mut set = SegmentSet::new();
        add_current_segment(&mut set, &dir, "_0", 100);
        add_current_segment(&mut set, &dir, "_1", 50);
        set.iter_mut().next().unwrap().set_del_gen(2);
        set.iter_mut().next().unwrap().set_del_count(7).unwrap();
        set.changed();
        let mut user_data = std::collections::HashMap::new();
        user_data.insert("commitTime".to_string(), "123".to_string());
        set.set_user_data(Some(user_data.clone()));

        let file_name = write_and_finish(&codec, &mut set, &dir);

        let mut read_back = SegmentSet::new();
        codec.read(&mut read_back, &dir, &file_name).unwrap();

        assert_eq!(read_back.len(), 2);
        assert_eq!(read_back.version(), 1);
        assert_eq!(read_back.user_data(), &user_data);

        let s0 = read_back.get(0);
        assert_eq!(s0.name(), "_0");
        assert_eq!(s0.doc_count(), 100);
        assert_eq!(s0.del_gen(), 2);
        assert_eq!(s0.del_count(), 7);

        let s1 = read_back.get(1);
        assert_eq!(s1.name(), "_1");
        assert_eq!(s1.del_gen(), -1);
        assert_eq!(s1.del_count(), 0);
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let (mem, dir, registry) = setup();
        let codec = ManifestCodec::new(&registry);

        let mut set = SegmentSet::new();
        add_current_segment(&mut set, &dir, "_0", 10);
        let file_name = write_and_finish(&codec, &mut set, &dir);

        let mut raw = mem.get_raw(&file_name).unwrap();
        let mid = raw.len() / 2;
        raw[mid] ^= 0x01;
        mem.put_raw(&file_name, raw);

        let mut read_back = SegmentSet::new();
        let err = codec.read(&mut read_back, &dir, &file_name);
        assert!(matches!(err, Err(FalxError::CorruptManifest(_))));
        // The failed read leaves a clean slate.
        assert!(read_back.is_empty());
    }

    #[test]
    fn test_newer_legacy_tag_is_format_too_new() {
        let (mem, dir, registry) = setup();
        let codec = ManifestCodec::new(&registry);

        // A manifest whose format tag is one smaller than the supported
        // legacy tag comes from a newer writer.
        let raw = (FORMAT_3X - 1).to_be_bytes().to_vec();
        mem.put_raw("segments_5", raw);

        let mut set = SegmentSet::new();
        match codec.read(&mut set, &dir, "segments_5") {
            Err(FalxError::FormatTooNew(_)) => {}
            other => panic!("expected FormatTooNew, got {other:?}"),
        }
    }

    #[test]
    fn test_generation_burned_on_failed_write() {
        let (_mem, dir, registry) = setup();
        let codec = ManifestCodec::new(&registry);

        let mut set = SegmentSet::new();
        // A descriptor bound to some other directory makes the write fail
        // partway through.
        let foreign: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let descriptor = SegmentDescriptor::new("_0", CURRENT_CODEC, 10, foreign);
        set.add(descriptor).unwrap();

        let err = codec.write(&mut set, &dir);
        assert!(matches!(err, Err(FalxError::IllegalState(_))));
        // The attempt consumed generation 1 and deleted its partial file.
        assert_eq!(set.generation(), 1);
        assert!(!dir.file_exists("segments_1"));

        // The next attempt must not reuse the burned name.
        assert_eq!(set.next_segments_file_name(), "segments_2");
    }
}
