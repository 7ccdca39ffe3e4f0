//! Per-segment codecs and the codec registration table.
//!
//! The manifest stores only four fields per segment; everything else lives
//! in a `<name>.si` sidecar owned by the segment's codec. Codecs are looked
//! up by the name recorded in the manifest through a registration table
//! populated at startup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FalxError, Result};
use crate::index::segment::{DocStore, SegmentDescriptor};
use crate::storage::{ChecksumInput, ChecksumOutput, Storage};

/// Magic preamble of every header-framed index file.
pub const CODEC_MAGIC: i32 = 0x3fd7_6c17;

/// Name of the current per-segment codec.
pub const CURRENT_CODEC: &str = "falx1";

/// Name of the legacy per-segment codec used for upgraded 3.x segments.
pub const LEGACY_CODEC: &str = "legacy3x";

/// Codec name inside current-format sidecar headers.
const SIDECAR_CODEC_NAME: &str = "segmentinfo";

/// Sidecar format version range supported by this reader.
const SIDECAR_VERSION: i32 = 0;

/// Write a codec header: magic, codec name, format version.
pub fn write_header(output: &mut ChecksumOutput, codec: &str, version: i32) -> Result<()> {
    output.write_i32(CODEC_MAGIC)?;
    output.write_string(codec)?;
    output.write_i32(version)
}

/// Validate a codec header after the magic has already been consumed.
///
/// The version must fall in `[min_version, max_version]`; newer fails with
/// [`FalxError::FormatTooNew`], anything else with
/// [`FalxError::CorruptManifest`].
pub fn check_header_no_magic(
    input: &mut ChecksumInput,
    codec: &str,
    min_version: i32,
    max_version: i32,
) -> Result<i32> {
    let actual_codec = input.read_string()?;
    if actual_codec != codec {
        return Err(FalxError::corrupt(format!(
            "codec mismatch: expected \"{codec}\", found \"{actual_codec}\""
        )));
    }
    let version = input.read_i32()?;
    if version > max_version {
        return Err(FalxError::format_too_new(format!(
            "{codec} version {version}, this reader supports at most {max_version}"
        )));
    }
    if version < min_version {
        return Err(FalxError::corrupt(format!(
            "{codec} version {version} is older than the supported minimum {min_version}"
        )));
    }
    Ok(version)
}

/// Validate a full codec header including the magic.
pub fn check_header(
    input: &mut ChecksumInput,
    codec: &str,
    min_version: i32,
    max_version: i32,
) -> Result<i32> {
    let magic = input.read_i32()?;
    if magic != CODEC_MAGIC {
        return Err(FalxError::corrupt(format!(
            "codec magic mismatch: {magic:#x} != {CODEC_MAGIC:#x}"
        )));
    }
    check_header_no_magic(input, codec, min_version, max_version)
}

/// Reader/writer of one segment's metadata sidecar.
pub trait SegmentCodec: Send + Sync + std::fmt::Debug {
    /// Registered codec name, recorded per segment in the manifest.
    fn name(&self) -> &str;

    /// Read the `<seg_name>.si` sidecar into a descriptor.
    ///
    /// Deletion fields are owned by the manifest and come back zeroed.
    fn read_sidecar(
        &self,
        dir: &Arc<dyn Storage>,
        seg_name: &str,
    ) -> Result<SegmentDescriptor>;

    /// Write a descriptor's `<name>.si` sidecar, returning the file name.
    fn write_sidecar(&self, dir: &Arc<dyn Storage>, descriptor: &SegmentDescriptor)
        -> Result<String>;
}

/// The current sidecar codec: header-framed, checksummed.
#[derive(Debug, Default)]
pub struct CurrentCodec;

impl SegmentCodec for CurrentCodec {
    fn name(&self) -> &str {
        CURRENT_CODEC
    }

    fn read_sidecar(
        &self,
        dir: &Arc<dyn Storage>,
        seg_name: &str,
    ) -> Result<SegmentDescriptor> {
        let file_name = format!("{seg_name}.si");
        let mut input = ChecksumInput::new(dir.open_input(&file_name)?)?;

        check_header(&mut input, SIDECAR_CODEC_NAME, SIDECAR_VERSION, SIDECAR_VERSION)?;

        let name = input.read_string()?;
        if name != seg_name {
            return Err(FalxError::corrupt(format!(
                "sidecar {file_name} names segment \"{name}\""
            )));
        }
        let version = input.read_string()?;
        let doc_count = input.read_u32()?;
        let is_compound_file = input.read_u8()? != 0;
        let has_prox = input.read_u8()? != 0;
        let has_vectors = input.read_u8()? != 0;
        let diagnostics = input.read_string_map()?;

        input.verify_checksum()?;

        let mut descriptor =
            SegmentDescriptor::new(name, CURRENT_CODEC, doc_count, Arc::clone(dir));
        descriptor.set_version(if version.is_empty() {
            None
        } else {
            Some(version)
        });
        descriptor.is_compound_file = is_compound_file;
        descriptor.has_prox = has_prox;
        descriptor.has_vectors = has_vectors;
        descriptor.diagnostics = diagnostics;
        Ok(descriptor)
    }

    fn write_sidecar(
        &self,
        dir: &Arc<dyn Storage>,
        descriptor: &SegmentDescriptor,
    ) -> Result<String> {
        let file_name = descriptor.sidecar_file_name();
        let mut output = ChecksumOutput::new(dir.create_output(&file_name)?);

        write_header(&mut output, SIDECAR_CODEC_NAME, SIDECAR_VERSION)?;
        output.write_string(descriptor.name())?;
        output.write_string(descriptor.version().unwrap_or(""))?;
        output.write_u32(descriptor.doc_count())?;
        output.write_u8(descriptor.is_compound_file as u8)?;
        output.write_u8(descriptor.has_prox as u8)?;
        output.write_u8(descriptor.has_vectors as u8)?;
        output.write_string_map(&descriptor.diagnostics)?;
        output.finish()?;

        Ok(file_name)
    }
}

/// The legacy sidecar codec.
///
/// Writes the fixed 3.x record used by the one-time upgrade pass. The layout
/// deliberately drops current-codec specifics; upgrading is lossy and legacy
/// descriptors are never round-tripped through the current sidecar format.
#[derive(Debug, Default)]
pub struct LegacyCodec;

impl SegmentCodec for LegacyCodec {
    fn name(&self) -> &str {
        LEGACY_CODEC
    }

    fn read_sidecar(
        &self,
        dir: &Arc<dyn Storage>,
        seg_name: &str,
    ) -> Result<SegmentDescriptor> {
        let file_name = format!("{seg_name}.si");
        let mut input = ChecksumInput::new(dir.open_input(&file_name)?)?;
        let descriptor = read_legacy_record(&mut input, dir)?;
        if descriptor.name() != seg_name {
            return Err(FalxError::corrupt(format!(
                "sidecar {file_name} names segment \"{}\"",
                descriptor.name()
            )));
        }
        Ok(descriptor)
    }

    fn write_sidecar(
        &self,
        dir: &Arc<dyn Storage>,
        descriptor: &SegmentDescriptor,
    ) -> Result<String> {
        let file_name = descriptor.sidecar_file_name();
        let mut output = ChecksumOutput::new(dir.create_output(&file_name)?);
        write_legacy_record(&mut output, descriptor)?;
        output.close()?;
        Ok(file_name)
    }
}

/// Write one legacy segment record, the shared body of legacy manifests and
/// legacy sidecars.
pub(crate) fn write_legacy_record(
    output: &mut ChecksumOutput,
    descriptor: &SegmentDescriptor,
) -> Result<()> {
    output.write_string(descriptor.version().unwrap_or(""))?;
    output.write_string(descriptor.name())?;
    output.write_u32(descriptor.doc_count())?;
    output.write_i64(descriptor.del_gen())?;

    let doc_store_offset = descriptor.doc_store.as_ref().map(|d| d.offset).unwrap_or(-1);
    output.write_i32(doc_store_offset)?;
    if doc_store_offset != -1 {
        let doc_store = descriptor
            .doc_store
            .as_ref()
            .ok_or_else(|| FalxError::illegal_state("doc-store offset without doc store"))?;
        output.write_string(&doc_store.segment)?;
        output.write_u8(doc_store.is_compound_file as u8)?;
    }

    // Pre-4.0 indexes record a single shared norms file.
    output.write_u8(1)?;

    match &descriptor.norm_gen {
        None => output.write_i32(-1)?,
        Some(gens) => {
            output.write_i32(gens.len() as i32)?;
            for gen in gens {
                output.write_i64(*gen)?;
            }
        }
    }

    output.write_u8(descriptor.is_compound_file as u8)?;
    output.write_i32(descriptor.del_count() as i32)?;
    output.write_u8(descriptor.has_prox as u8)?;
    output.write_string_map(&descriptor.diagnostics)?;
    output.write_u8(descriptor.has_vectors as u8)?;
    Ok(())
}

/// Read one legacy segment record.
pub(crate) fn read_legacy_record(
    input: &mut ChecksumInput,
    dir: &Arc<dyn Storage>,
) -> Result<SegmentDescriptor> {
    let version = input.read_string()?;
    let name = input.read_string()?;
    let doc_count = input.read_u32()?;
    let del_gen = input.read_i64()?;

    let doc_store_offset = input.read_i32()?;
    let doc_store = if doc_store_offset != -1 {
        let segment = input.read_string()?;
        let is_compound_file = input.read_u8()? != 0;
        Some(DocStore {
            offset: doc_store_offset,
            segment,
            is_compound_file,
        })
    } else {
        None
    };

    // Single-norms-file flag, unused since every 3.x writer set it.
    let _ = input.read_u8()?;

    let norm_gen_count = input.read_i32()?;
    let norm_gen = if norm_gen_count == -1 {
        None
    } else if norm_gen_count < 0 {
        return Err(FalxError::corrupt(format!(
            "negative norm generation count: {norm_gen_count}"
        )));
    } else {
        let mut gens = Vec::with_capacity(norm_gen_count as usize);
        for _ in 0..norm_gen_count {
            gens.push(input.read_i64()?);
        }
        Some(gens)
    };

    let is_compound_file = input.read_u8()? != 0;
    let del_count = input.read_i32()?;
    if del_count < 0 || del_count as u32 > doc_count {
        return Err(FalxError::corrupt(format!(
            "del_count {del_count} out of range for doc_count {doc_count} in segment {name}"
        )));
    }
    let has_prox = input.read_u8()? != 0;
    let diagnostics = input.read_string_map()?;
    let has_vectors = input.read_u8()? != 0;

    let mut descriptor = SegmentDescriptor::new(name, LEGACY_CODEC, doc_count, Arc::clone(dir));
    descriptor.set_version(if version.is_empty() {
        None
    } else {
        Some(version)
    });
    descriptor.set_del_gen(del_gen);
    descriptor.set_del_count(del_count as u32)?;
    descriptor.doc_store = doc_store;
    descriptor.norm_gen = norm_gen;
    descriptor.is_compound_file = is_compound_file;
    descriptor.has_prox = has_prox;
    descriptor.has_vectors = has_vectors;
    Ok(descriptor)
}

/// Registration table of per-segment codecs, keyed by name.
///
/// Populated once at startup; there is no dynamic discovery.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    codecs: RwLock<HashMap<String, Arc<dyn SegmentCodec>>>,
}

impl CodecRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        CodecRegistry {
            codecs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry with the built-in codecs registered.
    pub fn with_defaults() -> Self {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(CurrentCodec));
        registry.register(Arc::new(LegacyCodec));
        registry
    }

    /// Register a codec under its own name, replacing any previous entry.
    pub fn register(&self, codec: Arc<dyn SegmentCodec>) {
        self.codecs
            .write()
            .insert(codec.name().to_string(), codec);
    }

    /// Look up a codec by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn SegmentCodec>> {
        self.codecs.read().get(name).cloned().ok_or_else(|| {
            FalxError::illegal_state(format!("no codec registered under \"{name}\""))
        })
    }

    /// Names of all registered codecs, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.codecs.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn dir() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new())
    }

    #[test]
    fn test_registry_defaults() {
        let registry = CodecRegistry::with_defaults();
        assert_eq!(registry.registered_names(), vec!["falx1", "legacy3x"]);

        assert!(registry.lookup(CURRENT_CODEC).is_ok());
        assert!(registry.lookup(LEGACY_CODEC).is_ok());
        assert!(matches!(
            registry.lookup("nonexistent"),
            Err(FalxError::IllegalState(_))
        ));
    }

    #[test]
    fn test_current_sidecar_roundtrip() {
        let d = dir();
        let mut descriptor = SegmentDescriptor::new("_3", CURRENT_CODEC, 1234, Arc::clone(&d));
        descriptor
            .diagnostics
            .insert("os".to_string(), "linux".to_string());
        descriptor.is_compound_file = true;

        let codec = CurrentCodec;
        let file_name = codec.write_sidecar(&d, &descriptor).unwrap();
        assert_eq!(file_name, "_3.si");

        let read_back = codec.read_sidecar(&d, "_3").unwrap();
        assert_eq!(read_back.name(), "_3");
        assert_eq!(read_back.doc_count(), 1234);
        assert_eq!(read_back.version(), Some("4.0"));
        assert!(read_back.is_compound_file);
        assert_eq!(read_back.diagnostics.get("os").unwrap(), "linux");
        // Deletion fields belong to the manifest, not the sidecar.
        assert_eq!(read_back.del_gen(), -1);
        assert_eq!(read_back.del_count(), 0);
    }

    #[test]
    fn test_current_sidecar_detects_corruption() {
        let mem = Arc::new(MemoryStorage::new());
        let d: Arc<dyn Storage> = Arc::<MemoryStorage>::clone(&mem);
        let descriptor = SegmentDescriptor::new("_0", CURRENT_CODEC, 5, Arc::clone(&d));

        let codec = CurrentCodec;
        codec.write_sidecar(&d, &descriptor).unwrap();

        // Flip one payload byte past the header magic.
        let mut raw = mem.get_raw("_0.si").unwrap();
        raw[6] ^= 0x40;
        mem.put_raw("_0.si", raw);

        match codec.read_sidecar(&d, "_0") {
            Err(FalxError::CorruptManifest(_)) => {}
            other => panic!("expected CorruptManifest, got {other:?}"),
        }
    }

    #[test]
    fn test_legacy_sidecar_roundtrip() {
        let d = dir();
        let mut descriptor = SegmentDescriptor::new("_9", LEGACY_CODEC, 77, Arc::clone(&d));
        descriptor.set_version(Some("3.6".to_string()));
        descriptor.set_del_gen(4);
        descriptor.set_del_count(7).unwrap();
        descriptor.doc_store = Some(DocStore {
            offset: 100,
            segment: "_shared".to_string(),
            is_compound_file: true,
        });
        descriptor.norm_gen = Some(vec![2, 3]);
        descriptor
            .diagnostics
            .insert("source".to_string(), "merge".to_string());

        let codec = LegacyCodec;
        codec.write_sidecar(&d, &descriptor).unwrap();

        let read_back = codec.read_sidecar(&d, "_9").unwrap();
        assert_eq!(read_back.name(), "_9");
        assert_eq!(read_back.version(), Some("3.6"));
        assert!(read_back.is_legacy());
        assert_eq!(read_back.doc_count(), 77);
        assert_eq!(read_back.del_gen(), 4);
        assert_eq!(read_back.del_count(), 7);
        assert_eq!(read_back.doc_store, descriptor.doc_store);
        assert_eq!(read_back.norm_gen, Some(vec![2, 3]));
        assert_eq!(read_back.diagnostics.get("source").unwrap(), "merge");
        assert_eq!(read_back.codec_name(), LEGACY_CODEC);
    }
}
