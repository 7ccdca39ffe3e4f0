//! Integration tests for the two-phase commit protocol: crash windows,
//! rollback naming, and durability bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;

use falx::error::FalxError;
use falx::index::{
    CodecRegistry, CommitEngine, CurrentCodec, FinderConfig, ManifestCodec, SegmentCodec,
    SegmentDescriptor, SegmentSet, CURRENT_CODEC,
};
use falx::storage::{FileStorage, FileStorageConfig, MemoryStorage, Storage};
use tempfile::TempDir;

fn setup() -> (Arc<MemoryStorage>, Arc<dyn Storage>, CommitEngine) {
    let mem = Arc::new(MemoryStorage::new());
    let dir: Arc<dyn Storage> = Arc::<MemoryStorage>::clone(&mem);
    let engine = CommitEngine::new(Arc::clone(&dir), Arc::new(CodecRegistry::with_defaults()));
    (mem, dir, engine)
}

fn add_segment(set: &mut SegmentSet, dir: &Arc<dyn Storage>, name: &str, docs: u32) {
    let descriptor = SegmentDescriptor::new(name, CURRENT_CODEC, docs, Arc::clone(dir));
    CurrentCodec.write_sidecar(dir, &descriptor).unwrap();
    set.add(descriptor).unwrap();
}

fn read_latest(dir: &Arc<dyn Storage>) -> SegmentSet {
    let registry = CodecRegistry::with_defaults();
    ManifestCodec::new(&registry)
        .read_latest(dir, FinderConfig::default())
        .unwrap()
}

#[test]
fn test_two_empty_commits() {
    // Scenario: commit an empty set twice. Generations 1 and 2 appear, the
    // version stays 0 because changed() was never called.
    let (mem, dir, mut engine) = setup();
    let mut set = SegmentSet::new();

    engine.commit(&mut set).unwrap();
    assert!(dir.file_exists("segments_1"));
    assert_eq!(set.last_generation(), 1);
    assert_eq!(set.version(), 0);

    let first = mem.get_raw("segments_1").unwrap();

    engine.commit(&mut set).unwrap();
    assert!(dir.file_exists("segments_2"));
    assert_eq!(set.last_generation(), 2);
    assert_eq!(set.version(), 0);

    // Same payload, re-checksummed: with no changes the two manifests are
    // byte-identical (the checksum input is identical too).
    let second = mem.get_raw("segments_2").unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_crash_after_prepare_leaves_previous_generation_live() {
    // Crash window 1: the process dies after prepare. The partial
    // segments_2 exists with an invalid checksum and the hint file still
    // says 1; a fresh reader must come back with generation 1.
    let (_mem, dir, mut engine) = setup();
    let mut set = SegmentSet::new();
    add_segment(&mut set, &dir, "_0", 10);
    set.changed();
    engine.commit(&mut set).unwrap();

    add_segment(&mut set, &dir, "_1", 20);
    set.changed();
    engine.prepare(&mut set).unwrap();
    // Process crashes here: drop the engine with the commit still pending.
    drop(engine);

    assert!(dir.file_exists("segments_2"));
    let recovered = read_latest(&dir);
    assert_eq!(recovered.last_generation(), 1);
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered.get(0).name(), "_0");
}

#[test]
fn test_crash_before_hint_update_still_reads_new_generation() {
    // Crash window 2: the manifest is durable but segments.gen was never
    // refreshed. The directory listing carries the truth.
    let (mem, dir, mut engine) = setup();
    let mut set = SegmentSet::new();
    add_segment(&mut set, &dir, "_0", 10);
    set.changed();
    engine.commit(&mut set).unwrap();

    add_segment(&mut set, &dir, "_1", 20);
    set.changed();
    engine.commit(&mut set).unwrap();

    // Simulate the crash by restoring the stale hint from generation 1.
    let mut stale = Vec::new();
    stale.extend_from_slice(&(-2i32).to_be_bytes());
    stale.extend_from_slice(&1i64.to_be_bytes());
    stale.extend_from_slice(&1i64.to_be_bytes());
    mem.put_raw("segments.gen", stale);

    let recovered = read_latest(&dir);
    assert_eq!(recovered.last_generation(), 2);
    assert_eq!(recovered.len(), 2);
}

#[test]
fn test_rolled_back_names_never_reused() {
    // Crash window 3: two prepare/rollback cycles burn generations k+1 and
    // k+2; the following successful commit lands on k+3.
    let (_mem, dir, mut engine) = setup();
    let mut set = SegmentSet::new();
    add_segment(&mut set, &dir, "_0", 10);
    set.changed();
    engine.commit(&mut set).unwrap(); // generation 1

    for _ in 0..2 {
        engine.prepare(&mut set).unwrap();
        engine.rollback(&mut set).unwrap();
    }

    engine.commit(&mut set).unwrap();

    assert!(dir.file_exists("segments_1"));
    assert!(!dir.file_exists("segments_2"));
    assert!(!dir.file_exists("segments_3"));
    assert!(dir.file_exists("segments_4"));

    let recovered = read_latest(&dir);
    assert_eq!(recovered.last_generation(), 4);
}

#[test]
fn test_last_generation_tracks_only_successful_commits() {
    let (_mem, _dir, mut engine) = setup();
    let mut set = SegmentSet::new();

    assert_eq!(set.generation(), -1);
    assert_eq!(set.last_generation(), -1);

    engine.prepare(&mut set).unwrap();
    assert_eq!(set.generation(), 1);
    assert_eq!(set.last_generation(), -1);

    engine.finish(&mut set).unwrap();
    assert_eq!(set.generation(), 1);
    assert_eq!(set.last_generation(), 1);

    engine.prepare(&mut set).unwrap();
    engine.rollback(&mut set).unwrap();
    assert_eq!(set.generation(), 2);
    assert_eq!(set.last_generation(), 1);
}

#[test]
fn test_user_data_survives_commit() {
    let (_mem, dir, mut engine) = setup();
    let mut set = SegmentSet::new();
    let mut user_data = HashMap::new();
    user_data.insert("commitTime".to_string(), "1714060800".to_string());
    user_data.insert("source".to_string(), "nightly-build".to_string());
    set.set_user_data(Some(user_data.clone()));
    set.changed();
    engine.commit(&mut set).unwrap();

    let recovered = read_latest(&dir);
    assert_eq!(recovered.user_data(), &user_data);
}

#[test]
fn test_foreign_directory_segment_rejected() {
    let (_mem, dir, mut engine) = setup();
    let foreign: Arc<dyn Storage> = Arc::new(MemoryStorage::new());

    let mut set = SegmentSet::new();
    set.add(SegmentDescriptor::new("_0", CURRENT_CODEC, 10, foreign))
        .unwrap();
    set.changed();

    match engine.commit(&mut set) {
        Err(FalxError::IllegalState(_)) => {}
        other => panic!("expected IllegalState, got {other:?}"),
    }
    // The failed attempt burned its generation and left no file behind.
    assert!(!dir.file_exists("segments_1"));
    assert_eq!(set.generation(), 1);
}

#[test]
fn test_commit_and_recover_on_disk() {
    // The same protocol against the real filesystem.
    let temp_dir = TempDir::new().unwrap();
    let dir: Arc<dyn Storage> = Arc::new(
        FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap(),
    );
    let mut engine =
        CommitEngine::new(Arc::clone(&dir), Arc::new(CodecRegistry::with_defaults()));

    let mut set = SegmentSet::new();
    add_segment(&mut set, &dir, "_0", 128);
    add_segment(&mut set, &dir, "_1", 64);
    set.changed();
    engine.commit(&mut set).unwrap();

    add_segment(&mut set, &dir, "_2", 32);
    set.changed();
    engine.commit(&mut set).unwrap();

    // A fresh storage handle over the same directory sees the last commit.
    let reopened: Arc<dyn Storage> = Arc::new(
        FileStorage::new(temp_dir.path(), FileStorageConfig::default()).unwrap(),
    );
    let registry = CodecRegistry::with_defaults();
    let recovered = ManifestCodec::new(&registry)
        .read_latest(&reopened, FinderConfig::default())
        .unwrap();

    assert_eq!(recovered.last_generation(), 2);
    assert_eq!(recovered.len(), 3);
    assert_eq!(recovered.total_doc_count(), 224);
}
