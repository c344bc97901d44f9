//! Integration tests for the catalog engine.
//!
//! These exercise whole operations against a formatted volume: the hard-link
//! lifecycle, rename over existing entries, deferred deletes, failure windows
//! and recovery through the persistent store.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{FaultyStore, TestVolume};
use hfsj_catalog::link::LINK_ID_MASK;
use hfsj_catalog::{
    check_catalog, CatalogError, CatalogKey, CatalogRecord, CatalogStore, Cnid, FileKind,
    FsckConfig, HfsName, Journal, PersistentCatalogStore, Volume, VolumeConfig, VolumeParts,
};

#[test]
fn test_hard_link_lifecycle() {
    let t = TestVolume::new();
    let root = t.root();
    let base_records = t.records();

    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    assert_eq!(a.resolved_id, Cnid::new(2));
    assert_eq!(t.file_count(), 1);

    let b = t.volume.link(&mut a, root, "b").unwrap();
    assert_eq!(t.file_count(), 3);
    assert!(t.hidden_has("iNode1000"));
    assert_eq!(b.resolved_id, Cnid::new(2));
    assert_eq!(b.object.nlink(), 2);
    assert_eq!(t.names(root), vec!["a", "b"]);

    t.volume.unlink(root, "a").unwrap();
    assert_eq!(t.file_count(), 2);
    let b = t.volume.lookup(root, "b").unwrap();
    assert!(b.is_pointer());
    assert_eq!(b.resolved_id, Cnid::new(2));
    assert_eq!(b.object.nlink(), 1);

    t.volume.unlink(root, "b").unwrap();
    assert_eq!(t.file_count(), 0);
    assert!(!t.hidden_has("iNode1000"));
    assert!(t.names(root).is_empty());
    assert_eq!(t.records(), base_records);
    assert!(check_catalog(&t.volume, &FsckConfig::default()).unwrap().is_clean());
}

#[test]
fn test_link_unlink_conserves_counts() {
    let t = TestVolume::new();
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    t.volume.link(&mut a, root, "b").unwrap();
    let before = (t.file_count(), a.object.nlink(), t.records());

    t.volume.link(&mut a, root, "c").unwrap();
    t.volume.unlink(root, "c").unwrap();
    assert_eq!((t.file_count(), a.object.nlink(), t.records()), before);
}

#[test]
fn test_lookup_through_pointer_reaches_indirect_node() {
    let t = TestVolume::new();
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    t.volume.link(&mut a, root, "b").unwrap();

    let via_hidden = t.volume.lookup(t.hidden(), "iNode1000").unwrap();
    assert_eq!(via_hidden.resolved_id, a.resolved_id);
    assert!(!via_hidden.is_pointer());
    assert_eq!(via_hidden.object.link_id(), 1000);
}

#[test]
fn test_mkdir_under_hidden_dir_creates_nothing() {
    let t = TestVolume::new();
    let before = (t.records(), t.volume.stats());
    let hidden = t.volume.reserved().hidden_dir();
    assert!(t.volume.mkdir(hidden, "anything", 0o755).unwrap().is_none());
    assert_eq!((t.records(), t.volume.stats()), before);
}

#[test]
fn test_rename_over_existing_leaves_one_entry() {
    let t = TestVolume::new();
    let root = t.root();
    let d = t.volume.mkdir(root, "d", 0o755).unwrap().unwrap();
    let src = t.volume.create(root, "src", 0o644).unwrap();
    t.volume.create(d.resolved_id, "dst", 0o644).unwrap();

    t.volume.rename(root, "src", d.resolved_id, "dst").unwrap();
    assert_eq!(t.names(root), vec!["d"]);
    assert_eq!(t.names(d.resolved_id), vec!["dst"]);
    let dst = t.volume.lookup(d.resolved_id, "dst").unwrap();
    assert_eq!(dst.resolved_id, src.resolved_id);
    assert_eq!(t.file_count(), 1);
}

#[test]
fn test_rename_over_empty_directory() {
    let t = TestVolume::new();
    let root = t.root();
    let a = t.volume.mkdir(root, "a", 0o755).unwrap().unwrap();
    t.volume.create(a.resolved_id, "inside", 0o644).unwrap();
    t.volume.mkdir(root, "b", 0o755).unwrap();

    t.volume.rename(root, "a", root, "b").unwrap();
    assert_eq!(t.names(root), vec!["b"]);
    let b = t.volume.lookup(root, "b").unwrap();
    assert_eq!(b.resolved_id, a.resolved_id);
    assert_eq!(t.names(b.resolved_id), vec!["inside"]);
    assert_eq!(t.volume.stats().folder_count, 2);
}

#[test]
fn test_rmdir_not_empty_changes_nothing() {
    let t = TestVolume::new();
    let root = t.root();
    let d = t.volume.mkdir(root, "d", 0o755).unwrap().unwrap();
    t.volume.create(d.resolved_id, "f", 0o644).unwrap();
    let before = (t.records(), t.volume.stats(), t.journal.begun());

    match t.volume.rmdir(root, "d") {
        Err(CatalogError::NotEmpty(id)) => assert_eq!(id, d.resolved_id),
        other => panic!("expected NotEmpty, got {:?}", other),
    }
    assert_eq!((t.records(), t.volume.stats(), t.journal.begun()), before);
}

#[test]
fn test_deferred_delete_of_last_pointer() {
    let t = TestVolume::new();
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    t.volume.link(&mut a, root, "b").unwrap();
    let b = t.volume.lookup(root, "b").unwrap();
    let handle = t.volume.open(&b);

    t.volume.unlink(root, "a").unwrap();
    t.volume.unlink(root, "b").unwrap();
    assert!(b.object.is_dead());
    assert!(t.hidden_has("iNode1000"));
    assert_eq!(t.file_count(), 1);

    t.volume.release(handle).unwrap();
    assert!(!t.hidden_has("iNode1000"));
    assert!(b.object.is_deleted());
    assert_eq!(t.file_count(), 0);
}

#[test]
fn test_link_id_collision_retries() {
    let t = TestVolume::with_link_ids(vec![7, 7, 8], 9, VolumeConfig::default());
    let root = t.root();
    let mut f1 = t.volume.create(root, "f1", 0o644).unwrap();
    let mut f2 = t.volume.create(root, "f2", 0o644).unwrap();

    t.volume.link(&mut f1, root, "g1").unwrap();
    let g2 = t.volume.link(&mut f2, root, "g2").unwrap();
    assert!(t.hidden_has("iNode7"));
    assert!(t.hidden_has("iNode8"));
    assert_eq!(g2.link_id, 8);
    assert_eq!(f2.link_id, 8);
}

#[test]
fn test_link_id_is_masked() {
    let t = TestVolume::with_link_ids(vec![LINK_ID_MASK + 6], 9, VolumeConfig::default());
    let root = t.root();
    let mut f = t.volume.create(root, "f", 0o644).unwrap();
    let g = t.volume.link(&mut f, root, "g").unwrap();
    assert_eq!(g.link_id, 5);
    assert!(t.hidden_has("iNode5"));
}

#[test]
fn test_link_id_exhaustion_is_no_space() {
    let config = VolumeConfig {
        max_link_id_attempts: 3,
        ..VolumeConfig::default()
    };
    let t = TestVolume::with_link_ids(vec![], 7, config);
    let root = t.root();
    let mut f1 = t.volume.create(root, "f1", 0o644).unwrap();
    t.volume.link(&mut f1, root, "g1").unwrap();
    let mut f2 = t.volume.create(root, "f2", 0o644).unwrap();
    let before = (t.records(), t.file_count());

    match t.volume.link(&mut f2, root, "g2") {
        Err(CatalogError::NoSpace) => {}
        other => panic!("expected NoSpace, got {:?}", other),
    }
    assert_eq!((t.records(), t.file_count()), before);
    assert!(!f2.is_pointer());
    assert_eq!(f2.object.link_id(), 0);
    assert_eq!(t.journal.open_scopes(), 0);
}

#[test]
fn test_failed_promotion_is_undone() {
    let store = Arc::new(FaultyStore::new());
    let t = TestVolume::with_store(store.clone());
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();

    // First insert moves the record to iNode1000, the second adds the pointer.
    store.fail_insert(2);
    match t.volume.link(&mut a, root, "b") {
        Err(CatalogError::Storage(_)) => {}
        other => panic!("expected Storage, got {:?}", other),
    }
    assert!(!t.hidden_has("iNode1000"));
    assert_eq!(t.names(root), vec!["a"]);
    assert_eq!(a.object.link_id(), 0);
    assert!(!t.volume.lookup(root, "a").unwrap().is_pointer());
    assert_eq!(t.file_count(), 1);
    assert_eq!(t.journal.open_scopes(), 0);
}

#[test]
fn test_failed_destination_insert_undoes_promotion() {
    let store = Arc::new(FaultyStore::new());
    let t = TestVolume::with_store(store.clone());
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    let before = t.snapshot();

    // Inserts: iNode1000, the pointer under "a", then the pointer under "b".
    store.fail_insert(3);
    match t.volume.link(&mut a, root, "b") {
        Err(CatalogError::Storage(_)) => {}
        other => panic!("expected Storage, got {:?}", other),
    }
    assert!(!t.hidden_has("iNode1000"));
    assert_eq!(t.names(root), vec!["a"]);
    assert!(!a.is_pointer());
    assert_eq!(a.link_id, 0);
    assert_eq!(a.object.link_id(), 0);
    assert_eq!(t.file_count(), 1);
    assert_eq!(t.records(), before.len());
    assert_eq!(t.journal.open_scopes(), 0);

    let found = t.volume.lookup(root, "a").unwrap();
    assert!(!found.is_pointer());
    assert!(check_catalog(&t.volume, &FsckConfig::default()).unwrap().is_clean());

    let b = t.volume.link(&mut a, root, "b").unwrap();
    assert_eq!(b.object.nlink(), 2);
    assert_eq!(t.file_count(), 3);
}

#[test]
fn test_pointer_chain_is_not_followed() {
    let t = TestVolume::new();
    let root = t.root();
    let mut a = t.volume.create(root, "a", 0o644).unwrap();
    t.volume.link(&mut a, root, "b").unwrap();

    // Reuse b's pointer record: "p" points at iNode77, which is itself a
    // pointer to link id 88.
    let b_key = CatalogKey::new(root, HfsName::from_raw_str("b").unwrap());
    let template = match CatalogRecord::decode(&t.store.find(&b_key).unwrap().unwrap()).unwrap() {
        CatalogRecord::File(f) => f,
        other => panic!("expected a file record, got {:?}", other),
    };
    let mut outer = template.clone();
    outer.id = Cnid::new(900);
    outer.permissions.special = 77;
    let mut inner = template;
    inner.id = Cnid::new(901);
    inner.permissions.special = 88;
    let inner_key = CatalogKey::new(t.hidden(), HfsName::from_raw_str("iNode77").unwrap());
    t.store
        .insert(
            &CatalogKey::new(root, HfsName::from_raw_str("p").unwrap()),
            &CatalogRecord::File(outer).encode(),
        )
        .unwrap();
    t.store
        .insert(&inner_key, &CatalogRecord::File(inner).encode())
        .unwrap();
    let before = t.snapshot();

    let mut p = t.volume.lookup(root, "p").unwrap();
    assert_eq!(p.entry_id, Cnid::new(900));
    assert_eq!(p.resolved_id, Cnid::new(901));
    assert_eq!(p.link_id, 0);
    assert_eq!(p.object.link_id(), 0);
    assert_eq!(t.snapshot(), before);

    match t.volume.link(&mut p, root, "q") {
        Err(CatalogError::CorruptCatalog { .. }) => {}
        other => panic!("expected CorruptCatalog, got {:?}", other),
    }
    assert_eq!(t.snapshot(), before);
    match CatalogRecord::decode(&t.store.find(&inner_key).unwrap().unwrap()).unwrap() {
        CatalogRecord::File(f) => assert_eq!(f.link_id(), 88),
        other => panic!("expected a file record, got {:?}", other),
    }
    assert_eq!(t.journal.open_scopes(), 0);
}

#[test]
fn test_ignorable_only_names_are_rejected() {
    let t = TestVolume::new();
    let root = t.root();
    t.volume.create(root, "a", 0o644).unwrap();
    let before = t.snapshot();

    for name in ["\u{200C}", "\u{FEFF}", "\u{200D}\u{FEFF}"] {
        match t.volume.lookup(root, name) {
            Err(CatalogError::NotFound { .. }) => {}
            other => panic!("lookup {:?}: expected NotFound, got {:?}", name, other),
        }
        match t.volume.unlink(root, name) {
            Err(CatalogError::NotFound { .. }) => {}
            other => panic!("unlink {:?}: expected NotFound, got {:?}", name, other),
        }
        match t.volume.rmdir(root, name) {
            Err(CatalogError::NotFound { .. }) => {}
            other => panic!("rmdir {:?}: expected NotFound, got {:?}", name, other),
        }
        match t.volume.create(root, name, 0o644) {
            Err(CatalogError::InvalidName { .. }) => {}
            other => panic!("create {:?}: expected InvalidName, got {:?}", name, other),
        }
        match t.volume.mkdir(root, name, 0o755) {
            Err(CatalogError::InvalidName { .. }) => {}
            other => panic!("mkdir {:?}: expected InvalidName, got {:?}", name, other),
        }
        match t.volume.rename(root, "a", root, name) {
            Err(CatalogError::InvalidName { .. }) => {}
            other => panic!("rename to {:?}: expected InvalidName, got {:?}", name, other),
        }
    }
    assert_eq!(t.snapshot(), before);
    assert_eq!(t.names(root), vec!["a"]);
    assert_eq!(t.journal.open_scopes(), 0);
}

#[test]
fn test_rename_failure_does_not_resurrect_source() {
    let store = Arc::new(FaultyStore::new());
    let t = TestVolume::with_store(store.clone());
    let root = t.root();
    t.volume.create(root, "x", 0o644).unwrap();

    store.fail_insert(1);
    match t.volume.rename(root, "x", root, "y") {
        Err(CatalogError::Storage(_)) => {}
        other => panic!("expected Storage, got {:?}", other),
    }
    assert!(t.names(root).is_empty());
    assert_eq!(t.journal.open_scopes(), 0);
}

#[test]
fn test_every_operation_closes_its_scope() {
    let t = TestVolume::new();
    let root = t.root();
    let d = t.volume.mkdir(root, "d", 0o755).unwrap().unwrap();
    let mut f = t.volume.create(d.resolved_id, "f", 0o644).unwrap();
    t.volume.link(&mut f, root, "g").unwrap();
    t.volume.symlink(root, "s", b"d/f").unwrap();
    t.volume.rename(root, "s", d.resolved_id, "s2").unwrap();
    t.volume.unlink(root, "g").unwrap();
    let _ = t.volume.rmdir(root, "d");
    let _ = t.volume.unlink(root, "missing");

    assert_eq!(t.journal.begun(), t.journal.committed());
    assert_eq!(t.journal.open_scopes(), 0);
    let tags = t.journal.tags();
    for tag in ["format", "mkdir", "create", "link", "symlink", "rename", "unlink"] {
        assert!(tags.contains(&tag), "missing {} in {:?}", tag, tags);
    }
}

#[test]
fn test_enumeration_survives_interleaved_mutation() {
    let t = TestVolume::new();
    let root = t.root();
    for i in 0..10 {
        t.volume.create(root, &format!("f{:02}", i), 0o644).unwrap();
    }
    let mut session = t.volume.opendir(root).unwrap();
    let first: Vec<String> = t
        .volume
        .readdir(&mut session, 5)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(first, vec![".", "..", "f00", "f01", "f02"]);

    t.volume.unlink(root, "f01").unwrap();
    t.volume.create(root, "e", 0o644).unwrap();
    t.volume.create(root, "z", 0o644).unwrap();
    t.volume.unlink(root, "f05").unwrap();

    let rest: Vec<String> = t
        .volume
        .readdir(&mut session, 100)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(rest, vec!["f03", "f04", "f06", "f07", "f08", "f09", "z"]);
}

#[test]
fn test_concurrent_creates_and_enumeration() {
    let t = TestVolume::new();
    let root = t.root();
    let volume = &t.volume;

    std::thread::scope(|s| {
        for w in 0..4 {
            s.spawn(move || {
                for n in 0..50 {
                    volume.create(root, &format!("w{}-{:03}", w, n), 0o644).unwrap();
                }
            });
        }
        s.spawn(move || {
            for _ in 0..20 {
                let mut session = volume.opendir(root).unwrap();
                let entries = volume.readdir(&mut session, usize::MAX).unwrap();
                let mut seen = HashSet::new();
                for e in entries.iter().skip(2) {
                    assert!(seen.insert(e.name.clone()), "{} emitted twice", e.name);
                }
            }
        });
    });

    assert_eq!(t.names(root).len(), 200);
    assert_eq!(t.file_count(), 200);
    assert_eq!(volume.acquire(root).unwrap().valence(), 200);
}

#[test]
fn test_persistent_store_survives_remount() {
    let tmp = tempfile::tempdir().unwrap();
    let config = VolumeConfig::default();
    let open_parts = || {
        let store = Arc::new(PersistentCatalogStore::open(tmp.path()).unwrap());
        let catalog: Arc<dyn CatalogStore> = store.clone();
        let journal: Arc<dyn Journal> = store;
        VolumeParts::new(catalog, journal)
    };

    let (f_id, next_cnid) = {
        let volume = Volume::format(open_parts(), config.clone()).unwrap();
        let root = volume.root();
        let d = volume.mkdir(root, "d", 0o755).unwrap().unwrap();
        let mut f = volume.create(d.resolved_id, "f", 0o644).unwrap();
        volume.link(&mut f, root, "g").unwrap();
        (f.resolved_id, volume.stats().next_cnid)
    };

    let volume = Volume::mount(open_parts(), config).unwrap();
    let root = volume.root();
    let stats = volume.stats();
    assert_eq!(stats.file_count, 3);
    assert_eq!(stats.folder_count, 2);
    assert!(stats.next_cnid >= next_cnid);

    let g = volume.lookup(root, "g").unwrap();
    assert!(g.is_pointer());
    assert_eq!(g.resolved_id, f_id);
    assert_eq!(g.kind, FileKind::Regular);
    assert_eq!(g.object.nlink(), 2);

    let d = volume.lookup(root, "d").unwrap();
    volume.unlink(d.resolved_id, "f").unwrap();
    volume.unlink(root, "g").unwrap();
    assert_eq!(volume.stats().file_count, 0);
    assert!(check_catalog(&volume, &FsckConfig::default()).unwrap().is_clean());
}

#[test]
fn test_lookup_keeps_stored_case_across_remount() {
    let tmp = tempfile::tempdir().unwrap();
    let config = VolumeConfig::default();
    let open_parts = || {
        let store = Arc::new(PersistentCatalogStore::open(tmp.path()).unwrap());
        let catalog: Arc<dyn CatalogStore> = store.clone();
        let journal: Arc<dyn Journal> = store;
        VolumeParts::new(catalog, journal)
    };
    let listing = |volume: &Volume| -> Vec<String> {
        let mut session = volume.opendir(volume.root()).unwrap();
        let entries = volume.readdir(&mut session, usize::MAX).unwrap();
        entries.into_iter().skip(2).map(|e| e.name).collect()
    };

    {
        let volume = Volume::format(open_parts(), config.clone()).unwrap();
        volume.mkdir(volume.root(), "Docs", 0o755).unwrap().unwrap();
    }
    {
        let volume = Volume::mount(open_parts(), config.clone()).unwrap();
        let docs = volume.lookup(volume.root(), "DOCS").unwrap();
        assert_eq!(volume.decode_name(&docs.name).unwrap(), "Docs");
        volume.create(docs.resolved_id, "x", 0o644).unwrap();
        assert_eq!(listing(&volume), vec!["Docs"]);
    }

    let volume = Volume::mount(open_parts(), config).unwrap();
    assert_eq!(listing(&volume), vec!["Docs"]);
    let docs = volume.lookup(volume.root(), "docs").unwrap();
    assert_eq!(volume.acquire(docs.resolved_id).unwrap().valence(), 1);
}
