//! Public engine surface across every backing buffer kind

use blockstore::error::{Error, Result};
use blockstore::storage::DiagOp;
use blockstore::{BlockStore, EngineConfig, StorageKind};
use std::io::{Read, Write};

const KINDS: [StorageKind; 3] = [
    StorageKind::Heap,
    StorageKind::OffHeap,
    StorageKind::MappedFile,
];

fn open(kind: StorageKind, dir: &tempfile::TempDir) -> Result<BlockStore> {
    BlockStore::open(
        EngineConfig::default()
            .with_block_size(64)
            .with_initial_block_count(32)
            .with_storage_kind(kind)
            .with_temp_dir(dir.path()),
    )
}

#[test]
fn test_store_lifecycle() -> Result<()> {
    for kind in KINDS {
        let dir = tempfile::tempdir()?;
        let store = open(kind, &dir)?;
        assert_eq!(store.block_size(), 64);
        assert_eq!(store.config().storage_kind, kind);

        let doc = store.allocate_with(b"{\"id\":1}")?;
        assert_eq!(doc.size(), 8);
        assert_eq!(&doc.read_buffer()?[..], b"{\"id\":1}");

        {
            let mut out = doc.open_output_stream();
            write!(out, "{{\"id\":1,\"name\":\"{}\"}}", "x".repeat(300))?;
            out.close()?;
        }
        assert_eq!(doc.size(), 318);
        assert_eq!(doc.block_count(), 5);

        let mut text = String::new();
        doc.open_input_stream()?.read_to_string(&mut text)?;
        assert!(text.starts_with("{\"id\":1,\"name\":\"xxx"));

        let stats = store.stats()?;
        assert_eq!(stats.storage_kind, kind);
        assert_eq!(stats.live_handles, 1);
        assert_eq!(stats.used_blocks, 5);

        store.close()?;
        assert!(matches!(doc.set_bytes(b"late"), Err(Error::Closed)));
    }
    Ok(())
}

#[test]
fn test_many_payloads_survive_churn() -> Result<()> {
    for kind in KINDS {
        let dir = tempfile::tempdir()?;
        let store = open(kind, &dir)?;

        let mut items = Vec::new();
        for i in 0..100usize {
            let value = format!("{{\"id\":{},\"name\":\"User {}\"}}", i, i).repeat(1 + i % 7);
            items.push((store.allocate_with(value.as_bytes())?, value));
        }

        // Drop every third payload, rewrite every fourth
        let mut kept = Vec::new();
        for (i, (item, value)) in items.into_iter().enumerate() {
            if i % 3 == 0 {
                item.delete()?;
                continue;
            }
            if i % 4 == 0 {
                let value = format!("updated {}", i).repeat(20);
                item.set_bytes(value.as_bytes())?;
                kept.push((item, value));
            } else {
                kept.push((item, value));
            }
        }

        store.compact()?;
        for (item, value) in &kept {
            assert_eq!(item.get_bytes()?, value.as_bytes(), "{}", kind);
        }
        let sum: usize = kept.iter().map(|(item, _)| item.block_count()).sum();
        assert_eq!(store.used_blocks()?, sum);
    }
    Ok(())
}

#[test]
fn test_config_file_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.toml");
    std::fs::write(
        &path,
        "block_size = 128\ninitial_block_count = 8\nstorage_kind = \"off_heap\"\n",
    )?;

    let config = EngineConfig::load(&path)?;
    let store = BlockStore::open(config)?;
    let item = store.allocate_with(&[9u8; 1000])?;
    assert_eq!(item.block_count(), 8);
    assert_eq!(store.stats()?.storage_kind, StorageKind::OffHeap);
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = BlockStore::open(EngineConfig::default().with_block_size(0));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_block_size_need_not_be_power_of_two() -> Result<()> {
    let store = BlockStore::new(100, 8, StorageKind::Heap)?;
    let item = store.allocate_with(&[3u8; 250])?;
    assert_eq!(item.block_count(), 3);

    let other = store.allocate_with(&[4u8; 100])?;
    assert_eq!(other.block_start(), 3);

    item.set_bytes(&[5u8; 450])?;
    assert_eq!(item.block_count(), 5);
    assert_eq!(item.get_bytes()?, vec![5u8; 450]);
    assert_eq!(other.get_bytes()?, vec![4u8; 100]);

    for kind in KINDS {
        let dir = tempfile::tempdir()?;
        let store = BlockStore::open(
            EngineConfig::default()
                .with_block_size(100)
                .with_initial_block_count(4)
                .with_storage_kind(kind)
                .with_temp_dir(dir.path()),
        )?;
        let item = store.allocate_with(&[7u8; 999])?;
        assert_eq!(item.block_count(), 10, "{}", kind);
        assert_eq!(item.get_bytes()?, vec![7u8; 999], "{}", kind);
    }
    Ok(())
}

#[test]
fn test_drop_closes_store_and_removes_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let item;
    {
        let store = open(StorageKind::MappedFile, &dir)?;
        item = store.allocate_with(b"outlives its store")?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);
    }
    assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);
    assert!(matches!(item.get_bytes(), Err(Error::Closed)));
    Ok(())
}

#[test]
fn test_diagnostics_ring_is_bounded() -> Result<()> {
    let store = BlockStore::open(EngineConfig::default().with_diagnostics_capacity(16))?;
    for i in 0..50usize {
        store.allocate_with(&vec![1u8; i + 1])?.delete()?;
    }
    let events = store.diagnostics();
    assert_eq!(events.len(), 16);
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(events.iter().any(|e| e.op == DiagOp::Deallocate));
    Ok(())
}

#[test]
fn test_metrics_exposition() -> Result<()> {
    let store = BlockStore::new(256, 16, StorageKind::Heap)?;
    let item = store.allocate_with(&[0u8; 1024])?;
    item.delete()?;

    let text = blockstore::metrics::export_metrics();
    assert!(text.contains("blockstore_allocations_total"));
    assert!(text.contains("blockstore_deletions_total"));
    assert!(text.contains("blockstore_blocks_capacity"));
    Ok(())
}
