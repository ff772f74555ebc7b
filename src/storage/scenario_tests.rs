//! End-to-end scenarios for the block store
//!
//! These run the public engine surface against every backing buffer kind.

#[cfg(test)]
mod scenarios {
    use crate::error::Result;
    use crate::storage::{BlockStore, StorageKind, StoredBytes};
    use crate::EngineConfig;
    use std::io::Read;

    const KINDS: [StorageKind; 3] = [
        StorageKind::Heap,
        StorageKind::OffHeap,
        StorageKind::MappedFile,
    ];

    fn open(kind: StorageKind, block_size: usize, blocks: usize) -> Result<(BlockStore, tempfile::TempDir)> {
        let dir = tempfile::tempdir()?;
        let store = BlockStore::open(
            EngineConfig::default()
                .with_block_size(block_size)
                .with_initial_block_count(blocks)
                .with_storage_kind(kind)
                .with_temp_dir(dir.path()),
        )?;
        Ok((store, dir))
    }

    #[test]
    fn test_grow_delete_and_reuse() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 256, 64)?;

            let item = store.allocate_with(&[b'A'; 2560])?;
            assert_eq!(item.block_count(), 10, "{}", kind);
            let start = item.block_start();

            item.set_bytes(&[b'B'; 5120])?;
            assert_eq!(item.block_count(), 20, "{}", kind);
            let bytes = item.get_bytes()?;
            assert_eq!(bytes.len(), 5120);
            assert!(bytes.iter().all(|&b| b == b'B'));

            item.delete()?;
            let reused = store.allocate(2560)?;
            assert_eq!(reused.block_start(), start, "{}", kind);
            assert_eq!(reused.block_count(), 10);
        }
        Ok(())
    }

    #[test]
    fn test_first_fit_fills_middle_gap() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 64, 64)?;
            let a = store.allocate(256)?;
            let b = store.allocate(256)?;
            let c = store.allocate(256)?;
            assert_eq!(
                (a.block_start(), b.block_start(), c.block_start()),
                (0, 4, 8)
            );

            b.delete()?;
            let d = store.allocate(256)?;
            assert_eq!(d.block_start(), 4, "{}", kind);
        }
        Ok(())
    }

    #[test]
    fn test_round_trip_across_grow_and_shrink() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 32, 8)?;
            let neighbour = store.allocate_with(b"neighbour")?;
            let item = store.allocate_with(&[1u8; 32])?;
            let _tail = store.allocate_with(b"tail")?;

            for blocks in [1usize, 20, 3, 7, 1] {
                let payload: Vec<u8> = (0..blocks * 32 - 5).map(|i| (i * 7 % 256) as u8).collect();
                item.set_bytes(&payload)?;
                assert_eq!(item.block_count(), blocks, "{}", kind);
                assert_eq!(item.get_bytes()?, payload, "{}", kind);
            }
            assert_eq!(neighbour.get_bytes()?, b"neighbour");
        }
        Ok(())
    }

    #[test]
    fn test_stream_isolated_from_relocating_set_bytes() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 16, 16)?;
            let item = store.allocate_with(b"stream opened here")?;
            let _wall = store.allocate_with(b"wall")?;

            let mut stream = item.open_input_stream()?;
            let mut first = [0u8; 6];
            stream.read_exact(&mut first)?;

            let before = item.block_start();
            item.set_bytes(&[b'#'; 200])?;
            assert_ne!(item.block_start(), before, "{}", kind);

            // Overwrite the old blocks too
            let _squatter = store.allocate_with(&[b'!'; 32])?;

            let mut rest = String::new();
            stream.read_to_string(&mut rest)?;
            assert_eq!(&first, b"stream");
            assert_eq!(rest, " opened here");
        }
        Ok(())
    }

    #[test]
    fn test_deletion_triggered_defrag_preserves_content() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 16, 40)?;
            let singles: Vec<StoredBytes> = (0..5u8)
                .map(|i| store.allocate_with(&[i; 16]))
                .collect::<Result<_>>()?;
            let items: Vec<StoredBytes> = (0..10u8)
                .map(|i| store.allocate_with(&[i + 100; 48]))
                .collect::<Result<_>>()?;

            // 30 of 40 blocks end up between a gap and free tail space
            for item in &singles {
                item.delete()?;
            }

            let stats = store.stats()?;
            assert_eq!(stats.defrag_runs, 1, "{}: {:?}", kind, stats);
            assert_eq!(stats.region_count, 1);
            assert_eq!(items[0].block_start(), 0);
            for (i, item) in items.iter().enumerate() {
                assert_eq!(item.get_bytes()?, vec![i as u8 + 100; 48], "{} item {}", kind, i);
            }
        }
        Ok(())
    }

    #[test]
    fn test_sparse_store_skips_deletion_defrag() -> Result<()> {
        for kind in KINDS {
            let (store, _dir) = open(kind, 16, 1024)?;
            let singles: Vec<StoredBytes> = (0..5u8)
                .map(|i| store.allocate_with(&[i; 16]))
                .collect::<Result<_>>()?;
            let big = store.allocate_with(&[0xB6; 320])?;

            for item in &singles {
                item.delete()?;
            }

            let stats = store.stats()?;
            assert_eq!(stats.capacity_blocks, 1024, "{}", kind);
            assert_eq!(stats.deletions, 5);
            assert_eq!(stats.defrag_runs, 0, "{}: {:?}", kind, stats);
            assert_eq!(big.block_start(), 5);
            assert_eq!(big.get_bytes()?, vec![0xB6; 320]);
        }
        Ok(())
    }

    #[test]
    fn test_used_blocks_match_live_handles() -> Result<()> {
        let (store, _dir) = open(StorageKind::Heap, 8, 16)?;
        let mut live: Vec<StoredBytes> = Vec::new();
        for round in 0..60usize {
            if round % 3 == 2 && !live.is_empty() {
                let victim = live.remove(round % live.len());
                victim.delete()?;
            } else {
                live.push(store.allocate_with(&vec![round as u8; 1 + round * 3 % 50])?);
            }
            if round % 7 == 0 {
                if let Some(item) = live.first() {
                    item.set_bytes(&vec![0xEE; round % 90])?;
                }
            }
            let sum: usize = live.iter().map(StoredBytes::block_count).sum();
            assert_eq!(store.used_blocks()?, sum, "round {}", round);
        }
        Ok(())
    }

    #[test]
    fn test_adjacent_handles_migrate_together() -> Result<()> {
        let (store, _dir) = open(StorageKind::OffHeap, 8, 32)?;
        let gap = store.allocate_with(&[0u8; 24])?;
        let left = store.allocate_with(b"left side")?;
        let right = store.allocate_with(b"right side!")?;
        gap.delete()?;

        // One run holding two handles moves as one migration
        assert_eq!(store.defragment()?, 1);
        assert_eq!(left.block_start(), 0);
        assert_eq!(right.block_start(), left.block_count());
        assert_eq!(left.get_bytes()?, b"left side");
        assert_eq!(right.get_bytes()?, b"right side!");
        Ok(())
    }

    #[test]
    fn test_close_releases_mapped_file() -> Result<()> {
        let (store, dir) = open(StorageKind::MappedFile, 64, 16)?;
        let item = store.allocate_with(b"on disk")?;
        let mut stream = item.open_input_stream()?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 1);

        store.close()?;
        assert_eq!(std::fs::read_dir(dir.path())?.count(), 0);

        // The stream took a copy on close
        let mut out = Vec::new();
        stream.read_to_end(&mut out)?;
        assert_eq!(out, b"on disk");
        Ok(())
    }
}
