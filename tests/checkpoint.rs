// tests/checkpoint.rs
//
// Checkpoint через LogService напрямую (без Engine):
// - сценарий {5, 9, 12}: три подтверждённые страницы, checkpoint(crop=true) -
//   страницы лежат в своих слотах, файл обрезан сразу за областью данных;
// - цикл: дом A занят B, дом B занят A - ровно один CopyToTempFile;
// - детерминизм плана.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use FolioDB::consts::{slot_offset, PAGE_HEADER_SIZE, PAGE_SIZE};
use FolioDB::{
    CheckpointAction, CheckpointActions, Disk, LogPageHeader, LogService, MemoryCache,
    MemoryDisk, MemoryFactory, PageBuffer, PageHeader, PageType,
};

fn log_over(data_pages: u32) -> Result<(MemoryDisk, Arc<MemoryFactory>, LogService)> {
    let disk = MemoryDisk::new();
    disk.create_new()?;
    disk.set_length(slot_offset(data_pages + 1))?;
    let factory = Arc::new(MemoryFactory::new(32));
    let log = LogService::new(Arc::new(disk.clone()), factory.clone());
    log.initialize()?;
    Ok((disk, factory, log))
}

fn log_page(factory: &MemoryFactory, page_id: u32, txn: u32, confirmed: bool) -> Result<PageBuffer> {
    let mut p = factory.allocate_new_page();
    let mut h = PageHeader::new(page_id, PageType::Data, 1);
    h.transaction_id = txn;
    h.is_confirmed = confirmed;
    p.set_header(&h)?;
    p.body_mut()[..4].copy_from_slice(&page_id.to_le_bytes());
    p.body_mut()[4..].fill(page_id as u8);
    Ok(p)
}

fn slot(image: &[u8], position_id: u32) -> &[u8] {
    let start = slot_offset(position_id) as usize;
    &image[start..start + PAGE_SIZE]
}

#[test]
fn confirmed_pages_land_home_and_file_is_cropped() -> Result<()> {
    let (disk, factory, log) = log_over(3)?;
    let cache = MemoryCache::new(factory.clone(), 16);

    let mut pages = vec![
        log_page(&factory, 5, 1, false)?,
        log_page(&factory, 9, 1, false)?,
        log_page(&factory, 12, 1, true)?,
    ];
    log.write_log_pages(&mut pages)?;
    for p in &pages {
        assert!(p.position_id() > 3, "log must not overwrite the data region");
    }
    for p in pages {
        factory.deallocate_page(p);
    }

    let copied = log.checkpoint(true, false, &cache)?;
    assert_eq!(copied, 3);
    assert_eq!(log.last_page_id(), 12);
    assert_eq!(disk.get_length()?, 13 * PAGE_SIZE as u64);

    let image = disk.snapshot();
    for id in [5u32, 9, 12] {
        let mut page = factory.allocate_new_page();
        page.as_bytes_mut().copy_from_slice(slot(&image, id));
        assert!(page.verify_checksum(), "page {} CRC", id);
        let h = page.header()?;
        assert_eq!(h.page_id, id);
        assert_eq!(h.position_id, id);
        assert_eq!(h.transaction_id, 0);
        assert!(!h.is_confirmed);
        assert_eq!(&page.body()[..4], &id.to_le_bytes());
        assert!(page.body()[4..].iter().all(|b| *b == id as u8));
        factory.deallocate_page(page);
    }
    // nothing else in the data region
    for pos in [2u32, 3, 4, 6, 7, 8, 10, 11] {
        assert!(slot(&image, pos).iter().all(|b| *b == 0), "slot {} must be empty", pos);
    }
    Ok(())
}

#[test]
fn unconfirmed_transaction_never_reaches_data_region() -> Result<()> {
    let (disk, factory, log) = log_over(3)?;
    let cache = MemoryCache::new(factory.clone(), 16);

    let mut a = vec![log_page(&factory, 2, 1, true)?];
    let mut b = vec![log_page(&factory, 3, 2, false)?];
    log.write_log_pages(&mut a)?;
    log.write_log_pages(&mut b)?;
    for p in a.into_iter().chain(b) {
        factory.deallocate_page(p);
    }

    assert_eq!(log.checkpoint(true, false, &cache)?, 1);
    let image = disk.snapshot();
    assert_eq!(&slot(&image, 2)[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4], &2u32.to_le_bytes());
    assert!(slot(&image, 3).iter().all(|b| *b == 0));
    assert_eq!(disk.get_length()?, slot_offset(4));
    Ok(())
}

fn entry(position_id: u32, page_id: u32, txn: u32, confirmed: bool) -> LogPageHeader {
    LogPageHeader {
        position_id,
        recovery_position_id: position_id,
        page_id,
        transaction_id: txn,
        is_confirmed: confirmed,
    }
}

#[test]
fn swapped_homes_resolve_through_one_temp_copy() -> Result<()> {
    // page 11 sits in slot 10, page 10 sits in slot 11
    let log = vec![entry(10, 11, 1, false), entry(11, 10, 1, true)];
    let confirmed: HashSet<u32> = [1].into_iter().collect();
    let actions = CheckpointActions::new(&log, &confirmed, 11, 12).actions()?;

    let temps: Vec<_> = actions
        .iter()
        .filter(|a| matches!(a, CheckpointAction::CopyToTempFile { .. }))
        .collect();
    assert_eq!(temps.len(), 1);

    // replay the plan on a toy slot map and check the final placement
    let mut slots: std::collections::HashMap<u32, Option<u32>> =
        [(10, Some(11)), (11, Some(10))].into_iter().collect();
    for a in &actions {
        match *a {
            CheckpointAction::ClearPage { position_id } => {
                slots.insert(position_id, None);
            }
            CheckpointAction::CopyToTempFile {
                position_id,
                target_position_id,
            } => {
                let page = slots.get(&position_id).copied().flatten();
                slots.insert(target_position_id, page);
            }
            CheckpointAction::CopyToDataFile {
                position_id,
                target_position_id,
                ..
            } => {
                let page = slots.get(&position_id).copied().flatten();
                assert_eq!(page, Some(target_position_id));
                slots.insert(target_position_id, page);
            }
        }
    }
    assert_eq!(slots[&10], Some(10));
    assert_eq!(slots[&11], Some(11));
    Ok(())
}

#[test]
fn swapped_homes_on_disk() -> Result<()> {
    // data region 1..=3, log starts at 19: pages 19 and 20 are written at each other's homes
    let (disk, factory, log) = log_over(3)?;
    let cache = MemoryCache::new(factory.clone(), 16);
    assert_eq!(LogService::calc_init_log_position_id(3), 19);

    let mut pages = vec![log_page(&factory, 20, 1, false)?, log_page(&factory, 19, 1, true)?];
    log.write_log_pages(&mut pages)?;
    assert_eq!(pages[0].position_id(), 19);
    assert_eq!(pages[1].position_id(), 20);
    for p in pages {
        factory.deallocate_page(p);
    }

    assert_eq!(log.checkpoint(true, false, &cache)?, 2);
    assert_eq!(disk.get_length()?, slot_offset(21));
    let image = disk.snapshot();
    for id in [19u32, 20] {
        let s = slot(&image, id);
        assert_eq!(&s[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4], &id.to_le_bytes());
    }
    Ok(())
}

#[test]
fn plan_is_a_pure_function_of_its_inputs() -> Result<()> {
    let mut rng = oorandom::Rand32::new(0x5EED);
    let mut log = Vec::new();
    let mut confirmed = HashSet::new();
    let mut pos = 40u32;
    for txn in 1..=12u32 {
        let n = 1 + rng.rand_range(0..4);
        for i in 0..n {
            let page_id = 2 + rng.rand_range(0..60);
            let last = i + 1 == n;
            let confirm = last && txn % 3 != 0;
            log.push(entry(pos, page_id, txn, confirm));
            pos += 1;
        }
        if txn % 3 != 0 {
            confirmed.insert(txn);
        }
    }
    let last_page_id = log.iter().map(|e| e.page_id).max().unwrap_or(0).max(39);
    let start_temp = last_page_id.max(pos) + 1;

    let first = CheckpointActions::new(&log, &confirmed, last_page_id, start_temp).actions()?;
    let second = CheckpointActions::new(&log, &confirmed, last_page_id, start_temp).actions()?;
    assert_eq!(first, second);
    assert!(!first.is_empty());
    Ok(())
}

#[test]
fn soft_checkpoint_keeps_headroom_and_restarts_log() -> Result<()> {
    let (disk, factory, log) = log_over(3)?;
    let cache = MemoryCache::new(factory.clone(), 16);

    let mut pages = vec![log_page(&factory, 4, 9, true)?];
    log.write_log_pages(&mut pages)?;
    let written_at = pages[0].position_id();
    factory.deallocate_page(pages.pop().unwrap());
    let len_before = disk.get_length()?;

    assert_eq!(log.checkpoint(false, true, &cache)?, 1);
    assert_eq!(disk.get_length()?, len_before);
    assert!(slot(&disk.snapshot(), written_at).iter().all(|b| *b == 0));
    assert_eq!(log.log_page_count(), 0);
    assert_eq!(
        log.get_next_log_position_id(),
        LogService::calc_init_log_position_id(4)
    );
    // copied page went into the cache at its home
    assert!(cache.get_page_read_only(4).is_some());
    Ok(())
}
