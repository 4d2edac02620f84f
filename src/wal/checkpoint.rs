//! wal/checkpoint - план слияния лога с файлом данных.
//!
//! Чистая функция: заголовки лог/temp-страниц + множество подтверждённых транзакций
//! → упорядоченный список физических действий. Один и тот же план исполняется
//! LogService (через кэш) и RecoveryService (только диск).
//!
//! Правила:
//! - версия страницы = слот лога, в который она была записана впервые
//!   (для temp-копии это RecoveryPositionID);
//! - authoritative = подтверждённая запись с наибольшей версией среди копий одного PageID;
//! - фаза копирования: authoritative-записи по возрастанию версии копируются домой.
//!   Перед записью в дом его текущий жилец переносится во temp-слот (CopyToTempFile),
//!   если он ещё нужен recovery: это непереписанная authoritative-запись, либо
//!   authoritative-запись, у которой в логе остались более старые подтверждённые
//!   версии, либо подтверждающая страница транзакции с такой записью;
//! - фаза очистки: все ClearPage идут после всех копий, по возрастанию версии.
//!   Обнуляются слоты лога внутри области данных (кроме целей копирования) и
//!   temp-копии, не ставшие authoritative.
//! - temp-слоты идут с `start_temp_position_id` по возрастанию, пропуская слоты карты.
//!
//! Падение между любыми двумя действиями оставляет на диске либо новейшую
//! подтверждённую версию каждой страницы вместе с её подтверждением, либо уже
//! переписанный дом без единой подтверждённой копии в логе.

use anyhow::Result;
use std::collections::{HashMap, HashSet};

use crate::consts::is_allocation_map_slot;
use crate::error::FolioError;
use crate::page::LogPageHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointAction {
    /// Zero the slot.
    ClearPage { position_id: u32 },
    /// Copy the page home. `must_clear`: the source lies inside the data region;
    /// its `ClearPage` follows once every copy has landed.
    CopyToDataFile {
        position_id: u32,
        target_position_id: u32,
        must_clear: bool,
    },
    /// Park the page at a temp slot so its current slot can be overwritten.
    CopyToTempFile {
        position_id: u32,
        target_position_id: u32,
    },
}

impl CheckpointAction {
    pub fn position_id(&self) -> u32 {
        match *self {
            CheckpointAction::ClearPage { position_id }
            | CheckpointAction::CopyToDataFile { position_id, .. }
            | CheckpointAction::CopyToTempFile { position_id, .. } => position_id,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    /// Current slot: the log slot, or a temp slot once parked.
    position_id: u32,
    version: u32,
    page_id: u32,
    transaction_id: u32,
    is_confirmed: bool,
    in_temp: bool,
    /// Another entry holds the same version (a temp copy of this log slot).
    shadow: bool,
    authoritative: bool,
    /// Overwritten by a copy home.
    gone: bool,
}

impl Entry {
    fn new(h: &LogPageHeader, in_temp: bool) -> Self {
        Self {
            position_id: h.position_id,
            version: if in_temp {
                h.recovery_position_id
            } else {
                h.position_id
            },
            page_id: h.page_id,
            transaction_id: h.transaction_id,
            is_confirmed: h.is_confirmed,
            in_temp,
            shadow: false,
            authoritative: false,
            gone: false,
        }
    }
}

/// What recovery would still need if the walk stopped right now.
struct Progress {
    copied: HashSet<u32>,
    /// Pages with an older confirmed version left in the log.
    superseded: HashSet<u32>,
    by_txn: HashMap<u32, Vec<u32>>,
}

impl Progress {
    fn unsettled(&self, page_id: u32) -> bool {
        !self.copied.contains(&page_id) || self.superseded.contains(&page_id)
    }

    fn keeps(&self, e: &Entry) -> bool {
        if e.shadow {
            return false;
        }
        if e.authoritative && self.unsettled(e.page_id) {
            return true;
        }
        e.is_confirmed
            && self
                .by_txn
                .get(&e.transaction_id)
                .map_or(false, |pages| pages.iter().any(|p| self.unsettled(*p)))
    }
}

pub struct CheckpointActions<'a> {
    log_pages: &'a [LogPageHeader],
    temp_pages: &'a [LogPageHeader],
    confirmed: &'a HashSet<u32>,
    last_page_id: u32,
    start_temp_position_id: u32,
}

impl<'a> CheckpointActions<'a> {
    /// `last_page_id` must already cover every PageID found in the log.
    pub fn new(
        log_pages: &'a [LogPageHeader],
        confirmed: &'a HashSet<u32>,
        last_page_id: u32,
        start_temp_position_id: u32,
    ) -> Self {
        Self {
            log_pages,
            temp_pages: &[],
            confirmed,
            last_page_id,
            start_temp_position_id,
        }
    }

    /// Pages already staged in a temp area by an interrupted checkpoint.
    pub fn with_temp_pages(mut self, temp_pages: &'a [LogPageHeader]) -> Self {
        self.temp_pages = temp_pages;
        self
    }

    fn is_candidate(&self, e: &Entry) -> bool {
        !e.shadow && (e.is_confirmed || self.confirmed.contains(&e.transaction_id))
    }

    pub fn actions(&self) -> Result<Vec<CheckpointAction>> {
        let mut entries: Vec<Entry> = self
            .log_pages
            .iter()
            .map(|h| Entry::new(h, false))
            .chain(self.temp_pages.iter().map(|h| Entry::new(h, true)))
            .collect();
        entries.sort_by_key(|e| e.position_id);

        for w in entries.windows(2) {
            if w[0].position_id == w[1].position_id {
                return Err(FolioError::Invariant(format!(
                    "position {} appears twice in the log",
                    w[0].position_id
                ))
                .into());
            }
        }
        for e in &entries {
            if e.page_id == 0 || is_allocation_map_slot(e.page_id) || e.page_id > self.last_page_id
            {
                return Err(FolioError::Invariant(format!(
                    "log page at {} has invalid home {} (last page {})",
                    e.position_id, e.page_id, self.last_page_id
                ))
                .into());
            }
        }

        // a parked version may still sit in its log slot as well; the temp copy wins
        let mut primary: HashMap<u32, usize> = HashMap::new();
        for (i, e) in entries.iter().enumerate() {
            let keep = match primary.get(&e.version) {
                Some(&j) => (e.in_temp, e.position_id) > (entries[j].in_temp, entries[j].position_id),
                None => true,
            };
            if keep {
                primary.insert(e.version, i);
            }
        }
        for (i, e) in entries.iter_mut().enumerate() {
            e.shadow = primary.get(&e.version) != Some(&i);
        }

        // newest confirmed version of every page wins
        let mut newest: HashMap<u32, u32> = HashMap::new();
        let mut superseded: HashSet<u32> = HashSet::new();
        for e in entries.iter().filter(|e| self.is_candidate(e)) {
            match newest.get_mut(&e.page_id) {
                Some(v) => {
                    superseded.insert(e.page_id);
                    if e.version > *v {
                        *v = e.version;
                    }
                }
                None => {
                    newest.insert(e.page_id, e.version);
                }
            }
        }
        for i in 0..entries.len() {
            let e = entries[i];
            entries[i].authoritative =
                self.is_candidate(&e) && newest.get(&e.page_id) == Some(&e.version);
        }

        let targets: HashSet<u32> = newest.keys().copied().collect();
        let mut progress = Progress {
            copied: HashSet::new(),
            superseded,
            by_txn: HashMap::new(),
        };
        for e in entries.iter().filter(|e| e.authoritative) {
            progress
                .by_txn
                .entry(e.transaction_id)
                .or_default()
                .push(e.page_id);
        }
        let mut occupant: HashMap<u32, usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.in_temp)
            .map(|(i, e)| (e.position_id, i))
            .collect();

        let mut plan = Plan {
            actions: Vec::with_capacity(entries.len()),
            next_temp: self.start_temp_position_id,
        };

        let mut order: Vec<usize> = (0..entries.len())
            .filter(|&i| entries[i].authoritative)
            .collect();
        order.sort_by_key(|&i| entries[i].version);

        for i in order {
            let home = entries[i].page_id;
            progress.copied.insert(home);
            if let Some(j) = occupant.remove(&home) {
                if progress.keeps(&entries[j]) {
                    let temp = plan.take_temp_slot();
                    plan.actions.push(CheckpointAction::CopyToTempFile {
                        position_id: entries[j].position_id,
                        target_position_id: temp,
                    });
                    entries[j].position_id = temp;
                    entries[j].in_temp = true;
                } else {
                    entries[j].gone = true;
                }
            }

            let e = entries[i];
            let must_clear = !e.in_temp
                && e.position_id <= self.last_page_id
                && e.position_id != home
                && !targets.contains(&e.position_id);
            plan.actions.push(CheckpointAction::CopyToDataFile {
                position_id: e.position_id,
                target_position_id: home,
                must_clear,
            });
        }

        // zeroing only starts once every copy has landed, oldest version first
        let mut clears: Vec<&Entry> = entries
            .iter()
            .filter(|e| {
                if e.gone {
                    return false;
                }
                if e.in_temp {
                    !e.authoritative
                } else {
                    e.position_id <= self.last_page_id && !targets.contains(&e.position_id)
                }
            })
            .collect();
        clears.sort_by_key(|e| (e.version, e.position_id));
        plan.actions.extend(clears.into_iter().map(|e| CheckpointAction::ClearPage {
            position_id: e.position_id,
        }));

        Ok(plan.actions)
    }
}

struct Plan {
    actions: Vec<CheckpointAction>,
    next_temp: u32,
}

impl Plan {
    fn take_temp_slot(&mut self) -> u32 {
        while self.next_temp == 0 || is_allocation_map_slot(self.next_temp) {
            self.next_temp += 1;
        }
        let slot = self.next_temp;
        self.next_temp += 1;
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(position_id: u32, page_id: u32, txn: u32, confirmed: bool) -> LogPageHeader {
        LogPageHeader {
            position_id,
            recovery_position_id: position_id,
            page_id,
            transaction_id: txn,
            is_confirmed: confirmed,
        }
    }

    fn temp(position_id: u32, from: u32, page_id: u32, txn: u32, confirmed: bool) -> LogPageHeader {
        LogPageHeader {
            recovery_position_id: from,
            ..log(position_id, page_id, txn, confirmed)
        }
    }

    #[test]
    fn simple_copies_beyond_log() {
        let pages = [log(30, 5, 1, false), log(31, 9, 1, true)];
        let confirmed: HashSet<u32> = [1].into_iter().collect();
        let acts = CheckpointActions::new(&pages, &confirmed, 10, 32)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 30,
                    target_position_id: 5,
                    must_clear: false
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 31,
                    target_position_id: 9,
                    must_clear: false
                },
            ]
        );
    }

    #[test]
    fn unconfirmed_and_stale_are_dropped() {
        // page 5 written twice by txn 1, txn 2 never confirmed
        let pages = [
            log(20, 5, 1, false),
            log(21, 5, 1, true),
            log(22, 6, 2, false),
        ];
        let confirmed: HashSet<u32> = [1].into_iter().collect();
        let acts = CheckpointActions::new(&pages, &confirmed, 6, 23)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![CheckpointAction::CopyToDataFile {
                position_id: 21,
                target_position_id: 5,
                must_clear: false
            }]
        );
    }

    #[test]
    fn garbage_inside_data_region_is_cleared_after_copies() {
        // last page 40 puts slots 20..=22 inside the data region
        let pages = [
            log(20, 40, 1, false), // unconfirmed, not a target
            log(21, 22, 2, true),  // copies forward onto 22 (garbage)
            log(22, 39, 3, false), // unconfirmed, overwritten by the copy
        ];
        let confirmed: HashSet<u32> = [2].into_iter().collect();
        let acts = CheckpointActions::new(&pages, &confirmed, 40, 41)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 21,
                    target_position_id: 22,
                    must_clear: true
                },
                CheckpointAction::ClearPage { position_id: 20 },
                CheckpointAction::ClearPage { position_id: 21 },
            ]
        );
    }

    #[test]
    fn older_copy_is_cleared_before_the_newest() {
        // page 30 written at 19 (txn 1) and 20 (txn 2); slot 19 is the home of page 19
        let pages = [
            log(19, 30, 1, true),
            log(20, 30, 2, true),
            log(21, 19, 3, true),
        ];
        let confirmed = HashSet::new();
        let acts = CheckpointActions::new(&pages, &confirmed, 30, 31)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 20,
                    target_position_id: 30,
                    must_clear: true
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 21,
                    target_position_id: 19,
                    must_clear: true
                },
                CheckpointAction::ClearPage { position_id: 20 },
                CheckpointAction::ClearPage { position_id: 21 },
            ]
        );
    }

    #[test]
    fn newest_copy_on_a_home_slot_is_parked_while_older_ones_remain() {
        // page 12 at 10 (old) and 11 (new); slot 11 is the home of page 11 from 13
        let pages = [
            log(10, 12, 1, true),
            log(11, 12, 2, true),
            log(13, 11, 3, true),
        ];
        let confirmed = HashSet::new();
        let acts = CheckpointActions::new(&pages, &confirmed, 13, 14)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 11,
                    target_position_id: 12,
                    must_clear: false
                },
                CheckpointAction::CopyToTempFile {
                    position_id: 11,
                    target_position_id: 14
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 13,
                    target_position_id: 11,
                    must_clear: true
                },
                CheckpointAction::ClearPage { position_id: 10 },
                CheckpointAction::ClearPage { position_id: 13 },
            ]
        );
    }

    #[test]
    fn cycle_needs_exactly_one_temp() {
        let pages = [log(20, 21, 1, false), log(21, 20, 1, true)];
        let confirmed: HashSet<u32> = [1].into_iter().collect();
        let acts = CheckpointActions::new(&pages, &confirmed, 21, 22)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToTempFile {
                    position_id: 21,
                    target_position_id: 22
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 20,
                    target_position_id: 21,
                    must_clear: false
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 22,
                    target_position_id: 20,
                    must_clear: false
                },
            ]
        );
    }

    #[test]
    fn interrupted_cycle_reuses_its_temp_copy() {
        // the cycle above, stopped right after the temp copy was written
        let pages = [log(20, 21, 1, false), log(21, 20, 1, true)];
        let temps = [temp(22, 21, 20, 1, true)];
        let confirmed: HashSet<u32> = [1].into_iter().collect();
        let acts = CheckpointActions::new(&pages, &confirmed, 21, 23)
            .with_temp_pages(&temps)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 20,
                    target_position_id: 21,
                    must_clear: false
                },
                CheckpointAction::CopyToDataFile {
                    position_id: 22,
                    target_position_id: 20,
                    must_clear: false
                },
            ]
        );
    }

    #[test]
    fn stale_temp_copy_is_cleared() {
        // a parked confirming page whose page was rewritten later by txn 2
        let pages = [log(40, 5, 2, true)];
        let temps = [temp(50, 8, 5, 1, true)];
        let confirmed = HashSet::new();
        let acts = CheckpointActions::new(&pages, &confirmed, 8, 51)
            .with_temp_pages(&temps)
            .actions()
            .unwrap();
        assert_eq!(
            acts,
            vec![
                CheckpointAction::CopyToDataFile {
                    position_id: 40,
                    target_position_id: 5,
                    must_clear: false
                },
                CheckpointAction::ClearPage { position_id: 50 },
            ]
        );
    }

    #[test]
    fn temp_slots_skip_allocation_map_pages() {
        use crate::consts::AM_PAGE_STEP;
        let am1 = 1 + AM_PAGE_STEP;
        let pages = [log(am1 - 2, am1 - 1, 1, true), log(am1 - 1, am1 - 2, 1, true)];
        let confirmed = HashSet::new();
        let acts = CheckpointActions::new(&pages, &confirmed, am1 - 1, am1)
            .actions()
            .unwrap();
        assert_eq!(
            acts[0],
            CheckpointAction::CopyToTempFile {
                position_id: am1 - 1,
                target_position_id: am1 + 1
            }
        );
    }

    #[test]
    fn duplicate_positions_are_rejected() {
        let pages = [log(20, 5, 1, true)];
        let temps = [temp(20, 9, 6, 1, true)];
        let confirmed = HashSet::new();
        let err = CheckpointActions::new(&pages, &confirmed, 6, 21)
            .with_temp_pages(&temps)
            .actions();
        assert!(err.is_err());
    }
}
