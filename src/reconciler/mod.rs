//! Reconciliation of cached counters against their authoritative tables.
//!
//! Counters drift when increments race or crash mid-write. This scan
//! recomputes every cached aggregate from the child tables and fixes the
//! rows that disagree. Entities stream through in id-keyed batches; the
//! whole table is never held in memory.

use crate::sounds::SoundStore;
use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Report mismatches without writing corrections.
    pub no_changes: bool,
    /// Skip the download aggregates, which are by far the largest child
    /// table scans.
    pub skip_downloads: bool,
    pub batch_size: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        ReconcilerSettings {
            no_changes: false,
            skip_downloads: false,
            batch_size: 500,
        }
    }
}

/// Mismatch ids grouped by field, e.g. `sound.num_comments -> [41, 97]`.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub sounds_scanned: usize,
    pub packs_scanned: usize,
    pub users_scanned: usize,
    pub mismatches: BTreeMap<&'static str, Vec<i64>>,
    pub corrected: bool,
}

impl ReconcileReport {
    pub fn total_mismatches(&self) -> usize {
        self.mismatches.values().map(|ids| ids.len()).sum()
    }

    fn record(&mut self, field: &'static str, id: i64) {
        self.mismatches.entry(field).or_default().push(id);
    }
}

pub struct CounterReconciler {
    store: Arc<dyn SoundStore>,
    settings: ReconcilerSettings,
}

impl CounterReconciler {
    pub fn new(store: Arc<dyn SoundStore>, settings: ReconcilerSettings) -> Self {
        CounterReconciler { store, settings }
    }

    /// Scan everything. `on_progress` is called with the number of entities
    /// handled per batch.
    pub fn run(&self, mut on_progress: impl FnMut(usize)) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            corrected: !self.settings.no_changes,
            ..ReconcileReport::default()
        };
        self.reconcile_sounds(&mut report, &mut on_progress)?;
        self.reconcile_packs(&mut report, &mut on_progress)?;
        self.reconcile_users(&mut report, &mut on_progress)?;
        info!(
            "Reconciled {} sounds, {} packs, {} users: {} mismatches{}",
            report.sounds_scanned,
            report.packs_scanned,
            report.users_scanned,
            report.total_mismatches(),
            if self.settings.no_changes {
                " (not corrected)"
            } else {
                ""
            }
        );
        Ok(report)
    }

    fn reconcile_sounds(
        &self,
        report: &mut ReconcileReport,
        on_progress: &mut impl FnMut(usize),
    ) -> Result<()> {
        let mut after_id = 0;
        loop {
            let batch = self.store.sounds_batch(after_id, self.settings.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for sound in &batch {
                report.sounds_scanned += 1;

                let num_comments = self.store.count_comments(sound.id)?;
                if num_comments != sound.num_comments {
                    debug!(
                        "Sound {} num_comments {} -> {}",
                        sound.id, sound.num_comments, num_comments
                    );
                    report.record("sound.num_comments", sound.id);
                    if !self.settings.no_changes {
                        self.store.set_sound_num_comments(sound.id, num_comments)?;
                    }
                }

                if !self.settings.skip_downloads {
                    let num_downloads = self.store.count_sound_downloads(sound.id)?;
                    if num_downloads != sound.num_downloads {
                        report.record("sound.num_downloads", sound.id);
                        if !self.settings.no_changes {
                            self.store.set_sound_num_downloads(sound.id, num_downloads)?;
                        }
                    }
                }

                let (num_ratings, avg_rating) = self.store.rating_stats(sound.id)?;
                if num_ratings != sound.num_ratings
                    || (avg_rating - sound.avg_rating).abs() > 1e-9
                {
                    report.record("sound.ratings", sound.id);
                    if !self.settings.no_changes {
                        self.store
                            .set_sound_ratings(sound.id, num_ratings, avg_rating)?;
                    }
                }
            }
            on_progress(batch.len());
            after_id = batch.last().map(|s| s.id).unwrap_or(after_id);
        }
        Ok(())
    }

    fn reconcile_packs(
        &self,
        report: &mut ReconcileReport,
        on_progress: &mut impl FnMut(usize),
    ) -> Result<()> {
        let mut after_id = 0;
        loop {
            let batch = self.store.packs_batch(after_id, self.settings.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for pack in &batch {
                report.packs_scanned += 1;
                let num_sounds = self.store.count_pack_sounds(pack.id)?;
                let num_downloads = if self.settings.skip_downloads {
                    pack.num_downloads
                } else {
                    self.store.count_pack_downloads(pack.id)?
                };
                if num_sounds != pack.num_sounds || num_downloads != pack.num_downloads {
                    report.record("pack.counts", pack.id);
                    if !self.settings.no_changes {
                        self.store
                            .set_pack_counts(pack.id, num_sounds, num_downloads)?;
                    }
                }
            }
            on_progress(batch.len());
            after_id = batch.last().map(|p| p.id).unwrap_or(after_id);
        }
        Ok(())
    }

    fn reconcile_users(
        &self,
        report: &mut ReconcileReport,
        on_progress: &mut impl FnMut(usize),
    ) -> Result<()> {
        let mut after_id = 0;
        loop {
            let batch = self.store.users_batch(after_id, self.settings.batch_size)?;
            if batch.is_empty() {
                break;
            }
            for user in &batch {
                report.users_scanned += 1;
                let num_sounds = self.store.count_user_sounds(user.id)?;
                let num_posts = self.store.count_user_posts(user.id)?;
                if num_sounds != user.num_sounds || num_posts != user.num_posts {
                    report.record("user.counts", user.id);
                    if !self.settings.no_changes {
                        self.store.set_user_counts(user.id, num_sounds, num_posts)?;
                    }
                }
            }
            on_progress(batch.len());
            after_id = batch.last().map(|u| u.id).unwrap_or(after_id);
        }
        Ok(())
    }
}
