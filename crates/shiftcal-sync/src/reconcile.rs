//! Three-way diff between freshly scraped shifts and the events already on
//! the calendar, and sequential execution of the resulting plan.

use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::BTreeSet;

use serde::Serialize;
use shiftcal_core::{ShiftKey, ShiftRecord, ShiftSet};
use shiftcal_gcal::{AdapterError, EventStore, ExternalEvent, ShiftEventAdapter};
use tracing::{info, warn};

/// Which of several events decoding to the same shift is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateTieBreak {
    /// The first event in list order.
    #[default]
    FirstListed,
    /// The event with the smallest service-assigned id.
    LowestEventId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileMode {
    Apply,
    DryRun,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Extra events for a shift that already has a kept event.
    pub duplicates: Vec<ExternalEvent>,
    pub to_add: Vec<ShiftRecord>,
    /// Kept events whose url set changed, with the fresh record.
    pub to_update: Vec<(ExternalEvent, ShiftRecord)>,
    pub to_remove: Vec<ExternalEvent>,
    pub unchanged: usize,
}

impl ReconcilePlan {
    pub fn is_noop(&self) -> bool {
        self.duplicates.is_empty()
            && self.to_add.is_empty()
            && self.to_update.is_empty()
            && self.to_remove.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub mode: ReconcileMode,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub duplicates_removed: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    fn of(plan: &ReconcilePlan, mode: ReconcileMode) -> Self {
        Self {
            mode,
            added: plan.to_add.len(),
            updated: plan.to_update.len(),
            removed: plan.to_remove.len(),
            duplicates_removed: plan.duplicates.len(),
            unchanged: plan.unchanged,
        }
    }
}

/// Computes the mutations that make `existing` match `scraped`.
///
/// `existing` pairs each listed event with the record it decodes to, in list
/// order. Exactly one event per key survives deduplication.
pub fn plan(
    scraped: &ShiftSet,
    mut existing: Vec<(ExternalEvent, ShiftRecord)>,
    tie_break: DuplicateTieBreak,
) -> ReconcilePlan {
    if tie_break == DuplicateTieBreak::LowestEventId {
        existing.sort_by(|(a, _), (b, _)| a.id.cmp(&b.id));
    }

    let mut duplicates = Vec::new();
    let mut existing_by_key: BTreeMap<ShiftKey, (ExternalEvent, BTreeSet<String>)> =
        BTreeMap::new();
    for (event, record) in existing {
        match existing_by_key.entry(record.key) {
            Entry::Occupied(_) => duplicates.push(event),
            Entry::Vacant(slot) => {
                slot.insert((event, record.urls));
            }
        }
    }

    let to_add = scraped
        .records()
        .filter(|record| !existing_by_key.contains_key(&record.key))
        .collect();

    let mut to_update = Vec::new();
    let mut to_remove = Vec::new();
    let mut unchanged = 0;
    for (key, (event, stored_urls)) in existing_by_key {
        match scraped.get(&key) {
            None => to_remove.push(event),
            Some(fresh) if *fresh != stored_urls => {
                let record = ShiftRecord {
                    key,
                    urls: fresh.clone(),
                };
                to_update.push((event, record));
            }
            Some(_) => unchanged += 1,
        }
    }

    ReconcilePlan {
        duplicates,
        to_add,
        to_update,
        to_remove,
        unchanged,
    }
}

/// Runs plans against one calendar. Calls are issued one at a time; the
/// first failure stops the run and whatever was already applied stays applied.
pub struct Reconciler<S> {
    adapter: ShiftEventAdapter<S>,
    tie_break: DuplicateTieBreak,
}

impl<S: EventStore> Reconciler<S> {
    pub fn new(adapter: ShiftEventAdapter<S>) -> Self {
        Self {
            adapter,
            tie_break: DuplicateTieBreak::default(),
        }
    }

    pub fn with_tie_break(mut self, tie_break: DuplicateTieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn adapter(&self) -> &ShiftEventAdapter<S> {
        &self.adapter
    }

    /// Lists and decodes the calendar, then plans against `scraped`.
    pub async fn plan(&self, scraped: &ShiftSet) -> Result<ReconcilePlan, AdapterError> {
        let events = self.adapter.list().await?;
        let existing = events
            .into_iter()
            .map(|event| {
                let record = self.adapter.decode(&event)?;
                Ok((event, record))
            })
            .collect::<Result<Vec<_>, AdapterError>>()?;
        Ok(plan(scraped, existing, self.tie_break))
    }

    pub async fn reconcile(
        &self,
        scraped: &ShiftSet,
        mode: ReconcileMode,
    ) -> Result<ReconcileSummary, AdapterError> {
        let plan = self.plan(scraped).await?;
        let summary = ReconcileSummary::of(&plan, mode);
        info!(
            ?mode,
            add = summary.added,
            update = summary.updated,
            remove = summary.removed,
            duplicates = summary.duplicates_removed,
            unchanged = summary.unchanged,
            "reconcile plan"
        );

        if mode == ReconcileMode::Apply {
            self.execute(&plan).await?;
        }
        Ok(summary)
    }

    /// Applies a plan: duplicates first, then creates, updates and removals.
    pub async fn execute(&self, plan: &ReconcilePlan) -> Result<(), AdapterError> {
        for event in &plan.duplicates {
            warn!(
                event_id = %event.id,
                summary = %event.summary,
                start = %event.start,
                "removing duplicate event"
            );
            self.adapter.delete(event).await?;
        }
        for record in &plan.to_add {
            self.adapter.create(record).await?;
        }
        for (event, record) in &plan.to_update {
            self.adapter.update(event, record).await?;
        }
        for event in &plan.to_remove {
            self.adapter.delete(event).await?;
        }
        Ok(())
    }
}
