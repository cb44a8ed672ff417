//! In-memory implementation of ProcessStore for testing

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::process::{
    Process, ProcessStep, ProcessStepChanges, ProcessStepStatusId, ProcessStepTypeId,
    ProcessTypeId,
};

#[derive(Default)]
struct StoreState {
    processes: HashMap<Uuid, Process>,
    steps: HashMap<Uuid, Vec<ProcessStep>>,
}

impl StoreState {
    fn process_mut(&mut self, process_id: Uuid) -> Result<&mut Process, StoreError> {
        self.processes
            .get_mut(&process_id)
            .ok_or(StoreError::ProcessNotFound(process_id))
    }
}

/// In-memory implementation of ProcessStore
///
/// This is primarily for testing. It keeps everything behind one lock and
/// provides the same semantics as the PostgreSQL implementation, including
/// rejection of a second `TODO` step of the same type.
///
/// # Example
///
/// ```
/// use portal_processes::InMemoryProcessStore;
///
/// let store = InMemoryProcessStore::new();
/// assert_eq!(store.process_count(), 0);
/// ```
pub struct InMemoryProcessStore {
    state: RwLock<StoreState>,
}

impl InMemoryProcessStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    /// Get the number of processes
    pub fn process_count(&self) -> usize {
        self.state.read().processes.len()
    }

    /// Get the number of steps across all processes
    pub fn step_count(&self) -> usize {
        self.state.read().steps.values().map(Vec::len).sum()
    }

    /// Insert a process as-is (test seeding)
    pub fn insert_process(&self, process: Process) {
        let mut state = self.state.write();
        state.steps.entry(process.id).or_default();
        state.processes.insert(process.id, process);
    }

    /// Append a step record to an existing process (test seeding)
    pub fn insert_step(
        &self,
        process_id: Uuid,
        process_step_type_id: ProcessStepTypeId,
        process_step_status_id: ProcessStepStatusId,
    ) -> Result<ProcessStep, StoreError> {
        let mut state = self.state.write();
        if !state.processes.contains_key(&process_id) {
            return Err(StoreError::ProcessNotFound(process_id));
        }

        let step = ProcessStep {
            id: Uuid::now_v7(),
            process_id,
            process_step_type_id,
            process_step_status_id,
            date_created: Utc::now(),
            date_last_changed: None,
            message: None,
        };
        state.steps.entry(process_id).or_default().push(step.clone());
        Ok(step)
    }

    /// Overwrite the lock expiry of a process (test seeding)
    pub fn set_lock_expiry(&self, process_id: Uuid, lock_expiry: Option<DateTime<Utc>>) {
        if let Some(process) = self.state.write().processes.get_mut(&process_id) {
            process.lock_expiry_date = lock_expiry;
        }
    }

    /// Steps of a process with the given type, in creation order
    pub fn steps_of_type(
        &self,
        process_id: Uuid,
        process_step_type_id: ProcessStepTypeId,
    ) -> Vec<ProcessStep> {
        self.state
            .read()
            .steps
            .get(&process_id)
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| s.process_step_type_id == process_step_type_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of `TODO` steps across all processes
    pub fn pending_step_count(&self) -> usize {
        self.state
            .read()
            .steps
            .values()
            .flatten()
            .filter(|s| s.is_pending())
            .count()
    }
}

impl Default for InMemoryProcessStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_changes(
    process_id: Uuid,
    steps: &mut Vec<ProcessStep>,
    changes: ProcessStepChanges,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    for update in changes.updates {
        let step = steps
            .iter_mut()
            .find(|s| s.id == update.step_id)
            .ok_or_else(|| {
                StoreError::Database(format!(
                    "step {} does not belong to process {}",
                    update.step_id, process_id
                ))
            })?;
        step.process_step_status_id = update.process_step_status_id;
        if update.message.is_some() {
            step.message = update.message;
        }
        step.date_last_changed = Some(now);
    }

    for new_step in changes.new_steps {
        if new_step.process_id != process_id {
            return Err(StoreError::Database(format!(
                "step {} targets process {} instead of {}",
                new_step.id, new_step.process_id, process_id
            )));
        }
        steps.push(new_step.into_step(now));
    }

    // Mirrors the partial unique index on (process_id, process_step_type_id) WHERE TODO
    let mut seen = BTreeSet::new();
    for step in steps.iter().filter(|s| s.is_pending()) {
        if !seen.insert(step.process_step_type_id) {
            return Err(StoreError::Database(format!(
                "duplicate pending step {} for process {}",
                step.process_step_type_id, process_id
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl ProcessStore for InMemoryProcessStore {
    async fn create_process(&self, process_type_id: ProcessTypeId) -> Result<Process, StoreError> {
        let process = Process::new(process_type_id);
        self.insert_process(process.clone());
        Ok(process)
    }

    async fn get_process(&self, process_id: Uuid) -> Result<Process, StoreError> {
        self.state
            .read()
            .processes
            .get(&process_id)
            .cloned()
            .ok_or(StoreError::ProcessNotFound(process_id))
    }

    async fn get_process_steps(&self, process_id: Uuid) -> Result<Vec<ProcessStep>, StoreError> {
        let state = self.state.read();
        if !state.processes.contains_key(&process_id) {
            return Err(StoreError::ProcessNotFound(process_id));
        }
        let mut steps = state.steps.get(&process_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| (s.date_created, s.id));
        Ok(steps)
    }

    async fn find_due_processes(
        &self,
        process_type_ids: &[ProcessTypeId],
        step_type_ids: &[ProcessStepTypeId],
        batch_size: usize,
    ) -> Result<Vec<DueProcess>, StoreError> {
        let now = Utc::now();
        let state = self.state.read();

        type DueKey = (Option<DateTime<Utc>>, DateTime<Utc>);
        let mut due: Vec<(DueKey, DueProcess)> = state
            .processes
            .values()
            .filter(|p| process_type_ids.contains(&p.process_type_id) && !p.is_locked_at(now))
            .filter_map(|process| {
                let pending: Vec<&ProcessStep> = state
                    .steps
                    .get(&process.id)?
                    .iter()
                    .filter(|s| s.is_pending() && step_type_ids.contains(&s.process_step_type_id))
                    .collect();
                let oldest = pending.iter().map(|s| s.date_created).min()?;
                Some((
                    (process.date_last_claimed, oldest),
                    DueProcess {
                        process: process.clone(),
                        step_type_ids: pending.iter().map(|s| s.process_step_type_id).collect(),
                    },
                ))
            })
            .collect();

        // Never-claimed first, then least recently claimed
        due.sort_by_key(|(key, d)| (*key, d.process.id));
        Ok(due
            .into_iter()
            .take(batch_size)
            .map(|(_, d)| d)
            .collect())
    }

    async fn try_claim_process(
        &self,
        process_id: Uuid,
        expected_version: i64,
        lock_expiry: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();
        let process = state.process_mut(process_id)?;

        if process.version != expected_version || process.is_locked_at(now) {
            return Ok(false);
        }

        process.version += 1;
        process.lock_expiry_date = lock_expiry;
        process.date_last_claimed = Some(now);
        Ok(true)
    }

    async fn save_process_steps(
        &self,
        process_id: Uuid,
        expected_version: i64,
        changes: ProcessStepChanges,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut state = self.state.write();

        if state.process_mut(process_id)?.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                process_id,
                expected_version,
            });
        }

        let mut steps = state.steps.get(&process_id).cloned().unwrap_or_default();
        apply_changes(process_id, &mut steps, changes, now)?;

        state.steps.insert(process_id, steps);
        state.process_mut(process_id)?.version += 1;
        Ok(())
    }

    async fn release_process(
        &self,
        process_id: Uuid,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let process = state.process_mut(process_id)?;
        if process.version != expected_version {
            return Ok(false);
        }
        process.version += 1;
        process.lock_expiry_date = None;
        Ok(true)
    }

    async fn bump_version(&self, process_id: Uuid, expected_version: i64) -> Result<bool, StoreError> {
        let mut state = self.state.write();
        let process = state.process_mut(process_id)?;
        if process.version != expected_version {
            return Ok(false);
        }
        process.version += 1;
        Ok(true)
    }
}
