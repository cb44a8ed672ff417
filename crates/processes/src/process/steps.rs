//! Step-state helpers
//!
//! [`PendingProcessSteps`] is the in-memory view of a process's `TODO` steps.
//! Every transition (complete, skip, schedule) is recorded as a
//! [`ProcessStepChanges`] entry which the engine or a manual step commits in
//! one store call. Executors never touch these records directly.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{ProcessStep, ProcessStepStatusId, ProcessStepTypeId};

/// A step record to be inserted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProcessStep {
    /// Generated before commit so later updates in the same change set can refer to it
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_step_type_id: ProcessStepTypeId,
    pub process_step_status_id: ProcessStepStatusId,
    pub message: Option<String>,
}

impl NewProcessStep {
    pub fn new(
        process_id: Uuid,
        process_step_type_id: ProcessStepTypeId,
        process_step_status_id: ProcessStepStatusId,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_id,
            process_step_type_id,
            process_step_status_id,
            message: None,
        }
    }

    /// Materialize the record as it will look once persisted
    pub fn into_step(self, date_created: DateTime<Utc>) -> ProcessStep {
        ProcessStep {
            id: self.id,
            process_id: self.process_id,
            process_step_type_id: self.process_step_type_id,
            process_step_status_id: self.process_step_status_id,
            date_created,
            date_last_changed: None,
            message: self.message,
        }
    }
}

/// A status/message change on an existing step record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStepUpdate {
    pub step_id: Uuid,
    pub process_step_status_id: ProcessStepStatusId,
    pub message: Option<String>,
}

/// Accumulated step mutations for one process, committed atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStepChanges {
    pub new_steps: Vec<NewProcessStep>,
    pub updates: Vec<ProcessStepUpdate>,
}

impl ProcessStepChanges {
    pub fn is_empty(&self) -> bool {
        self.new_steps.is_empty() && self.updates.is_empty()
    }

    /// Record a status change, folding it into a step created in this change set
    fn set_status(&mut self, step_id: Uuid, status: ProcessStepStatusId, message: Option<String>) {
        if let Some(step) = self.new_steps.iter_mut().find(|s| s.id == step_id) {
            step.process_step_status_id = status;
            if message.is_some() {
                step.message = message;
            }
            return;
        }

        match self.updates.iter_mut().find(|u| u.step_id == step_id) {
            Some(update) => {
                update.process_step_status_id = status;
                if message.is_some() {
                    update.message = message;
                }
            }
            None => self.updates.push(ProcessStepUpdate {
                step_id,
                process_step_status_id: status,
                message,
            }),
        }
    }
}

/// Pending (`TODO`) steps of one process and the changes made against them
#[derive(Debug, Clone)]
pub struct PendingProcessSteps {
    process_id: Uuid,

    /// Pending step ids per type, oldest first
    pending: BTreeMap<ProcessStepTypeId, Vec<Uuid>>,

    changes: ProcessStepChanges,
}

impl PendingProcessSteps {
    /// Build the view from a process's step records (any status)
    pub fn from_steps(process_id: Uuid, steps: &[ProcessStep]) -> Self {
        let mut todo: Vec<&ProcessStep> = steps
            .iter()
            .filter(|s| s.process_id == process_id && s.is_pending())
            .collect();
        todo.sort_by_key(|s| (s.date_created, s.id));

        let mut pending: BTreeMap<ProcessStepTypeId, Vec<Uuid>> = BTreeMap::new();
        for step in todo {
            pending
                .entry(step.process_step_type_id)
                .or_default()
                .push(step.id);
        }

        Self {
            process_id,
            pending,
            changes: ProcessStepChanges::default(),
        }
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    /// Step types with at least one pending step
    pub fn step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        self.pending.keys().copied().collect()
    }

    pub fn contains(&self, step_type_id: ProcessStepTypeId) -> bool {
        self.pending.contains_key(&step_type_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Id of the step that a completion of this type would transition
    pub fn first_step_id(&self, step_type_id: ProcessStepTypeId) -> Option<Uuid> {
        self.pending
            .get(&step_type_id)
            .and_then(|ids| ids.first().copied())
    }

    /// Transition the pending step of a type
    ///
    /// The first pending step gets `status`/`message`, every other pending step
    /// of that type becomes `DUPLICATE`. With `status == TODO` only the message
    /// of the first step changes and the type stays pending.
    ///
    /// Returns `false` if no step of the type is pending.
    pub fn complete(
        &mut self,
        step_type_id: ProcessStepTypeId,
        status: ProcessStepStatusId,
        message: Option<String>,
    ) -> bool {
        if status == ProcessStepStatusId::Todo {
            return match self.first_step_id(step_type_id) {
                Some(step_id) => {
                    self.changes.set_status(step_id, status, message);
                    true
                }
                None => false,
            };
        }

        let Some(ids) = self.pending.remove(&step_type_id) else {
            return false;
        };

        let mut ids = ids.into_iter();
        if let Some(first) = ids.next() {
            self.changes.set_status(first, status, message);
        }
        for duplicate in ids {
            self.changes
                .set_status(duplicate, ProcessStepStatusId::Duplicate, None);
        }
        true
    }

    /// Skip the pending steps of the given types
    pub fn skip<I>(&mut self, step_type_ids: I)
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        for step_type_id in step_type_ids {
            self.complete(step_type_id, ProcessStepStatusId::Skipped, None);
        }
    }

    /// Schedule steps of the given types
    ///
    /// A type that is already pending gets a `DUPLICATE` record instead of a
    /// second `TODO` step.
    pub fn schedule<I>(&mut self, step_type_ids: I)
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        for step_type_id in step_type_ids {
            if self.contains(step_type_id) {
                self.changes.new_steps.push(NewProcessStep::new(
                    self.process_id,
                    step_type_id,
                    ProcessStepStatusId::Duplicate,
                ));
            } else {
                self.push_todo(step_type_id);
            }
        }
    }

    /// Schedule only the given types that are not pending yet
    pub fn schedule_missing<I>(&mut self, step_type_ids: I)
    where
        I: IntoIterator<Item = ProcessStepTypeId>,
    {
        for step_type_id in step_type_ids {
            if !self.contains(step_type_id) {
                self.push_todo(step_type_id);
            }
        }
    }

    fn push_todo(&mut self, step_type_id: ProcessStepTypeId) {
        let step = NewProcessStep::new(self.process_id, step_type_id, ProcessStepStatusId::Todo);
        self.pending.insert(step_type_id, vec![step.id]);
        self.changes.new_steps.push(step);
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changes(&self) -> &ProcessStepChanges {
        &self.changes
    }

    /// Hand the accumulated changes over for commit
    pub fn take_changes(&mut self) -> ProcessStepChanges {
        std::mem::take(&mut self.changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn todo_step(process_id: Uuid, step_type: ProcessStepTypeId, age_secs: i64) -> ProcessStep {
        ProcessStep {
            id: Uuid::now_v7(),
            process_id,
            process_step_type_id: step_type,
            process_step_status_id: ProcessStepStatusId::Todo,
            date_created: Utc::now() - Duration::seconds(age_secs),
            date_last_changed: None,
            message: None,
        }
    }

    #[test]
    fn test_complete_marks_siblings_duplicate() {
        let process_id = Uuid::now_v7();
        let older = todo_step(process_id, ProcessStepTypeId::SendMail, 20);
        let newer = todo_step(process_id, ProcessStepTypeId::SendMail, 10);
        let mut pending =
            PendingProcessSteps::from_steps(process_id, &[newer.clone(), older.clone()]);

        assert!(pending.complete(ProcessStepTypeId::SendMail, ProcessStepStatusId::Done, None));
        assert!(!pending.contains(ProcessStepTypeId::SendMail));

        let changes = pending.take_changes();
        assert_eq!(changes.updates.len(), 2);
        assert_eq!(changes.updates[0].step_id, older.id);
        assert_eq!(changes.updates[0].process_step_status_id, ProcessStepStatusId::Done);
        assert_eq!(changes.updates[1].step_id, newer.id);
        assert_eq!(
            changes.updates[1].process_step_status_id,
            ProcessStepStatusId::Duplicate
        );
    }

    #[test]
    fn test_complete_with_todo_only_records_message() {
        let process_id = Uuid::now_v7();
        let step = todo_step(process_id, ProcessStepTypeId::CreateWallet, 5);
        let mut pending = PendingProcessSteps::from_steps(process_id, &[step.clone()]);

        assert!(pending.complete(
            ProcessStepTypeId::CreateWallet,
            ProcessStepStatusId::Todo,
            Some("wallet service unavailable".into()),
        ));
        assert!(pending.contains(ProcessStepTypeId::CreateWallet));

        let changes = pending.take_changes();
        assert_eq!(
            changes.updates,
            vec![ProcessStepUpdate {
                step_id: step.id,
                process_step_status_id: ProcessStepStatusId::Todo,
                message: Some("wallet service unavailable".into()),
            }]
        );
    }

    #[test]
    fn test_complete_unknown_type_is_noop() {
        let mut pending = PendingProcessSteps::from_steps(Uuid::now_v7(), &[]);
        assert!(!pending.complete(ProcessStepTypeId::SendMail, ProcessStepStatusId::Done, None));
        assert!(!pending.has_changes());
    }

    #[test]
    fn test_schedule_collapses_to_duplicate() {
        let process_id = Uuid::now_v7();
        let existing = todo_step(process_id, ProcessStepTypeId::ValidateDid, 5);
        let mut pending = PendingProcessSteps::from_steps(process_id, &[existing]);

        pending.schedule([ProcessStepTypeId::ValidateDid, ProcessStepTypeId::ActivateApplication]);

        let changes = pending.take_changes();
        let statuses: Vec<_> = changes
            .new_steps
            .iter()
            .map(|s| (s.process_step_type_id, s.process_step_status_id))
            .collect();
        assert_eq!(
            statuses,
            vec![
                (ProcessStepTypeId::ValidateDid, ProcessStepStatusId::Duplicate),
                (ProcessStepTypeId::ActivateApplication, ProcessStepStatusId::Todo),
            ]
        );
    }

    #[test]
    fn test_schedule_same_type_twice_yields_single_todo() {
        let process_id = Uuid::now_v7();
        let mut pending = PendingProcessSteps::from_steps(process_id, &[]);

        pending.schedule([ProcessStepTypeId::SendMail, ProcessStepTypeId::SendMail]);

        let todo = pending
            .changes()
            .new_steps
            .iter()
            .filter(|s| s.process_step_status_id == ProcessStepStatusId::Todo)
            .count();
        assert_eq!(todo, 1);
        assert_eq!(pending.changes().new_steps.len(), 2);
    }

    #[test]
    fn test_schedule_then_skip_leaves_no_todo() {
        let process_id = Uuid::now_v7();
        let existing = todo_step(process_id, ProcessStepTypeId::RetriggerValidateDid, 5);
        let mut pending = PendingProcessSteps::from_steps(process_id, &[existing]);
        let types = [
            ProcessStepTypeId::RetriggerValidateDid,
            ProcessStepTypeId::RetriggerCreateWallet,
        ];

        pending.schedule(types);
        pending.skip(types);

        let changes = pending.take_changes();
        assert!(changes
            .new_steps
            .iter()
            .all(|s| s.process_step_status_id != ProcessStepStatusId::Todo));
        assert!(changes
            .updates
            .iter()
            .all(|u| u.process_step_status_id != ProcessStepStatusId::Todo));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_schedule_missing_ignores_pending_types() {
        let process_id = Uuid::now_v7();
        let existing = todo_step(process_id, ProcessStepTypeId::SendMail, 5);
        let mut pending = PendingProcessSteps::from_steps(process_id, &[existing]);

        pending.schedule_missing([ProcessStepTypeId::SendMail, ProcessStepTypeId::RetriggerSendMail]);

        let changes = pending.take_changes();
        assert_eq!(changes.new_steps.len(), 1);
        assert_eq!(
            changes.new_steps[0].process_step_type_id,
            ProcessStepTypeId::RetriggerSendMail
        );
    }

    #[test]
    fn test_terminal_steps_are_ignored() {
        let process_id = Uuid::now_v7();
        let mut done = todo_step(process_id, ProcessStepTypeId::SendMail, 5);
        done.process_step_status_id = ProcessStepStatusId::Done;

        let pending = PendingProcessSteps::from_steps(process_id, &[done]);
        assert!(pending.is_empty());
    }
}
