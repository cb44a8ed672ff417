//! Application checklist executor
//!
//! Drives a submitted application through wallet creation and DID
//! validation, then activates it:
//!
//! ```text
//! CREATE_WALLET ──► VALIDATE_DID ──► ACTIVATE_APPLICATION (locked)
//!       │                 │
//!       ▼                 ▼
//! RETRIGGER_CREATE_WALLET  RETRIGGER_VALIDATE_DID   (manual, on terminal failure)
//! ```
//!
//! Each step records its outcome on the matching checklist entry so the
//! portal can show progress independently of the process tables.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use portal_processes::process::ParseIdError;
use portal_processes::{
    ErrorClassification, InitializationResult, ProcessError, ProcessStepTypeId,
    ProcessTypeExecutor, ProcessTypeId, ServiceError, StepExecutionResult, StepFailure,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::repositories::RepositoryError;

// ============================================
// Business types
// ============================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    Created,
    Submitted,
    Confirmed,
    Declined,
}

impl ApplicationStatus {
    pub const ALL: [ApplicationStatus; 4] = [
        ApplicationStatus::Created,
        ApplicationStatus::Submitted,
        ApplicationStatus::Confirmed,
        ApplicationStatus::Declined,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Created => "CREATED",
            ApplicationStatus::Submitted => "SUBMITTED",
            ApplicationStatus::Confirmed => "CONFIRMED",
            ApplicationStatus::Declined => "DECLINED",
        }
    }
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStatus {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("application status", s))
    }
}

/// Checklist entry, one per verification an application goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecklistEntryTypeId {
    Wallet,
    DidValidation,
}

impl ChecklistEntryTypeId {
    /// All entries, in the order they are worked on
    pub const ALL: [ChecklistEntryTypeId; 2] = [
        ChecklistEntryTypeId::Wallet,
        ChecklistEntryTypeId::DidValidation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistEntryTypeId::Wallet => "WALLET",
            ChecklistEntryTypeId::DidValidation => "DID_VALIDATION",
        }
    }

    /// Step that advances this entry
    pub fn step_type_id(&self) -> ProcessStepTypeId {
        match self {
            ChecklistEntryTypeId::Wallet => ProcessStepTypeId::CreateWallet,
            ChecklistEntryTypeId::DidValidation => ProcessStepTypeId::ValidateDid,
        }
    }
}

impl fmt::Display for ChecklistEntryTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecklistEntryTypeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("checklist entry type", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChecklistEntryStatusId {
    ToDo,
    InProgress,
    Done,
    Failed,
}

impl ChecklistEntryStatusId {
    pub const ALL: [ChecklistEntryStatusId; 4] = [
        ChecklistEntryStatusId::ToDo,
        ChecklistEntryStatusId::InProgress,
        ChecklistEntryStatusId::Done,
        ChecklistEntryStatusId::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistEntryStatusId::ToDo => "TO_DO",
            ChecklistEntryStatusId::InProgress => "IN_PROGRESS",
            ChecklistEntryStatusId::Done => "DONE",
            ChecklistEntryStatusId::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ChecklistEntryStatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChecklistEntryStatusId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("checklist entry status", s))
    }
}

/// Application handled by a checklist process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: Uuid,
    pub process_id: Uuid,
    pub status: ApplicationStatus,
    /// Decentralized identifier of the wallet, set once the wallet exists
    pub did: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistEntry {
    pub entry_type_id: ChecklistEntryTypeId,
    pub status_id: ChecklistEntryStatusId,
    pub comment: Option<String>,
}

impl ChecklistEntry {
    pub fn new(entry_type_id: ChecklistEntryTypeId) -> Self {
        Self {
            entry_type_id,
            status_id: ChecklistEntryStatusId::ToDo,
            comment: None,
        }
    }
}

/// Answer of the DID validation service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DidValidation {
    pub valid: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

// ============================================
// Collaborators
// ============================================

/// Business data of applications and their checklists
#[async_trait]
pub trait ChecklistRepository: Send + Sync {
    async fn find_application_for_process(
        &self,
        process_id: Uuid,
    ) -> Result<Option<Application>, RepositoryError>;

    async fn get_checklist(&self, application_id: Uuid) -> Result<Vec<ChecklistEntry>, RepositoryError>;

    /// Create entries in `TO_DO`; existing entries are left untouched
    async fn create_checklist_entries(
        &self,
        application_id: Uuid,
        entry_type_ids: &[ChecklistEntryTypeId],
    ) -> Result<(), RepositoryError>;

    async fn update_checklist_entry(
        &self,
        application_id: Uuid,
        entry_type_id: ChecklistEntryTypeId,
        status_id: ChecklistEntryStatusId,
        comment: Option<String>,
    ) -> Result<(), RepositoryError>;

    async fn set_application_did(&self, application_id: Uuid, did: &str) -> Result<(), RepositoryError>;

    /// Move the application to `CONFIRMED`
    async fn activate_application(&self, application_id: Uuid) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait WalletService: Send + Sync {
    /// Create a wallet, returning its DID
    async fn create_wallet(&self, application_id: Uuid) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait DidValidationService: Send + Sync {
    async fn validate_did(&self, did: &str) -> Result<DidValidation, ServiceError>;
}

// ============================================
// Executor
// ============================================

/// Per-pass state of a checklist process
#[derive(Debug, Clone)]
pub struct ChecklistContext {
    pub application: Application,
    pub entries: BTreeMap<ChecklistEntryTypeId, ChecklistEntry>,
}

impl ChecklistContext {
    fn status_of(&self, entry_type_id: ChecklistEntryTypeId) -> Option<ChecklistEntryStatusId> {
        self.entries.get(&entry_type_id).map(|e| e.status_id)
    }

    fn is_done(&self, entry_type_id: ChecklistEntryTypeId) -> bool {
        self.status_of(entry_type_id) == Some(ChecklistEntryStatusId::Done)
    }

    /// Entries not yet `DONE`
    fn open_entries(&self) -> Vec<ChecklistEntryTypeId> {
        ChecklistEntryTypeId::ALL
            .into_iter()
            .filter(|t| !self.is_done(*t))
            .collect()
    }
}

pub struct ChecklistExecutor {
    repository: Arc<dyn ChecklistRepository>,
    wallets: Arc<dyn WalletService>,
    did_validation: Arc<dyn DidValidationService>,
    classification: ErrorClassification,
}

impl ChecklistExecutor {
    pub fn new(
        repository: Arc<dyn ChecklistRepository>,
        wallets: Arc<dyn WalletService>,
        did_validation: Arc<dyn DidValidationService>,
    ) -> Self {
        Self {
            repository,
            wallets,
            did_validation,
            classification: Self::classification_table(),
        }
    }

    /// Failure handling of the checklist steps
    pub fn classification_table() -> ErrorClassification {
        ErrorClassification::new(ProcessTypeId::ApplicationChecklist)
            .with_retrigger(
                ProcessStepTypeId::CreateWallet,
                ProcessStepTypeId::RetriggerCreateWallet,
            )
            .with_retrigger(
                ProcessStepTypeId::ValidateDid,
                ProcessStepTypeId::RetriggerValidateDid,
            )
    }

    async fn set_entry(
        &self,
        context: &mut ChecklistContext,
        entry_type_id: ChecklistEntryTypeId,
        status_id: ChecklistEntryStatusId,
        comment: Option<String>,
    ) -> Result<(), ProcessError> {
        self.repository
            .update_checklist_entry(context.application.id, entry_type_id, status_id, comment.clone())
            .await?;
        let entry = context
            .entries
            .entry(entry_type_id)
            .or_insert_with(|| ChecklistEntry::new(entry_type_id));
        entry.status_id = status_id;
        entry.comment = comment;
        Ok(())
    }

    /// Classify a failure; terminal failures also fail the checklist entry
    async fn fail_step(
        &self,
        context: &mut ChecklistContext,
        entry_type_id: ChecklistEntryTypeId,
        failure: StepFailure,
    ) -> ProcessError {
        let error = self
            .classification
            .into_process_error(entry_type_id.step_type_id(), failure);

        if let ProcessError::Terminal { message, .. } = &error {
            if let Err(e) = self
                .set_entry(
                    context,
                    entry_type_id,
                    ChecklistEntryStatusId::Failed,
                    Some(message.clone()),
                )
                .await
            {
                return e;
            }
        }
        error
    }

    async fn create_wallet(
        &self,
        context: &mut ChecklistContext,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<StepExecutionResult, ProcessError> {
        let next = (!step_type_ids.contains(&ProcessStepTypeId::ValidateDid))
            .then_some(ProcessStepTypeId::ValidateDid);

        // Re-run after a lost commit: the wallet already exists
        if context.application.did.is_some() {
            if !context.is_done(ChecklistEntryTypeId::Wallet) {
                self.set_entry(
                    context,
                    ChecklistEntryTypeId::Wallet,
                    ChecklistEntryStatusId::Done,
                    None,
                )
                .await?;
            }
            return Ok(StepExecutionResult::done()
                .with_next(next)
                .with_message("wallet already created"));
        }

        self.set_entry(
            context,
            ChecklistEntryTypeId::Wallet,
            ChecklistEntryStatusId::InProgress,
            None,
        )
        .await?;

        let did = match self.wallets.create_wallet(context.application.id).await {
            Ok(did) => did,
            Err(e) => {
                return Err(self
                    .fail_step(context, ChecklistEntryTypeId::Wallet, e.into())
                    .await)
            }
        };

        self.repository
            .set_application_did(context.application.id, &did)
            .await?;
        context.application.did = Some(did);
        self.set_entry(
            context,
            ChecklistEntryTypeId::Wallet,
            ChecklistEntryStatusId::Done,
            None,
        )
        .await?;

        info!(application_id = %context.application.id, "wallet created");
        Ok(StepExecutionResult::done().with_next(next))
    }

    async fn validate_did(
        &self,
        context: &mut ChecklistContext,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<StepExecutionResult, ProcessError> {
        let next = (!step_type_ids.contains(&ProcessStepTypeId::ActivateApplication))
            .then_some(ProcessStepTypeId::ActivateApplication);

        let Some(did) = context.application.did.clone() else {
            return Ok(StepExecutionResult::waiting("wallet not created yet"));
        };

        if context.is_done(ChecklistEntryTypeId::DidValidation) {
            return Ok(StepExecutionResult::done()
                .with_next(next)
                .with_message("DID already validated"));
        }

        let validation = match self.did_validation.validate_did(&did).await {
            Ok(validation) => validation,
            Err(e) => {
                return Err(self
                    .fail_step(context, ChecklistEntryTypeId::DidValidation, e.into())
                    .await)
            }
        };

        if !validation.valid {
            let reason = validation
                .reason
                .unwrap_or_else(|| format!("DID {did} was rejected"));
            return Err(self
                .fail_step(
                    context,
                    ChecklistEntryTypeId::DidValidation,
                    StepFailure::Validation(reason),
                )
                .await);
        }

        self.set_entry(
            context,
            ChecklistEntryTypeId::DidValidation,
            ChecklistEntryStatusId::Done,
            None,
        )
        .await?;
        Ok(StepExecutionResult::done().with_next(next))
    }

    async fn activate_application(
        &self,
        context: &mut ChecklistContext,
    ) -> Result<StepExecutionResult, ProcessError> {
        let open = context.open_entries();
        if !open.is_empty() {
            let names: Vec<&str> = open.iter().map(|t| t.as_str()).collect();
            return Ok(StepExecutionResult::waiting(format!(
                "waiting for checklist entries: {}",
                names.join(", ")
            )));
        }

        if context.application.status != ApplicationStatus::Confirmed {
            self.repository
                .activate_application(context.application.id)
                .await?;
            context.application.status = ApplicationStatus::Confirmed;
            info!(application_id = %context.application.id, "application activated");
        }

        Ok(StepExecutionResult::done()
            .with_skip([
                ProcessStepTypeId::RetriggerCreateWallet,
                ProcessStepTypeId::RetriggerValidateDid,
            ])
            .with_message("application activated"))
    }
}

#[async_trait]
impl ProcessTypeExecutor for ChecklistExecutor {
    const PROCESS_TYPE_ID: ProcessTypeId = ProcessTypeId::ApplicationChecklist;
    type Context = ChecklistContext;

    fn executable_step_type_ids(&self) -> BTreeSet<ProcessStepTypeId> {
        BTreeSet::from([
            ProcessStepTypeId::CreateWallet,
            ProcessStepTypeId::ValidateDid,
            ProcessStepTypeId::ActivateApplication,
        ])
    }

    fn is_lock_requested(&self, step_type_id: ProcessStepTypeId) -> bool {
        step_type_id == ProcessStepTypeId::ActivateApplication
    }

    fn error_classification(&self) -> &ErrorClassification {
        &self.classification
    }

    #[instrument(skip(self, step_type_ids))]
    async fn initialize_process(
        &self,
        process_id: Uuid,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
    ) -> Result<(Self::Context, InitializationResult), ProcessError> {
        let application = self
            .repository
            .find_application_for_process(process_id)
            .await?
            .ok_or_else(|| ProcessError::not_found(format!("no application for process {process_id}")))?;

        // A confirmed application may only finish its own activation
        let activating = application.status == ApplicationStatus::Confirmed
            && step_type_ids.contains(&ProcessStepTypeId::ActivateApplication);
        if application.status != ApplicationStatus::Submitted && !activating {
            return Err(ProcessError::conflict(format!(
                "application {} is {}, expected {}",
                application.id,
                application.status,
                ApplicationStatus::Submitted
            )));
        }

        let mut entries: BTreeMap<_, _> = self
            .repository
            .get_checklist(application.id)
            .await?
            .into_iter()
            .map(|e| (e.entry_type_id, e))
            .collect();

        let missing: Vec<_> = ChecklistEntryTypeId::ALL
            .into_iter()
            .filter(|t| !entries.contains_key(t))
            .collect();
        if !missing.is_empty() {
            debug!(?missing, "creating missing checklist entries");
            self.repository
                .create_checklist_entries(application.id, &missing)
                .await?;
            entries.extend(missing.iter().map(|t| (*t, ChecklistEntry::new(*t))));
        }

        let context = ChecklistContext {
            application,
            entries,
        };
        let backfill = backfill_step(&context, step_type_ids, &self.classification);

        let result = InitializationResult::schedule(backfill).with_modified(!missing.is_empty());
        Ok((context, result))
    }

    #[instrument(
        skip(self, context, step_type_ids, _cancel),
        fields(application_id = %context.application.id)
    )]
    async fn execute_process_step(
        &self,
        context: &mut Self::Context,
        step_type_id: ProcessStepTypeId,
        step_type_ids: &BTreeSet<ProcessStepTypeId>,
        _cancel: &CancellationToken,
    ) -> Result<StepExecutionResult, ProcessError> {
        match step_type_id {
            ProcessStepTypeId::CreateWallet => self.create_wallet(context, step_type_ids).await,
            ProcessStepTypeId::ValidateDid => self.validate_did(context, step_type_ids).await,
            ProcessStepTypeId::ActivateApplication => self.activate_application(context).await,
            other => Err(ProcessError::system(format!(
                "step type {other} is not executable by the checklist executor"
            ))),
        }
    }
}

/// Step needed to move the checklist forward when nothing is pending for it
///
/// Entries are worked in order; the first entry not `DONE` gets its step
/// scheduled unless that step or its retrigger is already pending or the
/// entry failed. With every entry `DONE` the activation is scheduled.
fn backfill_step(
    context: &ChecklistContext,
    step_type_ids: &BTreeSet<ProcessStepTypeId>,
    classification: &ErrorClassification,
) -> Option<ProcessStepTypeId> {
    let Some(entry_type_id) = context.open_entries().into_iter().next() else {
        let activate = ProcessStepTypeId::ActivateApplication;
        return (context.application.status == ApplicationStatus::Submitted
            && !step_type_ids.contains(&activate))
        .then_some(activate);
    };

    if context.status_of(entry_type_id) == Some(ChecklistEntryStatusId::Failed) {
        return None;
    }

    let step = entry_type_id.step_type_id();
    let retrigger = classification.retrigger_for(step);
    let pending = step_type_ids.contains(&step)
        || retrigger.is_some_and(|r| step_type_ids.contains(&r));
    (!pending).then_some(step)
}
