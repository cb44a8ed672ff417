//! Process and process step records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a persisted identifier does not name a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseIdError {
    kind: &'static str,
    value: String,
}

impl ParseIdError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Process type, selects the executor that owns a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessTypeId {
    /// Company application checklist (wallet, DID validation, activation)
    ApplicationChecklist,
    /// Offer subscription setup at the provider
    OfferSubscription,
    /// Mail dispatch
    Mailing,
    /// Network partner onboarding
    PartnerRegistration,
    /// Self-description creation for companies and connectors
    SelfDescriptionCreation,
    /// Service account synchronisation with the identity provider
    ServiceAccountSync,
    /// User deprovisioning
    UserDeprovisioning,
    /// Identity provider display name synchronisation
    IdentityProviderDisplayNameSync,
}

impl ProcessTypeId {
    /// Every process type
    pub const ALL: [ProcessTypeId; 8] = [
        Self::ApplicationChecklist,
        Self::OfferSubscription,
        Self::Mailing,
        Self::PartnerRegistration,
        Self::SelfDescriptionCreation,
        Self::ServiceAccountSync,
        Self::UserDeprovisioning,
        Self::IdentityProviderDisplayNameSync,
    ];

    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationChecklist => "APPLICATION_CHECKLIST",
            Self::OfferSubscription => "OFFER_SUBSCRIPTION",
            Self::Mailing => "MAILING",
            Self::PartnerRegistration => "PARTNER_REGISTRATION",
            Self::SelfDescriptionCreation => "SELF_DESCRIPTION_CREATION",
            Self::ServiceAccountSync => "SERVICE_ACCOUNT_SYNC",
            Self::UserDeprovisioning => "USER_DEPROVISIONING",
            Self::IdentityProviderDisplayNameSync => "IDENTITY_PROVIDER_DISPLAY_NAME_SYNC",
        }
    }

    /// Step types owned by this process type
    pub fn step_type_ids(self) -> impl Iterator<Item = ProcessStepTypeId> {
        ProcessStepTypeId::ALL
            .into_iter()
            .filter(move |step| step.process_type_id() == self)
    }

    /// Whether this process type owns the given step type
    pub fn owns(&self, step_type_id: ProcessStepTypeId) -> bool {
        step_type_id.process_type_id() == *self
    }
}

impl fmt::Display for ProcessTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessTypeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("process type", s))
    }
}

/// Unit of work within a process
///
/// The owning process type of every step type is fixed here; this mapping is
/// the static step type registry used by dispatch and validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStepTypeId {
    // Application checklist
    CreateWallet,
    RetriggerCreateWallet,
    ValidateDid,
    RetriggerValidateDid,
    ActivateApplication,

    // Offer subscription
    TriggerProvider,
    RetriggerProvider,
    CreateTechnicalUser,
    ActivateSubscription,

    // Mailing
    SendMail,
    RetriggerSendMail,

    // Partner registration
    SynchronizeUser,
    RetriggerSynchronizeUser,

    // Self-description creation
    CreateSelfDescription,
    RetriggerCreateSelfDescription,

    // Service account sync
    SyncServiceAccount,

    // User deprovisioning
    DeleteCentralUser,
    DeleteUserRoles,

    // Identity provider display name sync
    SyncIdpDisplayName,
}

impl ProcessStepTypeId {
    /// Every step type
    pub const ALL: [ProcessStepTypeId; 19] = [
        Self::CreateWallet,
        Self::RetriggerCreateWallet,
        Self::ValidateDid,
        Self::RetriggerValidateDid,
        Self::ActivateApplication,
        Self::TriggerProvider,
        Self::RetriggerProvider,
        Self::CreateTechnicalUser,
        Self::ActivateSubscription,
        Self::SendMail,
        Self::RetriggerSendMail,
        Self::SynchronizeUser,
        Self::RetriggerSynchronizeUser,
        Self::CreateSelfDescription,
        Self::RetriggerCreateSelfDescription,
        Self::SyncServiceAccount,
        Self::DeleteCentralUser,
        Self::DeleteUserRoles,
        Self::SyncIdpDisplayName,
    ];

    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateWallet => "CREATE_WALLET",
            Self::RetriggerCreateWallet => "RETRIGGER_CREATE_WALLET",
            Self::ValidateDid => "VALIDATE_DID",
            Self::RetriggerValidateDid => "RETRIGGER_VALIDATE_DID",
            Self::ActivateApplication => "ACTIVATE_APPLICATION",
            Self::TriggerProvider => "TRIGGER_PROVIDER",
            Self::RetriggerProvider => "RETRIGGER_PROVIDER",
            Self::CreateTechnicalUser => "CREATE_TECHNICAL_USER",
            Self::ActivateSubscription => "ACTIVATE_SUBSCRIPTION",
            Self::SendMail => "SEND_MAIL",
            Self::RetriggerSendMail => "RETRIGGER_SEND_MAIL",
            Self::SynchronizeUser => "SYNCHRONIZE_USER",
            Self::RetriggerSynchronizeUser => "RETRIGGER_SYNCHRONIZE_USER",
            Self::CreateSelfDescription => "CREATE_SELF_DESCRIPTION",
            Self::RetriggerCreateSelfDescription => "RETRIGGER_CREATE_SELF_DESCRIPTION",
            Self::SyncServiceAccount => "SYNC_SERVICE_ACCOUNT",
            Self::DeleteCentralUser => "DELETE_CENTRAL_USER",
            Self::DeleteUserRoles => "DELETE_USER_ROLES",
            Self::SyncIdpDisplayName => "SYNC_IDP_DISPLAY_NAME",
        }
    }

    /// The process type owning this step type
    pub fn process_type_id(&self) -> ProcessTypeId {
        match self {
            Self::CreateWallet
            | Self::RetriggerCreateWallet
            | Self::ValidateDid
            | Self::RetriggerValidateDid
            | Self::ActivateApplication => ProcessTypeId::ApplicationChecklist,

            Self::TriggerProvider
            | Self::RetriggerProvider
            | Self::CreateTechnicalUser
            | Self::ActivateSubscription => ProcessTypeId::OfferSubscription,

            Self::SendMail | Self::RetriggerSendMail => ProcessTypeId::Mailing,

            Self::SynchronizeUser | Self::RetriggerSynchronizeUser => {
                ProcessTypeId::PartnerRegistration
            }

            Self::CreateSelfDescription | Self::RetriggerCreateSelfDescription => {
                ProcessTypeId::SelfDescriptionCreation
            }

            Self::SyncServiceAccount => ProcessTypeId::ServiceAccountSync,

            Self::DeleteCentralUser | Self::DeleteUserRoles => ProcessTypeId::UserDeprovisioning,

            Self::SyncIdpDisplayName => ProcessTypeId::IdentityProviderDisplayNameSync,
        }
    }

    /// For a retrigger step type, the step type it re-enters
    pub fn retriggered_step_type_id(&self) -> Option<ProcessStepTypeId> {
        match self {
            Self::RetriggerCreateWallet => Some(Self::CreateWallet),
            Self::RetriggerValidateDid => Some(Self::ValidateDid),
            Self::RetriggerProvider => Some(Self::TriggerProvider),
            Self::RetriggerSendMail => Some(Self::SendMail),
            Self::RetriggerSynchronizeUser => Some(Self::SynchronizeUser),
            Self::RetriggerCreateSelfDescription => Some(Self::CreateSelfDescription),
            _ => None,
        }
    }

    /// Whether this is a manual/automatic re-entry step
    pub fn is_retrigger(&self) -> bool {
        self.retriggered_step_type_id().is_some()
    }
}

impl fmt::Display for ProcessStepTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStepTypeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("process step type", s))
    }
}

/// Process step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStepStatusId {
    /// Pending, picked up by the engine
    Todo,
    /// Completed successfully
    Done,
    /// Failed terminally
    Failed,
    /// Skipped by business logic
    Skipped,
    /// Collapsed duplicate of another step of the same type
    Duplicate,
}

impl ProcessStepStatusId {
    const ALL: [ProcessStepStatusId; 5] = [
        Self::Todo,
        Self::Done,
        Self::Failed,
        Self::Skipped,
        Self::Duplicate,
    ];

    /// Persisted representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "TODO",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Duplicate => "DUPLICATE",
        }
    }

    /// Whether the step will never run again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Todo)
    }
}

impl fmt::Display for ProcessStepStatusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStepStatusId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseIdError::new("process step status", s))
    }
}

/// A durable business workflow instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub id: Uuid,
    pub process_type_id: ProcessTypeId,

    /// Optimistic concurrency counter, incremented on every modification
    pub version: i64,

    /// While set and in the future, no other worker may pick the process up
    pub lock_expiry_date: Option<DateTime<Utc>>,

    /// Last time a worker claimed the process; discovery favors the least
    /// recently claimed so processes stuck on a pending step rotate
    #[serde(default)]
    pub date_last_claimed: Option<DateTime<Utc>>,
}

impl Process {
    /// Create a new, unlocked process at version 0
    pub fn new(process_type_id: ProcessTypeId) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_type_id,
            version: 0,
            lock_expiry_date: None,
            date_last_claimed: None,
        }
    }

    /// Whether the process is locked at the given instant
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiry_date.is_some_and(|expiry| expiry > now)
    }

    /// Whether the process is locked right now
    pub fn is_locked(&self) -> bool {
        self.is_locked_at(Utc::now())
    }
}

/// A unit of work within a process; never deleted, forms the audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStep {
    pub id: Uuid,
    pub process_id: Uuid,
    pub process_step_type_id: ProcessStepTypeId,
    pub process_step_status_id: ProcessStepStatusId,
    pub date_created: DateTime<Utc>,
    pub date_last_changed: Option<DateTime<Utc>>,

    /// Last error or informational message recorded for the step
    pub message: Option<String>,
}

impl ProcessStep {
    pub fn is_pending(&self) -> bool {
        self.process_step_status_id == ProcessStepStatusId::Todo
    }
}
