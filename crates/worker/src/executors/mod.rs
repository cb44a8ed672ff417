//! Process type executors of the onboarding portal

pub mod checklist;
pub mod mailing;

use portal_processes::{ProcessTypeExecutorRegistry, RegistryError};

pub use checklist::{
    Application, ApplicationStatus, ChecklistContext, ChecklistEntry, ChecklistEntryStatusId,
    ChecklistEntryTypeId, ChecklistExecutor, ChecklistRepository, DidValidation,
    DidValidationService, WalletService,
};
pub use mailing::{Mail, MailDispatcher, MailingContext, MailingExecutor, MailingRepository};

/// Registry with every executor this worker runs
pub fn build_registry(
    checklist: ChecklistExecutor,
    mailing: MailingExecutor,
) -> Result<ProcessTypeExecutorRegistry, RegistryError> {
    let mut registry = ProcessTypeExecutorRegistry::new();
    registry.register(checklist)?;
    registry.register(mailing)?;
    Ok(registry)
}
