use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::confirmation::{
    ConfirmationError, ConfirmationRegistry, FlowSignal, FlowState, FlowTarget,
};
use crate::dump::{DumpArtifact, DumpError, DumpExporter};
use crate::permissions::{Requester, can_export, can_manage, can_view_all};
use crate::profile::store::{ProfileStore, ProfileStoreError};
use crate::profile::types::{MAX_NAME_CHARS, NewProfile, Profile, capitalize_name};

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile already exists")]
    AlreadyExists,
    #[error("profile not found")]
    NotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("confirmation already resolved")]
    FlowExpired { state: Option<FlowState> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl ProfileError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::FlowExpired { .. } => "flow_expired",
            Self::InvalidRequest(_) => "invalid_request",
            Self::StorageFailure(_) => "storage_failure",
        }
    }

    /// Caller-facing text. Storage details stay in the logs.
    pub fn message(&self) -> String {
        match self {
            Self::AlreadyExists => {
                "you already have a profile; delete it before creating a new one".to_string()
            }
            Self::NotFound => "no profile found".to_string(),
            Self::Forbidden(message) | Self::InvalidRequest(message) => message.clone(),
            Self::FlowExpired { state: Some(state) } => {
                format!("this confirmation was already {}", state.as_str())
            }
            Self::FlowExpired { state: None } => {
                "this confirmation is no longer pending".to_string()
            }
            Self::StorageFailure(_) => {
                "an error occurred while processing your request; please try again later"
                    .to_string()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDeletion {
    pub flow_id: Uuid,
    pub state: FlowState,
    pub profile: Profile,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionOutcome {
    pub flow_id: Uuid,
    pub state: FlowState,
    pub target: FlowTarget,
    /// False when the row was already gone by the time the confirmation landed.
    pub deleted: bool,
}

/// Read-only view of a deletion flow, pending or settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionStatus {
    pub flow_id: Uuid,
    pub state: FlowState,
    pub target: FlowTarget,
    pub initiator: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProfileService {
    store: Arc<dyn ProfileStore>,
    confirmations: Arc<ConfirmationRegistry>,
    exporter: Option<Arc<DumpExporter>>,
}

impl ProfileService {
    pub fn new(
        store: Arc<dyn ProfileStore>,
        confirmations: Arc<ConfirmationRegistry>,
        exporter: Option<Arc<DumpExporter>>,
    ) -> Self {
        Self {
            store,
            confirmations,
            exporter,
        }
    }

    pub fn store_backend(&self) -> &'static str {
        self.store.backend_name()
    }

    pub fn confirmations(&self) -> &Arc<ConfirmationRegistry> {
        &self.confirmations
    }

    pub async fn create_profile(
        &self,
        requester_id: &str,
        first_name: &str,
        surname: &str,
    ) -> Result<Profile, ProfileError> {
        let external_id = normalize_external_id(requester_id)?;
        let first_name = normalize_name("first_name", first_name)?;
        let surname = normalize_name("surname", surname)?;

        let created = self
            .store
            .create(NewProfile {
                external_id,
                first_name,
                surname,
            })
            .await
            .map_err(|error| map_store_error("create_profile", error))?;

        tracing::info!(
            profile_id = created.id,
            external_id = %created.external_id,
            "profile created"
        );
        Ok(created)
    }

    /// Opens a confirmation for deleting `target` (the requester's own profile when
    /// `None`). Nothing is removed until the confirmation is accepted.
    pub async fn delete_profile(
        &self,
        requester: &Requester,
        target: Option<&str>,
    ) -> Result<PendingDeletion, ProfileError> {
        let requester_id = normalize_external_id(&requester.id)?;
        let target_id = match target.map(str::trim).filter(|value| !value.is_empty()) {
            Some(target_id) => target_id.to_string(),
            None => requester_id.clone(),
        };
        if !can_manage(requester.is_admin, &requester_id, &target_id) {
            return Err(ProfileError::Forbidden(
                "only administrators can delete other users' profiles".to_string(),
            ));
        }

        let profile = self
            .store
            .get_by_external_id(&target_id)
            .await
            .map_err(|error| map_store_error("delete_profile", error))?
            .ok_or(ProfileError::NotFound)?;

        let flow = self
            .confirmations
            .open(
                FlowTarget {
                    profile_id: profile.id,
                    external_id: profile.external_id.clone(),
                },
                requester_id.clone(),
            )
            .await;

        tracing::info!(
            flow_id = %flow.id(),
            profile_id = profile.id,
            external_id = %profile.external_id,
            requester_id = %requester_id,
            "profile deletion awaiting confirmation"
        );
        Ok(PendingDeletion {
            flow_id: flow.id(),
            state: flow.state(),
            profile,
            expires_at: flow.expires_at(),
        })
    }

    /// Feeds a confirm/cancel signal into a pending deletion and applies the result.
    pub async fn resolve_deletion(
        &self,
        requester: &Requester,
        flow_id: Uuid,
        signal: FlowSignal,
    ) -> Result<DeletionOutcome, ProfileError> {
        let outcome = self
            .confirmations
            .signal(flow_id, requester.id.trim(), signal)
            .await
            .map_err(map_confirmation_error)?;

        let deleted = match outcome.state {
            FlowState::Confirmed => match self.store.delete(outcome.target.profile_id).await {
                Ok(()) => {
                    tracing::info!(
                        flow_id = %outcome.flow_id,
                        profile_id = outcome.target.profile_id,
                        external_id = %outcome.target.external_id,
                        "profile deleted"
                    );
                    true
                }
                Err(ProfileStoreError::NotFound(_)) => false,
                Err(error) => return Err(map_store_error("resolve_deletion", error)),
            },
            FlowState::Pending | FlowState::Cancelled | FlowState::TimedOut => false,
        };

        Ok(DeletionOutcome {
            flow_id: outcome.flow_id,
            state: outcome.state,
            target: outcome.target,
            deleted,
        })
    }

    /// Reports how a deletion flow stands, including how a settled one ended.
    /// Visible to the member who opened it and to administrators.
    pub async fn deletion_status(
        &self,
        requester: &Requester,
        flow_id: Uuid,
    ) -> Result<DeletionStatus, ProfileError> {
        let flow = self
            .confirmations
            .get(flow_id)
            .await
            .ok_or(ProfileError::FlowExpired { state: None })?;
        if !can_manage(requester.is_admin, requester.id.trim(), flow.initiator()) {
            return Err(ProfileError::Forbidden(
                "only the requester who opened this confirmation can view it".to_string(),
            ));
        }
        Ok(DeletionStatus {
            flow_id: flow.id(),
            state: flow.state(),
            target: flow.target().clone(),
            initiator: flow.initiator().to_string(),
            expires_at: flow.expires_at(),
        })
    }

    pub async fn show_profile(
        &self,
        requester_id: &str,
        uuid: Option<&str>,
    ) -> Result<Profile, ProfileError> {
        let target_id = match uuid.map(str::trim).filter(|value| !value.is_empty()) {
            Some(uuid) => uuid.to_string(),
            None => normalize_external_id(requester_id)?,
        };
        self.store
            .get_by_external_id(&target_id)
            .await
            .map_err(|error| map_store_error("show_profile", error))?
            .ok_or(ProfileError::NotFound)
    }

    pub async fn list_profiles(
        &self,
        requester_is_admin: bool,
    ) -> Result<Vec<Profile>, ProfileError> {
        if !can_view_all(requester_is_admin) {
            return Err(ProfileError::Forbidden(
                "only administrators can view all profiles".to_string(),
            ));
        }
        self.store
            .list_all()
            .await
            .map_err(|error| map_store_error("list_profiles", error))
    }

    pub async fn dump(&self, requester: &Requester) -> Result<DumpArtifact, ProfileError> {
        if !can_export(requester.is_admin) {
            return Err(ProfileError::Forbidden(
                "only administrators can dump profiles".to_string(),
            ));
        }
        let exporter = self.exporter.as_ref().ok_or_else(|| {
            ProfileError::InvalidRequest("database export requires a postgres store".to_string())
        })?;
        let artifact = exporter.export().await.map_err(map_dump_error)?;
        tracing::info!(
            file_name = %artifact.file_name,
            bytes = artifact.contents.len(),
            requester_id = %requester.id,
            "profile database dump produced"
        );
        Ok(artifact)
    }
}

fn normalize_external_id(raw: &str) -> Result<String, ProfileError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ProfileError::InvalidRequest(
            "requester id is required".to_string(),
        ));
    }
    Ok(value.to_string())
}

fn normalize_name(field: &str, raw: &str) -> Result<String, ProfileError> {
    let value = capitalize_name(raw);
    if value.is_empty() {
        return Err(ProfileError::InvalidRequest(format!("{field} is required")));
    }
    if value.chars().count() > MAX_NAME_CHARS {
        return Err(ProfileError::InvalidRequest(format!(
            "{field} must be at most {MAX_NAME_CHARS} characters"
        )));
    }
    Ok(value)
}

fn map_store_error(operation: &'static str, error: ProfileStoreError) -> ProfileError {
    match error {
        ProfileStoreError::AlreadyExists(_) => ProfileError::AlreadyExists,
        ProfileStoreError::NotFound(_) => ProfileError::NotFound,
        ProfileStoreError::Db(reason) => {
            tracing::error!(operation, reason = %reason, "profile store failure");
            ProfileError::StorageFailure(reason)
        }
    }
}

fn map_confirmation_error(error: ConfirmationError) -> ProfileError {
    match error {
        ConfirmationError::FlowExpired { state } => ProfileError::FlowExpired { state },
        ConfirmationError::NotInitiator => ProfileError::Forbidden(error.to_string()),
    }
}

fn map_dump_error(error: DumpError) -> ProfileError {
    tracing::error!(reason = %error, "profile database dump failed");
    ProfileError::StorageFailure(error.to_string())
}
