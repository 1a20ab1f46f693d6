//! Contract for actor placement stores: which host owns which actor, plus
//! durable reminder schedules with lease-based claiming.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type HostId = String;

/// Generic property bag handed to a store at init time.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    pub properties: HashMap<String, String>,
}

impl Metadata {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }
}

/// Reference to an actor. The (type, id) pair addresses exactly one
/// placement slot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    pub actor_type: String,
    pub actor_id: String,
}

impl ActorRef {
    pub fn new(actor_type: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
        }
    }
}

/// Declares that a host can serve actors of a given type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostActorType {
    pub actor_type: String,
    pub idle_timeout: Duration,
    /// Maximum number of reminders executed concurrently for this type.
    /// Zero means no limit.
    pub concurrent_reminders_limit: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddActorHostRequest {
    pub address: String,
    pub app_id: String,
    pub api_level: u32,
    pub actor_types: Vec<HostActorType>,
}

/// Partial update for a registered host.
///
/// `actor_types: None` leaves the declared types unchanged;
/// `actor_types: Some(vec![])` removes all of them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpdateActorHostRequest {
    pub last_healthcheck: Option<DateTime<Utc>>,
    pub actor_types: Option<Vec<HostActorType>>,
}

impl UpdateActorHostRequest {
    /// True when there is nothing to update.
    pub fn is_empty(&self) -> bool {
        self.last_healthcheck.is_none() && self.actor_types.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupActorResponse {
    pub app_id: String,
    pub address: String,
    pub idle_timeout: Duration,
}

/// Reference to a reminder: actor type, actor ID and reminder name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReminderRef {
    pub actor_type: String,
    pub actor_id: String,
    pub name: String,
}

impl ReminderRef {
    pub fn new(
        actor_type: impl Into<String>,
        actor_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            actor_type: actor_type.into(),
            actor_id: actor_id.into(),
            name: name.into(),
        }
    }
}

/// Schedule and payload of a reminder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderOptions {
    pub execution_time: DateTime<Utc>,
    /// Repetition period for recurring reminders.
    pub period: Option<Duration>,
    /// Deadline after which a recurring reminder stops firing.
    pub ttl: Option<DateTime<Utc>>,
    pub data: Option<Vec<u8>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateReminderRequest {
    pub reference: ReminderRef,
    pub options: ReminderOptions,
}

/// Request for claiming a batch of due reminders.
///
/// An empty `actor_types` list fetches across all types.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FetchRemindersRequest {
    pub actor_types: Vec<String>,
    pub limit: usize,
}

/// Claim on a single reminder, held by the fetcher until the reminder is
/// delivered (then deleted or relinquished).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderLease {
    pub reminder_id: String,
    pub lease_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchedReminder {
    pub reference: ReminderRef,
    pub execution_time: DateTime<Utc>,
    pub lease: ReminderLease,
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("actor host already registered")]
    HostConflict,
    #[error("actor host not found")]
    HostNotFound,
    #[error("actor not found")]
    ActorNotFound,
    #[error("no host can serve actors of the requested type")]
    NoActorHost,
    #[error("reminder already exists")]
    ReminderConflict,
    #[error("reminder not found")]
    ReminderNotFound,
    #[error("store failure: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Uniqueness violation: the entity already exists.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::HostConflict | Self::ReminderConflict)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::HostNotFound | Self::ActorNotFound | Self::ReminderNotFound
        )
    }

    /// Whether retrying the same call later can succeed. Invalid requests
    /// and missing entities never heal on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoActorHost | Self::HostConflict | Self::ReminderConflict | Self::Internal(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Reminder half of the store contract.
#[async_trait]
pub trait ReminderStore: Send + Sync {
    /// Returns a reminder, or `ReminderNotFound`.
    async fn get_reminder(&self, reference: ReminderRef) -> StoreResult<ReminderOptions>;

    /// Creates a new reminder. Duplicate (type, id, name) is a
    /// `ReminderConflict`.
    async fn create_reminder(&self, request: CreateReminderRequest) -> StoreResult<()>;

    /// Deletes a reminder before it fires, or `ReminderNotFound`.
    async fn delete_reminder(&self, reference: ReminderRef) -> StoreResult<()>;

    /// Atomically claims a batch of due reminders. Concurrent fetchers
    /// never receive the same reminder; a lease lost to a crashed fetcher
    /// becomes claimable again once it goes stale.
    async fn fetch_reminders(
        &self,
        request: FetchRemindersRequest,
    ) -> StoreResult<Vec<FetchedReminder>>;

    /// Releases a lease after delivery so the reminder can be fetched
    /// again at its next due time. Fails with `ReminderNotFound` when the
    /// lease is no longer held (reminder deleted, or lease gone stale and
    /// re-claimed).
    async fn relinquish_reminder_lease(&self, lease: ReminderLease) -> StoreResult<()>;
}

/// Actor placement store contract.
#[async_trait]
pub trait Store: ReminderStore {
    async fn init(&self, metadata: Metadata) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;

    async fn close(&self) -> StoreResult<()>;

    /// Registers a new actor host and its supported actor types, returning
    /// the generated host ID.
    async fn add_actor_host(&self, request: AddActorHostRequest) -> StoreResult<HostId>;

    /// Updates a host's health check timestamp and/or declared actor types.
    async fn update_actor_host(
        &self,
        host_id: &str,
        request: UpdateActorHostRequest,
    ) -> StoreResult<()>;

    /// Deregisters a host. Its actor type declarations and actor
    /// assignments go away with it.
    async fn remove_actor_host(&self, host_id: &str) -> StoreResult<()>;

    /// Resolves the host owning an actor, assigning one on first use.
    async fn lookup_actor(&self, reference: ActorRef) -> StoreResult<LookupActorResponse>;

    /// Drops an actor's assignment, or `ActorNotFound`.
    async fn remove_actor(&self, reference: ActorRef) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_request_emptiness() {
        let req = UpdateActorHostRequest::default();
        assert!(req.is_empty());

        let req = UpdateActorHostRequest {
            actor_types: Some(Vec::new()),
            ..Default::default()
        };
        assert!(!req.is_empty(), "present-but-empty types is an update");

        let req = UpdateActorHostRequest {
            last_healthcheck: Some(Utc::now()),
            ..Default::default()
        };
        assert!(!req.is_empty());
    }

    #[test]
    fn error_classification() {
        assert!(StoreError::HostConflict.is_conflict());
        assert!(StoreError::ReminderConflict.is_conflict());
        assert!(!StoreError::HostNotFound.is_conflict());

        assert!(StoreError::ActorNotFound.is_not_found());
        assert!(StoreError::ReminderNotFound.is_not_found());
        assert!(!StoreError::NoActorHost.is_not_found());

        assert!(StoreError::NoActorHost.is_retryable());
        assert!(!StoreError::InvalidRequest("x").is_retryable());
        assert!(!StoreError::ActorNotFound.is_retryable());
    }
}
