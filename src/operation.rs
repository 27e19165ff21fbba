//! Async operation store.
//!
//! Long-running calls diverted by the `async` extension are tracked as
//! operations. The lifecycle is monotonic:
//!
//! ```text
//! pending → processing → completed | failed | cancelled
//! ```
//!
//! Terminal states are never mutated; a worker publishing its result after
//! a cancel is a no-op. The [`OperationStore`] trait keeps the backend
//! pluggable; [`MemoryOperationStore`] is the in-process implementation,
//! serializing transitions per operation behind one store mutex (reads are
//! snapshots).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorCode, ErrorObject};

/// Operation lifecycle states, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Processing => 1,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "processing" => Some(OperationStatus::Processing),
            "completed" => Some(OperationStatus::Completed),
            "failed" => Some(OperationStatus::Failed),
            "cancelled" => Some(OperationStatus::Cancelled),
            _ => None,
        }
    }
}

/// A persisted async operation record.
#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: String,
    pub function_urn: String,
    pub version: String,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ErrorObject>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub owner: String,
}

/// Fields a transition may update alongside the status.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub errors: Vec<ErrorObject>,
}

/// Filter for [`OperationStore::list`].
#[derive(Debug, Clone, Default)]
pub struct OperationFilter {
    pub status: Option<OperationStatus>,
    pub function: Option<String>,
}

/// Page size cap for `list`.
pub const MAX_LIST_LIMIT: usize = 100;

#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Insert a new `pending` operation and return it.
    async fn create(&self, function_urn: &str, version: &str, owner: &str) -> Operation;

    /// Apply a status transition. Refuses non-monotonic transitions and
    /// any mutation of a terminal state (the latter silently, returning
    /// the unchanged record, so late workers are harmless).
    async fn transition(
        &self,
        id: &str,
        status: OperationStatus,
        patch: TransitionPatch,
    ) -> Result<Operation, ErrorObject>;

    /// Fetch an operation, scoped to its owner when one is given.
    async fn get(&self, id: &str, owner: Option<&str>) -> Result<Operation, ErrorObject>;

    /// Cancel from `pending`/`processing`; otherwise `ASYNC_CANNOT_CANCEL`.
    async fn cancel(&self, id: &str, owner: Option<&str>) -> Result<Operation, ErrorObject>;

    /// List operations for an owner, newest first, with opaque cursor
    /// pagination.
    async fn list(
        &self,
        owner: &str,
        filter: OperationFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<Operation>, Option<String>), ErrorObject>;

    /// Attach the worker's cancellation token so a store-side cancel
    /// reaches the running function.
    fn register_worker(&self, id: &str, token: CancellationToken);

    /// Drop expired operations; returns how many were removed.
    fn sweep(&self) -> usize;

    /// Operations not yet in a terminal state.
    async fn active_count(&self) -> usize;
}

/// In-memory operation store.
pub struct MemoryOperationStore {
    records: Mutex<HashMap<String, Operation>>,
    workers: Mutex<HashMap<String, CancellationToken>>,
    ttl: chrono::Duration,
}

impl MemoryOperationStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24)),
        }
    }

    fn is_expired(op: &Operation, now: DateTime<Utc>) -> bool {
        now >= op.expires_at
    }
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn create(&self, function_urn: &str, version: &str, owner: &str) -> Operation {
        let now = Utc::now();
        let op = Operation {
            id: new_operation_id(),
            function_urn: function_urn.to_string(),
            version: version.to_string(),
            status: OperationStatus::Pending,
            progress: None,
            result: None,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at: now + self.ttl,
            owner: owner.to_string(),
        };
        self.records.lock().insert(op.id.clone(), op.clone());
        op
    }

    async fn transition(
        &self,
        id: &str,
        status: OperationStatus,
        patch: TransitionPatch,
    ) -> Result<Operation, ErrorObject> {
        let mut records = self.records.lock();
        let op = records
            .get_mut(id)
            .ok_or_else(|| operation_not_found(id))?;

        // Terminal states are immutable; late publishes are no-ops.
        if op.status.is_terminal() {
            return Ok(op.clone());
        }
        // Monotonic only; a same-rank transition is allowed solely for
        // processing→processing progress updates.
        if status.rank() < op.status.rank()
            || (status.rank() == op.status.rank() && status != OperationStatus::Processing)
        {
            return Err(ErrorObject::new(
                ErrorCode::Conflict,
                format!(
                    "operation {id} cannot transition from {} to {}",
                    op.status.as_str(),
                    status.as_str()
                ),
            ));
        }

        let now = Utc::now();
        op.status = status;
        op.updated_at = now;
        if let Some(progress) = patch.progress {
            op.progress = Some(progress);
        }
        if let Some(result) = patch.result {
            op.result = Some(result);
        }
        if !patch.errors.is_empty() {
            op.errors = patch.errors;
        }
        if status.is_terminal() {
            op.completed_at = Some(now);
            self.workers.lock().remove(id);
        }
        Ok(op.clone())
    }

    async fn get(&self, id: &str, owner: Option<&str>) -> Result<Operation, ErrorObject> {
        let records = self.records.lock();
        let op = records.get(id).ok_or_else(|| operation_not_found(id))?;
        if Self::is_expired(op, Utc::now()) {
            return Err(operation_not_found(id));
        }
        if let Some(owner) = owner {
            if op.owner != owner {
                return Err(operation_not_found(id));
            }
        }
        Ok(op.clone())
    }

    async fn cancel(&self, id: &str, owner: Option<&str>) -> Result<Operation, ErrorObject> {
        // Validate existence/ownership first so the error is NOT_FOUND
        // rather than CANNOT_CANCEL for foreign ids.
        let current = self.get(id, owner).await?;
        if current.status.is_terminal() {
            return Err(ErrorObject::new(
                ErrorCode::AsyncCannotCancel,
                format!(
                    "operation {id} is already {}",
                    current.status.as_str()
                ),
            )
            .with_details(serde_json::json!({ "status": current.status.as_str() })));
        }

        let cancelled = self
            .transition(id, OperationStatus::Cancelled, TransitionPatch::default())
            .await?;
        // Lost the race against a terminal publish between the check and
        // the transition.
        if cancelled.status != OperationStatus::Cancelled {
            return Err(ErrorObject::new(
                ErrorCode::AsyncCannotCancel,
                format!("operation {id} is already {}", cancelled.status.as_str()),
            )
            .with_details(serde_json::json!({ "status": cancelled.status.as_str() })));
        }
        if let Some(token) = self.workers.lock().remove(id) {
            token.cancel();
        }
        Ok(cancelled)
    }

    async fn list(
        &self,
        owner: &str,
        filter: OperationFilter,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<Operation>, Option<String>), ErrorObject> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let after = match cursor {
            Some(raw) => Some(decode_cursor(raw)?),
            None => None,
        };

        let now = Utc::now();
        let mut items: Vec<Operation> = self
            .records
            .lock()
            .values()
            .filter(|op| op.owner == owner && !Self::is_expired(op, now))
            .filter(|op| filter.status.map_or(true, |s| op.status == s))
            .filter(|op| {
                filter
                    .function
                    .as_deref()
                    .map_or(true, |f| op.function_urn == f)
            })
            .cloned()
            .collect();

        // Stable order: (created_at DESC, id DESC), at the same microsecond
        // precision the cursor encodes.
        items.sort_by(|a, b| {
            (b.created_at.timestamp_micros(), &b.id)
                .cmp(&(a.created_at.timestamp_micros(), &a.id))
        });

        if let Some((after_micros, after_id)) = after {
            items.retain(|op| {
                (op.created_at.timestamp_micros(), op.id.as_str())
                    < (after_micros, after_id.as_str())
            });
        }

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items.last().map(|op| encode_cursor(op))
        } else {
            None
        };
        Ok((items, next_cursor))
    }

    fn register_worker(&self, id: &str, token: CancellationToken) {
        self.workers.lock().insert(id.to_string(), token);
    }

    fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, op| !Self::is_expired(op, now));
        before - records.len()
    }

    async fn active_count(&self) -> usize {
        self.records
            .lock()
            .values()
            .filter(|op| !op.status.is_terminal())
            .count()
    }
}

/// Spawn the background expiry sweeper for a store.
pub fn spawn_sweeper(
    store: Arc<dyn OperationStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                tracing::debug!(removed, "swept expired operations");
            }
        }
    })
}

fn operation_not_found(id: &str) -> ErrorObject {
    ErrorObject::new(
        ErrorCode::AsyncOperationNotFound,
        format!("no operation '{id}'"),
    )
    .with_details(serde_json::json!({ "operation_id": id }))
}

fn encode_cursor(op: &Operation) -> String {
    format!("{}:{}", op.created_at.timestamp_micros(), op.id)
}

fn decode_cursor(raw: &str) -> Result<(i64, String), ErrorObject> {
    let bad = || {
        ErrorObject::new(ErrorCode::InvalidArguments, "malformed cursor")
            .with_pointer("/call/arguments/cursor")
    };
    let (micros, id) = raw.split_once(':').ok_or_else(bad)?;
    let micros: i64 = micros.parse().map_err(|_| bad())?;
    Ok((micros, id.to_string()))
}

/// Crockford base32 alphabet used by ULID.
const ULID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate an operation id: `op_` + 26-char ULID (48-bit millisecond
/// timestamp + 80 random bits).
pub fn new_operation_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let random = uuid::Uuid::new_v4();
    let mut entropy = 0u128;
    for &byte in &random.as_bytes()[..10] {
        entropy = (entropy << 8) | byte as u128;
    }
    let value: u128 = (millis << 80) | entropy;

    let mut chars = [b'0'; 26];
    let mut rest = value;
    for slot in chars.iter_mut().rev() {
        *slot = ULID_ALPHABET[(rest & 0x1f) as usize];
        rest >>= 5;
    }
    let ulid = std::str::from_utf8(&chars).expect("alphabet is ascii");
    format!("op_{ulid}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryOperationStore {
        MemoryOperationStore::new(Duration::from_secs(86400))
    }

    #[tokio::test]
    async fn test_create_is_pending_with_ulid_id() {
        let op = store().create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(op.id.starts_with("op_"));
        assert_eq!(op.id.len(), 3 + 26);
        assert!(op.completed_at.is_none());
        assert!(op.expires_at > op.created_at);
    }

    #[tokio::test]
    async fn test_monotonic_transitions() {
        let s = store();
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;

        s.transition(&op.id, OperationStatus::Processing, TransitionPatch::default())
            .await
            .unwrap();
        // pending < processing, so going back is refused
        assert!(s
            .transition(&op.id, OperationStatus::Pending, TransitionPatch::default())
            .await
            .is_err());

        let done = s
            .transition(
                &op.id,
                OperationStatus::Completed,
                TransitionPatch {
                    result: Some(serde_json::json!({"rows": 3})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_states_are_immutable() {
        let s = store();
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        s.cancel(&op.id, None).await.unwrap();

        // A late worker publish must be a no-op, not an error.
        let after = s
            .transition(
                &op.id,
                OperationStatus::Completed,
                TransitionPatch {
                    result: Some(serde_json::json!("late")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(after.status, OperationStatus::Cancelled);
        assert!(after.result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_rejected() {
        let s = store();
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        s.transition(&op.id, OperationStatus::Completed, TransitionPatch::default())
            .await
            .unwrap();
        let err = s.cancel(&op.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AsyncCannotCancel);
    }

    #[tokio::test]
    async fn test_owner_scoping() {
        let s = store();
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        assert!(s.get(&op.id, Some("u-1")).await.is_ok());
        let err = s.get(&op.id, Some("u-2")).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AsyncOperationNotFound);
    }

    #[tokio::test]
    async fn test_list_pagination_stable_order() {
        let s = store();
        for _ in 0..5 {
            s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        }
        s.create("urn:acme:forrst:fn:report", "1.0.0", "u-2").await;

        let (page1, cursor) = s
            .list("u-1", OperationFilter::default(), 2, None)
            .await
            .unwrap();
        assert_eq!(page1.len(), 2);
        let cursor = cursor.expect("more pages remain");

        let (page2, _) = s
            .list("u-1", OperationFilter::default(), 2, Some(&cursor))
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);

        // Pages are disjoint and strictly descending.
        let mut all: Vec<_> = page1.iter().chain(page2.iter()).collect();
        let ids: std::collections::HashSet<_> = all.iter().map(|op| &op.id).collect();
        assert_eq!(ids.len(), 4);
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        assert!(all
            .windows(2)
            .all(|w| (w[0].created_at, &w[0].id) >= (w[1].created_at, &w[1].id)));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let s = store();
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        s.create("urn:acme:forrst:fn:export", "1.0.0", "u-1").await;
        s.transition(&op.id, OperationStatus::Processing, TransitionPatch::default())
            .await
            .unwrap();

        let (only_processing, _) = s
            .list(
                "u-1",
                OperationFilter {
                    status: Some(OperationStatus::Processing),
                    function: None,
                },
                10,
                None,
            )
            .await
            .unwrap();
        assert_eq!(only_processing.len(), 1);
        assert_eq!(only_processing[0].id, op.id);
    }

    #[tokio::test]
    async fn test_expired_operations_behave_as_missing() {
        let s = MemoryOperationStore::new(Duration::from_millis(0));
        let op = s.create("urn:acme:forrst:fn:report", "1.0.0", "u-1").await;
        let err = s.get(&op.id, None).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AsyncOperationNotFound);
        assert_eq!(s.sweep(), 1);
    }

    #[test]
    fn test_operation_ids_are_sortable_and_unique() {
        let a = new_operation_id();
        let b = new_operation_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    }
}
