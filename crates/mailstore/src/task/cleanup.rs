//! Retention sweep over weekly upload buckets

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::TryStreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{Task, TaskOutcome, TaskType};
use crate::bucket::{BucketNameGenerator, UploadBucketName};
use crate::error::{Result, StoreError};
use crate::repository::Repositories;
use crate::storage::{BlobStore, MetadataStore};

pub const CLEANUP_TASK_TYPE: &str = "upload-repository-cleanup";

/// Which upload buckets a sweep removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupScope {
    /// Buckets whose window ended before the retention cutoff
    Expired,
    /// Every upload bucket
    All,
}

impl CleanupScope {
    /// Parse a scope parameter, ignoring case
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("expired") => Ok(CleanupScope::Expired),
            Some("all") => Ok(CleanupScope::All),
            _ => Err(StoreError::invalid("'scope' is missing or invalid")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupScope::Expired => "expired",
            CleanupScope::All => "all",
        }
    }
}

impl fmt::Display for CleanupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a sweep, exposed as the task's additional information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub scope: CleanupScope,
    /// When the sweep was created
    pub timestamp: DateTime<Utc>,
    pub deleted_buckets: u64,
    pub failed_buckets: u64,
    /// Upload buckets the scope kept
    pub skipped_buckets: u64,
}

/// Deletes expired (or all) upload buckets, blob data first, then rows
pub struct RetentionCleanupTask {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    buckets: BucketNameGenerator,
    retention: Duration,
    report: Mutex<CleanupReport>,
}

impl RetentionCleanupTask {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        buckets: BucketNameGenerator,
        scope: CleanupScope,
        retention: Duration,
    ) -> Self {
        let report = CleanupReport {
            scope,
            timestamp: buckets.now(),
            deleted_buckets: 0,
            failed_buckets: 0,
            skipped_buckets: 0,
        };
        Self {
            blobs,
            metadata,
            buckets,
            retention,
            report: Mutex::new(report),
        }
    }

    pub fn for_repositories(
        repositories: &Repositories,
        scope: CleanupScope,
        retention: Duration,
    ) -> Self {
        Self::new(
            repositories.blobs.clone(),
            repositories.metadata.clone(),
            repositories.buckets.clone(),
            scope,
            retention,
        )
    }

    pub fn scope(&self) -> CleanupScope {
        self.snapshot().scope
    }

    /// Copy of the counters so far
    pub fn snapshot(&self) -> CleanupReport {
        match self.report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, update: impl FnOnce(&mut CleanupReport)) {
        match self.report.lock() {
            Ok(mut report) => update(&mut report),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    /// Run one sweep
    ///
    /// A bucket failure is logged and counted; the sweep moves on to the next
    /// bucket. Cancellation is honored between buckets.
    pub async fn sweep(&self, cancel: &CancellationToken) -> TaskOutcome {
        let scope = self.scope();
        let now = self.buckets.now();
        let cutoff = now
            .checked_sub_signed(self.retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        info!("Starting {} upload cleanup (cutoff {})", scope, cutoff);

        let candidates = match self.upload_buckets().await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("Failed to enumerate upload buckets: {}", e);
                return TaskOutcome::Failed;
            }
        };

        for bucket in candidates {
            if cancel.is_cancelled() {
                info!("Upload cleanup cancelled before {}", bucket.label());
                return TaskOutcome::Cancelled;
            }

            if !selects(scope, &bucket, cutoff) {
                debug!("Keeping upload bucket {}", bucket.label());
                self.record(|r| r.skipped_buckets += 1);
                continue;
            }

            match self.delete_bucket(&bucket).await {
                Ok(rows) => {
                    info!("Deleted upload bucket {} ({} rows)", bucket.label(), rows);
                    self.record(|r| r.deleted_buckets += 1);
                }
                Err(e) => {
                    warn!("Failed to delete upload bucket {}: {}", bucket.label(), e);
                    self.record(|r| r.failed_buckets += 1);
                }
            }
        }

        let report = self.snapshot();
        info!(
            "Upload cleanup finished: {} deleted, {} failed, {} kept",
            report.deleted_buckets, report.failed_buckets, report.skipped_buckets
        );
        if report.failed_buckets > 0 {
            TaskOutcome::Failed
        } else {
            TaskOutcome::Completed
        }
    }

    /// Upload buckets known to either store, oldest first
    ///
    /// Rows whose blob bucket is already gone (an interrupted earlier sweep)
    /// still show up through the metadata side.
    async fn upload_buckets(&self) -> Result<BTreeSet<UploadBucketName>> {
        let mut names: Vec<_> = self.blobs.list_buckets().try_collect().await?;
        names.extend(self.metadata.list_upload_buckets().await?);

        Ok(names
            .iter()
            .filter_map(|name| UploadBucketName::parse(name.as_str()))
            .collect())
    }

    async fn delete_bucket(&self, bucket: &UploadBucketName) -> Result<u64> {
        let name = bucket.as_bucket_name();
        self.blobs.delete_bucket(&name).await?;
        self.metadata.delete_upload_bucket(&name).await
    }
}

fn selects(scope: CleanupScope, bucket: &UploadBucketName, cutoff: DateTime<Utc>) -> bool {
    match scope {
        CleanupScope::All => true,
        CleanupScope::Expired => bucket.window_end() <= cutoff,
    }
}

#[async_trait]
impl Task for RetentionCleanupTask {
    fn task_type(&self) -> TaskType {
        TaskType::new(CLEANUP_TASK_TYPE)
    }

    async fn run(&self, cancel: CancellationToken) -> TaskOutcome {
        self.sweep(&cancel).await
    }

    fn additional_information(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.snapshot()).ok()
    }
}
