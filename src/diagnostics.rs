//! End-to-end round-trip check.
//!
//! Writes a marker document on the local side, waits for it to show up on
//! the remote side, then deletes it from both. Something (an in-process
//! coordinator or a separately running one) must be syncing for the check
//! to succeed.

use crate::error::Result;
use crate::metrics;
use crate::store::DocumentStore;
use mongodb::bson::{doc, Bson, DateTime};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct RoundtripReport {
    pub success: bool,
    pub collection: String,
    pub marker_id: String,
    /// Local write to remote visibility.
    pub latency_ms: Option<u64>,
    /// Marker removed from both sides afterwards.
    pub cleaned_up: bool,
    pub error: Option<String>,
}

/// Run the check against `collection`, waiting at most `wait` for the
/// marker to arrive remotely.
pub async fn roundtrip<S: DocumentStore>(
    local: &S,
    remote: &S,
    collection: &str,
    wait: Duration,
) -> RoundtripReport {
    let marker_id = format!("bisync-roundtrip-{}", uuid::Uuid::new_v4());
    let mut report = RoundtripReport {
        success: false,
        collection: collection.to_string(),
        marker_id: marker_id.clone(),
        latency_ms: None,
        cleaned_up: false,
        error: None,
    };
    let id = Bson::String(marker_id.clone());
    let marker = doc! {
        "_id": &marker_id,
        "kind": "bisync_roundtrip",
        "writtenAt": DateTime::from_millis(chrono::Utc::now().timestamp_millis()),
    };

    info!(
        %collection,
        marker = %marker_id,
        wait_ms = wait.as_millis() as u64,
        "Starting round-trip check"
    );

    let started = Instant::now();
    match local.insert_if_absent(collection, marker).await {
        Ok(_) => match wait_for(remote, collection, &id, wait).await {
            Ok(true) => {
                let latency = started.elapsed();
                report.success = true;
                report.latency_ms = Some(latency.as_millis() as u64);
                metrics::record_roundtrip(true, latency);
                info!(latency_ms = latency.as_millis() as u64, "Marker arrived remotely");
            }
            Ok(false) => {
                metrics::record_roundtrip(false, started.elapsed());
                report.error = Some(format!(
                    "marker not seen remotely within {}ms",
                    wait.as_millis()
                ));
            }
            Err(e) => {
                metrics::record_roundtrip(false, started.elapsed());
                report.error = Some(e.to_string());
            }
        },
        Err(e) => {
            report.error = Some(format!("local write failed: {}", e));
        }
    }

    report.cleaned_up = cleanup(local, remote, collection, &id).await;
    if let Some(ref error) = report.error {
        warn!(%collection, marker = %marker_id, %error, "Round-trip check failed");
    }
    report
}

async fn wait_for<S: DocumentStore>(
    store: &S,
    collection: &str,
    id: &Bson,
    wait: Duration,
) -> Result<bool> {
    let deadline = Instant::now() + wait;
    loop {
        if store.find_by_id(collection, id).await?.is_some() {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn cleanup<S: DocumentStore>(local: &S, remote: &S, collection: &str, id: &Bson) -> bool {
    let mut clean = true;
    for store in [local, remote] {
        if let Err(e) = store.delete_by_id(collection, id).await {
            warn!(side = %store.side(), error = %e, "Failed to delete round-trip marker");
            clean = false;
        }
    }
    clean
}
