//! Replica-set preflight.
//!
//! Change streams only exist on replica sets, so before syncing we check
//! that the local `mongod` is a PRIMARY member of an initiated set, that the
//! connection string names the set, and that a change stream can actually
//! be opened. Each failure comes with the steps to fix it.
//!
//! The checks ([`check_replica_set`]) and the verdict ([`assess`]) are
//! separate so the decision table can be tested without a server.

use crate::config::{uri_has_replica_set, ConnectionConfig};
use crate::metrics;
use crate::mongo::{command_code, APP_NAME};
use mongodb::bson::{doc, Document};
use mongodb::error::{Error as MongoError, ErrorKind};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const NO_REPLICATION_ENABLED: i32 = 76;
const NOT_YET_INITIALIZED: i32 = 94;
/// `replSetGetStatus.myState` for a primary.
const STATE_PRIMARY: i32 = 1;
const SCRATCH_COLLECTION: &str = "_bisync_preflight";
const DEFAULT_SET_NAME: &str = "rs0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightStatus {
    Ok,
    /// `mongod` runs standalone.
    ReplicationDisabled,
    /// `replSetName` is set but `rs.initiate()` never ran.
    NotInitialized,
    Unreachable,
    /// The status query failed for another reason (auth, permissions).
    StatusQueryFailed,
    NotPrimary,
    MissingReplicaSetParam,
    /// Replica set looks fine but a change stream would not open.
    ChangeStreamUnavailable,
}

impl PreflightStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreflightStatus::Ok => "ok",
            PreflightStatus::ReplicationDisabled => "replication_disabled",
            PreflightStatus::NotInitialized => "not_initialized",
            PreflightStatus::Unreachable => "unreachable",
            PreflightStatus::StatusQueryFailed => "status_query_failed",
            PreflightStatus::NotPrimary => "not_primary",
            PreflightStatus::MissingReplicaSetParam => "missing_replica_set_param",
            PreflightStatus::ChangeStreamUnavailable => "change_stream_unavailable",
        }
    }
}

impl std::fmt::Display for PreflightStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preflight verdict.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub ok: bool,
    pub status: PreflightStatus,
    /// Set name reported by the server, if any.
    pub replica_set: Option<String>,
    pub details: String,
    /// Ordered fix-up steps; empty when `ok`.
    pub remediation: Vec<String>,
}

/// Result of `replSetGetStatus`.
#[derive(Debug, Clone, PartialEq)]
pub enum MemberStatus {
    Member { set: String, my_state: i32 },
    NoReplication(String),
    NotInitialized(String),
    Unreachable(String),
    Failed(String),
}

/// Everything [`assess`] needs.
#[derive(Debug, Clone)]
pub struct Observation {
    /// First host of the connection string, `host:port`.
    pub host: String,
    pub uri_has_replica_set: bool,
    pub status: MemberStatus,
    /// `None` when not attempted.
    pub change_stream: Option<Result<(), String>>,
}

fn initiate_step(host: &str, set: &str) -> String {
    format!(
        "Initiate the set once: mongosh --eval 'rs.initiate({{_id: \"{}\", members: [{{_id: 0, host: \"{}\"}}]}})'",
        set, host
    )
}

fn uri_step(set: &str) -> String {
    format!(
        "Add replicaSet={} to LOCAL_MONGODB_URI, e.g. mongodb://localhost:27017/<db>?replicaSet={}",
        set, set
    )
}

/// Decide the verdict from what the checks saw.
pub fn assess(seen: &Observation) -> PreflightReport {
    let fail = |status, replica_set: Option<String>, details: String, remediation: Vec<String>| {
        PreflightReport {
            ok: false,
            status,
            replica_set,
            details,
            remediation,
        }
    };

    let (set, my_state) = match seen.status {
        MemberStatus::Member { ref set, my_state } => (set.clone(), my_state),
        MemberStatus::NoReplication(ref message) => {
            return fail(
                PreflightStatus::ReplicationDisabled,
                None,
                format!("Replication is not enabled on {}: {}", seen.host, message),
                vec![
                    "Enable replication on the local mongod (the `replication:` section of \
                     mongod.conf, or --replSet on the command line)"
                        .to_string(),
                    format!("Set a replica-set name, e.g. `replSetName: {}`", DEFAULT_SET_NAME),
                    "Restart mongod".to_string(),
                    initiate_step(&seen.host, DEFAULT_SET_NAME),
                    uri_step(DEFAULT_SET_NAME),
                ],
            );
        }
        MemberStatus::NotInitialized(ref message) => {
            return fail(
                PreflightStatus::NotInitialized,
                None,
                format!("Replica set on {} is not initiated: {}", seen.host, message),
                vec![
                    initiate_step(&seen.host, "<replSetName from mongod.conf>"),
                    "Wait for the member to report PRIMARY (rs.status())".to_string(),
                ],
            );
        }
        MemberStatus::Unreachable(ref message) => {
            return fail(
                PreflightStatus::Unreachable,
                None,
                format!("Could not reach {}: {}", seen.host, message),
                vec![
                    "Check that mongod is running and listening on the configured host and port"
                        .to_string(),
                    "Check LOCAL_MONGODB_URI".to_string(),
                ],
            );
        }
        MemberStatus::Failed(ref message) => {
            return fail(
                PreflightStatus::StatusQueryFailed,
                None,
                format!("replSetGetStatus failed on {}: {}", seen.host, message),
                vec![
                    "Check the credentials in LOCAL_MONGODB_URI; the user needs the clusterMonitor role"
                        .to_string(),
                ],
            );
        }
    };

    if my_state != STATE_PRIMARY {
        return fail(
            PreflightStatus::NotPrimary,
            Some(set),
            format!("{} is not PRIMARY (myState={})", seen.host, my_state),
            vec![
                "Point LOCAL_MONGODB_URI at the primary, or wait for the election to finish"
                    .to_string(),
            ],
        );
    }

    if !seen.uri_has_replica_set {
        return fail(
            PreflightStatus::MissingReplicaSetParam,
            Some(set.clone()),
            format!(
                "Replica set '{}' is running but the connection string has no replicaSet parameter",
                set
            ),
            vec![uri_step(&set)],
        );
    }

    match seen.change_stream {
        Some(Err(ref message)) => fail(
            PreflightStatus::ChangeStreamUnavailable,
            Some(set),
            format!("Replica set is configured but a change stream failed to open: {}", message),
            vec![
                "Check that the storage engine is WiredTiger and the server is 3.6 or newer"
                    .to_string(),
                "Check that the user may run changeStream on the sync database".to_string(),
            ],
        ),
        _ => PreflightReport {
            ok: true,
            status: PreflightStatus::Ok,
            details: format!("Replica set '{}' is PRIMARY on {}", set, seen.host),
            replica_set: Some(set),
            remediation: Vec::new(),
        },
    }
}

fn classify_status_error(e: &MongoError) -> MemberStatus {
    match command_code(e) {
        Some(NO_REPLICATION_ENABLED) => MemberStatus::NoReplication(e.to_string()),
        Some(NOT_YET_INITIALIZED) => MemberStatus::NotInitialized(e.to_string()),
        Some(_) => MemberStatus::Failed(e.to_string()),
        None => match *e.kind {
            ErrorKind::ServerSelection { .. } | ErrorKind::Io(_) | ErrorKind::DnsResolve { .. } => {
                MemberStatus::Unreachable(e.to_string())
            }
            _ => MemberStatus::Failed(e.to_string()),
        },
    }
}

fn parse_status(reply: &Document) -> MemberStatus {
    let set = reply.get_str("set").unwrap_or_default().to_string();
    let my_state = reply
        .get_i32("myState")
        .or_else(|_| reply.get_i64("myState").map(|v| v as i32))
        .unwrap_or(0);
    MemberStatus::Member { set, my_state }
}

/// Check that the database at `uri` can serve change streams.
///
/// Never returns an error: every failure is a report.
pub async fn check_replica_set(uri: &str, connection: &ConnectionConfig) -> PreflightReport {
    let report = match observe(uri, connection).await {
        Ok(seen) => assess(&seen),
        Err(message) => PreflightReport {
            ok: false,
            status: PreflightStatus::Unreachable,
            replica_set: None,
            details: message,
            remediation: vec!["Check LOCAL_MONGODB_URI".to_string()],
        },
    };

    metrics::record_preflight(report.status.as_str(), report.ok);
    if report.ok {
        info!(replica_set = ?report.replica_set, "Replica-set preflight passed");
    } else {
        warn!(status = %report.status, details = %report.details, "Replica-set preflight failed");
    }
    report
}

async fn observe(uri: &str, connection: &ConnectionConfig) -> Result<Observation, String> {
    let mut options = ClientOptions::parse(uri)
        .await
        .map_err(|e| format!("invalid connection string: {}", e))?;

    // Talk to exactly this member, without set discovery.
    options.hosts.truncate(1);
    options.direct_connection = Some(true);
    options.repl_set_name = None;
    options.connect_timeout = Some(connection.connect_timeout_duration());
    options.server_selection_timeout = Some(connection.server_selection_timeout_duration());
    options.app_name = Some(APP_NAME.to_string());

    let host = options
        .hosts
        .first()
        .map(|h| h.to_string())
        .unwrap_or_else(|| "localhost:27017".to_string());
    let database = options
        .default_database
        .clone()
        .unwrap_or_else(|| "test".to_string());

    let client = Client::with_options(options).map_err(|e| e.to_string())?;

    debug!(%host, "Querying replica-set status");
    let status = match client
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 })
        .await
    {
        Ok(reply) => parse_status(&reply),
        Err(e) => classify_status_error(&e),
    };

    let change_stream = match status {
        MemberStatus::Member { my_state, .. } if my_state == STATE_PRIMARY => {
            let limit = connection.stream_open_timeout_duration();
            Some(open_scratch_stream(&client, &database, limit).await)
        }
        _ => None,
    };

    client.shutdown().await;

    Ok(Observation {
        host,
        uri_has_replica_set: uri_has_replica_set(uri),
        status,
        change_stream,
    })
}

async fn open_scratch_stream(
    client: &Client,
    database: &str,
    limit: Duration,
) -> Result<(), String> {
    let collection = client
        .database(database)
        .collection::<Document>(SCRATCH_COLLECTION);
    match timeout(limit, async { collection.watch().await }).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(())
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(status: MemberStatus) -> Observation {
        Observation {
            host: "localhost:27017".to_string(),
            uri_has_replica_set: true,
            status,
            change_stream: Some(Ok(())),
        }
    }

    fn primary() -> MemberStatus {
        MemberStatus::Member {
            set: "rs0".to_string(),
            my_state: STATE_PRIMARY,
        }
    }

    #[test]
    fn test_healthy_primary_is_ok() {
        let report = assess(&observed(primary()));
        assert!(report.ok);
        assert_eq!(report.status, PreflightStatus::Ok);
        assert_eq!(report.replica_set.as_deref(), Some("rs0"));
        assert!(report.remediation.is_empty());
    }

    #[test]
    fn test_standalone_has_full_remediation() {
        let report = assess(&observed(MemberStatus::NoReplication(
            "not running with --replSet".into(),
        )));
        assert!(!report.ok);
        assert_eq!(report.status, PreflightStatus::ReplicationDisabled);
        assert_eq!(report.remediation.len(), 5);
        let all = report.remediation.join("\n");
        assert!(all.contains("replSetName"));
        assert!(all.contains("Restart mongod"));
        assert!(all.contains("rs.initiate"));
        assert!(all.contains("replicaSet=rs0"));
        assert!(all.contains("localhost:27017"));
    }

    #[test]
    fn test_uninitiated_set() {
        let report = assess(&observed(MemberStatus::NotInitialized("no replset config".into())));
        assert_eq!(report.status, PreflightStatus::NotInitialized);
        assert!(report.remediation[0].contains("rs.initiate"));
    }

    #[test]
    fn test_unreachable_and_query_failures() {
        let report = assess(&observed(MemberStatus::Unreachable("connection refused".into())));
        assert_eq!(report.status, PreflightStatus::Unreachable);
        assert!(report.details.contains("connection refused"));

        let report = assess(&observed(MemberStatus::Failed("unauthorized".into())));
        assert_eq!(report.status, PreflightStatus::StatusQueryFailed);
        assert!(!report.remediation.is_empty());
    }

    #[test]
    fn test_secondary_is_not_primary() {
        let report = assess(&observed(MemberStatus::Member {
            set: "rs0".into(),
            my_state: 2,
        }));
        assert_eq!(report.status, PreflightStatus::NotPrimary);
        assert!(report.details.contains("myState=2"));
    }

    #[test]
    fn test_missing_replica_set_param_names_the_set() {
        let mut p = observed(MemberStatus::Member {
            set: "pos".into(),
            my_state: STATE_PRIMARY,
        });
        p.uri_has_replica_set = false;

        let report = assess(&p);
        assert_eq!(report.status, PreflightStatus::MissingReplicaSetParam);
        assert!(report.remediation[0].contains("replicaSet=pos"));
    }

    #[test]
    fn test_change_stream_failure_is_distinct() {
        let mut p = observed(primary());
        p.change_stream = Some(Err("not authorized".into()));

        let report = assess(&p);
        assert!(!report.ok);
        assert_eq!(report.status, PreflightStatus::ChangeStreamUnavailable);
        assert_eq!(report.replica_set.as_deref(), Some("rs0"));
    }

    #[test]
    fn test_parse_status_reply() {
        let reply = doc! { "set": "rs0", "myState": 1, "ok": 1.0 };
        assert_eq!(parse_status(&reply), primary());

        let reply = doc! { "set": "rs0", "myState": 2i64 };
        assert_eq!(
            parse_status(&reply),
            MemberStatus::Member {
                set: "rs0".into(),
                my_state: 2
            }
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&PreflightStatus::MissingReplicaSetParam).unwrap();
        assert_eq!(json, "\"missing_replica_set_param\"");
        assert_eq!(PreflightStatus::Ok.to_string(), "ok");
    }

    #[tokio::test]
    async fn test_invalid_uri_is_a_report() {
        let report = check_replica_set("not-a-uri", &ConnectionConfig::default()).await;
        assert!(!report.ok);
        assert_eq!(report.status, PreflightStatus::Unreachable);
        assert!(report.details.contains("invalid connection string"));
    }
}
