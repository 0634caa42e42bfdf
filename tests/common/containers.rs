// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for MongoDB.
//!
//! Change streams need a replica set, so every container is started with
//! `--replSet` and initiated as a single-member set before use.

use mongodb::bson::{doc, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use std::time::{Duration, Instant};
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const REPLICA_SET: &str = "rs0";
pub const TEST_DB: &str = "bisync_test";

/// Plain `mongod`, no replication.
pub fn standalone_container(docker: &Cli) -> Container<'_, GenericImage> {
    docker.run(mongo_image())
}

/// `mongod --replSet rs0`, not yet initiated.
pub fn replica_set_container(docker: &Cli) -> Container<'_, GenericImage> {
    let args = vec![
        "--replSet".to_string(),
        REPLICA_SET.to_string(),
        "--bind_ip_all".to_string(),
    ];
    docker.run((mongo_image(), args))
}

fn mongo_image() -> GenericImage {
    GenericImage::new("mongo", "7.0")
        .with_exposed_port(27017)
        .with_wait_for(WaitFor::message_on_stdout("Waiting for connections"))
}

pub fn host_port(container: &Container<'_, GenericImage>) -> u16 {
    container.get_host_port_ipv4(27017)
}

/// URI for a standalone container (no replica-set parameter).
pub fn standalone_uri(container: &Container<'_, GenericImage>) -> String {
    format!("mongodb://127.0.0.1:{}/{}", host_port(container), TEST_DB)
}

/// URI for an initiated single-member set reached through the mapped port.
///
/// The member advertises its in-container address, so discovery is turned
/// off with `directConnection`.
pub fn replica_set_uri(container: &Container<'_, GenericImage>) -> String {
    format!(
        "mongodb://127.0.0.1:{}/{}?replicaSet={}&directConnection=true",
        host_port(container),
        TEST_DB,
        REPLICA_SET
    )
}

async fn direct_client(port: u16) -> Client {
    let options = ClientOptions::parse(format!(
        "mongodb://127.0.0.1:{}/?directConnection=true",
        port
    ))
    .await
    .expect("parse direct URI");
    Client::with_options(options).expect("client")
}

/// Run `replSetInitiate` and wait for the member to become PRIMARY.
pub async fn initiate_replica_set(container: &Container<'_, GenericImage>) {
    let client = direct_client(host_port(container)).await;
    let admin = client.database("admin");

    let config = doc! {
        "_id": REPLICA_SET,
        "members": [{ "_id": 0, "host": "localhost:27017" }],
    };
    admin
        .run_command(doc! { "replSetInitiate": config })
        .await
        .expect("replSetInitiate");

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let hello: Document = admin
            .run_command(doc! { "hello": 1 })
            .await
            .expect("hello");
        if hello.get_bool("isWritablePrimary").unwrap_or(false) {
            break;
        }
        assert!(Instant::now() < deadline, "replica set never became PRIMARY");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// A started and initiated single-member replica set.
pub struct TestReplicaSet<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub uri: String,
}

impl<'a> TestReplicaSet<'a> {
    pub async fn start(docker: &'a Cli) -> TestReplicaSet<'a> {
        let container = replica_set_container(docker);
        initiate_replica_set(&container).await;
        let uri = replica_set_uri(&container);
        Self { container, uri }
    }

    /// Client for seeding and inspecting data.
    pub async fn client(&self) -> Client {
        Client::with_options(ClientOptions::parse(&self.uri).await.expect("parse URI"))
            .expect("client")
    }

    pub async fn db(&self) -> mongodb::Database {
        self.client().await.database(TEST_DB)
    }
}
