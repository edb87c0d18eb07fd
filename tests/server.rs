use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use platter::config::{DiscoveryConfig, ProgramsConfig};
use platter::sync::apply_patch;
use platter::{Client, Fleet, Options, Scheduler, Server, StreamMessage, SubmitTask, Synchronizer};


async fn start(resources: &[&str]) -> (String, Arc<Synchronizer>) {
    let sync = Arc::new(Synchronizer::new());
    let programs = ProgramsConfig {
        badblocks: "sh -c 'sleep 0.2'".to_string(),
        ..ProgramsConfig::default()
    };
    let scheduler = Scheduler::spawn(
        Fleet::new(resources.iter().copied()),
        programs,
        sync.clone()
    );
    scheduler.resources().await.unwrap();
    let discovery = DiscoveryConfig { enabled: false, ..DiscoveryConfig::default() };
    let server = Arc::new(Server::new(scheduler, sync.clone(), discovery));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(platter::serve(server, listener));
    (format!("http://{}", addr), sync)
}


async fn next_line(response: &mut reqwest::Response, buf: &mut Vec<u8>) -> Value {
    let read = async {
        loop {
            if let Some(end) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=end).collect();
                return serde_json::from_slice(&line).unwrap();
            }
            let chunk = response.chunk().await.unwrap().expect("stream ended");
            buf.extend_from_slice(&chunk);
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read).await.unwrap()
}


#[tokio::test]
async fn stream_sends_snapshot_line_then_patch_lines() {
    let (url, _sync) = start(&["/dev/sda"]).await;

    let mut response = reqwest::get(format!("{}/api/v1/stream", url)).await.unwrap();
    assert!(response.status().is_success());
    let mut buf = vec![];

    let snapshot = next_line(&mut response, &mut buf).await;
    assert!(snapshot.is_object());
    assert_eq!(snapshot["resources"][0]["name"], "/dev/sda");
    assert_eq!(snapshot["tasks"], Value::Array(vec![]));
    assert_eq!(snapshot["externalSystem"]["available"], false);

    let client = Client::new(url);
    client.submit(&SubmitTask::new("sda", "badblocks", Options::new())).await.unwrap();

    let patch = next_line(&mut response, &mut buf).await;
    let ops = patch.as_array().unwrap();
    assert!(!ops.is_empty());
    assert!(ops.iter().all(|op| op["op"] == "replace" && op["path"].is_string()));
}


#[tokio::test]
async fn watching_client_tracks_the_live_state() {
    let (url, sync) = start(&["/dev/sda"]).await;
    let client = Client::new(url);

    let mut messages = client.watch().await.unwrap();
    let mut doc = match messages.next().await {
        Some(Ok(StreamMessage::Snapshot(snapshot))) => snapshot,
        other => panic!("expected a snapshot, got {:?}", other),
    };

    let id = client.submit(&SubmitTask::new("/dev/sda", "badblocks", Options::new()))
        .await.unwrap();

    let follow = async {
        while let Some(message) = messages.next().await {
            match message.unwrap() {
                StreamMessage::Patch(patch) => assert!(apply_patch(&mut doc, &patch)),
                StreamMessage::Snapshot(_) => panic!("snapshot sent twice"),
            }
            if doc["tasks"][0]["completed"] == true {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), follow).await.unwrap();

    assert_eq!(doc["tasks"][0]["id"], id.to_string());
    assert_eq!(doc, sync.snapshot().await);
}


#[tokio::test]
async fn api_errors_carry_status_and_message() {
    let (url, _sync) = start(&["/dev/sda"]).await;
    let client = Client::new(url);

    match client.task(Uuid::new_v4()).await {
        Err(platter::client::Error::Server { status, message }) => {
            assert_eq!(status, reqwest::StatusCode::NOT_FOUND);
            assert!(message.starts_with("task not found"));
        }
        other => panic!("unexpected {:?}", other),
    }

    match client.submit(&SubmitTask::new("/dev/sda", "shred", Options::new())).await {
        Err(platter::client::Error::Server { status, .. }) => {
            assert_eq!(status, reqwest::StatusCode::BAD_REQUEST);
        }
        other => panic!("unexpected {:?}", other),
    }
}
