//! Integration tests for live fan-out over real sessions
//!
//! Subscribers attached to a session's broadcaster see appended events
//! exactly once, in file order, and a terminal exit record when the child
//! goes away.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;
use vibetunnel::live::{Broadcaster, LiveEvent};
use vibetunnel::session::{stream_out_path, CreateSession, SessionManager};
use vibetunnel::stream::StreamEvent;

fn create_request(command: &[&str]) -> CreateSession {
    CreateSession {
        command: command.iter().map(|s| s.to_string()).collect(),
        working_dir: "/tmp".to_string(),
        name: None,
        cols: Some(80),
        rows: Some(24),
        term: None,
    }
}

async fn collect_output_until_exit(
    mut rx: tokio::sync::mpsc::Receiver<LiveEvent>,
) -> (String, Option<i32>) {
    let mut output = String::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("fanout stalled")
            .expect("fanout closed without exit record");
        match event {
            LiveEvent::Event(StreamEvent::Output { data, .. }) => output.push_str(&data),
            LiveEvent::Event(_) => {}
            LiveEvent::Exit { code } => return (output, code),
        }
    }
}

#[tokio::test]
async fn test_two_subscribers_see_same_output_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Broadcaster::new();
    let manager =
        SessionManager::new(dir.path().to_path_buf(), broadcaster.clone()).unwrap();

    let info = manager.create(create_request(&["cat"])).await.unwrap();
    let stream_path = stream_out_path(&manager.session_dir(&info.session_id));

    let rx_a = broadcaster
        .subscribe(&info.session_id, stream_path.clone(), None)
        .await;
    let rx_b = broadcaster
        .subscribe(&info.session_id, stream_path.clone(), None)
        .await;

    // Feed input after both subscribers are attached; both must see the
    // echo in the same relative order.
    manager.send_input(&info.session_id, "X marks\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.send_input(&info.session_id, "the spot\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.kill(&info.session_id).await.unwrap();

    let (out_a, _) = collect_output_until_exit(rx_a).await;
    let (out_b, _) = collect_output_until_exit(rx_b).await;

    assert!(out_a.contains('X'), "subscriber A missed output: {out_a:?}");
    assert_eq!(out_a, out_b, "subscribers must observe identical order");
    let x = out_a.find('X').unwrap();
    let spot = out_a.find("spot").unwrap();
    assert!(x < spot, "events must arrive in stream order");
}

#[tokio::test]
async fn test_exit_record_carries_code() {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Broadcaster::new();
    let manager =
        SessionManager::new(dir.path().to_path_buf(), broadcaster.clone()).unwrap();

    let info = manager
        .create(create_request(&["sh", "-c", "printf done; exit 5"]))
        .await
        .unwrap();
    let stream_path = stream_out_path(&manager.session_dir(&info.session_id));
    let rx = broadcaster
        .subscribe(&info.session_id, stream_path, None)
        .await;
    // Same re-check the HTTP handlers perform: the child may already be
    // gone by the time the subscription lands.
    let entry = manager.get(&info.session_id).await.unwrap();
    if entry.info.status == vibetunnel::session::SessionStatus::Exited {
        broadcaster
            .notify_exit(&info.session_id, entry.info.exit_code)
            .await;
    }

    let (output, code) = collect_output_until_exit(rx).await;
    assert!(output.contains("done"));
    assert_eq!(code, Some(5));
}

#[tokio::test]
async fn test_late_subscriber_to_exited_session_gets_history_and_end() {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Broadcaster::new();
    let manager =
        SessionManager::new(dir.path().to_path_buf(), broadcaster.clone()).unwrap();

    let info = manager
        .create(create_request(&["sh", "-c", "printf lasting"]))
        .await
        .unwrap();

    // Wait for the session to finish before anyone subscribes.
    for _ in 0..100 {
        let entry = manager.get(&info.session_id).await.unwrap();
        if entry.info.status == vibetunnel::session::SessionStatus::Exited {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let entry = manager.get(&info.session_id).await.unwrap();
    let stream_path = stream_out_path(&manager.session_dir(&info.session_id));
    let rx = broadcaster
        .subscribe(
            &info.session_id,
            stream_path,
            Some(entry.info.exit_code),
        )
        .await;

    let (output, code) = collect_output_until_exit(rx).await;
    assert!(output.contains("lasting"));
    assert_eq!(code, Some(0));
}

#[tokio::test]
async fn test_dropped_subscriber_does_not_stall_session() {
    let dir = tempfile::tempdir().unwrap();
    let broadcaster = Broadcaster::new();
    let manager: Arc<SessionManager> =
        SessionManager::new(dir.path().to_path_buf(), broadcaster.clone()).unwrap();

    let info = manager.create(create_request(&["cat"])).await.unwrap();
    let stream_path = stream_out_path(&manager.session_dir(&info.session_id));

    let rx_gone = broadcaster
        .subscribe(&info.session_id, stream_path.clone(), None)
        .await;
    drop(rx_gone);

    let rx_live = broadcaster
        .subscribe(&info.session_id, stream_path, None)
        .await;
    manager.send_input(&info.session_id, "still here\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.kill(&info.session_id).await.unwrap();

    let (output, _) = collect_output_until_exit(rx_live).await;
    assert!(output.contains("still here"));
}
