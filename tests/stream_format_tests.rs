//! Integration tests for the asciicast stream format
//!
//! Covers the durable-log invariants: header-first layout, append-only
//! growth, monotone timestamps, round-tripping, deferred partial lines and
//! the snapshot clear-screen optimization.

use std::io::Write;
use std::time::Duration;
use vibetunnel::stream::{
    read_events_from, read_header, snapshot, StreamEvent, StreamTail, StreamWriter,
    ASCIICAST_VERSION,
};

fn stream_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("stream-out")
}

#[tokio::test]
async fn test_header_then_events_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);

    let mut env = std::collections::HashMap::new();
    env.insert("TERM".to_string(), "xterm-256color".to_string());
    {
        let mut writer =
            StreamWriter::create(&path, 100, 40, Some("sh -c ls".into()), Some(env)).unwrap();
        writer.append_output("one\r\n").unwrap();
        writer.append_resize(120, 30).unwrap();
        writer.append_output("two\r\n").unwrap();
    }

    let header = read_header(&path).await.unwrap();
    assert_eq!(header.version, ASCIICAST_VERSION);
    assert_eq!(header.width, 100);
    assert_eq!(header.height, 40);
    assert_eq!(header.env.get("TERM").unwrap(), "xterm-256color");

    let (events, _) = read_events_from(&path, 0).await.unwrap();
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], StreamEvent::Output { data, .. } if data == "one\r\n"));
    assert!(
        matches!(events[1], StreamEvent::Resize { cols, rows, .. } if cols == 120 && rows == 30)
    );
    assert!(matches!(&events[2], StreamEvent::Output { data, .. } if data == "two\r\n"));
}

#[tokio::test]
async fn test_append_only_prefix_property() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();

    writer.append_output("alpha").unwrap();
    let before = std::fs::read(&path).unwrap();

    writer.append_output("beta").unwrap();
    writer.append_resize(90, 25).unwrap();
    let after = std::fs::read(&path).unwrap();

    assert!(after.len() > before.len());
    assert_eq!(&after[..before.len()], &before[..], "earlier content must be a byte prefix");
}

#[tokio::test]
async fn test_timestamps_are_monotone() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
    for i in 0..20 {
        writer.append_output(&format!("line {i}")).unwrap();
    }
    writer.append_resize(81, 24).unwrap();

    let (events, _) = read_events_from(&path, 0).await.unwrap();
    assert_eq!(events.len(), 21);
    for pair in events.windows(2) {
        assert!(
            pair[1].time() >= pair[0].time(),
            "timestamps must not decrease: {} then {}",
            pair[0].time(),
            pair[1].time()
        );
    }
}

#[tokio::test]
async fn test_utf8_payload_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    let text = "naïve — ❤ 終わり\r\n";
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output(text).unwrap();
    }
    let (events, _) = read_events_from(&path, 0).await.unwrap();
    assert!(matches!(&events[0], StreamEvent::Output { data, .. } if data == text));
}

#[tokio::test]
async fn test_partial_final_line_is_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output("complete").unwrap();
    }

    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"[9.0,\"o\",\"never finis").unwrap();
    file.flush().unwrap();

    let (events, offset) = read_events_from(&path, 0).await.unwrap();
    assert_eq!(events.len(), 1, "partial line must not be delivered");

    file.write_all(b"hed\"]\n").unwrap();
    file.flush().unwrap();
    let (rest, _) = read_events_from(&path, offset).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert!(matches!(&rest[0], StreamEvent::Output { data, .. } if data == "never finished"));
}

#[tokio::test]
async fn test_restart_from_line_boundary_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output("first").unwrap();
        writer.append_output("second").unwrap();
    }

    let (_, offset_after_all) = read_events_from(&path, 0).await.unwrap();
    let (none_left, _) = read_events_from(&path, offset_after_all).await.unwrap();
    assert!(none_left.is_empty());

    // Restarting from zero yields the same parse.
    let (again, offset_again) = read_events_from(&path, 0).await.unwrap();
    assert_eq!(again.len(), 2);
    assert_eq!(offset_again, offset_after_all);
}

#[tokio::test]
async fn test_tail_delivers_appends_as_they_land() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();

    let mut tail = StreamTail::new(path.clone());
    let reader = tokio::spawn(async move {
        let mut seen = Vec::new();
        while seen.len() < 3 {
            let batch = tail.next_batch().await.unwrap();
            seen.extend(batch);
        }
        seen
    });

    for word in ["red", "green", "blue"] {
        writer.append_output(word).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let seen = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("tail should catch all appends")
        .unwrap();
    let texts: Vec<String> = seen
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Output { data, .. } => Some(data.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["red", "green", "blue"]);
}

#[tokio::test]
async fn test_snapshot_clear_screen_elides_and_rebases() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output("scrolled away").unwrap();
        writer.append_output("also old \u{1b}[H\u{1b}[2J").unwrap();
        writer.append_output("\u{1b}[3J fresh start").unwrap();
        writer.append_output("visible").unwrap();
    }

    let (_, events) = snapshot(&path).await.unwrap();
    // Only events at or after the *last* clear survive.
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].time(), 0.0);
    assert!(matches!(&events[0], StreamEvent::Output { data, .. } if data.contains("fresh start")));
    assert!(matches!(&events[1], StreamEvent::Output { data, .. } if data == "visible"));
}

#[tokio::test]
async fn test_snapshot_without_clear_keeps_everything() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output("a").unwrap();
        writer.append_output("b").unwrap();
    }
    let (header, events) = snapshot(&path).await.unwrap();
    assert_eq!(header.width, 80);
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_foreign_marker_lines_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let path = stream_path(&dir);
    {
        let mut writer = StreamWriter::create(&path, 80, 24, None, None).unwrap();
        writer.append_output("real").unwrap();
    }
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"[\"exit\",0,\"abc\"]\n").unwrap();

    let (events, _) = read_events_from(&path, 0).await.unwrap();
    assert_eq!(events.len(), 1, "non-event lines must be ignored");
}
