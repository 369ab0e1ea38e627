#![forbid(unsafe_code)]

use envrun_core::{LogScope, LogStream};
use envrun_storage::SqliteStore;

#[test]
fn cursor_pages_are_strictly_increasing_and_scoped() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut store = SqliteStore::open(dir.path()).expect("open store");
    let run = LogScope::Run("r1".to_string());
    let build = LogScope::Build("r1".to_string());

    for i in 0..5 {
        store
            .log_append(&run, LogStream::Stdout, &format!("line {i}"), 1_000 + i)
            .expect("append run");
        store
            .log_append(&build, LogStream::Stderr, &format!("build {i}"), 1_000 + i)
            .expect("append build");
    }

    let first = store.logs_list(&run, 0, 2).expect("page 1");
    assert_eq!(first.entries.len(), 2);
    assert!(first.has_more);
    assert_eq!(first.entries[0].message, "line 0");
    let cursor = first.next_after_id.expect("cursor");
    assert_eq!(cursor, first.entries[1].id);

    let second = store.logs_list(&run, cursor, 10).expect("page 2");
    let messages: Vec<_> = second.entries.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    assert!(!second.has_more);
    assert!(second.entries.iter().all(|e| e.id > cursor));
    assert!(second.entries.windows(2).all(|pair| pair[0].id < pair[1].id));
    assert!(second.entries.iter().all(|e| e.stream == LogStream::Stdout));

    let exhausted = store
        .logs_list(&run, second.next_after_id.expect("cursor"), 10)
        .expect("page 3");
    assert!(exhausted.entries.is_empty());
    assert_eq!(exhausted.next_after_id, None);

    let build_page = store.logs_list(&build, 0, 100).expect("build logs");
    assert_eq!(build_page.entries.len(), 5);
    assert!(build_page.entries.iter().all(|e| e.stream == LogStream::Stderr));

    assert!(store.logs_list(&run, -1, 10).is_err());
}
