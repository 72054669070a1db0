use std::collections::BTreeMap;
use std::time::Duration;

use lxkit::command::{
    CommandContainer, CommandRequest, CommandResult, HookSet, Phase, derive_key,
};
use lxkit::config::ExecuteOptions;
use lxkit::error::{FailureKind, ToolkitError};

fn build(request: impl Into<CommandRequest>) -> std::sync::Arc<CommandContainer> {
    CommandContainer::new(request, ExecuteOptions::default(), HookSet::default())
        .expect("build container")
}

#[test]
fn plain_string_builds_a_leaf() {
    let container = build("echo test_str");
    assert!(!container.has_children());
    assert_eq!(container.command_text(), Some("echo test_str"));
    assert_eq!(container.key(), derive_key("echo test_str"));
    assert_eq!(container.phase(), Phase::New);
    assert!(!container.is_complete());
}

#[test]
fn keyed_request_uses_sanitized_explicit_key() {
    let container = build(CommandRequest::keyed("os release", "cat /etc/os-release"));
    assert_eq!(container.key(), "osrelease");
}

#[test]
fn batch_map_builds_unordered_children() {
    let container = build(CommandRequest::batch([
        ("a", "echo a"),
        ("b", "echo b"),
        ("c", "echo c"),
    ]));
    assert!(container.has_children());
    assert_eq!(container.children().len(), 3);
    let keys: Vec<&str> = container.children().iter().map(|c| c.key()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);
    assert!(container.command_text().is_none());
}

#[test]
fn unkeyed_batch_derives_distinct_keys() {
    let container = build(CommandRequest::batch_of(["echo a", "echo b", "echo c"]));
    assert_eq!(container.children().len(), 3);
    let mut keys: Vec<&str> = container.children().iter().map(|c| c.key()).collect();
    keys.sort_unstable();
    keys.dedup();
    assert_eq!(keys.len(), 3);

    // Repeated commands collapse like a set would.
    let container = build(CommandRequest::batch_of(["echo a", "echo a", "echo b"]));
    assert_eq!(container.children().len(), 2);
}

#[test]
fn queue_list_builds_ordered_children() {
    let container = build(vec!["echo one", "echo two", "echo three"]);
    assert!(container.has_children());
    let commands: Vec<Option<&str>> = container
        .children()
        .iter()
        .map(|c| c.command_text())
        .collect();
    assert_eq!(
        commands,
        vec![Some("echo one"), Some("echo two"), Some("echo three")]
    );
}

#[test]
fn single_element_collections_collapse_to_a_leaf() {
    let container = build(vec!["echo only"]);
    assert!(!container.has_children());
    assert_eq!(container.command_text(), Some("echo only"));

    let mut map = BTreeMap::new();
    map.insert("only", "echo only");
    let container = build(CommandRequest::from(map));
    assert!(!container.has_children());
    assert_eq!(container.key(), "only");
}

#[test]
fn empty_command_is_a_data_format_failure() {
    let err = CommandContainer::new("", ExecuteOptions::default(), HookSet::default())
        .expect_err("empty command must not build");
    assert!(matches!(err, ToolkitError::DataFormat(_)));

    let err = CommandContainer::new("   \t  ", ExecuteOptions::default(), HookSet::default())
        .expect_err("whitespace command must not build");
    assert!(matches!(err, ToolkitError::DataFormat(_)));

    let err = CommandContainer::new(
        CommandRequest::Queue(Vec::new()),
        ExecuteOptions::default(),
        HookSet::default(),
    )
    .expect_err("empty queue must not build");
    assert!(matches!(err, ToolkitError::DataFormat(_)));
}

#[test]
fn nested_trees_build_recursively() {
    let inner = CommandRequest::queue(["echo first", "echo second"]);
    let mut map: BTreeMap<String, CommandRequest> = BTreeMap::new();
    map.insert("steps".to_string(), inner);
    map.insert("probe".to_string(), CommandRequest::from("uptime"));

    let container = build(CommandRequest::Batch(map));
    assert_eq!(container.children().len(), 2);
    let steps = container
        .children()
        .iter()
        .find(|c| c.has_children())
        .expect("nested queue child");
    assert_eq!(steps.children().len(), 2);
}

#[test]
fn prebuilt_containers_keep_their_own_options() {
    let special = CommandContainer::new(
        "echo special",
        ExecuteOptions::default()
            .priority(99)
            .timeout(Duration::from_secs(7)),
        HookSet::default(),
    )
    .expect("special container");

    let parent = build(CommandRequest::queue([
        CommandRequest::from("echo plain"),
        CommandRequest::from(special.clone()),
    ]));
    let adopted = parent
        .children()
        .iter()
        .find(|c| c.command_text() == Some("echo special"))
        .expect("prebuilt child");
    assert_eq!(adopted.options().priority, 99);
    assert_eq!(adopted.options().timeout, Duration::from_secs(7));
}

#[tokio::test]
async fn force_complete_recurses_and_unblocks_waiters() {
    let container = build(CommandRequest::batch([("a", "echo a"), ("b", "echo b")]));
    container.force_complete(None);

    assert!(container.is_complete());
    assert!(container.failed());
    for child in container.children() {
        assert!(child.is_complete());
        assert!(child.failed());
    }

    // Waiters return immediately once the event is set.
    let result = container
        .wait_for_results(Some(Duration::from_millis(50)))
        .await
        .expect("result after force-complete");
    assert_eq!(
        result.failure().map(|f| f.kind),
        Some(FailureKind::ForceComplete)
    );
}

#[tokio::test]
async fn reset_restores_pre_execution_state() {
    let container = build(CommandRequest::batch([("a", "echo a"), ("b", "echo b")]));
    container.force_complete(Some(CommandResult::Text("stale".to_string())));
    assert!(container.is_complete());

    container.reset();
    assert!(!container.is_complete());
    assert!(!container.failed());
    assert!(container.results().is_none());
    assert_eq!(container.phase(), Phase::New);
    for child in container.children() {
        assert!(!child.is_complete());
        assert!(child.results().is_none());
    }

    // The completion event was cleared too: waiting times out again.
    let waited = container
        .wait_for_results(Some(Duration::from_millis(20)))
        .await;
    assert!(waited.is_none());
}

#[tokio::test]
async fn wait_without_timeout_exceptions_returns_none() {
    let container = build("sleep 5");
    let result = container
        .wait_for_results(Some(Duration::from_millis(20)))
        .await;
    assert!(result.is_none());
}

#[tokio::test]
async fn wait_with_timeout_exceptions_returns_typed_failure() {
    let container = CommandContainer::new(
        "sleep 5",
        ExecuteOptions::default()
            .timeout(Duration::from_secs(1))
            .timeout_exceptions(true),
        HookSet::default(),
    )
    .expect("container");

    let result = container
        .wait_for_results(Some(Duration::from_millis(20)))
        .await
        .expect("typed failure instead of none");
    assert_eq!(
        result.failure().map(|f| f.kind),
        Some(FailureKind::TotalTimeout)
    );
}

#[test]
fn results_serialize_to_stable_json() {
    let mut map = BTreeMap::new();
    map.insert("a".to_string(), CommandResult::Text("a".to_string()));
    map.insert("b".to_string(), CommandResult::Text("b".to_string()));
    let result = CommandResult::Map(map);

    let json = serde_json::to_string(&result).expect("serialize");
    assert_eq!(json, r#"{"a":"a","b":"b"}"#);

    let back: CommandResult = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(back, result);
}
