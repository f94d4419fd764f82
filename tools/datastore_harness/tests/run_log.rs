use datastore_harness::config::HarnessConfig;
use datastore_harness::datastore::{Entity, Key};
use datastore_harness::fixture::with_datastore;
use datastore_harness::interception::WriteBlocker;
use serde_json::Value;
use std::path::Path;

#[test]
fn configured_run_log_captures_fixture_and_interception_events() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("logs").join("harness.jsonl");
    let mut config = HarnessConfig::default();
    config.logging.path = Some(path.clone());

    let outcome = with_datastore(config, false, |helper| {
        let ds = helper.ds()?;
        ds.put(None, Entity::new(Key::named("Book", "logged")))?;
        let blocker = WriteBlocker::install(helper.factory())?;
        let blocked = helper
            .ds()?
            .delete(None, &[Key::named("Book", "logged")]);
        blocker.uninstall();
        Ok(blocked.is_err())
    });
    assert!(outcome.expect("run"));

    let events = read_events(&path);
    let types = events
        .iter()
        .filter_map(|event| event["event_type"].as_str())
        .collect::<Vec<_>>();
    for expected in [
        "environment.installed",
        "api_proxy.delegate.installed",
        "fixture.set_up",
        "service_interceptor.installed",
        "write_blocker.rejected",
        "local_datastore.cleared",
        "fixture.tear_down",
        "environment.cleared",
    ] {
        assert!(types.contains(&expected), "missing {expected} in {types:?}");
    }
    let rejected = events
        .iter()
        .find(|event| event["event_type"] == "write_blocker.rejected")
        .expect("rejected event");
    assert_eq!(rejected["level"], "warn");
    assert_eq!(rejected["payload"]["method"], "delete");
}

fn read_events(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .expect("run log should exist")
        .lines()
        .map(|line| serde_json::from_str(line).expect("jsonl line"))
        .collect()
}
