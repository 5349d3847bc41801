//! End-to-end pipeline scenarios against the in-memory store and live
//! local HTTP servers.

mod support;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use sluice::{Bridge, Config, MemoryStore, PipelineStore, Runner, TaskRun, Value};
use url::Url;

use support::MockServer;

const RATE_LIMIT_BLOB: &str = "{\"Response\":\"Error\",\"Message\":\"You are over your rate limit please upgrade your account!\",\"HasWarning\":false,\"Type\":99,\"RateLimit\":{\"calls_made\":{\"second\":5,\"minute\":5,\"hour\":955,\"day\":10004,\"month\":15146,\"total_calls\":15152},\"max_calls\":{\"second\":20,\"minute\":300,\"hour\":3000,\"day\":10000,\"month\":75000}},\"Data\":{}}";

fn started_runner() -> (Runner, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let runner = Runner::new(store.clone(), Config::default());
    runner.start();
    (runner, store)
}

async fn add_bridge(store: &MemoryStore, name: &str, url: &str) {
    store
        .upsert_bridge(&Bridge {
            name: name.to_string(),
            url: Url::parse(url).expect("bridge url"),
        })
        .await
        .expect("upsert bridge");
}

fn simple_fetch_source(url: &str, lax: bool) -> String {
    format!(
        r#"
        ds1          [type=http method=GET url="{url}" allowunrestrictednetworkaccess="true"];
        ds1_parse    [type=jsonparse path="USD" lax={lax}];
        ds1_multiply [type=multiply times=100];
        ds1 -> ds1_parse -> ds1_multiply;
        "#
    )
}

fn task_run(task_runs: &[TaskRun], dot_id: &str) -> TaskRun {
    task_runs
        .iter()
        .find(|run| run.dot_id == dot_id)
        .unwrap_or_else(|| panic!("no task run for {dot_id}"))
        .clone()
}

fn decimal(s: &str) -> Value {
    Value::Decimal(Decimal::from_str(s).expect("test decimal"))
}

#[tokio::test]
async fn median_of_two_sources_with_bridges() {
    let election_winner = MockServer::start(200, "Hal Finney").await;
    let voter_turnout = MockServer::start(200, r#"{"data": {"result": 62.57}}"#).await;
    let turnout_http = MockServer::start(200, r#"{"turnout": 61.942}"#).await;

    let (runner, store) = started_runner();
    add_bridge(&store, "election_winner", &election_winner.url).await;
    add_bridge(&store, "voter_turnout", &voter_turnout.url).await;

    let source = format!(
        r#"
        ds1          [type=bridge name="voter_turnout"];
        ds1_parse    [type=jsonparse path="data.result"];
        ds1_multiply [type=multiply times=100];
        ds2          [type=http method=GET url="{}" allowunrestrictednetworkaccess="true"];
        ds2_parse    [type=jsonparse path="turnout"];
        ds2_multiply [type=multiply times=100];
        ds1 -> ds1_parse -> ds1_multiply -> answer1;
        ds2 -> ds2_parse -> ds2_multiply -> answer1;
        answer1 [type=median];
        answer2 [type=bridge name="election_winner"];
        "#,
        turnout_http.url
    );
    let job = store.create_job("voter turnout", &source, None).await.unwrap();

    let mut meta_entries = BTreeMap::new();
    meta_entries.insert("latestAnswer".to_string(), decimal("10"));
    meta_entries.insert("updatedAt".to_string(), decimal("100"));
    let run_id = runner
        .create_run(job.id, Value::Map(meta_entries))
        .await
        .unwrap();
    runner.await_run(run_id).await.unwrap();

    // Leaf results in leaf-dot-id order: answer1 before answer2.
    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].error, None);
    assert_eq!(results[1].error, None);
    assert_eq!(results[0].value, Some(Value::String("6225.6".to_string())));
    assert_eq!(results[1].value, Some(Value::String("Hal Finney".to_string())));

    // Every task has a persisted record with the expected output.
    let task_runs = store.task_runs(run_id).await.unwrap();
    assert_eq!(task_runs.len(), 8);
    assert_eq!(
        task_run(&task_runs, "ds1").output,
        Some(Value::String(r#"{"data": {"result": 62.57}}"#.to_string()))
    );
    assert_eq!(task_run(&task_runs, "ds1_parse").output, Some(decimal("62.57")));
    assert_eq!(
        task_run(&task_runs, "ds1_multiply").output,
        Some(Value::String("6257".to_string()))
    );
    assert_eq!(
        task_run(&task_runs, "ds2").output,
        Some(Value::String(r#"{"turnout": 61.942}"#.to_string()))
    );
    assert_eq!(task_run(&task_runs, "ds2_parse").output, Some(decimal("61.942")));
    assert_eq!(
        task_run(&task_runs, "ds2_multiply").output,
        Some(Value::String("6194.2".to_string()))
    );
    assert_eq!(
        task_run(&task_runs, "answer1").output,
        Some(Value::String("6225.6".to_string()))
    );
    assert_eq!(
        task_run(&task_runs, "answer2").output,
        Some(Value::String("Hal Finney".to_string()))
    );
    for run in &task_runs {
        assert_eq!(run.error, None, "task {} should not error", run.dot_id);
    }

    // The run is finished exactly because every task has a terminal record.
    let run = store.find_run(run_id).await.unwrap().unwrap();
    assert!(run.is_finished());

    // Both bridges received a POST whose body carries the meta envelope.
    for server in [&election_winner, &voter_turnout] {
        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["meta"]["latestAnswer"], serde_json::json!(10));
        assert_eq!(body["meta"]["updatedAt"], serde_json::json!(100));
    }

    runner.close().await;
}

#[tokio::test]
async fn null_json_value_fails_multiplication() {
    let server = MockServer::start(200, r#"{"USD": null}"#).await;
    let (runner, store) = started_runner();
    let job = store
        .create_job("null fetch", &simple_fetch_source(&server.url, false), None)
        .await
        .unwrap();

    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].error.as_deref(),
        Some("type <nil> cannot be converted to decimal.Decimal")
    );
    assert_eq!(results[0].value, None);

    let task_runs = store.task_runs(run_id).await.unwrap();
    assert_eq!(task_runs.len(), 3);

    let fetched = task_run(&task_runs, "ds1");
    assert_eq!(fetched.error, None);
    assert_eq!(
        fetched.output,
        Some(Value::String(r#"{"USD": null}"#.to_string()))
    );

    // The extracted JSON null is a proper null value, not an error.
    let parsed = task_run(&task_runs, "ds1_parse");
    assert_eq!(parsed.error, None);
    assert_eq!(parsed.output, Some(Value::Null));

    let multiplied = task_run(&task_runs, "ds1_multiply");
    assert_eq!(
        multiplied.error.as_deref(),
        Some("type <nil> cannot be converted to decimal.Decimal")
    );
    assert_eq!(multiplied.output, None);

    runner.close().await;
}

#[tokio::test]
async fn missing_json_path_propagates_the_resolution_error() {
    let server = MockServer::start(200, RATE_LIMIT_BLOB).await;
    let (runner, store) = started_runner();
    let job = store
        .create_job("rate limited", &simple_fetch_source(&server.url, false), None)
        .await
        .unwrap();

    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let expected = format!(r#"could not resolve path ["USD"] in {RATE_LIMIT_BLOB}"#);

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error.as_deref(), Some(expected.as_str()));
    assert_eq!(results[0].value, None);

    let task_runs = store.task_runs(run_id).await.unwrap();
    assert_eq!(task_runs.len(), 3);
    assert_eq!(task_run(&task_runs, "ds1").error, None);

    // The multiply task surfaces its parent's error verbatim.
    for dot_id in ["ds1_parse", "ds1_multiply"] {
        let run = task_run(&task_runs, dot_id);
        assert_eq!(run.error.as_deref(), Some(expected.as_str()));
        assert_eq!(run.output, None);
    }

    runner.close().await;
}

#[tokio::test]
async fn missing_json_path_with_lax_resolves_to_null() {
    let server = MockServer::start(200, RATE_LIMIT_BLOB).await;
    let (runner, store) = started_runner();
    let job = store
        .create_job("rate limited lax", &simple_fetch_source(&server.url, true), None)
        .await
        .unwrap();

    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].error.as_deref(),
        Some("type <nil> cannot be converted to decimal.Decimal")
    );

    let task_runs = store.task_runs(run_id).await.unwrap();
    let parsed = task_run(&task_runs, "ds1_parse");
    assert_eq!(parsed.error, None);
    assert_eq!(parsed.output, Some(Value::Null));
    assert_eq!(
        task_run(&task_runs, "ds1_multiply").error.as_deref(),
        Some("type <nil> cannot be converted to decimal.Decimal")
    );

    runner.close().await;
}

#[tokio::test]
async fn per_task_timeout_overrides_and_its_absence_succeeds() {
    let server =
        MockServer::start_with_latency(200, r#"{"USD":10.1}"#, Duration::from_millis(1)).await;
    let (runner, store) = started_runner();

    let timed_out_source = format!(
        r#"
        ds1       [type=http method=GET url="{}" allowunrestrictednetworkaccess="true" timeout="1ns"];
        ds1_parse [type=jsonparse path="USD"];
        ds1 -> ds1_parse;
        "#,
        server.url
    );
    let job = store.create_job("timeout", &timed_out_source, None).await.unwrap();
    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error.as_deref(), Some("context deadline exceeded"));

    // The same pipeline without the per-task timeout succeeds.
    let relaxed_source = format!(
        r#"
        ds1       [type=http method=GET url="{}" allowunrestrictednetworkaccess="true"];
        ds1_parse [type=jsonparse path="USD"];
        ds1 -> ds1_parse;
        "#,
        server.url
    );
    let job = store.create_job("no timeout", &relaxed_source, None).await.unwrap();
    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results[0].error, None);
    assert_eq!(results[0].value, Some(decimal("10.1")));

    runner.close().await;
}

#[tokio::test]
async fn runs_and_creation_fail_cleanly_after_job_deletion() {
    let server = MockServer::start(200, r#"{"USD": 42.42}"#).await;
    let (runner, store) = started_runner();
    let job = store
        .create_job("to delete", &simple_fetch_source(&server.url, false), None)
        .await
        .unwrap();

    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();
    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results[0].value, Some(Value::String("4242".to_string())));

    store.delete_job(job.id).await.unwrap();

    let err = runner.create_run(job.id, Value::Null).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("no job found with id {} (most likely it was deleted)", job.id)
    );

    let err = runner.await_run(run_id).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        format!("run not found - could not determine if run is finished (run ID: {run_id})")
    );

    runner.close().await;
}

#[tokio::test]
async fn non_2xx_responses_become_task_errors_without_failing_the_run() {
    let server = MockServer::start(429, r#"{"error": "rate limited"}"#).await;
    let (runner, store) = started_runner();
    let job = store
        .create_job("bad response", &simple_fetch_source(&server.url, false), None)
        .await
        .unwrap();

    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].error.as_deref(),
        Some("got unsuccessful response status 429")
    );

    let run = store.find_run(run_id).await.unwrap().unwrap();
    assert!(run.is_finished());

    runner.close().await;
}

#[tokio::test]
async fn restricted_urls_are_refused_without_the_access_flag() {
    let server = MockServer::start(200, r#"{"USD": 1}"#).await;
    let (runner, store) = started_runner();

    // Same shape as the simple fetch, but without
    // allowunrestrictednetworkaccess: the loopback mock must be refused.
    let source = format!(
        r#"
        ds1       [type=http method=GET url="{}"];
        ds1_parse [type=jsonparse path="USD"];
        ds1 -> ds1_parse;
        "#,
        server.url
    );
    let job = store.create_job("insecure", &source, None).await.unwrap();
    let run_id = runner.create_run(job.id, Value::Null).await.unwrap();
    runner.await_run(run_id).await.unwrap();

    let results = runner.results_for_run(run_id).await.unwrap();
    let error = results[0].error.as_deref().unwrap();
    assert!(
        error.contains("disallowed IP or hostname"),
        "unexpected error: {error}"
    );
    assert!(server.requests().is_empty());

    runner.close().await;
}
