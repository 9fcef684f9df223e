// Integration tests for whole job runs against a mock server.
// Run with: cargo test -p sasjs-client --test job_flows

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use httpmock::prelude::*;
use serde_json::json;

use sasjs_client::{
    AdapterConfig, Credentials, Error, ExecuteParams, LoginCallback, Sasjs, ServerType, TableSet,
};

fn viya_config(server: &MockServer) -> AdapterConfig {
    let mut config = AdapterConfig::new(server.base_url(), ServerType::SasViya);
    config.poll_interval_ms = 1;
    config
}

#[test]
fn jes_job_runs_to_completion() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET)
            .path("/folders/folders/@item")
            .query_param("path", "/Public/app/common");
        then.status(200).json_body(json!({ "id": "folder-1" }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/folders/folders/folder-1/members");
        then.status(200).json_body(json!({ "items": [{
            "name": "sendArr",
            "uri": "/jobDefinitions/definitions/def-1",
            "links": [{ "rel": "getResource", "href": "/jobDefinitions/definitions/def-1" }]
        }]}));
    });
    server.mock(|when, then| {
        when.method(GET).path("/jobDefinitions/definitions/def-1");
        then.status(200)
            .json_body(json!({ "id": "def-1", "name": "sendArr", "code": "%webout(OPEN);" }));
    });
    let submit = server.mock(|when, then| {
        when.method(POST)
            .path("/jobExecution/jobs")
            .query_param("_action", "wait")
            .header("authorization", "Bearer tok")
            .body_includes("\"jobDefinitionUri\":\"/jobDefinitions/definitions/def-1\"");
        then.status(201)
            .header("etag", "\"job-v1\"")
            .json_body(json!({
                "id": "j1",
                "state": "running",
                "links": [
                    { "rel": "state", "href": "/jobExecution/jobs/j1/state" },
                    { "rel": "self", "href": "/jobExecution/jobs/j1" }
                ]
            }));
    });
    let poll = server.mock(|when, then| {
        when.method(GET)
            .path("/jobExecution/jobs/j1/state")
            .query_param("_action", "wait")
            .header("if-none-match", "\"job-v1\"");
        then.status(200).body("completed");
    });
    server.mock(|when, then| {
        when.method(GET).path("/jobExecution/jobs/j1");
        then.status(200).json_body(json!({
            "id": "j1",
            "state": "completed",
            "results": { "_webout.json": "/files/files/out-1" },
            "links": []
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/files/files/out-1/content");
        then.status(200).json_body(json!({ "table1": [[1, "a"]] }));
    });

    let mut config = viya_config(&server);
    config.use_compute_api = Some(false);
    let sasjs = Sasjs::new(config).unwrap();

    let result = sasjs
        .request("common/sendArr", None, Credentials::bearer("tok"), None)
        .unwrap();

    submit.assert();
    poll.assert();
    assert_eq!(result, json!({ "table1": [[1, "a"]] }));
}

#[test]
fn web_job_replayed_after_login() {
    let server = MockServer::start();
    let mut denied = server.mock(|when, then| {
        when.method(POST).path("/SASJobExecution/");
        then.status(401);
    });

    let sasjs = Arc::new(Sasjs::new(viya_config(&server)).unwrap());
    let prompts = Arc::new(AtomicUsize::new(0));
    let on_login: LoginCallback = {
        let prompts = prompts.clone();
        Arc::new(move || {
            prompts.fetch_add(1, Ordering::SeqCst);
        })
    };

    let data = TableSet::from_value(&json!({ "areas": [{ "area": "Adur" }] })).unwrap();
    let params = ExecuteParams::new("common/getdata", sasjs.config().clone()).with_data(data);
    let caller = {
        let sasjs = sasjs.clone();
        thread::spawn(move || sasjs.execute(params, Some(on_login)))
    };

    let deadline = Instant::now() + Duration::from_secs(10);
    while prompts.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "login was never requested");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sasjs.waiting_count(), 1);

    denied.delete();
    let accepted = server.mock(|when, then| {
        when.method(POST)
            .path("/SASJobExecution/")
            .body_includes("Adur");
        then.status(200).json_body(json!({ "areas": [{ "AREA": "Adur" }] }));
    });

    sasjs.resend_waiting_requests();
    let result = caller.join().unwrap().unwrap();
    accepted.assert();
    assert_eq!(result["areas"][0]["AREA"], "Adur");
    assert_eq!(sasjs.waiting_count(), 0);
}

#[test]
fn value_too_long_rejected_before_sending() {
    let server = MockServer::start();
    let any = server.mock(|when, then| {
        when.method(POST);
        then.status(200).json_body(json!({}));
    });

    let sasjs = Sasjs::new(viya_config(&server)).unwrap();
    let data = TableSet::from_value(&json!({ "big": [{ "text": "x".repeat(32766) }] })).unwrap();

    let err = sasjs
        .request("common/upload", Some(data), Credentials::None, None)
        .unwrap_err();
    assert!(matches!(err, Error::LengthExceeded(_)), "{err:?}");
    any.assert_calls(0);
}
