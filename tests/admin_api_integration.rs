//! Integration tests for the admin/stats HTTP API.
//!
//! Each test binds the real router on a random port and talks to it with
//! reqwest, over an in-memory relay.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::time::timeout;

use channel_relay::api::{AppState, spawn_api_server};
use channel_relay::channels::{MemorySink, MemorySource};
use channel_relay::config::{QuotaConfig, QuotaScope};
use channel_relay::message::{ChannelId, Message, Route};
use channel_relay::policy::{AdminService, PolicyStore};
use channel_relay::recorder::Recorder;
use channel_relay::relay::{BackfillController, Forwarder, Limiters, LiveHealth, RetryPolicy};
use channel_relay::stats::Stats;
use channel_relay::store::{Database, LibSqlBackend};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const ADMIN: &str = "42";
const SOURCE: ChannelId = -1001;

struct Server {
    base: String,
    client: reqwest::Client,
    source: Arc<MemorySource>,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn admin_request(
        &self,
        method: reqwest::Method,
        path: &str,
        actor: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut req = self.client.request(method, self.url(path));
        if let Some(actor) = actor {
            req = req.header("x-actor-id", actor);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn put_setting(&self, key: &str, value: &str) -> (StatusCode, Value) {
        let path = format!("/api/settings/{key}");
        self.admin_request(
            reqwest::Method::PUT,
            &path,
            Some(ADMIN),
            Some(json!({ "value": value })),
        )
        .await
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        self.admin_request(reqwest::Method::POST, path, Some(ADMIN), Some(body))
            .await
    }
}

/// Start the API on a random port over a fast in-memory relay.
async fn start_server() -> Server {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let source = Arc::new(MemorySource::new());
    let policy = Arc::new(PolicyStore::load(db.as_ref()).await.unwrap());
    let limiters = Arc::new(Limiters::new(
        QuotaConfig {
            messages: 1000,
            window: Duration::from_secs(1),
        },
        QuotaScope::Global,
    ));
    let recorder = Arc::new(Recorder::new(Arc::clone(&db)));
    let admin = Arc::new(AdminService::new(
        Arc::clone(&db),
        Arc::clone(&policy),
        Arc::clone(&limiters),
        HashSet::from([42]),
    ));
    let forwarder = Arc::new(Forwarder::new(
        Arc::clone(&db),
        Arc::new(MemorySink::new()),
        Arc::clone(&policy),
        Arc::clone(&limiters),
        Arc::clone(&recorder),
        RetryPolicy::none(),
    ));
    let backfill = Arc::new(BackfillController::new(
        Arc::clone(&db),
        source.clone(),
        forwarder,
        Arc::clone(&policy),
        Arc::clone(&recorder),
        &[Route::new(SOURCE, -2002)],
        50,
        RetryPolicy::none(),
    ));
    let stats = Arc::new(Stats::new(
        Arc::clone(&db),
        policy,
        limiters,
        Arc::clone(&backfill),
        Arc::new(LiveHealth::new()),
    ));
    let state = AppState {
        admin,
        backfill,
        stats,
        recorder,
    };

    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (bound, _handle) = spawn_api_server(addr, state).await.unwrap();

    Server {
        base: format!("http://{bound}"),
        client: reqwest::Client::new(),
        source,
    }
}

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        let (status, body) = server.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn mutations_require_a_known_admin() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, _) = server
            .admin_request(reqwest::Method::POST, "/api/pause", None, Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = server
            .admin_request(
                reqwest::Method::POST,
                "/api/pause",
                Some("not-a-number"),
                Some(json!({})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = server
            .admin_request(reqwest::Method::POST, "/api/pause", Some("7"), Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains('7'));

        // Nothing was changed or audited.
        let (_, stats) = server.get("/api/stats").await;
        assert!(stats["global_pause"].is_null());
        let (_, audit) = server.get("/api/audit").await;
        assert!(audit["entries"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn pause_and_resume_are_visible_in_stats_and_audit() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, snapshot) = server
            .post("/api/pause", json!({"reason": "maintenance"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["global_pause"]["reason"], "maintenance");

        let (status, _) = server
            .post("/api/pause", json!({"channel": SOURCE, "reason": "noisy"}))
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["global_pause"]["set_by"], 42);
        assert_eq!(stats["paused_channels"], json!([SOURCE]));

        let (status, _) = server.post("/api/resume", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, stats) = server.get("/api/stats").await;
        assert!(stats["global_pause"].is_null());
        assert_eq!(stats["policy_version"], 4);

        let (_, audit) = server.get("/api/audit?actor=42").await;
        let entries = audit["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0]["action"], "RESUME");
        assert_eq!(audit["actions"]["PAUSE"], 2);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn settings_validate_and_apply() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, _) = server.put_setting("quota_messages", "zero").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = server.put_setting("colour", "blue").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, settings) = server.put_setting("quota_messages", "30").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(settings["quota_messages"], "30");

        let (status, _) = server
            .put_setting("forwarding_mode", "whitelist_only")
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, settings) = server.get("/api/settings").await;
        assert_eq!(settings["forwarding_mode"], "whitelist_only");
        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["quota"]["messages"], 30);
        assert_eq!(stats["forwarding_mode"], "whitelist_only");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn channel_lists_add_and_remove() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;

        let (status, snapshot) = server
            .post("/api/blacklist/-55", json!({"reason": "spam"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["blacklist"], json!([-55]));

        let (status, _) = server.post("/api/whitelist/-66", json!({})).await;
        assert_eq!(status, StatusCode::OK);

        let (status, snapshot) = server
            .admin_request(reqwest::Method::DELETE, "/api/blacklist/-55", Some(ADMIN), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snapshot["blacklist"], json!([]));
        assert_eq!(snapshot["whitelist"], json!([-66]));

        let (_, audit) = server.get("/api/audit?actor=42").await;
        assert_eq!(audit["actions"]["BLACKLIST_ADD"], 1);
        assert_eq!(audit["actions"]["BLACKLIST_REMOVE"], 1);
        assert_eq!(audit["actions"]["WHITELIST_ADD"], 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn backfill_start_runs_to_completion_and_resets() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server
            .source
            .add_history((1..=5).map(|i| Message::text(SOURCE, i, format!("old {i}"))))
            .await;

        let (status, _) = server.post("/api/backfill/999/start", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = server
            .post(&format!("/api/backfill/{SOURCE}/start"), json!({}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["state"], "running");

        loop {
            let (_, stats) = server.get("/api/stats").await;
            if stats["backfill"][0]["state"] == "completed" {
                assert_eq!(stats["total_forwarded"], 5);
                assert_eq!(stats["backfill"][0]["last_processed_message_id"], 5);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (status, body) = server
            .post(&format!("/api/backfill/{SOURCE}/reset"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "idle");

        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["backfill"][0]["state"], "idle");
        assert!(stats["backfill"][0]["last_processed_message_id"].is_null());
        // Dedup records survive a reset.
        assert_eq!(stats["total_forwarded"], 5);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn errors_endpoint_lists_recent_failures() {
    timeout(TEST_TIMEOUT, async {
        let server = start_server().await;
        server.source.fail_next_history(1).await;

        let (status, _) = server
            .post(&format!("/api/backfill/{SOURCE}/start"), json!({}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        loop {
            let (_, errors) = server.get("/api/errors?limit=10").await;
            if let Some(first) = errors.as_array().and_then(|e| e.first()) {
                assert_eq!(first["category"], "source_unavailable");
                assert_eq!(first["context"]["channel_id"], SOURCE);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let (_, stats) = server.get("/api/stats").await;
        assert_eq!(stats["total_errors"], 1);
    })
    .await
    .expect("test timed out");
}
