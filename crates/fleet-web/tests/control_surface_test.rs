//! Control surface integration tests
//!
//! **Scenario:** an operator drives a fleet of fake workers over HTTP.

#![allow(clippy::unwrap_used)]

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use fleet_core::{BotId, DesiredBotConfig, IngestionMode};
use fleet_ipc::ControllerMessage;
use fleet_orchestrator::testing::FakeProcessManager;
use fleet_orchestrator::{Fleet, FleetConfig};
use fleet_reconciler::{DesiredState, InMemoryDesiredStateProvider};
use fleet_web::{AppState, create_router};
use http::{HeaderName, HeaderValue, StatusCode};
use serde_json::{Value, json};

const SECRET: &str = "hunter2";
const SECRET_HEADER: &str = "x-fleet-webhook-secret";

fn secret_header() -> HeaderName {
    HeaderName::from_static(SECRET_HEADER)
}

struct Surface {
    server: TestServer,
    processes: FakeProcessManager,
    desired: Arc<InMemoryDesiredStateProvider>,
}

impl Surface {
    fn new(mode: IngestionMode) -> Result<Self, Box<dyn Error>> {
        let mut config = FleetConfig::for_testing();
        config.server.mode = mode;
        config.server.webhook_secret = Some(SECRET.to_string());

        let processes = FakeProcessManager::new();
        let desired = Arc::new(InMemoryDesiredStateProvider::new(DesiredState::new()));
        let fleet = Fleet::new(
            config,
            Arc::new(processes.clone()),
            desired.clone(),
            None,
            Vec::new(),
        );
        let state = AppState::new(Arc::new(fleet))?;
        let server = TestServer::new(create_router(state))?;
        Ok(Self {
            server,
            processes,
            desired,
        })
    }

    async fn desire(&self, id: u64) {
        let config = DesiredBotConfig::new(BotId::new(id), format!("token-{id}"), format!("asst-{id}"));
        self.desired.update(|state| state.insert(config)).await;
    }

    /// Poll `GET /workers/{id}` until it reports `status`.
    async fn wait_for_status(&self, id: u64, status: &str) -> bool {
        for _ in 0..200 {
            let response = self.server.get(&format!("/workers/{id}")).await;
            if response.status_code() == StatusCode::OK
                && response.json::<Value>()["status"] == status
            {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn start(&self, id: u64) -> Result<u64, Box<dyn Error>> {
        self.desire(id).await;
        let response = self.server.post("/workers/sync").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        assert!(self.wait_for_status(id, "running").await, "bot {id} never became running");
        let worker = self.server.get(&format!("/workers/{id}")).await.json::<Value>();
        worker["pid"].as_u64().ok_or_else(|| "worker has no pid".into())
    }
}

#[tokio::test]
async fn given_empty_fleet_when_health_checked_then_ok_with_zero_workers() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface.server.get("/health").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["workers"], 0);
    Ok(())
}

#[tokio::test]
async fn given_unknown_worker_when_fetched_then_problem_document_is_404() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface.server.get("/workers/99").await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let body = response.json::<Value>();
    assert_eq!(body["type"], "/problems/worker_not_found");
    assert_eq!(body["status"], 404);
    Ok(())
}

#[tokio::test]
async fn given_non_numeric_id_when_fetched_then_bad_request() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface.server.get("/workers/not-a-bot").await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(response.json::<Value>()["type"], "/problems/invalid_bot_id");
    Ok(())
}

#[tokio::test]
async fn given_desired_bot_when_synced_then_worker_is_listed() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    surface.desire(42).await;

    let response = surface.server.post("/workers/sync").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let summary = response.json::<Value>();
    assert_eq!(summary["started"], json!([42]));
    assert_eq!(summary["desired"], 1);

    assert!(surface.wait_for_status(42, "running").await);
    let list = surface.server.get("/workers").await.json::<Value>();
    assert_eq!(list["total"], 1);
    assert_eq!(list["workers"][0]["bot_id"], 42);
    Ok(())
}

#[tokio::test]
async fn given_running_worker_when_stopped_then_graceful_and_gone() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let pid = surface.start(42).await?;

    let response = surface.server.post("/workers/42/stop").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    assert_eq!(report["escalation"], "graceful");
    assert_eq!(report["pid"], pid);
    assert_eq!(
        surface.server.get("/workers/42").await.status_code(),
        StatusCode::NOT_FOUND
    );
    Ok(())
}

#[tokio::test]
async fn given_running_worker_when_force_restarted_then_new_pid_and_reason_echoed() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let pid = surface.start(42).await?;

    let response = surface
        .server
        .post("/force-restart-bot")
        .json(&json!({ "bot_id": 42, "reason": "stuck conversation" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.json::<Value>();
    assert_eq!(body["reason"], "stuck conversation");
    assert_ne!(body["pid"], pid);
    assert_eq!(surface.processes.spawn_count(BotId::new(42)), 2);
    Ok(())
}

#[tokio::test]
async fn given_empty_bot_list_when_reloading_then_bad_request() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface
        .server
        .post("/reload-bots")
        .json(&json!({ "bot_ids": [] }))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn given_polling_mode_when_webhook_arrives_then_conflict() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface
        .server
        .post("/webhook/42")
        .add_header(secret_header(), HeaderValue::from_static(SECRET))
        .text(r#"{"update_id":1}"#)
        .await;

    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let stats = surface.server.get("/webhook/stats").await.json::<Value>();
    assert_eq!(stats["requests"], 1);
    assert_eq!(stats["errors"], 1);
    Ok(())
}

#[tokio::test]
async fn given_wrong_secret_when_webhook_arrives_then_unauthorized() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Webhook)?;

    let wrong = surface
        .server
        .post("/webhook/42")
        .add_header(secret_header(), HeaderValue::from_static("guess"))
        .text("{}")
        .await;
    let missing = surface.server.post("/webhook/42").text("{}").await;

    assert_eq!(wrong.status_code(), StatusCode::UNAUTHORIZED);
    assert_eq!(missing.status_code(), StatusCode::UNAUTHORIZED);
    let stats = surface.server.get("/webhook/stats").await.json::<Value>();
    assert_eq!(stats["unauthorized"], 2);
    assert_eq!(stats["forwarded"], 0);
    Ok(())
}

#[tokio::test]
async fn given_unknown_bot_when_webhook_arrives_then_not_found() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Webhook)?;

    let response = surface
        .server
        .post("/webhook/7")
        .add_header(secret_header(), HeaderValue::from_static(SECRET))
        .text("{}")
        .await;

    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let stats = surface.server.get("/webhook/stats").await.json::<Value>();
    assert_eq!(stats["not_found"], 1);
    Ok(())
}

#[tokio::test]
async fn given_malformed_update_when_webhook_arrives_then_bad_request() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Webhook)?;
    surface.start(42).await?;

    let response = surface
        .server
        .post("/webhook/42")
        .add_header(secret_header(), HeaderValue::from_static(SECRET))
        .text("{not json")
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn given_running_worker_when_webhook_arrives_then_update_is_forwarded() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Webhook)?;
    let pid = u32::try_from(surface.start(42).await?)?;
    let update = r#"{"update_id":17,"message":{"text":"hi"}}"#;

    let response = surface
        .server
        .post("/webhook/42")
        .add_header(secret_header(), HeaderValue::from_static(SECRET))
        .text(update)
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["ok"], true);

    let mut delivered = false;
    for _ in 0..100 {
        delivered = surface.processes.received(pid).iter().any(|m| {
            matches!(m, ControllerMessage::WebhookUpdate { payload } if payload == update)
        });
        if delivered {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered, "worker never saw the update");

    let stats = surface.server.get("/webhook/stats").await.json::<Value>();
    assert_eq!(stats["forwarded"], 1);
    let metrics = surface.server.get("/metrics").await.json::<Value>();
    assert_eq!(metrics["webhook"]["forwarded"], 1);
    Ok(())
}

#[tokio::test]
async fn given_polling_fleet_when_switched_to_webhook_then_mode_status_reports_it() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface
        .server
        .post("/switch-mode")
        .json(&json!({ "mode": "webhook" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    assert_eq!(report["previous"], "polling");
    assert_eq!(report["changed"], true);

    let status = surface.server.get("/mode-status").await.json::<Value>();
    assert_eq!(status["mode"], "webhook");
    assert_eq!(status["webhook_accepting"], true);
    Ok(())
}

#[tokio::test]
async fn given_unknown_mode_when_switching_then_bad_request() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;

    let response = surface
        .server
        .post("/switch-mode")
        .json(&json!({ "mode": "carrier-pigeon" }))
        .await;

    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    Ok(())
}

impl Surface {
    /// Poll until the worker with `pid` has received a message matching `pred`.
    async fn wait_for_message(&self, pid: u32, pred: impl Fn(&ControllerMessage) -> bool) -> bool {
        for _ in 0..200 {
            if self.processes.received(pid).iter().any(&pred) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[tokio::test]
async fn given_workers_and_a_stray_when_nuclear_cleanup_then_everything_is_killed() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let first = surface.start(1).await?;
    let second = surface.start(2).await?;
    let stray = surface.processes.inject_process(BotId::new(9));

    let response = surface.server.post("/nuclear-cleanup").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    let mut expected = vec![first, second, u64::from(stray)];
    expected.sort_unstable();
    assert_eq!(report["killed"], json!(expected));
    assert_eq!(report["cleared"], json!([1, 2]));
    assert_eq!(surface.server.get("/workers").await.json::<Value>()["total"], 0);
    for id in [1, 2, 9] {
        assert!(surface.processes.alive(BotId::new(id)).is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn given_orphan_process_when_cleanup_then_orphan_killed_and_worker_kept() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let pid = surface.start(1).await?;
    let orphan = surface.processes.inject_process(BotId::new(7));

    let response = surface.server.post("/workers/cleanup").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    assert_eq!(report["orphans_killed"], json!([orphan]));
    assert_eq!(report["purged"], json!([]));
    assert!(surface.processes.alive(BotId::new(7)).is_empty());
    assert_eq!(surface.processes.alive(BotId::new(1)), vec![u32::try_from(pid)?]);
    Ok(())
}

#[tokio::test]
async fn given_two_workers_when_restart_all_then_both_get_new_processes() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    surface.start(1).await?;
    surface.start(2).await?;

    let response = surface.server.post("/workers/restart-all").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    assert_eq!(report["restarted"], json!([1, 2]));
    assert_eq!(report["failed"], json!([]));
    assert_eq!(surface.processes.spawn_count(BotId::new(1)), 2);
    assert_eq!(surface.processes.spawn_count(BotId::new(2)), 2);
    Ok(())
}

#[tokio::test]
async fn given_no_bot_ids_when_clearing_cache_then_every_worker_is_told() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let first = u32::try_from(surface.start(1).await?)?;
    let second = u32::try_from(surface.start(2).await?)?;

    let response = surface.server.post("/clear-bot-cache").json(&json!({})).await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let report = response.json::<Value>();
    assert_eq!(report["notified"], json!([1, 2]));
    assert_eq!(report["missing"], json!([]));
    for pid in [first, second] {
        assert!(
            surface
                .wait_for_message(pid, |m| *m == ControllerMessage::ClearCache)
                .await
        );
    }
    Ok(())
}

#[tokio::test]
async fn given_named_bots_when_clearing_cache_then_unknown_ones_are_missing() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    surface.start(1).await?;
    let other = u32::try_from(surface.start(2).await?)?;

    let response = surface
        .server
        .post("/clear-bot-cache")
        .json(&json!({"bot_ids": [1, 5]}))
        .await;

    let report = response.json::<Value>();
    assert_eq!(report["notified"], json!([1]));
    assert_eq!(report["missing"], json!([5]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!surface.processes.received(other).contains(&ControllerMessage::ClearCache));
    Ok(())
}

#[tokio::test]
async fn given_force_reload_when_hot_reloading_then_worker_is_restarted() -> Result<(), Box<dyn Error>> {
    let surface = Surface::new(IngestionMode::Polling)?;
    let old_pid = surface.start(1).await?;

    let response = surface
        .server
        .post("/hot-reload-bots")
        .json(&json!({"bot_ids": [1], "force_reload": true}))
        .await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let result = &response.json::<Value>()["results"][0];
    assert_eq!(result["bot_id"], 1);
    assert_eq!(result["outcome"]["outcome"], "restarted");
    assert_eq!(result["outcome"]["reason"], "forced reload");
    assert_ne!(result["outcome"]["pid"].as_u64(), Some(old_pid));
    assert_eq!(surface.processes.spawn_count(BotId::new(1)), 2);
    Ok(())
}
