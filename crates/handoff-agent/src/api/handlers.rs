//! Thin request handlers: decode, dispatch, acknowledge.
//!
//! Long-running work (orchestration, restore) runs on spawned tasks so
//! clients never block on it; only `ForwardTraffic`'s clock and inbox
//! update is inline, because that update *is* the acknowledgement.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use futures::TryStreamExt;
use tokio::io::AsyncWriteExt;

use crate::api::{AgentContext, ApiError};
use crate::migration::{destination, source};
use crate::registry::Process;
use crate::wire::{ShadowTrafficMessage, SlaveStartMigrationMessage, StartMigrationRequest};

fn malformed(operation: &str) -> ApiError {
    tracing::error!("{operation}(): poorly formatted request");
    ApiError::bad_request("poorly formatted request")
}

pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn register_process(
    State(ctx): State<Arc<AgentContext>>,
    payload: Result<Json<Process>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(process) = payload.map_err(|_| malformed("RegisterProcess"))?;
    tokio::spawn(async move {
        if let Err(err) = ctx.registry.register(process).await {
            tracing::error!("RegisterProcess(): {err}");
        }
    });
    Ok(StatusCode::OK)
}

pub async fn start_migration(
    State(ctx): State<Arc<AgentContext>>,
    payload: Result<Json<StartMigrationRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(request) = payload.map_err(|_| malformed("StartMigration"))?;
    tokio::spawn(async move {
        if let Err(err) = source::run_source_migration(ctx, request).await {
            tracing::error!("StartMigration(): {err}");
        }
    });
    Ok(StatusCode::OK)
}

pub async fn slave_start_migration(
    State(ctx): State<Arc<AgentContext>>,
    payload: Result<Json<SlaveStartMigrationMessage>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(msg) = payload.map_err(|_| malformed("SlaveStartMigration"))?;
    tokio::spawn(destination::prepare_destination(ctx, msg));
    Ok(StatusCode::OK)
}

pub async fn forward_traffic(
    State(ctx): State<Arc<AgentContext>>,
    payload: Result<Json<ShadowTrafficMessage>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(msg) = payload.map_err(|_| malformed("ForwardTraffic"))?;

    ctx.clocks
        .merge_remote(msg.pid, msg.clock.source_time)
        .map_err(|err| {
            tracing::error!("ForwardTraffic(): {err}");
            ApiError::bad_request(err.to_string())
        })?;
    ctx.registry
        .append_inbox(msg.pid, msg.frame)
        .await
        .map_err(|err| {
            tracing::error!("ForwardTraffic(): {err}");
            ApiError::bad_request(err.to_string())
        })?;
    Ok(StatusCode::OK)
}

pub async fn receive_checkpoint(
    State(ctx): State<Arc<AgentContext>>,
    Query(params): Query<HashMap<String, String>>,
    body: Body,
) -> Result<StatusCode, ApiError> {
    let pid = parse_pid(&params, "ReceiveCheckpoint")?;

    let archive_path = ctx.config.work_dir.join(format!("{pid}.tar.gz"));
    let mut file = tokio::fs::File::create(&archive_path).await.map_err(|err| {
        tracing::error!("ReceiveCheckpoint(): can't create file: {err}");
        ApiError::internal("can't create archive file")
    })?;

    let mut stream = body.into_data_stream();
    loop {
        let chunk = stream.try_next().await.map_err(|err| {
            tracing::error!("ReceiveCheckpoint(): body read failed: {err}");
            ApiError::bad_request("truncated body")
        })?;
        let Some(chunk) = chunk else { break };
        file.write_all(&chunk).await.map_err(|err| {
            tracing::error!("ReceiveCheckpoint(): archive write failed: {err}");
            ApiError::internal("archive write failed")
        })?;
    }
    file.flush().await.map_err(|err| {
        tracing::error!("ReceiveCheckpoint(): archive flush failed: {err}");
        ApiError::internal("archive write failed")
    })?;

    tokio::spawn(async move {
        if let Err(err) = destination::restore_from_archive(ctx, pid, archive_path).await {
            tracing::error!("ReceiveCheckpoint(): {err}");
        }
    });
    Ok(StatusCode::OK)
}

pub async fn finish_restore(
    State(ctx): State<Arc<AgentContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let pid = parse_pid(&params, "FinishRestore")?;
    destination::finish_restore(ctx, pid).await.map_err(|err| {
        tracing::error!("FinishRestore(): {err}");
        ApiError::bad_request(err.to_string())
    })?;
    Ok(StatusCode::OK)
}

fn parse_pid(params: &HashMap<String, String>, operation: &str) -> Result<i32, ApiError> {
    let Some(raw) = params.get("pid") else {
        tracing::error!("{operation}(): no pid");
        return Err(ApiError::bad_request("no pid"));
    };
    raw.parse().map_err(|_| {
        tracing::error!("{operation}(): non-numeric PID");
        ApiError::bad_request("non-numeric PID")
    })
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::api::build_router;
    use crate::registry::Process;
    use crate::test_util::harness;
    use crate::wire::{MigrationClock, ShadowTrafficMessage};

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request")
    }

    #[tokio::test]
    async fn non_post_is_method_not_allowed() {
        let h = harness();
        let app = build_router(h.ctx.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/RegisterProcess")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let h = harness();
        let app = build_router(h.ctx.clone());
        for uri in [
            "/RegisterProcess",
            "/StartMigration",
            "/SlaveStartMigration",
            "/ForwardTraffic",
        ] {
            let response = app
                .clone()
                .oneshot(post_json(uri, "{not json".to_string()))
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
        }
    }

    #[tokio::test]
    async fn forward_traffic_for_unknown_pid_changes_nothing() {
        let h = harness();
        let app = build_router(h.ctx.clone());

        let msg = ShadowTrafficMessage {
            clock: MigrationClock {
                source_time: 4,
                destination_time: 0,
            },
            frame: vec![1, 2, 3],
            pid: 9999,
        };
        let body = serde_json::to_string(&msg).expect("encode");
        let response = app
            .oneshot(post_json("/ForwardTraffic", body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(h.ctx.clocks.active_count(), 0);
        assert!(h.ctx.registry.lookup(9999).await.is_none());
    }

    #[tokio::test]
    async fn forward_traffic_updates_clock_and_inbox() {
        let h = harness();
        h.ctx.registry.insert(Process::new(1234, vec![80], vec![])).await;
        h.ctx.clocks.insert_mirror(
            1234,
            MigrationClock {
                source_time: 1,
                destination_time: 0,
            },
        );
        let app = build_router(h.ctx.clone());

        let msg = ShadowTrafficMessage {
            clock: MigrationClock {
                source_time: 6,
                destination_time: 0,
            },
            frame: vec![0xaa, 0xbb],
            pid: 1234,
        };
        let body = serde_json::to_string(&msg).expect("encode");
        let response = app
            .oneshot(post_json("/ForwardTraffic", body))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let clock = h.ctx.clocks.snapshot(1234).expect("clock");
        assert_eq!(clock.source_time, 6);
        assert_eq!(clock.destination_time, 1);
        assert_eq!(
            h.ctx.registry.drain_inbox(1234).await,
            vec![vec![0xaa, 0xbb]]
        );
    }

    #[tokio::test]
    async fn checkpoints_require_a_numeric_pid() {
        let h = harness();
        let app = build_router(h.ctx.clone());

        let missing = Request::builder()
            .method(Method::POST)
            .uri("/Checkpoints")
            .body(Body::from("x"))
            .expect("request");
        let response = app.clone().oneshot(missing).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let garbled = Request::builder()
            .method(Method::POST)
            .uri("/Checkpoints?pid=abc")
            .body(Body::from("x"))
            .expect("request");
        let response = app.oneshot(garbled).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn checkpoint_body_is_written_to_the_work_dir() {
        let h = harness();
        let app = build_router(h.ctx.clone());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/Checkpoints?pid=321")
            .header(header::CONTENT_TYPE, "binary/octet-stream")
            .body(Body::from("not really a tarball"))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        // The handler acknowledges once the body is on disk; the (failing)
        // unpack happens on a background task.
        assert_eq!(response.status(), StatusCode::OK);
        let stored = std::fs::read(h.ctx.config.work_dir.join("321.tar.gz")).expect("archive");
        assert_eq!(stored, b"not really a tarball");
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let h = harness();
        let app = build_router(h.ctx.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::GET)
                    .uri("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
