//! Request deadline and pool backpressure both surface as retryable 503s.

mod common;

use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

fn register_payload(key: &str) -> serde_json::Value {
    json!({
        "store_name": "Limits Test",
        "key": key,
        "admin": {
            "email": "owner@example.com",
            "password": "longenough",
            "first_name": "L",
            "last_name": "T"
        }
    })
}

#[tokio::test]
async fn expired_deadline_yields_request_deadline() -> anyhow::Result<()> {
    // A zero deadline expires before any handler that yields can finish.
    let server = common::TestServer::spawn_with(&[("REQUEST_DEADLINE_MS", "0")])?;
    if !server.ready().await {
        return Ok(());
    }

    let key = common::fresh_key("slow");
    let resp = common::post_on_host(
        &server,
        "example.com",
        "/tenant/register",
        &register_payload(&key),
    )
    .await?;

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.headers().get("retry-after").and_then(|v| v.to_str().ok()),
        Some("1")
    );
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], "REQUEST_DEADLINE");
    assert!(body["correlation_id"].is_string());
    Ok(())
}

#[tokio::test]
async fn exhausted_pool_yields_backpressure_timeout() -> anyhow::Result<()> {
    let server = common::TestServer::spawn_with(&[
        ("POOL_MAX", "2"),
        ("POOL_ACQUIRE_TIMEOUT_MS", "300"),
    ])?;
    if !server.ready().await {
        return Ok(());
    }

    // Hold the tenant's advisory lock from outside. A signup for that key
    // then occupies both pool connections: its pipeline session and the
    // elevated lease parked behind the lock.
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&common::db_dsn())
        .await?;
    let key = common::fresh_key("busy");
    sqlx::query("SELECT pg_advisory_lock(hashtext($1))")
        .bind(&key)
        .execute(&pool)
        .await?;

    let base_url = server.base_url.clone();
    let register_key = key.clone();
    let register = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("{}/tenant/register", base_url))
            .header("Host", "example.com")
            .json(&register_payload(&register_key))
            .send()
            .await
    });

    // Give the signup time to commit its tenant row and block on the lock.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let resp = common::get_on_host(&server, "example.com", "/tenant/info").await?;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        resp.headers().get("retry-after").and_then(|v| v.to_str().ok()),
        Some("1")
    );
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], "BACKPRESSURE_TIMEOUT");

    // Unblock; the parked signup finishes normally.
    sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(&key)
        .execute(&pool)
        .await?;
    let resp = register.await??;
    assert_eq!(resp.status(), StatusCode::CREATED);
    Ok(())
}
