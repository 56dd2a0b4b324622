//! Probe endpoints: liveness must not depend on tenancy or the database,
//! readiness may degrade.

mod common;

use reqwest::StatusCode;

#[tokio::test]
async fn healthz_is_ok_without_a_host_match() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    // No recognizable Host header at all: probes bypass tenant resolution.
    let resp = common::get_on_host(server, "10.0.0.99", "/healthz").await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn readyz_reports_ok_or_degraded() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let resp = common::get_on_host(server, "example.com", "/readyz").await?;
    assert!(
        resp.status() == StatusCode::OK || resp.status() == StatusCode::SERVICE_UNAVAILABLE,
        "unexpected readyz status: {}",
        resp.status()
    );
    Ok(())
}
