//! Host-driven routing: public host, unknown subdomains, foreign hosts.

mod common;

use reqwest::StatusCode;

#[tokio::test]
async fn foreign_host_is_rejected_as_unrecognized() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let resp = common::get_on_host(server, "shop.other.org", "/tenant/info").await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], "HOST_UNRECOGNIZED");
    assert!(body["correlation_id"].is_string());
    Ok(())
}

#[tokio::test]
async fn unknown_subdomain_is_not_found() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let resp = common::get_on_host(server, "no-such-store.example.com", "/tenant/info").await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn public_host_reports_public_scope() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let resp = common::get_on_host(server, "example.com", "/tenant/info").await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["data"]["type"], "public");
    Ok(())
}

#[tokio::test]
async fn host_normalization_strips_port_and_case() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let resp = common::get_on_host(server, "EXAMPLE.COM:8443", "/tenant/info").await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["data"]["type"], "public");
    Ok(())
}

#[tokio::test]
async fn tenant_routes_are_hidden_on_the_public_host() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    // Public host serving tenant CRUD would break isolation; the response
    // must be a plain 404, not a 401 that confirms the route exists.
    let resp = common::get_on_host(server, "example.com", "/products").await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["code"], "NOT_FOUND");
    assert_eq!(body["message"], "not found");
    Ok(())
}

#[tokio::test]
async fn signup_is_not_served_on_tenant_hosts() -> anyhow::Result<()> {
    let Some(server) = common::server().await else {
        return Ok(());
    };

    let key = common::fresh_key("routing");
    let payload = serde_json::json!({
        "store_name": "Routing Test",
        "key": key,
        "admin": {
            "email": "owner@example.com",
            "password": "longenough",
            "first_name": "R",
            "last_name": "T"
        }
    });

    // A host that resolves to no tenant: signup never binds there.
    let resp =
        common::post_on_host(server, "no-such-store.example.com", "/tenant/register", &payload)
            .await?;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    Ok(())
}
