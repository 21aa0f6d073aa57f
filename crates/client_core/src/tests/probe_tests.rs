use super::*;
use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

#[derive(Clone, Default)]
struct Hits {
    paths: Arc<Mutex<Vec<String>>>,
}

async fn spawn_backend(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}")
}

fn counting(hits: Hits, router: Router<Hits>) -> Router {
    router.with_state(hits)
}

#[tokio::test]
async fn first_successful_candidate_wins_and_short_circuits() {
    let hits = Hits::default();
    let router = counting(
        hits.clone(),
        Router::new()
            .route(
                "/messages/contacts",
                get(|State(hits): State<Hits>| async move {
                    hits.paths.lock().await.push("contacts".into());
                    StatusCode::NOT_FOUND
                }),
            )
            .route(
                "/messages/all",
                get(|State(hits): State<Hits>| async move {
                    hits.paths.lock().await.push("all".into());
                    Json(serde_json::json!([{"_id": "u1", "fullName": "Bob"}]))
                }),
            )
            .route(
                "/messages/users",
                get(|State(hits): State<Hits>| async move {
                    hits.paths.lock().await.push("users".into());
                    Json(serde_json::json!([]))
                }),
            ),
    );
    let base = spawn_backend(router).await;

    let prober = EndpointProber::new(reqwest::Client::new());
    let hit = prober
        .resolve(&base, "contacts", &CONTACT_CANDIDATES)
        .await
        .expect("resolve");

    assert_eq!(hit.url, format!("{base}/messages/all"));
    assert_eq!(hit.body[0]["fullName"], "Bob");
    // Later candidates were never touched.
    assert_eq!(*hits.paths.lock().await, vec!["contacts", "all"]);
}

#[tokio::test]
async fn unparseable_bodies_advance_to_the_next_candidate() {
    let router = Router::new()
        .route("/messages/contacts", get(|| async { "<html>not json</html>" }))
        .route(
            "/messages/all",
            get(|| async { Json(serde_json::json!([])) }),
        );
    let base = spawn_backend(router).await;

    let prober = EndpointProber::new(reqwest::Client::new());
    let hit = prober
        .resolve(&base, "contacts", &CONTACT_CANDIDATES)
        .await
        .expect("resolve");
    assert_eq!(hit.url, format!("{base}/messages/all"));
}

#[tokio::test]
async fn exhausting_all_candidates_reports_every_failure() {
    let base = spawn_backend(Router::new()).await;

    let prober = EndpointProber::new(reqwest::Client::new());
    let err = prober
        .resolve(&base, "chats", &CHAT_CANDIDATES)
        .await
        .expect_err("no endpoint should resolve");

    assert_eq!(err.resource, "chats");
    assert_eq!(err.tried, CHAT_CANDIDATES.len());
    assert_eq!(err.failures.len(), CHAT_CANDIDATES.len());
    assert!(err.to_string().contains("no chats endpoint responded"));
}
