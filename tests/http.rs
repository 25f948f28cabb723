use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use meme_museum::{config::Config, routes::create_router, startup::build_state};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

const BOUNDARY: &str = "meme-boundary";

async fn app() -> Router {
    let config = Config::from_lookup(|_| None).expect("defaults are valid");
    let (state, _worker) = build_state(&config).await.expect("in-memory wiring");
    create_router(Arc::new(state))
}

fn multipart_upload(owner: &str) -> Request<Body> {
    let body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nGrumpy\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"tags\"\r\n\r\ncat, grumpy,\r\n\
         --{b}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"grumpy.png\"\r\n\
         Content-Type: image/png\r\n\r\nPNGDATA\r\n\
         --{b}--\r\n",
        b = BOUNDARY
    );
    Request::builder()
        .method("POST")
        .uri("/memes")
        .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={}", BOUNDARY))
        .header("x-user-email", owner)
        .body(Body::from(body))
        .unwrap()
}

async fn json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn request(method: &str, uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-email", user);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_is_ok() {
    let response = app().await.oneshot(request("GET", "/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_requires_identity() {
    let mut req = multipart_upload("a@x.com");
    req.headers_mut().remove("x-user-email");
    let response = app().await.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(json(response).await["error"].is_string());
}

#[tokio::test]
async fn upload_then_view_like_and_download() {
    let app = app().await;

    let response = app.clone().oneshot(multipart_upload("a@x.com")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let meme = json(response).await;
    assert_eq!(meme["status"], "approved");
    assert_eq!(meme["content_type"], "image/png");
    assert_eq!(meme["tags"], serde_json::json!(["cat", "grumpy"]));
    let id = meme["meme_id"].as_str().unwrap().to_string();

    let response = app.clone().oneshot(request("GET", &format!("/memes/{}", id), None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let view = json(response).await;
    assert_eq!(view["views"], 1);
    assert!(view["url"]["url"].as_str().unwrap().starts_with("memory://"));

    for expected in ["counted", "already_liked"] {
        let response = app
            .clone()
            .oneshot(request("POST", &format!("/memes/{}/like", id), Some("b@x.com")))
            .await
            .unwrap();
        assert_eq!(json(response).await["result"], expected);
    }

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/memes/{}/download", id), Some("b@x.com")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["downloads"], 1);

    let response = app
        .clone()
        .oneshot(request("GET", &format!("/memes/{}/image", id), None))
        .await
        .unwrap();
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"PNGDATA");
}

#[tokio::test]
async fn non_owner_delete_is_forbidden() {
    let app = app().await;
    let meme = json(app.clone().oneshot(multipart_upload("a@x.com")).await.unwrap()).await;
    let uri = format!("/memes/{}", meme["meme_id"].as_str().unwrap());

    let response = app.clone().oneshot(request("DELETE", &uri, Some("b@x.com"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.clone().oneshot(request("DELETE", &uri, Some("a@x.com"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(request("GET", &uri, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_ids_are_bad_requests() {
    let response = app().await.oneshot(request("GET", "/memes/not-a-uuid", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn comments_round_trip_through_the_api() {
    let app = app().await;
    let meme = json(app.clone().oneshot(multipart_upload("a@x.com")).await.unwrap()).await;
    let id = meme["meme_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/memes/{}/comments", id))
                .header("x-user-email", "b@x.com")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"text":"so grumpy"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let comment_id = json(response).await["comment_id"].as_str().unwrap().to_string();

    let uri = format!("/memes/{}/comments/{}", id, comment_id);
    let response = app.clone().oneshot(request("DELETE", &uri, Some("c@x.com"))).await.unwrap();
    assert_eq!(json(response).await["result"], "ignored");

    let response = app.oneshot(request("DELETE", &uri, Some("b@x.com"))).await.unwrap();
    assert_eq!(json(response).await["result"], "removed");
}

#[tokio::test]
async fn activity_can_be_filtered_by_action() {
    let app = app().await;
    let meme = json(app.clone().oneshot(multipart_upload("a@x.com")).await.unwrap()).await;
    let id = meme["meme_id"].as_str().unwrap().to_string();
    app.clone()
        .oneshot(request("POST", &format!("/memes/{}/like", id), Some("b@x.com")))
        .await
        .unwrap();

    // Audit writes are asynchronous.
    let mut events = Value::Null;
    for _ in 0..50 {
        let response = app
            .clone()
            .oneshot(request("GET", "/activity?action=like", Some("admin@x.com")))
            .await
            .unwrap();
        events = json(response).await;
        if events.as_array().is_some_and(|e| !e.is_empty()) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let events = events.as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["actor"], "b@x.com");
    assert_eq!(events[0]["meta"]["meme_id"], id.as_str());
}

#[tokio::test]
async fn activity_requires_identity() {
    let response = app().await.oneshot(request("GET", "/activity", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
