use crate::{handlers, AppState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Multipart framing and text fields on top of the image itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Creates the Axum router and associates routes with handlers.
pub fn create_router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/api/memes", get(handlers::list_memes).post(handlers::create_meme))
        .route("/api/memes/trending/today", get(handlers::trending_today))
        .route("/api/memes/user/mymemes", get(handlers::my_memes))
        .route(
            "/api/memes/{id}",
            get(handlers::get_meme)
                .patch(handlers::update_meme)
                .delete(handlers::delete_meme),
        )
        .route("/api/memes/{id}/vote", post(handlers::vote_meme))
        .route("/api/memes/{id}/flag", post(handlers::flag_meme))
        .route("/api/comments", post(handlers::add_comment))
        .route("/api/comments/meme/{meme_id}", get(handlers::list_comments))
        .route("/api/comments/{id}", delete(handlers::delete_comment))
        .route("/api/profile/{user_id}/stats", get(handlers::creator_stats))
        .route("/images/{key}", get(handlers::get_image))
        .route("/healthz", get(handlers::healthz))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        // Oversized images still reach the service, which answers with a 400.
        .layer(DefaultBodyLimit::max(max_upload_bytes + FORM_OVERHEAD_BYTES))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, startup};
    use reqwest::{multipart, Client, StatusCode};
    use serde_json::{json, Value};

    const ALICE: &str = "alice-token";
    const BOB: &str = "bob-token";

    async fn spawn_app() -> String {
        let config = Config::from_lookup(|key| match key {
            "STORAGE_BACKEND" => Some("memory".to_string()),
            "SEED_SESSIONS" => Some(format!("{ALICE}:u-alice:alice,{BOB}:u-bob:bob")),
            _ => None,
        })
        .unwrap();
        let state = Arc::new(startup::memory_state(&config).await);
        let app = create_router(state, config.max_upload_bytes);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn upload(client: &Client, base: &str, token: &str) -> Value {
        let image = multipart::Part::bytes(vec![0x89, b'P', b'N', b'G'])
            .file_name("cat.png")
            .mime_str("image/png")
            .unwrap();
        let form = multipart::Form::new()
            .part("image", image)
            .text("topText", "when the build")
            .text("bottomText", "finally passes")
            .text("tags", "Cats, cats ,dev");
        let resp = client
            .post(format!("{base}/api/memes"))
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        resp.json().await.unwrap()
    }

    #[tokio::test]
    async fn meme_lifecycle_over_http() {
        let base = spawn_app().await;
        let client = Client::new();

        let meme = upload(&client, &base, ALICE).await;
        let id = meme["id"].as_str().unwrap().to_string();
        assert_eq!(meme["tags"], json!(["cats", "dev"]));
        assert_eq!(meme["upvotes"], 0);

        // The stored image is served back under its public URL.
        let image_url = meme["image"]["url"].as_str().unwrap();
        let resp = client.get(format!("{base}{image_url}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "image/png");

        let vote = |token: &'static str, kind: &'static str| {
            let client = client.clone();
            let url = format!("{base}/api/memes/{id}/vote");
            async move {
                let resp = client
                    .post(url)
                    .bearer_auth(token)
                    .json(&json!({ "voteType": kind }))
                    .send()
                    .await
                    .unwrap();
                assert_eq!(resp.status(), StatusCode::OK);
                resp.json::<Value>().await.unwrap()
            }
        };
        let outcome = vote(BOB, "up").await;
        assert_eq!(outcome, json!({ "upvotes": 1, "downvotes": 0, "effectiveVote": "up" }));
        let outcome = vote(BOB, "down").await;
        assert_eq!(outcome, json!({ "upvotes": 0, "downvotes": 1, "effectiveVote": "down" }));
        let outcome = vote(BOB, "down").await;
        assert_eq!(outcome, json!({ "upvotes": 0, "downvotes": 0, "effectiveVote": null }));

        let resp = client
            .post(format!("{base}/api/comments"))
            .bearer_auth(BOB)
            .json(&json!({ "memeId": id, "text": "  nice  " }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let comment: Value = resp.json().await.unwrap();
        assert_eq!(comment["text"], "nice");

        let detail: Value = client
            .get(format!("{base}/api/memes/{id}"))
            .bearer_auth(BOB)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["views"], 1);
        assert_eq!(detail["commentCount"], 1);
        assert_eq!(detail["userVote"], Value::Null);

        // Only the creator may delete.
        let resp = client
            .delete(format!("{base}/api/memes/{id}"))
            .bearer_auth(BOB)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = client
            .delete(format!("{base}/api/memes/{id}"))
            .bearer_auth(ALICE)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client.get(format!("{base}/api/memes/{id}")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());

        let comments: Value = client
            .get(format!("{base}/api/comments/meme/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(comments["total"], 0);
    }

    #[tokio::test]
    async fn requests_without_a_valid_session_are_rejected() {
        let base = spawn_app().await;
        let client = Client::new();
        let meme = upload(&client, &base, ALICE).await;
        let id = meme["id"].as_str().unwrap();

        let resp = client
            .post(format!("{base}/api/memes/{id}/vote"))
            .json(&json!({ "voteType": "up" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = client
            .post(format!("{base}/api/memes/{id}/flag"))
            .bearer_auth("not-a-session")
            .json(&json!({ "reason": "spam" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        // Public reads still work for anonymous callers.
        let resp = client.get(format!("{base}/api/memes")).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_input_is_a_client_error() {
        let base = spawn_app().await;
        let client = Client::new();
        let meme = upload(&client, &base, ALICE).await;
        let id = meme["id"].as_str().unwrap();

        let resp = client
            .post(format!("{base}/api/memes/{id}/vote"))
            .bearer_auth(BOB)
            .json(&json!({ "voteType": "sideways" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{base}/api/memes/not-a-uuid"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = client
            .post(format!("{base}/api/memes/{id}/flag"))
            .bearer_auth(BOB)
            .json(&json!({ "reason": "spam" }))
            .send()
            .await
            .unwrap();
        let flagged: Value = resp.json().await.unwrap();
        assert_eq!(flagged, json!({ "flagCount": 1, "isFlagged": true }));

        let health = client.get(format!("{base}/healthz")).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn malformed_json_bodies_get_a_json_400() {
        let base = spawn_app().await;
        let client = Client::new();
        let meme = upload(&client, &base, ALICE).await;
        let id = meme["id"].as_str().unwrap();

        for body in [json!({}), json!({ "voteType": 5 }), json!({ "voteType": null })] {
            let resp = client
                .post(format!("{base}/api/memes/{id}/vote"))
                .bearer_auth(BOB)
                .json(&body)
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "body {body}");
            let error: Value = resp.json().await.unwrap();
            assert!(error["error"].is_string(), "body {body}");
        }

        let resp = client
            .post(format!("{base}/api/comments"))
            .bearer_auth(BOB)
            .header("content-type", "application/json")
            .body("{\"memeId\": ")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Nothing was recorded by the rejected requests.
        let detail: Value = client
            .get(format!("{base}/api/memes/{id}"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(detail["upvotes"], 0);
        assert_eq!(detail["downvotes"], 0);
        assert_eq!(detail["commentCount"], 0);
    }
}
