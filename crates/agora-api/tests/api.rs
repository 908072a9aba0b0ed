use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

use agora_api::uploads::UploadStore;
use agora_api::{AppState, AppStateInner, Settings, router};
use agora_db::Database;
use agora_gateway::dispatcher::Dispatcher;
use agora_notify::{Mailer, OutgoingMail, PushError, PushSender, PushTarget};
use agora_types::api::PushPayload;
use agora_types::events::{GatewayEvent, MessageAction};

const SECRET: &str = "integration-test-secret";

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<OutgoingMail>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, mail: OutgoingMail) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(mail);
        Ok(())
    }
}

/// Records deliveries; endpoints containing "gone" answer like an
/// expired subscription.
#[derive(Default)]
struct RecordingPush {
    sent: Mutex<Vec<(String, PushPayload)>>,
}

#[async_trait]
impl PushSender for RecordingPush {
    async fn send(&self, target: &PushTarget, payload: &[u8]) -> Result<(), PushError> {
        if target.endpoint.contains("gone") {
            return Err(PushError::Gone);
        }
        let payload: PushPayload = serde_json::from_slice(payload).unwrap();
        self.sent.lock().unwrap().push((target.endpoint.clone(), payload));
        Ok(())
    }
}

struct TestApp {
    router: Router,
    state: AppState,
    mailer: Arc<RecordingMailer>,
    push: Arc<RecordingPush>,
    _dir: TempDir,
}

struct TestUser {
    id: String,
    token: String,
}

impl TestApp {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("agora.db")).unwrap());
        let uploads = UploadStore::new(dir.path().join("uploads")).await.unwrap();
        let mailer = Arc::new(RecordingMailer::default());
        let push = Arc::new(RecordingPush::default());

        let state: AppState = Arc::new(AppStateInner {
            db,
            jwt_secret: SECRET.into(),
            dispatcher: Dispatcher::new(),
            mailer: mailer.clone(),
            push: push.clone(),
            uploads,
            settings: Settings {
                frontend_url: "http://app.test".into(),
                vapid_public_key: None,
                max_upload_bytes: 1024,
            },
        });

        Self {
            router: router(state.clone()),
            state,
            mailer,
            push,
            _dir: dir,
        }
    }

    async fn call(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.send(request).await
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, value)
    }

    fn last_verification_token(&self) -> String {
        let sent = self.mailer.sent.lock().unwrap();
        let html = &sent.last().expect("a verification mail").html;
        let start = html.find("token=").unwrap() + "token=".len();
        html[start..].split('"').next().unwrap().to_string()
    }

    /// Register, verify and log in.
    async fn user(&self, username: &str) -> TestUser {
        let (status, body) = self
            .call(
                "POST",
                "/api/auth/register",
                None,
                Some(json!({
                    "username": username,
                    "email": format!("{}@example.com", username),
                    "password": "correct-horse"
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        let token = self.last_verification_token();
        let (status, _) = self
            .call("GET", &format!("/api/auth/verify-email?token={}", token), None, None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = self
            .call(
                "POST",
                "/api/auth/login",
                None,
                Some(json!({"email": format!("{}@example.com", username), "password": "correct-horse"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        TestUser {
            id: body["user"]["id"].as_str().unwrap().to_string(),
            token: body["token"].as_str().unwrap().to_string(),
        }
    }

    async fn subscribe(&self, user: &TestUser, endpoint: &str) {
        let (status, _) = self
            .call(
                "POST",
                "/api/notifications/subscribe",
                Some(&user.token),
                Some(json!({"endpoint": endpoint, "keys": {"p256dh": "p", "auth": "a"}})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    /// Push delivery runs in background tasks.
    async fn wait_for_pushes(&self, count: usize) -> Vec<(String, PushPayload)> {
        for _ in 0..200 {
            {
                let sent = self.push.sent.lock().unwrap();
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.push.sent.lock().unwrap().clone()
    }

    fn upload_exists(&self, url: &str) -> bool {
        let relative = url.strip_prefix("/uploads/").unwrap();
        self.state.uploads.root().join(relative).exists()
    }

    /// File cleanup after a delete runs in a background task.
    async fn wait_for_removal(&self, url: &str) -> bool {
        for _ in 0..200 {
            if !self.upload_exists(url) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn post(&self, user: &TestUser, content: &str) -> String {
        let (status, post) = self
            .call("POST", "/api/posts", Some(&user.token), Some(json!({"content": content})))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", post);
        post["id"].as_str().unwrap().to_string()
    }

    async fn upload(&self, token: &str, folder: &str, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
        let boundary = "agora-test-boundary";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/uploads/{}", folder))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        self.send(request).await
    }
}

#[tokio::test]
async fn registration_requires_email_verification() {
    let app = TestApp::new().await;
    let (status, body) = app
        .call(
            "POST",
            "/api/auth/register",
            None,
            Some(json!({"username": "alice", "email": "Alice@Example.com", "password": "correct-horse"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["user_id"].is_string());

    let mail = app.mailer.sent.lock().unwrap()[0].clone();
    assert_eq!(mail.to, "alice@example.com");
    assert!(mail.html.contains("http://app.test/verify-email?token="));

    let login = json!({"email": "alice@example.com", "password": "correct-horse"});
    let (status, body) = app.call("POST", "/api/auth/login", None, Some(login.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Email not verified");

    let (status, _) = app
        .call("GET", "/api/auth/verify-email?token=bogus", None, None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let token = app.last_verification_token();
    let (status, _) = app
        .call("GET", &format!("/api/auth/verify-email?token={}", token), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.call("POST", "/api/auth/login", None, Some(login)).await;
    assert_eq!(status, StatusCode::OK);
    let jwt = body["token"].as_str().unwrap().to_string();
    assert_eq!(body["user"]["is_verified"], true);

    let (status, me) = app.call("GET", "/api/auth/me", Some(&jwt), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "alice");

    // Username also works as the login identifier.
    let (status, _) = app
        .call(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({"email": "alice", "password": "wrong-password"})),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_validation_and_conflicts() {
    let app = TestApp::new().await;
    app.user("alice").await;

    let cases = [
        (json!({"username": "al", "email": "x@example.com", "password": "long-enough"}), StatusCode::BAD_REQUEST),
        (json!({"username": "bob", "email": "not-an-email", "password": "long-enough"}), StatusCode::BAD_REQUEST),
        (json!({"username": "bob", "email": "bob@example.com", "password": "short"}), StatusCode::BAD_REQUEST),
        (json!({"username": "ALICE", "email": "other@example.com", "password": "long-enough"}), StatusCode::CONFLICT),
        (json!({"username": "bob", "email": "ALICE@example.com", "password": "long-enough"}), StatusCode::CONFLICT),
    ];
    for (body, expected) in cases {
        let (status, response) = app.call("POST", "/api/auth/register", None, Some(body.clone())).await;
        assert_eq!(status, expected, "{} -> {}", body, response);
        assert!(response["error"].is_string());
    }

    let (status, body) = app
        .call("POST", "/api/auth/register", None, Some(json!({"username": "bob"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid request body");
    assert!(body["details"].is_string());
}

#[tokio::test]
async fn protected_routes_require_a_valid_token() {
    let app = TestApp::new().await;
    let (status, _) = app.call("GET", "/api/users", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app.call("GET", "/api/posts", Some("garbage"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid or expired token");

    // Public reads work anonymously.
    let (status, body) = app.call("GET", "/api/posts", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn posts_extract_media_and_enforce_authorship() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;

    let (status, post) = app
        .call(
            "POST",
            "/api/posts",
            Some(&alice.token),
            Some(json!({
                "title": "Trip",
                "content": "<p>Look</p><p><img src=\"/uploads/posts/a.png\"></p><video controls><source src=\"/uploads/posts/b.mp4\"></video>"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{}", post);
    assert_eq!(post["content"], "<p>Look</p>");
    assert_eq!(post["media_type"], "image");
    assert_eq!(post["media_path"], "/uploads/posts/a.png");
    assert_eq!(post["media"].as_array().unwrap().len(), 2);
    assert_eq!(post["media"][1]["media_type"], "video");
    let post_id = post["id"].as_str().unwrap().to_string();

    let (status, _) = app
        .call("POST", "/api/posts", Some(&alice.token), Some(json!({"content": "<p></p>"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call("POST", "/api/posts", Some(&alice.token), Some(json!({"title": "x".repeat(201), "content": "hi"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app
        .call(
            "PUT",
            &format!("/api/posts/{}", post_id),
            Some(&bob.token),
            Some(json!({"content": "hijacked"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, updated) = app
        .call(
            "PUT",
            &format!("/api/posts/{}", post_id),
            Some(&alice.token),
            Some(json!({"content": "just text"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["content"], "just text");
    assert_eq!(updated["title"], "Trip");
    assert!(updated["media_type"].is_null());
    assert_eq!(updated["media"], json!([]));

    let (status, _) = app
        .call("DELETE", &format!("/api/posts/{}", post_id), Some(&bob.token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = app
        .call("DELETE", &format!("/api/posts/{}", post_id), Some(&alice.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.call("GET", &format!("/api/posts/{}", post_id), None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app.call("GET", "/api/posts/not-a-uuid", None, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn likes_toggle_and_notify_the_author() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    app.subscribe(&alice, "https://push.test/alice").await;

    let (_, post) = app
        .call("POST", "/api/posts", Some(&alice.token), Some(json!({"content": "hello"})))
        .await;
    let like_uri = format!("/api/posts/{}/like", post["id"].as_str().unwrap());

    let (status, body) = app.call("POST", &like_uri, Some(&bob.token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"liked": true, "like_count": 1}));

    let pushes = app.wait_for_pushes(1).await;
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0].0, "https://push.test/alice");
    assert_eq!(pushes[0].1.title, "bob liked your post");

    let (_, body) = app.call("POST", &like_uri, Some(&bob.token), None).await;
    assert_eq!(body, json!({"liked": false, "like_count": 0}));

    // Liking your own post never notifies.
    let (_, body) = app.call("POST", &like_uri, Some(&alice.token), None).await;
    assert_eq!(body["liked"], true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(app.push.sent.lock().unwrap().len(), 1);

    let (_, listed) = app.call("GET", "/api/posts", Some(&alice.token), None).await;
    assert_eq!(listed[0]["liked_by_me"], true);
    let (_, listed) = app.call("GET", "/api/posts", Some(&bob.token), None).await;
    assert_eq!(listed[0]["liked_by_me"], false);
}

#[tokio::test]
async fn gone_subscriptions_are_removed() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    app.subscribe(&alice, "https://push.test/gone").await;

    let (status, _) = app
        .call("POST", &format!("/api/users/{}/follow", alice.id), Some(&bob.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let db_alice = alice.id.clone();
    let mut remaining = 1;
    for _ in 0..200 {
        remaining = app.state.db.get_push_subscriptions(&db_alice).unwrap().len();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn comment_threads() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    let carol = app.user("carol").await;
    app.subscribe(&alice, "https://push.test/alice").await;
    app.subscribe(&bob, "https://push.test/bob").await;

    let (_, post) = app
        .call("POST", "/api/posts", Some(&alice.token), Some(json!({"content": "post"})))
        .await;
    let post_id = post["id"].as_str().unwrap().to_string();
    let (_, other) = app
        .call("POST", "/api/posts", Some(&alice.token), Some(json!({"content": "other"})))
        .await;
    let comments_uri = format!("/api/posts/{}/comments", post_id);

    let (status, root) = app
        .call("POST", &comments_uri, Some(&bob.token), Some(json!({"content": "first!"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    let root_id = root["id"].as_str().unwrap().to_string();

    let (status, reply) = app
        .call(
            "POST",
            &comments_uri,
            Some(&carol.token),
            Some(json!({"content": "reply", "parent_id": root_id})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(reply["parent_id"], root_id.as_str());

    // bob's comment notified alice; carol's reply notified alice and bob.
    let pushes = app.wait_for_pushes(3).await;
    assert_eq!(pushes.len(), 3);
    assert!(pushes.iter().any(|(e, p)| e.ends_with("/bob") && p.title == "carol replied to your comment"));

    let (status, _) = app
        .call(
            "POST",
            &format!("/api/posts/{}/comments", other["id"].as_str().unwrap()),
            Some(&carol.token),
            Some(json!({"content": "x", "parent_id": root_id})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, tree) = app.call("GET", &comments_uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tree.as_array().unwrap().len(), 1);
    assert_eq!(tree[0]["replies"][0]["content"], "reply");

    let (_, detail) = app.call("GET", &format!("/api/posts/{}", post_id), None, None).await;
    assert_eq!(detail["comment_count"], 2);
    assert_eq!(detail["comments"][0]["id"], root_id.as_str());

    let (status, like) = app
        .call("POST", &format!("/api/comments/{}/like", root_id), Some(&carol.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(like["like_count"], 1);

    let (status, _) = app
        .call(
            "PUT",
            &format!("/api/comments/{}", root_id),
            Some(&carol.token),
            Some(json!({"content": "edited"})),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call("DELETE", &format!("/api/comments/{}", root_id), Some(&bob.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, tree) = app.call("GET", &comments_uri, None, None).await;
    assert_eq!(tree, json!([]));

    let (status, _) = app
        .call("GET", &format!("/api/posts/{}/comments", uuid::Uuid::new_v4()), None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn direct_messages() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    let mut events = app.state.dispatcher.subscribe();

    let with_bob = format!("/api/messages/with/{}", bob.id);
    let with_alice = format!("/api/messages/with/{}", alice.id);

    let (status, _) = app
        .call("POST", &with_alice, Some(&alice.token), Some(json!({"content": "me"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .call(
            "POST",
            &format!("/api/messages/with/{}", uuid::Uuid::new_v4()),
            Some(&alice.token),
            Some(json!({"content": "anyone?"})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, first) = app
        .call("POST", &with_bob, Some(&alice.token), Some(json!({"content": "hi bob"})))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    app.call("POST", &with_bob, Some(&alice.token), Some(json!({"content": "you there?"})))
        .await;

    match events.recv().await.unwrap() {
        GatewayEvent::MessageUpdate { action, message } => {
            assert_eq!(action, MessageAction::Created);
            assert_eq!(message.content, "hi bob");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match events.recv().await.unwrap() {
        GatewayEvent::ChatListUpdate { user_ids } => assert_eq!(user_ids.len(), 2),
        other => panic!("unexpected event {:?}", other),
    }

    let (_, conversations) = app.call("GET", "/api/messages/conversations", Some(&bob.token), None).await;
    assert_eq!(conversations[0]["partner"]["username"], "alice");
    assert_eq!(conversations[0]["unread_count"], 2);
    assert_eq!(conversations[0]["last_message"]["content"], "you there?");

    let (status, history) = app.call("GET", &with_alice, Some(&bob.token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history[0]["content"], "hi bob");
    assert_eq!(history[1]["is_read"], true);

    let (_, conversations) = app.call("GET", "/api/messages/conversations", Some(&bob.token), None).await;
    assert_eq!(conversations[0]["unread_count"], 0);

    let (_, page) = app
        .call("GET", &format!("{}?limit=1", with_alice), Some(&bob.token), None)
        .await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["content"], "you there?");

    let message_uri = format!("/api/messages/{}", first["id"].as_str().unwrap());
    let (status, _) = app
        .call("PUT", &message_uri, Some(&bob.token), Some(json!({"content": "nope"})))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, edited) = app
        .call("PUT", &message_uri, Some(&alice.token), Some(json!({"content": "hi bob!"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["content"], "hi bob!");

    let (status, _) = app.call("DELETE", &message_uri, Some(&alice.token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, history) = app.call("GET", &with_bob, Some(&alice.token), None).await;
    assert_eq!(history.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn follows_profiles_and_feeds() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    let carol = app.user("carol").await;

    app.call("POST", "/api/posts", Some(&alice.token), Some(json!({"content": "from alice"})))
        .await;
    app.call("POST", "/api/posts", Some(&carol.token), Some(json!({"content": "from carol"})))
        .await;

    let follow_alice = format!("/api/users/{}/follow", alice.id);
    let (status, _) = app
        .call("POST", &format!("/api/users/{}/follow", bob.id), Some(&bob.token), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app
        .call(
            "POST",
            &format!("/api/users/{}/follow", uuid::Uuid::new_v4()),
            Some(&bob.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = app.call("POST", &follow_alice, Some(&bob.token), None).await;
    assert_eq!(body, json!({"following": true, "follower_count": 1}));

    let (_, feed) = app
        .call("GET", "/api/posts?feed=following", Some(&bob.token), None)
        .await;
    assert_eq!(feed.as_array().unwrap().len(), 1);
    assert_eq!(feed[0]["author"]["username"], "alice");

    let (status, _) = app.call("GET", "/api/posts?feed=following", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (_, all) = app.call("GET", "/api/posts?limit=1", None, None).await;
    assert_eq!(all.as_array().unwrap().len(), 1);
    assert_eq!(all[0]["content"], "from carol");

    let (_, profile) = app
        .call("GET", &format!("/api/users/{}", alice.id), Some(&bob.token), None)
        .await;
    assert_eq!(profile["username"], "alice");
    assert_eq!(profile["post_count"], 1);
    assert_eq!(profile["follower_count"], 1);
    assert_eq!(profile["is_following"], true);

    let (_, followers) = app
        .call("GET", &format!("/api/users/{}/followers", alice.id), None, None)
        .await;
    assert_eq!(followers[0]["username"], "bob");
    let (_, following) = app
        .call("GET", &format!("/api/users/{}/following", bob.id), None, None)
        .await;
    assert_eq!(following[0]["username"], "alice");

    let (_, posts) = app
        .call("GET", &format!("/api/users/{}/posts", carol.id), None, None)
        .await;
    assert_eq!(posts[0]["content"], "from carol");

    let (_, body) = app.call("POST", &follow_alice, Some(&bob.token), None).await;
    assert_eq!(body, json!({"following": false, "follower_count": 0}));
}

#[tokio::test]
async fn profile_updates_and_user_list() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;

    let (status, users) = app.call("GET", "/api/users", Some(&alice.token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 1);
    assert_eq!(users[0]["username"], "bob");
    assert_eq!(users[0]["online"], false);

    let (status, _) = app
        .call("PUT", "/api/users/me", Some(&bob.token), Some(json!({"username": "Alice"})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, me) = app
        .call(
            "PUT",
            "/api/users/me",
            Some(&bob.token),
            Some(json!({"username": "bobby", "bio": "hello"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["username"], "bobby");
    assert_eq!(me["bio"], "hello");

    let (status, _) = app
        .call("PUT", "/api/users/me", Some(&bob.token), Some(json!({"username": "no spaces"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn uploads() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;

    let (status, body) = app.upload(&alice.token, "posts", "photo.PNG", b"fake png").await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    assert_eq!(body["media_type"], "image");
    assert_eq!(body["size"], 8);
    let url = body["url"].as_str().unwrap();
    assert!(url.starts_with("/uploads/posts/") && url.ends_with(".png"));

    let (status, _) = app.upload(&alice.token, "secrets", "a.png", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.upload(&alice.token, "posts", "tool.exe", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.upload(&alice.token, "avatars", "clip.mp4", b"x").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.upload(&alice.token, "posts", "empty.png", b"").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = app.upload(&alice.token, "posts", "big.png", &[0u8; 2048]).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);

    let (status, body) = app.upload(&alice.token, "avatars", "me.jpg", b"jpeg").await;
    assert_eq!(status, StatusCode::CREATED);
    let (_, me) = app.call("GET", "/api/auth/me", Some(&alice.token), None).await;
    assert_eq!(me["avatar_url"], body["url"]);
}

#[tokio::test]
async fn push_configuration_endpoints() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;

    let (status, _) = app
        .call("GET", "/api/notifications/vapid-public-key", None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = app
        .call(
            "POST",
            "/api/notifications/subscribe",
            Some(&alice.token),
            Some(json!({"endpoint": "http://insecure.test", "keys": {"p256dh": "p", "auth": "a"}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    app.subscribe(&alice, "https://push.test/alice").await;
    let unsubscribe = json!({"endpoint": "https://push.test/alice"});
    let (status, _) = app
        .call("DELETE", "/api/notifications/subscribe", Some(&alice.token), Some(unsubscribe.clone()))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .call("DELETE", "/api/notifications/subscribe", Some(&alice.token), Some(unsubscribe))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deleting_content_only_removes_the_deleters_own_uploads() {
    let app = TestApp::new().await;
    let bob = app.user("bob").await;
    let mallory = app.user("mallory").await;

    let (_, avatar) = app.upload(&bob.token, "avatars", "me.png", b"bob").await;
    let bob_avatar = avatar["url"].as_str().unwrap().to_string();
    let (_, shared) = app.upload(&bob.token, "posts", "shared.png", b"bob").await;
    let bob_photo = shared["url"].as_str().unwrap().to_string();
    let (_, own) = app.upload(&mallory.token, "posts", "own.png", b"mallory").await;
    let mallory_photo = own["url"].as_str().unwrap().to_string();

    let post_id = app
        .post(
            &mallory,
            &format!(
                "<p>mine</p><img src=\"{}\"><img src=\"{}\"><img src=\"{}\">",
                bob_avatar, bob_photo, mallory_photo
            ),
        )
        .await;
    let (status, _) = app
        .call("DELETE", &format!("/api/posts/{}", post_id), Some(&mallory.token), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    assert!(app.wait_for_removal(&mallory_photo).await);
    assert!(app.upload_exists(&bob_avatar));
    assert!(app.upload_exists(&bob_photo));

    // Bob's own post embedding his photo still cleans it up.
    let post_id = app.post(&bob, &format!("<img src=\"{}\">", bob_photo)).await;
    app.call("DELETE", &format!("/api/posts/{}", post_id), Some(&bob.token), None)
        .await;
    assert!(app.wait_for_removal(&bob_photo).await);
    assert!(app.upload_exists(&bob_avatar));
}

#[tokio::test]
async fn replacing_an_avatar_spares_files_that_are_not_yours() {
    let app = TestApp::new().await;
    let bob = app.user("bob").await;
    let mallory = app.user("mallory").await;

    let (_, photo) = app.upload(&bob.token, "posts", "photo.png", b"bob").await;
    let bob_photo = photo["url"].as_str().unwrap().to_string();

    let (status, _) = app
        .call("PUT", "/api/users/me", Some(&mallory.token), Some(json!({"avatar_url": bob_photo})))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app.upload(&mallory.token, "avatars", "new.png", b"mallory").await;
    assert_eq!(status, StatusCode::CREATED);

    assert!(app.upload_exists(&bob_photo));
}

#[tokio::test]
async fn failed_upload_claim_removes_the_stored_file() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;

    let id = alice.id.clone();
    app.state
        .db
        .with_conn_mut(|conn| {
            conn.execute("DELETE FROM users WHERE id = ?1", [&id])?;
            Ok(())
        })
        .unwrap();

    let (status, _) = app.upload(&alice.token, "avatars", "me.png", b"png").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let stored = std::fs::read_dir(app.state.uploads.root().join("avatars")).unwrap().count();
    assert_eq!(stored, 0);
}

#[tokio::test]
async fn push_titles_follow_profile_renames() {
    let app = TestApp::new().await;
    let alice = app.user("alice").await;
    let bob = app.user("bob").await;
    app.subscribe(&bob, "https://push.test/bob").await;

    let (status, _) = app
        .call("PUT", "/api/users/me", Some(&alice.token), Some(json!({"username": "alicia"})))
        .await;
    assert_eq!(status, StatusCode::OK);

    // Still the token issued before the rename.
    app.call("POST", &format!("/api/users/{}/follow", bob.id), Some(&alice.token), None)
        .await;
    app.call(
        "POST",
        &format!("/api/messages/with/{}", bob.id),
        Some(&alice.token),
        Some(json!({"content": "<p>hi</p>"})),
    )
    .await;

    let pushes = app.wait_for_pushes(2).await;
    assert_eq!(pushes.len(), 2);
    let texts: Vec<String> = pushes
        .iter()
        .map(|(_, p)| format!("{} / {}", p.title, p.body))
        .collect();
    assert!(texts.iter().any(|t| t.contains("alicia started following you")), "{:?}", texts);
    assert!(texts.iter().any(|t| t.contains("New message from alicia")), "{:?}", texts);
    assert!(texts.iter().all(|t| !t.contains("alice ")), "{:?}", texts);
}
