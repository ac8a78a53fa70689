mod common;

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Router, routing::post};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Duration;
use common::{TestDb, at};
use taberna_server::server::PushConfig;
use taberna_server::server::push::{PushError, PushSender, endpoint_origin};
use taberna_server::storage::Store;
use taberna_shared::vapid::{self, VapidKey};

const SCALAR: [u8; 32] = [0x11; 32];
const SUBJECT: &str = "mailto:ops@taberna.test";

#[derive(Debug, Clone)]
struct Hit {
    name: String,
    authorization: Option<String>,
    ttl: Option<String>,
}

type Hits = Arc<Mutex<Vec<Hit>>>;

/// Push service stand-in: `/push/{name}` answers by name.
async fn push_endpoint(
    State(hits): State<Hits>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    let header = |key: &str| {
        headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    };
    hits.lock().unwrap().push(Hit {
        name: name.clone(),
        authorization: header("authorization"),
        ttl: header("ttl"),
    });
    match name.as_str() {
        "created" => StatusCode::CREATED,
        "accepted" => StatusCode::ACCEPTED,
        "gone" => StatusCode::GONE,
        "missing" => StatusCode::NOT_FOUND,
        "ok" => StatusCode::OK,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

struct PushService {
    base: String,
    hits: Hits,
    handle: tokio::task::JoinHandle<()>,
}

impl PushService {
    async fn spawn() -> Option<Self> {
        let hits: Hits = Arc::default();
        let app = Router::new()
            .route("/push/{name}", post(push_endpoint))
            .with_state(hits.clone());
        let listener = match tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await {
            Ok(l) => l,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                eprintln!("Skipping test due to sandbox restrictions: {e}");
                return None;
            }
            Err(e) => panic!("failed to bind push service: {e}"),
        };
        let addr: SocketAddr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Some(Self {
            base: format!("http://{addr}"),
            hits,
            handle,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/push/{name}", self.base)
    }

    fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }
}

impl Drop for PushService {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn push_config(private_key: Option<String>, chunk_size: i64) -> PushConfig {
    PushConfig {
        enabled: true,
        vapid_public: None,
        vapid_private: private_key,
        subject: SUBJECT.into(),
        ttl_seconds: 60,
        timeout_secs: 5,
        chunk_size,
        concurrency: 4,
    }
}

fn private_key_b64() -> String {
    URL_SAFE_NO_PAD.encode(SCALAR)
}

async fn subscribe(store: &Store, endpoint: &str) -> i32 {
    store
        .upsert_push_subscription(None, endpoint, "p256dh-key", "auth-secret", "aes128gcm")
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn batch_outcomes_are_classified() {
    let Some(service) = PushService::spawn().await else {
        return;
    };
    let db = TestDb::new().await;
    let a = subscribe(&db.store, &service.endpoint("created")).await;
    let b = subscribe(&db.store, &service.endpoint("gone")).await;
    let c = subscribe(&db.store, &service.endpoint("broken")).await;

    let sender = PushSender::new(&push_config(Some(private_key_b64()), 100), db.store.clone()).unwrap();
    let result = sender
        .send_batch(&[a, b, c], at(2024, 6, 1, 12, 0, 0))
        .await
        .unwrap();

    assert_eq!(result.sent, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.total, 3);
    assert_eq!(result.unknown(), 1);

    let remaining = db.store.list_push_subscription_ids(0, 100).await.unwrap();
    assert_eq!(remaining, vec![a, c]);
}

#[tokio::test]
async fn requests_carry_a_verifiable_vapid_token() {
    let Some(service) = PushService::spawn().await else {
        return;
    };
    let db = TestDb::new().await;
    let id = subscribe(&db.store, &service.endpoint("created")).await;
    let now = at(2024, 6, 1, 12, 0, 0);

    let sender = PushSender::new(&push_config(Some(private_key_b64()), 100), db.store.clone()).unwrap();
    sender.send_batch(&[id], now).await.unwrap();

    let hits = service.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].ttl.as_deref(), Some("60"));
    let authorization = hits[0].authorization.clone().expect("authorization header");

    let key = VapidKey::from_bytes(&SCALAR).unwrap();
    let rest = authorization.strip_prefix("vapid t=").expect("vapid scheme");
    let (token, public) = rest.split_once(", k=").expect("key parameter");
    assert_eq!(public, key.public_key_base64());

    let claims = vapid::verify(token, key.verifying_key()).unwrap();
    assert_eq!(claims.aud, service.base);
    assert_eq!(claims.sub, SUBJECT);
    assert_eq!(claims.exp, (now + Duration::hours(12)).timestamp());
}

#[tokio::test]
async fn missing_or_bad_key_fails_the_batch() {
    let Some(service) = PushService::spawn().await else {
        return;
    };
    let db = TestDb::new().await;
    let id = subscribe(&db.store, &service.endpoint("created")).await;
    let now = at(2024, 6, 1, 12, 0, 0);

    let sender = PushSender::new(&push_config(None, 100), db.store.clone()).unwrap();
    let err = sender.send_batch(&[id], now).await.unwrap_err();
    assert!(matches!(err, PushError::MissingKey), "got {err}");

    let sender = PushSender::new(&push_config(Some("   ".into()), 100), db.store.clone()).unwrap();
    assert!(matches!(
        sender.send_to_all(now).await.unwrap_err(),
        PushError::MissingKey
    ));

    let sender = PushSender::new(&push_config(Some("not*a*key".into()), 100), db.store.clone()).unwrap();
    assert!(matches!(
        sender.send_batch(&[id], now).await.unwrap_err(),
        PushError::Vapid(_)
    ));

    assert!(service.hits().is_empty());
    assert_eq!(db.store.list_push_subscription_ids(0, 10).await.unwrap(), vec![id]);
}

#[tokio::test]
async fn transport_errors_are_unknown() {
    let db = TestDb::new().await;
    // Reserve a port and free it so nothing listens there.
    let unused = match std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)) {
        Ok(l) => l.local_addr().unwrap(),
        Err(e) if e.kind() == ErrorKind::PermissionDenied => return,
        Err(e) => panic!("bind: {e}"),
    };
    let id = subscribe(&db.store, &format!("http://{unused}/push/created")).await;
    let bad = subscribe(&db.store, "not a url").await;

    let sender = PushSender::new(&push_config(Some(private_key_b64()), 100), db.store.clone()).unwrap();
    let result = sender
        .send_batch(&[id, bad], at(2024, 6, 1, 12, 0, 0))
        .await
        .unwrap();
    assert_eq!(result.total, 2);
    assert_eq!(result.sent, 0);
    assert_eq!(result.deleted, 0);
    assert_eq!(db.store.list_push_subscription_ids(0, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn send_to_all_walks_every_subscription() {
    let Some(service) = PushService::spawn().await else {
        return;
    };
    let db = TestDb::new().await;
    for name in ["created", "gone", "ok", "missing", "accepted"] {
        subscribe(&db.store, &service.endpoint(name)).await;
    }

    let sender = PushSender::new(&push_config(Some(private_key_b64()), 2), db.store.clone()).unwrap();
    let result = sender.send_to_all(at(2024, 6, 1, 12, 0, 0)).await.unwrap();

    // 200 is not one of the accepted statuses and stays unknown.
    assert_eq!(result.sent, 2);
    assert_eq!(result.deleted, 2);
    assert_eq!(result.total, 5);
    assert_eq!(service.hits().len(), 5);
    assert_eq!(db.store.list_push_subscription_ids(0, 10).await.unwrap().len(), 3);
}

#[tokio::test]
async fn disabled_push_builds_no_sender() {
    let db = TestDb::new().await;
    assert!(PushSender::from_config(None, db.store.clone()).unwrap().is_none());
    let mut cfg = push_config(Some(private_key_b64()), 100);
    cfg.enabled = false;
    assert!(PushSender::from_config(Some(&cfg), db.store.clone()).unwrap().is_none());
}

#[test]
fn audience_is_the_endpoint_origin() {
    assert_eq!(
        endpoint_origin("https://fcm.googleapis.com/fcm/send/abc:def").unwrap(),
        "https://fcm.googleapis.com"
    );
    assert_eq!(
        endpoint_origin("https://push.example.net:8443/wpush/v2/xyz").unwrap(),
        "https://push.example.net:8443"
    );
    assert!(endpoint_origin("not a url").is_err());
    assert!(endpoint_origin("data:text/plain,hi").is_err());
}
