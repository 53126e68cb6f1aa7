#[path = "common/mod.rs"]
mod common;

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use common::{StubResponse, StubServer, closed_port_url};
use tether::{
    config::ManagerConfig,
    error::{RegistrationError, TransportError},
    registrar::ServiceRegistrar,
};

fn registrar_for(control_plane: &str) -> (ServiceRegistrar, Arc<Mutex<Vec<Duration>>>) {
    let config = ManagerConfig {
        control_plane: control_plane.to_string(),
        ..ManagerConfig::default()
    };
    let delays = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&delays);
    let registrar = ServiceRegistrar::from_config(&config)
        .unwrap()
        .with_sleeper(move |delay| sink.lock().unwrap().push(delay));
    (registrar, delays)
}

#[test]
fn posts_deployment_to_control_plane() {
    let server = StubServer::bind().respond(vec![StubResponse::empty(201)]);
    let (registrar, delays) = registrar_for(&server.url);

    registrar.register_default().unwrap();

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/deployments");
    let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
    assert_eq!(
        body,
        serde_json::json!({"uri": "http://localhost:9080", "force": true})
    );
    assert!(delays.lock().unwrap().is_empty());
}

#[test]
fn retries_rejections_with_backoff() {
    let server = StubServer::bind().respond(vec![
        StubResponse::empty(503),
        StubResponse::empty(500),
        StubResponse::empty(200),
    ]);
    let (registrar, delays) = registrar_for(&server.url);

    registrar.register_service("http://localhost:9081").unwrap();

    assert_eq!(server.requests().len(), 3);
    assert_eq!(
        *delays.lock().unwrap(),
        vec![Duration::from_millis(200), Duration::from_millis(400)]
    );
}

#[test]
fn reports_last_status_after_three_rejections() {
    let server = StubServer::bind().respond(vec![
        StubResponse::empty(503),
        StubResponse::empty(503),
        StubResponse::empty(409),
    ]);
    let (registrar, _) = registrar_for(&server.url);

    let RegistrationError::RegistrationFailed {
        attempts, source, ..
    } = registrar.register_default().unwrap_err();
    assert_eq!(attempts, 3);
    assert!(matches!(source, TransportError::Status { status: 409, .. }));
    assert_eq!(server.requests().len(), 3);
}

#[test]
fn unreachable_control_plane_fails_after_three_attempts() {
    let (registrar, delays) = registrar_for(&closed_port_url());

    let RegistrationError::RegistrationFailed {
        attempts, source, ..
    } = registrar.register_default().unwrap_err();
    assert_eq!(attempts, 3);
    assert!(matches!(source, TransportError::Http(_)));
    assert_eq!(delays.lock().unwrap().len(), 2);
}

#[test]
fn no_force_is_sent_when_disabled() {
    let server = StubServer::bind().respond(vec![StubResponse::empty(200)]);
    let (registrar, _) = registrar_for(&server.url);

    registrar.with_force(false).register_default().unwrap();

    let body: serde_json::Value = serde_json::from_str(&server.requests()[0].body).unwrap();
    assert_eq!(body["force"], serde_json::json!(false));
}
