//! 3PAR / Primera adapter against an in-process WSAPI fake.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use vsphere_xcopy_populator::controlplane::backends::{Primera3ParAdapter, Primera3ParConfig};
use vsphere_xcopy_populator::{Error, PersistentVolume, StorageAdapter};

const SESSION_KEY: &str = "0-c0ffee-session";
const ESX_INITIATOR: &str = "fc.20000000c0a80abc:21000000c0a80def";

// =============================================================================
// WSAPI Fake
// =============================================================================

#[derive(Default)]
struct Array {
    volumes: BTreeMap<String, Value>,
    hosts: Vec<Value>,
    host_set: Option<Vec<String>>,
    vluns: Vec<Value>,
    logins: usize,
    vlun_creates: usize,
    vlun_deletes: usize,
    /// Answer the next authenticated call with 401
    expire_session: bool,
}

type Shared = Arc<Mutex<Array>>;

fn authorized(array: &mut Array, headers: &HeaderMap) -> bool {
    if array.expire_session {
        array.expire_session = false;
        return false;
    }
    headers
        .get("X-HP3PAR-WSAPI-SessionKey")
        .and_then(|v| v.to_str().ok())
        == Some(SESSION_KEY)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"code": 6, "desc": "invalid session key"})))
        .into_response()
}

async fn login(State(array): State<Shared>, Json(body): Json<Value>) -> Response {
    if body["user"] != "3paradm" || body["password"] != "wsapi-secret" {
        return (StatusCode::FORBIDDEN, Json(json!({"code": 5}))).into_response();
    }
    array.lock().logins += 1;
    (StatusCode::CREATED, Json(json!({ "key": SESSION_KEY }))).into_response()
}

async fn get_volume(
    State(array): State<Shared>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    match array.volumes.get(&name) {
        Some(volume) => Json(volume.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"code": 23}))).into_response(),
    }
}

async fn list_hosts(State(array): State<Shared>, headers: HeaderMap) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    Json(json!({ "members": array.hosts })).into_response()
}

async fn create_host(
    State(array): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    assert_eq!(body["persona"], 11);
    let paths: Vec<Value> = body["FCWWNs"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|wwn| json!({ "wwn": wwn }))
        .collect();
    array
        .hosts
        .push(json!({ "name": body["name"], "FCPaths": paths }));
    StatusCode::CREATED.into_response()
}

async fn get_host_set(State(array): State<Shared>, headers: HeaderMap) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    match &array.host_set {
        Some(members) => Json(json!({ "name": "xcopy-esxs", "setmembers": members })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({"code": 102}))).into_response(),
    }
}

async fn create_host_set(
    State(array): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    let members = body["setmembers"]
        .as_array()
        .map(|m| m.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    array.host_set = Some(members);
    StatusCode::CREATED.into_response()
}

async fn list_vluns(State(array): State<Shared>, headers: HeaderMap) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    Json(json!({ "members": array.vluns })).into_response()
}

async fn create_vlun(
    State(array): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    let exists = array
        .vluns
        .iter()
        .any(|v| v["volumeName"] == body["volumeName"] && v["hostname"] == body["hostname"]);
    if exists {
        return (StatusCode::CONFLICT, Json(json!({"code": 73}))).into_response();
    }
    array.vlun_creates += 1;
    array.vluns.push(json!({
        "volumeName": body["volumeName"],
        "lun": body["lun"],
        "hostname": body["hostname"],
    }));
    StatusCode::CREATED.into_response()
}

async fn delete_vlun(
    State(array): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let mut array = array.lock();
    if !authorized(&mut array, &headers) {
        return unauthorized();
    }
    let parts: Vec<&str> = id.splitn(3, ',').collect();
    let [volume, lun, hostname] = parts.as_slice() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let before = array.vluns.len();
    array.vluns.retain(|v| {
        !(v["volumeName"] == *volume
            && v["lun"].to_string() == *lun
            && v["hostname"] == *hostname)
    });
    if array.vluns.len() == before {
        return (StatusCode::NOT_FOUND, Json(json!({"code": 19}))).into_response();
    }
    array.vlun_deletes += 1;
    StatusCode::OK.into_response()
}

async fn start(array: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/api/v1/credentials", post(login))
        .route("/api/v1/volumes/:name", get(get_volume))
        .route("/api/v1/hosts", get(list_hosts).post(create_host))
        .route("/api/v1/hostsets", post(create_host_set))
        .route("/api/v1/hostsets/:name", get(get_host_set))
        .route("/api/v1/vluns", get(list_vluns).post(create_vlun))
        .route("/api/v1/vluns/:id", delete(delete_vlun))
        .with_state(array);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn adapter(addr: SocketAddr) -> Primera3ParAdapter {
    Primera3ParAdapter::new(Primera3ParConfig {
        endpoint: format!("http://{}", addr),
        username: "3paradm".into(),
        password: SecretString::from("wsapi-secret".to_string()),
        skip_tls_verify: false,
        session_ttl: Duration::from_secs(180),
    })
    .unwrap()
}

fn seeded() -> Shared {
    let mut array = Array::default();
    array.volumes.insert(
        "pv-xyz".into(),
        json!({ "name": "pv-xyz", "id": 42, "wwn": "60002AC0000000000000002A0001F6A1" }),
    );
    // LUN 1 is taken by someone else on the set
    array.vluns.push(json!({ "volumeName": "other", "lun": 1, "hostname": "set:xcopy-esxs" }));
    Arc::new(Mutex::new(array))
}

fn target() -> PersistentVolume {
    PersistentVolume {
        name: "pv-xyz".into(),
        volume_handle: "pvc-xyz".into(),
        volume_attributes: BTreeMap::new(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_resolve_lun_builds_naa() {
    let array = seeded();
    let adapter = adapter(start(array.clone()).await);

    let lun = adapter.resolve_lun(&target()).await.unwrap();
    assert_eq!(lun.name, "pv-xyz");
    assert_eq!(lun.naa, "naa.60002ac0000000000000002a0001f6a1");
}

#[tokio::test]
async fn test_resolve_missing_volume() {
    let array = seeded();
    let adapter = adapter(start(array.clone()).await);

    let mut pv = target();
    pv.name = "pv-missing".into();
    let err = adapter.resolve_lun(&pv).await.unwrap_err();
    assert!(matches!(err, Error::LunNotFound { .. }));
}

#[tokio::test]
async fn test_ensure_mapped_is_idempotent() {
    let array = seeded();
    let adapter = adapter(start(array.clone()).await);
    let lun = adapter.resolve_lun(&target()).await.unwrap();
    let initiators = vec![ESX_INITIATOR.to_string()];

    let first = adapter.ensure_mapped(&lun, &initiators).await.unwrap();
    let second = adapter.ensure_mapped(&lun, &initiators).await.unwrap();

    assert_eq!(first.host_lun, 2);
    assert_eq!(first.host_lun, second.host_lun);
    assert!(first.created);
    assert!(second.created);
    assert_eq!(first.initiator_group, "xcopy-esxs");

    let array = array.lock();
    assert_eq!(array.vlun_creates, 1);
    assert_eq!(array.hosts.len(), 1);
    assert_eq!(array.hosts[0]["FCPaths"][0]["wwn"], "21000000C0A80DEF");
    assert_eq!(array.host_set.as_ref().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_unmap_twice_is_noop() {
    let array = seeded();
    let adapter = adapter(start(array.clone()).await);
    let lun = adapter.resolve_lun(&target()).await.unwrap();
    let mapping = adapter
        .ensure_mapped(&lun, &[ESX_INITIATOR.to_string()])
        .await
        .unwrap();

    adapter.unmap(&mapping).await.unwrap();
    adapter.unmap(&mapping).await.unwrap();

    let array = array.lock();
    assert_eq!(array.vlun_deletes, 1);
    assert_eq!(array.vluns.len(), 1);
    assert_eq!(array.vluns[0]["volumeName"], "other");
}

#[tokio::test]
async fn test_existing_vlun_is_never_removed() {
    let array = seeded();
    array
        .lock()
        .vluns
        .push(json!({ "volumeName": "pv-xyz", "lun": 5, "hostname": "set:xcopy-esxs" }));
    let adapter = adapter(start(array.clone()).await);
    let lun = adapter.resolve_lun(&target()).await.unwrap();

    let mapping = adapter
        .ensure_mapped(&lun, &[ESX_INITIATOR.to_string()])
        .await
        .unwrap();
    assert_eq!(mapping.host_lun, 5);
    assert!(!mapping.created);

    adapter.unmap(&mapping).await.unwrap();

    let array = array.lock();
    assert_eq!(array.vlun_creates, 0);
    assert_eq!(array.vlun_deletes, 0);
    assert_eq!(array.vluns.len(), 2);
}

#[tokio::test]
async fn test_expired_session_logs_in_again() {
    let array = seeded();
    let adapter = adapter(start(array.clone()).await);

    adapter.resolve_lun(&target()).await.unwrap();
    array.lock().expire_session = true;
    adapter.resolve_lun(&target()).await.unwrap();

    assert_eq!(array.lock().logins, 2);
}
