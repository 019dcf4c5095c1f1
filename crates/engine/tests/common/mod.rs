//! Fake services shared by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use accord_engine::config::{EndpointConfig, RunnerSettings};
use accord_engine::{AppRegistry, ApplicationInfo, Session};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Serves `router` on an ephemeral port
pub async fn serve(router: Router) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    port
}

pub fn fast_settings() -> RunnerSettings {
    RunnerSettings {
        readiness_timeout_secs: 5,
        probe_interval_ms: 50,
        request_timeout_secs: 5,
        ..RunnerSettings::default()
    }
}

pub fn session_for(app: ApplicationInfo) -> Session {
    Session::new(AppRegistry::from_apps([app]), fast_settings()).unwrap()
}

/// In-memory orders service
#[derive(Default)]
pub struct FakeOrders {
    next_id: AtomicU32,
    job_polls: AtomicU32,
    widgets: Mutex<HashMap<String, Value>>,
    pub base_data_calls: AtomicU32,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match (body["name"].as_str(), body["password"].as_str()) {
        (Some(name), Some("secret")) => (StatusCode::OK, Json(json!({ "token": format!("tok-{}", name) }))),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "bad credentials" }))),
    }
}

async fn create_widget(
    State(state): State<Arc<FakeOrders>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let Some(auth) = header(&headers, "authorization") else {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    };
    let id = format!("w-{}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    let widget = json!({
        "widgetId": id,
        "name": body["name"],
        "owner": auth.trim_start_matches("Bearer "),
        "row": header(&headers, "x-row"),
    });
    state.widgets.lock().insert(id, widget.clone());
    (StatusCode::CREATED, Json(widget))
}

async fn get_widget(State(state): State<Arc<FakeOrders>>, Path(id): Path<String>) -> (StatusCode, Json<Value>) {
    match state.widgets.lock().get(&id) {
        Some(widget) => (StatusCode::OK, Json(widget.clone())),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "not found" }))),
    }
}

async fn list_widgets(State(state): State<Arc<FakeOrders>>) -> Json<Value> {
    Json(Value::Array(state.widgets.lock().values().cloned().collect()))
}

/// Reports RUNNING twice, then DONE
async fn job(State(state): State<Arc<FakeOrders>>) -> Json<Value> {
    let polls = state.job_polls.fetch_add(1, Ordering::SeqCst) + 1;
    let status = if polls >= 3 { "DONE" } else { "RUNNING" };
    Json(json!({ "state": status, "polls": polls }))
}

async fn echo_headers(headers: HeaderMap) -> Json<Value> {
    Json(json!({
        "perm": header(&headers, "x-perm"),
        "once": header(&headers, "x-once"),
        "authorization": header(&headers, "authorization"),
    }))
}

async fn base_data(State(state): State<Arc<FakeOrders>>) -> StatusCode {
    state.base_data_calls.fetch_add(1, Ordering::SeqCst);
    state.widgets.lock().clear();
    StatusCode::NO_CONTENT
}

/// Starts the orders service on two ports and returns its registration
pub async fn orders_service() -> (ApplicationInfo, Arc<FakeOrders>) {
    let state = Arc::new(FakeOrders::default());

    let main = Router::new()
        .route("/orders/public/login", post(login))
        .route("/orders/secure/widgets", post(create_widget).get(list_widgets))
        .route("/orders/secure/widgets/:id", get(get_widget))
        .route("/orders/secure/jobs/:id", get(job))
        .route("/orders/secure/headers", get(echo_headers))
        .with_state(state.clone());
    let admin = Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/actuator/base-data", post(base_data))
        .with_state(state.clone());

    let http_port = serve(main).await;
    let admin_port = serve(admin).await;
    let app = ApplicationInfo {
        url_prefix: "orders".into(),
        host: "127.0.0.1".into(),
        http_port,
        admin_port,
        admin_health_check_url: "/health".into(),
    };
    (app, state)
}

/// Application without routes whose health check answers 503 for the first
/// `failing` calls and `status` after that; also returns the call counter
pub async fn health_service(status: StatusCode, failing: u32) -> (ApplicationInfo, Arc<AtomicU32>) {
    let checks = Arc::new(AtomicU32::new(0));
    let counter = checks.clone();
    let admin = Router::new().route(
        "/health",
        get(move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < failing {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    status
                }
            }
        }),
    );

    let http_port = serve(Router::new()).await;
    let admin_port = serve(admin).await;
    let app = ApplicationInfo {
        url_prefix: "inventory".into(),
        host: "127.0.0.1".into(),
        http_port,
        admin_port,
        admin_health_check_url: "/health".into(),
    };
    (app, checks)
}

/// Minimal SQS JSON-protocol emulator
#[derive(Default)]
pub struct FakeSqs {
    pub queues: Mutex<HashMap<String, Vec<Value>>>,
    internal_url: Mutex<String>,
}

impl FakeSqs {
    fn queue_url(&self, name: &str) -> String {
        format!("{}/000000000000/{}", self.internal_url.lock(), name)
    }
}

fn queue_name(request: &Value) -> String {
    request["QueueUrl"]
        .as_str()
        .unwrap_or_default()
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

async fn sqs(State(state): State<Arc<FakeSqs>>, headers: HeaderMap, body: Bytes) -> (StatusCode, String) {
    let target = header(&headers, "x-amz-target").unwrap_or_default();
    let request: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let action = target.trim_start_matches("AmazonSQS.");

    let response = match action {
        "GetQueueUrl" => {
            let name = request["QueueName"].as_str().unwrap_or_default().to_string();
            if !state.queues.lock().contains_key(&name) {
                return (StatusCode::BAD_REQUEST, r#"{"__type":"QueueDoesNotExist"}"#.into());
            }
            json!({ "QueueUrl": state.queue_url(&name) })
        }
        "ListQueues" => {
            let names: Vec<String> = state.queues.lock().keys().cloned().collect();
            json!({ "QueueUrls": names.iter().map(|n| state.queue_url(n)).collect::<Vec<_>>() })
        }
        "SendMessage" => {
            let name = queue_name(&request);
            state.queues.lock().entry(name).or_default().push(request.clone());
            json!({ "MessageId": "1" })
        }
        "PurgeQueue" => {
            if let Some(messages) = state.queues.lock().get_mut(&queue_name(&request)) {
                messages.clear();
            }
            json!({})
        }
        "GetQueueAttributes" => {
            let count = state
                .queues
                .lock()
                .get(&queue_name(&request))
                .map(Vec::len)
                .unwrap_or(0);
            json!({ "Attributes": {
                "ApproximateNumberOfMessages": count.to_string(),
                "ApproximateNumberOfMessagesDelayed": "0",
                "ApproximateNumberOfMessagesNotVisible": "0"
            }})
        }
        "ReceiveMessage" => {
            let max = request["MaxNumberOfMessages"].as_u64().unwrap_or(1) as usize;
            let mut queues = state.queues.lock();
            let pending = queues.entry(queue_name(&request)).or_default();
            let taken: Vec<Value> = pending.drain(..max.min(pending.len())).collect();
            let messages: Vec<Value> = taken
                .iter()
                .map(|m| json!({ "Body": m["MessageBody"], "MessageAttributes": m["MessageAttributes"] }))
                .collect();
            json!({ "Messages": messages })
        }
        other => return (StatusCode::BAD_REQUEST, format!("unsupported action {}", other)),
    };
    (StatusCode::OK, response.to_string())
}

/// Starts the queue emulator with the given physical queues. Queue urls it
/// hands out use an unreachable host that the client must rewrite.
pub async fn sqs_service(queues: &[&str]) -> (EndpointConfig, Arc<FakeSqs>) {
    let state = Arc::new(FakeSqs::default());
    *state.internal_url.lock() = "http://sqs.internal:9324".to_string();
    for queue in queues {
        state.queues.lock().insert(queue.to_string(), Vec::new());
    }
    let port = serve(Router::new().route("/", post(sqs)).with_state(state.clone())).await;
    let endpoint = EndpointConfig {
        enabled: true,
        endpoint_url: format!("http://127.0.0.1:{}", port),
        region: "elasticmq".into(),
        environment: "local".into(),
        replace_url: Some("http://sqs.internal:9324".into()),
    };
    (endpoint, state)
}

/// Path-style object store keeping objects in memory
#[derive(Default)]
pub struct FakeS3 {
    pub buckets: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

async fn create_bucket(State(state): State<Arc<FakeS3>>, Path(bucket): Path<String>) -> StatusCode {
    let mut buckets = state.buckets.lock();
    if buckets.contains_key(&bucket) {
        return StatusCode::CONFLICT;
    }
    buckets.insert(bucket, HashMap::new());
    StatusCode::OK
}

async fn put_object(
    State(state): State<Arc<FakeS3>>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    match state.buckets.lock().get_mut(&bucket) {
        Some(objects) => {
            objects.insert(key, body.to_vec());
            StatusCode::OK
        }
        None => StatusCode::NOT_FOUND,
    }
}

async fn head_object(State(state): State<Arc<FakeS3>>, Path((bucket, key)): Path<(String, String)>) -> StatusCode {
    let found = state
        .buckets
        .lock()
        .get(&bucket)
        .map(|objects| objects.contains_key(&key))
        .unwrap_or(false);
    if found {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn s3_service() -> (EndpointConfig, Arc<FakeS3>) {
    let state = Arc::new(FakeS3::default());
    let router = Router::new()
        .route("/:bucket", put(create_bucket))
        .route("/:bucket/*key", put(put_object).head(head_object).get(head_object))
        .with_state(state.clone());
    let port = serve(router).await;
    let endpoint = EndpointConfig {
        enabled: true,
        endpoint_url: format!("http://127.0.0.1:{}", port),
        region: "s3mock".into(),
        environment: "local".into(),
        replace_url: Some("http://s3.internal:8001".into()),
    };
    (endpoint, state)
}

type Inboxes = Arc<Mutex<HashMap<String, Vec<String>>>>;

fn commit_deletions(store: &Inboxes, user: &str, deleted: &mut Vec<usize>) {
    let mut inboxes = store.lock();
    let Some(messages) = inboxes.get_mut(user) else {
        return;
    };
    deleted.sort_unstable();
    deleted.dedup();
    for n in deleted.iter().rev() {
        if *n >= 1 && *n <= messages.len() {
            messages.remove(n - 1);
        }
    }
}

/// POP3 server holding raw messages per user; the password must equal the user
pub async fn pop3_service(inboxes: HashMap<String, Vec<String>>) -> (u16, Inboxes) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store = Arc::new(Mutex::new(inboxes));
    let shared = store.clone();

    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            let store = shared.clone();
            tokio::spawn(async move {
                let (read, mut write) = socket.into_split();
                let mut lines = BufReader::new(read).lines();
                let mut user = String::new();
                let mut deleted: Vec<usize> = Vec::new();
                write.write_all(b"+OK fake pop3 ready\r\n").await.unwrap();

                while let Ok(Some(line)) = lines.next_line().await {
                    let (command, arg) = line.split_once(' ').unwrap_or((line.as_str(), ""));
                    let reply = match command {
                        "USER" => {
                            user = arg.to_string();
                            "+OK\r\n".to_string()
                        }
                        "PASS" if arg == user && store.lock().contains_key(&user) => "+OK logged in\r\n".to_string(),
                        "PASS" => "-ERR invalid login\r\n".to_string(),
                        "STAT" => {
                            let count = store.lock().get(&user).map(Vec::len).unwrap_or(0);
                            format!("+OK {} 0\r\n", count)
                        }
                        "RETR" => {
                            let n: usize = arg.parse().unwrap_or(0);
                            match store.lock().get(&user).and_then(|m| m.get(n.wrapping_sub(1))) {
                                Some(raw) => {
                                    let body: String = raw
                                        .lines()
                                        .map(|l| if l.starts_with('.') { format!(".{}\r\n", l) } else { format!("{}\r\n", l) })
                                        .collect();
                                    format!("+OK\r\n{}.\r\n", body)
                                }
                                None => "-ERR no such message\r\n".to_string(),
                            }
                        }
                        "DELE" => {
                            deleted.push(arg.parse().unwrap_or(0));
                            "+OK\r\n".to_string()
                        }
                        "QUIT" => {
                            commit_deletions(&store, &user, &mut deleted);
                            write.write_all(b"+OK bye\r\n").await.unwrap();
                            return;
                        }
                        _ => "-ERR unknown command\r\n".to_string(),
                    };
                    write.write_all(reply.as_bytes()).await.unwrap();
                }
            });
        }
    });

    (port, store)
}
