//! Helper functions for testing eventd.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use url::Url;

use crate::api::{
    Action, ConfirmMode, Cursor, Event, EventData, EventType, ResourceKind,
    Subscription, SubscriptionId,
};
use crate::commons::storage::KeyValueStore;
use crate::config::Config;
use crate::server::leader::{AlwaysLeader, LeaderGate};
use crate::server::registry::Registry;
use crate::server::PipelineContext;


pub fn random_hex_string() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Returns the URI of a fresh in-memory store.
pub fn mem_storage() -> Url {
    Url::parse(&format!("memory://{}", random_hex_string())).unwrap()
}

pub fn init_logging() {
    // Just creates a test config so we can initialize logging, then
    // forgets about it. Only the first call in a process has an effect.
    let _ = Config::test(&mem_storage()).init_logging();
}

/// A subscription confirming by status 200.
pub fn subscription(
    id: SubscriptionId, callback_url: &str, form: &str
) -> Subscription {
    Subscription {
        subscription_id: id,
        subscription_name: format!("test-{id}"),
        callback_url: callback_url.to_string(),
        confirm_mode: ConfirmMode::HttpStatus,
        confirm_pattern: "200".into(),
        timeout_secs: 0,
        subscription_form: form.to_string(),
        owner_id: "0".into(),
        fields: vec![],
    }
}

/// Creates an instance data event for an event key like `hostcreate`.
pub fn host_event(key: &str) -> Event {
    let (obj_type, action) = Action::ALL.into_iter()
        .find_map(|action| {
            key.strip_suffix(action.as_str()).map(|obj| (obj, action))
        })
        .unwrap();
    let resource = match obj_type {
        "host" => ResourceKind::Host,
        "biz" => ResourceKind::Biz,
        "set" => ResourceKind::Set,
        "module" => ResourceKind::Module,
        "process" => ResourceKind::Process,
        _ => ResourceKind::ObjectInstance,
    };
    let now = Utc::now();
    let doc = json!({"bk_inst_id": 1, "bk_inst_name": "test", "bk_cloud_id": 0});
    let data = match action {
        Action::Create => EventData { cur_data: doc, pre_data: Value::Null },
        Action::Update => EventData { cur_data: doc.clone(), pre_data: doc },
        Action::Delete => EventData { cur_data: Value::Null, pre_data: doc },
    };
    Event {
        id: 0,
        resource,
        event_type: EventType::InstData,
        action,
        obj_type: obj_type.to_string(),
        cursor: Cursor::new(resource, now.timestamp(), 1).encode(),
        action_time: now,
        data: vec![data],
        updated_fields: vec![],
        deleted_fields: vec![],
    }
}

/// A pipeline context on a fresh in-memory store that always leads.
pub async fn pipeline_context() -> PipelineContext {
    pipeline_context_with(Arc::new(AlwaysLeader)).await
}

pub async fn pipeline_context_with(
    leader: Arc<dyn LeaderGate>
) -> PipelineContext {
    let config = Config::test(&mem_storage());
    let store = KeyValueStore::create(&config.storage_uri).await.unwrap();
    PipelineContext::new(
        Arc::new(config), store, Arc::new(Registry::new()), leader
    )
}

/// Waits until the condition holds, panics after ten seconds.
pub async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}


/// Waits until the async condition holds, panics after ten seconds.
pub async fn wait_for_async<F, Fut>(cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if cond().await {
            return
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}


//------------ CallbackServer ------------------------------------------------

/// A subscriber endpoint recording every body it receives.
///
/// Answers with the given statuses in order, repeating the last one.
#[derive(Clone)]
pub struct CallbackServer {
    addr: SocketAddr,
    state: Arc<Mutex<CallbackState>>,
}

struct CallbackState {
    statuses: VecDeque<u16>,
    last: u16,
    bodies: Vec<Value>,
    response: Bytes,
}

impl CallbackServer {
    pub async fn start(statuses: Vec<u16>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(CallbackState {
            last: statuses.last().copied().unwrap_or(200),
            statuses: statuses.into(),
            bodies: Vec::new(),
            response: Bytes::from_static(b"ok"),
        }));

        let server = CallbackServer { addr, state };
        let handler = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(
                        TokioExecutor::new(),
                    )
                    .serve_connection(
                        TokioIo::new(stream),
                        service_fn(move |req| {
                            let handler = handler.clone();
                            async move { handler.handle(req).await }
                        }),
                    )
                    .await;
                });
            }
        });
        server
    }

    async fn handle(
        &self, req: Request<hyper::body::Incoming>
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let body = match req.into_body().collect().await {
            Ok(body) => body.to_bytes(),
            Err(_) => Bytes::new(),
        };
        let (status, body) = {
            let mut state = self.state.lock().unwrap();
            state.bodies.push(
                serde_json::from_slice(&body).unwrap_or(Value::Null)
            );
            let status = match state.statuses.pop_front() {
                Some(status) => status,
                None => state.last,
            };
            (status, state.response.clone())
        };
        let mut response = Response::new(Full::new(body));
        *response.status_mut() = StatusCode::from_u16(status).unwrap();
        Ok(response)
    }

    pub fn url(&self) -> String {
        format!("http://{}/callback", self.addr)
    }

    /// Answers all further requests with the given status.
    pub fn set_status(&self, status: u16) {
        let mut state = self.state.lock().unwrap();
        state.statuses.clear();
        state.last = status;
    }

    /// Answers all further requests with the given body.
    pub fn set_body(&self, body: impl Into<Bytes>) {
        self.state.lock().unwrap().response = body.into();
    }

    /// Returns the JSON bodies received so far, in order.
    pub fn bodies(&self) -> Vec<Value> {
        self.state.lock().unwrap().bodies.clone()
    }

    pub fn received(&self) -> usize {
        self.state.lock().unwrap().bodies.len()
    }
}
