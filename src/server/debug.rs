//! 调试端点
//!
//! - `/debug/pprof/*`：进程快照（命令行、负载、内存、CPU 数）
//! - `/debug/requests`、`/debug/events`：内存中的请求/事件追踪日志

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use hyper::{Request, StatusCode};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::server::body::{self, Body};
use crate::server::router::{HandlerFuture, HttpHandler, SharedHandler, handler_fn};

pub const PPROF_PREFIX: &str = "/debug/pprof/";
pub const REQUESTS_PATH: &str = "/debug/requests";
pub const EVENTS_PATH: &str = "/debug/events";

/// profiling 风格的快照处理器
pub fn pprof_handlers() -> Vec<(String, SharedHandler)> {
    vec![
        (
            PPROF_PREFIX.to_string(),
            handler_fn(|_request| async {
                body::text_response(
                    StatusCode::OK,
                    format!("{0}cmdline\n{0}system\n", PPROF_PREFIX),
                )
            }),
        ),
        (
            format!("{}cmdline", PPROF_PREFIX),
            handler_fn(|_request| async {
                let args: Vec<String> = std::env::args().collect();
                body::text_response(StatusCode::OK, args.join("\0"))
            }),
        ),
        (
            format!("{}system", PPROF_PREFIX),
            handler_fn(|_request| async { body::json_response(StatusCode::OK, &system_snapshot()) }),
        ),
    ]
}

fn system_snapshot() -> serde_json::Value {
    let load = sys_info::loadavg().ok();
    let memory = sys_info::mem_info().ok();
    json!({
        "pid": std::process::id(),
        "hostname": sys_info::hostname().ok(),
        "os": sys_info::os_type().ok(),
        "cpu_num": sys_info::cpu_num().ok(),
        "load_average": load.map(|l| json!({"one": l.one, "five": l.five, "fifteen": l.fifteen})),
        "memory_kb": memory.map(|m| json!({"total": m.total, "free": m.free, "available": m.avail})),
        "captured_at": Utc::now().to_rfc3339(),
    })
}

/// 一次请求的追踪记录
#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    pub id: Uuid,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub latency_us: u128,
    pub at: DateTime<Utc>,
}

/// 一条生命周期事件
#[derive(Debug, Clone, Serialize)]
pub struct EventTrace {
    pub id: Uuid,
    pub family: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

struct Traces {
    requests: VecDeque<RequestTrace>,
    events: VecDeque<EventTrace>,
}

/// 有界的内存追踪日志，超出容量时丢弃最旧的记录
#[derive(Clone)]
pub struct TraceRecorder {
    capacity: usize,
    traces: Arc<Mutex<Traces>>,
}

impl TraceRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            traces: Arc::new(Mutex::new(Traces {
                requests: VecDeque::new(),
                events: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Traces> {
        self.traces.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_request(&self, method: &str, path: &str, status: StatusCode, started: Instant) {
        let trace = RequestTrace {
            id: Uuid::new_v4(),
            method: method.to_string(),
            path: path.to_string(),
            status: status.as_u16(),
            latency_us: started.elapsed().as_micros(),
            at: Utc::now(),
        };
        let mut traces = self.lock();
        if traces.requests.len() == self.capacity {
            traces.requests.pop_front();
        }
        traces.requests.push_back(trace);
    }

    pub fn record_event(&self, family: &str, message: impl Into<String>) {
        let event = EventTrace {
            id: Uuid::new_v4(),
            family: family.to_string(),
            message: message.into(),
            at: Utc::now(),
        };
        let mut traces = self.lock();
        if traces.events.len() == self.capacity {
            traces.events.pop_front();
        }
        traces.events.push_back(event);
    }

    /// 最近的请求，新的在前
    pub fn requests(&self) -> Vec<RequestTrace> {
        self.lock().requests.iter().rev().cloned().collect()
    }

    /// 最近的事件，新的在前
    pub fn events(&self) -> Vec<EventTrace> {
        self.lock().events.iter().rev().cloned().collect()
    }

    pub fn requests_handler(&self) -> SharedHandler {
        let recorder = self.clone();
        handler_fn(move |_request| {
            let requests = recorder.requests();
            async move { body::json_response(StatusCode::OK, &json!({ "requests": requests })) }
        })
    }

    pub fn events_handler(&self) -> SharedHandler {
        let recorder = self.clone();
        handler_fn(move |_request| {
            let events = recorder.events();
            async move { body::json_response(StatusCode::OK, &json!({ "events": events })) }
        })
    }
}

/// 记录每个请求的包装处理器
pub struct TracingHandler {
    inner: SharedHandler,
    recorder: TraceRecorder,
}

impl TracingHandler {
    pub fn new(inner: SharedHandler, recorder: TraceRecorder) -> Self {
        Self { inner, recorder }
    }
}

impl HttpHandler for TracingHandler {
    fn call(&self, request: Request<Body>) -> HandlerFuture {
        let method = request.method().to_string();
        let path = request.uri().path().to_string();
        let started = Instant::now();
        let recorder = self.recorder.clone();
        let response = self.inner.call(request);
        Box::pin(async move {
            let response = response.await;
            recorder.record_request(&method, &path, response.status(), started);
            response
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::body::collect_bytes;

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(body::empty()).unwrap()
    }

    #[test]
    fn recorder_is_bounded_and_newest_first() {
        let recorder = TraceRecorder::new(2);
        for i in 0..3 {
            recorder.record_event("serve", format!("event {}", i));
        }
        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "event 2");
        assert_eq!(events[1].message, "event 1");
    }

    #[tokio::test]
    async fn tracing_handler_records_requests() {
        let recorder = TraceRecorder::new(8);
        let inner = handler_fn(|_request| async { body::text_response(StatusCode::NOT_FOUND, "") });
        let traced = TracingHandler::new(inner, recorder.clone());
        traced.call(get("/v3beta/kv/range")).await;

        let requests = recorder.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/v3beta/kv/range");
        assert_eq!(requests[0].status, 404);

        let page = recorder.requests_handler().call(get(REQUESTS_PATH)).await;
        let bytes = collect_bytes(page.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["requests"][0]["method"], "GET");
    }

    #[tokio::test]
    async fn pprof_pages_render() {
        let handlers = pprof_handlers();
        let paths: Vec<&str> = handlers.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(paths, vec!["/debug/pprof/", "/debug/pprof/cmdline", "/debug/pprof/system"]);

        let (_, system) = &handlers[2];
        let response = system.call(get("/debug/pprof/system")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = collect_bytes(response.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["pid"], std::process::id());
    }
}
