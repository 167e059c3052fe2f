//! Per-request context that the formatter reads while a request is in flight.
//!
//! The host framework builds a [`RequestContext`] in its middleware and makes it
//! current for the request's lifetime, either on the current thread with
//! [`RequestContext::enter`] or for an async task with [`RequestContext::scope`].
//! Nothing is ever shared between two scopes, so concurrent requests on other
//! threads or tasks are invisible to each other.

use serde_json::Value;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Header consulted before the peer address when resolving the client IP.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_SCOPE: RefCell<Vec<Arc<RequestContext>>> = const { RefCell::new(Vec::new()) };
}

tokio::task_local! {
    static TASK_SCOPE: Arc<RequestContext>;
}

/// Returned when no request scope is active on the calling thread or task.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no active request scope")]
pub struct ScopeUnavailable;

/// Snapshot of the inbound request and its session.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    method: String,
    url: String,
    remote_addr: String,
    id: u64,
    headers: BTreeMap<String, String>,
    session: BTreeMap<String, Value>,
}

impl RequestContext {
    /// Create a context with a fresh process-unique request id.
    pub fn new(method: impl Into<String>, url: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        RequestContext {
            method: method.into(),
            url: url.into(),
            remote_addr: remote_addr.into(),
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            headers: BTreeMap::new(),
            session: BTreeMap::new(),
        }
    }

    /// Use an id derived upstream (e.g. from a proxy request-id header).
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Header names are matched case-insensitively.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_session_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.session.insert(key.into(), value.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn session_value(&self, key: &str) -> Option<&Value> {
        self.session.get(key)
    }

    /// Client address: first hop of `X-Forwarded-For` when the request came
    /// through the proxy, otherwise the peer address.
    pub fn remote_ip(&self) -> &str {
        self.header(FORWARDED_FOR_HEADER)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.remote_addr.as_str())
    }

    /// Resolve the user from `header` first, then from `session_key`.
    pub fn username(&self, header: Option<&str>, session_key: Option<&str>) -> Option<String> {
        let from_header = header
            .and_then(|h| self.header(h))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        from_header.or_else(|| {
            session_key
                .and_then(|k| self.session.get(k))
                .and_then(|v| match v {
                    Value::Null => None,
                    Value::String(s) if s.is_empty() => None,
                    Value::String(s) => Some(s.clone()),
                    other => Some(other.to_string()),
                })
        })
    }

    /// Make this context current on the calling thread until the guard drops.
    ///
    /// Dropping a guard also ends every scope entered after it.
    pub fn enter(self) -> RequestGuard {
        let depth = THREAD_SCOPE
            .try_with(|stack| {
                let mut stack = stack.borrow_mut();
                stack.push(Arc::new(self));
                stack.len() - 1
            })
            .unwrap_or(0);
        RequestGuard { depth, _not_send: PhantomData }
    }

    /// Run `fut` with this context current for the task, across `.await`s and
    /// worker-thread migrations.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        TASK_SCOPE.scope(Arc::new(self), fut).await
    }

    /// Synchronous counterpart of [`scope`](Self::scope) for blocking sections.
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        TASK_SCOPE.sync_scope(Arc::new(self), f)
    }
}

/// Keeps a [`RequestContext`] current on one thread. Not `Send`.
#[must_use = "the request scope ends when the guard is dropped"]
pub struct RequestGuard {
    depth: usize,
    _not_send: PhantomData<*const ()>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let _ = THREAD_SCOPE.try_with(|stack| stack.borrow_mut().truncate(self.depth));
    }
}

/// The innermost active request context: thread scope first, then task scope.
pub fn current_request() -> Result<Arc<RequestContext>, ScopeUnavailable> {
    let from_thread = THREAD_SCOPE
        .try_with(|stack| stack.borrow().last().cloned())
        .ok()
        .flatten();
    if let Some(ctx) = from_thread {
        return Ok(ctx);
    }
    TASK_SCOPE.try_with(Arc::clone).map_err(|_| ScopeUnavailable)
}
