//! Scripted transport double for tests
//!
//! Routes are keyed by host (`127.0.0.1:5550`), mirroring how real clusters
//! are addressed. Each route returns a fixed response after an optional
//! artificial delay, fails outright, or runs a closure for request-dependent
//! behavior. Posted bodies are recorded for assertions.

use crate::error::{Error, Result};
use crate::transport::{Response, Transport};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

type Handler = Arc<dyn Fn(&str, Option<&Bytes>) -> Result<Response> + Send + Sync>;

enum Reply {
    Fixed(Response),
    Fail(String),
    Handle(Handler),
}

struct Route {
    reply: Reply,
    delay: Duration,
}

/// Transport double with per-host scripted replies.
#[derive(Default)]
pub struct MockTransport {
    routes: RwLock<HashMap<String, Route>>,
    posts: Mutex<Vec<(String, Bytes)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a fixed reply for every request to `addr`.
    pub fn respond(&self, addr: &str, status: u16, body: &str) {
        self.respond_with_delay(addr, status, body, Duration::ZERO);
    }

    /// Script a fixed reply delivered after `delay`.
    pub fn respond_with_delay(&self, addr: &str, status: u16, body: &str, delay: Duration) {
        self.routes.write().insert(
            host_of(addr),
            Route {
                reply: Reply::Fixed(Response::new(status, body.to_string())),
                delay,
            },
        );
    }

    /// Script a connection failure for every request to `addr`.
    pub fn fail(&self, addr: &str) {
        self.routes.write().insert(
            host_of(addr),
            Route {
                reply: Reply::Fail(format!("mock: {addr} is down")),
                delay: Duration::ZERO,
            },
        );
    }

    /// Script a closure receiving `(url, post_body)` for request-dependent
    /// replies.
    pub fn handle<F>(&self, addr: &str, handler: F)
    where
        F: Fn(&str, Option<&Bytes>) -> Result<Response> + Send + Sync + 'static,
    {
        self.routes.write().insert(
            host_of(addr),
            Route {
                reply: Reply::Handle(Arc::new(handler)),
                delay: Duration::ZERO,
            },
        );
    }

    /// Every `(url, body)` posted so far, in order.
    pub fn posts(&self) -> Vec<(String, Bytes)> {
        self.posts.lock().clone()
    }

    async fn dispatch(&self, url: &str, body: Option<&Bytes>) -> Result<Response> {
        let host = host_of(url);
        let (reply, delay) = {
            let routes = self.routes.read();
            let route = routes
                .get(&host)
                .ok_or_else(|| Error::ConnectionFailed(format!("mock: no route for {host}")))?;
            let reply = match &route.reply {
                Reply::Fixed(res) => Ok(res.clone()),
                Reply::Fail(msg) => Err(Error::ConnectionFailed(msg.clone())),
                Reply::Handle(handler) => handler(url, body),
            };
            (reply, route.delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        reply
    }
}

/// Extract `host:port` from a URL or address shorthand.
fn host_of(url: &str) -> String {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);

    rest.split('/').next().unwrap_or(rest).to_string()
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &str) -> Result<Response> {
        self.dispatch(url, None).await
    }

    async fn post(&self, url: &str, body: Bytes) -> Result<Response> {
        self.posts.lock().push((url.to_string(), body.clone()));
        self.dispatch(url, Some(&body)).await
    }
}
