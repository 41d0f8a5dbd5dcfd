//! Scripted [`Fetch`] for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use http::StatusCode;
use portal_net::{Fetch, NetError, Request, Response};

/// Answers by URL path; unknown paths get a 404. Counts every call.
#[derive(Default)]
pub struct MockFetch {
    routes: Mutex<HashMap<String, (u16, String)>>,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl MockFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.to_string()));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetch for MockFetch {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline(request.url.to_string()));
        }

        let route = self.routes.lock().unwrap().get(request.url.path()).cloned();
        let (status, body) = route.unwrap_or((404, "not found".to_string()));
        Ok(Response::new(
            request.url,
            StatusCode::from_u16(status).unwrap(),
            Default::default(),
            body,
        ))
    }
}
