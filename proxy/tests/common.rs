//! Shared helpers for integration tests

use cachefront_proxy::{Fetch, FetchFailure, FetchedResponse, RequestKey};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const ORIGIN: &str = "http://app.example.com";

/// Scripted network: serves registered URLs, counts calls, and can be
/// switched offline mid-test
pub struct MockFetcher {
    responses: Mutex<HashMap<String, FetchedResponse>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        MockFetcher {
            responses: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    /// Register a 200 response. `locator` may be a path (resolved against
    /// ORIGIN) or an absolute URL.
    pub fn serve(&self, locator: &str, body: &[u8]) {
        let url = if locator.starts_with("http") {
            locator.to_string()
        } else {
            format!("{}{}", ORIGIN, locator)
        };
        self.responses.lock().unwrap().insert(
            url.clone(),
            FetchedResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "text/plain".to_string())],
                body: body.to_vec(),
                final_url: url,
            },
        );
    }

    pub fn go_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Fetch for MockFetcher {
    async fn fetch(
        &self,
        key: &RequestKey,
        _body: Option<Vec<u8>>,
    ) -> Result<FetchedResponse, FetchFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchFailure {
                url: key.url.clone(),
                reason: "network is down".to_string(),
            });
        }
        self.responses
            .lock()
            .unwrap()
            .get(&key.url)
            .cloned()
            .ok_or_else(|| FetchFailure {
                url: key.url.clone(),
                reason: "no route to host".to_string(),
            })
    }
}
