use crate::{RemoteError, Transport};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A scripted failure returned before the stored body is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFailure {
    Status(u16),
    Timeout,
    Reset,
}

/// In-memory transport. Serves bodies registered with [`MemoryTransport::insert`],
/// can be scripted to fail a number of times per URL, and records every request.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failures: Mutex<HashMap<String, VecDeque<MemoryFailure>>>,
    requests: Mutex<Vec<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: &str, body: impl Into<Vec<u8>>) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.insert(url.to_owned(), body.into());
        }
    }

    pub fn remove(&self, url: &str) {
        if let Ok(mut bodies) = self.bodies.lock() {
            bodies.remove(url);
        }
    }

    /// Make the next `times` requests for `url` fail with `failure`.
    pub fn fail_next(&self, url: &str, failure: MemoryFailure, times: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            let queue = failures.entry(url.to_owned()).or_default();
            queue.extend(std::iter::repeat(failure).take(times));
        }
    }

    /// Number of requests (GET or HEAD) issued for `url`.
    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .map(|r| r.iter().filter(|u| *u == url).count())
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn record(&self, url: &str) -> Result<(), RemoteError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(url.to_owned());
        }
        let next = self
            .failures
            .lock()
            .ok()
            .and_then(|mut f| f.get_mut(url).and_then(VecDeque::pop_front));
        match next {
            None => Ok(()),
            Some(MemoryFailure::Status(404)) => Err(RemoteError::NotFound(url.to_owned())),
            Some(MemoryFailure::Status(code)) => Err(RemoteError::Status {
                url: url.to_owned(),
                code,
            }),
            Some(MemoryFailure::Timeout) => Err(RemoteError::Timeout(url.to_owned())),
            Some(MemoryFailure::Reset) => Err(RemoteError::Connection {
                url: url.to_owned(),
                message: "connection reset by peer".to_owned(),
            }),
        }
    }
}

impl Transport for MemoryTransport {
    fn get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.record(url)?;
        self.bodies
            .lock()
            .ok()
            .and_then(|b| b.get(url).cloned())
            .ok_or_else(|| RemoteError::NotFound(url.to_owned()))
    }

    fn head(&self, url: &str) -> Result<u16, RemoteError> {
        self.record(url)?;
        let present = self
            .bodies
            .lock()
            .map(|b| b.contains_key(url))
            .unwrap_or(false);
        Ok(if present { 200 } else { 404 })
    }
}
