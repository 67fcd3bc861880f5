//! Bounded pool of reusable blocking HTTP client handles.
//!
//! Acquire pops an idle handle or builds a fresh one; the RAII guard returns
//! the handle on drop, or closes it when the pool is already full.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::{DownloadError, DownloadResult};

/// Maximum number of idle handles kept for reuse.
pub const POOL_CAPACITY: usize = 6;

/// Per-request timeout: connection establishment and the maximum stall
/// between body reads. Long transfers are not bounded as a whole.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);

/// Shared pool of HTTP client handles.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Client>>,
    capacity: usize,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::with_capacity(POOL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Pops an idle handle or builds a new one.
    pub fn acquire(&self) -> DownloadResult<PooledClient> {
        let reused = self.inner.idle.lock().unwrap().pop();
        let client = match reused {
            Some(c) => c,
            None => build_client()?,
        };
        Ok(PooledClient {
            client: Some(client),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Number of handles currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().unwrap().len()
    }
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

fn build_client() -> DownloadResult<Client> {
    Client::builder()
        .connect_timeout(REQUEST_TIMEOUT)
        .read_timeout(REQUEST_TIMEOUT)
        .timeout(None)
        .build()
        .map_err(|e| DownloadError::http(format!("build http client: {e}")))
}

/// RAII handle lease. Derefs to the client; drop returns it to the pool.
pub struct PooledClient {
    client: Option<Client>,
    pool: Arc<PoolInner>,
}

impl std::ops::Deref for PooledClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        self.client.as_ref().expect("client taken before drop")
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            let mut idle = self.pool.idle.lock().unwrap();
            if idle.len() < self.pool.capacity {
                idle.push(client);
            }
            // Overflow handles are closed by falling out of scope.
        }
    }
}
