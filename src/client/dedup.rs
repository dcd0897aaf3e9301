//! In-flight request deduplication.
//!
//! Two identical requests (same method, path, and body) issued concurrently
//! against one client share a single outbound call and settle with the same
//! result. This guards against duplicate side effects, e.g. double invoice
//! creation from racing webhook handlers. The map is scoped per client
//! instance; independent clients keep independent outstanding requests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::future::{BoxFuture, FutureExt, Shared};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::ApiResponse;
use crate::error::Error;

type SharedRequest = Shared<BoxFuture<'static, Result<ApiResponse, Arc<Error>>>>;

/// Derive the dedup key from the request's identity.
pub fn request_key(method: &str, path: &str, body: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(path.as_bytes());
    hasher.update(b"\n");
    if let Some(body) = body {
        hasher.update(body);
    }
    format!("{method} {path} {}", BASE64.encode(hasher.finalize()))
}

/// Map of in-flight requests keyed by [`request_key`].
pub struct InFlightRequests {
    map: Arc<Mutex<HashMap<String, SharedRequest>>>,
}

impl InFlightRequests {
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, or join an identical request already in flight.
    ///
    /// The map entry is installed synchronously before the first await, so a
    /// second caller polled any time after always joins rather than racing.
    /// The entry is removed once the shared result settles, success or
    /// failure.
    pub async fn run(
        &self,
        key: String,
        work: BoxFuture<'static, Result<ApiResponse, Arc<Error>>>,
    ) -> Result<ApiResponse, Arc<Error>> {
        let fut = {
            let mut map = self.map.lock().unwrap();
            if let Some(existing) = map.get(&key) {
                debug!(key = %key, "joining identical in-flight request");
                existing.clone()
            } else {
                let map_handle = self.map.clone();
                let entry_key = key.clone();
                let fut: SharedRequest = async move {
                    let result = work.await;
                    map_handle.lock().unwrap().remove(&entry_key);
                    result
                }
                .boxed()
                .shared();
                map.insert(key, fut.clone());
                fut
            }
        };

        fut.await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }
}
