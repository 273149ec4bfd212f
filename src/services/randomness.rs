use async_trait::async_trait;
use rand::RngCore;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep, Duration};

use crate::{
    config::{Config, RandomnessSource},
    constants::SERVER_SEED_BYTES,
    error::{AppError, Result},
};

// ==================== PROVIDER TRAIT ====================

/// Bulk source of server seeds.
#[async_trait]
pub trait RandomnessProvider: Send + Sync {
    async fn generate(&self, count: usize) -> Result<Vec<String>>;

    fn name(&self) -> &'static str;
}

pub fn provider_from_config(config: &Config) -> Arc<dyn RandomnessProvider> {
    match config.randomness_source {
        RandomnessSource::RandomOrg => Arc::new(RandomOrgProvider::new(
            config.random_org_url.clone(),
            config.random_org_api_key.clone().unwrap_or_default(),
        )),
        RandomnessSource::Local => Arc::new(LocalEntropyProvider),
    }
}

// ==================== RANDOM.ORG ====================

/// Signed string generation over the random.org JSON-RPC API.
pub struct RandomOrgProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<RpcResult>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcResult {
    random: RpcRandom,
    signature: String,
}

#[derive(Debug, Deserialize)]
struct RpcRandom {
    data: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl RandomOrgProvider {
    pub fn new(url: String, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            api_key,
        }
    }

    fn request_body(&self, count: usize) -> serde_json::Value {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "generateSignedStrings",
            "params": {
                "apiKey": self.api_key,
                "n": count,
                "length": SERVER_SEED_BYTES * 2,
                "characters": "0123456789abcdef",
                "replacement": true,
            },
            "id": rand::random::<u32>(),
        })
    }
}

// Internal helper that extracts seeds from a JSON-RPC response.
fn parse_rpc_response(response: RpcResponse) -> Result<Vec<String>> {
    if let Some(err) = response.error {
        return Err(AppError::ExternalAPI(format!(
            "random.org error {}: {}",
            err.code, err.message
        )));
    }
    let result = response
        .result
        .ok_or_else(|| AppError::ExternalAPI("random.org response without result".to_string()))?;
    if result.signature.trim().is_empty() {
        return Err(AppError::ExternalAPI(
            "random.org response is not signed".to_string(),
        ));
    }
    Ok(result.random.data)
}

#[async_trait]
impl RandomnessProvider for RandomOrgProvider {
    async fn generate(&self, count: usize) -> Result<Vec<String>> {
        let response: RpcResponse = self
            .client
            .post(&self.url)
            .json(&self.request_body(count))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_rpc_response(response)
    }

    fn name(&self) -> &'static str {
        "random.org"
    }
}

// ==================== LOCAL ====================

/// OS CSPRNG. Used for development and tests.
pub struct LocalEntropyProvider;

#[async_trait]
impl RandomnessProvider for LocalEntropyProvider {
    async fn generate(&self, count: usize) -> Result<Vec<String>> {
        let mut rng = rand::rng();
        Ok((0..count)
            .map(|_| {
                let mut bytes = [0u8; SERVER_SEED_BYTES];
                rng.fill_bytes(&mut bytes);
                hex::encode(bytes)
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

// ==================== POOL ====================

/// Buffer of server seeds topped up in the background.
///
/// `acquire` only waits when the buffer is empty, and then on the single
/// in-flight refill.
pub struct RandomnessPool {
    provider: Arc<dyn RandomnessProvider>,
    seeds: Mutex<VecDeque<String>>,
    refilling: AtomicBool,
    refilled: Notify,
    min_size: usize,
    batch_size: usize,
    retry_delay: Duration,
}

impl RandomnessPool {
    pub fn new(
        provider: Arc<dyn RandomnessProvider>,
        min_size: usize,
        batch_size: usize,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider,
            seeds: Mutex::new(VecDeque::new()),
            refilling: AtomicBool::new(false),
            refilled: Notify::new(),
            min_size,
            batch_size: batch_size.max(1),
            retry_delay,
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(
            provider_from_config(config),
            config.seed_pool_min_size,
            config.seed_pool_batch_size,
            Duration::from_secs(config.seed_pool_retry_secs),
        )
    }

    /// Starts the initial fill without waiting for it.
    pub fn warm_up(self: &Arc<Self>) {
        self.trigger_refill();
    }

    pub async fn available(&self) -> usize {
        self.seeds.lock().await.len()
    }

    pub fn is_refilling(&self) -> bool {
        self.refilling.load(Ordering::Acquire)
    }

    pub async fn acquire(self: &Arc<Self>) -> String {
        loop {
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            {
                let mut seeds = self.seeds.lock().await;
                if let Some(seed) = seeds.pop_front() {
                    if seeds.len() < self.min_size {
                        self.trigger_refill();
                    }
                    return seed;
                }
                // Registered before the lock is released so the wake-up that
                // follows a refill cannot be missed.
                notified.as_mut().enable();
            }
            tracing::debug!("Seed pool empty, waiting for refill");
            self.trigger_refill();
            notified.await;
        }
    }

    // Internal helper that starts a refill unless one is already running.
    fn trigger_refill(self: &Arc<Self>) {
        if self
            .refilling
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.refill().await;
        });
    }

    async fn refill(&self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match self.provider.generate(self.batch_size).await {
                Ok(batch) if !batch.is_empty() => {
                    let mut seeds = self.seeds.lock().await;
                    seeds.extend(batch);
                    tracing::debug!(
                        "Seed pool refilled from {} ({} available)",
                        self.provider.name(),
                        seeds.len()
                    );
                    self.refilling.store(false, Ordering::Release);
                    self.refilled.notify_waiters();
                    return;
                }
                Ok(_) => {
                    tracing::warn!(
                        "Seed provider {} returned an empty batch (attempt {})",
                        self.provider.name(),
                        attempt
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Seed provider {} failed (attempt {}): {}",
                        self.provider.name(),
                        attempt,
                        e
                    );
                }
            }
            sleep(self.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingProvider {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
    }

    impl CountingProvider {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait]
    impl RandomnessProvider for CountingProvider {
        async fn generate(&self, count: usize) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AppError::ExternalAPI("provider down".to_string()));
            }
            Ok((0..count).map(|i| format!("seed-{}", i)).collect())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn concurrent_acquires_share_a_single_refill() {
        let provider = CountingProvider::new(0);
        let pool = RandomnessPool::new(provider.clone(), 0, 16, Duration::from_millis(1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().starts_with("seed-"));
        }

        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.available().await, 8);
    }

    #[tokio::test]
    async fn refill_retries_until_provider_recovers() {
        let provider = CountingProvider::new(3);
        let pool = RandomnessPool::new(provider.clone(), 0, 4, Duration::from_millis(1));

        let seed = pool.acquire().await;
        assert_eq!(seed, "seed-0");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn low_watermark_triggers_background_top_up() {
        let provider = CountingProvider::new(0);
        let pool = RandomnessPool::new(provider.clone(), 3, 4, Duration::from_millis(1));

        pool.acquire().await;
        // 3 left, at the watermark: no refill yet.
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        pool.acquire().await;
        // 2 left: a top-up starts without blocking the caller.
        for _ in 0..50 {
            if pool.available().await >= 6 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(pool.available().await, 6);
    }

    #[tokio::test]
    async fn local_provider_yields_distinct_hex_seeds() {
        let seeds = LocalEntropyProvider.generate(4).await.unwrap();
        assert_eq!(seeds.len(), 4);
        assert!(seeds.iter().all(|s| s.len() == SERVER_SEED_BYTES * 2));
        assert_ne!(seeds[0], seeds[1]);
    }

    #[test]
    fn rpc_error_is_surfaced() {
        let response = RpcResponse {
            result: None,
            error: Some(RpcError {
                code: 402,
                message: "quota exceeded".to_string(),
            }),
        };
        assert!(parse_rpc_response(response).is_err());
    }

    #[test]
    fn unsigned_rpc_result_is_rejected() {
        let response = RpcResponse {
            result: Some(RpcResult {
                random: RpcRandom {
                    data: vec!["ab".to_string()],
                },
                signature: String::new(),
            }),
            error: None,
        };
        assert!(parse_rpc_response(response).is_err());
    }
}
