//! runtime/kv.rs — the shared key-value store (spec §3 "Shared state", §4.5,
//! §6). All values in this runtime's namespace are integers: node/edge/
//! program status enums encode to `i64`, and the remaining keys are plain
//! counters. A real deployment backs this trait with Redis (as the source
//! system did) or any store offering get/put/incr/decr plus a transactional
//! primitive; this crate ships `InMemoryKv` for tests and single-process
//! demos.

use crate::runtime::error::{Result, RuntimeError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>>;
    async fn put(&self, key: &str, value: i64) -> Result<()>;
    async fn incr(&self, key: &str, amount: i64) -> Result<i64>;
    async fn decr(&self, key: &str, amount: i64) -> Result<i64>;

    /// The sole correctness-critical operation in the runtime (spec §4.5).
    /// Atomically: if `cond_key` is unset or 0, increment `incr_key` by 1,
    /// set `cond_key` to 1, and return the post-increment value; otherwise
    /// return the current value of `incr_key` unchanged. Implementations
    /// must bound retries under contention and fail loudly after
    /// `timeout` rather than hang or silently corrupt the DAG.
    async fn conditional_increment(
        &self,
        incr_key: &str,
        cond_key: &str,
        timeout: Duration,
    ) -> Result<i64>;

    /// Atomically claims `key`: returns `true` for the one caller that
    /// observes it unset, `false` for every other caller racing or
    /// re-delivered afterward. Unlike `conditional_increment`, whose
    /// return value collapses to the same steady-state count for every
    /// caller once the gate is latched, this reports the transition
    /// itself — needed to guard a one-time side effect (e.g. bumping a
    /// global counter by a block-specific amount) rather than
    /// accumulating a shared sum.
    async fn claim_once(&self, key: &str, timeout: Duration) -> Result<bool>;
}

#[derive(Default)]
pub struct InMemoryKv {
    values: Mutex<HashMap<String, i64>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        InMemoryKv {
            values: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.values.lock().await.get(key).copied())
    }

    async fn put(&self, key: &str, value: i64) -> Result<()> {
        self.values.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn incr(&self, key: &str, amount: i64) -> Result<i64> {
        let mut guard = self.values.lock().await;
        let entry = guard.entry(key.to_string()).or_insert(0);
        *entry += amount;
        Ok(*entry)
    }

    async fn decr(&self, key: &str, amount: i64) -> Result<i64> {
        self.incr(key, -amount).await
    }

    async fn conditional_increment(
        &self,
        incr_key: &str,
        cond_key: &str,
        timeout: Duration,
    ) -> Result<i64> {
        let op = async {
            let mut guard = self.values.lock().await;
            let cond = *guard.get(cond_key).unwrap_or(&0);
            if cond == 0 {
                let new_val = {
                    let entry = guard.entry(incr_key.to_string()).or_insert(0);
                    *entry += 1;
                    *entry
                };
                guard.insert(cond_key.to_string(), 1);
                new_val
            } else {
                *guard.get(incr_key).unwrap_or(&0)
            }
        };
        tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| RuntimeError::CasTimeout {
                incr_key: incr_key.to_string(),
                cond_key: cond_key.to_string(),
                timeout_secs: timeout.as_secs(),
            })
    }

    async fn claim_once(&self, key: &str, timeout: Duration) -> Result<bool> {
        let op = async {
            let mut guard = self.values.lock().await;
            let cur = *guard.get(key).unwrap_or(&0);
            if cur == 0 {
                guard.insert(key.to_string(), 1);
                true
            } else {
                false
            }
        };
        tokio::time::timeout(timeout, op)
            .await
            .map_err(|_| RuntimeError::CasTimeout {
                incr_key: key.to_string(),
                cond_key: key.to_string(),
                timeout_secs: timeout.as_secs(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_increment_fires_once() {
        let kv = InMemoryKv::new();
        let v1 = kv
            .conditional_increment("sum", "cond", Duration::from_secs(1))
            .await
            .unwrap();
        let v2 = kv
            .conditional_increment("sum", "cond", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 1, "second delivery must not increment again");
    }

    #[tokio::test]
    async fn concurrent_duplicate_deliveries_increment_once() {
        let kv = std::sync::Arc::new(InMemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.conditional_increment("sum", "cond", Duration::from_secs(1))
                    .await
                    .unwrap()
            }));
        }
        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert!(results.iter().all(|&v| v == 1));
        assert_eq!(kv.get("sum").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn claim_once_fires_true_exactly_once() {
        let kv = InMemoryKv::new();
        assert!(kv.claim_once("flag", Duration::from_secs(1)).await.unwrap());
        assert!(!kv.claim_once("flag", Duration::from_secs(1)).await.unwrap());
        assert!(!kv.claim_once("flag", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_claim_once_has_exactly_one_winner() {
        let kv = std::sync::Arc::new(InMemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.claim_once("flag", Duration::from_secs(1)).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one racing caller must win the claim");
    }

    #[tokio::test]
    async fn incr_and_decr_are_plain_counters() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr("up", 1).await.unwrap(), 1);
        assert_eq!(kv.incr("up", 1).await.unwrap(), 2);
        assert_eq!(kv.decr("up", 1).await.unwrap(), 1);
    }
}
