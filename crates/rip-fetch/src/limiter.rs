use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct DomainSlot {
    semaphore: Arc<Semaphore>,
    last_start: Mutex<Option<Instant>>,
}

/// Global concurrency ceiling plus per-domain concurrency and spacing.
#[derive(Debug)]
pub struct DomainLimiter {
    global: Arc<Semaphore>,
    per_domain_limit: usize,
    min_delay: Duration,
    domains: Mutex<HashMap<String, Arc<DomainSlot>>>,
}

/// Held for the duration of one request.
#[derive(Debug)]
pub struct LimiterPermit {
    _domain: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
    pub waited: Duration,
}

impl DomainLimiter {
    pub fn new(global_concurrency: usize, per_domain_concurrency: usize, min_delay: Duration) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_concurrency.max(1))),
            per_domain_limit: per_domain_concurrency.max(1),
            min_delay,
            domains: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        let mut domains = self.domains.lock().await;
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                Arc::new(DomainSlot {
                    semaphore: Arc::new(Semaphore::new(self.per_domain_limit)),
                    last_start: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Waits for a domain slot, then a global slot, then the minimum spacing
    /// since the previous request to the same domain.
    pub async fn acquire(&self, domain: &str) -> Result<LimiterPermit, AcquireError> {
        let started = Instant::now();
        let slot = self.slot(domain).await;
        let domain_permit = slot.semaphore.clone().acquire_owned().await?;
        let global_permit = self.global.clone().acquire_owned().await?;

        {
            let mut last_start = slot.last_start.lock().await;
            if let Some(previous) = *last_start {
                let since = previous.elapsed();
                if since < self.min_delay {
                    tokio::time::sleep(self.min_delay - since).await;
                }
            }
            *last_start = Some(Instant::now());
        }

        Ok(LimiterPermit {
            _domain: domain_permit,
            _global: global_permit,
            waited: started.elapsed(),
        })
    }
}
