//! Per-hostname certificate lifecycle
//!
//! ```text
//! none ──► pending ──► valid ──(renewal window)──► pending ──► valid
//!             │
//!             └──► failed ──(backoff elapsed)──► pending ──► …
//! ```
//!
//! Concurrent requests for one hostname share a single issuance. Requests for
//! different hostnames never wait on each other. A certificate that is still
//! within its validity keeps being served while its renewal is in flight or
//! after a renewal attempt failed.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::authority::{certified_key_from_pem, CertificateAuthority, IssuedCertificate};
use crate::storage::CertificateStore;
use crate::CertError;

type IssueResult = Result<Arc<CertifiedKey>, CertError>;
type InFlight = Shared<BoxFuture<'static, IssueResult>>;
type Retention = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Lifecycle state of one hostname's certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Pending,
    Valid,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CertManagerConfig {
    /// Certificates expiring within this window are renewed by the sweep
    pub renewal_window: chrono::Duration,
    /// First retry delay after a failed issuance
    pub backoff_base: Duration,
    /// Upper bound for the retry delay
    pub backoff_max: Duration,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            renewal_window: chrono::Duration::days(30),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(3600),
        }
    }
}

impl CertManagerConfig {
    /// `min(base × 2^(failures-1), max)`
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.backoff_base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

#[derive(Clone)]
struct CertificateRecord {
    status: CertStatus,
    key: Option<Arc<CertifiedKey>>,
    expires_at: Option<DateTime<Utc>>,
    failures: u32,
    retry_after: Option<Instant>,
    last_error: Option<String>,
}

impl CertificateRecord {
    fn pending() -> Self {
        Self {
            status: CertStatus::Pending,
            key: None,
            expires_at: None,
            failures: 0,
            retry_after: None,
            last_error: None,
        }
    }

    fn usable_key(&self, now: DateTime<Utc>) -> Option<Arc<CertifiedKey>> {
        match (&self.key, self.expires_at) {
            (Some(key), Some(expires_at)) if expires_at > now => Some(key.clone()),
            _ => None,
        }
    }
}

/// Outcome of a renewal sweep
#[derive(Debug, Default)]
pub struct RenewalReport {
    pub renewed: Vec<String>,
    pub failed: Vec<(String, CertError)>,
    /// Dropped by the retention filter
    pub evicted: Vec<String>,
}

impl RenewalReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Issues, caches and renews certificates per hostname
#[derive(Clone)]
pub struct CertificateManager {
    authority: Arc<dyn CertificateAuthority>,
    store: Option<CertificateStore>,
    config: CertManagerConfig,
    records: Arc<DashMap<String, CertificateRecord>>,
    in_flight: Arc<DashMap<String, InFlight>>,
    retention: Option<Retention>,
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("authority", &self.authority.name())
            .field("store", &self.store)
            .field("records", &self.records.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl CertificateManager {
    pub fn new(authority: Arc<dyn CertificateAuthority>, config: CertManagerConfig) -> Self {
        Self {
            authority,
            store: None,
            config,
            records: Arc::new(DashMap::new()),
            in_flight: Arc::new(DashMap::new()),
            retention: None,
        }
    }

    /// Persist issued certificates to `store`
    ///
    /// Cache misses are served from the store before anything is issued.
    pub fn with_store(mut self, store: CertificateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Hostnames for which `keep` is false are evicted by the renewal sweep
    /// instead of being renewed
    pub fn with_retention(mut self, keep: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.retention = Some(Arc::new(keep));
        self
    }

    /// Populate the cache from the store; returns how many were loaded
    pub async fn load_stored(&self) -> Result<usize, CertError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for (domain, cert) in store.load_all().await? {
            match certified_key_from_pem(&cert.certificate_chain_pem, &cert.private_key_pem) {
                Ok(key) => {
                    debug!(domain = %domain, expires_at = %cert.expires_at, "Loaded stored certificate");
                    self.records.insert(
                        domain,
                        CertificateRecord {
                            status: CertStatus::Valid,
                            key: Some(key),
                            expires_at: Some(cert.expires_at),
                            ..CertificateRecord::pending()
                        },
                    );
                    loaded += 1;
                }
                Err(e) => warn!(domain = %domain, "Ignoring stored certificate: {}", e),
            }
        }

        info!(count = loaded, "Loaded stored certificates");
        Ok(loaded)
    }

    /// Certificate for `hostname`, issuing one if needed
    pub async fn certificate_for(&self, hostname: &str) -> IssueResult {
        let hostname = hostname.to_ascii_lowercase();

        if let Some(record) = self.records.get(&hostname).map(|r| r.value().clone()) {
            if let Some(key) = record.usable_key(Utc::now()) {
                return Ok(key);
            }

            if record.status == CertStatus::Failed {
                if let Some(retry_after) = record.retry_after {
                    let now = Instant::now();
                    if retry_after > now {
                        return Err(CertError::Backoff {
                            domain: hostname,
                            retry_in: retry_after - now,
                        });
                    }
                }
            }
        } else if let Some(key) = self.load_from_store(&hostname).await {
            return Ok(key);
        }

        self.issue(&hostname).await
    }

    async fn load_from_store(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        let store = self.store.as_ref()?;
        let stored = match store.load(hostname).await {
            Ok(stored) => stored?,
            Err(e) => {
                warn!(domain = hostname, "Failed to read stored certificate: {}", e);
                return None;
            }
        };
        if stored.expires_at <= Utc::now() {
            return None;
        }

        match certified_key_from_pem(&stored.certificate_chain_pem, &stored.private_key_pem) {
            Ok(key) => {
                debug!(domain = hostname, expires_at = %stored.expires_at, "Loaded certificate from store");
                self.records.insert(
                    hostname.to_string(),
                    CertificateRecord {
                        status: CertStatus::Valid,
                        key: Some(key.clone()),
                        expires_at: Some(stored.expires_at),
                        ..CertificateRecord::pending()
                    },
                );
                Some(key)
            }
            Err(e) => {
                warn!(domain = hostname, "Ignoring stored certificate: {}", e);
                None
            }
        }
    }

    /// Drop the cached certificate for `hostname`
    ///
    /// An issuance in flight is left alone. Stored copies stay on disk.
    pub fn evict(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        if self.in_flight.contains_key(&hostname) {
            return false;
        }
        self.records.remove(&hostname).is_some()
    }

    fn evict_unretained(&self) -> Vec<String> {
        let Some(keep) = &self.retention else {
            return Vec::new();
        };

        let unwanted: Vec<String> = self
            .records
            .iter()
            .filter(|entry| !keep(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let evicted: Vec<String> = unwanted
            .into_iter()
            .filter(|hostname| self.evict(hostname))
            .collect();
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Evicted certificates of unbound hostnames");
        }
        evicted
    }

    pub fn status(&self, hostname: &str) -> Option<CertStatus> {
        self.records
            .get(&hostname.to_ascii_lowercase())
            .map(|r| r.status)
    }

    pub fn expires_at(&self, hostname: &str) -> Option<DateTime<Utc>> {
        self.records
            .get(&hostname.to_ascii_lowercase())
            .and_then(|r| r.expires_at)
    }

    /// Last issuance error recorded for `hostname`
    pub fn last_error(&self, hostname: &str) -> Option<String> {
        self.records
            .get(&hostname.to_ascii_lowercase())
            .and_then(|r| r.last_error.clone())
    }

    /// Join the in-flight issuance for `hostname`, or start one
    async fn issue(&self, hostname: &str) -> IssueResult {
        let shared = match self.in_flight.entry(hostname.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let handle = self.spawn_issuance(hostname.to_string());
                let manager = self.clone();
                let domain = hostname.to_string();
                let shared = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => {
                            // The task never reached its own bookkeeping
                            let error = CertError::IssuanceFailed {
                                domain: domain.clone(),
                                reason: format!("issuance task failed: {}", e),
                            };
                            manager.record_failure(&domain, &error);
                            manager.in_flight.remove(&domain);
                            Err(error)
                        }
                    }
                }
                .boxed()
                .shared();
                entry.insert(shared.clone());
                shared
            }
        };

        shared.await
    }

    fn spawn_issuance(&self, hostname: String) -> JoinHandle<IssueResult> {
        self.records
            .entry(hostname.clone())
            .and_modify(|r| r.status = CertStatus::Pending)
            .or_insert_with(CertificateRecord::pending);

        let manager = self.clone();
        tokio::spawn(async move {
            debug!(domain = %hostname, authority = manager.authority.name(), "Starting certificate issuance");

            let result = match manager.authority.obtain(&hostname).await {
                Ok(issued) => manager.install(&hostname, issued).await,
                Err(e) => Err(e),
            };

            if let Err(e) = &result {
                manager.record_failure(&hostname, e);
            }

            // Record is updated before the in-flight entry goes away, so late
            // callers either join this future or see the outcome
            manager.in_flight.remove(&hostname);
            result
        })
    }

    async fn install(&self, hostname: &str, issued: IssuedCertificate) -> IssueResult {
        let key = certified_key_from_pem(&issued.certificate_chain_pem, &issued.private_key_pem)
            .map_err(|e| CertError::IssuanceFailed {
                domain: hostname.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(hostname, &issued).await {
                warn!(domain = hostname, "Failed to persist certificate: {}", e);
            }
        }

        self.records.insert(
            hostname.to_string(),
            CertificateRecord {
                status: CertStatus::Valid,
                key: Some(key.clone()),
                expires_at: Some(issued.expires_at),
                ..CertificateRecord::pending()
            },
        );

        info!(domain = hostname, expires_at = %issued.expires_at, "Certificate valid");
        Ok(key)
    }

    fn record_failure(&self, hostname: &str, error: &CertError) {
        let mut record = self
            .records
            .entry(hostname.to_string())
            .or_insert_with(CertificateRecord::pending);

        record.status = CertStatus::Failed;
        record.failures = record.failures.saturating_add(1);
        let delay = self.config.backoff_for(record.failures);
        record.retry_after = Some(Instant::now() + delay);
        record.last_error = Some(error.to_string());

        warn!(
            domain = hostname,
            failures = record.failures,
            retry_in_secs = delay.as_secs(),
            outcome = "certificate_issuance_failed",
            "Certificate issuance failed: {}",
            error
        );
    }

    /// Hostnames the sweep should (re)issue right now
    fn renewal_candidates(&self) -> Vec<String> {
        let now = Utc::now();
        let instant_now = Instant::now();
        let threshold = now + self.config.renewal_window;

        self.records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                match record.status {
                    CertStatus::Valid => record.expires_at.map_or(true, |exp| exp <= threshold),
                    CertStatus::Failed => record.retry_after.map_or(true, |at| at <= instant_now),
                    CertStatus::Pending => false,
                }
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Renew every certificate that is due; one failure never stops the others
    ///
    /// Hostnames rejected by the retention filter are evicted first.
    pub async fn renew_all(&self) -> RenewalReport {
        let evicted = self.evict_unretained();
        let candidates = self.renewal_candidates();
        if candidates.is_empty() {
            debug!("No certificates due for renewal");
            return RenewalReport {
                evicted,
                ..Default::default()
            };
        }

        info!(count = candidates.len(), "Renewing certificates");

        let results = futures::future::join_all(
            candidates
                .iter()
                .map(|hostname| async move { (hostname.clone(), self.issue(hostname).await) }),
        )
        .await;

        let mut report = RenewalReport {
            evicted,
            ..Default::default()
        };
        for (hostname, result) in results {
            match result {
                Ok(_) => report.renewed.push(hostname),
                Err(e) => report.failed.push((hostname, e)),
            }
        }

        info!(
            renewed = report.renewed.len(),
            failed = report.failed.len(),
            "Certificate renewal check completed"
        );
        report
    }

    /// Run `renew_all` every `interval` until `cancel` fires
    pub fn spawn_renewal(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Certificate renewal task stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        manager.renew_all().await;
                    }
                }
            }
        })
    }
}
