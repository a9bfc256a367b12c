//! Retry pacing between tunnel sessions

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the delay
    pub max_delay: Duration,
    /// Delay multiplier per retry (1.0 = fixed delay)
    pub multiplier: f64,
    /// Maximum number of retries (None = unlimited)
    pub max_retries: Option<usize>,
}

impl ReconnectConfig {
    /// Same delay before every retry
    pub fn fixed(delay: Duration, max_retries: usize) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            max_retries: Some(max_retries),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 5)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached")]
    MaxAttemptsReached,

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Counts retries since the last successful session
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            config,
            attempt: 0,
        }
    }

    /// Wait before the next retry, or fail once the retries are used up
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        self.attempt += 1;

        if let Some(max_retries) = self.config.max_retries {
            if self.attempt > max_retries {
                return Err(ReconnectError::MaxAttemptsReached);
            }
        }

        debug!(
            "Waiting {}ms before reconnection attempt {}",
            self.current_delay.as_millis(),
            self.attempt
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
            _ = sleep(self.current_delay) => {}
        }

        let next_delay =
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier);
        self.current_delay = next_delay.min(self.config.max_delay);

        Ok(())
    }

    /// Call after a session was established
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Resetting reconnection counter");
        }
        self.current_delay = self.config.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn max_retries(&self) -> Option<usize> {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fixed_delay() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_millis(10), 3));
        let cancel = CancellationToken::new();

        for attempt in 1..=3 {
            manager.wait(&cancel).await.unwrap();
            assert_eq!(manager.attempt(), attempt);
            assert_eq!(manager.current_delay(), Duration::from_millis(10));
        }
    }

    #[tokio::test]
    async fn test_backoff_capped() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(30),
            multiplier: 2.0,
            max_retries: None,
        };
        let mut manager = ReconnectManager::new(config);
        let cancel = CancellationToken::new();

        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(20));
        manager.wait(&cancel).await.unwrap();
        assert_eq!(manager.current_delay(), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_max_retries() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_millis(1), 2));
        let cancel = CancellationToken::new();

        assert!(manager.wait(&cancel).await.is_ok());
        assert!(manager.wait(&cancel).await.is_ok());
        assert_eq!(
            manager.wait(&cancel).await,
            Err(ReconnectError::MaxAttemptsReached)
        );
    }

    #[tokio::test]
    async fn test_reset_restores_budget() {
        let mut manager = ReconnectManager::new(ReconnectConfig::fixed(Duration::from_millis(1), 1));
        let cancel = CancellationToken::new();

        manager.wait(&cancel).await.unwrap();
        manager.reset();
        assert_eq!(manager.attempt(), 0);
        assert!(manager.wait(&cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let mut manager =
            ReconnectManager::new(ReconnectConfig::fixed(Duration::from_secs(60), 5));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(manager.wait(&cancel).await, Err(ReconnectError::Cancelled));
    }
}
