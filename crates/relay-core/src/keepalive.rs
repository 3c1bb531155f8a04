//! Jittered keepalive pings.
//!
//! A single background task publishes a `Ping` envelope padded with a random
//! number of random bytes. The padding length also picks the delay until the
//! next ping, so pings never settle into a fixed rhythm.

use crate::envelope::{Envelope, Payload};
use crate::registry::BroadcastRegistry;
use rand_core::{OsRng, RngCore};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Padding length used when the random source fails.
pub const FALLBACK_NONCE_LEN: u8 = 69;

/// Keepalive configuration.
#[derive(Debug, Clone)]
pub struct KeepaliveConfig {
    /// Delay before the first ping.
    pub initial_delay: Duration,
    /// Shortest delay between pings.
    pub min_interval_secs: u64,
    /// Delays stay strictly below this.
    pub max_interval_secs: u64,
    /// Upper bound on padding length.
    pub max_nonce_len: u8,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            min_interval_secs: 2,
            max_interval_secs: 30,
            max_nonce_len: 100,
        }
    }
}

impl KeepaliveConfig {
    /// Delay that follows a ping with `nonce_len` bytes of padding.
    #[must_use]
    pub fn delay_for(&self, nonce_len: u8) -> Duration {
        let span = self
            .max_interval_secs
            .saturating_sub(self.min_interval_secs)
            .max(1);
        Duration::from_secs(self.min_interval_secs + u64::from(nonce_len) % span)
    }
}

/// Publishes pings into a registry on a jittered schedule.
pub struct Keepalive<R = OsRng> {
    registry: BroadcastRegistry,
    config: KeepaliveConfig,
    rng: R,
}

impl Keepalive<OsRng> {
    /// Create a keepalive backed by the operating system's random source.
    #[must_use]
    pub fn new(registry: BroadcastRegistry, config: KeepaliveConfig) -> Self {
        Self::with_rng(registry, config, OsRng)
    }
}

impl<R> Keepalive<R>
where
    R: RngCore + Send + 'static,
{
    /// Create a keepalive drawing padding from `rng`.
    #[must_use]
    pub fn with_rng(registry: BroadcastRegistry, config: KeepaliveConfig, rng: R) -> Self {
        Self {
            registry,
            config,
            rng,
        }
    }

    /// Generate padding. Never fails: a broken random source degrades to
    /// fixed content.
    pub fn nonce(&mut self) -> Vec<u8> {
        let mut len = [0u8; 1];
        if let Err(e) = self.rng.try_fill_bytes(&mut len) {
            warn!(error = %e, "Failed to generate random length, using placeholder");
            len[0] = FALLBACK_NONCE_LEN;
        }
        if len[0] > self.config.max_nonce_len {
            trace!(orig = len[0], "Capped ping padding length");
            len[0] = self.config.max_nonce_len;
        }

        let mut nonce = vec![0u8; usize::from(len[0])];
        if let Err(e) = self.rng.try_fill_bytes(&mut nonce) {
            warn!(error = %e, "Failed to generate random bytes, using index");
            for (i, b) in nonce.iter_mut().enumerate() {
                *b = i as u8;
            }
        }
        nonce
    }

    /// Build the next ping and the delay that should follow it.
    pub fn next_ping(&mut self) -> (Envelope, Duration) {
        let nonce = self.nonce();
        let len = u8::try_from(nonce.len()).unwrap_or(self.config.max_nonce_len);
        let delay = self.config.delay_for(len);
        (self.registry.envelope(Payload::ping(nonce)), delay)
    }

    /// Publish one ping and return the delay until the next.
    pub fn tick(&mut self) -> Duration {
        let (envelope, delay) = self.next_ping();
        let recipients = self.registry.publish(envelope);
        debug!(recipients, next_in = ?delay, "Keepalive ping");
        delay
    }

    /// Run forever.
    pub async fn run(mut self) {
        tokio::time::sleep(self.config.initial_delay).await;
        loop {
            let delay = self.tick();
            tokio::time::sleep(delay).await;
        }
    }

    /// Run on a background task for the rest of the process.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    /// Fills every byte with the same value.
    struct FixedRng(u8);

    impl RngCore for FixedRng {
        fn next_u32(&mut self) -> u32 {
            u32::from_le_bytes([self.0; 4])
        }

        fn next_u64(&mut self) -> u64 {
            u64::from_le_bytes([self.0; 8])
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            dest.fill(self.0);
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct BrokenRng;

    impl RngCore for BrokenRng {
        fn next_u32(&mut self) -> u32 {
            0
        }

        fn next_u64(&mut self) -> u64 {
            0
        }

        fn fill_bytes(&mut self, _dest: &mut [u8]) {}

        fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand_core::Error> {
            let code = NonZeroU32::new(rand_core::Error::CUSTOM_START).unwrap();
            Err(rand_core::Error::from(code))
        }
    }

    fn ping_nonce(envelope: &Envelope) -> Vec<u8> {
        match envelope.payload() {
            Payload::Ping(ping) => ping.nonce.to_vec(),
            other => panic!("expected ping, got {other:?}"),
        }
    }

    #[test]
    fn test_jitter_bounds_for_every_length_byte() {
        let registry = BroadcastRegistry::new();
        for byte in 0..=u8::MAX {
            let mut keepalive =
                Keepalive::with_rng(registry.clone(), KeepaliveConfig::default(), FixedRng(byte));
            let (envelope, delay) = keepalive.next_ping();
            let nonce = ping_nonce(&envelope);

            assert!(nonce.len() <= 100);
            assert_eq!(nonce.len(), usize::from(byte.min(100)));
            assert!(delay >= Duration::from_secs(2), "{delay:?}");
            assert!(delay < Duration::from_secs(30), "{delay:?}");
        }
    }

    #[test]
    fn test_delay_follows_length() {
        let config = KeepaliveConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_secs(2));
        assert_eq!(config.delay_for(27), Duration::from_secs(29));
        assert_eq!(config.delay_for(28), Duration::from_secs(2));
        assert_eq!(config.delay_for(100), Duration::from_secs(18));
    }

    #[test]
    fn test_broken_rng_falls_back() {
        let registry = BroadcastRegistry::new();
        let mut keepalive =
            Keepalive::with_rng(registry, KeepaliveConfig::default(), BrokenRng);

        let (envelope, delay) = keepalive.next_ping();
        let nonce = ping_nonce(&envelope);

        assert_eq!(nonce.len(), usize::from(FALLBACK_NONCE_LEN));
        assert!(nonce.iter().enumerate().all(|(i, b)| usize::from(*b) == i));
        assert_eq!(delay, Duration::from_secs(2 + 69 % 28));
    }

    #[test]
    fn test_tick_publishes_ping() {
        let registry = BroadcastRegistry::new();
        let mut sub = registry.subscribe();
        let _join = sub.try_recv().unwrap();

        let mut keepalive =
            Keepalive::with_rng(registry.clone(), KeepaliveConfig::default(), FixedRng(5));
        keepalive.tick();

        let ping = sub.try_recv().unwrap();
        assert_eq!(ping.kind(), "ping");
        assert!(!ping.is_hello());
        assert_eq!(ping_nonce(&ping), vec![5u8; 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule() {
        let registry = BroadcastRegistry::new();
        let mut sub = registry.subscribe();
        let _join = sub.try_recv().unwrap();

        // Length 10 -> 12 s between pings.
        let start = tokio::time::Instant::now();
        let task =
            Keepalive::with_rng(registry.clone(), KeepaliveConfig::default(), FixedRng(10))
                .spawn();

        sub.recv().await.unwrap();
        assert_eq!(start.elapsed().as_secs(), 10);

        sub.recv().await.unwrap();
        assert_eq!(start.elapsed().as_secs(), 22);

        sub.recv().await.unwrap();
        assert_eq!(start.elapsed().as_secs(), 34);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_without_subscribers() {
        let registry = BroadcastRegistry::new();
        let task =
            Keepalive::with_rng(registry.clone(), KeepaliveConfig::default(), FixedRng(0))
                .spawn();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(registry.stats().published >= 2);
        assert!(!task.is_finished());

        task.abort();
    }
}
