//! Shared fixtures for the relay benchmarks.

use relay_core::{
    BroadcastRegistry, DeliverySession, LineSink, Payload, RegistryConfig, SessionEnd,
    Subscription,
};

/// A registry with `count` subscribers whose join notices have been drained.
pub fn registry_with_subscribers(
    count: usize,
    queue_capacity: usize,
) -> (BroadcastRegistry, Vec<Subscription>) {
    let registry = BroadcastRegistry::with_config(RegistryConfig { queue_capacity });
    let mut subs: Vec<_> = (0..count).map(|_| registry.subscribe()).collect();
    drain(&mut subs);
    (registry, subs)
}

/// Empty every queue without waiting. Returns how many envelopes were taken.
pub fn drain(subs: &mut [Subscription]) -> usize {
    let mut taken = 0;
    for sub in subs {
        while sub.try_recv().is_ok() {
            taken += 1;
        }
    }
    taken
}

/// A text payload with a body of `len` bytes.
pub fn text_payload(len: usize) -> Payload {
    Payload::text("bench", "x".repeat(len))
}

/// Open a session streaming into a discarding [`LineSink`], publish
/// `publishes` text envelopes from another task, then cancel the session.
pub async fn stream_to_discard(registry: &BroadcastRegistry, publishes: u64) -> SessionEnd {
    let mut session = DeliverySession::open(registry);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

    let publisher = registry.clone();
    let task = tokio::spawn(async move {
        for _ in 0..publishes {
            publisher.publish_payload(text_payload(64));
            tokio::task::yield_now().await;
        }
        let _ = stop_tx.send(());
    });

    let mut sink = LineSink::new(tokio::io::sink());
    let end = session
        .run(&mut sink, async move {
            let _ = stop_rx.await;
        })
        .await;
    let _ = task.await;
    end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_starts_drained() {
        let (registry, mut subs) = registry_with_subscribers(5, 16);
        assert_eq!(registry.subscriber_count(), 5);
        assert_eq!(drain(&mut subs), 0);

        registry.publish_payload(text_payload(8));
        assert_eq!(drain(&mut subs), 5);
    }

    #[tokio::test]
    async fn test_stream_to_discard_runs_to_cancellation() {
        let registry = BroadcastRegistry::new();
        let end = stream_to_discard(&registry, 32).await;

        assert!(matches!(end, SessionEnd::Cancelled));
        assert_eq!(registry.subscriber_count(), 0);
        // join, 32 texts, leave
        assert_eq!(registry.stats().published, 34);
    }
}
