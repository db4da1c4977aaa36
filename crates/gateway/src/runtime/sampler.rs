//! Background utilization sampling.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::manager::SessionManager;
use super::quota::QuotaAllocator;
use crate::quota_source::QuotaSource;

/// Poll `source` every `every` until `shutdown` fires. After each sample,
/// idle sessions whose queues were held by quota pressure are resumed if
/// the pressure has eased.
pub fn spawn_sampler(
    allocator: Arc<QuotaAllocator>,
    source: Arc<dyn QuotaSource>,
    manager: Option<Arc<SessionManager>>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match allocator.record_utilization_sample(source.as_ref()).await {
                Ok(Some(sample)) => {
                    tracing::debug!(
                        five_hour_pct = sample.five_hour_pct,
                        seven_day_pct = sample.seven_day_pct,
                        "utilization sampled"
                    );
                    if let Some(manager) = &manager {
                        let resumed = manager.resume_idle_queues();
                        if resumed > 0 {
                            tracing::info!(resumed, "queued sessions resumed");
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "quota poll failed"),
            }
        }
        tracing::info!("quota sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_source::QuotaReading;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sw_domain::config::AllocatorConfig;
    use sw_domain::error::Result;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl QuotaSource for Counting {
        async fn query_quota(&self) -> Result<Option<QuotaReading>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) as f64;
            Ok(Some(QuotaReading {
                five_hour: 0.1 + n * 0.01,
                seven_day: 0.05,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn samples_until_cancelled() {
        let allocator = Arc::new(QuotaAllocator::new(AllocatorConfig::default()));
        let source = Arc::new(Counting(AtomicUsize::new(0)));
        let token = CancellationToken::new();
        let task = spawn_sampler(
            allocator.clone(),
            source.clone(),
            None,
            Duration::from_secs(60),
            token.clone(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        token.cancel();
        task.await.unwrap();

        // Ticks at 0s, 60s and 120s.
        assert_eq!(allocator.sample_count(), 3);
        assert_eq!(source.0.load(Ordering::SeqCst), 3);
    }
}
