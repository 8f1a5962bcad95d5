use std::sync::atomic::{AtomicU64, Ordering};

/// Hits and bytes served since the last accepted keepalive report.
///
/// Shared by `Arc` between the HTTP handlers (which add) and the
/// keepalive loop (which subtracts exactly what it reported).
#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, bytes: u64, hits: u64) {
        self.hits.fetch_add(hits, Ordering::AcqRel);
        self.bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Acquire),
            bytes: self.bytes.load(Ordering::Acquire),
        }
    }

    /// Remove a previously reported snapshot. Anything recorded after the
    /// snapshot was taken stays for the next report.
    pub fn drain(&self, reported: CounterSnapshot) {
        self.hits.fetch_sub(reported.hits, Ordering::AcqRel);
        self.bytes.fetch_sub(reported.bytes, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_records_sum() {
        let counters = Arc::new(Counters::new());

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let counters = counters.clone();
                tokio::spawn(async move {
                    for _ in 0..100 {
                        counters.record(1024, 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            counters.snapshot(),
            CounterSnapshot {
                hits: 6400,
                bytes: 6400 * 1024
            }
        );
    }

    #[test]
    fn test_drain_keeps_racing_increment() {
        let counters = Counters::new();
        counters.record(10, 2);

        let report = counters.snapshot();
        // lands between the report being built and acknowledged
        counters.record(5, 1);
        counters.drain(report);

        assert_eq!(counters.snapshot(), CounterSnapshot { hits: 1, bytes: 5 });
    }
}
