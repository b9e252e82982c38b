//! Live worker status: current job, current datum, queue depth.
//!
//! Every registration is scoped: the field is set for the duration of the
//! wrapped future and cleared on all exit paths via a drop guard.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct StatusInner {
    job_id: Option<String>,
    datum_id: Option<String>,
    datum_cancel: Option<CancellationToken>,
    queue_size: Option<Arc<AtomicI64>>,
}

/// Point-in-time view of the worker for operators and the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Job currently being handled, if any.
    pub job_id: Option<String>,
    /// Datum currently executing user code, if any.
    pub datum_id: Option<String>,
    /// Datums currently in flight in the subtask fan-out.
    pub queue_size: i64,
}

/// Shared status surface, safe for concurrent registration and reads.
#[derive(Default)]
pub struct Status {
    inner: Mutex<StatusInner>,
}

impl Status {
    /// Create an idle status.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `fut` with `job_id` registered as the current job.
    pub async fn with_job<F: Future>(&self, job_id: &str, fut: F) -> F::Output {
        self.lock().job_id = Some(job_id.to_string());
        let _guard = ClearGuard {
            status: self,
            field: Field::Job,
        };
        fut.await
    }

    /// Run `fut` with the subtask's queue gauge registered.
    pub async fn with_stats<F: Future>(&self, queue_size: Arc<AtomicI64>, fut: F) -> F::Output {
        self.lock().queue_size = Some(queue_size);
        let _guard = ClearGuard {
            status: self,
            field: Field::Stats,
        };
        fut.await
    }

    /// Run `fut` with `datum_id` registered as the active datum; `cancel`
    /// kills the datum's user code when fired through [`Status::cancel_datum`].
    pub async fn with_datum<F: Future>(
        &self,
        datum_id: &str,
        cancel: CancellationToken,
        fut: F,
    ) -> F::Output {
        {
            let mut inner = self.lock();
            inner.datum_id = Some(datum_id.to_string());
            inner.datum_cancel = Some(cancel);
        }
        let _guard = ClearGuard {
            status: self,
            field: Field::Datum,
        };
        fut.await
    }

    /// Snapshot the current state.
    pub fn get(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            job_id: inner.job_id.clone(),
            datum_id: inner.datum_id.clone(),
            queue_size: inner
                .queue_size
                .as_ref()
                .map(|q| q.load(Ordering::SeqCst))
                .unwrap_or(0),
        }
    }

    /// Cancel the active datum if it matches; returns whether it did.
    pub fn cancel_datum(&self, job_id: &str, datum_id: &str) -> bool {
        let inner = self.lock();
        match (&inner.job_id, &inner.datum_id, &inner.datum_cancel) {
            (Some(job), Some(datum), Some(cancel)) if job == job_id && datum == datum_id => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }
}

enum Field {
    Job,
    Datum,
    Stats,
}

struct ClearGuard<'a> {
    status: &'a Status,
    field: Field,
}

impl Drop for ClearGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.status.lock();
        match self.field {
            Field::Job => inner.job_id = None,
            Field::Datum => {
                inner.datum_id = None;
                inner.datum_cancel = None;
            }
            Field::Stats => inner.queue_size = None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn job_scope_sets_and_clears() {
        let status = Status::new();
        assert_eq!(status.get().job_id, None);

        status
            .with_job("j1", async {
                assert_eq!(status.get().job_id.as_deref(), Some("j1"));
            })
            .await;
        assert_eq!(status.get().job_id, None);
    }

    #[tokio::test]
    async fn queue_gauge_reads_through_snapshot() {
        let status = Status::new();
        let gauge = Arc::new(AtomicI64::new(0));
        status
            .with_stats(gauge.clone(), async {
                gauge.fetch_add(3, Ordering::SeqCst);
                assert_eq!(status.get().queue_size, 3);
            })
            .await;
        assert_eq!(status.get().queue_size, 0);
    }

    #[tokio::test]
    async fn cancel_datum_fires_only_on_match() {
        let status = Status::new();
        let token = CancellationToken::new();
        status
            .with_job("j1", async {
                status
                    .with_datum("d1", token.clone(), async {
                        assert!(!status.cancel_datum("j1", "other"));
                        assert!(!status.cancel_datum("other", "d1"));
                        assert!(status.cancel_datum("j1", "d1"));
                    })
                    .await;
            })
            .await;
        assert!(token.is_cancelled());
        assert!(!status.cancel_datum("j1", "d1"));
    }
}
