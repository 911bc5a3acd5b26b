use std::future::Future;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use super::MarketError;

type Load<T> = Shared<BoxFuture<'static, Result<T, MarketError>>>;

/// A value loaded at most once at a time
///
/// Concurrent callers share one in-flight load and all see its outcome,
/// including the same error. A failed load is forgotten once it has
/// completed, so the next call starts a fresh one.
pub(crate) struct Ready<T> {
    value: OnceCell<T>,
    pending: Mutex<Option<Load<T>>>,
}

impl<T> Default for Ready<T> {
    fn default() -> Self {
        Self {
            value: OnceCell::new(),
            pending: Mutex::new(None),
        }
    }
}

impl<T> Ready<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Wait for the value, starting `load` if no load is in flight
    pub async fn get_or_load<F, Fut>(&self, load: F) -> Result<(), MarketError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, MarketError>> + Send + 'static,
    {
        if self.value.initialized() {
            return Ok(());
        }

        let fut = {
            let mut pending = self.pending.lock();
            // the value is only set under this lock
            if self.value.initialized() {
                return Ok(());
            }
            match pending.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let fut = load().boxed().shared();
                    *pending = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.clone().await;

        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|p| p.ptr_eq(&fut)) {
            if let Ok(value) = &result {
                let _ = self.value.set(value.clone());
            }
            *pending = None;
        }
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_failed_load_is_shared_then_retried() {
        let ready: Arc<Ready<u32>> = Arc::new(Ready::default());
        let loads = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ready = ready.clone();
                let loads = loads.clone();
                tokio::spawn(async move {
                    ready
                        .get_or_load(|| async move {
                            let n = loads.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Err(MarketError::Storage(format!("attempt {}", n)))
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, MarketError::Storage(ref msg) if msg == "attempt 0"));
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(ready.get().is_none());

        ready.get_or_load(|| async { Ok(7) }).await.unwrap();
        assert_eq!(ready.get(), Some(&7));
        // settled values are never reloaded
        ready
            .get_or_load(|| async { Err(MarketError::Storage("unused".into())) })
            .await
            .unwrap();
        assert_eq!(ready.get(), Some(&7));
    }
}
