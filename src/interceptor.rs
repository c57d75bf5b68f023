//! Ordered request and response interceptor chains.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;

use crate::Result;
use crate::descriptor::RequestDescriptor;
use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

type ResolvedHandler<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type RejectedHandler<T> = Arc<dyn Fn(Error) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// A `resolved`/`rejected` handler pair.
///
/// Handlers may mutate and return the value they receive or build a new one;
/// nothing stops an interceptor from changing anything on the value.
pub struct Interceptor<T> {
    resolved: ResolvedHandler<T>,
    rejected: Option<RejectedHandler<T>>,
}

impl<T> Clone for Interceptor<T> {
    fn clone(&self) -> Self {
        Self {
            resolved: Arc::clone(&self.resolved),
            rejected: self.rejected.clone(),
        }
    }
}

impl<T> fmt::Debug for Interceptor<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Interceptor")
            .field("rejected", &self.rejected.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Interceptor<T> {
    pub fn new<F, Fut>(resolved: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            resolved: Arc::new(move |value| Box::pin(resolved(value))),
            rejected: None,
        }
    }

    /// Handles a failure raised by an earlier interceptor (or, for responses,
    /// by the request itself). Returning `Ok` recovers the chain.
    pub fn on_rejected<F, Fut>(mut self, rejected: F) -> Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.rejected = Some(Arc::new(move |error| Box::pin(rejected(error))));
        self
    }

    async fn apply(&self, current: Result<T>) -> Result<T> {
        match current {
            Ok(value) => (self.resolved)(value).await,
            Err(error) => match &self.rejected {
                Some(rejected) => rejected(error).await,
                None => Err(error),
            },
        }
    }
}

/// Identity token returned by [`InterceptorManager::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

/// One phase's interceptors, run in insertion order.
pub struct InterceptorManager<T> {
    entries: Mutex<Vec<(InterceptorId, Interceptor<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for InterceptorManager<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for InterceptorManager<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("InterceptorManager")
            .field("len", &self.len())
            .finish()
    }
}

impl<T: Send + 'static> InterceptorManager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, interceptor: Interceptor<T>) -> InterceptorId {
        let id = InterceptorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_unpoisoned(&self.entries).push((id, interceptor));
        id
    }

    /// Returns whether an interceptor was removed.
    pub fn delete(&self, id: InterceptorId) -> bool {
        let mut entries = lock_unpoisoned(&self.entries);
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<InterceptorId> {
        lock_unpoisoned(&self.entries)
            .iter()
            .map(|(id, _)| *id)
            .collect()
    }

    fn snapshot(&self) -> Vec<Interceptor<T>> {
        lock_unpoisoned(&self.entries)
            .iter()
            .map(|(_, interceptor)| interceptor.clone())
            .collect()
    }

    /// Folds `initial` through every interceptor registered when the call
    /// starts. A failure skips to the next entry's `rejected` handler.
    pub async fn run(&self, initial: Result<T>) -> Result<T> {
        let mut current = initial;
        for interceptor in self.snapshot() {
            current = interceptor.apply(current).await;
        }
        current
    }
}

/// Request-phase and response-phase chains of one client.
#[derive(Debug, Default)]
pub struct Interceptors {
    pub request: InterceptorManager<RequestDescriptor>,
    pub response: InterceptorManager<Response>,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[test]
    fn debug_output_reports_registered_count() {
        let interceptors = Interceptors::default();
        interceptors
            .request
            .add(Interceptor::new(|request: RequestDescriptor| async move { Ok(request) }));
        let rendered = format!("{interceptors:?}");
        assert!(rendered.contains("InterceptorManager { len: 1 }"));
        assert!(rendered.contains("InterceptorManager { len: 0 }"));
    }

    #[tokio::test]
    async fn handlers_run_in_insertion_order() {
        let manager = InterceptorManager::<Vec<u32>>::new();
        for step in 1..=3 {
            manager.add(Interceptor::new(move |mut value: Vec<u32>| async move {
                value.push(step);
                Ok(value)
            }));
        }
        let result = manager.run(Ok(Vec::new())).await.expect("chain succeeds");
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn later_rejected_handler_observes_earlier_failure() {
        let manager = InterceptorManager::<String>::new();
        manager.add(Interceptor::new(|_value: String| async {
            Err(Error::interceptor("first failed"))
        }));
        manager.add(
            Interceptor::new(|value: String| async move { Ok(format!("{value}!")) })
                .on_rejected(|error| async move { Ok(format!("recovered from {error}")) }),
        );
        let result = manager.run(Ok("start".to_owned())).await.expect("recovered");
        assert_eq!(result, "recovered from first failed");
    }

    #[tokio::test]
    async fn failure_without_rejected_handler_reaches_caller() {
        let manager = InterceptorManager::<u32>::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        manager.add(Interceptor::new(|_value: u32| async {
            Err(Error::interceptor("boom"))
        }));
        let recorder = Arc::clone(&seen);
        manager.add(Interceptor::new(move |value: u32| {
            recorder.lock().expect("lock").push(value);
            async move { Ok(value) }
        }));
        let error = manager.run(Ok(1)).await.expect_err("propagates");
        assert_eq!(error.to_string(), "boom");
        assert!(seen.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn delete_and_clear_apply_to_later_runs() {
        let manager = InterceptorManager::<u32>::new();
        let first = manager.add(Interceptor::new(|value: u32| async move { Ok(value + 1) }));
        let second = manager.add(Interceptor::new(|value: u32| async move { Ok(value * 10) }));
        assert_ne!(first, second);
        assert_eq!(manager.ids(), vec![first, second]);

        assert!(manager.delete(first));
        assert!(!manager.delete(first));
        assert_eq!(manager.run(Ok(2)).await.expect("runs"), 20);

        manager.clear();
        assert!(manager.is_empty());
        assert_eq!(manager.run(Ok(2)).await.expect("runs"), 2);
    }
}
