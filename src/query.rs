//! Fetch state for network work driven by a consumer loop.
//!
//! A `RemoteQuery<T>` wraps an async fetcher with Idle/Loading/Success/Error
//! state. Errors are kept for the consumer to present; nothing is retried
//! automatically, the consumer calls `refetch` (pull-to-refresh).
//!
//! ```ignore
//! let sync = sync_layer.clone();
//! let mut query = RemoteQuery::new(move || {
//!     let sync = sync.clone();
//!     async move { sync.refresh::<Scene>(&Resource::new("/api/scenes")).await }
//! });
//!
//! query.fetch();
//!
//! // In the loop tick
//! if query.poll() {
//!     match query.state() {
//!         QueryState::Success(result) => render(result),
//!         QueryState::Error(e) if e.is_auth() => prompt_login(),
//!         QueryState::Error(e) => alert(e),
//!         _ => {}
//!     }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ApiError, ApiResult};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed; the error is passed through unmodified
  Error(Arc<ApiError>),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error(e) => Some(e.as_ref()),
      _ => None,
    }
  }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = ApiResult<T>> + Send>>;

type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Async fetch with state management.
pub struct RemoteQuery<T> {
  state: QueryState<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<ApiResult<T>>>,
  task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> RemoteQuery<T> {
  /// The fetcher is called each time `fetch()` or `refetch()` starts work.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<T>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      task: None,
    }
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error()
  }

  /// True when the last failure means the user must sign in again.
  pub fn needs_login(&self) -> bool {
    self.error().map(ApiError::is_auth).unwrap_or(false)
  }

  /// Start fetching unless already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch; a pending fetch is cancelled and its result discarded.
  pub fn refetch(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch.
  ///
  /// Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(Arc::new(error));
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // The fetch task died without reporting
        self.state = QueryState::Error(Arc::new(ApiError::Disconnected));
        self.receiver = None;
        true
      }
    }
  }

  /// Wait for the pending fetch, if any, and return whether state changed.
  pub async fn settle(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    let result = receiver.recv().await;
    self.receiver = None;
    match result {
      Some(Ok(data)) => self.state = QueryState::Success(data),
      Some(Err(error)) => self.state = QueryState::Error(Arc::new(error)),
      None => self.state = QueryState::Error(Arc::new(ApiError::Disconnected)),
    }
    true
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let future = (self.fetcher)();
    self.task = Some(tokio::spawn(async move {
      let result = future.await;
      // Receiver may have been dropped by a refetch
      let _ = tx.send(result);
    }));
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RemoteQuery<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteQuery")
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  #[tokio::test]
  async fn test_query_success() {
    let mut query = RemoteQuery::new(|| async { Ok(vec![1, 2, 3]) });
    assert!(matches!(query.state(), QueryState::Idle));

    query.fetch();
    assert!(query.is_loading());

    assert!(query.settle().await);
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&vec![1, 2, 3]));
  }

  #[tokio::test]
  async fn test_auth_error_needs_login() {
    let mut query: RemoteQuery<i32> = RemoteQuery::new(|| async { Err(ApiError::Unauthorized) });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(query.poll());
    assert!(query.is_error());
    assert!(query.needs_login());
    assert!(!query.poll());
  }

  #[tokio::test]
  async fn test_other_errors_do_not_need_login() {
    let mut query: RemoteQuery<i32> = RemoteQuery::new(|| async {
      Err(ApiError::Unexpected {
        status: 500,
        body: String::new(),
      })
    });
    query.fetch();
    query.settle().await;
    assert!(query.is_error());
    assert!(!query.needs_login());
  }

  #[tokio::test]
  async fn test_fetch_while_loading_is_noop() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut query = RemoteQuery::new(move || {
      let counter = counter.clone();
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(42)
      }
    });

    query.fetch();
    query.fetch();
    query.settle().await;
    assert_eq!(query.data(), Some(&42));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_refetch_discards_pending() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_clone = counter.clone();

    let mut query = RemoteQuery::new(move || {
      let counter = counter_clone.clone();
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(n)
      }
    });

    query.fetch();
    // Let the first fetch start before it is replaced
    tokio::task::yield_now().await;
    query.refetch();
    query.settle().await;
    assert_eq!(query.data(), Some(&1));
  }

  #[tokio::test]
  async fn test_refetch_cancels_pending_fetch() {
    let finished = Arc::new(AtomicU32::new(0));
    let counter = finished.clone();
    let mut query = RemoteQuery::new(move || {
      let counter = counter.clone();
      async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
      }
    });

    query.fetch();
    tokio::task::yield_now().await;
    query.refetch();
    query.settle().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(finished.load(Ordering::SeqCst), 1);
  }
}
