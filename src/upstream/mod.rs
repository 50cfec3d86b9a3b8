pub mod mock;
pub mod openai;

use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use thiserror::Error;
use tracing::warn;

use crate::models::{Fragment, GenerationRequest};

pub type FragmentStream = BoxStream<'static, Result<Fragment, ProviderError>>;

pub type ReleaseHook = Box<dyn FnOnce() -> Result<(), ProviderError> + Send>;

#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn open(&self, request: GenerationRequest) -> Result<UpstreamHandle, ProviderError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("provider fault: {0}")]
    Fault(String),
    #[error("provider timeout: {0}")]
    Timeout(String),
}

/// Exclusive ownership of one open generation stream.
///
/// Releasing drops the fragment stream (closing the underlying connection)
/// and then runs the optional release hook. A handle that is dropped without
/// an explicit release releases itself, so no exit path leaves the upstream
/// connection open.
pub struct UpstreamHandle {
    fragments: Option<FragmentStream>,
    on_release: Option<ReleaseHook>,
}

impl UpstreamHandle {
    pub fn new(fragments: FragmentStream) -> Self {
        Self {
            fragments: Some(fragments),
            on_release: None,
        }
    }

    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.on_release = Some(hook);
        self
    }

    /// `None` once upstream signalled completion or the handle was released.
    pub async fn next_fragment(&mut self) -> Option<Result<Fragment, ProviderError>> {
        match self.fragments.as_mut() {
            Some(fragments) => fragments.next().await,
            None => None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.fragments.is_none() && self.on_release.is_none()
    }

    /// Idempotent; only the first call runs the release hook.
    pub fn release(&mut self) -> Result<(), ProviderError> {
        self.fragments = None;
        match self.on_release.take() {
            Some(hook) => hook(),
            None => Ok(()),
        }
    }
}

impl Drop for UpstreamHandle {
    fn drop(&mut self) {
        if self.is_released() {
            return;
        }
        if let Err(error) = self.release() {
            warn!(error = %error, "upstream release failed during drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures_util::stream;

    use super::*;

    fn counting_handle(counter: Arc<AtomicUsize>) -> UpstreamHandle {
        let fragments = stream::iter(vec![Ok(Fragment::from("a")), Ok(Fragment::from("b"))]);
        UpstreamHandle::new(fragments.boxed()).with_release_hook(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[tokio::test]
    async fn release_runs_hook_once_and_ends_the_stream() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handle = counting_handle(counter.clone());

        let first = handle.next_fragment().await;
        assert_eq!(first, Some(Ok(Fragment::from("a"))));

        handle.release().expect("first release");
        handle.release().expect("second release is a no-op");
        assert!(handle.is_released());
        assert_eq!(handle.next_fragment().await, None);

        drop(handle);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_unreleased_handle_releases_it() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(counting_handle(counter.clone()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
