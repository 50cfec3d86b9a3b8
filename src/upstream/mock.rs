use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::{sync::mpsc, time::sleep};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::models::{Fragment, GenerationRequest};
use crate::upstream::{ProviderError, UpstreamHandle, UpstreamProvider};

#[derive(Debug, Clone)]
pub enum MockStep {
    Fragment(String),
    Fail(ProviderError),
    /// Holds the stream open without yielding until the consumer goes away.
    Stall,
}

/// Shared counters that outlive the provider, for asserting on upstream usage.
#[derive(Debug, Clone, Default)]
pub struct MockCounters {
    opens: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl MockCounters {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    script: Option<Vec<MockStep>>,
    open_error: Option<ProviderError>,
    fragment_delay: Duration,
    fail_release: bool,
    counters: MockCounters,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            name: "mock-upstream".to_owned(),
            script: None,
            open_error: None,
            fragment_delay: Duration::from_millis(35),
            fail_release: false,
            counters: MockCounters::default(),
        }
    }
}

impl MockProvider {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Yields exactly these fragments, back to back, then completes.
    pub fn scripted<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            script: Some(
                fragments
                    .into_iter()
                    .map(|fragment| MockStep::Fragment(fragment.into()))
                    .collect(),
            ),
            fragment_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn failing_on_open(error: ProviderError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::default()
        }
    }

    pub fn then_fail(mut self, error: ProviderError) -> Self {
        self.script
            .get_or_insert_with(Vec::new)
            .push(MockStep::Fail(error));
        self
    }

    pub fn then_stall(mut self) -> Self {
        self.script.get_or_insert_with(Vec::new).push(MockStep::Stall);
        self
    }

    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    pub fn with_failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    pub fn counters(&self) -> MockCounters {
        self.counters.clone()
    }
}

#[async_trait]
impl UpstreamProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn open(&self, request: GenerationRequest) -> Result<UpstreamHandle, ProviderError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_error.clone() {
            return Err(error);
        }

        let steps = match &self.script {
            Some(steps) => steps.clone(),
            None => split_for_stream(&render_response(&request))
                .into_iter()
                .map(MockStep::Fragment)
                .collect(),
        };
        let delay = self.fragment_delay;
        let (tx, rx) = mpsc::channel(1);

        tokio::spawn(async move {
            for step in steps {
                match step {
                    MockStep::Fragment(text) => {
                        if tx.send(Ok(Fragment::from(text))).await.is_err() {
                            return;
                        }
                    }
                    MockStep::Fail(error) => {
                        let _ = tx.send(Err(error)).await;
                        return;
                    }
                    MockStep::Stall => {
                        tx.closed().await;
                        return;
                    }
                }

                if !delay.is_zero() {
                    sleep(delay).await;
                }
            }
        });

        let teardowns = self.counters.teardowns.clone();
        let fail_release = self.fail_release;
        let handle = UpstreamHandle::new(ReceiverStream::new(rx).boxed()).with_release_hook(
            Box::new(move || {
                teardowns.fetch_add(1, Ordering::SeqCst);
                if fail_release {
                    return Err(ProviderError::Fault("mock release failure".to_owned()));
                }
                Ok(())
            }),
        );

        debug!(upstream = %self.name, request_id = %request.request_id, "mock stream opened");
        Ok(handle)
    }
}

fn render_response(request: &GenerationRequest) -> String {
    format!("Mock response: {}", request.prompt.trim())
}

fn split_for_stream(text: &str) -> Vec<String> {
    let tokens: Vec<String> = text.split_whitespace().map(ToString::to_string).collect();
    let len = tokens.len();

    tokens
        .into_iter()
        .enumerate()
        .map(|(index, token)| {
            if index + 1 == len {
                token
            } else {
                format!("{token} ")
            }
        })
        .collect()
}
