//! Relay sessions: one upstream stream forwarded to one downstream sink.
//!
//! A session is driven by its forwarding loop, while a separate observer task
//! watches the downstream sink for the client going away. The two agree on
//! how the session ended through a single compare-and-set on the session
//! status; whoever reaches a terminal status first wins and the other backs
//! off. Only the forwarding loop owns the upstream handle, so it is the one
//! that releases it, exactly once, after the status has settled.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    errors::AppError,
    models::{Fragment, GenerationRequest},
    upstream::{UpstreamHandle, UpstreamProvider},
};

/// Fragments buffered between the forwarding loop and the response body.
/// Kept at one so a slow client stalls upstream reads.
pub const SINK_CAPACITY: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Idle = 0,
    Streaming = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Streaming,
            2 => Self::Completed,
            3 => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct StatusCell(AtomicU8);

impl StatusCell {
    fn new() -> Self {
        Self(AtomicU8::new(SessionStatus::Idle as u8))
    }

    fn load(&self) -> SessionStatus {
        SessionStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn begin_streaming(&self) -> bool {
        self.0
            .compare_exchange(
                SessionStatus::Idle as u8,
                SessionStatus::Streaming as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Returns false when the session had already reached a terminal status.
    fn finish(&self, terminal: SessionStatus) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if SessionStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange(
                current,
                terminal as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Lets a party other than the forwarding loop end the session.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    session_id: Uuid,
    status: Arc<StatusCell>,
    token: CancellationToken,
}

impl CancelHandle {
    /// Returns true if this call moved the session to `Cancelled`.
    pub fn cancel(&self) -> bool {
        if !self.status.finish(SessionStatus::Cancelled) {
            return false;
        }
        self.token.cancel();
        debug!(session_id = %self.session_id, "relay session cancelled");
        true
    }

    pub fn status(&self) -> SessionStatus {
        self.status.load()
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub failure: Option<AppError>,
    pub fragments_forwarded: usize,
}

/// Receiving end of a spawned session.
pub struct SessionStream {
    pub session_id: Uuid,
    pub fragments: mpsc::Receiver<Fragment>,
    pub outcome: JoinHandle<SessionOutcome>,
    pub cancel: CancelHandle,
}

pub struct RelaySession {
    id: Uuid,
    request_id: String,
    upstream_name: String,
    upstream: UpstreamHandle,
    status: Arc<StatusCell>,
    token: CancellationToken,
    idle_timeout: Duration,
}

enum Ending {
    Completed,
    Cancelled,
    Failed(AppError),
}

impl RelaySession {
    /// Opens the upstream stream for `request`. Opening is bounded by the
    /// idle window; on failure the session ends `Failed` without ever
    /// holding an upstream handle.
    pub async fn open(
        provider: &dyn UpstreamProvider,
        request: GenerationRequest,
        idle_timeout: Duration,
    ) -> Result<Self, AppError> {
        let id = Uuid::new_v4();
        let status = Arc::new(StatusCell::new());
        let request_id = request.request_id.clone();

        let opened = match timeout(idle_timeout, provider.open(request)).await {
            Ok(result) => result.map_err(AppError::from),
            Err(_) => Err(AppError::Timeout(format!(
                "upstream did not open a stream within {idle_timeout:?}"
            ))),
        };

        match opened {
            Ok(upstream) => {
                status.begin_streaming();
                info!(
                    session_id = %id,
                    request_id = %request_id,
                    upstream = provider.name(),
                    "relay session opened"
                );
                Ok(Self {
                    id,
                    request_id,
                    upstream_name: provider.name().to_owned(),
                    upstream,
                    status,
                    token: CancellationToken::new(),
                    idle_timeout,
                })
            }
            Err(error) => {
                status.finish(SessionStatus::Failed);
                warn!(
                    session_id = %id,
                    request_id = %request_id,
                    upstream = provider.name(),
                    error = ?error,
                    "upstream open failed"
                );
                Err(error)
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status.load()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            session_id: self.id,
            status: self.status.clone(),
            token: self.token.clone(),
        }
    }

    /// Runs the session on its own task, forwarding into a bounded channel.
    pub fn spawn(self) -> SessionStream {
        let (sink, fragments) = mpsc::channel(SINK_CAPACITY);
        let session_id = self.id;
        let cancel = self.cancel_handle();
        let outcome = tokio::spawn(self.run(sink));
        SessionStream {
            session_id,
            fragments,
            outcome,
            cancel,
        }
    }

    /// Forwards fragments into `sink` until upstream completes, fails, or
    /// the downstream side goes away. The upstream handle is released before
    /// this returns.
    pub async fn run(mut self, sink: mpsc::Sender<Fragment>) -> SessionOutcome {
        let observer = tokio::spawn(observe_downstream(sink.clone(), self.cancel_handle()));

        let mut forwarded = 0usize;
        let ending = self.forward(&sink, &mut forwarded).await;
        let (proposed, failure) = match ending {
            Ending::Completed => (SessionStatus::Completed, None),
            Ending::Cancelled => (SessionStatus::Cancelled, None),
            Ending::Failed(error) => (SessionStatus::Failed, Some(error)),
        };
        // Losing the race means the observer already settled on Cancelled.
        let status = if self.status.finish(proposed) {
            proposed
        } else {
            self.status.load()
        };
        let failure = failure.filter(|_| status == SessionStatus::Failed);

        if let Err(error) = self.upstream.release() {
            warn!(
                session_id = %self.id,
                upstream = %self.upstream_name,
                error = %error,
                "upstream release failed"
            );
        }

        observer.abort();
        let _ = observer.await;
        drop(sink);

        match &failure {
            Some(error) => warn!(
                session_id = %self.id,
                request_id = %self.request_id,
                status = status.as_str(),
                fragments = forwarded,
                error = ?error,
                "relay session finished"
            ),
            None => info!(
                session_id = %self.id,
                request_id = %self.request_id,
                status = status.as_str(),
                fragments = forwarded,
                "relay session finished"
            ),
        }

        SessionOutcome {
            session_id: self.id,
            status,
            failure,
            fragments_forwarded: forwarded,
        }
    }

    async fn forward(&mut self, sink: &mpsc::Sender<Fragment>, forwarded: &mut usize) -> Ending {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ending::Cancelled,
                next = timeout(self.idle_timeout, self.upstream.next_fragment()) => next,
            };

            let fragment = match next {
                Err(_) => {
                    return Ending::Failed(AppError::Timeout(format!(
                        "no upstream activity within {:?}",
                        self.idle_timeout
                    )))
                }
                Ok(None) => return Ending::Completed,
                Ok(Some(Err(error))) => return Ending::Failed(error.into()),
                Ok(Some(Ok(fragment))) => fragment,
            };

            if fragment.is_empty() {
                continue;
            }

            let sent = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ending::Cancelled,
                sent = sink.send(fragment) => sent,
            };
            if sent.is_err() {
                // Receiver dropped: the client is gone.
                return Ending::Cancelled;
            }
            *forwarded += 1;
        }
    }
}

async fn observe_downstream(sink: mpsc::Sender<Fragment>, cancel: CancelHandle) {
    sink.closed().await;
    if cancel.cancel() {
        debug!(session_id = %cancel.session_id, "downstream closed before upstream finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::PromptPayload,
        upstream::{mock::MockProvider, ProviderError},
    };

    const IDLE: Duration = Duration::from_secs(5);

    fn request(prompt: &str) -> GenerationRequest {
        PromptPayload {
            prompt: Some(prompt.to_owned()),
            ..PromptPayload::default()
        }
        .into_generation_request()
        .expect("valid request")
    }

    async fn drain(fragments: &mut mpsc::Receiver<Fragment>) -> String {
        let mut text = String::new();
        while let Some(fragment) = fragments.recv().await {
            text.push_str(fragment.as_str());
        }
        text
    }

    #[test]
    fn status_cell_lets_exactly_one_party_finish() {
        let cell = StatusCell::new();
        assert!(cell.begin_streaming());
        assert!(cell.finish(SessionStatus::Cancelled));
        assert!(!cell.finish(SessionStatus::Completed));
        assert!(!cell.begin_streaming());
        assert_eq!(cell.load(), SessionStatus::Cancelled);
    }

    #[tokio::test]
    async fn forwards_every_fragment_in_order() {
        let provider = MockProvider::scripted(["one", " two", " three"]);
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("count to three"), IDLE)
            .await
            .expect("open");
        assert_eq!(session.status(), SessionStatus::Streaming);

        let mut stream = session.spawn();
        let text = drain(&mut stream.fragments).await;
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(text, "one two three");
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.fragments_forwarded, 3);
        assert!(outcome.failure.is_none());
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn empty_fragments_are_skipped_and_multibyte_text_is_intact() {
        let provider = MockProvider::scripted(["", "héllo", "", " wörld ✓", ""]);
        let session = RelaySession::open(&provider, request("greet"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        let mut received = Vec::new();
        while let Some(fragment) = stream.fragments.recv().await {
            received.push(fragment.into_string());
        }
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(received, vec!["héllo".to_owned(), " wörld ✓".to_owned()]);
        assert_eq!(received.concat(), "héllo wörld ✓");
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.fragments_forwarded, 2);
    }

    #[tokio::test]
    async fn client_going_away_cancels_and_tears_down_once() {
        let provider = MockProvider::scripted(["one", " two", " three"])
            .with_fragment_delay(Duration::from_millis(50));
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("count to three"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        let first = stream.fragments.recv().await.expect("first fragment");
        assert_eq!(first.as_str(), "one");
        drop(stream.fragments);

        let outcome = stream.outcome.await.expect("session task");
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.fragments_forwarded, 1);
        assert!(outcome.failure.is_none());
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn explicit_cancel_stops_a_stalled_stream() {
        let provider = MockProvider::scripted(["one"]).then_stall();
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        assert_eq!(
            stream.fragments.recv().await.map(Fragment::into_string),
            Some("one".to_owned())
        );
        assert!(stream.cancel.cancel());
        assert!(!stream.cancel.cancel());

        assert!(stream.fragments.recv().await.is_none());
        let outcome = stream.outcome.await.expect("session task");
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn slow_reader_holds_back_upstream() {
        let provider = MockProvider::scripted(["a", "b", "c", "d", "e"]);
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let stream = session.spawn();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.cancel.cancel();

        let outcome = stream.outcome.await.expect("session task");
        assert_eq!(outcome.status, SessionStatus::Cancelled);
        assert_eq!(outcome.fragments_forwarded, SINK_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upstream_fails_with_timeout() {
        let provider = MockProvider::scripted(["one"]).then_stall();
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        let text = drain(&mut stream.fragments).await;
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(text, "one");
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert!(matches!(outcome.failure, Some(AppError::Timeout(_))));
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn mid_stream_error_fails_the_session() {
        let provider = MockProvider::scripted(["one"])
            .then_fail(ProviderError::Fault("connection reset".to_owned()));
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        let text = drain(&mut stream.fragments).await;
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(text, "one");
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(
            outcome.failure,
            Some(AppError::UpstreamFault("connection reset".to_owned()))
        );
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn open_failure_never_holds_a_handle() {
        let provider =
            MockProvider::failing_on_open(ProviderError::QuotaExceeded("429".to_owned()));
        let counters = provider.counters();

        let error = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .err()
            .expect("open should fail");

        assert_eq!(error, AppError::QuotaExceeded("429".to_owned()));
        assert_eq!(counters.opens(), 1);
        assert_eq!(counters.teardowns(), 0);
    }

    #[tokio::test]
    async fn release_failure_does_not_mask_completion() {
        let provider = MockProvider::scripted(["one"]).with_failing_release();
        let counters = provider.counters();
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        let text = drain(&mut stream.fragments).await;
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(text, "one");
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.failure.is_none());
        assert_eq!(counters.teardowns(), 1);
    }

    #[tokio::test]
    async fn cancelling_a_finished_session_is_a_no_op() {
        let provider = MockProvider::scripted(["one"]);
        let session = RelaySession::open(&provider, request("x"), IDLE)
            .await
            .expect("open");

        let mut stream = session.spawn();
        drain(&mut stream.fragments).await;
        let outcome = stream.outcome.await.expect("session task");

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(!stream.cancel.cancel());
        assert_eq!(stream.cancel.status(), SessionStatus::Completed);
    }
}
