//! Continuation controller.
//!
//! Drives one logical reply across as many upstream rounds as it takes:
//!
//! - **Requesting**: open a round with the current conversation
//! - **Streaming**: forward text deltas as they arrive
//! - **Continuing**: the upstream truncated (`length`), so record what it
//!   said, ask it to go on, and request again
//! - **Done**: any other finish reason ends the reply
//! - **Failed**: the round could not be opened; no retry
//!
//! Each round's connection is owned by that round and dropped when it ends.
//! Dropping the stream returned by [`relay`] drops whatever round is in
//! flight.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};

use super::interpret::{FinishReason, ReplyInterpreter, Signal};
use super::stream::decode_events;
use super::types::{Message, UpstreamRequest};
use super::upstream::{ByteStream, UpstreamTransport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::router::SelectedRoute;

/// The conversation sent upstream. Only the controller appends to it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Flatten to `role: content` lines, followed by the steering instruction.
    pub fn transcript(&self, steering_instruction: &str) -> String {
        let mut text = self
            .messages
            .iter()
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        text.push('\n');
        text.push_str(steering_instruction);
        text
    }

    /// Record a truncated assistant turn and the request to keep going.
    pub fn push_continuation(&mut self, accumulated: &str, continuation_prompt: &str) {
        self.messages.push(Message::new("assistant", accumulated));
        self.messages.push(Message::new("user", continuation_prompt));
    }
}

/// Knobs for one relayed reply.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    pub max_continuations: u32,
    pub steering_instruction: String,
    pub continuation_prompt: String,
    /// Longest wait for the upstream to answer a round, and then for each
    /// chunk of its body.
    pub read_timeout: Duration,
}

impl RelayPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_continuations: config.relay.max_continuations,
            steering_instruction: config.relay.steering_instruction.clone(),
            continuation_prompt: config.relay.continuation_prompt.clone(),
            read_timeout: Duration::from_secs(config.upstream.read_timeout_secs),
        }
    }
}

/// What the controller hands to the encoder.
#[derive(Debug)]
pub enum RelayEvent {
    Delta(String),
    /// The reply is complete.
    Finish(FinishReason),
    /// A round could not be opened. Nothing follows.
    Failed(Error),
    /// A round broke after it was opened. Nothing follows.
    Interrupted(Error),
}

enum RoundOutcome {
    Finished(FinishReason),
    /// Upstream closed the stream without a final event.
    EndOfStream,
    Interrupted(Error),
}

/// Relay one reply, transparently continuing truncated upstream turns.
///
/// The stream ends after the first `Finish`, `Failed` or `Interrupted`.
pub fn relay(
    transport: Arc<dyn UpstreamTransport>,
    route: SelectedRoute,
    model: String,
    mut conversation: Conversation,
    policy: RelayPolicy,
) -> impl Stream<Item = RelayEvent> + Send + 'static {
    async_stream::stream! {
        let mut continuations = 0u32;

        loop {
            let request = UpstreamRequest {
                text: conversation.transcript(&policy.steering_instruction),
                endpoint: route.family.clone(),
                model: model.clone(),
            };

            tracing::debug!(
                family = %route.family,
                round = continuations,
                messages = conversation.len(),
                "Opening upstream round"
            );

            let opened = tokio::time::timeout(policy.read_timeout, transport.open(&route, &request))
                .await
                .unwrap_or_else(|_| {
                    Err(Error::UpstreamTimeout {
                        after: policy.read_timeout,
                    })
                });
            let bytes = match opened {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, round = continuations, "Upstream round failed to open");
                    yield RelayEvent::Failed(e);
                    return;
                }
            };

            let events = decode_events(with_read_timeout(bytes, policy.read_timeout));
            futures::pin_mut!(events);
            let mut interpreter = ReplyInterpreter::new();

            let outcome = loop {
                let event = match events.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => break RoundOutcome::Interrupted(e),
                    None => break RoundOutcome::EndOfStream,
                };

                let mut terminal = None;
                for signal in interpreter.interpret(&event) {
                    match signal {
                        Signal::TextDelta(text) => {
                            yield RelayEvent::Delta(text);
                        }
                        Signal::Terminal(reason) => terminal = Some(reason),
                    }
                }
                if let Some(reason) = terminal {
                    break RoundOutcome::Finished(reason);
                }
            };

            match outcome {
                RoundOutcome::Finished(FinishReason::Length) => {
                    if continuations >= policy.max_continuations {
                        tracing::warn!(
                            continuations,
                            "Continuation limit reached, passing truncation through"
                        );
                        yield RelayEvent::Finish(FinishReason::Length);
                        return;
                    }
                    continuations += 1;
                    conversation.push_continuation(
                        interpreter.accumulated(),
                        &policy.continuation_prompt,
                    );
                    tracing::info!(
                        round = continuations,
                        accumulated_len = interpreter.accumulated().len(),
                        "Upstream truncated reply, continuing"
                    );
                }
                RoundOutcome::Finished(reason) => {
                    tracing::debug!(finish_reason = %reason.as_str(), round = continuations, "Reply complete");
                    yield RelayEvent::Finish(reason);
                    return;
                }
                RoundOutcome::EndOfStream => {
                    tracing::warn!(round = continuations, "Upstream closed without a final event");
                    yield RelayEvent::Finish(FinishReason::Stop);
                    return;
                }
                RoundOutcome::Interrupted(e) => {
                    tracing::error!(error = %e, round = continuations, "Upstream stream interrupted");
                    yield RelayEvent::Interrupted(e);
                    return;
                }
            }
        }
    }
}

/// Fail the body with `UpstreamTimeout` when no bytes arrive within `limit`.
///
/// Measured per chunk, so comment-only keep-alive frames keep a round alive.
fn with_read_timeout(
    mut bytes: ByteStream,
    limit: Duration,
) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    async_stream::stream! {
        loop {
            match tokio::time::timeout(limit, bytes.next()).await {
                Ok(Some(chunk)) => yield chunk,
                Ok(None) => return,
                Err(_) => {
                    yield Err(Error::UpstreamTimeout { after: limit });
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::upstream::HttpTransport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const STEER: &str = "Reply to the latest turn.";
    const CONTINUE: &str = "Keep going.";

    /// One scripted upstream round.
    enum Round {
        Body(Vec<&'static str>),
        Status(u16),
        /// Body chunks followed by a transport error.
        Broken(Vec<&'static str>),
        /// Never sends anything.
        Stall,
        /// Each chunk is sent after its delay in milliseconds.
        Paced(Vec<(u64, &'static str)>),
        /// Never answers the request itself.
        Unanswered,
    }

    #[derive(Default)]
    struct ScriptedTransport {
        rounds: Mutex<VecDeque<Round>>,
        requests: Mutex<Vec<UpstreamRequest>>,
    }

    impl ScriptedTransport {
        fn new(rounds: Vec<Round>) -> Arc<Self> {
            Arc::new(Self {
                rounds: Mutex::new(rounds.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<UpstreamRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpstreamTransport for ScriptedTransport {
        async fn open(&self, _route: &SelectedRoute, request: &UpstreamRequest) -> Result<ByteStream> {
            self.requests.lock().unwrap().push(request.clone());
            let round = self
                .rounds
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected upstream round");

            let chunks = |body: Vec<&'static str>| body.into_iter().map(|c| Ok::<_, Error>(Bytes::from(c)));
            match round {
                Round::Body(body) => Ok(futures::stream::iter(chunks(body)).boxed()),
                Round::Status(status) => Err(Error::UpstreamStatus { status }),
                Round::Broken(body) => Ok(futures::stream::iter(chunks(body))
                    .chain(futures::stream::once(async {
                        Err(Error::Internal("connection reset".to_string()))
                    }))
                    .boxed()),
                Round::Stall => Ok(futures::stream::pending().boxed()),
                Round::Paced(body) => Ok(futures::stream::iter(body)
                    .then(|(delay_ms, chunk)| async move {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                        Ok::<_, Error>(Bytes::from(chunk))
                    })
                    .boxed()),
                Round::Unanswered => futures::future::pending().await,
            }
        }
    }

    fn policy(max_continuations: u32) -> RelayPolicy {
        RelayPolicy {
            max_continuations,
            steering_instruction: STEER.to_string(),
            continuation_prompt: CONTINUE.to_string(),
            read_timeout: Duration::from_secs(5),
        }
    }

    fn route() -> SelectedRoute {
        SelectedRoute {
            family: "openAI".to_string(),
            url: "http://upstream.test/api/ask/openAI".to_string(),
        }
    }

    async fn run(transport: Arc<ScriptedTransport>, policy: RelayPolicy) -> Vec<RelayEvent> {
        let conversation = Conversation::new(vec![Message::new("user", "hi")]);
        relay(transport, route(), "gpt-4o".to_string(), conversation, policy)
            .collect()
            .await
    }

    fn deltas(events: &[RelayEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Delta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transcript_format() {
        let conversation = Conversation::new(vec![
            Message::new("system", "be brief"),
            Message::new("user", "hi"),
        ]);
        assert_eq!(
            conversation.transcript(STEER),
            "system: be brief\nuser: hi\nReply to the latest turn."
        );
    }

    #[test]
    fn test_push_continuation_appends_two_messages() {
        let mut conversation = Conversation::new(vec![Message::new("user", "hi")]);
        conversation.push_continuation("partial", CONTINUE);

        assert_eq!(
            conversation.messages(),
            &[
                Message::new("user", "hi"),
                Message::new("assistant", "partial"),
                Message::new("user", CONTINUE),
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_ends_after_one_round() {
        let transport = ScriptedTransport::new(vec![Round::Body(vec![
            "data: {\"text\":\"Hello\"}\n\n",
            "data: {\"text\":\"Hello world\"}\n\n",
            "data: {\"final\":true,\"responseMessage\":{\"text\":\"Hello world\",\"finish_reason\":\"stop\"}}\n\n",
        ])]);

        let events = run(transport.clone(), policy(8)).await;

        assert_eq!(deltas(&events), vec!["Hello", " world"]);
        assert!(matches!(events.last(), Some(RelayEvent::Finish(FinishReason::Stop))));
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].text, "user: hi\nReply to the latest turn.");
        assert_eq!(requests[0].endpoint, "openAI");
        assert_eq!(requests[0].model, "gpt-4o");
    }

    #[tokio::test]
    async fn test_length_triggers_continuation_round() {
        let transport = ScriptedTransport::new(vec![
            Round::Body(vec![
                "data: {\"text\":\"Part one\"}\n\n",
                "data: {\"final\":true,\"responseMessage\":{\"text\":\"Part one\",\"finish_reason\":\"length\"}}\n\n",
            ]),
            Round::Body(vec![
                "data: {\"text\":\" and two\"}\n\n",
                "data: {\"final\":true,\"responseMessage\":{\"finish_reason\":\"stop\"}}\n\n",
            ]),
        ]);

        let events = run(transport.clone(), policy(8)).await;

        // The second round starts from empty accumulated text.
        assert_eq!(deltas(&events), vec!["Part one", " and two"]);
        assert!(matches!(events.last(), Some(RelayEvent::Finish(FinishReason::Stop))));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].text,
            "user: hi\nassistant: Part one\nuser: Keep going.\nReply to the latest turn."
        );
    }

    #[tokio::test]
    async fn test_connect_failure_yields_failed() {
        let transport = ScriptedTransport::new(vec![Round::Status(500)]);

        let events = run(transport.clone(), policy(8)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RelayEvent::Failed(Error::UpstreamStatus { status: 500 })
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_on_continuation_round() {
        let transport = ScriptedTransport::new(vec![
            Round::Body(vec![
                "data: {\"final\":true,\"responseMessage\":{\"text\":\"cut\",\"finish_reason\":\"length\"}}\n\n",
            ]),
            Round::Status(502),
        ]);

        let events = run(transport, policy(8)).await;

        assert_eq!(deltas(&events), vec!["cut"]);
        assert!(matches!(events.last(), Some(RelayEvent::Failed(_))));
    }

    #[tokio::test]
    async fn test_continuation_cap_passes_length_through() {
        let truncated = "data: {\"final\":true,\"responseMessage\":{\"text\":\"more\",\"finish_reason\":\"length\"}}\n\n";
        let transport = ScriptedTransport::new(vec![
            Round::Body(vec![truncated]),
            Round::Body(vec![truncated]),
        ]);

        let events = run(transport.clone(), policy(1)).await;

        assert_eq!(deltas(&events), vec!["more", "more"]);
        assert!(matches!(events.last(), Some(RelayEvent::Finish(FinishReason::Length))));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_end_of_stream_without_final_is_stop() {
        let transport = ScriptedTransport::new(vec![Round::Body(vec!["data: {\"text\":\"abrupt\"}"])]);

        let events = run(transport, policy(8)).await;

        assert_eq!(deltas(&events), vec!["abrupt"]);
        assert!(matches!(events.last(), Some(RelayEvent::Finish(FinishReason::Stop))));
    }

    #[tokio::test]
    async fn test_other_reason_surfaces_directly() {
        let transport = ScriptedTransport::new(vec![Round::Body(vec![
            "data: {\"final\":true,\"responseMessage\":{\"text\":\"\",\"finish_reason\":\"content_filter\"}}\n\n",
        ])]);

        let events = run(transport.clone(), policy(8)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            RelayEvent::Finish(FinishReason::Other(reason)) if reason == "content_filter"
        ));
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_broken_stream_is_interrupted() {
        let transport = ScriptedTransport::new(vec![Round::Broken(vec!["data: {\"text\":\"half\"}\n\n"])]);

        let events = run(transport, policy(8)).await;

        assert_eq!(deltas(&events), vec!["half"]);
        assert!(matches!(events.last(), Some(RelayEvent::Interrupted(_))));
    }

    #[tokio::test]
    async fn test_stalled_round_times_out() {
        let transport = ScriptedTransport::new(vec![Round::Stall]);
        let mut policy = policy(8);
        policy.read_timeout = Duration::from_millis(20);

        let events = run(transport, policy).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RelayEvent::Interrupted(Error::UpstreamTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_keep_alive_comments_hold_round_open() {
        let transport = ScriptedTransport::new(vec![Round::Paced(vec![
            (40, ": keep-alive\n\n"),
            (40, ": keep-alive\n\n"),
            (40, ": keep-alive\n\n"),
            (40, ": keep-alive\n\n"),
            (40, "data: {\"text\":\"thought it over\"}\n\n"),
            (40, "data: {\"final\":true,\"responseMessage\":{\"finish_reason\":\"stop\"}}\n\n"),
        ])]);
        let mut policy = policy(8);
        policy.read_timeout = Duration::from_millis(100);

        let events = run(transport, policy).await;

        assert_eq!(deltas(&events), vec!["thought it over"]);
        assert!(matches!(events.last(), Some(RelayEvent::Finish(FinishReason::Stop))));
    }

    #[tokio::test]
    async fn test_gap_between_chunks_times_out_with_exact_duration() {
        let transport = ScriptedTransport::new(vec![Round::Paced(vec![
            (0, "data: {\"text\":\"early\"}\n\n"),
            (500, "data: {\"text\":\"early and late\"}\n\n"),
        ])]);
        let mut policy = policy(8);
        policy.read_timeout = Duration::from_millis(50);

        let events = run(transport, policy).await;

        assert_eq!(deltas(&events), vec!["early"]);
        match events.last() {
            Some(RelayEvent::Interrupted(e)) => {
                assert_eq!(e.to_string(), "Upstream stalled for more than 50ms");
            }
            other => panic!("expected Interrupted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unanswered_request_fails_round() {
        let transport = ScriptedTransport::new(vec![Round::Unanswered]);
        let mut policy = policy(8);
        policy.read_timeout = Duration::from_millis(20);

        let events = run(transport, policy).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RelayEvent::Failed(Error::UpstreamTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_response_headers_fail_round_over_http() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: {\"text\":\"too late\"}\n\n")
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let transport = Arc::new(HttpTransport::new(reqwest::Client::new(), "http://origin.test"));
        let route = SelectedRoute {
            family: "openAI".to_string(),
            url: format!("{}/api/ask/openAI", server.uri()),
        };
        let mut policy = policy(8);
        policy.read_timeout = Duration::from_millis(200);

        let events = tokio::time::timeout(
            Duration::from_secs(3),
            relay(
                transport,
                route,
                "gpt-4o".to_string(),
                Conversation::new(vec![Message::new("user", "hi")]),
                policy,
            )
            .collect::<Vec<_>>(),
        )
        .await
        .expect("relay should give up before the upstream answers");

        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            RelayEvent::Failed(Error::UpstreamTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_rounds() {
        let transport = ScriptedTransport::new(vec![
            Round::Body(vec![
                "data: {\"text\":\"first\"}\n\n",
                "data: {\"final\":true,\"responseMessage\":{\"finish_reason\":\"length\"}}\n\n",
            ]),
            Round::Body(vec![]),
        ]);
        let conversation = Conversation::new(vec![Message::new("user", "hi")]);

        let mut stream = Box::pin(relay(
            transport.clone(),
            route(),
            "gpt-4o".to_string(),
            conversation,
            policy(8),
        ));
        assert!(matches!(stream.next().await, Some(RelayEvent::Delta(_))));
        drop(stream);

        assert_eq!(transport.requests().len(), 1);
    }
}
