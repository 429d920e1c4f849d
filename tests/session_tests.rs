//! End-to-end turns against a scripted completion endpoint.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::{StreamExt, stream};

use eddie::{
    ChatCompletionChunk, ChatCompletionRequest, ChunkStream, CompletionEndpoint, Error,
    FinishReason, MEMORIZE_TOOL_NAME, MemoryStore, Message, MessageRole, SessionConfig,
    SessionEngine, ToolCallDelta, TurnHandler,
};

enum Script {
    Fragments(Vec<eddie::Result<ChatCompletionChunk>>),
    Fail(Error),
    InterruptAfter(Vec<eddie::Result<ChatCompletionChunk>>, usize, Arc<AtomicBool>),
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ChatCompletionRequest>>,
}

/// Answers each request with the next scripted stream and records requests.
#[derive(Clone, Default)]
struct ScriptedEndpoint {
    inner: Arc<Inner>,
}

impl ScriptedEndpoint {
    fn push(&self, script: Script) -> &Self {
        self.inner.scripts.lock().unwrap().push_back(script);
        self
    }

    fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.inner.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CompletionEndpoint for ScriptedEndpoint {
    async fn stream(&self, request: ChatCompletionRequest) -> eddie::Result<ChunkStream> {
        self.inner.requests.lock().unwrap().push(request);
        let script = self
            .inner
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .expect("no scripted response left");
        match script {
            Script::Fragments(items) => Ok(Box::pin(stream::iter(items))),
            Script::Fail(err) => Err(err),
            Script::InterruptAfter(items, after, flag) => Ok(Box::pin(
                stream::iter(items).enumerate().map(move |(idx, item)| {
                    if idx + 1 == after {
                        flag.store(true, Ordering::SeqCst);
                    }
                    item
                }),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Chunk(String),
    Memory(String),
}

#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
}

impl Recorder {
    fn text(&self) -> String {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Chunk(chunk) => Some(chunk.as_str()),
                Event::Memory(_) => None,
            })
            .collect()
    }

    fn memories(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Memory(memory) => Some(memory.clone()),
                Event::Chunk(_) => None,
            })
            .collect()
    }
}

impl TurnHandler for Recorder {
    fn on_chunk(&mut self, chunk: &str) {
        self.events.push(Event::Chunk(chunk.to_string()));
    }

    fn on_memory(&mut self, memory: &str) {
        self.events.push(Event::Memory(memory.to_string()));
    }
}

fn content(pieces: &[&str]) -> Script {
    let mut items: Vec<_> = pieces
        .iter()
        .map(|piece| Ok(ChatCompletionChunk::content(*piece)))
        .collect();
    items.push(Ok(ChatCompletionChunk::finish(FinishReason::Stop)));
    Script::Fragments(items)
}

fn memorize(call_id: &str, memory: &str) -> Script {
    let arguments = serde_json::json!({ "memory": memory }).to_string();
    let (head, tail) = arguments.split_at(arguments.len() / 2);
    Script::Fragments(vec![
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::start(
            0,
            call_id,
            MEMORIZE_TOOL_NAME,
        )])),
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::arguments(0, head)])),
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::arguments(0, tail)])),
        Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
    ])
}

struct Fixture {
    _dir: tempfile::TempDir,
    endpoint: ScriptedEndpoint,
    store: MemoryStore,
    session: SessionEngine<ScriptedEndpoint>,
}

fn fixture(config: SessionConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::open(dir.path().join("memories.json"));
    let endpoint = ScriptedEndpoint::default();
    let session = SessionEngine::new(endpoint.clone(), store.clone(), config).unwrap();
    Fixture {
        _dir: dir,
        endpoint,
        store,
        session,
    }
}

fn not_interrupted() -> AtomicBool {
    AtomicBool::new(false)
}

#[tokio::test]
async fn content_turn_streams_and_commits() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(content(&["Hel", "lo", " there."]));

    let mut recorder = Recorder::default();
    let reply = fx
        .session
        .chat("Hi Eddie", &mut recorder, &not_interrupted())
        .await
        .unwrap();

    assert_eq!(reply, "Hello there.");
    assert_eq!(recorder.text(), reply);
    assert_eq!(
        fx.session.history().messages(),
        &[Message::user("Hi Eddie"), Message::assistant("Hello there.")]
    );

    let requests = fx.endpoint.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.stream);
    assert_eq!(request.model, "gpt-4o");
    assert_eq!(request.messages[0].role, MessageRole::System);
    assert!(request.messages[0].text().contains(fx.session.first_message()));
    assert_eq!(request.messages[1], Message::user("Hi Eddie"));
    let tools = request.tools.as_ref().unwrap();
    assert_eq!(tools[0].function.name, MEMORIZE_TOOL_NAME);
}

#[tokio::test]
async fn tool_then_answer() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(memorize("call_1", "User likes golf"))
        .push(content(&["Splendid. ", "Fore!"]));

    let mut recorder = Recorder::default();
    let reply = fx
        .session
        .chat("I love golf", &mut recorder, &not_interrupted())
        .await
        .unwrap();

    assert_eq!(reply, "Splendid. Fore!");
    assert_eq!(
        recorder.events,
        vec![
            Event::Memory("User likes golf".to_string()),
            Event::Chunk("Splendid. ".to_string()),
            Event::Chunk("Fore!".to_string()),
        ]
    );
    assert_eq!(fx.store.load().unwrap(), vec!["User likes golf"]);
    assert_eq!(fx.session.memories(), &["User likes golf".to_string()]);

    let history = fx.session.history().messages();
    assert_eq!(history.len(), 4);
    assert_eq!(history[0], Message::user("I love golf"));
    assert!(history[1].has_tool_calls());
    assert_eq!(
        history[2],
        Message::tool("call_1", MEMORIZE_TOOL_NAME, "User likes golf")
    );
    assert_eq!(history[3], Message::assistant("Splendid. Fore!"));

    // The continuation carries the tool exchange but no new user message.
    let requests = fx.endpoint.requests();
    assert_eq!(requests.len(), 2);
    let follow_up = &requests[1].messages;
    assert_eq!(
        follow_up
            .iter()
            .filter(|message| message.role == MessageRole::User)
            .count(),
        1
    );
    assert_eq!(follow_up.last().unwrap().tool_call_id.as_deref(), Some("call_1"));
    assert!(follow_up[0].text().contains("- User likes golf"));

    let stats = fx.session.stats();
    assert_eq!(stats.total_turns, 1);
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.total_tool_calls, 1);
    assert_eq!(stats.memory_count, 1);
}

#[tokio::test]
async fn several_calls_in_one_message() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(Script::Fragments(vec![
            Ok(ChatCompletionChunk::tool_calls(vec![
                ToolCallDelta::start(0, "a", MEMORIZE_TOOL_NAME),
                ToolCallDelta::start(1, "b", MEMORIZE_TOOL_NAME),
            ])),
            Ok(ChatCompletionChunk::tool_calls(vec![
                ToolCallDelta::arguments(1, r#"{"memory": "User is tall"}"#),
                ToolCallDelta::arguments(0, r#"{"memory": "User is Arthur"}"#),
            ])),
            Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
        ]))
        .push(content(&["Noted."]));

    let mut recorder = Recorder::default();
    fx.session
        .chat("I'm Arthur and I'm tall", &mut recorder, &not_interrupted())
        .await
        .unwrap();

    assert_eq!(recorder.memories(), vec!["User is Arthur", "User is tall"]);
    assert_eq!(fx.store.load().unwrap(), vec!["User is Arthur", "User is tall"]);
    let history = fx.session.history().messages();
    let tool_ids: Vec<_> = history
        .iter()
        .filter_map(|message| message.tool_call_id.as_deref())
        .collect();
    assert_eq!(tool_ids, vec!["a", "b"]);
    assert_eq!(history[1].tool_calls.as_ref().unwrap().len(), 2);
}

#[tokio::test]
async fn tool_calls_with_empty_content_are_run() {
    // Ollama opens a tool call with an empty content string beside it.
    let opening: ChatCompletionChunk = serde_json::from_value(serde_json::json!({
        "choices": [{
            "index": 0,
            "delta": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "index": 0,
                    "id": "call_1",
                    "function": {
                        "name": "Memorize",
                        "arguments": "{\"memory\":\"User likes golf\"}"
                    }
                }]
            }
        }]
    }))
    .unwrap();
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(Script::Fragments(vec![
            Ok(opening),
            Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
        ]))
        .push(content(&["Golf it is."]));

    let mut recorder = Recorder::default();
    let reply = fx
        .session
        .chat("I like golf", &mut recorder, &not_interrupted())
        .await
        .unwrap();

    assert_eq!(reply, "Golf it is.");
    assert_eq!(recorder.memories(), vec!["User likes golf"]);
    assert_eq!(fx.store.load().unwrap(), vec!["User likes golf"]);
    assert_eq!(fx.endpoint.requests().len(), 2);
    let history = fx.session.history().messages();
    assert_eq!(history.len(), 4);
    assert!(history[1].has_tool_calls());
    assert_eq!(history[1].content, None);
}

#[tokio::test]
async fn text_beside_tool_calls_is_kept_on_the_request() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(Script::Fragments(vec![
            Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::start(
                0,
                "call_1",
                MEMORIZE_TOOL_NAME,
            )])),
            Ok(ChatCompletionChunk::content("Noting that.")),
            Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::arguments(
                0,
                r#"{"memory": "User is Arthur"}"#,
            )])),
            Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
        ]))
        .push(content(&["Hello Arthur."]));

    fx.session
        .chat_with("I'm Arthur", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap();

    let history = fx.session.history().messages();
    assert!(history[1].has_tool_calls());
    assert_eq!(history[1].content.as_deref(), Some("Noting that."));
    let follow_up = &fx.endpoint.requests()[1].messages;
    assert!(
        follow_up
            .iter()
            .any(|message| message.has_tool_calls()
                && message.content.as_deref() == Some("Noting that."))
    );
}

#[tokio::test]
async fn unknown_tool_is_reported_and_the_turn_continues() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(Script::Fragments(vec![
            Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::start(
                0, "call_9", "Teleport",
            )])),
            Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
        ]))
        .push(content(&["I can't do that."]));

    let reply = fx
        .session
        .chat_with("Beam me up", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap();
    assert_eq!(reply, "I can't do that.");
    assert_eq!(
        fx.session.history().messages()[2],
        Message::tool("call_9", "Teleport", "Teleport not found")
    );
    assert!(fx.store.load().unwrap().is_empty());
}

#[tokio::test]
async fn tool_stream_without_calls_delivers_content_once() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(Script::Fragments(vec![
        Ok(ChatCompletionChunk::tool_calls(vec![])),
        Ok(ChatCompletionChunk::content("Just ")),
        Ok(ChatCompletionChunk::content("text.")),
        Ok(ChatCompletionChunk::finish(FinishReason::Stop)),
    ]));

    let mut recorder = Recorder::default();
    let reply = fx
        .session
        .chat("Hello?", &mut recorder, &not_interrupted())
        .await
        .unwrap();
    assert_eq!(reply, "Just text.");
    assert_eq!(recorder.events, vec![Event::Chunk("Just text.".to_string())]);
    assert_eq!(fx.session.history().len(), 2);
}

#[tokio::test]
async fn history_stays_within_limit() {
    let mut fx = fixture(SessionConfig::default().with_history_limit(6));
    for n in 0..10 {
        if n % 3 == 0 {
            fx.endpoint.push(memorize(&format!("call_{n}"), &format!("fact {n}")));
        }
        fx.endpoint.push(content(&["ok"]));
        fx.session
            .chat_with(&format!("message {n}"), |_| {}, |_| {}, &not_interrupted())
            .await
            .unwrap();
        let history = fx.session.history().messages();
        assert!(history.len() <= 6, "turn {n}: {} messages", history.len());
        assert_ne!(history[0].role, MessageRole::Tool);
    }
    assert_eq!(fx.session.stats().total_turns, 10);
}

#[tokio::test]
async fn endpoint_error_leaves_history_unchanged() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint
        .push(content(&["First."]))
        .push(Script::Fail(Error::internal_server("upstream exploded", None)));

    fx.session
        .chat_with("one", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap();
    let before = fx.session.history().clone();

    let err = fx
        .session
        .chat_with("two", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(err.is_server_error());
    assert_eq!(fx.session.history(), &before);
    assert_eq!(fx.session.stats().total_turns, 1);
}

#[tokio::test]
async fn mid_stream_error_leaves_history_unchanged() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(Script::Fragments(vec![
        Ok(ChatCompletionChunk::content("Part")),
        Err(Error::streaming("connection reset", None)),
    ]));

    let mut recorder = Recorder::default();
    let err = fx
        .session
        .chat("hello", &mut recorder, &not_interrupted())
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert_eq!(recorder.text(), "Part");
    assert!(fx.session.history().is_empty());
}

#[tokio::test]
async fn tool_fragments_in_a_content_stream_fail_the_turn() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(Script::Fragments(vec![
        Ok(ChatCompletionChunk::content("Let me")),
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::start(
            0,
            "call_1",
            MEMORIZE_TOOL_NAME,
        )])),
        Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
    ]));

    let mut recorder = Recorder::default();
    let err = fx
        .session
        .chat("hello", &mut recorder, &not_interrupted())
        .await
        .unwrap_err();
    assert!(err.is_transport());
    assert!(recorder.memories().is_empty());
    assert!(fx.session.history().is_empty());
    assert!(fx.store.load().unwrap().is_empty());
}

#[tokio::test]
async fn interrupt_before_the_turn_starts() {
    let mut fx = fixture(SessionConfig::default());
    let interrupted = AtomicBool::new(true);
    let err = fx
        .session
        .chat_with("hello", |_| {}, |_| {}, &interrupted)
        .await
        .unwrap_err();
    assert!(err.is_abort());
    assert!(fx.endpoint.requests().is_empty());
    assert!(fx.session.history().is_empty());
}

#[tokio::test]
async fn interrupt_mid_stream_leaves_history_unchanged() {
    let mut fx = fixture(SessionConfig::default());
    let interrupted = Arc::new(AtomicBool::new(false));
    fx.endpoint.push(Script::InterruptAfter(
        vec![
            Ok(ChatCompletionChunk::content("One")),
            Ok(ChatCompletionChunk::content(" two")),
            Ok(ChatCompletionChunk::content(" three")),
            Ok(ChatCompletionChunk::finish(FinishReason::Stop)),
        ],
        2,
        interrupted.clone(),
    ));

    let mut recorder = Recorder::default();
    let err = fx
        .session
        .chat("count", &mut recorder, &interrupted)
        .await
        .unwrap_err();
    assert!(err.is_abort());
    assert_eq!(recorder.text(), "One two");
    assert!(fx.session.history().is_empty());
}

#[tokio::test]
async fn malformed_arguments_fail_the_turn() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(Script::Fragments(vec![
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::start(
            0,
            "call_1",
            MEMORIZE_TOOL_NAME,
        )])),
        Ok(ChatCompletionChunk::tool_calls(vec![ToolCallDelta::arguments(
            0,
            r#"{"memory": "User is"#,
        )])),
        Ok(ChatCompletionChunk::finish(FinishReason::ToolCalls)),
    ]));

    let err = fx
        .session
        .chat_with("hi", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap_err();
    assert!(err.is_tool_arguments());
    assert!(!err.is_transport());
    assert!(fx.session.history().is_empty());
    assert!(fx.store.load().unwrap().is_empty());
}

#[tokio::test]
async fn tool_loop_is_bounded() {
    let mut fx = fixture(SessionConfig::default().with_max_tool_iterations(2));
    for n in 0..3 {
        fx.endpoint
            .push(memorize(&format!("call_{n}"), &format!("fact {n}")));
    }

    let err = fx
        .session
        .chat_with("remember everything", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap_err();
    assert!(err.is_tool_loop());
    assert_eq!(fx.endpoint.requests().len(), 3);
    assert!(fx.session.history().is_empty());
    // Facts saved before the bound was hit stay saved.
    assert_eq!(fx.store.load().unwrap(), vec!["fact 0", "fact 1"]);
}

#[tokio::test]
async fn memory_management() {
    let mut fx = fixture(SessionConfig::default());
    for memory in ["a", "b", "c"] {
        fx.store.append(memory).unwrap();
    }
    assert_eq!(fx.session.load_memories().unwrap(), vec!["a", "b", "c"]);

    fx.session.delete_memory(1).unwrap();
    assert_eq!(fx.session.memories(), &["a".to_string(), "c".to_string()]);
    assert_eq!(fx.store.load().unwrap(), vec!["a", "c"]);

    assert!(fx.session.delete_memory(5).unwrap_err().is_validation());
    assert_eq!(fx.session.memories().len(), 2);
}

#[tokio::test]
async fn clear_and_model_switch() {
    let mut fx = fixture(SessionConfig::default());
    fx.endpoint.push(content(&["Hi."])).push(content(&["Hello again."]));

    fx.session
        .chat_with("hi", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap();
    fx.session.clear();
    assert!(fx.session.history().is_empty());

    fx.session.set_model("llama3.1");
    fx.session
        .chat_with("hi again", |_| {}, |_| {}, &not_interrupted())
        .await
        .unwrap();
    let requests = fx.endpoint.requests();
    assert_eq!(requests[1].model, "llama3.1");
    // System message plus the new user message only.
    assert_eq!(requests[1].messages.len(), 2);
    assert_eq!(fx.session.stats().model, "llama3.1");
}
