// tests/dispatch_test.rs
//
// End-to-end: a lifecycle-anchored pipeline over a registry, with a chat
// handler admitted under both the platform and the conversation key
// before it touches per-conversation state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use chatpipe::config::{ConfigManager, MapConfigManager};
use chatpipe::context::RequestContext;
use chatpipe::handler::{handler_fn, HandlerError, Status};
use chatpipe::message::{Element, Message, OutboundContent};
use chatpipe::output::{Destination, OutputTransport, TransportError};
use chatpipe::queue::RequestIdQueue;
use chatpipe::registry::HandlerRegistry;
use chatpipe::session::{ConversationStore, TurnGuard};

const PLATFORM_LIMIT: usize = 2;

struct CapturingTransport {
    sent: Arc<Mutex<Vec<(Destination, Vec<Vec<Element>>)>>>,
}

#[async_trait]
impl OutputTransport for CapturingTransport {
    async fn send(
        &self,
        destination: &Destination,
        chunks: &[Vec<Element>],
    ) -> Result<(), TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.clone(), chunks.to_vec()));
        Ok(())
    }
}

struct ChatState {
    history: Mutex<Vec<String>>,
}

fn make_ctx(content: &str, conversation: &str) -> RequestContext {
    let msg = Message::generated("openai", content, Some(conversation.to_string()));
    RequestContext::new(msg, ConfigManager(MapConfigManager::new())).with_command("chat")
}

/// Wire up the full pipeline: a guard handler inside the check phase, a
/// chat handler inside the request phase that admits itself through both
/// queues, touches conversation state and rewrites the output.
fn make_pipeline(
    llm_peak: Arc<AtomicUsize>,
) -> (
    Arc<HandlerRegistry>,
    Arc<Mutex<Vec<(Destination, Vec<Vec<Element>>)>>>,
    ConversationStore<ChatState>,
) {
    let registry = HandlerRegistry::new();
    let sent = Arc::new(Mutex::new(Vec::new()));
    registry.add_sender(Arc::new(CapturingTransport { sent: sent.clone() }));

    let platforms: RequestIdQueue<String> = RequestIdQueue::new();
    let conversations: RequestIdQueue<String> = RequestIdQueue::new();
    let store: ConversationStore<ChatState> = ConversationStore::new(600);

    registry
        .register(
            "blocklist",
            handler_fn(|ctx: &mut RequestContext| {
                Box::pin(async move {
                    if ctx.message().content().contains("forbidden") {
                        ctx.set_output("that request is not allowed");
                        return Ok(Status::Stop);
                    }
                    Ok(Status::Continue)
                })
            }),
        )
        .unwrap()
        .after("check")
        .before("prepare");

    let llm_running = Arc::new(AtomicUsize::new(0));
    let chat_store = store.clone();
    registry
        .register(
            "chat",
            handler_fn(move |ctx: &mut RequestContext| {
                let platforms = platforms.clone();
                let conversations = conversations.clone();
                let store = chat_store.clone();
                let llm_running = llm_running.clone();
                let llm_peak = llm_peak.clone();
                Box::pin(async move {
                    if ctx.command() != Some("chat") {
                        return Ok(Status::Skip);
                    }
                    let conversation = ctx
                        .message()
                        .conversation_id()
                        .ok_or_else(|| HandlerError::domain("this command only works in a conversation"))?;
                    let request_id = ctx.message().id();
                    let token = ctx.cancel_token();

                    let _turn = TurnGuard::acquire(
                        &platforms,
                        &conversations,
                        &ctx.message().platform(),
                        &conversation,
                        &request_id,
                        PLATFORM_LIMIT,
                        &token,
                        Some(Duration::from_secs(5)),
                    )
                    .await
                    .map_err(|e| HandlerError::Internal(e.into()))?;

                    // stand-in for the external model call
                    let now = llm_running.fetch_add(1, Ordering::SeqCst) + 1;
                    llm_peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(5)).await;
                    llm_running.fetch_sub(1, Ordering::SeqCst);

                    let state = store
                        .get_or_create(&conversation, || ChatState {
                            history: Mutex::new(Vec::new()),
                        })
                        .await;
                    state
                        .history
                        .lock()
                        .unwrap()
                        .push(ctx.message().content().to_string());

                    Ok(Status::Replace(OutboundContent::text(format!(
                        "echo: {}",
                        ctx.message().content()
                    ))))
                })
            }),
        )
        .unwrap()
        .after("request")
        .before("send");

    (registry, sent, store)
}

#[tokio::test]
async fn test_full_pipeline_delivers_rewritten_output() {
    let peak = Arc::new(AtomicUsize::new(0));
    let (registry, sent, _store) = make_pipeline(peak);

    let mut ctx = make_ctx("hello there", "conv-1");
    let delivered = registry.dispatch(&mut ctx).await.unwrap();

    assert!(delivered);
    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0.platform, "openai");
    assert_eq!(sent[0].0.conversation_id, Some("conv-1".to_string()));
    assert_eq!(
        sent[0].1,
        vec![vec![Element::Text("echo: hello there".to_string())]]
    );
}

#[tokio::test]
async fn test_blocked_message_short_circuits_chat() {
    let peak = Arc::new(AtomicUsize::new(0));
    let (registry, sent, store) = make_pipeline(peak);

    let mut ctx = make_ctx("something forbidden", "conv-1");
    let delivered = registry.dispatch(&mut ctx).await.unwrap();

    assert!(!delivered);
    let sent = sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].1,
        vec![vec![Element::Text("that request is not allowed".to_string())]]
    );
    // the chat handler never ran, so no conversation state exists
    assert!(store.get("conv-1").await.is_none());
}

#[tokio::test]
async fn test_non_chat_command_skips_chat_handler() {
    let peak = Arc::new(AtomicUsize::new(0));
    let (registry, sent, store) = make_pipeline(peak);

    let msg = Message::generated("openai", "/status", Some("conv-1".to_string()));
    let mut ctx = RequestContext::new(msg, ConfigManager(MapConfigManager::new()))
        .with_command("status");
    let delivered = registry.dispatch(&mut ctx).await.unwrap();

    // the pipeline completes, nothing rewrote the output
    assert!(delivered);
    assert!(sent.lock().unwrap().is_empty());
    assert!(store.get("conv-1").await.is_none());
}

#[tokio::test]
async fn test_concurrent_turns_respect_both_bounds() {
    let peak = Arc::new(AtomicUsize::new(0));
    let (registry, sent, store) = make_pipeline(peak.clone());

    let mut tasks = Vec::new();
    for i in 0..6 {
        let registry = registry.clone();
        let conversation = if i % 2 == 0 { "conv-even" } else { "conv-odd" };
        let content = format!("turn {i}");
        tasks.push(tokio::spawn(async move {
            let mut ctx = make_ctx(&content, conversation);
            registry.dispatch(&mut ctx).await.unwrap()
        }));
    }
    for task in tasks {
        assert!(task.await.unwrap());
    }

    // platform bound held across all six turns
    assert!(peak.load(Ordering::SeqCst) <= PLATFORM_LIMIT);
    assert_eq!(sent.lock().unwrap().len(), 6);

    // per-conversation turns were serialized, so every turn is recorded
    let even = store.get("conv-even").await.unwrap();
    let odd = store.get("conv-odd").await.unwrap();
    assert_eq!(even.history.lock().unwrap().len(), 3);
    assert_eq!(odd.history.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_cancelled_context_stops_before_chat() {
    let peak = Arc::new(AtomicUsize::new(0));
    let (registry, sent, store) = make_pipeline(peak);

    let token = CancellationToken::new();
    token.cancel();
    let mut ctx = make_ctx("hello", "conv-1").with_cancellation(token);

    let delivered = registry.dispatch(&mut ctx).await.unwrap();
    assert!(!delivered);
    assert!(sent.lock().unwrap().is_empty());
    assert!(store.get("conv-1").await.is_none());
}
