//! Durability scenarios: requests survive replica loss.
//!
//! A replica crash is modeled by aborting the in-flight handling task and
//! discarding the servicer (every channel, pending request, and minted-id
//! mapping with it) while the state runtime, the durable half, survives.
//! A new servicer over the same runtime is the restarted replica.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;

use durablemcp_protocol::VSCODE_GET_STREAM;
use durablemcp_protocol::jsonrpc::{
    JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use durablemcp_protocol::types::{ServerInfo, Tool, methods};
use durablemcp_runtime::{MemoryRuntime, StateRuntime, at_least_once, at_most_once};
use durablemcp_server::adapter::ElicitationResult;
use durablemcp_server::registry::{Registry, ToolHandlerFn, ToolRegistration};
use durablemcp_server::sorted_map::SortedMap;
use durablemcp_server::stream::{StoredMessage, StreamHandle};
use durablemcp_server::{MessageEnvelope, ServerError, SessionServicer};

const SESSION: &str = "0198c0de000070008000000000000001";

fn tool(name: &str, handler: ToolHandlerFn) -> ToolRegistration {
    ToolRegistration {
        tool: Tool {
            name: name.to_string(),
            title: None,
            description: None,
            input_schema: json!({"type": "object"}),
            output_schema: None,
        },
        handler,
    }
}

fn registry(tools: Vec<ToolRegistration>) -> Arc<Registry> {
    Arc::new(Registry {
        server_info: ServerInfo {
            name: "durability-test".into(),
            version: "0.0.0".into(),
        },
        tools,
        resources: Vec::new(),
        templates: Vec::new(),
        prompts: Vec::new(),
    })
}

fn servicer(runtime: &Arc<dyn StateRuntime>, registry: &Arc<Registry>) -> Arc<SessionServicer> {
    Arc::new(SessionServicer::new(
        Arc::clone(runtime),
        SESSION,
        Arc::clone(registry),
        false,
    ))
}

fn call_tool_envelope(request_id: i64, name: &str, arguments: Value) -> MessageEnvelope {
    let request = JsonRpcRequest::new(
        methods::TOOLS_CALL,
        Some(json!({
            "name": name,
            "arguments": arguments,
            "_meta": {"progressToken": request_id},
        })),
        RequestId::Number(request_id),
    );
    MessageEnvelope::new(request.into()).with_related_request_id(request_id.to_string())
}

fn initialize_envelope(request_id: i64, client_name: &str) -> MessageEnvelope {
    let request = JsonRpcRequest::new(
        methods::INITIALIZE,
        Some(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": client_name, "version": "1.0"},
        })),
        RequestId::Number(request_id),
    );
    MessageEnvelope::new(request.into()).with_related_request_id(request_id.to_string())
}

fn spawn_handle(
    servicer: &Arc<SessionServicer>,
    envelope: MessageEnvelope,
) -> JoinHandle<Result<(), ServerError>> {
    tokio::spawn(Arc::clone(servicer).handle_message(envelope))
}

async fn stored_messages(runtime: &Arc<dyn StateRuntime>, request_key: &str) -> Vec<StoredMessage> {
    StreamHandle::new(Arc::clone(runtime), SESSION, request_key)
        .messages()
        .await
        .unwrap()
}

/// Poll the stream until `predicate` holds over its stored messages.
async fn wait_for(
    runtime: &Arc<dyn StateRuntime>,
    request_key: &str,
    predicate: impl Fn(&[StoredMessage]) -> bool,
) -> Vec<StoredMessage> {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let messages = stored_messages(runtime, request_key).await;
            if predicate(&messages) {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn event_method(stored: &StoredMessage) -> Option<String> {
    stored
        .event_id
        .as_ref()
        .and_then(|_| stored.decode().ok())
        .and_then(|message| message.method().map(String::from))
}

fn terminal_events(messages: &[StoredMessage]) -> Vec<&StoredMessage> {
    messages
        .iter()
        .filter(|stored| {
            stored.event_id.is_some()
                && stored
                    .decode()
                    .map(|message| message.is_terminal())
                    .unwrap_or(false)
        })
        .collect()
}

/// A tool call's events survive a replica crash: the progress event is
/// delivered exactly once, the durable map holds exactly one entry, and
/// the final result still arrives.
#[tokio::test]
async fn tool_call_survives_reboot() {
    let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());
    let finish = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let handler: ToolHandlerFn = {
        let finish = Arc::clone(&finish);
        Arc::new(move |arguments, ctx| {
            let finish = Arc::clone(&finish);
            Box::pin(async move {
                let a = arguments["a"].as_i64().unwrap_or(0);
                let b = arguments["b"].as_i64().unwrap_or(0);

                let runtime = Arc::clone(ctx.runtime());
                let key = ctx.workflow().per_workflow_key("store-sum");
                let sum: i64 = at_least_once("Store sum", ctx.workflow(), || async move {
                    SortedMap::reference("sums")
                        .insert(
                            &runtime,
                            Some(key),
                            [(format!("{a} + {b}"), json!((a + b).to_string()))],
                        )
                        .await
                        .map_err(ServerError::into_runtime)?;
                    Ok(a + b)
                })
                .await?;

                ctx.report_progress(0.5, Some(1.0), None).await?;

                while !finish.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(json!(sum))
            })
        })
    };

    let registry = registry(vec![tool("add", handler)]);
    let envelope = call_tool_envelope(1, "add", json!({"a": 5, "b": 3}));

    // First life: run until the progress event is durable, then crash.
    let first = servicer(&runtime, &registry);
    let handle = spawn_handle(&first, envelope.clone());
    wait_for(&runtime, "1", |messages| {
        messages
            .iter()
            .any(|stored| event_method(stored).as_deref() == Some("notifications/progress"))
    })
    .await;
    handle.abort();
    drop(first);

    // Second life: a new replica re-handles the request.
    let second = servicer(&runtime, &registry);
    let handle = spawn_handle(&second, envelope);
    finish.store(true, Ordering::SeqCst);

    // Let the tool finish and the terminal land.
    let messages = wait_for(&runtime, "1", |messages| !terminal_events(messages).is_empty()).await;
    handle.await.unwrap().unwrap();

    // The progress event was appended exactly once across both lives.
    let progress_events: Vec<_> = messages
        .iter()
        .filter(|stored| event_method(stored).as_deref() == Some("notifications/progress"))
        .collect();
    assert_eq!(progress_events.len(), 1);

    // Exactly one terminal, and it is the last event.
    let terminals = terminal_events(&messages);
    assert_eq!(terminals.len(), 1);
    let last_event = messages
        .iter()
        .filter(|stored| stored.event_id.is_some())
        .next_back()
        .unwrap();
    assert!(last_event.decode().unwrap().is_terminal());

    // Event ids are unique within the stream.
    let mut ids: Vec<_> = messages.iter().filter_map(|m| m.event_id.clone()).collect();
    let before = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), before);

    // The client replays only the suffix after its last seen event.
    let progress_id = progress_events[0].event_id.clone().unwrap();
    let stream = StreamHandle::new(Arc::clone(&runtime), SESSION, "1");
    use futures::StreamExt;
    let replayed: Vec<_> = stream
        .replay(Some(progress_id))
        .map(|event| event.unwrap())
        .collect()
        .await;
    assert_eq!(replayed.len(), 1);
    match &replayed[0].message {
        JsonRpcMessage::Response(response) => assert_eq!(response.result, json!(8)),
        other => panic!("expected the final response, got {other:?}"),
    }

    // The durable map holds exactly one entry for "5 + 3".
    let map = SortedMap::reference("sums");
    assert_eq!(map.len(&runtime).await.unwrap(), 1);
    assert_eq!(map.get(&runtime, "5 + 3").await.unwrap(), Some(json!("8")));
}

/// An at-most-once step interrupted between its two commit fences is never
/// re-executed: the retry surfaces the poisoned step as an error and the
/// side effect happened at most once.
#[tokio::test]
async fn at_most_once_not_reexecuted_after_crash_mid_step() {
    let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());
    let charges = Arc::new(AtomicU32::new(0));

    let handler: ToolHandlerFn = {
        let charges = Arc::clone(&charges);
        Arc::new(move |_arguments, ctx| {
            let charges = Arc::clone(&charges);
            Box::pin(async move {
                let value: i64 = at_most_once(
                    "charge",
                    ctx.workflow(),
                    || async move {
                        charges.fetch_add(1, Ordering::SeqCst);
                        // The crash happens while the side effect is in
                        // flight.
                        std::future::pending::<()>().await;
                        Ok(1)
                    },
                    |_| false,
                )
                .await?;
                Ok(json!(value))
            })
        })
    };

    let registry = registry(vec![tool("charge", handler)]);
    let envelope = call_tool_envelope(1, "charge", json!({}));

    // First life: crash once the side effect has started.
    let first = servicer(&runtime, &registry);
    let handle = spawn_handle(&first, envelope.clone());
    tokio::time::timeout(Duration::from_secs(10), async {
        while charges.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("side effect never started");
    handle.abort();
    drop(first);

    // Second life: the retry must not re-enter the side effect.
    let second = servicer(&runtime, &registry);
    spawn_handle(&second, envelope)
        .await
        .unwrap()
        .unwrap();

    let messages = stored_messages(&runtime, "1").await;
    let terminals = terminal_events(&messages);
    assert_eq!(terminals.len(), 1);
    match terminals[0].decode().unwrap() {
        JsonRpcMessage::Error(error) => {
            assert!(error.error.message.contains("failed before completing"));
        }
        other => panic!("expected an error event, got {other:?}"),
    }

    assert_eq!(charges.load(Ordering::SeqCst), 1);
}

#[derive(serde::Deserialize, schemars::JsonSchema)]
struct Confirmation {
    confirmed: bool,
}

fn elicit_request_events(messages: &[StoredMessage]) -> Vec<(String, String, String)> {
    // (minted id, message text, event id) per stored elicitation request.
    messages
        .iter()
        .filter(|stored| stored.event_id.is_some())
        .filter_map(|stored| match stored.decode().ok()? {
            JsonRpcMessage::Request(request)
                if request.method == methods::ELICITATION_CREATE =>
            {
                let text = request.params.as_ref()?.get("message")?.as_str()?.to_string();
                Some((
                    request.id.canonical(),
                    text,
                    stored.event_id.clone().unwrap(),
                ))
            }
            _ => None,
        })
        .collect()
}

/// An elicitation outstanding across a replica restart is cancelled and
/// re-sent with a disconnect apology; answering the re-sent request
/// completes the tool exactly once.
#[tokio::test]
async fn elicitation_resumes_after_restart() {
    let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());

    let handler: ToolHandlerFn = Arc::new(move |_arguments, ctx| {
        Box::pin(async move {
            match ctx.elicit::<Confirmation>("Confirm?").await? {
                ElicitationResult::Accepted { data } => Ok(json!(data.confirmed)),
                ElicitationResult::Declined | ElicitationResult::Cancelled => Ok(json!(false)),
            }
        })
    });

    let registry = registry(vec![tool("confirm", handler)]);
    let envelope = call_tool_envelope(1, "confirm", json!({}));

    // First life: the elicitation goes out; the client never answers.
    let first = servicer(&runtime, &registry);
    let handle = spawn_handle(&first, envelope.clone());
    let messages = wait_for(&runtime, "1", |messages| {
        !elicit_request_events(messages).is_empty()
    })
    .await;
    let (first_minted, first_text, _) = elicit_request_events(&messages)[0].clone();
    assert!(first_text.starts_with("Confirm?"));
    handle.abort();
    drop(first);

    // Second life: the old request is cancelled and a new one goes out,
    // prefixed so the user understands.
    let second = servicer(&runtime, &registry);
    let handle = spawn_handle(&second, envelope);
    let messages = wait_for(&runtime, "1", |messages| {
        elicit_request_events(messages).len() == 2
    })
    .await;

    let requests = elicit_request_events(&messages);
    let (second_minted, second_text, _) = requests[1].clone();
    assert!(
        second_text.starts_with("Sorry, we got disconnected and need to try again:"),
        "unexpected prompt: {second_text}"
    );
    assert_ne!(first_minted, second_minted);

    // The previous life's request was cancelled for replaying clients.
    let cancelled: Vec<_> = messages
        .iter()
        .filter(|stored| {
            event_method(stored).as_deref() == Some(methods::CANCELLED)
        })
        .collect();
    assert_eq!(cancelled.len(), 1);
    match cancelled[0].decode().unwrap() {
        JsonRpcMessage::Notification(notification) => {
            let params = notification.params.unwrap();
            assert_eq!(params["requestId"], json!(first_minted));
        }
        other => panic!("expected a cancellation, got {other:?}"),
    }

    // The client answers the re-sent request under its minted id.
    let answer = JsonRpcResponse::new(
        json!({"action": "accept", "content": {"confirmed": true}}),
        RequestId::String(second_minted),
    );
    Arc::clone(&second)
        .handle_message(MessageEnvelope::new(answer.into()))
        .await
        .unwrap();

    let messages = wait_for(&runtime, "1", |messages| !terminal_events(messages).is_empty()).await;
    handle.await.unwrap().unwrap();

    let terminals = terminal_events(&messages);
    assert_eq!(terminals.len(), 1);
    match terminals[0].decode().unwrap() {
        JsonRpcMessage::Response(response) => assert_eq!(response.result, json!(true)),
        other => panic!("expected the final response, got {other:?}"),
    }
}

/// Events for a session identified as Visual Studio Code are duplicated
/// onto the aggregate stream, preserving source order, with unique ids.
#[tokio::test]
async fn vscode_events_are_duplicated_onto_the_aggregate_stream() {
    let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());

    let handler: ToolHandlerFn = Arc::new(move |_arguments, ctx| {
        Box::pin(async move {
            ctx.report_progress(0.5, Some(1.0), None).await?;
            ctx.report_progress(1.0, Some(1.0), None).await?;
            Ok(json!("done"))
        })
    });

    let registry = registry(vec![tool("work", handler)]);
    let servicer = servicer(&runtime, &registry);

    // Initialize identifies the client; afterwards every event is
    // duplicated on write.
    Arc::clone(&servicer)
        .handle_message(initialize_envelope(0, "Visual Studio Code"))
        .await
        .unwrap();
    Arc::clone(&servicer)
        .handle_message(call_tool_envelope(1, "work", json!({})))
        .await
        .unwrap();

    let per_request = stored_messages(&runtime, "1").await;
    let aggregate = stored_messages(&runtime, VSCODE_GET_STREAM).await;

    let request_ids: Vec<_> = per_request
        .iter()
        .filter_map(|stored| stored.event_id.clone())
        .collect();
    assert_eq!(request_ids.len(), 3); // two progress events + response

    // Same inner ids, same order, re-qualified under the aggregate key.
    let aggregate_ids: Vec<_> = aggregate
        .iter()
        .filter_map(|stored| stored.event_id.clone())
        .filter(|id| !id.ends_with("/0")) // the initialize response
        .collect();
    let expected: Vec<_> = request_ids
        .iter()
        .map(|id| format!("{VSCODE_GET_STREAM}/{}", id.split_once('/').unwrap().1))
        .collect();
    assert_eq!(aggregate_ids, expected);

    // Aggregate ids are unique too.
    let mut deduped = aggregate_ids.clone();
    deduped.sort();
    deduped.dedup();
    assert_eq!(deduped.len(), aggregate_ids.len());
}

/// Two executions of the same handler for the same request derive the
/// same event ids, so a retried request appends nothing new.
#[tokio::test]
async fn reexecution_appends_no_new_events() {
    let runtime: Arc<dyn StateRuntime> = Arc::new(MemoryRuntime::new());

    let handler: ToolHandlerFn = Arc::new(move |_arguments, ctx| {
        Box::pin(async move {
            ctx.report_progress(0.25, None, Some("starting")).await?;
            ctx.info("halfway").await?;
            Ok(json!(42))
        })
    });

    let registry = registry(vec![tool("steady", handler)]);
    let envelope = call_tool_envelope(1, "steady", json!({}));

    let first = servicer(&runtime, &registry);
    spawn_handle(&first, envelope.clone()).await.unwrap().unwrap();
    let after_first = stored_messages(&runtime, "1").await;
    drop(first);

    // A second replica handling the same request is a no-op: every step
    // replays and every append dedupes.
    let second = servicer(&runtime, &registry);
    spawn_handle(&second, envelope).await.unwrap().unwrap();
    let after_second = stored_messages(&runtime, "1").await;

    let ids = |messages: &[StoredMessage]| -> Vec<String> {
        messages.iter().filter_map(|m| m.event_id.clone()).collect()
    };
    assert_eq!(ids(&after_first), ids(&after_second));
}
