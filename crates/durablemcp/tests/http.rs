//! End-to-end over real HTTP: connect, call tools, authenticate.

use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use durablemcp::client::{ClientError, ConnectOptions, connect};
use durablemcp::runtime::at_least_once;
use durablemcp::{
    AccessToken, AuthConfig, DurableContext, DurableMcp, MemoryRuntime, ServerError, SortedMap,
    TokenVerifier,
};

#[derive(Deserialize, JsonSchema)]
struct AddArgs {
    a: i64,
    b: i64,
}

fn build_mcp() -> DurableMcp {
    let mut mcp = DurableMcp::new("/mcp");
    mcp.server_info("http-test", "0.0.0");

    mcp.tool("add", "Add two numbers", |args: AddArgs, ctx: DurableContext| async move {
        let runtime = Arc::clone(ctx.runtime());
        let key = ctx.workflow().per_workflow_key("store-sum");
        let sum: i64 = at_least_once("Store sum", ctx.workflow(), || async move {
            SortedMap::reference("sums")
                .insert(
                    &runtime,
                    Some(key),
                    [(
                        format!("{} + {}", args.a, args.b),
                        json!((args.a + args.b).to_string()),
                    )],
                )
                .await
                .map_err(ServerError::into_runtime)?;
            Ok(args.a + args.b)
        })
        .await?;
        Ok(sum)
    });

    mcp.tool(
        "reset_counters",
        "Requires the admin scope",
        |_args: serde_json::Value, ctx: DurableContext| async move {
            let token = ctx
                .access_token()
                .ok_or_else(|| ServerError::permission_denied("no token"))?;
            token.require_scope("admin")?;
            Ok("reset")
        },
    );

    mcp
}

async fn serve(mcp: DurableMcp, runtime: Arc<MemoryRuntime>) -> String {
    let runtime: Arc<dyn durablemcp::StateRuntime> = runtime;
    let router = mcp
        .application(runtime)
        .into_router()
        .await
        .expect("router builds");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}/mcp")
}

struct ReadOnlyVerifier;

#[async_trait::async_trait]
impl TokenVerifier for ReadOnlyVerifier {
    async fn verify(&self, token: &str) -> Option<AccessToken> {
        (token == "reader").then(|| AccessToken {
            token: token.to_string(),
            client_id: "reader-client".to_string(),
            scopes: vec!["read".to_string()],
            expires_at: None,
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_and_call_a_tool() {
    let runtime = Arc::new(MemoryRuntime::new());
    let url = serve(build_mcp(), Arc::clone(&runtime)).await;

    let connection = connect(&url, ConnectOptions::default()).await.expect("connect");
    assert!(!connection.session_id().is_empty());

    let outcome = connection
        .call_tool("add", json!({"a": 5, "b": 3}))
        .await
        .expect("tool call");
    assert_eq!(outcome.result["structuredContent"], json!(8));

    // The tool's durable write landed exactly once.
    let runtime: Arc<dyn durablemcp::StateRuntime> = runtime;
    let map = SortedMap::reference("sums");
    assert_eq!(map.len(&runtime).await.unwrap(), 1);
    assert_eq!(map.get(&runtime, "5 + 3").await.unwrap(), Some(json!("8")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_bearer_is_rejected_before_any_mcp_work() {
    let runtime = Arc::new(MemoryRuntime::new());
    let mut mcp = build_mcp();
    mcp.auth(AuthConfig::default(), Arc::new(ReadOnlyVerifier));
    let url = serve(mcp, runtime).await;

    // No Authorization header: rejected with 401 before a session or
    // stream exists.
    let error = connect(&url, ConnectOptions::default())
        .await
        .expect_err("should be rejected");
    match error {
        ClientError::Http(error) => {
            assert_eq!(error.status().map(|status| status.as_u16()), Some(401));
        }
        other => panic!("expected an http 401, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scope_check_inside_a_tool_surfaces_as_a_tool_error() {
    let runtime = Arc::new(MemoryRuntime::new());
    let mut mcp = build_mcp();
    mcp.auth(AuthConfig::default(), Arc::new(ReadOnlyVerifier));
    let url = serve(mcp, Arc::clone(&runtime)).await;

    let options = ConnectOptions {
        bearer_token: Some("reader".to_string()),
        ..ConnectOptions::default()
    };
    let connection = connect(&url, options).await.expect("connect");

    // A read-scoped token can run ordinary tools.
    let outcome = connection
        .call_tool("add", json!({"a": 1, "b": 2}))
        .await
        .expect("tool call");
    assert_eq!(outcome.result["structuredContent"], json!(3));

    // But the admin-only tool names the missing scope.
    let error = connection
        .call_tool("reset_counters", json!({}))
        .await
        .expect_err("should be denied");
    match error {
        ClientError::Rpc { message, .. } => {
            assert!(message.contains("admin"), "message was: {message}");
        }
        other => panic!("expected an rpc error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumption_replays_only_the_suffix() {
    let runtime = Arc::new(MemoryRuntime::new());
    let url = serve(build_mcp(), Arc::clone(&runtime)).await;

    let connection = connect(&url, ConnectOptions::default()).await.expect("connect");

    // The tool emits nothing but the terminal here, so resume from the
    // event just before it: the request's own stored position is the
    // terminal, and a token taken earlier replays exactly the suffix.
    let outcome = connection
        .call_tool("add", json!({"a": 2, "b": 2}))
        .await
        .expect("tool call");
    let token = outcome.last_event_id.expect("resumption token");

    let runtime_dyn: Arc<dyn durablemcp::StateRuntime> = Arc::clone(&runtime) as _;
    let before = SortedMap::reference("sums").len(&runtime_dyn).await.unwrap();

    // Resuming after the terminal's own token yields an empty suffix: the
    // stream ends without replaying anything, and nothing re-executes.
    let resumed = connection.resume(&token).await;
    assert!(matches!(resumed, Err(ClientError::StreamEnded)));

    let after = SortedMap::reference("sums").len(&runtime_dyn).await.unwrap();
    assert_eq!(before, after);
}
