//! Tool surface construction across several connections.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{
    FakeRefresher, FakeServer, FakeSessionFactory, RefreshMode, Seed, USER, seed, store,
    test_registry,
};
use tether_core::mcp::BrokerError;
use tether_core::mcp::aggregator::{ToolAggregator, ToolNaming};
use tether_core::mcp::store::{CredentialStore, MemoryCredentialStore};
use tether_core::mcp::token_broker::TokenBroker;

fn aggregator(
    store: Arc<MemoryCredentialStore>,
    refresher: Arc<FakeRefresher>,
    factory: Arc<FakeSessionFactory>,
) -> ToolAggregator {
    let broker = Arc::new(TokenBroker::new(store.clone(), test_registry(), refresher));
    ToolAggregator::new(store, broker, factory)
}

fn default_factory() -> FakeSessionFactory {
    FakeSessionFactory::new()
        .server("alpha", FakeServer::with_tools(&["search", "fetch", "write", "admin"]))
        .server("beta", FakeServer::with_tools(&["search", "list"]))
        .server("gamma", FakeServer::with_tools(&["search"]))
}

#[tokio::test]
async fn exposes_enabled_allowed_tools_only() {
    let store = store();
    // "admin" is discovered but not on alpha's allow-list; "write" is disabled.
    seed(
        &store,
        0,
        Seed::valid(
            "alpha",
            &[("search", true), ("write", false), ("admin", true), ("fetch", true)],
        ),
    )
    .await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(surface.tool_names(), vec!["fetch", "search"]);
    assert_eq!(surface.sessions().len(), 1);

    surface.close().await;
    assert!(factory.all_closed());
}

#[tokio::test]
async fn no_eligible_connections_yields_empty_surface() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", false)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert!(surface.is_empty());
    assert!(surface.sessions().is_empty());
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn one_broken_integration_does_not_affect_others() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("fetch", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("list", true)])).await;
    seed(&store, 2, Seed::valid("gamma", &[("search", true)])).await;
    let factory = Arc::new(
        default_factory()
            .server(
                "beta",
                FakeServer {
                    fail_open: true,
                    ..FakeServer::with_tools(&["list"])
                },
            )
            .server(
                "gamma",
                FakeServer {
                    fail_list: true,
                    ..FakeServer::with_tools(&["search"])
                },
            ),
    );
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(surface.tool_names(), vec!["fetch"]);
    // gamma's session opened before discovery failed and still needs closing.
    let integrations: Vec<&str> = surface.sessions().iter().map(|s| s.integration()).collect();
    assert_eq!(integrations, vec!["alpha", "gamma"]);

    surface.close().await;
    assert!(factory.all_closed());
}

#[tokio::test]
async fn hung_discovery_is_skipped_within_the_bound() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("list", true)])).await;
    let factory = Arc::new(default_factory().server(
        "alpha",
        FakeServer {
            hang_list: true,
            ..FakeServer::with_tools(&["search"])
        },
    ));
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone())
        .with_pipeline_timeouts(Duration::from_secs(5), Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(surface.tool_names(), vec!["list"]);
    // The hung session was opened and is still handed back for closing.
    assert_eq!(surface.sessions().len(), 2);

    surface.close().await;
    assert!(factory.all_closed());
}

#[tokio::test]
async fn hung_session_open_is_skipped_within_the_bound() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("list", true)])).await;
    let factory = Arc::new(default_factory().server(
        "alpha",
        FakeServer {
            hang_open: true,
            ..FakeServer::with_tools(&["search"])
        },
    ));
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone())
        .with_pipeline_timeouts(Duration::from_millis(100), Duration::from_secs(5));

    let started = tokio::time::Instant::now();
    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(surface.tool_names(), vec!["list"]);
    let integrations: Vec<&str> = surface.sessions().iter().map(|s| s.integration()).collect();
    assert_eq!(integrations, vec!["beta"]);
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 2);
    surface.close().await;
}

#[tokio::test]
async fn refresh_failure_skips_only_that_connection() {
    let store = store();
    seed(&store, 0, Seed::expired("alpha", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("list", true)])).await;
    let refresher = Arc::new(FakeRefresher::new().with_mode(RefreshMode::Fail));
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, refresher, factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(surface.tool_names(), vec!["list"]);
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn expired_without_refresh_token_is_skipped() {
    let store = store();
    let mut data = Seed::expired("alpha", &[("search", true)]);
    data.refresh_token = None;
    seed(&store, 0, data).await;
    let refresher = Arc::new(FakeRefresher::new());
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, refresher.clone(), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert!(surface.is_empty());
    assert_eq!(refresher.calls(), 0);
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sessions_use_the_refreshed_token() {
    let store = store();
    seed(&store, 0, Seed::expired("alpha", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store.clone(), Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(factory.opened()[0].access_token, "refreshed-1");
    assert_eq!(store.token_update_count(), 1);
    surface.close().await;
}

#[tokio::test]
async fn bare_names_let_the_later_connection_win() {
    let store = store();
    let first = seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    let second = seed(&store, 1, Seed::valid("beta", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    let handle = surface.get("search").unwrap();
    assert_eq!(handle.integration, "beta");
    assert_eq!(handle.connection_id, second.id);
    assert_ne!(handle.connection_id, first.id);
    // The losing session is still tracked for closing.
    assert_eq!(surface.sessions().len(), 2);
    surface.close().await;
    assert!(factory.all_closed());
}

#[tokio::test]
async fn prefixed_names_keep_every_tool() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory)
        .with_naming(ToolNaming::Prefixed);

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(surface.tool_names(), vec!["alpha__search", "beta__search"]);
    assert_eq!(surface.get("beta__search").unwrap().remote_name, "search");
}

#[tokio::test]
async fn call_tool_dispatches_to_owning_session() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("fetch", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory)
        .with_naming(ToolNaming::Prefixed);

    let surface = agg.build_tool_surface(USER).await.unwrap();
    let args = json!({"id": "page-1"}).as_object().cloned();
    let result = surface.call_tool("alpha__fetch", args).await.unwrap();
    assert_eq!(result["integration"], "alpha");
    assert_eq!(result["tool"], "fetch");
    assert_eq!(result["arguments"]["id"], "page-1");

    let err = surface.call_tool("alpha__write", None).await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownTool(_)));
}

#[tokio::test]
async fn unknown_and_api_token_integrations_are_skipped() {
    let store = store();
    seed(&store, 0, Seed::valid("retired", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("keys", &[("search", true)])).await;
    seed(&store, 2, Seed::valid("gamma", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert_eq!(surface.tool_names(), vec!["search"]);
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_failure_is_returned() {
    let store = store();
    store.set_fail_listing(true);
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), Arc::new(default_factory()));

    let err = agg.build_tool_surface(USER).await.err().unwrap();
    assert!(matches!(err, BrokerError::DbError(_)));
}

#[tokio::test]
async fn inactive_connections_contribute_nothing() {
    let store = store();
    let conn = seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    store.set_connection_active(conn.id, false).await.unwrap();
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    assert!(surface.is_empty());
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_closes_opened_sessions() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    seed(&store, 1, Seed::valid("beta", &[("search", true)])).await;
    let factory = Arc::new(
        default_factory()
            .server(
                "alpha",
                FakeServer {
                    hang_list: true,
                    ..FakeServer::with_tools(&["search"])
                },
            )
            .server(
                "beta",
                FakeServer {
                    hang_list: true,
                    ..FakeServer::with_tools(&["search"])
                },
            ),
    );
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let err = agg
        .build_tool_surface_with_cancel(USER, &cancel)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BrokerError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(factory.opened().len(), 2);
    assert!(factory.all_closed());
}

#[tokio::test]
async fn cancellation_still_persists_refreshed_tokens() {
    let store = store();
    seed(&store, 0, Seed::expired("alpha", &[("search", true)])).await;
    let refresher = Arc::new(FakeRefresher::new().with_delay(Duration::from_millis(100)));
    let factory = Arc::new(default_factory());
    let agg = aggregator(store.clone(), refresher.clone(), factory.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = agg.build_tool_surface_with_cancel(USER, &cancel).await;
    assert!(matches!(result, Err(BrokerError::Cancelled)));
    assert_eq!(refresher.calls(), 1);
    assert_eq!(store.token_update_count(), 1);
    assert!(factory.opened().is_empty());
}

#[tokio::test]
async fn already_cancelled_does_nothing() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = agg.build_tool_surface_with_cancel(USER, &cancel).await;
    assert!(matches!(result, Err(BrokerError::Cancelled)));
    assert_eq!(factory.open_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn repeated_close_is_harmless() {
    let store = store();
    seed(&store, 0, Seed::valid("alpha", &[("search", true)])).await;
    let factory = Arc::new(default_factory());
    let agg = aggregator(store, Arc::new(FakeRefresher::new()), factory.clone());

    let surface = agg.build_tool_surface(USER).await.unwrap();
    let sessions = surface.sessions().to_vec();
    surface.close().await;
    tether_core::mcp::lifecycle::close_all(&sessions, Duration::from_secs(1)).await;
    assert_eq!(factory.opened()[0].close_calls.load(Ordering::SeqCst), 2);
}
