//! Hot-reload pipeline end to end: a real config file on disk, the
//! directory watcher, the diff, and the manager applying it against real
//! stdio upstreams.

use crabeye_mcp_bridge::client::{ClientFactory, ReconnectSettings, UpstreamClientFactory};
use crabeye_mcp_bridge::config::{BridgeConfig, load_config};
use crabeye_mcp_bridge::diff::diff_configs;
use crabeye_mcp_bridge::manager::UpstreamManager;
use crabeye_mcp_bridge::registry::ToolRegistry;
use crabeye_mcp_bridge::transport::RmcpTransportFactory;
use crabeye_mcp_bridge::watcher::{ConfigWatcher, ReloadListener};
use futures::FutureExt as _;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn server_bin() -> &'static str {
    env!("CARGO_BIN_EXE_crabeye-stdio-test-server")
}

fn write_config(path: &Path, upstreams: &[(&str, Option<(&str, &str)>)]) {
    let mut servers = serde_json::Map::new();
    for (name, env) in upstreams {
        let mut entry = serde_json::json!({ "command": server_bin() });
        if let Some((key, value)) = env {
            entry["env"] = serde_json::json!({ key: value });
        }
        servers.insert((*name).to_string(), entry);
    }
    let config = serde_json::json!({ "mcpUpstreams": servers });
    std::fs::write(path, serde_json::to_string_pretty(&config).expect("serialize"))
        .expect("write config");
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(15);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn reload_listener(manager: Arc<UpstreamManager>) -> ReloadListener {
    Arc::new(move |new_config: BridgeConfig| {
        let manager = Arc::clone(&manager);
        async move {
            let old = manager.current_config();
            let diff = diff_configs(&old, &new_config);
            if !diff.is_empty() {
                manager.apply_config_diff(&diff, new_config).await;
            }
            Ok(())
        }
        .boxed()
    })
}

#[tokio::test]
async fn config_edits_add_remove_and_reconnect_upstreams() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bridge.json");
    write_config(&path, &[("alpha", None)]);
    let config = load_config(&path).expect("initial config");

    let registry = Arc::new(ToolRegistry::new());
    let transport = Arc::new(RmcpTransportFactory::new(Duration::from_secs(10), None));
    let factory = Arc::new(UpstreamClientFactory::new(
        transport,
        ReconnectSettings::default(),
    ));
    let manager = UpstreamManager::new(
        Arc::clone(&registry),
        factory as Arc<dyn ClientFactory>,
        config.clone(),
    );

    let summary = manager.connect_all().await;
    assert_eq!(summary.connected, 1, "failed: {:?}", summary.failed);
    assert!(registry.get_tool("alpha__echo").is_some());

    let watcher = ConfigWatcher::spawn_with_debounce(
        &path,
        &config,
        reload_listener(Arc::clone(&manager)),
        Duration::from_millis(100),
    )
    .expect("spawn watcher");

    // Add an upstream.
    write_config(&path, &[("alpha", None), ("beta", None)]);
    wait_until("beta to connect", || {
        registry.get_tool("beta__echo").is_some()
    })
    .await;
    assert!(registry.get_tool("alpha__echo").is_some());

    // Change a connection-identifying field: beta gets recycled.
    let old_beta = manager.get_client("beta").expect("beta client");
    write_config(&path, &[("alpha", None), ("beta", Some(("MARKER", "1")))]);
    wait_until("beta to be replaced", || {
        manager
            .get_client("beta")
            .is_some_and(|client| !Arc::ptr_eq(&client, &old_beta))
    })
    .await;
    wait_until("replacement beta to reconnect", || {
        registry.get_tool("beta__echo").is_some()
    })
    .await;

    // Remove an upstream.
    write_config(&path, &[("beta", Some(("MARKER", "1")))]);
    wait_until("alpha to be removed", || {
        registry.get_tool("alpha__echo").is_none() && manager.get_client("alpha").is_none()
    })
    .await;
    assert!(registry.get_tool("beta__echo").is_some());

    watcher.stop().await;
    manager.close_all().await;
    assert!(registry.list_tools().is_empty());
}
