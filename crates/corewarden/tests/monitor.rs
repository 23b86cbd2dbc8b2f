#![cfg(unix)]

mod common;

use async_trait::async_trait;
use common::{CountingManager, FakeCore, RUNS_FOREVER, fast_settings, init_tracing, supervisor};
use corewarden::{
    EventBus, ProcessHandle, ProcessLifecycle, ProcessNameSet, ProcessNameSink, ProcessNode,
    ProcessTermination, ProcessTreeMonitor, ProcessTreeProvider, RuleSettings,
    RuleUpdateCoordinator, RuleUpdateOutcome, StatusEvent, detect_chain_proxy,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Process tree that can change between polls
#[derive(Default)]
struct ScriptedTree(Mutex<Vec<ProcessNode>>);

impl ScriptedTree {
    fn set(&self, forest: Vec<ProcessNode>) {
        *self.0.lock().unwrap() = forest;
    }
}

#[async_trait]
impl ProcessTreeProvider for ScriptedTree {
    async fn snapshot(&self) -> anyhow::Result<Vec<ProcessNode>> {
        Ok(self.0.lock().unwrap().clone())
    }
}

fn node(pid: u32, parent: Option<u32>, name: &str) -> ProcessNode {
    ProcessNode::new(pid, parent, name)
}

/// Every node below a monitored node is proxied and every proxied node is
/// monitored or reported.
#[test]
fn test_detection_is_closed_over_descendants() {
    let forest = vec![
        node(1, None, "explorer.exe"),
        node(2, Some(1), "Steam.exe"),
        node(3, Some(2), "steamwebhelper.exe"),
        node(4, Some(2), "Game.exe"),
        node(5, Some(4), "UnityCrashHandler64.exe"),
        node(6, Some(5), "werfault.exe"),
        node(7, Some(1), "discord.exe"),
        node(8, Some(7), "game.exe"),
        node(9, Some(8), "overlay.exe"),
        node(10, Some(99), "orphan.exe"),
    ];
    let monitored: ProcessNameSet = ["game.exe"].into_iter().collect();
    let found: HashSet<String> = detect_chain_proxy(&forest, &monitored).into_iter().collect();

    let expected: HashSet<String> = ["UnityCrashHandler64.exe", "werfault.exe", "overlay.exe"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(found, expected);
}

#[tokio::test]
async fn test_detected_descendants_reach_the_core_config() {
    init_tracing();
    let core = FakeCore::new(RUNS_FOREVER);
    std::fs::write(
        &core.config,
        serde_json::to_string_pretty(&json!({"route": {"rules": []}})).unwrap(),
    )
    .unwrap();
    let supervisor = supervisor(
        Arc::new(CountingManager::default()),
        &core,
        fast_settings(),
        EventBus::new(),
    );
    supervisor.start(&core.config).await.unwrap();
    let rules = RuleUpdateCoordinator::spawn(
        supervisor.clone(),
        core.config.clone(),
        RuleSettings::default(),
    );

    let events = EventBus::new();
    let detections = Arc::new(Mutex::new(Vec::new()));
    let seen = detections.clone();
    events.subscribe(Arc::new(move |event: &StatusEvent| {
        if let StatusEvent::ChainProxyDetected { session_id, names } = event {
            seen.lock().unwrap().push((session_id.clone(), names.clone()));
        }
    }));

    let tree = Arc::new(ScriptedTree::default());
    let sink: Arc<dyn ProcessNameSink> = Arc::new(rules.clone());
    let monitor = ProcessTreeMonitor::new(tree.clone(), sink, events, Duration::from_secs(60));
    monitor.start_monitoring("session-1", ["C:\\Games\\Game.exe"]).unwrap();

    tree.set(vec![node(1, None, "Game.exe")]);
    assert!(monitor.poll_now().await.unwrap().is_empty());

    tree.set(vec![
        node(1, None, "Game.exe"),
        node(2, Some(1), "Launcher.exe"),
        node(3, Some(2), "Render.exe"),
    ]);
    assert_eq!(
        monitor.poll_now().await.unwrap(),
        vec!["Launcher.exe", "Render.exe"]
    );

    // queued behind the monitor's submission
    let outcome = rules
        .update_process_names(["Game.exe", "Launcher.exe", "Render.exe"])
        .await
        .unwrap();
    assert_eq!(outcome, RuleUpdateOutcome::Unchanged);

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&core.config).unwrap()).unwrap();
    assert_eq!(
        config["route"]["rules"][0]["process_name"],
        json!([
            "Game.exe",
            "game.exe",
            "Launcher.exe",
            "launcher.exe",
            "Render.exe",
            "render.exe"
        ])
    );
    assert_eq!(
        *detections.lock().unwrap(),
        vec![(
            "session-1".to_string(),
            vec!["Launcher.exe".to_string(), "Render.exe".to_string()]
        )]
    );
    assert_eq!(core.run_count(), 2);

    monitor.stop_monitoring();
    supervisor.shutdown().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_live_process_tree_detection() {
    use std::os::unix::fs::PermissionsExt;

    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let game = dir.path().join("fake-game");
    std::fs::write(&game, "#!/bin/sh\nsleep 30 &\nwait\n").unwrap();
    std::fs::set_permissions(&game, std::fs::Permissions::from_mode(0o755)).unwrap();

    let manager = Arc::new(CountingManager::default());
    let handle = manager
        .spawn_process(&game, &[], None, &HashMap::new())
        .await
        .unwrap();
    let pid = handle.get_pid().unwrap();

    let monitored: ProcessNameSet = ["fake-game"].into_iter().collect();
    let mut found = Vec::new();
    for _ in 0..40 {
        let forest = manager.snapshot().await.unwrap();
        found = detect_chain_proxy(&forest, &monitored);
        if !found.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let _ = manager.force_kill(pid).await;
    assert_eq!(found, vec!["sleep"]);
}
