#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use duoshell_core::{CoreConfig, SubmitOptions, TerminalCoordinator, TerminalSession};
use duoshell_terminal::{Script, ScriptedConnector, ScriptedReply};
use duoshell_types::{BackgroundTask, ConnectionParams, SessionInfo, TaskPoll};

pub const HOST: &str = "web01";
pub const USER: &str = "alice";
pub const PROMPT: &str = "alice@web01:~$";

/// Common test utilities for coordinator testing
pub struct TestFixtures {
    pub connector: Arc<ScriptedConnector>,
    pub coordinator: Arc<TerminalCoordinator>,
}

impl TestFixtures {
    pub fn new() -> Self {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        let connector = Arc::new(ScriptedConnector::new(test_script()));
        let coordinator = Arc::new(TerminalCoordinator::with_connector(
            config,
            Arc::clone(&connector) as Arc<dyn duoshell_terminal::ShellConnector>,
        ));
        Self {
            connector,
            coordinator,
        }
    }

    /// Connect a session as alice@web01
    pub async fn connect(&self, name: &str) -> SessionInfo {
        self.coordinator
            .connect(name, ConnectionParams::new(HOST, USER))
            .await
            .expect("Failed to connect test session")
    }

    pub async fn session(&self, name: &str) -> Arc<TerminalSession> {
        self.coordinator
            .store()
            .get(name)
            .await
            .expect("Test session missing")
    }

    /// Every command the scripted shell has been asked to run, across channels
    pub fn executed(&self) -> Vec<String> {
        self.connector
            .channels()
            .iter()
            .flat_map(|channel| channel.executed_commands())
            .collect()
    }
}

/// Script shared by the integration suites: `wedge` never finishes and
/// ignores interrupts, `slow` takes a second, `boom` breaks mid-command.
pub fn test_script() -> Script {
    Script::new()
        .on("wedge", ScriptedReply::Hang)
        .on("slow", ScriptedReply::delayed("slow done\n", Duration::from_secs(1)))
        .on("boom", ScriptedReply::Error("connection reset by peer".to_string()))
}

pub fn budget_ms(ms: u64) -> SubmitOptions {
    SubmitOptions::with_budget(Duration::from_millis(ms))
}

/// Poll a background task until it leaves RUNNING
pub async fn wait_for_settled(
    coordinator: &TerminalCoordinator,
    session: &str,
    task_id: &str,
) -> BackgroundTask {
    for _ in 0..500 {
        match coordinator.poll_task(session, task_id).await {
            TaskPoll::Settled(task) => return task,
            TaskPoll::Running(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            TaskPoll::NotFound => panic!("task {} not found", task_id),
        }
    }
    panic!("task {} did not settle", task_id);
}

/// Wait until `check` holds, for at most two seconds
pub async fn wait_until<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
