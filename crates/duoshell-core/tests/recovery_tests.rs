mod common;

use common::{budget_ms, wait_for_settled, wait_until, TestFixtures, PROMPT};
use duoshell_core::Signal;
use duoshell_terminal::ShellChannel;
use duoshell_types::{BackgroundTaskState, CommandSource, RecordSource};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test]
async fn test_signal_bytes_reach_the_channel() {
    let fixtures = TestFixtures::new();
    fixtures.connect("sig").await;

    assert_eq!(
        fixtures.coordinator.deliver_signal("sig", "SIGTERM").await.unwrap(),
        Signal::Terminate
    );
    assert_eq!(
        fixtures.coordinator.deliver_signal("sig", "tstp").await.unwrap(),
        Signal::Suspend
    );
    let err = fixtures
        .coordinator
        .deliver_signal("sig", "SIGUSR1")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unsupported_signal");

    assert_eq!(
        fixtures.connector.latest().unwrap().writes(),
        vec![vec![0x04], vec![0x1a]]
    );
}

#[tokio::test]
async fn test_interrupt_evicts_interactive_entries_only() {
    let fixtures = TestFixtures::new();
    fixtures.connect("mix").await;

    fixtures
        .coordinator
        .submit("mix", "echo hi", CommandSource::Interactive, "i1", None)
        .await
        .unwrap();
    fixtures
        .coordinator
        .submit_with("mix", "wedge", CommandSource::Programmatic, "p1", budget_ms(20))
        .await
        .unwrap();

    fixtures.coordinator.deliver_signal("mix", "interrupt").await.unwrap();

    let session = fixtures.session("mix").await;
    let entries = session.ring_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "p1");
    assert!(entries[0].is_pending());
    assert!(session.has_active_nuclear_timeout());

    let removed = fixtures.coordinator.cancel_programmatic("mix").await.unwrap();
    assert_eq!(removed, 1);
    assert!(session.ring_entries().is_empty());
    assert_eq!(
        fixtures.coordinator.get_task("mix", "p1").await.unwrap().state,
        BackgroundTaskState::Cancelled
    );
}

#[tokio::test]
async fn test_cancel_programmatic_without_programmatic_work_fails() {
    let fixtures = TestFixtures::new();
    fixtures.connect("human").await;

    fixtures
        .coordinator
        .submit_with("human", "wedge", CommandSource::Interactive, "i1", budget_ms(20))
        .await
        .unwrap();

    let err = fixtures
        .coordinator
        .cancel_programmatic("human")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "no_active_programmatic_command");

    let entries = fixtures.session("human").await.ring_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, CommandSource::Interactive);
    assert!(fixtures.connector.latest().unwrap().writes().is_empty());
}

#[tokio::test]
async fn test_cancel_programmatic_drops_queued_agent_commands() {
    let fixtures = TestFixtures::new();
    fixtures.connect("queue").await;

    fixtures
        .coordinator
        .submit_with("queue", "wedge", CommandSource::Interactive, "i1", budget_ms(20))
        .await
        .unwrap();
    fixtures
        .coordinator
        .submit_with("queue", "whoami", CommandSource::Programmatic, "p1", budget_ms(20))
        .await
        .unwrap();
    fixtures
        .coordinator
        .submit_with("queue", "echo later", CommandSource::Interactive, "i2", budget_ms(20))
        .await
        .unwrap();

    assert_eq!(fixtures.coordinator.cancel_programmatic("queue").await.unwrap(), 1);

    let task = fixtures.coordinator.get_task("queue", "p1").await.unwrap();
    assert_eq!(task.state, BackgroundTaskState::Cancelled);

    let info = fixtures.coordinator.session_info("queue").await.unwrap();
    assert_eq!(info.queued_commands, 1);
    assert_eq!(info.active_command.unwrap().id, "i1");
    // The running command is interactive, so nothing was written to it
    assert!(fixtures.connector.latest().unwrap().writes().is_empty());
    assert!(!info.nuclear_timeout_active);
}

#[tokio::test]
async fn test_cancel_programmatic_interrupts_running_agent_command() {
    let fixtures = TestFixtures::new();
    fixtures.connect("agent").await;

    fixtures
        .coordinator
        .submit_with("agent", "sleep 30", CommandSource::Programmatic, "p1", budget_ms(20))
        .await
        .unwrap();
    fixtures.coordinator.cancel_programmatic("agent").await.unwrap();

    assert_eq!(fixtures.connector.latest().unwrap().writes(), vec![vec![0x03]]);
    assert_eq!(
        fixtures.coordinator.get_task("agent", "p1").await.unwrap().state,
        BackgroundTaskState::Cancelled
    );

    // The sleep exits on Ctrl-C, which counts as a completion
    let session = fixtures.session("agent").await;
    wait_until(|| !session.has_active_nuclear_timeout()).await;
    assert!(!session.has_triggered_nuclear_fallback());
}

#[tokio::test]
async fn test_completion_disarms_nuclear_timeout() {
    let fixtures = TestFixtures::new();
    fixtures.connect("calm").await;

    fixtures
        .coordinator
        .submit_with("calm", "sleep 30", CommandSource::Interactive, "i1", budget_ms(20))
        .await
        .unwrap();
    fixtures.coordinator.deliver_signal("calm", "int").await.unwrap();

    let task = wait_for_settled(&fixtures.coordinator, "calm", "i1").await;
    assert_eq!(task.state, BackgroundTaskState::Completed);
    assert_eq!(task.result.unwrap().exit_code, Some(130));
    assert!(!fixtures.coordinator.has_active_nuclear_timeout("calm").await.unwrap());
    assert!(!fixtures.coordinator.has_triggered_nuclear_fallback("calm").await.unwrap());
}

#[tokio::test]
async fn test_nuclear_fallback_keeps_session_identity() {
    let fixtures = TestFixtures::new();
    fixtures.connect("stuck").await;
    fixtures
        .coordinator
        .set_nuclear_timeout_duration("stuck", Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(
        fixtures.coordinator.nuclear_timeout_duration("stuck").await.unwrap(),
        Duration::from_millis(100)
    );

    let mut live = fixtures.coordinator.subscribe("stuck").await.unwrap();

    fixtures
        .coordinator
        .submit_with("stuck", "wedge", CommandSource::Programmatic, "w1", budget_ms(50))
        .await
        .unwrap();
    fixtures.coordinator.deliver_signal("stuck", "interrupt").await.unwrap();
    assert!(fixtures.coordinator.has_active_nuclear_timeout("stuck").await.unwrap());

    tokio::time::sleep(Duration::from_millis(400)).await;

    let info = fixtures.coordinator.session_info("stuck").await.unwrap();
    assert_eq!(info.name, "stuck");
    assert!(info.healthy);
    assert!(info.nuclear_fallback_triggered);
    assert!(!info.nuclear_timeout_active);
    assert_eq!(info.generation, 1);
    assert!(info.active_command.is_none());
    assert_eq!(fixtures.connector.connect_count(), 2);
    assert!(!fixtures.connector.channels()[0].is_open());

    let result = fixtures
        .coordinator
        .submit("stuck", "whoami", CommandSource::Programmatic, "after", None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.output, "alice\n");

    let records = live.drain();
    assert!(records
        .iter()
        .any(|r| r.source == RecordSource::System && r.payload.contains("reconnected")));
    let prompts = records
        .iter()
        .filter(|r| r.source == RecordSource::System && r.payload == format!("{} ", PROMPT))
        .count();
    assert_eq!(prompts, 2);
}

#[tokio::test]
async fn test_nuclear_timeouts_clear_independently() {
    let fixtures = TestFixtures::new();
    fixtures.connect("left").await;
    fixtures.connect("right").await;

    for name in ["left", "right"] {
        fixtures
            .coordinator
            .submit_with(name, "wedge", CommandSource::Interactive, "w", budget_ms(20))
            .await
            .unwrap();
        fixtures.coordinator.deliver_signal(name, "interrupt").await.unwrap();
        assert!(fixtures.coordinator.has_active_nuclear_timeout(name).await.unwrap());
    }

    assert!(fixtures.coordinator.clear_nuclear_timeout("left").await.unwrap());
    assert!(!fixtures.coordinator.has_active_nuclear_timeout("left").await.unwrap());
    assert!(fixtures.coordinator.has_active_nuclear_timeout("right").await.unwrap());

    assert!(fixtures.coordinator.clear_nuclear_timeout("right").await.unwrap());
    assert!(!fixtures.coordinator.has_active_nuclear_timeout("right").await.unwrap());
    assert!(!fixtures.coordinator.has_triggered_nuclear_fallback("left").await.unwrap());
}

#[tokio::test]
async fn test_explicit_reconnect_resets_session() {
    let fixtures = TestFixtures::new();
    fixtures.connect("re").await;

    fixtures
        .coordinator
        .submit_with("re", "wedge", CommandSource::Programmatic, "w1", budget_ms(20))
        .await
        .unwrap();
    let info = fixtures.coordinator.reconnect("re").await.unwrap();
    assert_eq!(info.generation, 1);
    assert!(info.healthy);

    let task = fixtures.coordinator.get_task("re", "w1").await.unwrap();
    assert_eq!(task.state, BackgroundTaskState::Cancelled);
    assert!(!info.nuclear_fallback_triggered);

    let ok = fixtures
        .coordinator
        .submit("re", "echo back", CommandSource::Interactive, "i1", None)
        .await
        .unwrap();
    assert_eq!(ok.into_result().unwrap().output, "back\n");
}

#[tokio::test]
async fn test_interrupt_on_idle_session_reaches_fallback() {
    let fixtures = TestFixtures::new();
    fixtures.connect("idle").await;
    fixtures
        .coordinator
        .set_nuclear_timeout_duration("idle", Duration::from_millis(100))
        .await
        .unwrap();

    fixtures.coordinator.deliver_signal("idle", "interrupt").await.unwrap();
    assert!(fixtures.coordinator.has_active_nuclear_timeout("idle").await.unwrap());

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(fixtures.coordinator.has_triggered_nuclear_fallback("idle").await.unwrap());
    let info = fixtures.coordinator.session_info("idle").await.unwrap();
    assert_eq!(info.name, "idle");
    assert!(info.healthy);
    assert_eq!(fixtures.connector.connect_count(), 2);
}

#[tokio::test]
async fn test_queued_command_survives_fallback() {
    let fixtures = TestFixtures::new();
    fixtures.connect("backlog").await;
    fixtures
        .coordinator
        .set_nuclear_timeout_duration("backlog", Duration::from_millis(100))
        .await
        .unwrap();

    let wedged = fixtures
        .coordinator
        .submit_with("backlog", "wedge", CommandSource::Programmatic, "w1", budget_ms(20))
        .await
        .unwrap();
    assert!(wedged.is_pending());
    let queued = fixtures
        .coordinator
        .submit_with("backlog", "echo hi", CommandSource::Interactive, "e1", budget_ms(20))
        .await
        .unwrap();
    assert!(queued.is_pending());

    fixtures.coordinator.deliver_signal("backlog", "interrupt").await.unwrap();

    let task = wait_for_settled(&fixtures.coordinator, "backlog", "e1").await;
    assert_eq!(task.state, BackgroundTaskState::Completed);
    assert_eq!(task.result.unwrap().output, "hi\n");
    assert_eq!(
        fixtures.coordinator.get_task("backlog", "w1").await.unwrap().state,
        BackgroundTaskState::Cancelled
    );
    assert_eq!(fixtures.executed(), vec!["wedge", "echo hi"]);
    assert_eq!(fixtures.connector.channels()[1].executed_commands(), vec!["echo hi"]);
}
