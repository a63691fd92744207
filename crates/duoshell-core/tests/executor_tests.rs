mod common;

use common::{budget_ms, wait_for_settled, TestFixtures, PROMPT};
use duoshell_core::{CoreConfig, SubmitOptions};
use duoshell_types::{BackgroundTaskState, CommandSource, RecordSource, SubmitOutcome, TaskPoll};
use pretty_assertions::assert_eq;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_never_overlap() {
    let fixtures = TestFixtures::new();
    fixtures.connect("stress").await;

    let mut handles = Vec::new();
    for i in 0..24 {
        let coordinator = fixtures.coordinator.clone();
        handles.push(tokio::spawn(async move {
            let source = if i % 2 == 0 {
                CommandSource::Interactive
            } else {
                CommandSource::Programmatic
            };
            let command = if i % 3 == 0 {
                "sleep 0.01".to_string()
            } else {
                format!("echo {}", i)
            };
            coordinator
                .submit("stress", &command, source, &format!("c{}", i), None)
                .await
        }));
    }

    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.into_result().unwrap().succeeded());
    }
    assert_eq!(fixtures.connector.max_concurrent_commands(), 1);
    assert_eq!(fixtures.executed().len(), 24);
}

#[tokio::test]
async fn test_busy_session_rejects_second_command() {
    let fixtures = TestFixtures::new();
    fixtures.connect("prod").await;

    let first = fixtures
        .coordinator
        .submit_with("prod", "slow", CommandSource::Programmatic, "a", budget_ms(50))
        .await
        .unwrap();
    assert_eq!(first.task_id(), Some("a"));

    let err = fixtures
        .coordinator
        .submit_with(
            "prod",
            "whoami",
            CommandSource::Interactive,
            "b",
            SubmitOptions::default().reject_when_busy(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "session_busy");
    let text = err.to_string();
    assert!(text.contains("id a"));
    assert!(text.contains("programmatic"));

    let task = wait_for_settled(&fixtures.coordinator, "prod", "a").await;
    assert_eq!(task.state, BackgroundTaskState::Completed);
    assert_eq!(task.result.unwrap().output, "slow done\n");
    assert_eq!(fixtures.executed(), vec!["slow"]);
}

#[tokio::test]
async fn test_fifo_order_across_sources() {
    let fixtures = TestFixtures::new();
    fixtures.connect("fifo").await;

    let plan = [
        ("sleep 0.2", CommandSource::Programmatic, "p1"),
        ("echo two", CommandSource::Interactive, "i1"),
        ("echo three", CommandSource::Programmatic, "p2"),
        ("echo four", CommandSource::Interactive, "i2"),
    ];
    for (command, source, id) in plan {
        fixtures
            .coordinator
            .submit_with("fifo", command, source, id, budget_ms(1))
            .await
            .unwrap();
    }
    for (_, _, id) in plan {
        wait_for_settled(&fixtures.coordinator, "fifo", id).await;
    }

    assert_eq!(
        fixtures.executed(),
        vec!["sleep 0.2", "echo two", "echo three", "echo four"]
    );
    let ids: Vec<_> = fixtures
        .coordinator
        .get_history("fifo")
        .await
        .unwrap()
        .iter()
        .filter_map(|r| r.command_id.clone())
        .collect();
    assert_eq!(ids, vec!["p1", "i1", "p2", "i2"]);
}

#[tokio::test]
async fn test_whoami_from_each_source() {
    let fixtures = TestFixtures::new();
    fixtures.connect("who").await;

    let result = fixtures
        .coordinator
        .submit("who", "whoami", CommandSource::Programmatic, "p1", None)
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(result.output, "alice\n");
    assert_eq!(result.exit_code, Some(0));

    fixtures
        .coordinator
        .submit("who", "whoami", CommandSource::Interactive, "i1", None)
        .await
        .unwrap();

    let history = fixtures.coordinator.get_history("who").await.unwrap();
    let programmatic = history
        .iter()
        .find(|r| r.source == RecordSource::Programmatic)
        .unwrap();
    assert_eq!(
        programmatic.payload,
        format!("{} whoami\r\nalice\r\n{} ", PROMPT, PROMPT)
    );
    assert_eq!(programmatic.seq, result.record_seq.unwrap());

    let interactive = history
        .iter()
        .find(|r| r.source == RecordSource::Interactive)
        .unwrap();
    assert_eq!(interactive.payload, format!("alice\r\n{} ", PROMPT));
}

#[tokio::test]
async fn test_wait_budget_hands_off_to_background() {
    let fixtures = TestFixtures::new();
    fixtures.connect("bg").await;

    let outcome = fixtures
        .coordinator
        .submit(
            "bg",
            "sleep 1",
            CommandSource::Programmatic,
            "long",
            Some(Duration::from_millis(500)),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, SubmitOutcome::Pending { ref task_id } if task_id == "long"));

    match fixtures.coordinator.poll_task("bg", "long").await {
        TaskPoll::Running(task) => assert_eq!(task.state, BackgroundTaskState::Running),
        other => panic!("expected running, got {:?}", other),
    }

    let task = wait_for_settled(&fixtures.coordinator, "bg", "long").await;
    assert_eq!(task.state, BackgroundTaskState::Completed);
    assert_eq!(task.result.unwrap().exit_code, Some(0));
    assert!(task.finished_at.is_some());

    assert!(matches!(
        fixtures.coordinator.poll_task("bg", "missing").await,
        TaskPoll::NotFound
    ));
    assert_eq!(fixtures.coordinator.list_tasks("bg").await.unwrap().len(), 1);
    fixtures.coordinator.remove_task("bg", "long").await.unwrap();
    assert_eq!(
        fixtures.coordinator.get_task("bg", "long").await.unwrap_err().code(),
        "task_not_found"
    );
}

#[tokio::test]
async fn test_polling_unknown_session_reports_not_found() {
    let fixtures = TestFixtures::new();
    fixtures.connect("known").await;

    assert!(matches!(
        fixtures.coordinator.poll_task("nope", "t1").await,
        TaskPoll::NotFound
    ));
    assert_eq!(
        fixtures.coordinator.get_task("nope", "t1").await.unwrap_err().code(),
        "session_not_found"
    );
}

#[tokio::test]
async fn test_tasks_are_scoped_to_their_session() {
    let fixtures = TestFixtures::new();
    fixtures.connect("one").await;
    fixtures.connect("two").await;

    fixtures
        .coordinator
        .submit_with("one", "slow", CommandSource::Programmatic, "t1", budget_ms(10))
        .await
        .unwrap();
    assert_eq!(
        fixtures.coordinator.get_task("two", "t1").await.unwrap_err().code(),
        "task_not_found"
    );
}

#[tokio::test]
async fn test_validation_never_touches_state() {
    let fixtures = TestFixtures::new();
    fixtures.connect("v").await;

    for (command, id) in [("", "c1"), ("   ", "c2"), ("ls", ""), ("ls", "  ")] {
        let err = fixtures
            .coordinator
            .submit("v", command, CommandSource::Interactive, id, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "validation");
    }
    assert!(fixtures.session("v").await.ring_entries().is_empty());
    assert!(fixtures.executed().is_empty());
}

#[tokio::test]
async fn test_duplicate_pending_submission_is_rejected() {
    let fixtures = TestFixtures::new();
    fixtures.connect("dup").await;

    fixtures
        .coordinator
        .submit_with("dup", "wedge", CommandSource::Programmatic, "same", budget_ms(10))
        .await
        .unwrap();
    let err = fixtures
        .coordinator
        .submit_with("dup", "ls", CommandSource::Interactive, "same", budget_ms(10))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert!(err.to_string().contains("duplicate submission"));
}

#[tokio::test]
async fn test_channel_error_fails_only_that_command() {
    let fixtures = TestFixtures::new();
    fixtures.connect("err").await;

    let err = fixtures
        .coordinator
        .submit("err", "boom", CommandSource::Programmatic, "b1", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "execution");
    assert!(err.to_string().contains("connection reset by peer"));

    let info = fixtures.coordinator.session_info("err").await.unwrap();
    assert!(info.active_command.is_none());
    let ok = fixtures
        .coordinator
        .submit("err", "echo fine", CommandSource::Programmatic, "b2", None)
        .await
        .unwrap();
    assert_eq!(ok.into_result().unwrap().output, "fine\n");
}

#[tokio::test]
async fn test_ring_buffer_evicts_oldest() {
    let fixtures = TestFixtures::with_config(CoreConfig {
        ring_buffer_capacity: 3,
        ..CoreConfig::default()
    });
    fixtures.connect("ring").await;

    for i in 0..5 {
        fixtures
            .coordinator
            .submit("ring", "true", CommandSource::Interactive, &format!("c{}", i), None)
            .await
            .unwrap();
    }
    let ids: Vec<_> = fixtures
        .session("ring")
        .await
        .ring_entries()
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(ids, vec!["c2", "c3", "c4"]);
}

#[tokio::test]
async fn test_resize_through_coordinator() {
    let fixtures = TestFixtures::new();
    fixtures.connect("size").await;

    fixtures.coordinator.resize("size", 132, 43).await.unwrap();
    assert_eq!(fixtures.connector.latest().unwrap().size(), (132, 43));
    assert_eq!(
        fixtures.coordinator.resize("size", 0, 43).await.unwrap_err().code(),
        "validation"
    );
    assert_eq!(
        fixtures.coordinator.resize("size", 80, 1001).await.unwrap_err().code(),
        "validation"
    );
}
