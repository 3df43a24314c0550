mod common;

use std::time::Duration;

use common::*;
use stackup_supervisor::{Event, ServiceStatus, StopOptions, Supervisor};
use tokio::time;

#[tokio::test]
async fn test_start_and_stop_a_long_running_service() {
    init_tracing();
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));

    supervisor.start("web").await.unwrap();
    let state = supervisor.get_state("web").unwrap();
    assert_eq!(state.status, ServiceStatus::Running);
    assert!(state.pid.is_some());
    assert!(state.started_at.is_some());

    supervisor.stop("web").await.unwrap();
    let state = supervisor.get_state("web").unwrap();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert!(state.pid.is_none());
    assert!(state.stopped_at.is_some());
    assert_eq!(state.exit_code, Some(143), "SIGTERM exit indicator");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_is_a_noop_while_running() {
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));

    supervisor.start("web").await.unwrap();
    let first_pid = supervisor.get_state("web").unwrap().pid;
    supervisor.start("web").await.unwrap();
    assert_eq!(supervisor.get_state("web").unwrap().pid, first_pid);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_force_start_replaces_the_child() {
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));

    supervisor.start("web").await.unwrap();
    let first_pid = supervisor.get_state("web").unwrap().pid;
    supervisor
        .start_with(
            "web",
            stackup_supervisor::StartOptions {
                force: true,
                skip_deps: false,
            },
        )
        .await
        .unwrap();
    let second_pid = supervisor.get_state("web").unwrap().pid;
    assert!(second_pid.is_some());
    assert_ne!(first_pid, second_pid);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clean_exit_settles_in_stopped() {
    let supervisor = Supervisor::new(project(vec![service("oneshot", "sh -c 'exit 0'")]));

    supervisor.start("oneshot").await.unwrap();
    assert!(
        wait_for_status(&supervisor, "oneshot", ServiceStatus::Stopped, Duration::from_secs(5))
            .await
    );
    let state = supervisor.get_state("oneshot").unwrap();
    assert_eq!(state.exit_code, Some(0));

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unclean_exit_settles_in_crashed() {
    let supervisor = Supervisor::new(project(vec![service("flaky", "sh -c 'exit 3'")]));

    supervisor.start("flaky").await.unwrap();
    assert!(
        wait_for_status(&supervisor, "flaky", ServiceStatus::Crashed, Duration::from_secs(5))
            .await
    );
    let state = supervisor.get_state("flaky").unwrap();
    assert_eq!(state.exit_code, Some(3));
    assert!(state.last_error.is_some());

    // Policy is `no`: it stays crashed past the restart back-off.
    time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(
        supervisor.get_state("flaky").unwrap().status,
        ServiceStatus::Crashed
    );
    assert_eq!(supervisor.get_state("flaky").unwrap().restart_count, 0);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_on_failure_policy_restarts_after_backoff() {
    let mut svc = service("worker", "sh -c 'exit 1'");
    svc.restart = stackup_core::RestartPolicy::OnFailure;
    let supervisor = Supervisor::new(project(vec![svc]));
    let mut rx = supervisor.subscribe();

    let _ = supervisor.start("worker").await;

    // Each policy restart bumps the counter; two cycles is enough to
    // prove the loop.
    let deadline = time::Instant::now() + Duration::from_secs(8);
    loop {
        let count = supervisor.get_state("worker").unwrap().restart_count;
        if count >= 2 {
            break;
        }
        assert!(
            time::Instant::now() < deadline,
            "restart_count stuck at {count}"
        );
        time::sleep(Duration::from_millis(50)).await;
    }

    let changes = state_changes_until(&mut rx, Duration::from_millis(200), |_, _| false).await;
    let starts = changes
        .iter()
        .filter(|(_, st)| *st == ServiceStatus::Starting)
        .count();
    let crashes = changes
        .iter()
        .filter(|(_, st)| *st == ServiceStatus::Crashed)
        .count();
    assert!(starts >= 1 || crashes >= 1, "expected lifecycle churn on the bus");

    supervisor.stop("worker").await.unwrap();
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_always_policy_restarts_clean_exits() {
    let mut svc = service("cron", "sh -c 'sleep 0.1'");
    svc.restart = stackup_core::RestartPolicy::Always;
    let supervisor = Supervisor::new(project(vec![svc]));

    supervisor.start("cron").await.unwrap();

    let deadline = time::Instant::now() + Duration::from_secs(8);
    loop {
        if supervisor.get_state("cron").unwrap().restart_count >= 1 {
            break;
        }
        assert!(time::Instant::now() < deadline, "no restart observed");
        time::sleep(Duration::from_millis(50)).await;
    }

    supervisor.stop("cron").await.unwrap();
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manual_stop_cancels_pending_restart() {
    let mut svc = service("worker", "sleep 3600");
    svc.restart = stackup_core::RestartPolicy::Always;
    let supervisor = Supervisor::new(project(vec![svc]));

    supervisor.start("worker").await.unwrap();
    supervisor.stop("worker").await.unwrap();

    // A manual stop must not be followed by a policy restart.
    time::sleep(Duration::from_millis(1500)).await;
    let state = supervisor.get_state("worker").unwrap();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert_eq!(state.restart_count, 0);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_escalates_to_kill() {
    let svc = service("stubborn", "sh -c 'trap \"\" TERM; sleep 3600'");
    let supervisor = Supervisor::new(project(vec![svc]));

    supervisor.start("stubborn").await.unwrap();
    // Give the shell a beat to install its trap.
    time::sleep(Duration::from_millis(200)).await;

    let started = time::Instant::now();
    supervisor
        .stop_with(
            "stubborn",
            StopOptions {
                timeout: Some(Duration::from_millis(500)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed >= Duration::from_millis(400) && elapsed < Duration::from_secs(3),
        "stop took {elapsed:?}"
    );
    let state = supervisor.get_state("stubborn").unwrap();
    assert_eq!(state.status, ServiceStatus::Stopped);
    assert_eq!(state.exit_code, Some(137), "SIGKILL exit indicator");

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_is_a_noop_when_not_running() {
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));
    supervisor.stop("web").await.unwrap();
    assert_eq!(
        supervisor.get_state("web").unwrap().status,
        ServiceStatus::Stopped
    );
    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_all_stopped_fires_when_everything_is_terminal() {
    let supervisor = Supervisor::new(project(vec![
        service("a", "sleep 3600"),
        service("b", "sleep 3600"),
    ]));
    let mut rx = supervisor.subscribe();

    supervisor.start_all().await.unwrap();
    supervisor.stop_all().await.unwrap();

    let deadline = time::Instant::now() + Duration::from_secs(5);
    let mut saw_all_stopped = false;
    while time::Instant::now() < deadline {
        match time::timeout(Duration::from_millis(200), rx.recv()).await {
            Ok(Ok(Event::AllStopped)) => {
                saw_all_stopped = true;
                break;
            }
            Ok(Ok(_)) => {}
            _ => break,
        }
    }
    assert!(saw_all_stopped);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_captures_stdout_and_stderr_lines() {
    let svc = service("chatty", "sh -c 'echo from-stdout; echo from-stderr 1>&2; sleep 0.2'");
    let supervisor = Supervisor::new(project(vec![svc]));
    let mut rx = supervisor.subscribe();

    supervisor.start("chatty").await.unwrap();
    assert!(
        wait_for_status(&supervisor, "chatty", ServiceStatus::Stopped, Duration::from_secs(5))
            .await
    );
    // Let the pipe readers drain the last lines.
    time::sleep(Duration::from_millis(200)).await;

    let logs = supervisor.logs();
    let lines = logs.tail("chatty", 10);
    let contents: Vec<&str> = lines.iter().map(|l| l.content.as_str()).collect();
    assert!(contents.contains(&"from-stdout"), "got {contents:?}");
    assert!(contents.contains(&"from-stderr"), "got {contents:?}");

    let stdout_line = lines.iter().find(|l| l.content == "from-stdout").unwrap();
    assert_eq!(stdout_line.stream, stackup_logging::StreamKind::Stdout);
    let stderr_line = lines.iter().find(|l| l.content == "from-stderr").unwrap();
    assert_eq!(stderr_line.stream, stackup_logging::StreamKind::Stderr);

    // The same lines flow over the bus.
    let mut saw_log_event = false;
    while let Ok(Ok(event)) = time::timeout(Duration::from_millis(200), rx.recv()).await {
        if matches!(event, Event::Log(_)) {
            saw_log_event = true;
            break;
        }
    }
    assert!(saw_log_event);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_spawn_failure_marks_failed() {
    let supervisor = Supervisor::new(project(vec![service(
        "ghost",
        "/definitely/not/a/real/binary",
    )]));

    let err = supervisor.start("ghost").await.unwrap_err();
    assert!(matches!(err, stackup_core::Error::Spawn(_)));
    let state = supervisor.get_state("ghost").unwrap();
    assert_eq!(state.status, ServiceStatus::Failed);
    assert!(state.last_error.is_some());

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_cycles_the_child() {
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));

    supervisor.start("web").await.unwrap();
    let first_pid = supervisor.get_state("web").unwrap().pid;
    supervisor.restart("web").await.unwrap();
    let second_pid = supervisor.get_state("web").unwrap().pid;
    assert!(second_pid.is_some());
    assert_ne!(first_pid, second_pid);

    supervisor.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_service_is_an_error() {
    let supervisor = Supervisor::new(project(vec![service("web", "sleep 3600")]));
    assert!(matches!(
        supervisor.start("nope").await,
        Err(stackup_core::Error::UnknownService(_))
    ));
    assert!(supervisor.get_state("nope").is_err());
    supervisor.shutdown().await.unwrap();
}
