//! End-to-end behavior of the supervisor against real shell children.

#![cfg(unix)]

use std::collections::HashMap;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use procmux_core::RunStream;
use procmux_core::Supervisor;
use procmux_core::SupervisorConfig;
use procmux_core::SupervisorError;
use procmux_core::protocol::LaunchParams;
use procmux_core::protocol::LaunchScriptParams;
use procmux_core::protocol::RunStatus;
use procmux_core::protocol::StopOutcome;
use procmux_core::protocol::StreamEvent;
use tokio::time::sleep;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        eviction_linger: Duration::from_millis(300),
        kill_grace: Duration::from_millis(400),
        ..Default::default()
    }
}

fn shell_launch(run_id: &str, script: &str) -> LaunchParams {
    LaunchParams {
        run_id: run_id.to_string(),
        command: script.to_string(),
        args: Vec::new(),
        cwd: None,
        env: HashMap::new(),
        shell: true,
    }
}

/// Next log line, skipping keepalives. Panics if the stream stalls or ends.
async fn expect_line(stream: &mut RunStream) -> String {
    timeout(WAIT, async {
        loop {
            match stream.next_event().await {
                Some(StreamEvent::Line(line)) => return line.text,
                Some(StreamEvent::KeepAlive) => continue,
                None => panic!("stream ended while a line was still expected"),
            }
        }
    })
    .await
    .expect("timed out waiting for a log line")
}

async fn wait_for_eviction(supervisor: &Supervisor) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !supervisor.list().await.is_empty() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "run record was not evicted"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_sees_lines_then_exit_marker() -> anyhow::Result<()> {
    let supervisor = Supervisor::new(SupervisorConfig {
        eviction_linger: Duration::from_millis(1_500),
        ..Default::default()
    });
    let pid = supervisor
        .launch(shell_launch("build-1", "echo step1; echo step2"))
        .await?;
    assert!(pid.is_some(), "expected a pid for a spawned run");

    let mut stream = supervisor.subscribe("build-1").await?;
    assert_eq!(expect_line(&mut stream).await, "step1");
    assert_eq!(expect_line(&mut stream).await, "step2");
    assert_eq!(
        expect_line(&mut stream).await,
        "process build-1 exited with code 0"
    );

    let runs = supervisor.list().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "build-1");
    assert_eq!(runs[0].log_lines, 3);
    assert_eq!(runs[0].status, RunStatus::Exited);

    // After the linger delay the record is gone, the stream terminates, and
    // the id becomes launchable again.
    wait_for_eviction(&supervisor).await;
    let ended = timeout(WAIT, stream.next_event())
        .await
        .expect("stream should close after eviction");
    assert_eq!(ended, None);

    supervisor
        .launch(shell_launch("build-1", "echo again"))
        .await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_run_id_is_rejected_while_active() -> anyhow::Result<()> {
    let supervisor = Supervisor::new(fast_config());
    supervisor.launch(shell_launch("job-x", "sleep 5")).await?;

    let err = supervisor
        .launch(shell_launch("job-x", "echo too late"))
        .await
        .expect_err("second launch must collide");
    assert_matches!(err, SupervisorError::DuplicateRun { id } if id == "job-x");

    supervisor.stop("job-x").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_an_unknown_id_is_benign() {
    let supervisor = Supervisor::new(fast_config());
    let outcome = supervisor.stop("ghost").await.expect("stop");
    assert_eq!(outcome, StopOutcome::NotRunning);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_terminates_gracefully_before_the_grace_period() {
    let supervisor = Supervisor::new(fast_config());
    supervisor
        .launch(shell_launch("svc", "exec sleep 30"))
        .await
        .expect("launch");
    let mut stream = supervisor.subscribe("svc").await.expect("subscribe");

    let outcome = supervisor.stop("svc").await.expect("stop");
    assert_eq!(outcome, StopOutcome::TerminationRequested);

    // SIGTERM is enough for a cooperative child.
    let marker = expect_line(&mut stream).await;
    assert_eq!(marker, "process svc terminated by signal 15");

    let outcome = supervisor.stop("svc").await.expect("second stop");
    assert_eq!(outcome, StopOutcome::NotRunning);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grace_period_escalates_to_forced_kill() {
    let supervisor = Supervisor::new(fast_config());
    // The shell ignores SIGTERM. Its sleep is pointed away from the pipes so
    // the stream is not held open by the orphan after the kill, and the
    // trailing echo keeps the shell from exec-ing the sleep and losing the
    // trap.
    supervisor
        .launch(shell_launch(
            "stubborn",
            "trap '' TERM; echo armed; sleep 30 >/dev/null 2>&1; echo unreachable",
        ))
        .await
        .expect("launch");
    let mut stream = supervisor.subscribe("stubborn").await.expect("subscribe");

    // Only signal once the child has installed its trap.
    assert_eq!(expect_line(&mut stream).await, "armed");
    let outcome = supervisor.stop("stubborn").await.expect("stop");
    assert_eq!(outcome, StopOutcome::TerminationRequested);

    let marker = expect_line(&mut stream).await;
    assert_eq!(marker, "process stubborn terminated by signal 9");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_subscriber_gets_a_bounded_ordered_replay() {
    let supervisor = Supervisor::new(SupervisorConfig {
        eviction_linger: Duration::from_secs(30),
        ..Default::default()
    });
    supervisor
        .launch(shell_launch(
            "chatty",
            "i=1; while [ $i -le 250 ]; do echo line$i; i=$((i+1)); done",
        ))
        .await
        .expect("launch");

    // Drain a first stream to the exit marker so every line is known to be
    // buffered before the late subscriber attaches.
    let mut early = supervisor.subscribe("chatty").await.expect("subscribe");
    loop {
        if expect_line(&mut early).await.starts_with("process chatty exited") {
            break;
        }
    }

    // 250 lines plus the exit marker are buffered; the replay is capped at
    // the most recent 200, so it starts at line52 and ends with the marker.
    let mut late = supervisor.subscribe("chatty").await.expect("late subscribe");
    let mut replay = Vec::new();
    for _ in 0..200 {
        replay.push(expect_line(&mut late).await);
    }
    assert_eq!(replay[0], "line52");
    assert_eq!(replay[198], "line250");
    assert_eq!(replay[199], "process chatty exited with code 0");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_executable_is_reported_through_the_stream() {
    let supervisor = Supervisor::new(SupervisorConfig {
        eviction_linger: Duration::from_millis(1_500),
        ..Default::default()
    });
    let mut params = shell_launch("broken", "/definitely/not/installed-anywhere");
    params.shell = false;

    let pid = supervisor.launch(params).await.expect("launch");
    assert_eq!(pid, None, "a run that never spawned has no pid");

    let mut stream = supervisor.subscribe("broken").await.expect("subscribe");
    let line = expect_line(&mut stream).await;
    assert!(
        line.starts_with("failed to start /definitely/not/installed-anywhere"),
        "unexpected failure line: {line}"
    );

    let runs = supervisor.list().await;
    assert_eq!(runs[0].status, RunStatus::Exited);
    wait_for_eviction(&supervisor).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn env_overrides_and_cwd_reach_the_child() -> anyhow::Result<()> {
    let workdir = tempfile::tempdir()?;
    let supervisor = Supervisor::new(fast_config());

    let mut params = shell_launch("env-check", "echo $PROCMUX_TEST_MARK; pwd -P");
    params.env.insert(
        "PROCMUX_TEST_MARK".to_string(),
        "sentinel-42".to_string(),
    );
    params.cwd = Some(workdir.path().to_string_lossy().into_owned());

    supervisor.launch(params).await?;
    let mut stream = supervisor.subscribe("env-check").await?;

    assert_eq!(expect_line(&mut stream).await, "sentinel-42");
    let reported = expect_line(&mut stream).await;
    let expected = workdir.path().canonicalize()?;
    assert_eq!(reported, expected.to_string_lossy());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn script_files_launch_through_the_shell() -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir()?;
    let script = dir.path().join("job.sh");
    std::fs::write(&script, "#!/bin/sh\necho from-script\n")?;
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

    let supervisor = Supervisor::new(fast_config());
    supervisor
        .launch_script(LaunchScriptParams {
            run_id: "scripted".to_string(),
            script_path: script.to_string_lossy().into_owned(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        })
        .await?;

    let mut stream = supervisor.subscribe("scripted").await?;
    assert_eq!(expect_line(&mut stream).await, "from-script");
    assert_eq!(
        expect_line(&mut stream).await,
        "process scripted exited with code 0"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn liveness_markers_reach_idle_subscribers() {
    let supervisor = Supervisor::new(SupervisorConfig {
        keepalive_interval: Duration::from_millis(100),
        eviction_linger: Duration::from_secs(30),
        ..Default::default()
    });
    supervisor
        .launch(shell_launch("quiet", "sleep 5"))
        .await
        .expect("launch");

    let mut stream = supervisor.subscribe("quiet").await.expect("subscribe");
    let saw_keepalive = timeout(WAIT, async {
        loop {
            match stream.next_event().await {
                Some(StreamEvent::KeepAlive) => return true,
                Some(StreamEvent::Line(_)) => continue,
                None => return false,
            }
        }
    })
    .await
    .expect("timed out waiting for a keepalive");
    assert!(saw_keepalive);

    supervisor.stop("quiet").await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn streaming_an_unknown_id_is_not_found() {
    let supervisor = Supervisor::new(fast_config());
    let err = supervisor
        .subscribe("nobody-home")
        .await
        .expect_err("unknown id");
    assert_matches!(err, SupervisorError::NotFound { id } if id == "nobody-home");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn health_reports_tracked_run_count() {
    let supervisor = Supervisor::new(fast_config());
    let health = supervisor.health().await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.tracked_runs, 0);

    supervisor
        .launch(shell_launch("one", "sleep 5"))
        .await
        .expect("launch");
    let health = supervisor.health().await;
    assert_eq!(health.tracked_runs, 1);

    supervisor.stop("one").await.expect("stop");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blank_arguments_are_rejected() {
    let supervisor = Supervisor::new(fast_config());

    let err = supervisor
        .launch(shell_launch("", "echo hi"))
        .await
        .expect_err("blank run id");
    assert_matches!(err, SupervisorError::InvalidArgument { .. });

    let err = supervisor
        .launch(shell_launch("no-command", "  "))
        .await
        .expect_err("blank command");
    assert_matches!(err, SupervisorError::InvalidArgument { .. });
}
