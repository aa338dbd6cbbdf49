use std::time::Duration;

use grid_lite::db::TaskExecParams;
use grid_lite::worker::{TaskExecResult, TaskRunner, TaskRunnerEvent};
use uuid::Uuid;

fn params(cmd: &str) -> TaskExecParams {
    TaskExecParams {
        job_id: Uuid::new_v4(),
        task_id: 0,
        cmd: cmd.to_string(),
        stdin: None,
        env: Vec::new(),
    }
}

/// Run a task to completion, returning the started pid (if any) and the result
async fn run(params: TaskExecParams) -> (Option<u32>, TaskExecResult) {
    let mut events = TaskRunner::new(params).run();
    let mut started = None;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("task did not finish in time")
            .expect("runner dropped its channel before finishing");
        match event {
            TaskRunnerEvent::Started(pid) => {
                assert!(started.is_none(), "Started reported twice");
                started = Some(pid);
            }
            TaskRunnerEvent::Finished(result) => return (started, result),
        }
    }
}

#[tokio::test]
async fn test_run_simple_command() {
    let (pid, result) = run(params("echo hello")).await;

    assert!(result.success);
    assert_eq!(result.ret_code, Some(0));
    assert_eq!(result.stdout, Some("hello\n".to_string()));
    assert!(result.stderr.is_none());
    assert!(result.error.is_none());
    assert!(pid.is_some());
    assert_eq!(result.pid, pid);
}

#[tokio::test]
async fn test_run_empty_output() {
    let (_, result) = run(params("true")).await;

    assert!(result.success);
    assert!(result.stdout.is_none());
    assert!(result.stderr.is_none());
}

#[tokio::test]
async fn test_run_large_output() {
    let (_, result) = run(params("seq 1 1000")).await;

    assert!(result.success);
    assert_eq!(result.stdout.unwrap().lines().count(), 1000);
}

#[tokio::test]
async fn test_run_command_failure() {
    let (_, result) = run(params("echo 'error message' >&2; exit 3")).await;

    assert!(!result.success);
    assert_eq!(result.ret_code, Some(3));
    assert!(result.signal.is_none());
    assert_eq!(result.stderr, Some("error message\n".to_string()));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_run_pipes_stdin() {
    let mut p = params("tr a-z A-Z");
    p.stdin = Some("grid input".to_string());

    let (_, result) = run(p).await;

    assert!(result.success);
    assert_eq!(result.stdout, Some("GRID INPUT".to_string()));
}

#[tokio::test]
async fn test_run_without_stdin_sees_eof() {
    let (_, result) = run(params("cat")).await;

    assert!(result.success);
    assert!(result.stdout.is_none());
}

#[tokio::test]
async fn test_run_exports_environment() {
    let mut p = params("echo \"$GRID_JOB_ID/$GRID_TASK_ID\"");
    p.task_id = 4;
    p.env = vec![
        ("GRID_JOB_ID".to_string(), p.job_id.to_string()),
        ("GRID_TASK_ID".to_string(), "4".to_string()),
    ];
    let expected = format!("{}/4\n", p.job_id);

    let (_, result) = run(p).await;

    assert_eq!(result.stdout, Some(expected));
}

#[tokio::test]
async fn test_run_reports_killing_signal() {
    let (_, result) = run(params("kill -9 $$")).await;

    assert!(!result.success);
    assert!(result.ret_code.is_none());
    assert_eq!(result.signal, Some(9));
}

#[tokio::test]
async fn test_run_unknown_command() {
    let (_, result) = run(params("definitely-not-a-real-command-xyz")).await;

    // The shell itself starts; it reports "command not found"
    assert!(!result.success);
    assert_eq!(result.ret_code, Some(127));
    assert!(result.stderr.is_some());
}

#[tokio::test]
async fn test_started_precedes_finished() {
    let mut events = TaskRunner::new(params("sleep 0.2")).run();

    let first = events.recv().await.unwrap();
    assert!(matches!(first, TaskRunnerEvent::Started(_)));
    let second = events.recv().await.unwrap();
    assert!(matches!(second, TaskRunnerEvent::Finished(ref r) if r.success));
    assert!(events.recv().await.is_none());
}
