
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio_util::sync::CancellationToken;

use grid_lite::bus::topic::node_topic;
use grid_lite::bus::GridMessage;
use grid_lite::config::{DispatcherConfig, GridConfig, NodeAgentConfig};
use grid_lite::db::MemoryJobDatabase;
use grid_lite::error::GridError;
use grid_lite::scheduler::job::JobInfo;
use grid_lite::scheduler::{JobId, JobStatus, JobSubmission, TaskItem, TaskStatus};
use grid_lite::worker::NodeAgent;
use grid_lite::GridContext;
use test_harness::{alice, assert_eventually, RecordingKiller};

const WAIT: Duration = Duration::from_secs(10);

fn start_grid() -> (GridContext, Arc<MemoryJobDatabase>) {
    let db = Arc::new(MemoryJobDatabase::new());
    let config = GridConfig {
        dispatcher: DispatcherConfig::default().with_kill_polling(100, 50),
        ..Default::default()
    };
    let grid = GridContext::start(config, db.clone(), None, CancellationToken::new()).unwrap();
    (grid, db)
}

async fn wait_registered(grid: &GridContext, agent: &NodeAgent) -> String {
    let dispatcher = &grid.dispatcher;
    assert_eventually(
        || async move {
            match agent.node_id().await {
                Some(id) => dispatcher.nodes().await.iter().any(|n| n.id == id),
                None => false,
            }
        },
        WAIT,
        "node agent never registered",
    )
    .await;
    agent.node_id().await.unwrap()
}

async fn wait_job_done(grid: &GridContext, job_id: JobId) -> JobInfo {
    let dispatcher = &grid.dispatcher;
    assert_eventually(
        || async move {
            dispatcher
                .get_job_info(job_id)
                .await
                .map(|j| j.status.is_terminal())
                .unwrap_or(false)
        },
        WAIT,
        "job never finished",
    )
    .await;
    dispatcher.get_job_info(job_id).await.unwrap()
}

async fn wait_task_running(grid: &GridContext, job_id: JobId) {
    let dispatcher = &grid.dispatcher;
    assert_eventually(
        || async move {
            dispatcher
                .get_job_result(job_id)
                .await
                .map(|tasks| tasks[0].status == TaskStatus::Running)
                .unwrap_or(false)
        },
        WAIT,
        "task never started",
    )
    .await;
}

#[tokio::test]
async fn test_agent_runs_task_to_completion() {
    let (mut grid, db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(2, "worker-1"));
    let node_id = wait_registered(&grid, &agent).await;

    let node = grid.dispatcher.nodes().await.remove(0);
    assert_eq!(node.name, "worker-1");
    assert_eq!(node.num_cpus, 2);

    let job_id = grid
        .dispatcher
        .submit_job(
            &alice(),
            JobSubmission::from_commands(["echo \"hi from $GRID_NODE_NAME\"", "exit 2"]),
            None,
        )
        .await
        .unwrap();

    let info = wait_job_done(&grid, job_id).await;
    assert_eq!(info.status, JobStatus::Finished);
    assert!(!info.success);

    let results = grid.dispatcher.get_job_result(job_id).await.unwrap();
    assert_eq!(results[0].status, TaskStatus::Complete);
    assert!(results[0].pid.is_some());
    assert_eq!(results[1].status, TaskStatus::Failed);
    assert_eq!(results[1].ret_code, Some(2));

    let record = db.task_record(&job_id, 0).unwrap();
    assert_eq!(record.node_id.as_deref(), Some(node_id.as_str()));
    assert_eq!(record.pid, results[0].pid);
    let exec = record.result.unwrap();
    assert_eq!(exec.stdout, Some("hi from worker-1\n".to_string()));

    assert_eq!(grid.dispatcher.nodes().await[0].cpus_used, 0);
    grid.shutdown().await;
}

#[tokio::test]
async fn test_agent_feeds_task_stdin() {
    let (mut grid, db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(1, "worker-1"));
    wait_registered(&grid, &agent).await;

    let submission = JobSubmission::new(vec![TaskItem::new("wc -c").with_stdin("12345")]);
    let job_id = grid
        .dispatcher
        .submit_job(&alice(), submission, None)
        .await
        .unwrap();

    let info = wait_job_done(&grid, job_id).await;
    assert!(info.success);
    let exec = db.task_record(&job_id, 0).unwrap().result.unwrap();
    assert_eq!(exec.stdout.as_deref().map(str::trim), Some("5"));

    grid.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_job_never_reaches_node() {
    let (mut grid, db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(1, "worker-1"));
    wait_registered(&grid, &agent).await;

    db.set_fail_writes(true);
    let err = grid
        .dispatcher
        .submit_job(&alice(), JobSubmission::from_commands(["true"]), None)
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Db(_)));
    assert!(grid.dispatcher.list_jobs().await.is_empty());

    db.set_fail_writes(false);
    let job_id = grid
        .dispatcher
        .submit_job(&alice(), JobSubmission::from_commands(["true"]), None)
        .await
        .unwrap();
    let info = wait_job_done(&grid, job_id).await;
    assert!(info.success);

    grid.shutdown().await;
}

#[tokio::test]
async fn test_task_runs_when_database_writes_fail_after_submit() {
    let (mut grid, db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(1, "worker-1"));
    wait_registered(&grid, &agent).await;

    // Fail once the job is registered but before the node runs it
    grid.dispatcher.set_dispatching_enabled(false).await;
    let job_id = grid
        .dispatcher
        .submit_job(&alice(), JobSubmission::from_commands(["echo done"]), None)
        .await
        .unwrap();
    db.set_fail_writes(true);
    grid.dispatcher.set_dispatching_enabled(true).await;

    let info = wait_job_done(&grid, job_id).await;
    assert_eq!(info.status, JobStatus::Finished);
    assert!(info.success);
    assert!(db.task_record(&job_id, 0).unwrap().result.is_none());

    grid.shutdown().await;
}

#[tokio::test]
async fn test_agent_hands_kill_requests_to_killer() {
    let (mut grid, _db) = start_grid();
    let killer = Arc::new(RecordingKiller::default());
    let agent = grid.spawn_node_with_killer(NodeAgentConfig::new(1, "worker-1"), killer.clone());
    let node_id = wait_registered(&grid, &agent).await;

    let conn = grid.bus.connect();
    conn.send(
        &node_topic(&node_id),
        GridMessage::KillProcessesTree(vec![1234, 5678]),
    )
    .unwrap();

    let k = &killer;
    assert_eventually(
        || async move { k.calls().len() == 2 },
        WAIT,
        "kill requests never reached the killer",
    )
    .await;
    assert_eq!(
        killer.calls(),
        vec![(1234, Signal::SIGKILL), (5678, Signal::SIGKILL)]
    );

    grid.shutdown().await;
}

#[tokio::test]
async fn test_kill_job_terminates_real_process_tree() {
    let (mut grid, _db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(2, "worker-1"));
    wait_registered(&grid, &agent).await;

    // The shell forks a child, so the kill must reach the whole tree
    let job_id = grid
        .dispatcher
        .submit_job(
            &alice(),
            JobSubmission::from_commands(["sleep 30; echo unreachable"]),
            None,
        )
        .await
        .unwrap();
    wait_task_running(&grid, job_id).await;

    tokio::time::timeout(WAIT, grid.dispatcher.kill_job(&alice(), job_id))
        .await
        .expect("kill did not return")
        .unwrap();

    let info = grid.dispatcher.get_job_info(job_id).await.unwrap();
    assert_eq!(info.status, JobStatus::Aborted);
    let task = grid.dispatcher.get_job_result(job_id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Killed);

    grid.shutdown().await;
}

#[tokio::test]
async fn test_agent_reregisters_after_connection_loss() {
    let (mut grid, _db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(2, "worker-1").with_reconnect_interval(50));
    let first_id = wait_registered(&grid, &agent).await;

    assert!(grid.bus.drop_connection(&first_id));

    let dispatcher = &grid.dispatcher;
    let agent_ref = &agent;
    let old = first_id.clone();
    assert_eventually(
        || {
            let old = old.clone();
            async move {
                let Some(id) = agent_ref.node_id().await else {
                    return false;
                };
                let nodes = dispatcher.nodes().await;
                id != old && nodes.len() == 1 && nodes[0].id == id
            }
        },
        WAIT,
        "node agent never re-registered under a new id",
    )
    .await;

    grid.shutdown().await;
}

#[tokio::test]
async fn test_agent_stops_on_shutdown() {
    let (mut grid, _db) = start_grid();
    let agent = grid.spawn_node(NodeAgentConfig::new(1, "worker-1"));
    let node_id = wait_registered(&grid, &agent).await;
    let bus = grid.bus.clone();

    tokio::time::timeout(WAIT, grid.shutdown())
        .await
        .expect("grid did not stop");
    assert!(!bus.is_connected(&node_id));
}

#[tokio::test]
async fn test_dispatcher_sweeps_finished_jobs() {
    let db = Arc::new(MemoryJobDatabase::new());
    let config = GridConfig {
        dispatcher: DispatcherConfig::default().with_finished_job_retention(Some(200)),
        ..Default::default()
    };
    let mut grid = GridContext::start(config, db, None, CancellationToken::new()).unwrap();
    let agent = grid.spawn_node(NodeAgentConfig::new(1, "worker-1"));
    wait_registered(&grid, &agent).await;

    let job_id = grid
        .dispatcher
        .submit_job(&alice(), JobSubmission::from_commands(["true"]), None)
        .await
        .unwrap();
    wait_job_done(&grid, job_id).await;

    let dispatcher = &grid.dispatcher;
    assert_eventually(
        || async move { dispatcher.list_jobs().await.is_empty() },
        WAIT,
        "finished job never left the dispatcher",
    )
    .await;
    let info = grid.dispatcher.get_job_info(job_id).await.unwrap();
    assert_eq!(info.status, JobStatus::Finished);
    assert!(info.success);

    grid.shutdown().await;
}
