//! 并发认领：多个独立 Store 实例（模拟独立进程）争抢同一任务

use agent_teams::team::model::{MemberDraft, TaskDraft};
use agent_teams::{TaskStatus, TeamError, TeamStore};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

#[test]
fn test_concurrent_claim_has_exactly_one_winner() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("teams");
    let store = TeamStore::new(&root);
    let team = store.create_team("race", "session-race", temp.path()).unwrap();

    let contenders = 8;
    let mut member_ids = Vec::new();
    for i in 0..contenders {
        let member = store
            .add_member(
                &team.id,
                MemberDraft {
                    name: format!("worker-{}", i),
                    ..Default::default()
                },
            )
            .unwrap();
        member_ids.push(member.id);
    }
    let task = store
        .create_task(
            &team.id,
            TaskDraft {
                title: "contested".to_string(),
                ..Default::default()
            },
            &team.lead_member_id,
        )
        .unwrap();

    let barrier = Arc::new(Barrier::new(contenders));
    let handles: Vec<_> = member_ids
        .into_iter()
        .map(|member_id| {
            let barrier = barrier.clone();
            let root = root.clone();
            let team_id = team.id.clone();
            let task_id = task.id.clone();
            thread::spawn(move || {
                let store = TeamStore::new(root);
                barrier.wait();
                (member_id.clone(), store.claim_task(&team_id, &task_id, &member_id))
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners: Vec<&String> = results
        .iter()
        .filter(|(_, r)| r.is_ok())
        .map(|(id, _)| id)
        .collect();

    assert_eq!(winners.len(), 1);
    assert!(results
        .iter()
        .filter(|(_, r)| r.is_err())
        .all(|(_, r)| matches!(r, Err(TeamError::Conflict(_)))));

    let stored = store.get_task(&team.id, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::InProgress);
    assert_eq!(stored.assignee.as_ref(), Some(winners[0]));
}

#[test]
fn test_concurrent_task_creation_allocates_unique_ids() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("teams");
    let team = TeamStore::new(&root)
        .create_team("ids", "session-ids", temp.path())
        .unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let root = root.clone();
            let team_id = team.id.clone();
            let lead = team.lead_member_id.clone();
            thread::spawn(move || {
                TeamStore::new(root)
                    .create_task(
                        &team_id,
                        TaskDraft {
                            title: format!("task {}", i),
                            ..Default::default()
                        },
                        &lead,
                    )
                    .unwrap()
                    .id
            })
        })
        .collect();

    let mut ids: Vec<u32> = handles
        .into_iter()
        .map(|h| h.join().unwrap().parse().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);

    let team = TeamStore::new(&root).get_team(&team.id).unwrap();
    assert_eq!(team.tasks.len(), 6);
}
