//! 端到端 team 流程：创建 → spawn → 任务依赖 → 关闭 → 清理

use agent_teams::{
    CallerContext, DisplayMode, ExecuteResult, MemberRole, TeamCoordinator, TeamsConfig,
};
use serde_json::{json, Value};
use tempfile::TempDir;

const SESSION: &str = "session-workflow";

fn create_test_coordinator() -> (TeamCoordinator, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = TeamsConfig {
        data_dir: temp_dir.path().join("teams"),
        ack_timeout_ms: 2_000,
        default_display_mode: DisplayMode::InProcess,
        tmux_program: "definitely-not-tmux-xyz".to_string(),
        ..Default::default()
    };
    (TeamCoordinator::from_config(config), temp_dir)
}

async fn run(
    coordinator: &TeamCoordinator,
    caller: &CallerContext,
    params: Value,
) -> ExecuteResult {
    coordinator.execute_json(caller, params).await.unwrap()
}

fn task_titles(result: &ExecuteResult) -> Vec<String> {
    result.result.as_ref().unwrap()["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["title"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_alpha_team_full_lifecycle() {
    let (coordinator, temp) = create_test_coordinator();
    let lead = CallerContext::lead(SESSION);

    // 创建 team "alpha"
    let created = run(
        &coordinator,
        &lead,
        json!({"team_action": "create", "name": "alpha", "work_dir": temp.path()}),
    )
    .await;
    assert!(created.success, "{}", created.message);
    let team_id = created.result.unwrap()["team_id"].as_str().unwrap().to_string();

    // spawn 两个 teammate（tmux 不可用也不影响）
    let spawned = run(
        &coordinator,
        &lead,
        json!({
            "team_action": "spawn",
            "team_id": team_id,
            "teammates": [{"name": "member1"}, {"name": "member2"}],
        }),
    )
    .await;
    assert!(spawned.success, "{}", spawned.message);
    let spawned = spawned.result.unwrap();
    let member1 = spawned["teammates"][0]["member_id"].as_str().unwrap().to_string();
    let member2 = spawned["teammates"][1]["member_id"].as_str().unwrap().to_string();
    let caller1 = CallerContext::member(&team_id, &member1, MemberRole::Teammate);
    let caller2 = CallerContext::member(&team_id, &member2, MemberRole::Teammate);

    // 任务 A 无依赖，任务 B 依赖 A
    let a = run(
        &coordinator,
        &lead,
        json!({"team_action": "task_create", "team_id": team_id, "title": "A"}),
    )
    .await;
    assert!(a.success);
    let a_id = a.result.unwrap()["task"]["id"].as_str().unwrap().to_string();
    let b = run(
        &coordinator,
        &lead,
        json!({
            "team_action": "task_create",
            "team_id": team_id,
            "title": "B",
            "dependencies": [a_id]
        }),
    )
    .await;
    assert!(b.success);
    let b_id = b.result.unwrap()["task"]["id"].as_str().unwrap().to_string();

    let available = json!({"team_action": "task_list", "team_id": team_id, "filter": "available"});
    assert_eq!(task_titles(&run(&coordinator, &lead, available.clone()).await), vec!["A"]);

    // member1 认领并完成 A
    let claim_a = run(
        &coordinator,
        &caller1,
        json!({
            "team_action": "task_update",
            "team_id": team_id,
            "task_id": a_id,
            "action": "claim"
        }),
    )
    .await;
    assert!(claim_a.success, "{}", claim_a.message);
    let complete_a = run(
        &coordinator,
        &caller1,
        json!({
            "team_action": "task_update",
            "team_id": team_id,
            "task_id": a_id,
            "action": "complete",
            "result": {"summary": "parser done"},
        }),
    )
    .await;
    assert!(complete_a.success, "{}", complete_a.message);
    assert_eq!(task_titles(&run(&coordinator, &lead, available.clone()).await), vec!["B"]);

    // member2 认领并完成 B
    for action in ["claim", "complete"] {
        let result = run(
            &coordinator,
            &caller2,
            json!({
                "team_action": "task_update",
                "team_id": team_id,
                "task_id": b_id,
                "action": action
            }),
        )
        .await;
        assert!(result.success, "{}", result.message);
    }

    let completed = run(
        &coordinator,
        &lead,
        json!({"team_action": "task_list", "team_id": team_id, "filter": "completed"}),
    )
    .await;
    assert_eq!(task_titles(&completed), vec!["A", "B"]);

    // 关闭两个 teammate 后清理
    for member in [&member1, &member2] {
        let result = run(
            &coordinator,
            &lead,
            json!({"team_action": "shutdown", "team_id": team_id, "member_id": member}),
        )
        .await;
        assert!(result.success, "{}", result.message);
    }

    let cleanup = run(
        &coordinator,
        &lead,
        json!({"team_action": "cleanup", "team_id": team_id}),
    )
    .await;
    assert!(cleanup.success, "{}", cleanup.message);
    assert!(!coordinator.store().team_exists(&team_id));
    assert!(coordinator.broker(&team_id).await.is_none());

    let teams = run(&coordinator, &lead, json!({"team_action": "list_teams"})).await;
    assert!(teams.result.unwrap()["teams"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_release_then_claim_by_other_member() {
    let (coordinator, temp) = create_test_coordinator();
    let lead = CallerContext::lead(SESSION);

    let created = run(
        &coordinator,
        &lead,
        json!({"team_action": "create", "name": "beta", "work_dir": temp.path()}),
    )
    .await;
    let team_id = created.result.unwrap()["team_id"].as_str().unwrap().to_string();
    let spawned = run(
        &coordinator,
        &lead,
        json!({
            "team_action": "spawn",
            "team_id": team_id,
            "teammates": [{"name": "x"}, {"name": "y"}]
        }),
    )
    .await
    .result
    .unwrap();
    let x = spawned["teammates"][0]["member_id"].as_str().unwrap().to_string();
    let y = spawned["teammates"][1]["member_id"].as_str().unwrap().to_string();
    let caller_x = CallerContext::member(&team_id, &x, MemberRole::Teammate);
    let caller_y = CallerContext::member(&team_id, &y, MemberRole::Teammate);

    run(
        &coordinator,
        &lead,
        json!({"team_action": "task_create", "team_id": team_id, "title": "T"}),
    )
    .await;
    let update = |action: &str| {
        json!({
            "team_action": "task_update",
            "team_id": team_id,
            "task_id": "1",
            "action": action
        })
    };

    assert!(run(&coordinator, &caller_x, update("claim")).await.success);
    // y 不能释放 x 的任务
    assert!(!run(&coordinator, &caller_y, update("release")).await.success);
    assert!(run(&coordinator, &caller_x, update("release")).await.success);

    let claimed = run(&coordinator, &caller_y, update("claim")).await;
    assert!(claimed.success, "{}", claimed.message);
    assert_eq!(claimed.result.unwrap()["task"]["assignee"], y.as_str());

    coordinator.shutdown_brokers().await;
}

#[tokio::test]
async fn test_teammate_spawn_always_denied_lead_succeeds() {
    let (coordinator, temp) = create_test_coordinator();
    let lead = CallerContext::lead(SESSION);
    let created = run(
        &coordinator,
        &lead,
        json!({"team_action": "create", "name": "gamma", "work_dir": temp.path()}),
    )
    .await;
    let team_id = created.result.unwrap()["team_id"].as_str().unwrap().to_string();

    let spawn = json!({
        "team_action": "spawn",
        "team_id": team_id,
        "teammates": [{"name": "helper"}]
    });
    let by_lead = run(&coordinator, &lead, spawn.clone()).await;
    assert!(by_lead.success, "{}", by_lead.message);
    let helper = by_lead.result.unwrap()["teammates"][0]["member_id"]
        .as_str()
        .unwrap()
        .to_string();

    let teammate = CallerContext::member(&team_id, &helper, MemberRole::Teammate);
    let denied = run(&coordinator, &teammate, spawn).await;
    assert!(!denied.success);
    assert!(denied.message.starts_with("Permission denied"));

    // 被拒绝的 spawn 没有新增成员
    let team = coordinator.store().get_team(&team_id).unwrap();
    assert_eq!(team.members.len(), 2);

    coordinator.shutdown_brokers().await;
}
