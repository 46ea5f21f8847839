//! Agent Teams CLI
//!
//! 通过 Coordinator 执行 team 命令，或作为 teammate 连接 lead 的 broker

use agent_teams::config::{ENV_BROKER_PORT, ENV_MEMBER_ID};
use agent_teams::{
    CallerContext, ExecuteResult, MessageType, TeamCommand, TeamCoordinator, TeammateClient,
    TeamsConfig,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Read;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "teams")]
#[command(about = "Agent Teams - 协调 lead 与 teammate 进程")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 执行一条 team 命令（JSON，省略时从 stdin 读取）
    Exec {
        /// 形如 {"team_action": "create", "name": "alpha"} 的命令
        params: Option<String>,
    },
    /// lead 会话：逐行读取 stdin 中的 JSON 命令，broker 在会话期间保持运行
    Serve,
    /// 作为 teammate 连接 broker，打印并确认收到的消息
    Teammate {
        /// broker 端口（默认读取 AGENT_TEAMS_BROKER_PORT）
        #[arg(long)]
        port: Option<u16>,
        /// 成员 ID（默认读取 AGENT_TEAMS_MEMBER_ID）
        #[arg(long)]
        member_id: Option<String>,
    },
    /// 列出所有 Team
    Teams {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 查看 Team 状态
    Status {
        /// Team ID
        team_id: String,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 控制日志级别，例如: RUST_LOG=debug teams serve
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agent_teams=info,teams=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Exec { params } => {
            let raw = match params {
                Some(raw) => raw,
                None => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let params: serde_json::Value =
                serde_json::from_str(raw.trim()).context("command must be a JSON object")?;

            // exec 结束时 broker 随进程退出，spawn 出的 teammate 会立即失联
            if serde_json::from_value::<TeamCommand>(params.clone())
                .is_ok_and(|command| command.needs_live_session())
            {
                let result = ExecuteResult::failure(concat!(
                    "Validation error: spawn needs a running lead session; ",
                    "send it through `teams serve`"
                ));
                println!("{}", serde_json::to_string_pretty(&result)?);
                std::process::exit(1);
            }

            let coordinator = TeamCoordinator::from_config(TeamsConfig::load());
            let result = coordinator.execute_json(&CallerContext::from_env(), params).await?;
            coordinator.shutdown_brokers().await;

            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            run_session(TeamCoordinator::from_config(TeamsConfig::load())).await?;
        }
        Commands::Teammate { port, member_id } => {
            let port = match port {
                Some(port) => port,
                None => std::env::var(ENV_BROKER_PORT)
                    .with_context(|| format!("{} is not set", ENV_BROKER_PORT))?
                    .parse()
                    .with_context(|| format!("{} is not a valid port", ENV_BROKER_PORT))?,
            };
            let member_id = member_id
                .or_else(|| std::env::var(ENV_MEMBER_ID).ok())
                .ok_or_else(|| anyhow!("{} is not set", ENV_MEMBER_ID))?;

            run_teammate(port, &member_id).await?;
        }
        Commands::Teams { json } => {
            let coordinator = TeamCoordinator::from_config(TeamsConfig::load());
            let teams = coordinator.store().list_teams()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&teams)?);
            } else if teams.is_empty() {
                println!("未发现任何 Team");
            } else {
                println!("发现 {} 个 Team:\n", teams.len());
                for team in teams {
                    println!(
                        "  {} | {} | {}/{} 成员活跃 | {} 任务",
                        team.id,
                        team.name,
                        team.active_members().count(),
                        team.members.len(),
                        team.tasks.len()
                    );
                }
            }
        }
        Commands::Status { team_id, json } => {
            let coordinator = TeamCoordinator::from_config(TeamsConfig::load());
            let report = match coordinator.store().get_team_status(&team_id) {
                Ok(report) => report,
                Err(e) => {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Team: {} ({})", report.name, report.team_id);
                println!("  成员: {}/{} 活跃", report.active_members, report.member_count);
                println!(
                    "  任务: {} 待处理 | {} 进行中 | {} 已完成",
                    report.pending_tasks, report.in_progress_tasks, report.completed_tasks
                );
                println!("  未读消息: {}", report.unread_messages);
                for member in report.members {
                    println!(
                        "    {} | {} | {} | {:?} | 未读 {}",
                        member.name, member.id, member.role, member.status, member.unread_count
                    );
                }
            }
        }
    }

    Ok(())
}

/// 逐行执行 stdin 中的 JSON 命令，每条结果输出一行 JSON
async fn run_session(coordinator: TeamCoordinator) -> Result<()> {
    let caller = CallerContext::from_env();
    let mut stdout = tokio::io::stdout();
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    info!("Team session started (stdio mode)");

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break; // EOF
        }

        let request = line.trim();
        if request.is_empty() {
            continue;
        }

        let result = match serde_json::from_str::<serde_json::Value>(request) {
            Ok(params) => coordinator.execute_json(&caller, params).await?,
            Err(e) => {
                warn!(error = %e, "Failed to parse command line");
                ExecuteResult::failure(format!("Validation error: invalid JSON: {}", e))
            }
        };

        let response = serde_json::to_string(&result)?;
        stdout.write_all(response.as_bytes()).await?;
        stdout.write_all(b"\n").await?;

        // teammate 发给 lead 的实时消息跟在命令结果之后输出
        for message in coordinator.take_all_lead_messages().await {
            let event = serde_json::json!({ "event": "message", "message": message });
            stdout.write_all(event.to_string().as_bytes()).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;
    }

    coordinator.shutdown_brokers().await;
    info!("Team session ended");
    Ok(())
}

/// teammate 主循环：收到的消息以 JSON 行输出，收到 shutdown 后退出
async fn run_teammate(port: u16, member_id: &str) -> Result<()> {
    let mut client = TeammateClient::connect(port, member_id).await?;
    let mut stdout = tokio::io::stdout();

    while let Some(message) = client.recv().await? {
        let line = serde_json::to_string(&message)?;
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;

        client.ack(&message.id).await?;

        if message.message_type == MessageType::Shutdown {
            info!(member_id = %member_id, "Shutdown requested by lead");
            break;
        }
    }

    Ok(())
}
