//! Teammate 端 broker 客户端

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::protocol::{self, ClientFrame, ServerFrame};
use crate::error::{Result, TeamError};
use crate::team::model::{MessageType, TeamMessage};

/// 连接到 lead broker 的 teammate 客户端
pub struct TeammateClient {
    member_id: String,
    team_id: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TeammateClient {
    /// 连接 broker 并注册成员身份
    pub async fn connect(port: u16, member_id: &str) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port))
            .await
            .map_err(|e| {
                TeamError::Broker(format!("Failed to connect to broker on port {}: {}", port, e))
            })?;
        let (read_half, writer) = stream.into_split();

        let mut client = Self {
            member_id: member_id.to_string(),
            team_id: String::new(),
            lines: BufReader::new(read_half).lines(),
            writer,
        };

        client
            .write_frame(&ClientFrame::Register {
                member_id: member_id.to_string(),
            })
            .await?;

        match client.read_frame().await? {
            Some(ServerFrame::Registered { team_id, .. }) => {
                client.team_id = team_id;
                info!(
                    team_id = %client.team_id,
                    member_id = %member_id,
                    port,
                    "Connected to team broker"
                );
                Ok(client)
            }
            Some(ServerFrame::Error { message }) => Err(TeamError::Broker(message)),
            Some(other) => Err(TeamError::Broker(format!(
                "Unexpected frame before registration: {:?}",
                other
            ))),
            None => Err(TeamError::Broker("Broker closed the connection".to_string())),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn team_id(&self) -> &str {
        &self.team_id
    }

    async fn write_frame(&mut self, frame: &ClientFrame) -> Result<()> {
        let line = protocol::encode(frame)?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| TeamError::Broker(format!("Broker write failed: {}", e)))
    }

    async fn read_frame(&mut self) -> Result<Option<ServerFrame>> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| TeamError::Broker(format!("Broker read failed: {}", e)))?;
            match line {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return protocol::decode(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    /// 等待下一条消息，连接关闭时返回 `None`
    pub async fn recv(&mut self) -> Result<Option<TeamMessage>> {
        while let Some(frame) = self.read_frame().await? {
            match frame {
                ServerFrame::Deliver { message } => return Ok(Some(message)),
                ServerFrame::Error { message } => {
                    warn!(member_id = %self.member_id, error = %message, "Broker reported error");
                }
                ServerFrame::Registered { .. } => {}
            }
        }
        Ok(None)
    }

    /// 确认收到消息
    pub async fn ack(&mut self, message_id: &str) -> Result<()> {
        self.write_frame(&ClientFrame::Ack {
            message_id: message_id.to_string(),
        })
        .await
    }

    /// 经 broker 发送消息
    pub async fn send(&mut self, to: &str, content: &str, message_type: MessageType) -> Result<()> {
        self.write_frame(&ClientFrame::Send {
            to: to.to_string(),
            content: content.to_string(),
            message_type,
        })
        .await
    }

    /// 确认每条收到的消息，直到收到 shutdown 消息或连接关闭，返回处理的消息数
    pub async fn run_auto_ack(mut self) -> Result<usize> {
        let mut handled = 0;
        while let Some(message) = self.recv().await? {
            debug!(
                member_id = %self.member_id,
                message_id = %message.id,
                from = %message.from,
                "Teammate received message"
            );
            self.ack(&message.id).await?;
            handled += 1;

            if message.message_type == MessageType::Shutdown {
                info!(member_id = %self.member_id, "Shutdown message received, leaving broker");
                break;
            }
        }
        Ok(handled)
    }
}
