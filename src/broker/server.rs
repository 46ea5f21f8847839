//! Message Broker - 每个 team 一个本地 TCP 端点
//!
//! lead 与 teammate 进程通过 broker 收发消息，broker 跟踪每个接收者的投递/确认状态。
//! broker 不做持久化：重启只会丢失未确认的在途消息，任务状态始终在 Store 中。
//!
//! broker 所在进程的成员（lead）不经过 TCP：发给它的消息进入本地 inbox 并立即确认。
//! 投递记录在全部确认或等待结束后释放，未结束的记录按上限淘汰最旧的。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::protocol::{self, ClientFrame, ServerFrame, TOOL_NAMES};
use crate::error::{Result, TeamError};
use crate::team::model::{
    resolve_recipients, DeliveryInfo, DeliveryStatus, MessageType, TeamMessage, BROADCAST,
};

/// 本地成员 inbox 的容量，超出时丢弃最旧的消息（消息仍保存在 Store 中）
const LOCAL_INBOX_LIMIT: usize = 256;
/// 单个未连接成员的排队上限
const QUEUE_LIMIT: usize = 256;
/// 同时保留的投递记录上限
const DELIVERY_HISTORY_LIMIT: usize = 1024;

/// 带确认发送的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckOutcome {
    pub message_id: String,
    pub deliveries: Vec<DeliveryInfo>,
    /// 是否在全部确认前超时
    pub timed_out: bool,
}

impl AckOutcome {
    pub fn acknowledged(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_acknowledged()).count()
    }

    pub fn unacknowledged(&self) -> Vec<&str> {
        self.deliveries
            .iter()
            .filter(|d| !d.is_acknowledged())
            .map(|d| d.recipient.as_str())
            .collect()
    }

    /// 超时且没有任何接收者确认
    pub fn is_delivery_timeout(&self) -> bool {
        self.timed_out && self.acknowledged() == 0 && !self.deliveries.is_empty()
    }
}

#[derive(Default)]
struct BrokerState {
    /// 团队成员（广播的接收范围）
    roster: Vec<String>,
    connections: HashMap<String, mpsc::UnboundedSender<ServerFrame>>,
    /// 接收者未连接时排队的消息（按发送顺序）
    queued: HashMap<String, VecDeque<TeamMessage>>,
    deliveries: HashMap<String, Vec<DeliveryInfo>>,
    /// 投递记录的创建顺序
    history: VecDeque<String>,
    /// 有调用者在等待确认的消息
    awaiting: HashSet<String>,
    local_member: Option<String>,
    local_inbox: VecDeque<TeamMessage>,
}

impl BrokerState {
    fn on_roster(&self, member_id: &str) -> bool {
        self.roster.iter().any(|m| m == member_id)
    }

    /// 全部确认且无人等待时释放投递记录
    fn release_if_settled(&mut self, message_id: &str) {
        if self.awaiting.contains(message_id) {
            return;
        }
        let settled = self
            .deliveries
            .get(message_id)
            .is_some_and(|infos| infos.iter().all(DeliveryInfo::is_acknowledged));
        if settled {
            self.deliveries.remove(message_id);
        }
    }

    fn enforce_history_limit(&mut self) {
        while self.history.len() > DELIVERY_HISTORY_LIMIT {
            if let Some(oldest) = self.history.pop_front() {
                if !self.awaiting.contains(&oldest) {
                    self.deliveries.remove(&oldest);
                }
            }
        }
    }
}

struct Shared {
    team_id: String,
    state: Mutex<BrokerState>,
    ack_notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // 锁内不会 panic，中毒时直接取回数据
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 投递给一个接收者：本地成员直接收下并确认，已连接则立即发送，否则排队
    fn deliver_to(state: &mut BrokerState, recipient: &str, message: &TeamMessage) {
        if state.local_member.as_deref() == Some(recipient) {
            if state.local_inbox.len() >= LOCAL_INBOX_LIMIT {
                state.local_inbox.pop_front();
            }
            state.local_inbox.push_back(message.clone());
            Self::mark_acknowledged(state, &message.id, recipient);
            return;
        }

        if !state.on_roster(recipient) {
            debug!(
                message_id = %message.id,
                recipient = %recipient,
                "Recipient not on roster, delivery skipped"
            );
            return;
        }

        let sent = state
            .connections
            .get(recipient)
            .map(|tx| tx.send(ServerFrame::Deliver { message: message.clone() }).is_ok())
            .unwrap_or(false);

        if sent {
            Self::mark_delivered(state, &message.id, recipient);
        } else {
            let queue = state.queued.entry(recipient.to_string()).or_default();
            if queue.len() >= QUEUE_LIMIT {
                if let Some(dropped) = queue.pop_front() {
                    warn!(
                        recipient = %recipient,
                        message_id = %dropped.id,
                        "Queue full, dropping oldest message"
                    );
                }
            }
            queue.push_back(message.clone());
        }
    }

    fn mark_delivered(state: &mut BrokerState, message_id: &str, recipient: &str) {
        if let Some(info) = state
            .deliveries
            .get_mut(message_id)
            .and_then(|infos| infos.iter_mut().find(|d| d.recipient == recipient))
        {
            if info.status == DeliveryStatus::Pending {
                info.status = DeliveryStatus::Delivered;
                info.delivered_at = Some(Utc::now());
            }
        }
    }

    fn mark_acknowledged(state: &mut BrokerState, message_id: &str, member_id: &str) -> bool {
        match state
            .deliveries
            .get_mut(message_id)
            .and_then(|infos| infos.iter_mut().find(|d| d.recipient == member_id))
        {
            Some(info) => {
                let now = Utc::now();
                info.status = DeliveryStatus::Acknowledged;
                info.delivered_at.get_or_insert(now);
                info.acknowledged_at = Some(now);
                info.acknowledged_by = Some(member_id.to_string());
                true
            }
            None => false,
        }
    }

    /// 记录并投递消息，返回投递后的状态快照
    ///
    /// `awaiting` 为 true 时记录保留到 `finish_waiting`。
    fn dispatch(&self, message: &TeamMessage, awaiting: bool) -> Vec<DeliveryInfo> {
        let mut state = self.state();
        state
            .deliveries
            .insert(message.id.clone(), message.deliveries.clone());
        state.history.push_back(message.id.clone());
        if awaiting {
            state.awaiting.insert(message.id.clone());
        }

        for info in &message.deliveries {
            Self::deliver_to(&mut state, &info.recipient, message);
        }

        let snapshot = state.deliveries.get(&message.id).cloned().unwrap_or_default();
        state.release_if_settled(&message.id);
        state.enforce_history_limit();
        snapshot
    }

    /// 结束等待并释放投递记录，返回最终状态
    fn finish_waiting(&self, message_id: &str) -> Vec<DeliveryInfo> {
        let mut state = self.state();
        state.awaiting.remove(message_id);
        state.deliveries.remove(message_id).unwrap_or_default()
    }

    fn register(&self, member_id: &str, tx: mpsc::UnboundedSender<ServerFrame>) -> Result<()> {
        let mut state = self.state();
        if !state.on_roster(member_id) {
            return Err(TeamError::not_found("Member", member_id));
        }

        let _ = tx.send(ServerFrame::Registered {
            team_id: self.team_id.clone(),
            member_id: member_id.to_string(),
        });

        // 补发排队消息
        let queued = state.queued.remove(member_id).unwrap_or_default();
        let flushed = queued.len();
        for message in queued {
            if tx.send(ServerFrame::Deliver { message: message.clone() }).is_ok() {
                Self::mark_delivered(&mut state, &message.id, member_id);
            }
        }

        state.connections.insert(member_id.to_string(), tx);
        info!(
            team_id = %self.team_id,
            member_id = %member_id,
            flushed,
            "Teammate connected to broker"
        );
        Ok(())
    }

    fn disconnect(&self, member_id: &str, tx: &mpsc::UnboundedSender<ServerFrame>) {
        let mut state = self.state();
        if state
            .connections
            .get(member_id)
            .is_some_and(|current| current.same_channel(tx))
        {
            state.connections.remove(member_id);
            info!(
                team_id = %self.team_id,
                member_id = %member_id,
                "Teammate disconnected from broker"
            );
        }
    }

    fn acknowledge(&self, message_id: &str, member_id: &str) -> bool {
        let acked = {
            let mut state = self.state();
            let acked = Self::mark_acknowledged(&mut state, message_id, member_id);
            if acked {
                state.release_if_settled(message_id);
            }
            acked
        };

        if acked {
            debug!(
                team_id = %self.team_id,
                message_id = %message_id,
                member_id = %member_id,
                "Message acknowledged"
            );
            self.ack_notify.notify_waiters();
        } else {
            // 等待结束后到达的确认也会走到这里
            debug!(
                team_id = %self.team_id,
                message_id = %message_id,
                member_id = %member_id,
                "Ack for untracked delivery"
            );
        }
        acked
    }

    fn build_message(
        &self,
        from: &str,
        to: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<TeamMessage> {
        let state = self.state();
        if to != BROADCAST && !state.on_roster(to) {
            return Err(TeamError::not_found("Member", to));
        }
        let recipients = resolve_recipients(from, to, state.roster.iter().map(String::as_str));
        Ok(TeamMessage::new(&self.team_id, from, to, content, message_type, &recipients))
    }
}

struct Running {
    port: u16,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Team 消息 broker
pub struct MessageBroker {
    shared: Arc<Shared>,
    ack_timeout: Duration,
    running: Mutex<Option<Running>>,
}

impl MessageBroker {
    pub fn new(team_id: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                team_id: team_id.into(),
                state: Mutex::new(BrokerState::default()),
                ack_notify: Notify::new(),
            }),
            ack_timeout,
            running: Mutex::new(None),
        }
    }

    pub fn team_id(&self) -> &str {
        &self.shared.team_id
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 绑定 127.0.0.1 的动态端口并开始接受连接，重复调用返回同一端口
    pub async fn start(&self) -> Result<u16> {
        if let Some(port) = self.port() {
            return Ok(port);
        }

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TeamError::BrokerStart {
                team_id: self.shared.team_id.clone(),
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();

        let mut running = self.running();
        if let Some(existing) = running.as_ref() {
            // 并发 start 时保留先完成的那个
            return Ok(existing.port);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, self.shared.clone(), shutdown_rx));
        *running = Some(Running {
            port,
            shutdown,
            accept_task,
        });

        info!(team_id = %self.shared.team_id, port, "Message broker started");
        Ok(port)
    }

    /// 停止 broker：关闭监听和所有连接，唤醒等待确认的调用者
    pub async fn stop(&self) {
        let running = self.running().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            running.accept_task.abort();
            let _ = running.accept_task.await;

            self.shared.state().connections.clear();
            self.shared.ack_notify.notify_waiters();
            info!(team_id = %self.shared.team_id, port = running.port, "Message broker stopped");
        }
    }

    /// broker 是否处于运行状态
    pub fn is_connected(&self) -> bool {
        self.running().is_some()
    }

    /// 监听任务是否仍在运行
    pub fn is_server_connected(&self) -> bool {
        self.running()
            .as_ref()
            .is_some_and(|r| !r.accept_task.is_finished())
    }

    pub fn port(&self) -> Option<u16> {
        self.running().as_ref().map(|r| r.port)
    }

    pub fn tool_names(&self) -> Vec<String> {
        TOOL_NAMES.iter().map(|s| s.to_string()).collect()
    }

    // ==================== Roster ====================

    pub fn add_member(&self, member_id: &str) {
        let mut state = self.shared.state();
        if !state.on_roster(member_id) {
            state.roster.push(member_id.to_string());
        }
    }

    /// 移除成员并断开其连接
    pub fn remove_member(&self, member_id: &str) {
        let mut state = self.shared.state();
        state.roster.retain(|m| m != member_id);
        state.connections.remove(member_id);
        state.queued.remove(member_id);
    }

    pub fn members(&self) -> Vec<String> {
        self.shared.state().roster.clone()
    }

    /// 已连接（或在 broker 进程内接收）的成员
    pub fn connected_members(&self) -> Vec<String> {
        let state = self.shared.state();
        state
            .roster
            .iter()
            .filter(|m| {
                state.connections.contains_key(*m)
                    || state.local_member.as_deref() == Some(m.as_str())
            })
            .cloned()
            .collect()
    }

    /// 指定在 broker 进程内接收消息的成员（lead），并加入名册
    pub fn attach_local_member(&self, member_id: &str) {
        let mut state = self.shared.state();
        if !state.on_roster(member_id) {
            state.roster.push(member_id.to_string());
        }
        // 之前排队的消息转入本地 inbox
        let queued = state.queued.remove(member_id).unwrap_or_default();
        state.local_member = Some(member_id.to_string());
        for message in queued {
            Shared::deliver_to(&mut state, member_id, &message);
        }
        debug!(team_id = %self.shared.team_id, member_id = %member_id, "Local member attached");
    }

    pub fn local_member(&self) -> Option<String> {
        self.shared.state().local_member.clone()
    }

    /// 取出本地成员收到的消息（按到达顺序）
    pub fn take_local_messages(&self) -> Vec<TeamMessage> {
        self.shared.state().local_inbox.drain(..).collect()
    }

    // ==================== Messaging ====================

    fn ensure_running(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TeamError::Broker(format!(
                "Broker for team '{}' is not running",
                self.shared.team_id
            )))
        }
    }

    /// 构造并投递消息（不等待确认）
    pub fn send_message(&self, from: &str, to: &str, content: &str) -> Result<TeamMessage> {
        let message_type = if to == BROADCAST {
            MessageType::Broadcast
        } else {
            MessageType::Message
        };
        let message = self.shared.build_message(from, to, content, message_type)?;
        self.deliver(&message)?;
        Ok(message)
    }

    /// 投递已构造好的消息，返回当前投递状态
    pub fn deliver(&self, message: &TeamMessage) -> Result<Vec<DeliveryInfo>> {
        self.ensure_running()?;
        let deliveries = self.shared.dispatch(message, false);
        debug!(
            team_id = %self.shared.team_id,
            message_id = %message.id,
            from = %message.from,
            to = %message.to,
            "Message dispatched"
        );
        Ok(deliveries)
    }

    /// 构造、投递并等待确认（使用默认超时）
    pub async fn send_message_with_ack(
        &self,
        from: &str,
        to: &str,
        content: &str,
    ) -> Result<AckOutcome> {
        let message_type = if to == BROADCAST {
            MessageType::Broadcast
        } else {
            MessageType::Message
        };
        let message = self.shared.build_message(from, to, content, message_type)?;
        self.deliver_with_ack(&message, self.ack_timeout).await
    }

    /// 投递并等待全部接收者确认，或超时后返回已收到的确认
    ///
    /// 超时时若有接收者确认则返回部分结果；一个确认都没有时返回 `DeliveryTimeout`。
    pub async fn deliver_with_ack(
        &self,
        message: &TeamMessage,
        timeout: Duration,
    ) -> Result<AckOutcome> {
        let outcome = self.collect_acks(message, timeout).await?;
        if outcome.is_delivery_timeout() {
            return Err(TeamError::DeliveryTimeout(message.id.clone()));
        }
        Ok(outcome)
    }

    /// 投递并收集确认直到全部确认或超时，超时不视为错误
    pub async fn collect_acks(
        &self,
        message: &TeamMessage,
        timeout: Duration,
    ) -> Result<AckOutcome> {
        self.ensure_running()?;
        self.shared.dispatch(message, true);

        let deadline = tokio::time::Instant::now() + timeout;
        let mut timed_out = false;

        loop {
            let notified = self.shared.ack_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.delivery_info(&message.id).unwrap_or_default();
            if snapshot.iter().all(DeliveryInfo::is_acknowledged) {
                break;
            }
            if !self.is_connected() {
                timed_out = true;
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                timed_out = true;
                break;
            }
        }

        let outcome = AckOutcome {
            message_id: message.id.clone(),
            deliveries: self.shared.finish_waiting(&message.id),
            timed_out,
        };

        if timed_out {
            warn!(
                team_id = %self.shared.team_id,
                message_id = %message.id,
                acknowledged = outcome.acknowledged(),
                expected = outcome.deliveries.len(),
                "Acknowledgment wait timed out"
            );
        }
        Ok(outcome)
    }

    /// 在 broker 侧记录确认（与 teammate 发送 ack 帧等价）
    pub fn acknowledge(&self, message_id: &str, member_id: &str) -> bool {
        self.shared.acknowledge(message_id, member_id)
    }

    /// 查询仍在跟踪的消息的投递状态（全部确认或等待结束后返回 `None`）
    pub fn delivery_info(&self, message_id: &str) -> Option<Vec<DeliveryInfo>> {
        self.shared.state().deliveries.get(message_id).cloned()
    }

    /// 仍在跟踪的投递记录数
    pub fn tracked_deliveries(&self) -> usize {
        self.shared.state().deliveries.len()
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            let _ = running.shutdown.send(true);
            running.accept_task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(team_id = %shared.team_id, peer = %addr, "Broker accepted connection");
                    tokio::spawn(handle_connection(stream, shared.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(team_id = %shared.team_id, error = %e, "Broker accept failed");
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let line = match protocol::encode(&frame) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut member: Option<String> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match protocol::decode::<ClientFrame>(&line) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = tx.send(ServerFrame::Error { message: e.to_string() });
                        continue;
                    }
                };
                handle_frame(&shared, &tx, &mut member, frame);
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Some(member_id) = member {
        shared.disconnect(&member_id, &tx);
    }
    drop(tx);
    let _ = writer.await;
}

fn handle_frame(
    shared: &Shared,
    tx: &mpsc::UnboundedSender<ServerFrame>,
    member: &mut Option<String>,
    frame: ClientFrame,
) {
    let current = member.clone();
    match (frame, current.as_deref()) {
        (ClientFrame::Register { member_id }, _) => match shared.register(&member_id, tx.clone()) {
            Ok(()) => *member = Some(member_id),
            Err(e) => {
                let _ = tx.send(ServerFrame::Error { message: e.to_string() });
            }
        },
        (ClientFrame::Ack { message_id }, Some(member_id)) => {
            shared.acknowledge(&message_id, member_id);
        }
        (ClientFrame::Send { to, content, message_type }, Some(member_id)) => {
            match shared.build_message(member_id, &to, &content, message_type) {
                Ok(message) => {
                    shared.dispatch(&message, false);
                }
                Err(e) => {
                    let _ = tx.send(ServerFrame::Error { message: e.to_string() });
                }
            }
        }
        (_, None) => {
            let _ = tx.send(ServerFrame::Error {
                message: "register before sending other frames".to_string(),
            });
        }
    }
}
