//! CANopen 节点状态机
//!
//! [`CanOpenNode`] 以组合方式给设备提供 CANopen 行为：NMT 状态跟踪、
//! 心跳解析、以及"同一时刻最多一条在途"的 SDO 队列与超时重发。
//! 具体设备类型内嵌一个 `CanOpenNode`，在 `init_device` 里
//! [`attach`](CanOpenNode::attach) 发送句柄并把心跳 / SDO 应答回调
//! 接到分发表上（见集成测试中的示例设备）。

use crate::context::BusSender;
use crate::device::DeviceCore;
use crate::options::CanOpenDeviceOptions;
use fieldbus_can::CanFrame;
use fieldbus_canopen::{
    AtomicNmtState, NmtCommand, NmtState, ProtocolError, SdoAnswer, SdoRequest, nmt,
    nmt_command_frame, sdo,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, error, warn};

/// CANopen 节点状态
///
/// SDO 队列不变量：
/// - 队头最多发送 `max_sdo_sent_counter` 次（首发 + 重试），之后按丢失弹出
/// - NMT 复位类命令清空队列，与状态切换在队列锁内一起完成
pub struct CanOpenNode {
    core: DeviceCore,

    max_sdo_timeout_counter: u32,
    max_sdo_sent_counter: u32,
    producer_heart_beat_time: u16,

    nmt_state: AtomicNmtState,

    /// 队头 SDO 等待应答经历的健康检查次数
    sdo_timeout_counter: AtomicU32,
    /// 队头 SDO 已发送次数
    sdo_sent_counter: AtomicU32,
    sdo_queue: Mutex<VecDeque<SdoRequest>>,

    /// 连接到总线后填充（一次性）
    sender: OnceLock<BusSender>,
}

impl CanOpenNode {
    pub fn new(options: CanOpenDeviceOptions) -> Self {
        Self {
            core: DeviceCore::new(options.device),
            max_sdo_timeout_counter: options.max_sdo_timeout_counter,
            max_sdo_sent_counter: options.max_sdo_sent_counter,
            producer_heart_beat_time: options.producer_heart_beat_time,
            nmt_state: AtomicNmtState::default(),
            sdo_timeout_counter: AtomicU32::new(0),
            sdo_sent_counter: AtomicU32::new(0),
            sdo_queue: Mutex::new(VecDeque::new()),
            sender: OnceLock::new(),
        }
    }

    /// 基础设备状态（节点号、名称、超时计数器）
    pub fn core(&self) -> &DeviceCore {
        &self.core
    }

    /// 连接总线发送句柄，在设备的 `init_device` 里调用一次
    pub fn attach(&self, sender: BusSender) {
        if self.sender.set(sender).is_err() {
            warn!(
                "CANopen node '{}' is already attached to a bus",
                self.core.name()
            );
        }
    }

    fn send_frame(&self, frame: CanFrame) {
        match self.sender.get() {
            Some(sender) => sender.send_message(frame),
            None => error!(
                "CANopen node '{}' is not attached to a bus, dropping frame ID=0x{:X}",
                self.core.name(),
                frame.id
            ),
        }
    }

    // === NMT 状态 ===

    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state.load()
    }

    pub fn is_initializing(&self) -> bool {
        self.nmt_state.load() == NmtState::Initializing
    }

    pub fn is_stopped(&self) -> bool {
        self.nmt_state.load() == NmtState::Stopped
    }

    pub fn is_pre_operational(&self) -> bool {
        self.nmt_state.load() == NmtState::PreOperational
    }

    pub fn is_operational(&self) -> bool {
        self.nmt_state.load() == NmtState::Operational
    }

    pub fn is_missing(&self) -> bool {
        self.nmt_state.load() == NmtState::Missing
    }

    // === NMT 命令 ===
    //
    // enter_pre_operational / reset_communication / restart_remote_device
    // 复位类：清空 SDO 队列并切换本地状态（与清队列同在队列锁内）。
    // start / stop 只在设备不发心跳（producer_heart_beat_time == 0）时
    // 更新本地状态，否则以设备自己的心跳为准。

    /// 请求远端进入 pre-operational 状态
    pub fn enter_pre_operational(&self) {
        let new_state =
            (self.producer_heart_beat_time == 0).then_some(NmtState::PreOperational);
        self.reset_and_send(NmtCommand::EnterPreOperational, new_state);
    }

    /// 启动远端（进入 operational）
    pub fn start_remote_device(&self) {
        self.send_nmt(NmtCommand::StartRemoteDevice);
        if self.producer_heart_beat_time == 0 {
            self.nmt_state.store(NmtState::Operational);
        }
    }

    /// 停止远端
    pub fn stop_remote_device(&self) {
        self.send_nmt(NmtCommand::StopRemoteDevice);
        if self.producer_heart_beat_time == 0 {
            self.nmt_state.store(NmtState::Stopped);
        }
    }

    /// 复位远端的通讯层
    pub fn reset_communication(&self) {
        self.reset_and_send(NmtCommand::ResetCommunication, Some(NmtState::Initializing));
    }

    /// 重启远端设备
    pub fn restart_remote_device(&self) {
        self.reset_and_send(NmtCommand::RestartRemoteDevice, Some(NmtState::Initializing));
    }

    fn send_nmt(&self, command: NmtCommand) {
        self.send_frame(nmt_command_frame(command, self.core.node_id() as u8));
    }

    fn reset_and_send(&self, command: NmtCommand, new_state: Option<NmtState>) {
        let mut queue = self.sdo_queue.lock();
        queue.clear();
        self.sdo_sent_counter.store(0, Ordering::Relaxed);
        self.sdo_timeout_counter.store(0, Ordering::Relaxed);
        if let Some(state) = new_state {
            self.nmt_state.store(state);
        }
        self.send_nmt(command);
    }

    // === 心跳 ===

    /// 解析心跳帧，更新 NMT 状态并重置设备超时计数器
    ///
    /// 未定义的状态字节视为无状态变化，但仍算生命迹象。
    pub fn parse_heartbeat(&self, frame: &CanFrame) -> bool {
        match nmt::parse_heartbeat(frame) {
            Ok(Some(state)) => {
                if state != self.nmt_state.load() {
                    debug!(
                        "Device '{}' NMT state: {:?}",
                        self.core.name(),
                        state
                    );
                }
                self.nmt_state.store(state);
                self.core.reset_timeout_counter();
                true
            },
            Ok(None) => {
                self.core.reset_timeout_counter();
                true
            },
            Err(e) => {
                warn!(
                    "Malformed heartbeat from '{}': {}",
                    self.core.name(),
                    e
                );
                false
            },
        }
    }

    // === SDO ===

    /// 把一条 SDO 追加到队尾
    ///
    /// 队列此前为空时立即发送（发送计数置 1），否则等待前序请求
    /// 完成后由应答/超时路径自动补发。
    pub fn send_sdo(&self, request: SdoRequest) {
        let mut queue = self.sdo_queue.lock();
        queue.push_back(request);
        if queue.len() == 1 {
            self.sdo_sent_counter.store(1, Ordering::Relaxed);
            self.sdo_timeout_counter.store(0, Ordering::Relaxed);
            self.send_frame(request.to_frame());
        }
    }

    /// 解析 SDO 应答帧
    ///
    /// 应答的 (index, sub-index) 与队头一致时弹出队头、清零计数器，
    /// 并立即发送下一条排队请求。读应答作为 `Some(SdoAnswer)` 返回，
    /// 由设备回调处理数据。
    pub fn parse_sdo_answer(
        &self,
        frame: &CanFrame,
    ) -> Result<Option<SdoAnswer>, ProtocolError> {
        let answer = sdo::parse_sdo_answer(frame)?;
        let (index, sub_index) = answer.object();

        let mut queue = self.sdo_queue.lock();
        let Some(front) = queue.front() else {
            warn!(
                "Unexpected SDO answer from '{}' (index=0x{:04X}/{}), no request in flight",
                self.core.name(),
                index,
                sub_index
            );
            return Ok(None);
        };
        if !front.matches(index, sub_index) {
            warn!(
                "Out-of-order SDO answer from '{}': got index=0x{:04X}/{}, expected 0x{:04X}/{}",
                self.core.name(),
                index,
                sub_index,
                front.index,
                front.sub_index
            );
            return Ok(None);
        }

        let was_read = front.is_read_request();
        queue.pop_front();
        self.sdo_sent_counter.store(0, Ordering::Relaxed);
        self.sdo_timeout_counter.store(0, Ordering::Relaxed);

        if let SdoAnswer::Abort { code, .. } = answer {
            warn!(
                "SDO abort from '{}': index=0x{:04X}/{}, code=0x{:08X}",
                self.core.name(),
                index,
                sub_index,
                code
            );
        }

        // 发送下一条排队请求
        if let Some(next) = queue.front().copied() {
            self.sdo_sent_counter.store(1, Ordering::Relaxed);
            self.send_frame(next.to_frame());
        }

        if was_read && matches!(answer, SdoAnswer::ReadResponse { .. }) {
            return Ok(Some(answer));
        }
        Ok(None)
    }

    /// 检查队头 SDO 是否超时，每个健康检查周期调用一次
    ///
    /// 超时计数器超过门限后：发送次数未用尽则重发队头，否则按丢失
    /// 弹出并返回 `false`。门限为 0 时禁用检查。
    pub fn check_sdo_timeout(&self) -> bool {
        if self.max_sdo_timeout_counter == 0 {
            return true;
        }

        let mut queue = self.sdo_queue.lock();
        if queue.is_empty() {
            return true;
        }

        let count = self.sdo_timeout_counter.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= self.max_sdo_timeout_counter {
            return true;
        }

        if self.sdo_sent_counter.load(Ordering::Relaxed) < self.max_sdo_sent_counter {
            self.sdo_sent_counter.fetch_add(1, Ordering::Relaxed);
            if let Some(front) = queue.front().copied() {
                debug!(
                    "Resending SDO to '{}': index=0x{:04X}/{}",
                    self.core.name(),
                    front.index,
                    front.sub_index
                );
                self.send_frame(front.to_frame());
            }
            return true;
        }

        // 重试次数用尽，按丢失丢弃
        let lost = queue.pop_front();
        self.sdo_sent_counter.store(0, Ordering::Relaxed);
        self.sdo_timeout_counter.store(0, Ordering::Relaxed);
        if let Some(lost) = lost {
            warn!(
                "SDO request to '{}' lost after {} attempts: index=0x{:04X}/{}",
                self.core.name(),
                self.max_sdo_sent_counter,
                lost.index,
                lost.sub_index
            );
        }

        if let Some(next) = queue.front().copied() {
            self.sdo_sent_counter.store(1, Ordering::Relaxed);
            self.send_frame(next.to_frame());
        }

        false
    }

    /// CANopen 设备的标准健康检查
    ///
    /// 检查 SDO 超时与设备超时；设备超时时切换到 `Missing` 状态。
    /// 设备的 [`Device::sanity_check`](crate::Device::sanity_check)
    /// 实现直接委托到这里。
    pub fn sanity_check(&self) -> bool {
        let sdo_ok = self.check_sdo_timeout();
        let device_ok = self.core.check_device_timeout();
        if !device_ok && !self.is_missing() {
            warn!(
                "Device '{}' timed out, marking as missing",
                self.core.name()
            );
            self.nmt_state.store(NmtState::Missing);
        }
        sdo_ok && device_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BusContext;
    use std::sync::Arc;

    /// 挂在独立 BusContext 上的节点，帧可以通过 front_frame 取出检查
    fn attached_node(options: CanOpenDeviceOptions) -> (CanOpenNode, Arc<BusContext>) {
        let ctx = Arc::new(BusContext::new("test".into(), 100, false, false));
        let node = CanOpenNode::new(options);
        node.attach(BusSender { ctx: ctx.clone() });
        (node, ctx)
    }

    fn drain_frames(ctx: &BusContext) -> Vec<CanFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = ctx.front_frame() {
            frames.push(frame);
            ctx.pop_front_transmitted();
        }
        frames
    }

    fn heartbeat(node_id: u32, state_octet: u8) -> CanFrame {
        CanFrame::new_standard((0x700 + node_id) as u16, &[state_octet])
    }

    #[test]
    fn test_initial_state_is_initializing() {
        let node = CanOpenNode::new(CanOpenDeviceOptions::new(0x0C, "servo"));
        assert!(node.is_initializing());
    }

    #[test]
    fn test_heartbeat_drives_state_machine() {
        let (node, _ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));

        assert!(node.parse_heartbeat(&heartbeat(0x0C, 0x7F)));
        assert!(node.is_pre_operational());

        assert!(node.parse_heartbeat(&heartbeat(0x0C, 0x05)));
        assert!(node.is_operational());

        assert!(node.parse_heartbeat(&heartbeat(0x0C, 0x04)));
        assert!(node.is_stopped());

        assert!(node.parse_heartbeat(&heartbeat(0x0C, 0x00)));
        assert!(node.is_initializing());
    }

    #[test]
    fn test_heartbeat_unknown_octet_keeps_state() {
        let (node, _ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));
        node.parse_heartbeat(&heartbeat(0x0C, 0x05));
        assert!(node.is_operational());

        // 未定义编码：状态保持，但仍算生命迹象
        assert!(node.parse_heartbeat(&heartbeat(0x0C, 0x42)));
        assert!(node.is_operational());
    }

    #[test]
    fn test_nmt_restart_sends_frame_and_resets_state() {
        let (node, ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));
        node.parse_heartbeat(&heartbeat(0x0C, 0x05));
        node.send_sdo(SdoRequest::read(0x0C, 0x1000, 0));
        drain_frames(&ctx);

        node.restart_remote_device();

        assert!(node.is_initializing());
        let frames = drain_frames(&ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id, 0x000);
        assert_eq!(frames[0].data_slice(), &[0x81, 0x0C]);

        // SDO 队列已清空：后续超时检查不再触发任何发送
        for _ in 0..10 {
            assert!(node.check_sdo_timeout());
        }
        assert!(drain_frames(&ctx).is_empty());
    }

    #[test]
    fn test_start_stop_set_local_state_without_heartbeats() {
        let (node, ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));

        node.start_remote_device();
        assert!(node.is_operational());
        node.stop_remote_device();
        assert!(node.is_stopped());

        let frames = drain_frames(&ctx);
        assert_eq!(frames[0].data_slice(), &[0x01, 0x0C]);
        assert_eq!(frames[1].data_slice(), &[0x02, 0x0C]);
    }

    #[test]
    fn test_start_does_not_set_local_state_with_heartbeats() {
        let mut options = CanOpenDeviceOptions::new(0x0C, "servo");
        options.producer_heart_beat_time = 1000;
        let (node, _ctx) = attached_node(options);

        node.start_remote_device();
        // 心跳是权威来源，本地状态不变
        assert!(node.is_initializing());
    }

    #[test]
    fn test_only_one_sdo_in_flight() {
        let (node, ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));

        node.send_sdo(SdoRequest::write_u32(0x0C, 0x1010, 1, 1));
        node.send_sdo(SdoRequest::write_u32(0x0C, 0x1011, 1, 1));

        // 只有队头被发送
        let frames = drain_frames(&ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].read_u16(1), 0x1010);
    }

    #[test]
    fn test_sdo_answer_pops_head_and_sends_next() {
        let (node, ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));

        node.send_sdo(SdoRequest::write_u32(0x0C, 0x1010, 1, 1));
        node.send_sdo(SdoRequest::read(0x0C, 0x6041, 0));
        drain_frames(&ctx);

        // 写确认 → 弹出队头并自动发送下一条
        let confirm = CanFrame::new_standard(0x58C, &[0x60, 0x10, 0x10, 0x01, 0, 0, 0, 0]);
        assert_eq!(node.parse_sdo_answer(&confirm).unwrap(), None);

        let frames = drain_frames(&ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].read_u16(1), 0x6041);

        // 读应答返回给调用方
        let answer = CanFrame::new_standard(0x58C, &[0x43, 0x41, 0x60, 0x00, 0x37, 0x02, 0, 0]);
        let result = node.parse_sdo_answer(&answer).unwrap();
        assert!(matches!(
            result,
            Some(SdoAnswer::ReadResponse { index: 0x6041, .. })
        ));
    }

    #[test]
    fn test_sdo_answer_for_wrong_object_is_ignored() {
        let (node, ctx) = attached_node(CanOpenDeviceOptions::new(0x0C, "servo"));
        node.send_sdo(SdoRequest::write_u32(0x0C, 0x1010, 1, 1));
        drain_frames(&ctx);

        let wrong = CanFrame::new_standard(0x58C, &[0x60, 0x11, 0x10, 0x01, 0, 0, 0, 0]);
        assert_eq!(node.parse_sdo_answer(&wrong).unwrap(), None);

        // 队头仍在途：超时检查会重发它（默认门限为 1）
        assert!(node.check_sdo_timeout()); // count = 1
        assert!(node.check_sdo_timeout()); // count = 2 → 重发
        let frames = drain_frames(&ctx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].read_u16(1), 0x1010);
    }

    #[test]
    fn test_sdo_retry_then_give_up() {
        let mut options = CanOpenDeviceOptions::new(0x0C, "servo");
        options.max_sdo_sent_counter = 3;
        options.max_sdo_timeout_counter = 1;
        options.device.max_device_timeout_counter = 0;
        let (node, ctx) = attached_node(options);

        node.send_sdo(SdoRequest::write_u32(0x0C, 0x1010, 1, 1));
        assert_eq!(drain_frames(&ctx).len(), 1); // 首发

        assert!(node.sanity_check()); // count = 1，未超门限
        assert_eq!(drain_frames(&ctx).len(), 0);

        assert!(node.sanity_check()); // 重试 1
        assert_eq!(drain_frames(&ctx).len(), 1);

        assert!(node.sanity_check()); // 重试 2（第 3 次发送）
        assert_eq!(drain_frames(&ctx).len(), 1);

        assert!(!node.sanity_check()); // 次数用尽 → 丢弃并报错
        assert_eq!(drain_frames(&ctx).len(), 0);

        // 队列空后恢复正常
        assert!(node.sanity_check());
    }

    #[test]
    fn test_device_timeout_marks_missing() {
        let mut options = CanOpenDeviceOptions::new(0x0C, "servo");
        options.device.max_device_timeout_counter = 2;
        let (node, _ctx) = attached_node(options);

        assert!(node.sanity_check());
        assert!(node.sanity_check());
        assert!(!node.sanity_check());
        assert!(node.is_missing());
    }
}
