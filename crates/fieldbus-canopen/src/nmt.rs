//! NMT（Network Management）状态与命令
//!
//! 状态机语义：
//! - 初始状态为 `Initializing`
//! - 心跳帧（0x700 + nodeId）第一个数据字节携带节点当前状态
//! - `Missing` 不在线上出现，由本地 sanity check 在节点超时后进入

use crate::ProtocolError;
use crate::ids::NMT_COMMAND_ID;
use fieldbus_can::CanFrame;
use std::sync::atomic::{AtomicU8, Ordering};

/// 节点的 NMT 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtState {
    /// 上电 / 复位后的初始状态
    Initializing = 0,
    /// 节点被停止，只响应 NMT
    Stopped = 1,
    /// 可配置状态（SDO 可用，PDO 不可用）
    PreOperational = 2,
    /// 运行状态（PDO 可用）
    Operational = 3,
    /// 本地判定：超过超时时间没有节点的任何生命迹象
    Missing = 4,
}

impl NmtState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NmtState::Initializing,
            1 => NmtState::Stopped,
            2 => NmtState::PreOperational,
            3 => NmtState::Operational,
            _ => NmtState::Missing,
        }
    }
}

/// 原子的 NMT 状态
///
/// 状态由接收线程（心跳解析）写、任意线程读，用单个 AtomicU8 承载。
#[derive(Debug)]
pub struct AtomicNmtState(AtomicU8);

impl AtomicNmtState {
    pub fn new(state: NmtState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> NmtState {
        // Relaxed: 状态是独立标量，读侧不依赖其他内存的顺序
        NmtState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, state: NmtState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }
}

impl Default for AtomicNmtState {
    fn default() -> Self {
        Self::new(NmtState::Initializing)
    }
}

/// NMT 命令码（CiA 301）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NmtCommand {
    StartRemoteDevice = 0x01,
    StopRemoteDevice = 0x02,
    EnterPreOperational = 0x80,
    RestartRemoteDevice = 0x81,
    ResetCommunication = 0x82,
}

/// 构建 NMT 命令帧
///
/// 2 字节数据：`[命令码, 目标节点号]`，COB-ID 固定为 0x000。
pub fn nmt_command_frame(command: NmtCommand, node_id: u8) -> CanFrame {
    CanFrame::new_standard(NMT_COMMAND_ID as u16, &[command as u8, node_id])
}

/// 心跳帧的状态字节编码（CiA 301）
const HEARTBEAT_BOOTUP: u8 = 0x00;
const HEARTBEAT_STOPPED: u8 = 0x04;
const HEARTBEAT_OPERATIONAL: u8 = 0x05;
const HEARTBEAT_PRE_OPERATIONAL: u8 = 0x7F;

/// 解析心跳帧
///
/// 返回帧中携带的节点状态；状态字节不在已定义编码内时返回 `Ok(None)`
/// （视为无状态变化）。
pub fn parse_heartbeat(frame: &CanFrame) -> Result<Option<NmtState>, ProtocolError> {
    if frame.len < 1 {
        return Err(ProtocolError::InvalidLength {
            expected: 1,
            actual: frame.len as usize,
        });
    }

    let state = match frame.read_u8(0) {
        HEARTBEAT_BOOTUP => Some(NmtState::Initializing),
        HEARTBEAT_STOPPED => Some(NmtState::Stopped),
        HEARTBEAT_OPERATIONAL => Some(NmtState::Operational),
        HEARTBEAT_PRE_OPERATIONAL => Some(NmtState::PreOperational),
        _ => None,
    };

    Ok(state)
}
