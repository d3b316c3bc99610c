//! # fieldbus-canopen
//!
//! CANopen 协议定义（无硬件、无线程依赖）
//!
//! ## 模块
//!
//! - `ids`: COB-ID 常量与按节点号计算的工具函数
//! - `nmt`: NMT 状态机类型、NMT 命令帧构建、心跳帧解析
//! - `sdo`: SDO 请求编码与应答解析
//!
//! ## 字节序
//!
//! CANopen 的多字节字段一律使用小端序（Intel 格式），
//! 与 [`fieldbus_can::CanFrame`] 的读写工具一致。

pub mod ids;
pub mod nmt;
pub mod sdo;

// 重新导出常用类型
pub use ids::*;
pub use nmt::{AtomicNmtState, NmtCommand, NmtState, nmt_command_frame, parse_heartbeat};
pub use sdo::{SdoAnswer, SdoCommand, SdoRequest, parse_sdo_answer};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid frame length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid CAN ID: 0x{id:X}")]
    InvalidCanId { id: u32 },

    #[error("Unknown SDO command specifier: 0x{command:02X}")]
    UnknownSdoCommand { command: u8 },
}
