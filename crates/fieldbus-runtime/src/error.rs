//! 运行时层错误类型定义

use fieldbus_can::CanError;
use fieldbus_canopen::ProtocolError;
use thiserror::Error;

/// 运行时层错误类型
#[derive(Error, Debug)]
pub enum BusError {
    /// CAN 传输错误
    #[error("CAN transport error: {0}")]
    Can(#[from] CanError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 总线已经初始化（重复 init，或初始化后注册回调/设备）
    #[error("Bus '{0}' is already initialized")]
    AlreadyInitialized(String),

    /// 分发表里已存在相同的匹配器
    #[error("Dispatch entry (id=0x{identifier:X}, mask=0x{mask:X}) already registered")]
    DuplicateMatcher { identifier: u32, mask: u32 },

    /// 设备初始化失败
    #[error("Device '{device}' failed to initialize")]
    DeviceInit { device: String },
}
