//! CAN 传输层核心定义
//!
//! 提供统一的 CAN 帧类型与传输接口抽象。当前内置 SocketCAN（Linux）后端，
//! 其他传输（PCAN、IP 隧道等）可以在外部 crate 中实现同样的 trait。
//!
//! 设计分层：
//! - [`CanFrame`]：定长 8 字节的帧值类型，带小端序读写工具
//! - [`CanTransport`] / [`RxTransport`] / [`TxTransport`]：传输能力集，
//!   打开后分离为独立的收/发两半，供总线的接收线程与发送线程并发使用

use thiserror::Error;

#[cfg(target_os = "linux")]
pub mod socketcan;

#[cfg(target_os = "linux")]
pub use socketcan::{SocketCanRx, SocketCanTransport, SocketCanTx};

/// 通用 CAN 帧（CAN 2.0，最大 8 字节数据）
///
/// 设计要点：
/// - Copy trait：零成本复制，适合高频场景
/// - 固定 8 字节数据：避免堆分配
/// - 无生命周期：简化 API
///
/// CANopen 场景下 `id` 即 COB-ID（功能码 + 节点号）。29-bit 扩展帧通过
/// `is_extended` 标记。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// CAN ID（标准帧 11-bit 或扩展帧 29-bit）
    pub id: u32,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; 8],

    /// 有效数据长度 (0-8)
    pub len: u8,

    /// 是否为扩展帧（29-bit ID）
    pub is_extended: bool,
}

impl CanFrame {
    /// 创建标准帧
    pub fn new_standard(id: u16, data: &[u8]) -> Self {
        Self::new(id as u32, data, false)
    }

    /// 创建扩展帧
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id, data, true)
    }

    /// 通用构造器
    fn new(id: u32, data: &[u8], is_extended: bool) -> Self {
        let mut fixed_data = [0u8; 8];
        let len = data.len().min(8);
        fixed_data[..len].copy_from_slice(&data[..len]);

        Self {
            id,
            data: fixed_data,
            len: len as u8,
            is_extended,
        }
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 在字节偏移 `pos` 处写入小端序 u8
    ///
    /// 读写工具只操作数据区，不修改 `len`。偏移越界时 panic（slice 索引检查）。
    pub fn write_u8(&mut self, value: u8, pos: usize) {
        self.data[pos] = value;
    }

    /// 在字节偏移 `pos` 处写入小端序 i8
    pub fn write_i8(&mut self, value: i8, pos: usize) {
        self.data[pos] = value as u8;
    }

    /// 在字节偏移 `pos` 处写入小端序 u16
    pub fn write_u16(&mut self, value: u16, pos: usize) {
        self.data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// 在字节偏移 `pos` 处写入小端序 i16
    pub fn write_i16(&mut self, value: i16, pos: usize) {
        self.data[pos..pos + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// 在字节偏移 `pos` 处写入小端序 u32
    pub fn write_u32(&mut self, value: u32, pos: usize) {
        self.data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// 在字节偏移 `pos` 处写入小端序 i32
    pub fn write_i32(&mut self, value: i32, pos: usize) {
        self.data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// 从字节偏移 `pos` 处读取 u8
    pub fn read_u8(&self, pos: usize) -> u8 {
        self.data[pos]
    }

    /// 从字节偏移 `pos` 处读取 i8
    pub fn read_i8(&self, pos: usize) -> i8 {
        self.data[pos] as i8
    }

    /// 从字节偏移 `pos` 处读取小端序 u16
    pub fn read_u16(&self, pos: usize) -> u16 {
        u16::from_le_bytes([self.data[pos], self.data[pos + 1]])
    }

    /// 从字节偏移 `pos` 处读取小端序 i16
    pub fn read_i16(&self, pos: usize) -> i16 {
        i16::from_le_bytes([self.data[pos], self.data[pos + 1]])
    }

    /// 从字节偏移 `pos` 处读取小端序 u32
    pub fn read_u32(&self, pos: usize) -> u32 {
        u32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }

    /// 从字节偏移 `pos` 处读取小端序 i32
    pub fn read_i32(&self, pos: usize) -> i32 {
        i32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ])
    }
}

/// CAN 传输层统一错误类型
#[derive(Error, Debug)]
pub enum CanError {
    /// IO 底层错误
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    /// 设备相关错误（接口未找到、未启动、配置失败等）
    #[error("Device Error: {0}")]
    Device(#[from] CanDeviceError),

    /// 读取超时（非致命，可以重试）
    #[error("Read timeout")]
    Timeout,

    /// 缓冲区溢出（致命错误）
    #[error("Buffer overflow")]
    BufferOverflow,

    /// 总线关闭（致命错误，需要重启）
    #[error("Bus off")]
    BusOff,

    /// 传输未打开
    #[error("Transport not open")]
    NotOpen,
}

/// 设备错误的结构化分类（不绑定具体后端实现）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDeviceErrorKind {
    Unknown,
    /// 接口不存在
    NotFound,
    /// 权限不足/被拒绝
    AccessDenied,
    /// 解析到无效帧
    InvalidFrame,
    /// 其他驱动/后端错误
    Backend,
}

/// 结构化设备错误：kind + message（保留人类可读信息，供日志/上层策略判断）
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct CanDeviceError {
    pub kind: CanDeviceErrorKind,
    pub message: String,
}

impl CanDeviceError {
    pub fn new(kind: CanDeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// 判断是否为致命错误
    ///
    /// 致命错误表示接口已不可用，重试无意义；非致命错误可以重试或忽略。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            CanDeviceErrorKind::NotFound | CanDeviceErrorKind::AccessDenied
        )
    }
}

impl From<String> for CanDeviceError {
    fn from(message: String) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

impl From<&str> for CanDeviceError {
    fn from(message: &str) -> Self {
        Self::new(CanDeviceErrorKind::Unknown, message)
    }
}

/// RX 传输 Trait（接收线程侧）
///
/// # 语义
/// - **阻塞读取**：直到收到有效数据帧或超时
/// - **短超时**：实现必须配置较短的读超时（毫秒级），
///   调用方依赖 `Err(Timeout)` 定期返回以轮询运行标志
pub trait RxTransport: Send + 'static {
    /// 接收一帧
    ///
    /// # 错误处理
    /// - 超时 → `CanError::Timeout`（可重试）
    /// - 总线关闭 → `CanError::BusOff`（致命）
    fn receive(&mut self) -> Result<CanFrame, CanError>;
}

/// TX 传输 Trait（发送线程侧）
pub trait TxTransport: Send + 'static {
    /// 发送一帧
    ///
    /// # 语义
    /// - **Fire-and-Forget**：写入驱动发送缓冲区即返回
    /// - 失败返回 `Err`，帧由调用方保留并重试
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanError>;
}

/// CAN 传输 Trait
///
/// 总线运行时对底层驱动的全部要求：打开接口，然后分离为独立的
/// RX/TX 两半供收发线程并发访问。
pub trait CanTransport: Send + 'static {
    /// RX 半边类型
    type Rx: RxTransport;

    /// TX 半边类型
    type Tx: TxTransport;

    /// 打开底层接口（绑定 socket、配置过滤器等）
    fn open(&mut self) -> Result<(), CanError>;

    /// 分离为独立的 RX 和 TX 两半
    ///
    /// # 前置条件
    /// - 接口必须已通过 [`open`](Self::open) 打开，否则返回 `CanError::NotOpen`
    ///
    /// # 注意
    /// 此方法会消费 `self`，分离后不能再使用原传输对象。
    fn split(self) -> Result<(Self::Rx, Self::Tx), CanError>;
}
