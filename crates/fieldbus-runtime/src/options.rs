//! 总线与设备配置
//!
//! 配置对象在构造总线/设备时一次性传入，运行期间只读。
//! 文件/环境变量解析由调用方完成，不属于运行时层。

use std::time::Duration;

/// 总线驱动模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusMode {
    /// 异步：总线自带接收/发送/健康检查三个工作线程
    #[default]
    Asynchronous,
    /// 同步：无内部线程，由外部循环（通常是 [`BusManager`](crate::BusManager)）驱动收发
    Synchronous,
}

/// 总线配置
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// 总线名称（日志与线程名前缀）
    pub name: String,
    /// 驱动模式
    pub mode: BusMode,
    /// 被动状态下收到第一帧时自动激活总线
    pub activate_bus_on_reception: bool,
    /// 以被动状态启动（出队的帧不写入驱动）
    pub start_passive: bool,
    /// 发送队列容量上限，到达后新帧被丢弃
    pub max_queue_size: usize,
    /// 健康检查周期；`Duration::ZERO` 禁用健康检查线程
    pub sanity_check_interval: Duration,
    /// 接收线程的 SCHED_FIFO 实时优先级；`None` 不设置
    pub priority_receive_thread: Option<u8>,
    /// 发送线程的 SCHED_FIFO 实时优先级
    pub priority_transmit_thread: Option<u8>,
    /// 健康检查线程的 SCHED_FIFO 实时优先级
    pub priority_sanity_check_thread: Option<u8>,
}

impl BusOptions {
    /// 默认配置：异步、非被动、队列上限 1000、健康检查 10Hz、不设实时优先级
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: BusMode::Asynchronous,
            activate_bus_on_reception: false,
            start_passive: false,
            max_queue_size: 1000,
            sanity_check_interval: Duration::from_millis(100),
            priority_receive_thread: None,
            priority_transmit_thread: None,
            priority_sanity_check_thread: None,
        }
    }
}

/// 设备配置
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// CAN 节点号
    pub node_id: u32,
    /// 人类可读的设备名
    pub name: String,
    /// 连续多少次健康检查没有收到该设备的帧后判定为 missing；0 禁用
    ///
    /// maxDeviceTimeoutCounter = 超时时间 [s] × 健康检查频率 [Hz]
    pub max_device_timeout_counter: u32,
}

impl DeviceOptions {
    pub fn new(node_id: u32, name: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            max_device_timeout_counter: 20,
        }
    }
}

/// CANopen 设备配置
#[derive(Debug, Clone)]
pub struct CanOpenDeviceOptions {
    /// 基础设备配置
    pub device: DeviceOptions,
    /// SDO 应答超时的健康检查次数门限；0 禁用 SDO 超时检查
    pub max_sdo_timeout_counter: u32,
    /// 单条 SDO 的最大发送次数（首发 + 重试）
    pub max_sdo_sent_counter: u32,
    /// 设备的 producer heartbeat 周期 [ms]；0 表示设备不发心跳，
    /// NMT 命令直接更新本地状态
    pub producer_heart_beat_time: u16,
}

impl CanOpenDeviceOptions {
    pub fn new(node_id: u32, name: impl Into<String>) -> Self {
        Self {
            device: DeviceOptions::new(node_id, name),
            max_sdo_timeout_counter: 1,
            max_sdo_sent_counter: 10,
            producer_heart_beat_time: 0,
        }
    }

    /// 按秒和健康检查频率换算 SDO 超时门限
    pub fn set_sdo_timeout(&mut self, timeout_secs: f64, sanity_rate_hz: f64) {
        self.max_sdo_timeout_counter = (timeout_secs * sanity_rate_hz) as u32;
    }
}
