//! 设备抽象
//!
//! 设备是总线上一个节点的本地代理。能力集是三件事：
//! 初始化时注册回调（[`Device::init_device`]）、周期健康检查
//! （[`Device::sanity_check`]）、以及 [`DeviceCore`] 承载的
//! 超时计数。CANopen 行为不走继承，由设备内嵌
//! [`CanOpenNode`](crate::CanOpenNode) 组合获得。

use crate::context::BusSender;
use crate::dispatch::{DispatchTable, FrameCallback, FrameMatcher};
use crate::error::BusError;
use crate::options::DeviceOptions;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// 设备基础状态：节点号、名称、超时计数器
///
/// 计数器由健康检查线程推进、接收线程清零，原子标量承载。
pub struct DeviceCore {
    node_id: u32,
    name: String,
    max_device_timeout_counter: u32,
    device_timeout_counter: AtomicU32,
}

impl DeviceCore {
    pub fn new(options: DeviceOptions) -> Self {
        Self {
            node_id: options.node_id,
            name: options.name,
            max_device_timeout_counter: options.max_device_timeout_counter,
            device_timeout_counter: AtomicU32::new(0),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 清零超时计数器
    ///
    /// 分发层在命中绑定本设备的槽时调用（任何帧都算生命迹象）。
    pub fn reset_timeout_counter(&self) {
        self.device_timeout_counter.store(0, Ordering::Relaxed);
    }

    /// 推进超时计数器
    ///
    /// 每个健康检查周期调用一次。计数器超过
    /// `max_device_timeout_counter` 时返回 `false`（设备超时）。
    /// 门限为 0 时禁用检查，计数器不推进。
    pub fn check_device_timeout(&self) -> bool {
        if self.max_device_timeout_counter == 0 {
            return true;
        }
        let count = self.device_timeout_counter.fetch_add(1, Ordering::Relaxed) + 1;
        count <= self.max_device_timeout_counter
    }
}

/// 设备在 `init_device` 期间拿到的注册接口
///
/// 提供分发表注册与发送句柄。只在初始化回调的生命周期内有效，
/// 设备需要长期发送能力时保存 [`sender`](Self::sender) 的克隆。
pub struct DeviceRegistry<'a> {
    pub(crate) table: &'a mut DispatchTable,
    pub(crate) sender: BusSender,
    pub(crate) device: Arc<dyn Device>,
}

impl DeviceRegistry<'_> {
    /// 总线发送句柄（可克隆、可跨线程保存）
    pub fn sender(&self) -> BusSender {
        self.sender.clone()
    }

    /// 注册与本设备绑定的回调
    ///
    /// 命中时会重置本设备的超时计数器（帧视作心跳）。
    pub fn add_device_message(
        &mut self,
        matcher: FrameMatcher,
        callback: FrameCallback,
    ) -> Result<(), BusError> {
        self.table.add(matcher, Some(self.device.clone()), callback)
    }

    /// 注册不绑定设备的回调（不触碰任何超时计数器）
    pub fn add_message(
        &mut self,
        matcher: FrameMatcher,
        callback: FrameCallback,
    ) -> Result<(), BusError> {
        self.table.add(matcher, None, callback)
    }
}

/// 总线上的设备
///
/// 由 [`CanBus::add_device`](crate::CanBus::add_device) 调用
/// `init_device` 完成接线；之后设备归总线所有，生命周期不超过总线。
pub trait Device: Send + Sync + 'static {
    /// 基础状态访问
    fn core(&self) -> &DeviceCore;

    /// CAN 节点号
    fn node_id(&self) -> u32 {
        self.core().node_id()
    }

    /// 设备名
    fn name(&self) -> &str {
        self.core().name()
    }

    /// 连接到总线时调用一次
    ///
    /// 典型实现：注册解析回调、保存发送句柄、发送初始复位命令。
    fn init_device(self: Arc<Self>, registry: &mut DeviceRegistry<'_>) -> Result<(), BusError>
    where
        Self: Sized;

    /// 周期健康检查
    ///
    /// 以固定频率被调用；返回 `false` 会把总线的
    /// missing-or-error 标志置位。默认实现只推进设备超时计数器。
    fn sanity_check(&self) -> bool {
        self.core().check_device_timeout()
    }

    /// [`CanBus::reset_all_devices`](crate::CanBus::reset_all_devices) 钩子
    ///
    /// 实现应恢复初始状态并向远端发送重启命令。默认无操作。
    fn reset_device(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_limit(limit: u32) -> DeviceCore {
        let mut options = DeviceOptions::new(1, "dev");
        options.max_device_timeout_counter = limit;
        DeviceCore::new(options)
    }

    #[test]
    fn test_timeout_counter_trips_after_limit() {
        let core = core_with_limit(3);
        assert!(core.check_device_timeout()); // 1
        assert!(core.check_device_timeout()); // 2
        assert!(core.check_device_timeout()); // 3
        assert!(!core.check_device_timeout()); // 4 > 3
    }

    #[test]
    fn test_reset_restarts_counting() {
        let core = core_with_limit(2);
        assert!(core.check_device_timeout());
        assert!(core.check_device_timeout());
        core.reset_timeout_counter();
        assert!(core.check_device_timeout());
        assert!(core.check_device_timeout());
        assert!(!core.check_device_timeout());
    }

    #[test]
    fn test_zero_limit_disables_timeout() {
        let core = core_with_limit(0);
        for _ in 0..100 {
            assert!(core.check_device_timeout());
        }
    }
}
