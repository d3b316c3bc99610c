//! 总线管理器
//!
//! [`BusManager`] 拥有一组总线（有序），提供跨总线的同步操作：
//! 全局 SYNC 广播、同步模式总线的收/发/健康检查泵送、
//! 以及关停时先停线程再析构的顺序保证。

use crate::bus::CanBus;
use crate::error::BusError;
use fieldbus_can::{CanError, CanFrame, CanTransport};
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use tracing::{info, warn};

/// 管理器对总线的对象安全视图
///
/// [`CanBus`] 对每种传输类型实现本 trait；管理器通过它持有
/// 不同传输类型的总线混合集合。
pub trait ManagedBus: Send {
    fn name(&self) -> &str;
    fn init_bus(&mut self) -> Result<(), BusError>;
    fn is_asynchronous(&self) -> bool;
    fn is_passive(&self) -> bool;
    fn is_missing_device_or_has_error(&self) -> bool;
    fn all_devices_active(&self) -> bool;

    /// 入队一帧 SYNC（入队在该总线的队列锁内一步完成）
    fn send_sync(&self);

    /// 同步模式：写出队首帧（见 [`CanBus::write_message`]）
    fn write_message(&mut self) -> Result<bool, CanError>;

    /// 同步模式：读取并分发一帧
    fn read_message(&mut self) -> bool;

    /// 一轮设备健康检查
    fn sanity_check(&self);

    /// 等待发送队列排空，返回时持有队列锁
    fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<CanFrame>>;

    /// 停止工作线程
    fn stop_threads(&mut self, wait: bool);
}

impl<T: CanTransport> ManagedBus for CanBus<T> {
    fn name(&self) -> &str {
        CanBus::name(self)
    }

    fn init_bus(&mut self) -> Result<(), BusError> {
        CanBus::init_bus(self)
    }

    fn is_asynchronous(&self) -> bool {
        CanBus::is_asynchronous(self)
    }

    fn is_passive(&self) -> bool {
        CanBus::is_passive(self)
    }

    fn is_missing_device_or_has_error(&self) -> bool {
        CanBus::is_missing_device_or_has_error(self)
    }

    fn all_devices_active(&self) -> bool {
        CanBus::all_devices_active(self)
    }

    fn send_sync(&self) {
        CanBus::send_sync(self)
    }

    fn write_message(&mut self) -> Result<bool, CanError> {
        CanBus::write_message(self)
    }

    fn read_message(&mut self) -> bool {
        CanBus::read_message(self)
    }

    fn sanity_check(&self) {
        CanBus::sanity_check(self)
    }

    fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<CanFrame>> {
        CanBus::wait_for_empty_queue(self)
    }

    fn stop_threads(&mut self, wait: bool) {
        CanBus::stop_threads(self, wait)
    }
}

/// 总线注册表
///
/// 独占拥有其总线。析构时调用 [`close_buses`](Self::close_buses)，
/// 保证接收线程先于任何回调目标对象销毁。
#[derive(Default)]
pub struct BusManager {
    buses: Vec<Box<dyn ManagedBus>>,
}

impl BusManager {
    pub fn new() -> Self {
        Self { buses: Vec::new() }
    }

    /// 接管一条总线并初始化
    ///
    /// 初始化失败时总线被丢弃，错误原样返回。
    pub fn add_bus<T: CanTransport>(&mut self, mut bus: CanBus<T>) -> Result<(), BusError> {
        bus.init_bus()?;
        info!("Bus '{}' added to manager", ManagedBus::name(&bus));
        self.buses.push(Box::new(bus));
        Ok(())
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn get_bus(&self, index: usize) -> Option<&dyn ManagedBus> {
        self.buses.get(index).map(|bus| bus.as_ref())
    }

    pub fn get_bus_mut(&mut self, index: usize) -> Option<&mut (dyn ManagedBus + 'static)> {
        self.buses.get_mut(index).map(|bus| bus.as_mut())
    }

    /// 在所有总线上入队一帧 SYNC
    ///
    /// 每条总线的入队是队列锁内的一步操作，SYNC 不会与该总线上的
    /// 其他生产者交错。
    pub fn send_sync_on_all_buses(&self) {
        for bus in &self.buses {
            bus.send_sync();
        }
    }

    /// 把所有同步模式总线的发送队列写空
    ///
    /// 写错误的总线中止本轮冲刷（帧保留在队首），记录警告后继续
    /// 处理下一条总线。
    pub fn write_messages_synchronous(&mut self) {
        for bus in &mut self.buses {
            if bus.is_asynchronous() {
                continue;
            }
            loop {
                match bus.write_message() {
                    Ok(true) => {},
                    Ok(false) => break,
                    Err(e) => {
                        warn!("Write error on bus '{}': {}", bus.name(), e);
                        break;
                    },
                }
            }
        }
    }

    /// 对每条同步模式总线做一次读取
    pub fn read_messages_synchronous(&mut self) {
        for bus in &mut self.buses {
            if !bus.is_asynchronous() {
                bus.read_message();
            }
        }
    }

    /// 对每条同步模式总线做一轮健康检查
    pub fn sanity_check_synchronous(&mut self) {
        for bus in &mut self.buses {
            if !bus.is_asynchronous() {
                bus.sanity_check();
            }
        }
    }

    /// 所有总线上的所有设备是否都在线
    pub fn all_devices_active(&self) -> bool {
        self.buses.iter().all(|bus| bus.all_devices_active())
    }

    /// 是否有任一总线报告设备缺失或错误
    pub fn is_missing_device_or_has_error(&self) -> bool {
        self.buses
            .iter()
            .any(|bus| bus.is_missing_device_or_has_error())
    }

    /// 停止并销毁所有总线
    ///
    /// 先停掉每条总线的线程再析构总线对象，避免接收线程在关停
    /// 过程中调用已经销毁的回调目标。
    pub fn close_buses(&mut self) {
        for bus in &mut self.buses {
            bus.stop_threads(true);
        }
        self.buses.clear();
    }
}

impl Drop for BusManager {
    fn drop(&mut self) {
        self.close_buses();
    }
}
