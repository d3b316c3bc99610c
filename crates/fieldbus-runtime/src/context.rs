//! 总线共享状态
//!
//! [`BusContext`] 是总线的生产者（用户代码、设备）、发送线程和
//! [`BusManager`](crate::BusManager) 共享的核心：带上限的发送队列、
//! 两个条件变量（非空 / 已排空）以及总线状态标志。
//!
//! 锁次序：队列锁内允许再取溢出节流锁，反向不允许。

use fieldbus_can::CanFrame;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// 队列溢出警告的最小间隔
const OVERFLOW_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// 总线运行时共享状态
pub(crate) struct BusContext {
    name: String,
    max_queue_size: usize,
    activate_bus_on_reception: bool,

    /// 发送队列；只通过本类型的方法访问
    queue: Mutex<VecDeque<CanFrame>>,
    /// 唤醒发送线程（队列非空）
    cond_transmit: Condvar,
    /// 唤醒等待排空的线程（队列为空）
    cond_queue_empty: Condvar,

    running: AtomicBool,
    is_passive: AtomicBool,
    all_devices_active: AtomicBool,
    is_missing_device_or_has_error: AtomicBool,

    /// 溢出警告节流
    last_overflow_warn: Mutex<Option<Instant>>,
}

impl BusContext {
    pub(crate) fn new(
        name: String,
        max_queue_size: usize,
        start_passive: bool,
        activate_bus_on_reception: bool,
    ) -> Self {
        Self {
            name,
            max_queue_size,
            activate_bus_on_reception,
            queue: Mutex::new(VecDeque::new()),
            cond_transmit: Condvar::new(),
            cond_queue_empty: Condvar::new(),
            running: AtomicBool::new(false),
            is_passive: AtomicBool::new(start_passive),
            all_devices_active: AtomicBool::new(false),
            is_missing_device_or_has_error: AtomicBool::new(false),
            last_overflow_warn: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn running(&self) -> bool {
        // Acquire: 看到 false 时必须能看到停止方此前的全部写入
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        // Release: 此前的写入对看到新值的线程可见
        self.running.store(running, Ordering::Release);
    }

    pub(crate) fn is_passive(&self) -> bool {
        self.is_passive.load(Ordering::Relaxed)
    }

    pub(crate) fn activate(&self) {
        self.is_passive.store(false, Ordering::Relaxed);
    }

    pub(crate) fn passivate(&self) {
        self.is_passive.store(true, Ordering::Relaxed);
    }

    pub(crate) fn all_devices_active(&self) -> bool {
        self.all_devices_active.load(Ordering::Relaxed)
    }

    pub(crate) fn is_missing_device_or_has_error(&self) -> bool {
        self.is_missing_device_or_has_error.load(Ordering::Relaxed)
    }

    /// 健康检查结果汇总（每个周期整体覆盖，不粘滞）
    pub(crate) fn store_sanity_result(&self, all_active: bool, any_failed: bool) {
        self.all_devices_active.store(all_active, Ordering::Relaxed);
        self.is_missing_device_or_has_error
            .store(any_failed, Ordering::Relaxed);
    }

    /// 入队一帧
    ///
    /// 队列已满时丢弃并打印节流警告；成功入队后唤醒发送线程。
    pub(crate) fn send_message(&self, frame: CanFrame) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.max_queue_size {
            drop(queue);
            self.warn_overflow_throttled();
            return;
        }
        queue.push_back(frame);
        self.cond_transmit.notify_all();
    }

    fn warn_overflow_throttled(&self) {
        let mut last = self.last_overflow_warn.lock();
        let now = Instant::now();
        if last.map_or(true, |t| now.duration_since(t) >= OVERFLOW_WARN_INTERVAL) {
            warn!(
                "Exceeding max queue size on bus '{}'! Dropping message!",
                self.name
            );
            *last = Some(now);
        }
    }

    /// 发送线程：等待队首帧
    ///
    /// 队列为空时先广播"已排空"，再阻塞等待新帧。
    /// 返回 `None` 表示总线已停止。返回的帧保留在队首，
    /// 写入成功后由 [`pop_front_transmitted`](Self::pop_front_transmitted) 弹出。
    pub(crate) fn wait_frame_for_transmit(&self) -> Option<CanFrame> {
        let mut queue = self.queue.lock();
        while queue.is_empty() && self.running() {
            self.cond_queue_empty.notify_all();
            self.cond_transmit.wait(&mut queue);
        }
        if !self.running() {
            return None;
        }
        queue.front().copied()
    }

    /// 队首帧快照（同步模式的 flush 路径使用）
    pub(crate) fn front_frame(&self) -> Option<CanFrame> {
        self.queue.lock().front().copied()
    }

    /// 写入成功后弹出队首帧；队列变空时广播"已排空"
    pub(crate) fn pop_front_transmitted(&self) {
        let mut queue = self.queue.lock();
        queue.pop_front();
        if queue.is_empty() {
            self.cond_queue_empty.notify_all();
        }
    }

    /// 等待发送队列排空，返回时持有队列锁
    ///
    /// 返回条件：队列为空，或总线已停止。
    pub(crate) fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<CanFrame>> {
        let mut queue = self.queue.lock();
        while !queue.is_empty() && self.running() {
            self.cond_queue_empty.wait(&mut queue);
        }
        queue
    }

    /// 唤醒所有阻塞在条件变量上的线程（停止路径）
    pub(crate) fn notify_all(&self) {
        // 拿一次锁保证唤醒不会与检查-等待窗口交错
        let _queue = self.queue.lock();
        self.cond_transmit.notify_all();
        self.cond_queue_empty.notify_all();
    }

    /// 接收到帧后的自动激活检查
    pub(crate) fn auto_activate_on_reception(&self) {
        if self.activate_bus_on_reception && self.is_passive() {
            self.activate();
            warn!("Auto-activated bus '{}'", self.name);
        }
    }
}

/// 总线发送句柄
///
/// 可克隆的轻量句柄，设备在 `init_device` 时通过
/// [`DeviceRegistry::sender`](crate::device::DeviceRegistry::sender) 获得，
/// 之后在任意线程入队帧。句柄不拥有设备，也不反向拥有总线的
/// 传输资源，只引用共享队列。
#[derive(Clone)]
pub struct BusSender {
    pub(crate) ctx: Arc<BusContext>,
}

impl BusSender {
    /// 入队一帧（队列满时丢弃并记录节流警告）
    pub fn send_message(&self, frame: CanFrame) {
        self.ctx.send_message(frame);
    }

    /// 所属总线名称
    pub fn bus_name(&self) -> &str {
        self.ctx.name()
    }

    /// 总线是否处于被动状态
    pub fn is_passive(&self) -> bool {
        self.ctx.is_passive()
    }
}
