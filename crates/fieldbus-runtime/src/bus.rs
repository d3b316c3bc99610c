//! 总线运行时
//!
//! [`CanBus`] 把三部分组合成一条总线：
//!
//! - 共享状态 [`BusContext`]（发送队列、条件变量、状态标志）
//! - 分发表 [`DispatchTable`]（入站帧 → 设备回调）
//! - 传输两半 `T::Rx` / `T::Tx`
//!
//! 异步模式下 `init_bus` 启动三个工作线程：
//!
//! - **接收线程**：阻塞在 `Rx::receive`（短超时），把帧交给分发表
//! - **发送线程**：阻塞在发送条件变量，逐帧写入 `Tx::send`；
//!   写失败的帧保留在队首重试
//! - **健康检查线程**：按固定节拍推进所有设备的超时计数器
//!
//! 同步模式下没有内部线程，由 [`BusManager`](crate::BusManager)
//! 的外部循环调用 [`read_message`](CanBus::read_message) /
//! [`write_message`](CanBus::write_message) / [`sanity_check`](CanBus::sanity_check)。

use crate::context::{BusContext, BusSender};
use crate::device::{Device, DeviceRegistry};
use crate::dispatch::{DispatchTable, FrameCallback, FrameMatcher};
use crate::error::BusError;
use crate::options::{BusMode, BusOptions};
use fieldbus_can::{CanError, CanFrame, CanTransport, RxTransport, TxTransport};
use fieldbus_canopen::SYNC_ID;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 写失败后的退避，避免对故障驱动忙等
const WRITE_RETRY_BACKOFF: Duration = Duration::from_micros(50);

/// 一条 CAN 总线
///
/// 持有并独占其设备；设备通过 [`add_device`](Self::add_device)
/// 附加，随总线一起销毁。`Drop` 时停止并等待全部工作线程退出。
pub struct CanBus<T: CanTransport> {
    options: BusOptions,
    ctx: Arc<BusContext>,
    table: Arc<DispatchTable>,
    devices: Vec<Arc<dyn Device>>,

    /// 打开前的传输对象；`init_bus` 消费
    transport: Option<T>,
    /// 同步模式下保留的两半
    rx: Option<T::Rx>,
    tx: Option<T::Tx>,

    threads: Vec<JoinHandle<()>>,
    initialized: bool,
}

impl<T: CanTransport> CanBus<T> {
    pub fn new(options: BusOptions, transport: T) -> Self {
        let ctx = Arc::new(BusContext::new(
            options.name.clone(),
            options.max_queue_size,
            options.start_passive,
            options.activate_bus_on_reception,
        ));
        let table = Arc::new(DispatchTable::new(options.name.clone()));
        Self {
            options,
            ctx,
            table,
            devices: Vec::new(),
            transport: Some(transport),
            rx: None,
            tx: None,
            threads: Vec::new(),
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &BusOptions {
        &self.options
    }

    /// 本总线的发送句柄
    pub fn sender(&self) -> BusSender {
        BusSender {
            ctx: self.ctx.clone(),
        }
    }

    /// 附加一个设备并调用其 `init_device`
    ///
    /// 必须在 [`init_bus`](Self::init_bus) 之前调用；设备在回调里
    /// 注册分发表条目、保存发送句柄、可发送初始复位命令。
    pub fn add_device<D: Device>(&mut self, device: Arc<D>) -> Result<(), BusError> {
        let table = Arc::get_mut(&mut self.table)
            .ok_or_else(|| BusError::AlreadyInitialized(self.options.name.clone()))?;

        let dyn_device: Arc<dyn Device> = device.clone();
        self.devices.push(dyn_device.clone());

        let mut registry = DeviceRegistry {
            table,
            sender: BusSender {
                ctx: self.ctx.clone(),
            },
            device: dyn_device,
        };
        device.init_device(&mut registry)
    }

    /// 注册不属于任何设备的回调（如上层对 SYNC 回显的观测）
    pub fn add_can_message(
        &mut self,
        matcher: FrameMatcher,
        callback: FrameCallback,
    ) -> Result<(), BusError> {
        let table = Arc::get_mut(&mut self.table)
            .ok_or_else(|| BusError::AlreadyInitialized(self.options.name.clone()))?;
        table.add(matcher, None, callback)
    }

    /// 设置未匹配帧的兜底回调
    ///
    /// 底层是 `ArcSwap`，初始化之后设置也是无竞争的。
    pub fn set_unmapped_message_callback(&self, callback: FrameCallback) {
        self.table.set_unmapped_callback(callback);
    }

    /// 初始化总线
    ///
    /// 打开驱动接口并（异步模式）启动工作线程。驱动打开失败时
    /// 原样返回错误，总线保持未初始化。重复调用是错误。
    pub fn init_bus(&mut self) -> Result<(), BusError> {
        if self.initialized {
            return Err(BusError::AlreadyInitialized(self.options.name.clone()));
        }
        let mut transport = self
            .transport
            .take()
            .ok_or_else(|| BusError::AlreadyInitialized(self.options.name.clone()))?;

        if let Err(e) = transport.open() {
            // 传输对象放回去，调用方可以修复后重试
            self.transport = Some(transport);
            return Err(e.into());
        }

        let (rx, tx) = transport.split()?;
        self.ctx.set_running(true);
        self.initialized = true;

        match self.options.mode {
            BusMode::Asynchronous => self.spawn_workers(rx, tx)?,
            BusMode::Synchronous => {
                self.rx = Some(rx);
                self.tx = Some(tx);
            },
        }
        Ok(())
    }

    fn spawn_workers(&mut self, rx: T::Rx, tx: T::Tx) -> Result<(), BusError> {
        let name = self.options.name.clone();

        let receive = {
            let ctx = self.ctx.clone();
            let table = self.table.clone();
            let priority = self.options.priority_receive_thread;
            let bus_name = name.clone();
            std::thread::Builder::new()
                .name(format!("{name}-receive"))
                .spawn(move || {
                    apply_realtime_priority(priority, &bus_name, "receive");
                    receive_worker(ctx, table, rx);
                })
                .map_err(CanError::Io)?
        };
        self.threads.push(receive);

        let transmit = {
            let ctx = self.ctx.clone();
            let priority = self.options.priority_transmit_thread;
            let bus_name = name.clone();
            std::thread::Builder::new()
                .name(format!("{name}-transmit"))
                .spawn(move || {
                    apply_realtime_priority(priority, &bus_name, "transmit");
                    transmit_worker(ctx, tx);
                })
                .map_err(CanError::Io)?
        };
        self.threads.push(transmit);

        if !self.options.sanity_check_interval.is_zero() {
            let sanity = {
                let ctx = self.ctx.clone();
                let devices = Arc::new(self.devices.clone());
                let interval = self.options.sanity_check_interval;
                let priority = self.options.priority_sanity_check_thread;
                let bus_name = name.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-sanity"))
                    .spawn(move || {
                        apply_realtime_priority(priority, &bus_name, "sanity-check");
                        sanity_check_worker(ctx, devices, interval);
                    })
                    .map_err(CanError::Io)?
            };
            self.threads.push(sanity);
        }
        Ok(())
    }

    // === 状态标志 ===

    /// 激活总线，允许帧写入驱动；在下一次发送尝试时生效
    pub fn activate(&self) {
        self.ctx.activate();
    }

    /// 被动化总线：出队的帧不写入驱动，按成功处理
    pub fn passivate(&self) {
        self.ctx.passivate();
    }

    pub fn is_passive(&self) -> bool {
        self.ctx.is_passive()
    }

    pub fn is_missing_device_or_has_error(&self) -> bool {
        self.ctx.is_missing_device_or_has_error()
    }

    pub fn all_devices_active(&self) -> bool {
        self.ctx.all_devices_active()
    }

    pub fn is_asynchronous(&self) -> bool {
        self.options.mode == BusMode::Asynchronous
    }

    // === 发送 ===

    /// 入队一帧（队列满时丢弃并记录节流警告）
    pub fn send_message(&self, frame: CanFrame) {
        self.ctx.send_message(frame);
    }

    /// 入队一帧 CANopen SYNC（ID 0x080，零长度）
    ///
    /// 入队在队列锁内一步完成，[`BusManager::send_sync_on_all_buses`]
    /// (crate::BusManager::send_sync_on_all_buses) 借此保证 SYNC
    /// 不与其他生产者在单条总线上交错。
    pub fn send_sync(&self) {
        self.send_message(CanFrame::new_standard(SYNC_ID as u16, &[]));
    }

    /// 等待发送队列排空，返回时持有队列锁
    ///
    /// 队列为空或总线已停止时返回。
    pub fn wait_for_empty_queue(&self) -> MutexGuard<'_, VecDeque<CanFrame>> {
        self.ctx.wait_for_empty_queue()
    }

    /// 同步模式：把队首帧写入驱动
    ///
    /// - `Ok(true)`：写入一帧并弹出（被动状态视作写入成功）
    /// - `Ok(false)`：队列为空，或总线是异步模式（发送线程负责写入）
    /// - `Err(_)`：写入失败，帧保留在队首等待重试
    pub fn write_message(&mut self) -> Result<bool, CanError> {
        let Some(frame) = self.ctx.front_frame() else {
            return Ok(false);
        };
        let Some(tx) = self.tx.as_mut() else {
            return Ok(false);
        };

        if !self.ctx.is_passive() {
            tx.send(&frame)?;
        }
        self.ctx.pop_front_transmitted();
        Ok(true)
    }

    /// 同步模式：读取并分发一帧
    ///
    /// 返回是否读到了帧。读超时与瞬态错误返回 `false`，下次继续。
    pub fn read_message(&mut self) -> bool {
        let Some(rx) = self.rx.as_mut() else {
            return false;
        };
        match rx.receive() {
            Ok(frame) => {
                self.ctx.auto_activate_on_reception();
                self.table.dispatch(&frame);
                true
            },
            Err(CanError::Timeout) => false,
            Err(e) => {
                log_read_error(self.options.name.as_str(), &e);
                false
            },
        }
    }

    /// 对所有设备做一轮健康检查并汇总总线标志
    ///
    /// 异步模式由健康检查线程调用；同步模式由外部循环按节拍调用。
    pub fn sanity_check(&self) {
        run_sanity_check(&self.devices, &self.ctx);
    }

    /// 把所有设备恢复到初始状态并发送重启命令
    pub fn reset_all_devices(&self) {
        for device in &self.devices {
            device.reset_device();
        }
    }

    /// 本总线的全部设备
    pub fn devices(&self) -> &[Arc<dyn Device>] {
        &self.devices
    }

    /// 停止总线的全部工作线程
    ///
    /// 置位停止标志并唤醒两个条件变量；`wait` 为真时等待线程退出。
    /// 队列中未发送的帧保留（不冲刷）。
    pub fn stop_threads(&mut self, wait: bool) {
        self.ctx.set_running(false);
        self.ctx.notify_all();

        if wait {
            for handle in self.threads.drain(..) {
                let _ = handle.join();
            }
        }
    }
}

impl<T: CanTransport> Drop for CanBus<T> {
    fn drop(&mut self) {
        self.stop_threads(true);
    }
}

// === 工作线程 ===

fn receive_worker<R: RxTransport>(ctx: Arc<BusContext>, table: Arc<DispatchTable>, mut rx: R) {
    while ctx.running() {
        match rx.receive() {
            Ok(frame) => {
                ctx.auto_activate_on_reception();
                table.dispatch(&frame);
            },
            // 超时是常态：借此轮询运行标志
            Err(CanError::Timeout) => {},
            Err(e) => {
                log_read_error(ctx.name(), &e);
            },
        }
    }
    info!("Receive thread for bus '{}' terminated", ctx.name());
}

/// 读错误都在循环内恢复；致命级别的错误（接口不可用、总线关闭、
/// 缓冲区溢出）提升到 error 级别，瞬态错误记 warn
fn log_read_error(bus_name: &str, e: &CanError) {
    let fatal = match e {
        CanError::Device(device_error) => device_error.is_fatal(),
        CanError::BusOff | CanError::BufferOverflow => true,
        _ => false,
    };
    if fatal {
        error!("Receive error on bus '{}': {}", bus_name, e);
    } else {
        warn!("Receive error on bus '{}': {}", bus_name, e);
    }
}

fn transmit_worker<W: TxTransport>(ctx: Arc<BusContext>, mut tx: W) {
    while ctx.running() {
        let Some(frame) = ctx.wait_frame_for_transmit() else {
            // 总线停止
            continue;
        };

        let write_success = if ctx.is_passive() {
            // 被动状态：不触碰驱动，按成功排空
            true
        } else {
            match tx.send(&frame) {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        "Write error on bus '{}' (ID=0x{:X}): {}, will retry",
                        ctx.name(),
                        frame.id,
                        e
                    );
                    false
                },
            }
        };

        if write_success {
            ctx.pop_front_transmitted();
        } else {
            // 帧保留在队首；退避后重试
            spin_sleep::sleep(WRITE_RETRY_BACKOFF);
        }
    }
    info!("Transmit thread for bus '{}' terminated", ctx.name());
}

fn sanity_check_worker(ctx: Arc<BusContext>, devices: Arc<Vec<Arc<dyn Device>>>, interval: Duration) {
    // 绝对节拍：deadline 逐次累加，迟醒不漂移
    let mut next_deadline = Instant::now();

    while ctx.running() {
        next_deadline += interval;
        let now = Instant::now();
        if next_deadline > now {
            spin_sleep::sleep(next_deadline - now);
        }
        if !ctx.running() {
            break;
        }

        run_sanity_check(&devices, &ctx);
    }
    info!("Sanity-check thread for bus '{}' terminated", ctx.name());
}

fn run_sanity_check(devices: &[Arc<dyn Device>], ctx: &BusContext) {
    let mut all_active = true;
    for device in devices {
        if !device.sanity_check() {
            all_active = false;
        }
    }
    ctx.store_sanity_result(all_active, !all_active);
}

/// 把当前线程放到 SCHED_FIFO 实时策略下
///
/// 在每个工作线程自己的启动路径里调用，优先级必然落在正确的线程上。
/// 设置失败只记录警告（通常是缺少 CAP_SYS_NICE）。
fn apply_realtime_priority(priority: Option<u8>, bus_name: &str, role: &str) {
    use thread_priority::*;

    let Some(priority) = priority else {
        return;
    };

    let value = match ThreadPriorityValue::try_from(priority) {
        Ok(value) => value,
        Err(e) => {
            warn!(
                "Invalid {} thread priority {} for bus '{}': {}",
                role, priority, bus_name, e
            );
            return;
        },
    };

    #[cfg(unix)]
    let result = set_thread_priority_and_policy(
        thread_native_id(),
        ThreadPriority::Crossplatform(value),
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    );
    #[cfg(not(unix))]
    let result = set_current_thread_priority(ThreadPriority::Crossplatform(value));

    if let Err(e) = result {
        warn!(
            "Failed to set {} thread priority for bus '{}': {:?}. \
             On Linux you may need CAP_SYS_NICE or rtkit.",
            role, bus_name, e
        );
    }
}
