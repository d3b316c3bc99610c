//! 帧分发表
//!
//! 入站帧按 (identifier, mask) 匹配器路由到注册的解析回调。
//! 分发表在设备初始化阶段构建，`init_bus` 之后冻结为只读，
//! 接收线程无锁读取。未匹配帧的兜底回调通过 `ArcSwap` 存储，
//! 允许在任意时刻无竞争地设置。

use crate::device::Device;
use arc_swap::ArcSwapOption;
use fieldbus_can::CanFrame;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// 帧匹配器：`(frame.id & mask) == identifier` 时命中
///
/// mask 为全 1 时退化为精确匹配；mask 中为 0 的位不参与比较。
/// 例如匹配所有 `0x..FA..33` 帧可以用
/// `FrameMatcher::masked(0x00FA0033, 0x00FF00FF)`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameMatcher {
    pub identifier: u32,
    pub mask: u32,
}

impl FrameMatcher {
    /// 精确匹配单个 CAN ID
    pub fn exact(identifier: u32) -> Self {
        Self {
            identifier,
            mask: 0xFFFF_FFFF,
        }
    }

    /// 按掩码匹配一组 CAN ID
    pub fn masked(identifier: u32, mask: u32) -> Self {
        Self { identifier, mask }
    }

    /// 检查帧 ID 是否命中
    pub fn matches(&self, id: u32) -> bool {
        (id & self.mask) == self.identifier
    }
}

impl fmt::Display for FrameMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(id=0x{:X}, mask=0x{:X})", self.identifier, self.mask)
    }
}

/// 帧解析回调
///
/// 返回 `false` 表示解析失败（仅记录日志，不影响路由）。
/// 回调运行在接收线程上，必须是非阻塞的；允许在回调里调用
/// [`BusSender::send_message`](crate::BusSender::send_message)
/// （队列锁与分发路径无关，不会死锁）。
pub type FrameCallback = Box<dyn Fn(&CanFrame) -> bool + Send + Sync>;

/// 兜底回调的装箱（`ArcSwap` 需要 Sized 载体）
struct UnmappedSlot(FrameCallback);

/// 一个分发槽：匹配器 + 可选的设备引用 + 回调
///
/// 设备引用存在时，命中即重置该设备的超时计数器（帧视作心跳）。
pub(crate) struct DispatchSlot {
    matcher: FrameMatcher,
    device: Option<Arc<dyn Device>>,
    callback: FrameCallback,
}

/// 分发表
pub(crate) struct DispatchTable {
    bus_name: String,
    slots: Vec<DispatchSlot>,
    unmapped: ArcSwapOption<UnmappedSlot>,
}

impl DispatchTable {
    pub(crate) fn new(bus_name: String) -> Self {
        Self {
            bus_name,
            slots: Vec::new(),
            unmapped: ArcSwapOption::const_empty(),
        }
    }

    /// 注册一个分发槽
    ///
    /// 相同的匹配器只允许注册一次；掩码不同但有交集的匹配器
    /// 允许共存，分发时全部命中（按注册顺序）。
    pub(crate) fn add(
        &mut self,
        matcher: FrameMatcher,
        device: Option<Arc<dyn Device>>,
        callback: FrameCallback,
    ) -> Result<(), crate::BusError> {
        if self.slots.iter().any(|slot| slot.matcher == matcher) {
            return Err(crate::BusError::DuplicateMatcher {
                identifier: matcher.identifier,
                mask: matcher.mask,
            });
        }
        self.slots.push(DispatchSlot {
            matcher,
            device,
            callback,
        });
        Ok(())
    }

    /// 设置未匹配帧的兜底回调（`&self`，初始化前后均可调用）
    pub(crate) fn set_unmapped_callback(&self, callback: FrameCallback) {
        self.unmapped.store(Some(Arc::new(UnmappedSlot(callback))));
    }

    /// 路由一帧
    ///
    /// 命中的每个槽都会被调用；绑定了设备的槽同时重置设备超时
    /// 计数器。无任何命中时走兜底回调。
    pub(crate) fn dispatch(&self, frame: &CanFrame) {
        let mut matched = false;
        for slot in &self.slots {
            if !slot.matcher.matches(frame.id) {
                continue;
            }
            matched = true;
            if let Some(device) = &slot.device {
                device.core().reset_timeout_counter();
            }
            if !(slot.callback)(frame) {
                warn!(
                    "Callback for CAN ID 0x{:X} on bus '{}' reported a parse error",
                    frame.id, self.bus_name
                );
            }
        }

        if !matched {
            match self.unmapped.load_full() {
                Some(slot) => {
                    if !(slot.0)(frame) {
                        warn!(
                            "Unmapped-message callback on bus '{}' reported an error (ID=0x{:X})",
                            self.bus_name, frame.id
                        );
                    }
                },
                None => self.default_handle_unmapped(frame),
            }
        }
    }

    fn default_handle_unmapped(&self, frame: &CanFrame) {
        debug!(
            "Unmapped message on bus '{}': ID=0x{:X}, len={}",
            self.bus_name, frame.id, frame.len
        );
    }
}
