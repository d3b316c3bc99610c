//! # fieldbus-runtime
//!
//! 面向机器人控制回路的多总线现场总线运行时。
//!
//! ## 架构
//!
//! - [`CanBus`]：一条总线 = 带上限的发送队列 + 三个工作线程
//!   （接收 / 发送 / 健康检查，异步模式）+ 帧分发表
//! - [`Device`] / [`DeviceCore`]：总线上节点的本地代理，
//!   CANopen 行为由内嵌 [`CanOpenNode`] 组合获得
//! - [`BusManager`]：总线注册表，负责全局 SYNC 广播与
//!   同步模式总线的外部泵送
//!
//! 传输层（SocketCAN 等）由 [`fieldbus_can`] 提供；
//! CANopen 编解码由 [`fieldbus_canopen`] 提供。
//!
//! ## 错误面
//!
//! 瞬态 IO 错误在工作线程内就地恢复；活性故障只通过两个可观测
//! 标志（[`CanBus::is_missing_device_or_has_error`]、
//! [`CanBus::all_devices_active`]）和日志事件对外暴露，
//! 不跨线程抛错。

pub mod bus;
pub mod canopen;
mod context;
pub mod device;
pub mod dispatch;
mod error;
pub mod manager;
pub mod options;

pub use bus::CanBus;
pub use canopen::CanOpenNode;
pub use context::BusSender;
pub use device::{Device, DeviceCore, DeviceRegistry};
pub use dispatch::{FrameCallback, FrameMatcher};
pub use error::BusError;
pub use manager::{BusManager, ManagedBus};
pub use options::{BusMode, BusOptions, CanOpenDeviceOptions, DeviceOptions};
