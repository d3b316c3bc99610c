//! SocketCAN 收/发分离实现
//!
//! 基于 `CanSocket::try_clone()`（`dup()` 系统调用）提供独立的 RX 和 TX
//! 两半，供接收线程与发送线程并发访问。
//!
//! # `try_clone()` 的共享状态
//!
//! 两半共享同一个"打开文件描述"（Open File Description）：
//!
//! 1. **文件状态标志共享**：`O_NONBLOCK` 等标志保存在打开文件描述中。
//!    分离后严禁使用 `set_nonblocking()`，必须依赖 `SO_RCVTIMEO` 实现超时。
//! 2. **过滤器共享**：RX 侧设置的过滤器会影响所有共享该描述的 FD。
//!    当前设计是安全的（TX 只写不读），但需知晓此特性。

use crate::{CanDeviceError, CanDeviceErrorKind, CanError, CanFrame, RxTransport, TxTransport};
use socketcan::{
    CanError as SocketCanError, CanFrame as RawFrame, CanSocket, EmbeddedFrame, Id, Socket,
};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tracing::{error, trace, warn};

/// 通过 `dup()` 系统调用克隆一个 `CanSocket`
///
/// 两个 socket 句柄共享同一个"打开文件描述"（Open File Description），
/// 与 `File::try_clone()` 语义一致。
fn dup_can_socket(socket: &CanSocket) -> io::Result<CanSocket> {
    let raw_fd = socket.as_raw_fd();
    // SAFETY: `raw_fd` is a valid, open fd for the lifetime of this call
    // because `socket` (which owns it) is borrowed for the duration.
    let dup_fd = unsafe { libc::dup(raw_fd) };
    if dup_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `dup_fd` was just returned by a successful `dup()` call, so it
    // is a valid, owned file descriptor not used elsewhere.
    let owned_fd = unsafe { OwnedFd::from_raw_fd(dup_fd) };
    Ok(CanSocket::from(owned_fd))
}

/// 只读半边（接收线程侧）
pub struct SocketCanRx {
    socket: CanSocket,
    read_timeout: Duration,
}

/// 只写半边（发送线程侧）
pub struct SocketCanTx {
    socket: CanSocket,
}

impl SocketCanRx {
    /// 克隆 socket 并配置读超时
    pub(crate) fn new(socket: &CanSocket, read_timeout: Duration) -> Result<Self, CanError> {
        let rx_socket = dup_can_socket(socket).map_err(|e| {
            CanError::Io(io::Error::other(format!(
                "Failed to clone SocketCAN socket for RX: {}",
                e
            )))
        })?;

        rx_socket.set_read_timeout(read_timeout).map_err(|e| {
            CanError::Io(io::Error::other(format!(
                "Failed to set read timeout on RX socket: {}",
                e
            )))
        })?;

        Ok(Self {
            socket: rx_socket,
            read_timeout,
        })
    }

    /// 获取读超时时间
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

impl SocketCanTx {
    pub(crate) fn new(socket: &CanSocket) -> Result<Self, CanError> {
        let tx_socket = dup_can_socket(socket).map_err(|e| {
            CanError::Io(io::Error::other(format!(
                "Failed to clone SocketCAN socket for TX: {}",
                e
            )))
        })?;

        Ok(Self { socket: tx_socket })
    }
}

impl RxTransport for SocketCanRx {
    /// 接收一帧（阻塞直到收到有效数据帧或超时）
    ///
    /// 自动跳过 RTR 帧与非致命错误帧，只返回有效数据帧。
    /// Bus-Off 与缓冲区溢出作为致命错误返回。
    fn receive(&mut self) -> Result<CanFrame, CanError> {
        loop {
            let raw = match self.socket.read_frame() {
                Ok(raw) => raw,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(CanError::Timeout);
                },
                Err(e) => return Err(CanError::Io(e)),
            };

            match raw {
                RawFrame::Data(data_frame) => {
                    let frame = from_data_frame(&data_frame);
                    trace!(
                        "Received CAN frame: ID=0x{:X}, len={}",
                        frame.id, frame.len
                    );
                    return Ok(frame);
                },
                RawFrame::Remote(_) => {
                    trace!("Ignoring RTR frame");
                },
                RawFrame::Error(error_frame) => {
                    let socketcan_error = SocketCanError::from(error_frame);
                    match &socketcan_error {
                        SocketCanError::BusOff => {
                            error!("CAN Bus Off error detected");
                            return Err(CanError::BusOff);
                        },
                        SocketCanError::ControllerProblem(problem) => {
                            let problem_str = format!("{}", problem);
                            if problem_str.to_lowercase().contains("overflow") {
                                error!("CAN buffer overflow detected: {}", problem);
                                return Err(CanError::BufferOverflow);
                            }
                            warn!("CAN controller problem: {}, ignoring", problem);
                        },
                        _ => {
                            warn!("CAN error frame received: {}, ignoring", socketcan_error);
                        },
                    }
                },
            }
        }
    }
}

impl TxTransport for SocketCanTx {
    /// 发送一帧（Fire-and-Forget）
    fn send(&mut self, frame: &CanFrame) -> Result<(), CanError> {
        let raw = to_raw_frame(frame)?;

        self.socket.write_frame(&raw).map_err(|e| {
            CanError::Io(io::Error::other(format!(
                "SocketCAN transmit error: {}",
                e
            )))
        })?;

        trace!("Sent CAN frame: ID=0x{:X}, len={}", frame.id, frame.len);
        Ok(())
    }
}

/// socketcan 数据帧 → 通用帧
fn from_data_frame(data_frame: &socketcan::CanDataFrame) -> CanFrame {
    match data_frame.id() {
        Id::Standard(id) => CanFrame::new_standard(id.as_raw(), data_frame.data()),
        Id::Extended(id) => CanFrame::new_extended(id.as_raw(), data_frame.data()),
    }
}

/// 通用帧 → socketcan 帧
fn to_raw_frame(frame: &CanFrame) -> Result<RawFrame, CanError> {
    if frame.is_extended {
        socketcan::ExtendedId::new(frame.id)
            .and_then(|id| RawFrame::new(id, frame.data_slice()))
            .ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::InvalidFrame,
                    format!("Failed to create extended frame with ID 0x{:X}", frame.id),
                ))
            })
    } else {
        socketcan::StandardId::new(frame.id as u16)
            .and_then(|id| RawFrame::new(id, frame.data_slice()))
            .ok_or_else(|| {
                CanError::Device(CanDeviceError::new(
                    CanDeviceErrorKind::InvalidFrame,
                    format!("Failed to create standard frame with ID 0x{:X}", frame.id),
                ))
            })
    }
}
