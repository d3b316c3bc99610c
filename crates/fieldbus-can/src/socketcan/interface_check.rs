//! CAN 接口状态检查
//!
//! 使用 ioctl 系统调用检查 Linux 网络接口是否存在且已启动（UP 状态）。
//! 只读操作，普通用户即可执行，不需要 root 或 CAP_NET_ADMIN 权限。

use crate::{CanDeviceError, CanDeviceErrorKind, CanError};
use std::ffi::CString;
use std::io;

/// 检查 CAN 接口是否存在且已启动（管理态 UP）
///
/// # 返回值
/// - `Ok(true)`: 接口存在且 IFF_UP 标志位为真
/// - `Ok(false)`: 接口存在但处于 DOWN 状态
/// - `Err(CanError::Device)`: 接口不存在或接口名无效
/// - `Err(CanError::Io)`: 系统调用失败
pub(crate) fn check_interface_up(interface: &str) -> Result<bool, CanError> {
    // ifr_name 是 IFNAMSIZ = 16 字节，包括结尾的 NUL
    const MAX_IFACE_NAME_LEN: usize = 15;
    if interface.len() > MAX_IFACE_NAME_LEN {
        return Err(CanError::Device(
            format!(
                "Interface name '{}' is too long (max {} characters)",
                interface, MAX_IFACE_NAME_LEN
            )
            .into(),
        ));
    }

    let c_iface = CString::new(interface)
        .map_err(|e| CanError::Device(format!("Invalid interface name: {}", e).into()))?;

    let ifindex = unsafe { libc::if_nametoindex(c_iface.as_ptr()) };
    if ifindex == 0 {
        let errno = io::Error::last_os_error();
        return Err(CanError::Device(CanDeviceError::new(
            CanDeviceErrorKind::NotFound,
            format!(
                "CAN interface '{}' does not exist ({}). Please create it first:\n  sudo ip link add dev {} type can",
                interface, errno, interface
            ),
        )));
    }

    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            c_iface.as_ptr(),
            ifr.ifr_name.as_mut_ptr(),
            interface.len(),
        );
    }

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(CanError::Io(io::Error::last_os_error()));
    }

    let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) };
    let flags = if ret < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(CanError::Io(err));
    } else {
        let flags = unsafe { ifr.ifr_ifru.ifru_flags };
        unsafe { libc::close(fd) };
        flags
    };

    Ok((flags as libc::c_int & libc::IFF_UP) != 0)
}
