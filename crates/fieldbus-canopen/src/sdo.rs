//! SDO（Service Data Object）请求编码与应答解析
//!
//! 只实现 expedited 传输（数据 ≤ 4 字节），覆盖对象字典的常规读写。
//! 分段/块传输不在范围内。
//!
//! 帧布局（8 字节，小端序）：
//!
//! ```text
//! [0]     命令字节（command specifier）
//! [1..=2] 对象字典 index
//! [3]     sub-index
//! [4..=7] 数据（expedited，不足 4 字节时低位对齐，其余为 0）
//! ```

use crate::ProtocolError;
use crate::ids::rx_sdo_id;
use fieldbus_can::CanFrame;

/// SDO 请求命令字节（客户端 → 服务端，CiA 301 expedited）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdoCommand {
    /// 写 1 字节
    WriteU8 = 0x2F,
    /// 写 2 字节
    WriteU16 = 0x2B,
    /// 写 4 字节
    WriteU32 = 0x23,
    /// 读请求
    Read = 0x40,
}

/// 一条待发送的 SDO 请求
///
/// 排队在设备的 SDO 队列中，同一设备同时只有队头一条在途。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdoRequest {
    pub node_id: u8,
    pub command: SdoCommand,
    pub index: u16,
    pub sub_index: u8,
    pub payload: [u8; 4],
}

impl SdoRequest {
    /// 写 1 字节对象
    pub fn write_u8(node_id: u8, index: u16, sub_index: u8, value: u8) -> Self {
        Self {
            node_id,
            command: SdoCommand::WriteU8,
            index,
            sub_index,
            payload: [value, 0, 0, 0],
        }
    }

    /// 写 2 字节对象
    pub fn write_u16(node_id: u8, index: u16, sub_index: u8, value: u16) -> Self {
        let le = value.to_le_bytes();
        Self {
            node_id,
            command: SdoCommand::WriteU16,
            index,
            sub_index,
            payload: [le[0], le[1], 0, 0],
        }
    }

    /// 写 4 字节对象
    pub fn write_u32(node_id: u8, index: u16, sub_index: u8, value: u32) -> Self {
        Self {
            node_id,
            command: SdoCommand::WriteU32,
            index,
            sub_index,
            payload: value.to_le_bytes(),
        }
    }

    /// 读对象
    pub fn read(node_id: u8, index: u16, sub_index: u8) -> Self {
        Self {
            node_id,
            command: SdoCommand::Read,
            index,
            sub_index,
            payload: [0; 4],
        }
    }

    /// 是否为读请求（应答到达时需要回调数据）
    pub fn is_read_request(&self) -> bool {
        self.command == SdoCommand::Read
    }

    /// 应答的 (index, sub-index) 是否对应本请求
    pub fn matches(&self, index: u16, sub_index: u8) -> bool {
        self.index == index && self.sub_index == sub_index
    }

    /// 编码为请求帧（COB-ID = 0x600 + nodeId）
    pub fn to_frame(&self) -> CanFrame {
        let mut frame = CanFrame::new_standard(rx_sdo_id(self.node_id as u32) as u16, &[0u8; 8]);
        frame.write_u8(self.command as u8, 0);
        frame.write_u16(self.index, 1);
        frame.write_u8(self.sub_index, 3);
        frame.data[4..8].copy_from_slice(&self.payload);
        frame
    }
}

/// 解析后的 SDO 应答（服务端 → 客户端）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdoAnswer {
    /// 写确认（命令字节 0x60）
    WriteConfirmed { index: u16, sub_index: u8 },
    /// 读应答，携带 4 字节数据
    ReadResponse {
        index: u16,
        sub_index: u8,
        data: [u8; 4],
    },
    /// 传输中止，携带 abort code
    Abort {
        index: u16,
        sub_index: u8,
        code: u32,
    },
}

impl SdoAnswer {
    /// 应答引用的对象字典位置
    pub fn object(&self) -> (u16, u8) {
        match *self {
            SdoAnswer::WriteConfirmed { index, sub_index }
            | SdoAnswer::ReadResponse {
                index, sub_index, ..
            }
            | SdoAnswer::Abort {
                index, sub_index, ..
            } => (index, sub_index),
        }
    }
}

/// 解析 SDO 应答帧（COB-ID = 0x580 + nodeId 的帧）
///
/// 按命令字节高 3 位（command specifier）分类：
/// - scs=3（0x60）写确认
/// - scs=2（0x4x）读应答
/// - cs=4（0x80）abort
pub fn parse_sdo_answer(frame: &CanFrame) -> Result<SdoAnswer, ProtocolError> {
    if frame.len < 8 {
        return Err(ProtocolError::InvalidLength {
            expected: 8,
            actual: frame.len as usize,
        });
    }

    let command = frame.read_u8(0);
    let index = frame.read_u16(1);
    let sub_index = frame.read_u8(3);

    match command >> 5 {
        3 => Ok(SdoAnswer::WriteConfirmed { index, sub_index }),
        2 => Ok(SdoAnswer::ReadResponse {
            index,
            sub_index,
            data: [
                frame.read_u8(4),
                frame.read_u8(5),
                frame.read_u8(6),
                frame.read_u8(7),
            ],
        }),
        4 => Ok(SdoAnswer::Abort {
            index,
            sub_index,
            code: frame.read_u32(4),
        }),
        _ => Err(ProtocolError::UnknownSdoCommand { command }),
    }
}
