//! RPC 消息分帧
//!
//! 消息格式：[压缩标志(1字节)][长度(4字节，大端序)][数据]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::status::RpcStatus;

pub const RPC_CONTENT_TYPE: &str = "application/grpc";

/// 分帧头长度
pub const HEADER_LEN: usize = 5;

/// 构建一条未压缩消息
pub fn encode_message(payload: &[u8]) -> Bytes {
    let mut message = BytesMut::with_capacity(HEADER_LEN + payload.len());
    message.put_u8(0);
    message.put_u32(payload.len() as u32);
    message.put_slice(payload);
    message.freeze()
}

/// 增量解码器：数据块可以在任意位置切开
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    max_message_bytes: usize,
}

impl MessageDecoder {
    pub fn new(max_message_bytes: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_message_bytes,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// 取出下一条完整消息；数据不足时返回 `Ok(None)`
    pub fn next_message(&mut self) -> Result<Option<Bytes>, RpcStatus> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let compressed = self.buf[0];
        let length = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;

        if compressed != 0 {
            return Err(RpcStatus::unimplemented("compressed messages are not supported"));
        }
        if length > self.max_message_bytes {
            return Err(RpcStatus::resource_exhausted(format!(
                "received message larger than max ({} vs. {})",
                length, self.max_message_bytes
            )));
        }
        if self.buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(length).freeze()))
    }

    /// 流结束时仍有残留字节说明消息被截断
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
