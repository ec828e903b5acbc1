// rust_connection_transport/src/buffer.rs

//! 字节累积器。
//!
//! 把多个分片读取合并为一条完整消息，并强制执行最大消息大小。
//! 只在首个分片的 "消息结束" 标志为 false 时才会被创建，由读循环独占，不是线程安全的。

use crate::error::WsError;

/// 有上限的可增长字节缓冲区，单次使用。
#[derive(Debug)]
pub struct ByteBuffer {
    max_length: Option<usize>,
    data: Vec<u8>,
}

impl ByteBuffer {
    /// 创建一个空的累积器。`max_length` 为 `None` 时不限制大小。
    pub fn new(max_length: Option<usize>) -> Self {
        Self {
            max_length,
            data: Vec::new(),
        }
    }

    /// 追加一个分片。
    ///
    /// 如果累积后的总长度会超过上限，返回 `WsError::MessageTooLarge`，
    /// 此时不会拷贝任何字节。
    pub fn append(&mut self, segment: &[u8]) -> Result<(), WsError> {
        let attempted = self.data.len() + segment.len();
        if let Some(limit) = self.max_length {
            if attempted > limit {
                return Err(WsError::MessageTooLarge { limit, attempted });
            }
        }
        self.data.extend_from_slice(segment);
        Ok(())
    }

    /// 当前已累积的字节数。
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 取出累积的全部字节。
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// 按 UTF-8 解码累积的内容。
    pub fn into_string(self) -> Result<String, WsError> {
        Ok(String::from_utf8(self.data)?)
    }
}
