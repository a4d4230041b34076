//! Frame parsers turn raw transport bytes into complete frames.
//!
//! 帧解析器将原始传输字节转换为完整的帧。

use crate::error::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;

/// Splits an inbound byte stream into frames.
///
/// The transports own one parser each and only touch it from their I/O task.
/// `next_frame` returning an error must consume the offending bytes: the
/// caller logs the error and keeps pulling frames.
///
/// 将入站字节流拆分为帧。每个传输拥有一个解析器，且只在其I/O任务中访问。
/// `next_frame` 返回错误时必须消耗掉出错的字节。
pub trait FrameParser: Send + 'static {
    /// Feeds received bytes.
    /// 输入收到的字节。
    fn handle(&mut self, data: &[u8]);

    /// Takes the next complete frame, if any.
    /// 取出下一个完整帧（如果有）。
    fn next_frame(&mut self) -> Result<Option<Bytes>>;

    /// Drops any partially assembled frame.
    /// 丢弃所有部分组装的帧。
    fn reset(&mut self);

    /// Releases buffered state for good.
    /// 永久释放缓冲状态。
    fn close(&mut self) {
        self.reset();
    }
}

/// Treats every received chunk as one frame.
///
/// 将每个收到的数据块视为一帧。
#[derive(Debug, Default)]
pub struct DirectFrameParser {
    frames: VecDeque<Bytes>,
}

impl DirectFrameParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameParser for DirectFrameParser {
    fn handle(&mut self, data: &[u8]) {
        if !data.is_empty() {
            self.frames.push_back(Bytes::copy_from_slice(data));
        }
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        Ok(self.frames.pop_front())
    }

    fn reset(&mut self) {
        self.frames.clear();
    }
}

/// Splits frames on a delimiter, which is stripped from the output.
///
/// A frame longer than `max_frame_length` is dropped with
/// [`Error::ProtocolDecode`].
///
/// 按分隔符拆分帧，输出中去除分隔符。超过 `max_frame_length` 的帧会以
/// [`Error::ProtocolDecode`] 丢弃。
#[derive(Debug)]
pub struct DelimiterFrameParser {
    delimiter: Bytes,
    max_frame_length: usize,
    buffer: BytesMut,
    // Bytes of an oversized frame still to be skipped up to its delimiter.
    discarding: bool,
}

impl DelimiterFrameParser {
    pub fn new(delimiter: impl Into<Bytes>, max_frame_length: usize) -> Self {
        Self {
            delimiter: delimiter.into(),
            max_frame_length,
            buffer: BytesMut::new(),
            discarding: false,
        }
    }

    /// A parser for `\r\n` terminated lines.
    /// 以 `\r\n` 结尾的行解析器。
    pub fn lines(max_frame_length: usize) -> Self {
        Self::new(Bytes::from_static(b"\r\n"), max_frame_length)
    }

    fn oversized(&self) -> Error {
        Error::ProtocolDecode(format!("frame exceeds {} bytes", self.max_frame_length))
    }

    fn find_delimiter(&self) -> Option<usize> {
        let delimiter = &self.delimiter[..];
        if delimiter.is_empty() || self.buffer.len() < delimiter.len() {
            return None;
        }
        self.buffer
            .windows(delimiter.len())
            .position(|window| window == delimiter)
    }
}

impl FrameParser for DelimiterFrameParser {
    fn handle(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.find_delimiter() {
                Some(end) => {
                    let frame = self.buffer.split_to(end).freeze();
                    self.buffer.advance(self.delimiter.len());
                    if std::mem::take(&mut self.discarding) {
                        // Tail of a frame already reported as oversized.
                        continue;
                    }
                    if frame.len() > self.max_frame_length {
                        return Err(self.oversized());
                    }
                    return Ok(Some(frame));
                }
                None if self.buffer.len() > self.max_frame_length => {
                    // Keep a possible delimiter prefix so a split delimiter still matches.
                    let keep = self.delimiter.len().saturating_sub(1);
                    let drop_len = self.buffer.len() - keep;
                    self.buffer.advance(drop_len);
                    if std::mem::replace(&mut self.discarding, true) {
                        return Ok(None);
                    }
                    return Err(self.oversized());
                }
                None => return Ok(None),
            }
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut impl FrameParser) -> Vec<Result<Bytes>> {
        let mut out = Vec::new();
        loop {
            match parser.next_frame() {
                Ok(None) => break,
                other => out.push(other.map(|f| f.unwrap_or_default())),
            }
        }
        out
    }

    #[test]
    fn test_direct_parser_passes_chunks_through() {
        let mut parser = DirectFrameParser::new();
        parser.handle(b"abc");
        parser.handle(b"");
        parser.handle(b"de");
        let frames: Vec<_> = drain(&mut parser).into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"de")]);
    }

    #[test]
    fn test_delimiter_parser_reassembles_split_frames() {
        let mut parser = DelimiterFrameParser::lines(64);
        parser.handle(b"OK 1\r");
        assert!(parser.next_frame().unwrap().is_none());
        parser.handle(b"\nOK 2\r\nOK");
        let frames: Vec<_> = drain(&mut parser).into_iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![Bytes::from_static(b"OK 1"), Bytes::from_static(b"OK 2")]);

        parser.reset();
        parser.handle(b" 3\r\n");
        assert_eq!(parser.next_frame().unwrap().unwrap(), Bytes::from_static(b" 3"));
    }

    #[test]
    fn test_oversized_frame_is_reported_once_and_skipped() {
        let mut parser = DelimiterFrameParser::new(Bytes::from_static(b"\n"), 4);
        parser.handle(b"123456");
        assert!(matches!(parser.next_frame(), Err(Error::ProtocolDecode(_))));
        parser.handle(b"78");
        assert!(parser.next_frame().unwrap().is_none());
        parser.handle(b"9\nok\n");

        // The tail of the oversized frame is dropped without a second error.
        let results = drain(&mut parser);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &Bytes::from_static(b"ok"));
    }
}
