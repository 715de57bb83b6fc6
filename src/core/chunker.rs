//! 内容定义分块（buzhash 滚动哈希）
//!
//! 滑动窗口上维护 buzhash，`hash & mask == 0` 且块长度不小于 `min_size` 时切块，
//! 达到 `max_size` 时强制切块。每隔 `reset_interval` 字节（按流的绝对偏移）强制切块并
//! 重置哈希状态，一处修改最多影响所在重置区间内的块。
//!
//! 为保证除最后一块外所有块都落在 `[min_size, max_size]`，重置点之前 `min_size`
//! 字节内不做内容切块，必要时提前按长度切块。

use bytes::{Bytes, BytesMut};
use futures::Stream;
use std::collections::VecDeque;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const TABLE_SEED: u64 = 0x5EED_C0DE_2024_0001;
const READ_SIZE: usize = 1024 * 1024;

const fn splitmix64(state: u64) -> (u64, u64) {
    let state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    (state, z ^ (z >> 31))
}

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut state = TABLE_SEED;
    let mut i = 0;
    while i < 256 {
        let (next, value) = splitmix64(state);
        state = next;
        table[i] = (value >> 32) as u32;
        i += 1;
    }
    table
}

/// 固定种子生成的 256 个伪随机常量，跨主机、跨运行结果一致
static TABLE: [u32; 256] = build_table();

/// 分块参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerParams {
    pub window_size: usize,
    pub average_size: u64,
    pub min_size: u64,
    pub max_size: u64,
    pub reset_interval: u64,
}

impl Default for ChunkerParams {
    fn default() -> Self {
        Self::with_average(1024 * 1024)
    }
}

impl ChunkerParams {
    /// 以平均块大小推导：最小 = 平均/4，最大 = 平均×4
    pub fn with_average(average_size: u64) -> Self {
        let average_size = average_size.max(256);
        Self {
            window_size: 48,
            average_size,
            min_size: average_size / 4,
            max_size: average_size.saturating_mul(4),
            reset_interval: 8 * 1024 * 1024,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("窗口大小必须大于 0".into());
        }
        if self.min_size == 0 || self.max_size < self.min_size.saturating_mul(2) {
            return Err(format!(
                "块大小范围无效: min={}, max={}（要求 max >= 2*min）",
                self.min_size, self.max_size
            ));
        }
        if self.reset_interval < self.min_size {
            return Err("重置间隔不能小于最小块大小".into());
        }
        Ok(())
    }

    /// 满足 `2^bits ≈ average_size` 的掩码
    pub fn mask(&self) -> u32 {
        let bits = (self.average_size as f64).log2().round() as u32;
        match bits.min(31) {
            0 => 0,
            b => (1u32 << b) - 1,
        }
    }
}

/// 一个块
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: Bytes,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }

    pub fn digest(&self) -> String {
        blake3::hash(&self.data).to_hex().to_string()
    }
}

/// 增量分块器：喂入字节，返回切点（流内的绝对偏移）
///
/// 不能从中途恢复，要复现切点必须从偏移 0 重新喂入。
pub struct Chunker {
    params: ChunkerParams,
    mask: u32,
    hash: u32,
    window: Vec<u8>,
    win_pos: usize,
    win_filled: usize,
    pos: u64,
    chunk_start: u64,
    reset_at: u64,
}

impl Chunker {
    pub fn new(params: ChunkerParams) -> Self {
        Self {
            mask: params.mask(),
            hash: 0,
            window: vec![0u8; params.window_size],
            win_pos: 0,
            win_filled: 0,
            pos: 0,
            chunk_start: 0,
            reset_at: params.reset_interval,
            params,
        }
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    fn reset_hash(&mut self) {
        self.hash = 0;
        self.win_pos = 0;
        self.win_filled = 0;
    }

    #[inline]
    fn roll(&mut self, byte: u8) {
        let size = self.params.window_size;
        if self.win_filled < size {
            self.hash = self.hash.rotate_left(1) ^ TABLE[byte as usize];
            self.win_filled += 1;
        } else {
            let out = self.window[self.win_pos];
            self.hash = self.hash.rotate_left(1)
                ^ TABLE[out as usize].rotate_left(size as u32)
                ^ TABLE[byte as usize];
        }
        self.window[self.win_pos] = byte;
        self.win_pos = (self.win_pos + 1) % size;
    }

    fn cut(&mut self, cuts: &mut Vec<u64>) {
        cuts.push(self.pos);
        self.chunk_start = self.pos;
    }

    pub fn push(&mut self, data: &[u8]) -> Vec<u64> {
        let ChunkerParams {
            min_size,
            max_size,
            reset_interval,
            window_size,
            ..
        } = self.params;
        let mut cuts = Vec::new();

        for &byte in data {
            self.roll(byte);
            self.pos += 1;

            if self.pos == self.reset_at {
                self.cut(&mut cuts);
                self.reset_hash();
                self.reset_at += reset_interval;
                continue;
            }

            let len = self.pos - self.chunk_start;
            let room = self.reset_at - self.chunk_start;
            let limit = if room <= max_size {
                u64::MAX
            } else if room < max_size + min_size {
                room - min_size
            } else {
                max_size
            };

            let content_cut = len >= min_size
                && self.reset_at - self.pos >= min_size
                && self.win_filled == window_size
                && self.hash & self.mask == 0;

            if len >= limit || content_cut {
                self.cut(&mut cuts);
            }
        }
        cuts
    }
}

/// 对内存中的数据分块，返回 (offset, length)
pub fn chunk_boundaries(data: &[u8], params: &ChunkerParams) -> Vec<(u64, u64)> {
    let mut chunker = Chunker::new(*params);
    let mut out = Vec::new();
    let mut start = 0u64;
    for cut in chunker.push(data) {
        out.push((start, cut - start));
        start = cut;
    }
    if start < data.len() as u64 {
        out.push((start, data.len() as u64 - start));
    }
    out
}

struct StreamState<R> {
    reader: R,
    chunker: Chunker,
    buf: BytesMut,
    buf_offset: u64,
    cuts: VecDeque<u64>,
    read_buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> StreamState<R> {
    async fn next_chunk(&mut self) -> io::Result<Option<Chunk>> {
        loop {
            if let Some(cut) = self.cuts.pop_front() {
                let len = (cut - self.buf_offset) as usize;
                let chunk = Chunk {
                    offset: self.buf_offset,
                    data: self.buf.split_to(len).freeze(),
                };
                self.buf_offset = cut;
                return Ok(Some(chunk));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let data = self.buf.split().freeze();
                let chunk = Chunk {
                    offset: self.buf_offset,
                    data,
                };
                self.buf_offset = chunk.end();
                return Ok(Some(chunk));
            }

            let n = self.reader.read(&mut self.read_buf).await?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            let cuts = self.chunker.push(&self.read_buf[..n]);
            self.buf.extend_from_slice(&self.read_buf[..n]);
            self.cuts.extend(cuts);
        }
    }
}

/// 把字节流切成惰性的块序列，可处理任意长度的流
pub fn chunk_stream<R>(reader: R, params: ChunkerParams) -> impl Stream<Item = io::Result<Chunk>>
where
    R: AsyncRead + Unpin,
{
    let state = StreamState {
        reader,
        chunker: Chunker::new(params),
        buf: BytesMut::with_capacity(READ_SIZE),
        buf_offset: 0,
        cuts: VecDeque::new(),
        read_buf: vec![0u8; READ_SIZE],
        eof: false,
    };
    futures::stream::try_unfold(state, |mut state| async move {
        Ok(state.next_chunk().await?.map(|chunk| (chunk, state)))
    })
}
