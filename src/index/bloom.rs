//! 包级 Bloom 过滤器：只用于等值判定，只会把 SOME 收窄为 NONE

use std::collections::HashSet;
use byteorder::{ByteOrder, LittleEndian};
use crate::common::{OlapError, Result, RsValue};
use crate::index::RoughIndex;

/// 单包过滤器上限；超出则不建（查询时退化为 SOME）
const MAX_FILTER_BYTES: usize = 64 * 1024;
const NUM_PROBES: u64 = 7;

/// 双哈希位数组（FNV-1a 两组种子）
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilter {
    bits:     Vec<u8>,
    num_bits: usize,
}

impl BloomFilter {
    /// 根据期望基数创建（num_bits ≈ ndv × bits_per_key）
    pub fn new(expected_ndv: usize, bits_per_key: usize) -> Self {
        let num_bits  = (expected_ndv * bits_per_key).max(64);
        let num_bytes = num_bits.div_ceil(8);
        Self { bits: vec![0u8; num_bytes], num_bits: num_bytes * 8 }
    }

    fn hashes(value: &[u8]) -> (u64, u64) {
        let mut h1: u64 = 0xcbf29ce484222325;
        let mut h2: u64 = 0x84222325cbf29ce4;
        for &b in value {
            h1 ^= b as u64;
            h1 = h1.wrapping_mul(0x100000001b3);
            h2 = (h2 ^ b as u64).wrapping_mul(0x9e3779b97f4a7c15);
        }
        (h1, h2 | 1)
    }

    fn probe_bits(&self, value: &[u8]) -> impl Iterator<Item = usize> {
        let (h1, h2) = Self::hashes(value);
        let nb = self.num_bits as u64;
        (0..NUM_PROBES).map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % nb) as usize)
    }

    pub fn add(&mut self, value: &[u8]) {
        let bits: Vec<usize> = self.probe_bits(value).collect();
        for bit in bits {
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    pub fn may_contain(&self, value: &[u8]) -> bool {
        if self.num_bits == 0 { return true; }
        self.probe_bits(value).all(|bit| self.bits[bit / 8] & (1 << (bit % 8)) != 0)
    }

    pub fn byte_len(&self) -> usize { self.bits.len() }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bloom {
    bits_per_key: usize,
    packs:        Vec<Option<BloomFilter>>,
}

impl Bloom {
    pub fn new(bits_per_key: usize) -> Self { Self { bits_per_key: bits_per_key.max(1), packs: Vec::new() } }

    pub fn num_packs(&self) -> usize { self.packs.len() }

    fn slot(&mut self, pack: usize) -> &mut Option<BloomFilter> {
        if self.packs.len() <= pack {
            self.packs.resize(pack + 1, None);
        }
        &mut self.packs[pack]
    }

    pub fn invalidate(&mut self, pack: usize) { *self.slot(pack) = None; }

    /// 以包内全部非空键重建；键过多时不建
    pub fn update<'a, I>(&mut self, pack_no: usize, keys: I)
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let distinct: HashSet<&[u8]> = keys.into_iter().collect();
        let mut bf = BloomFilter::new(distinct.len(), self.bits_per_key);
        let filter = if bf.byte_len() > MAX_FILTER_BYTES {
            None
        } else {
            for k in &distinct { bf.add(k); }
            Some(bf)
        };
        *self.slot(pack_no) = filter;
    }

    /// 仅 v1 == v2 时有意义
    pub fn is_value(&self, v1: &[u8], v2: &[u8], pack: usize) -> RsValue {
        if v1 != v2 { return RsValue::Some; }
        match self.packs.get(pack) {
            Some(Some(bf)) if !bf.may_contain(v1) => RsValue::None,
            _                                      => RsValue::Some,
        }
    }
}

impl RoughIndex for Bloom {
    const KIND: &'static str = "bloom";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.bits_per_key as u32).to_le_bytes());
        out.extend_from_slice(&(self.packs.len() as u32).to_le_bytes());
        for p in &self.packs {
            match p {
                None => out.extend_from_slice(&0u32.to_le_bytes()),
                Some(bf) => {
                    out.extend_from_slice(&(bf.bits.len() as u32).to_le_bytes());
                    out.extend_from_slice(&bf.bits);
                }
            }
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let short = || OlapError::Database("short bloom filter".into());
        if data.len() < 8 { return Err(short()); }
        let bits_per_key = LittleEndian::read_u32(&data[0..4]) as usize;
        let n = LittleEndian::read_u32(&data[4..8]) as usize;
        let mut pos = 8;
        let mut packs = Vec::with_capacity(n);
        for _ in 0..n {
            let len = LittleEndian::read_u32(data.get(pos..pos + 4).ok_or_else(short)?) as usize;
            pos += 4;
            if len == 0 {
                packs.push(None);
                continue;
            }
            let bits = data.get(pos..pos + len).ok_or_else(short)?.to_vec();
            pos += len;
            packs.push(Some(BloomFilter { num_bits: bits.len() * 8, bits }));
        }
        Ok(Self { bits_per_key, packs })
    }
}
