//! 字符映射（CMap）：每包、每字节位置一个 256 位图
//!
//! 写入前先去掉包内公共前缀，因此查询值也必须按同一前缀平移。

use byteorder::{ByteOrder, LittleEndian};
use crate::common::{OlapError, Result, RsValue};
use crate::dpn::Dpn;
use crate::index::RoughIndex;
use crate::pack::PackSource;

type CharSet = [u64; 4];

#[derive(Debug, Clone, PartialEq)]
struct CMapPack {
    built:     bool,
    /// 平移后存在空串
    has_empty: bool,
    pos:       Vec<CharSet>,
}

impl CMapPack {
    fn empty(positions: usize) -> Self {
        Self { built: false, has_empty: false, pos: vec![[0; 4]; positions] }
    }

    fn set(&mut self, c: u8, pos: usize) { self.pos[pos][(c / 64) as usize] |= 1 << (c % 64); }

    fn is_set(&self, c: u8, pos: usize) -> bool {
        self.pos[pos][(c / 64) as usize] >> (c % 64) & 1 == 1
    }

    fn any_set(&self, first: u8, last: u8, pos: usize) -> bool {
        (first..=last).any(|c| self.is_set(c, pos))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CMap {
    positions: usize,
    packs:     Vec<CMapPack>,
}

impl CMap {
    pub fn new(positions: usize) -> Self { Self { positions: positions.max(1), packs: Vec::new() } }

    pub fn positions(&self) -> usize { self.positions }

    pub fn num_packs(&self) -> usize { self.packs.len() }

    fn built(&self, pack: usize) -> Option<&CMapPack> {
        self.packs.get(pack).filter(|p| p.built)
    }

    fn slot(&mut self, pack: usize) -> &mut CMapPack {
        let positions = self.positions;
        if self.packs.len() <= pack {
            self.packs.resize_with(pack + 1, || CMapPack::empty(positions));
        }
        &mut self.packs[pack]
    }

    pub fn invalidate(&mut self, pack: usize) {
        let positions = self.positions;
        *self.slot(pack) = CMapPack::empty(positions);
    }

    /// 重建一个包；值按 dpn 公共前缀平移
    pub fn update<P: PackSource + ?Sized>(&mut self, pack_no: usize, dpn: &Dpn, pack: Option<&P>) {
        let positions = self.positions;
        let slot = self.slot(pack_no);
        *slot = CMapPack::empty(positions);
        if dpn.null_only() {
            slot.built = true;
            return;
        }
        let Some(pack) = pack else { return; };
        let prefix = prefix_length(dpn);
        for row in 0..pack.num_records() {
            if pack.is_null(row) { continue; }
            let v = pack.get_val_binary(row);
            let v = v.get(prefix..).unwrap_or(&[]);
            if v.is_empty() { slot.has_empty = true; }
            for (pos, &c) in v.iter().take(positions).enumerate() {
                slot.set(c, pos);
            }
        }
        slot.built = true;
    }

    /// 平移后的区间 [min_v, max_v]
    pub fn is_value(&self, min_v: &[u8], max_v: &[u8], pack: usize) -> RsValue {
        let Some(cp) = self.built(pack) else { return RsValue::Some; };
        if min_v == max_v {
            if min_v.is_empty() {
                return if cp.has_empty { RsValue::Some } else { RsValue::None };
            }
            for (pos, &c) in min_v.iter().take(self.positions).enumerate() {
                if !cp.is_set(c, pos) { return RsValue::None; }
            }
            return RsValue::Some;
        }
        if min_v.is_empty() && cp.has_empty {
            return RsValue::Some;
        }
        let f = min_v.first().copied().unwrap_or(0);
        let l = max_v.first().copied().unwrap_or(255);
        if f > l || !cp.any_set(f, l, 0) {
            return RsValue::None;
        }
        RsValue::Some
    }

    /// 平移后的 LIKE 模式；遇到 '%' 或转义字符即停止，'_' 匹配任意字节
    pub fn is_like(&self, pattern: &[u8], pack: usize, escape: u8) -> RsValue {
        let Some(cp) = self.built(pack) else { return RsValue::Some; };
        for (pos, &c) in pattern.iter().take(self.positions).enumerate() {
            if c == b'%' || c == escape { break; }
            if c == b'_' { continue; }
            if !cp.is_set(c, pos) { return RsValue::None; }
        }
        RsValue::Some
    }

    /// 某位置出现过的不同字节数
    pub fn count(&self, pack: usize, pos: usize) -> Option<usize> {
        let cp = self.built(pack)?;
        let set = cp.pos.get(pos)?;
        Some(set.iter().map(|w| w.count_ones() as usize).sum())
    }
}

/// 包内字符串的公共前缀长度（取自 8 字节 min/max 前缀）
pub fn prefix_length(dpn: &Dpn) -> usize {
    if dpn.null_only() { return 0; }
    let (min_s, max_s) = (dpn.min_s(), dpn.max_s());
    let n = crate::dpn::prefix_len(&min_s).min(crate::dpn::prefix_len(&max_s));
    min_s.iter().zip(max_s.iter()).take(n).take_while(|(a, b)| a == b).count()
}

impl RoughIndex for CMap {
    const KIND: &'static str = "cmap";

    fn encode(&self) -> Vec<u8> {
        let rec = 2 + self.positions * 32;
        let mut out = Vec::with_capacity(8 + self.packs.len() * rec);
        out.extend_from_slice(&(self.positions as u32).to_le_bytes());
        out.extend_from_slice(&(self.packs.len() as u32).to_le_bytes());
        for p in &self.packs {
            out.push(p.built as u8);
            out.push(p.has_empty as u8);
            for set in &p.pos {
                let start = out.len();
                out.resize(start + 32, 0);
                LittleEndian::write_u64_into(set, &mut out[start..]);
            }
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(OlapError::Database("short cmap".into()));
        }
        let positions = LittleEndian::read_u32(&data[0..4]) as usize;
        let n = LittleEndian::read_u32(&data[4..8]) as usize;
        let rec = 2 + positions * 32;
        if positions == 0 || data.len() != 8 + n * rec {
            return Err(OlapError::Database("cmap size mismatch".into()));
        }
        let packs = data[8..].chunks_exact(rec).map(|c| {
            let pos = c[2..].chunks_exact(32).map(|w| {
                let mut set = [0u64; 4];
                LittleEndian::read_u64_into(w, &mut set);
                set
            }).collect();
            CMapPack { built: c[0] != 0, has_empty: c[1] != 0, pos }
        }).collect();
        Ok(Self { positions, packs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TxId;
    use crate::dpn::str_prefix;
    use crate::field_type::PackType;
    use crate::pack::Pack;

    fn str_pack(vals: &[&[u8]]) -> (Dpn, Pack) {
        let mut p = Pack::new(PackType::Str);
        let mut d = Dpn::init(TxId(1), PackType::Str, None);
        let mut min: Option<&[u8]> = None;
        let mut max: Option<&[u8]> = None;
        for &v in vals {
            p.push_str(v);
            min = Some(min.map_or(v, |m| m.min(v)));
            max = Some(max.map_or(v, |m| m.max(v)));
        }
        d.num_of_records = vals.len() as u32;
        d.set_min_s(str_prefix(min.unwrap()));
        d.set_max_s(str_prefix(max.unwrap()));
        (d, p)
    }

    #[test]
    fn prefix_is_common_part_of_min_and_max() {
        let (d, _) = str_pack(&[b"order-17", b"order-42", b"order-20"]);
        assert_eq!(prefix_length(&d), 6);
    }

    #[test]
    fn equality_checks_every_position() {
        let (d, p) = str_pack(&[b"apple", b"apricot", b"avocado"]);
        let mut c = CMap::new(64);
        c.update(0, &d, Some(&p));
        // 公共前缀 "a"
        assert_eq!(c.is_value(b"pple", b"pple", 0), RsValue::Some);
        assert_eq!(c.is_value(b"zz", b"zz", 0), RsValue::None);
        assert_eq!(c.is_value(b"pvx", b"pvx", 0), RsValue::None);
    }

    #[test]
    fn like_walks_until_percent() {
        let (d, p) = str_pack(&[b"cat", b"cow", b"cup"]);
        let mut c = CMap::new(64);
        c.update(0, &d, Some(&p));
        assert_eq!(prefix_length(&d), 1);
        assert_eq!(c.is_like(b"o%", 0, b'\\'), RsValue::Some);
        assert_eq!(c.is_like(b"_p", 0, b'\\'), RsValue::Some);
        assert_eq!(c.is_like(b"x%", 0, b'\\'), RsValue::None);
        assert_eq!(c.is_like(b"%x", 0, b'\\'), RsValue::Some);
        assert_eq!(c.count(0, 0), Some(3));
    }

    #[test]
    fn empty_remainder_is_tracked() {
        let (d, p) = str_pack(&[b"ab", b"abc"]);
        let mut c = CMap::new(8);
        c.update(0, &d, Some(&p));
        assert_eq!(c.is_value(b"", b"", 0), RsValue::Some);
        assert_eq!(c.is_value(b"", b"a", 0), RsValue::Some);
        assert_eq!(CMap::decode(&c.encode()).unwrap(), c);
    }
}
