//! 包级直方图：把 (min, max) 开区间映射到 1024 位
//!
//! - 精确模式（max - min ≤ 1022）：位 = v - min - 1，每个取值一位
//! - 区间模式：位 = ⌊(v - min - 1) / L⌋，L = (max - min) / 1024，截断到 1023
//!
//! 写入与查询使用同一映射；映射单调，因此不会产生错误的 NONE。
//! min / max 本身不进位图，它们一定存在于包中。

use byteorder::{ByteOrder, LittleEndian};
use crate::common::{OlapError, Result, RsValue};
use crate::dpn::Dpn;
use crate::index::RoughIndex;
use crate::pack::PackSource;

pub const RSI_HIST_BITS: usize = 1024;
const WORDS: usize = RSI_HIST_BITS / 64;

#[derive(Debug, Clone, PartialEq)]
struct HistPack {
    built: bool,
    bits:  [u64; WORDS],
}

impl Default for HistPack {
    fn default() -> Self { Self { built: false, bits: [0; WORDS] } }
}

impl HistPack {
    fn set(&mut self, bit: usize) { self.bits[bit / 64] |= 1 << (bit % 64); }
    fn get(&self, bit: usize) -> bool { self.bits[bit / 64] >> (bit % 64) & 1 == 1 }

    fn any_in(&self, lo: usize, hi: usize) -> bool {
        (lo..=hi.min(RSI_HIST_BITS - 1)).any(|b| self.get(b))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    /// 定点列；实数列按 f64 计算
    fixed: bool,
    packs: Vec<HistPack>,
}

impl Histogram {
    pub fn new(fixed: bool) -> Self { Self { fixed, packs: Vec::new() } }

    pub fn num_packs(&self) -> usize { self.packs.len() }

    pub fn is_built(&self, pack: usize) -> bool {
        self.packs.get(pack).is_some_and(|p| p.built)
    }

    /// 精确模式下每个取值独占一位
    pub fn exact_mode(&self, min: i64, max: i64) -> bool {
        self.fixed && span(min, max) <= (RSI_HIST_BITS - 2) as u128
    }

    fn slot(&mut self, pack: usize) -> &mut HistPack {
        if self.packs.len() <= pack {
            self.packs.resize_with(pack + 1, HistPack::default);
        }
        &mut self.packs[pack]
    }

    pub fn invalidate(&mut self, pack: usize) {
        *self.slot(pack) = HistPack::default();
    }

    /// 依据包内容重建该包的位图
    pub fn update<P: PackSource + ?Sized>(&mut self, pack_no: usize, dpn: &Dpn, pack: Option<&P>) {
        let fixed = self.fixed;
        let slot = self.slot(pack_no);
        *slot = HistPack { built: true, bits: [0; WORDS] };
        if dpn.trivial() || dpn.null_only() {
            return;
        }
        let Some(pack) = pack else {
            slot.built = false;
            return;
        };
        let (min, max) = (dpn.min_i, dpn.max_i);
        if !fixed && real_interval(min, max).is_none() {
            slot.built = false;
            return;
        }
        for row in 0..pack.num_records() {
            if pack.is_null(row) { continue; }
            let v = pack.get_val_int(row);
            if v == min || v == max { continue; }
            let bit = if fixed { int_bit(v, min, max) } else { real_bit(v, min, max) };
            if let Some(bit) = bit { slot.set(bit); }
        }
    }

    /// 区间 [v1, v2] 在包中的粗糙判定；实数列传 f64 位模式
    pub fn is_value(&self, v1: i64, v2: i64, pack: usize, pack_min: i64, pack_max: i64) -> RsValue {
        if self.fixed {
            self.is_value_int(v1, v2, pack, pack_min, pack_max)
        } else {
            self.is_value_real(v1, v2, pack, pack_min, pack_max)
        }
    }

    fn is_value_int(&self, v1: i64, v2: i64, pack: usize, min: i64, max: i64) -> RsValue {
        if v1 > v2 || v1 > max || v2 < min {
            return RsValue::None;
        }
        if v1 <= min && v2 >= max {
            return RsValue::All;
        }
        if v1 <= min || v2 >= max {
            return RsValue::Some;
        }
        let Some(hp) = self.packs.get(pack).filter(|p| p.built) else {
            return RsValue::Some;
        };
        match (int_bit(v1, min, max), int_bit(v2, min, max)) {
            (Some(b1), Some(b2)) if !hp.any_in(b1, b2) => RsValue::None,
            _                                           => RsValue::Some,
        }
    }

    fn is_value_real(&self, v1: i64, v2: i64, pack: usize, min: i64, max: i64) -> RsValue {
        let (d1, d2) = (f64::from_bits(v1 as u64), f64::from_bits(v2 as u64));
        let (dmin, dmax) = (f64::from_bits(min as u64), f64::from_bits(max as u64));
        if d1 > d2 || d1 > dmax || d2 < dmin {
            return RsValue::None;
        }
        if d1 <= dmin && d2 >= dmax {
            return RsValue::All;
        }
        if d1 <= dmin || d2 >= dmax {
            return RsValue::Some;
        }
        let Some(hp) = self.packs.get(pack).filter(|p| p.built) else {
            return RsValue::Some;
        };
        match (real_bit(v1, min, max), real_bit(v2, min, max)) {
            (Some(b1), Some(b2)) if !hp.any_in(b1, b2) => RsValue::None,
            _                                           => RsValue::Some,
        }
    }

    /// 两个包是否可能有公共取值（仅定点列）
    pub fn intersection(
        &self,
        pack:  usize, min:  i64, max:  i64,
        other: &Histogram,
        pack2: usize, min2: i64, max2: i64,
    ) -> bool {
        if min > max2 || min2 > max {
            return false;
        }
        if !self.fixed || !other.fixed || !self.exact_mode(min, max) || !other.exact_mode(min2, max2) {
            return true;
        }
        let (Some(a), Some(b)) = (
            self.packs.get(pack).filter(|p| p.built),
            other.packs.get(pack2).filter(|p| p.built),
        ) else {
            return true;
        };
        let has = |hp: &HistPack, lo: i64, hi: i64, v: i64| -> bool {
            v == lo || v == hi || (v > lo && v < hi && hp.get((v - lo - 1) as usize))
        };
        // 枚举一侧的全部取值（含两端），检查另一侧
        let lo = min.max(min2);
        let hi = max.min(max2);
        (lo..=hi).any(|v| has(a, min, max, v) && has(b, min2, max2, v))
    }
}

fn span(min: i64, max: i64) -> u128 {
    (max as i128 - min as i128).max(0) as u128
}

/// v 必须严格位于 (min, max)
fn int_bit(v: i64, min: i64, max: i64) -> Option<usize> {
    if v <= min || v >= max { return None; }
    let span = span(min, max);
    let off = (v as i128 - min as i128 - 1) as u128;
    if span <= (RSI_HIST_BITS - 2) as u128 {
        return Some(off as usize);
    }
    let interval = span as f64 / RSI_HIST_BITS as f64;
    Some(((off as f64 / interval) as usize).min(RSI_HIST_BITS - 1))
}

fn real_interval(min: i64, max: i64) -> Option<f64> {
    let (dmin, dmax) = (f64::from_bits(min as u64), f64::from_bits(max as u64));
    let interval = (dmax - dmin) / RSI_HIST_BITS as f64;
    (interval.is_finite() && interval > 0.0).then_some(interval)
}

fn real_bit(v: i64, min: i64, max: i64) -> Option<usize> {
    let interval = real_interval(min, max)?;
    let d = f64::from_bits(v as u64) - f64::from_bits(min as u64);
    if d.is_nan() { return None; }
    Some(((d / interval).max(0.0) as usize).min(RSI_HIST_BITS - 1))
}

impl RoughIndex for Histogram {
    const KIND: &'static str = "hist";

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.packs.len() * (1 + WORDS * 8));
        out.push(self.fixed as u8);
        out.extend_from_slice(&(self.packs.len() as u32).to_le_bytes());
        for p in &self.packs {
            out.push(p.built as u8);
            let start = out.len();
            out.resize(start + WORDS * 8, 0);
            LittleEndian::write_u64_into(&p.bits, &mut out[start..]);
        }
        out
    }

    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(OlapError::Database("short histogram".into()));
        }
        let fixed = data[0] != 0;
        let n = LittleEndian::read_u32(&data[1..5]) as usize;
        let rec = 1 + WORDS * 8;
        if data.len() != 5 + n * rec {
            return Err(OlapError::Database("histogram size mismatch".into()));
        }
        let packs = data[5..].chunks_exact(rec).map(|c| {
            let mut bits = [0u64; WORDS];
            LittleEndian::read_u64_into(&c[1..], &mut bits);
            HistPack { built: c[0] != 0, bits }
        }).collect();
        Ok(Self { fixed, packs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::TxId;
    use crate::field_type::PackType;
    use crate::pack::Pack;

    fn int_pack(vals: &[i64]) -> (Dpn, Pack) {
        let mut p = Pack::new(PackType::Int);
        let mut d = Dpn::init(TxId(1), PackType::Int, None);
        for &v in vals {
            p.push_int(v);
            d.min_i = d.min_i.min(v);
            d.max_i = d.max_i.max(v);
        }
        d.num_of_records = vals.len() as u32;
        (d, p)
    }

    #[test]
    fn exact_mode_finds_gaps() {
        let (d, p) = int_pack(&[10, 12, 20]);
        let mut h = Histogram::new(true);
        h.update(0, &d, Some(&p));
        assert!(h.exact_mode(10, 20));
        assert_eq!(h.is_value(11, 11, 0, 10, 20), RsValue::None);
        assert_eq!(h.is_value(12, 12, 0, 10, 20), RsValue::Some);
        assert_eq!(h.is_value(13, 19, 0, 10, 20), RsValue::None);
        assert_eq!(h.is_value(5, 25, 0, 10, 20), RsValue::All);
        assert_eq!(h.is_value(21, 25, 0, 10, 20), RsValue::None);
        assert_eq!(h.is_value(10, 11, 0, 10, 20), RsValue::Some);
    }

    #[test]
    fn interval_mode_is_conservative() {
        let vals: Vec<i64> = vec![0, 500_000, 1_000_000, 999_999, 3];
        let (d, p) = int_pack(&vals);
        let mut h = Histogram::new(true);
        h.update(0, &d, Some(&p));
        assert!(!h.exact_mode(0, 1_000_000));
        for &v in &vals {
            assert_ne!(h.is_value(v, v, 0, 0, 1_000_000), RsValue::None);
        }
        assert_eq!(h.is_value(200_000, 300_000, 0, 0, 1_000_000), RsValue::None);
    }

    #[test]
    fn extreme_span_does_not_overflow() {
        let vals = vec![i64::MIN + 2, -1, 7, i64::MAX - 1];
        let (d, p) = int_pack(&vals);
        let mut h = Histogram::new(true);
        h.update(0, &d, Some(&p));
        assert_ne!(h.is_value(-1, -1, 0, d.min_i, d.max_i), RsValue::None);
        assert_ne!(h.is_value(7, 7, 0, d.min_i, d.max_i), RsValue::None);
    }

    #[test]
    fn unbuilt_pack_is_some() {
        let h = Histogram::new(true);
        assert_eq!(h.is_value(15, 15, 3, 10, 20), RsValue::Some);
    }

    #[test]
    fn real_values() {
        let vals = [0.5f64, 2.25, 100.0];
        let mut p = Pack::new(PackType::Int);
        let mut d = Dpn::init(TxId(1), PackType::Int, None);
        for v in vals { p.push_int(v.to_bits() as i64); }
        d.num_of_records = 3;
        d.min_i = 0.5f64.to_bits() as i64;
        d.max_i = 100.0f64.to_bits() as i64;
        let mut h = Histogram::new(false);
        h.update(0, &d, Some(&p));
        let b = |x: f64| x.to_bits() as i64;
        assert_eq!(h.is_value(b(2.25), b(2.25), 0, d.min_i, d.max_i), RsValue::Some);
        assert_eq!(h.is_value(b(50.0), b(60.0), 0, d.min_i, d.max_i), RsValue::None);
    }

    #[test]
    fn intersection_uses_exact_bits() {
        let (d1, p1) = int_pack(&[0, 4, 10]);
        let (d2, p2) = int_pack(&[1, 5, 9]);
        let (d3, p3) = int_pack(&[2, 4, 8]);
        let mut a = Histogram::new(true);
        let mut b = Histogram::new(true);
        a.update(0, &d1, Some(&p1));
        b.update(0, &d2, Some(&p2));
        b.update(1, &d3, Some(&p3));
        assert!(!a.intersection(0, 0, 10, &b, 0, 1, 9));
        assert!(a.intersection(0, 0, 10, &b, 1, 2, 8));
        assert!(!a.intersection(0, 0, 10, &b, 0, 11, 20));
    }

    #[test]
    fn encoding_keeps_bits() {
        let (d, p) = int_pack(&[1, 5, 9]);
        let mut h = Histogram::new(true);
        h.update(2, &d, Some(&p));
        let back = Histogram::decode(&h.encode()).unwrap();
        assert_eq!(back, h);
        assert!(!back.is_built(0));
    }
}
