//! 粗糙检查（RoughCheck）：不解压包，按 DPN 与粗糙集索引判定谓词
//!
//! 代价从低到高依次使用：DPN min/max → Histogram / CMap → Bloom。
//! 否定算子按正向求值后翻转；有 null 可能时 ALL 一律放宽为 SOME。

use std::cmp::Ordering;
use crate::attr::{int_bloom_key, Attr};
use crate::common::{RsValue, MINUS_INF_64, PLUS_INF_64};
use crate::dpn::{str_prefix, Dpn};
use crate::field_type::{PackType, Value};
use crate::index::cmap::prefix_length;

/// IN 列表逐值检查的上限
const MAX_IN_CHECK: usize = 64;

pub const DEFAULT_LIKE_ESCAPE: u8 = b'\\';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Less,
    LessEq,
    More,
    MoreEq,
    Between,
    NotBetween,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    NotNull,
    True,
    False,
}

impl Operator {
    /// 否定形式按正向求值后翻转
    pub fn is_negated(self) -> bool {
        matches!(self, Self::NotEq | Self::NotBetween | Self::NotLike | Self::NotIn)
    }

    pub fn positive(self) -> Self {
        match self {
            Self::NotEq      => Self::Eq,
            Self::NotBetween => Self::Between,
            Self::NotLike    => Self::Like,
            Self::NotIn      => Self::In,
            op               => op,
        }
    }
}

/// 单列谓词
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub op:     Operator,
    pub val1:   Value,
    pub val2:   Value,
    pub set:    Vec<Value>,
    pub escape: u8,
}

impl Descriptor {
    fn with(op: Operator, val1: Value, val2: Value, set: Vec<Value>) -> Self {
        Self { op, val1, val2, set, escape: DEFAULT_LIKE_ESCAPE }
    }

    /// `=`, `<>`, `<`, `<=`, `>`, `>=`
    pub fn compare(op: Operator, v: Value) -> Self { Self::with(op, v, Value::Null, Vec::new()) }

    pub fn eq(v: Value) -> Self { Self::compare(Operator::Eq, v) }

    pub fn between(lo: Value, hi: Value) -> Self { Self::with(Operator::Between, lo, hi, Vec::new()) }

    pub fn not_between(lo: Value, hi: Value) -> Self {
        Self::with(Operator::NotBetween, lo, hi, Vec::new())
    }

    pub fn like(pattern: &[u8]) -> Self {
        Self::with(Operator::Like, Value::Bytes(pattern.to_vec()), Value::Null, Vec::new())
    }

    pub fn not_like(pattern: &[u8]) -> Self {
        Self::with(Operator::NotLike, Value::Bytes(pattern.to_vec()), Value::Null, Vec::new())
    }

    pub fn in_set(values: Vec<Value>) -> Self { Self::with(Operator::In, Value::Null, Value::Null, values) }

    pub fn not_in(values: Vec<Value>) -> Self {
        Self::with(Operator::NotIn, Value::Null, Value::Null, values)
    }

    pub fn is_null()  -> Self { Self::with(Operator::IsNull, Value::Null, Value::Null, Vec::new()) }
    pub fn not_null() -> Self { Self::with(Operator::NotNull, Value::Null, Value::Null, Vec::new()) }

    /// 常量谓词
    pub fn constant(b: bool) -> Self {
        let op = if b { Operator::True } else { Operator::False };
        Self::with(op, Value::Null, Value::Null, Vec::new())
    }

    pub fn with_escape(mut self, escape: u8) -> Self { self.escape = escape; self }

    /// 逐行求值（null 不满足除 IS NULL 外的任何谓词）
    pub fn matches(&self, v: &Value) -> bool {
        let pos = self.op.positive();
        let r = match pos {
            Operator::True    => return true,
            Operator::False   => return false,
            Operator::IsNull  => return v.is_null(),
            Operator::NotNull => return !v.is_null(),
            _ if v.is_null()  => return false,
            Operator::Eq      => cmp_values(v, &self.val1) == Some(Ordering::Equal),
            Operator::Less    => cmp_values(v, &self.val1) == Some(Ordering::Less),
            Operator::LessEq  => matches!(cmp_values(v, &self.val1), Some(Ordering::Less | Ordering::Equal)),
            Operator::More    => cmp_values(v, &self.val1) == Some(Ordering::Greater),
            Operator::MoreEq  => matches!(cmp_values(v, &self.val1), Some(Ordering::Greater | Ordering::Equal)),
            Operator::Between => {
                matches!(cmp_values(v, &self.val1), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp_values(v, &self.val2), Some(Ordering::Less | Ordering::Equal))
            }
            Operator::Like => match (v.as_bytes(), self.val1.as_bytes()) {
                (Some(s), Some(p)) => like_match(s, p, self.escape),
                _                  => false,
            },
            Operator::In => {
                if pos != self.op && self.set.iter().any(Value::is_null) {
                    return false;
                }
                self.set.iter().any(|x| cmp_values(v, x) == Some(Ordering::Equal))
            }
            _ => false,
        };
        if self.op.is_negated() { !r } else { r }
    }
}

fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.as_slice().cmp(y.as_slice())),
        (Value::Float32(_) | Value::Float64(_), _) | (_, Value::Float32(_) | Value::Float64(_)) => {
            a.as_f64()?.partial_cmp(&b.as_f64()?)
        }
        _ => Some(a.as_i64()?.cmp(&b.as_i64()?)),
    }
}

/// SQL LIKE：'%' 任意串，'_' 任意单字节，escape 之后的字符按字面匹配
pub fn like_match(s: &[u8], pat: &[u8], escape: u8) -> bool {
    let (mut si, mut pi) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < pat.len() {
            match pat[pi] {
                b'%' => {
                    backtrack = Some((pi + 1, si));
                    pi += 1;
                    continue;
                }
                c if c == escape && pi + 1 < pat.len() => {
                    if pat[pi + 1] == s[si] {
                        pi += 2;
                        si += 1;
                        continue;
                    }
                }
                b'_' => {
                    pi += 1;
                    si += 1;
                    continue;
                }
                c if c == s[si] => {
                    pi += 1;
                    si += 1;
                    continue;
                }
                _ => {}
            }
        }
        match backtrack {
            Some((bp, bs)) => {
                pi = bp;
                si = bs + 1;
                backtrack = Some((bp, bs + 1));
            }
            None => return false,
        }
    }
    pat[pi..].iter().all(|&c| c == b'%')
}

/// 数值区间；real 列的端点可能是开区间
#[derive(Debug, Clone, Copy)]
struct NumRange {
    lo:       i64,
    hi:       i64,
    lo_sharp: bool,
    hi_sharp: bool,
}

impl Attr {
    /// 包内公共前缀长度（字符串包）
    pub fn prefix_length(&self, pack: usize) -> usize { prefix_length(&self.dpn(pack)) }

    /// 包内最长字符串的字节数
    pub fn actual_size(&self, pack: usize) -> usize { self.dpn(pack).max_len() }

    pub fn rough_check(&self, pack: usize, d: &Descriptor, additional_nulls: bool) -> RsValue {
        match d.op {
            Operator::True  => return RsValue::All,
            Operator::False => return RsValue::None,
            _               => {}
        }
        let dpn = self.dpn(pack);
        if dpn.null_only() {
            return if d.op == Operator::IsNull { RsValue::All } else { RsValue::None };
        }
        let nulls_possible = dpn.num_of_nulls > 0 || additional_nulls;
        match d.op {
            Operator::IsNull  => {
                return if nulls_possible { RsValue::Some } else { RsValue::None };
            }
            Operator::NotNull => {
                return if nulls_possible { RsValue::Some } else { RsValue::All };
            }
            _ => {}
        }
        if d.op == Operator::NotIn && d.set.iter().any(Value::is_null) {
            return RsValue::None;
        }

        let res = match self.pack_type() {
            PackType::Int => self.rough_check_num(pack, &dpn, d),
            PackType::Str => self.rough_check_str(pack, &dpn, d),
        };
        let res = if d.op.is_negated() { res.negate() } else { res };
        res.widen_if(nulls_possible)
    }

    /// 数值区间 [v1, v2] 的基本判定；real 列传 f64 位模式
    pub fn rough_check_between(&self, pack: usize, v1: i64, v2: i64) -> RsValue {
        let dpn = self.dpn(pack);
        if dpn.null_only() {
            return RsValue::None;
        }
        let range = NumRange { lo: v1, hi: v2, lo_sharp: false, hi_sharp: false };
        self.between_num(pack, &dpn, range)
    }

    fn between_num(&self, pack: usize, dpn: &Dpn, r: NumRange) -> RsValue {
        let res = if self.column_type().is_real() {
            self.between_real(pack, dpn, r)
        } else {
            self.between_int(pack, dpn, r.lo, r.hi)
        };
        if res == RsValue::None || r.lo != r.hi || r.lo_sharp || r.hi_sharp {
            return res;
        }
        match &self.bloom {
            Some(b) => {
                let key = int_bloom_key(r.lo, self.column_type());
                res.and(b.is_value(&key, &key, pack))
            }
            None => res,
        }
    }

    fn between_int(&self, pack: usize, dpn: &Dpn, v1: i64, v2: i64) -> RsValue {
        let (min, max) = (dpn.min_i, dpn.max_i);
        if v1 > v2 || v1 > max || v2 < min {
            return RsValue::None;
        }
        if v1 <= min && v2 >= max {
            return RsValue::All;
        }
        match &self.hist {
            Some(h) => h.is_value(v1, v2, pack, min, max),
            None    => RsValue::Some,
        }
    }

    fn between_real(&self, pack: usize, dpn: &Dpn, r: NumRange) -> RsValue {
        let (d1, d2) = (f64::from_bits(r.lo as u64), f64::from_bits(r.hi as u64));
        let (dmin, dmax) = (dpn.min_d(), dpn.max_d());
        if d1 > d2 || d1 > dmax || d2 < dmin {
            return RsValue::None;
        }
        if (r.lo_sharp && d1 >= dmax) || (r.hi_sharp && d2 <= dmin) {
            return RsValue::None;
        }
        if d1 <= dmin && d2 >= dmax {
            let open_end = (r.lo_sharp && d1 == dmin) || (r.hi_sharp && d2 == dmax);
            return if open_end { RsValue::Some } else { RsValue::All };
        }
        match &self.hist {
            Some(h) => match h.is_value(r.lo, r.hi, pack, dpn.min_i, dpn.max_i) {
                RsValue::All => RsValue::Some,
                other        => other,
            },
            None => RsValue::Some,
        }
    }

    /// 比较算子化为区间；整数列的开端点收缩一格
    fn num_range(&self, op: Operator, v: i64) -> Option<NumRange> {
        let real = self.column_type().is_real();
        let (lo_inf, hi_inf) = if real {
            (f64::NEG_INFINITY.to_bits() as i64, f64::INFINITY.to_bits() as i64)
        } else {
            (MINUS_INF_64, PLUS_INF_64)
        };
        let closed = |lo, hi| Some(NumRange { lo, hi, lo_sharp: false, hi_sharp: false });
        match op {
            Operator::Eq     => closed(v, v),
            Operator::LessEq => closed(lo_inf, v),
            Operator::MoreEq => closed(v, hi_inf),
            Operator::Less if real => Some(NumRange { lo: lo_inf, hi: v, lo_sharp: false, hi_sharp: true }),
            Operator::More if real => Some(NumRange { lo: v, hi: hi_inf, lo_sharp: true, hi_sharp: false }),
            Operator::Less => v.checked_sub(1).and_then(|hi| closed(MINUS_INF_64, hi)),
            Operator::More => v.checked_add(1).and_then(|lo| closed(lo, PLUS_INF_64)),
            _              => None,
        }
    }

    fn to_num(&self, v: &Value) -> Option<i64> {
        match v.to_pack_int(self.column_type()) {
            Ok(Some(x)) => Some(x),
            _           => None,
        }
    }

    fn rough_check_num(&self, pack: usize, dpn: &Dpn, d: &Descriptor) -> RsValue {
        match d.op.positive() {
            Operator::Between => {
                let (Some(lo), Some(hi)) = (self.to_num(&d.val1), self.to_num(&d.val2)) else {
                    return RsValue::Some;
                };
                self.between_num(pack, dpn, NumRange { lo, hi, lo_sharp: false, hi_sharp: false })
            }
            Operator::In => self.rough_check_num_in(pack, dpn, &d.set),
            op @ (Operator::Eq | Operator::Less | Operator::LessEq | Operator::More | Operator::MoreEq) => {
                let Some(v) = self.to_num(&d.val1) else { return RsValue::Some; };
                match self.num_range(op, v) {
                    Some(r) => self.between_num(pack, dpn, r),
                    // x < MIN 或 x > MAX
                    None => RsValue::None,
                }
            }
            _ => RsValue::Some,
        }
    }

    fn rough_check_num_in(&self, pack: usize, dpn: &Dpn, set: &[Value]) -> RsValue {
        let mut vals = Vec::with_capacity(set.len());
        for v in set.iter().filter(|v| !v.is_null()) {
            match self.to_num(v) {
                Some(x) => vals.push(x),
                None    => return RsValue::Some,
            }
        }
        if vals.is_empty() {
            return RsValue::None;
        }
        if self.column_type().is_real() {
            let (dmin, dmax) = (dpn.min_d(), dpn.max_d());
            let inside = vals.iter().any(|&x| {
                let f = f64::from_bits(x as u64);
                !(f < dmin || f > dmax)
            });
            return if inside { RsValue::Some } else { RsValue::None };
        }

        let (min, max) = (dpn.min_i, dpn.max_i);
        let (smin, smax) = vals.iter().fold((PLUS_INF_64, MINUS_INF_64), |(a, b), &x| (a.min(x), b.max(x)));
        if smax < min || smin > max {
            return RsValue::None;
        }
        if min == max {
            return if vals.contains(&min) { RsValue::All } else { RsValue::None };
        }
        let mut res = match &self.hist {
            Some(h) => h.is_value(smin, smax, pack, min, max),
            None    => RsValue::Some,
        };
        if res == RsValue::All {
            res = RsValue::Some;
        }
        if res == RsValue::Some && vals.len() < MAX_IN_CHECK {
            let possible = vals.iter().any(|&x| {
                if x < min || x > max { return false; }
                let by_hist = self.hist.as_ref()
                    .map_or(RsValue::Some, |h| h.is_value(x, x, pack, min, max));
                if by_hist == RsValue::None { return false; }
                let key = int_bloom_key(x, self.column_type());
                self.bloom.as_ref().map_or(true, |b| b.is_value(&key, &key, pack) != RsValue::None)
            });
            if !possible {
                res = RsValue::None;
            }
        }
        res
    }

    // ── 字符串 ────────────────────────────────────────────────────────────────

    fn rough_check_str(&self, pack: usize, dpn: &Dpn, d: &Descriptor) -> RsValue {
        match d.op.positive() {
            Operator::Like => match d.val1.as_bytes() {
                Some(p) => self.rough_check_like(pack, dpn, p, d.escape),
                None    => RsValue::Some,
            },
            Operator::In => self.rough_check_str_in(pack, dpn, &d.set),
            Operator::Between => match (d.val1.as_bytes(), d.val2.as_bytes()) {
                (Some(lo), Some(hi)) => self.rough_check_str_between(pack, dpn, Some(lo), Some(hi)),
                _                    => RsValue::Some,
            },
            op @ (Operator::Eq | Operator::Less | Operator::LessEq | Operator::More | Operator::MoreEq) => {
                let Some(v) = d.val1.as_bytes() else { return RsValue::Some; };
                let res = match op {
                    Operator::Eq => self.rough_check_str_between(pack, dpn, Some(v), Some(v)),
                    Operator::Less | Operator::LessEq => self.rough_check_str_between(pack, dpn, None, Some(v)),
                    _ => self.rough_check_str_between(pack, dpn, Some(v), None),
                };
                // 开端点恰好落在唯一取值上
                if matches!(op, Operator::Less | Operator::More) && res == RsValue::All
                    && self.single_value(dpn).is_some_and(|s| s == v)
                {
                    return RsValue::None;
                }
                res
            }
            _ => RsValue::Some,
        }
    }

    /// 包内全部非空串相同时返回该串
    fn single_value(&self, dpn: &Dpn) -> Option<Vec<u8>> {
        let pp = prefix_length(dpn);
        (pp == dpn.max_len()).then(|| dpn.min_s()[..pp].to_vec())
    }

    /// 闭区间 [lo, hi]，缺省端点视为无界
    fn rough_check_str_between(
        &self,
        pack: usize,
        dpn:  &Dpn,
        lo:   Option<&[u8]>,
        hi:   Option<&[u8]>,
    ) -> RsValue {
        let (min_s, max_s) = (dpn.min_s(), dpn.max_s());
        let actual = dpn.max_len();
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo > hi {
                return RsValue::None;
            }
            let common = lo.iter().zip(hi).take_while(|(a, b)| a == b).count();
            if common > actual {
                return RsValue::None;
            }
        }
        if lo.is_some_and(|v| str_prefix(v) > max_s) || hi.is_some_and(|v| str_prefix(v) < min_s) {
            return RsValue::None;
        }

        if let Some(only) = self.single_value(dpn) {
            let ge = lo.map_or(true, |v| only.as_slice() >= v);
            let le = hi.map_or(true, |v| only.as_slice() <= v);
            return if ge && le { RsValue::All } else { RsValue::None };
        }
        let below = lo.map_or(true, |v| str_prefix(v) < min_s);
        let above = hi.map_or(true, |v| str_prefix(v) > max_s);
        if below && above {
            return RsValue::All;
        }

        let (Some(lo), Some(hi)) = (lo, hi) else { return RsValue::Some; };
        if lo == hi && lo.len() > actual {
            return RsValue::None;
        }
        let pp = prefix_length(dpn);
        let pfx = &min_s[..pp];
        let mut res = RsValue::Some;
        if let Some(c) = &self.cmap {
            if lo.starts_with(pfx) && hi.starts_with(pfx) {
                res = c.is_value(&lo[pp..], &hi[pp..], pack);
            } else if lo == hi {
                return RsValue::None;
            }
        }
        if res != RsValue::None && lo == hi {
            if let Some(b) = &self.bloom {
                res = res.and(b.is_value(lo, hi, pack));
            }
        }
        res
    }

    fn rough_check_like(&self, pack: usize, dpn: &Dpn, pat: &[u8], esc: u8) -> RsValue {
        let (min_s, max_s) = (dpn.min_s(), dpn.max_s());
        let actual = dpn.max_len();
        let pattern_prefix = pat.iter().position(|&c| c == b'%').unwrap_or(pat.len());
        let fixed_prefix = pat.iter()
            .position(|&c| c == b'%' || c == b'_' || c == esc)
            .unwrap_or(pat.len());
        let has_escape = pat.contains(&esc);

        if fixed_prefix > actual {
            return RsValue::None;
        }
        if !has_escape && pattern_prefix == pat.len() && pat.len() > actual {
            return RsValue::None;
        }
        let k = fixed_prefix.min(8);
        if k > 0 && (pat[..k] < min_s[..k] || pat[..k] > max_s[..k]) {
            return RsValue::None;
        }

        let pp = prefix_length(dpn);
        let pfx = &min_s[..pp];
        let matches_pfx = |p: &[u8]| p.iter().zip(pfx).all(|(&c, &x)| c == b'_' || c == x);

        // "abc%" 形式且固定部分落在包前缀内
        if !has_escape && pattern_prefix <= pp && pat.len() == pattern_prefix + 1 {
            return if matches_pfx(&pat[..pattern_prefix]) { RsValue::All } else { RsValue::None };
        }
        let Some(c) = &self.cmap else { return RsValue::Some; };
        if pattern_prefix > pp && !pat[..pp].contains(&esc) {
            if !matches_pfx(&pat[..pp]) {
                return RsValue::None;
            }
            return c.is_like(&pat[pp..], pack, esc);
        }
        RsValue::Some
    }

    fn rough_check_str_in(&self, pack: usize, dpn: &Dpn, set: &[Value]) -> RsValue {
        let mut vals = Vec::with_capacity(set.len());
        for v in set.iter().filter(|v| !v.is_null()) {
            match v.as_bytes() {
                Some(b) => vals.push(b),
                None    => return RsValue::Some,
            }
        }
        if vals.is_empty() {
            return RsValue::None;
        }
        if let Some(only) = self.single_value(dpn) {
            return if vals.iter().any(|v| *v == only.as_slice()) { RsValue::All } else { RsValue::None };
        }
        if vals.len() >= MAX_IN_CHECK {
            return RsValue::Some;
        }
        let possible = vals.iter().any(|&v| self.rough_check_str_between(pack, dpn, Some(v), Some(v)) != RsValue::None);
        if possible { RsValue::Some } else { RsValue::None }
    }

    // ── 列与列 ────────────────────────────────────────────────────────────────

    /// 同一行范围内 `self op other` 的判定，仅整数列
    pub fn rough_check_attr(&self, pack: usize, op: Operator, other: &Attr, pack2: usize) -> RsValue {
        let (d1, d2) = (self.dpn(pack), other.dpn(pack2));
        if d1.null_only() || d2.null_only() {
            return RsValue::None;
        }
        if !self.column_type().is_fixed() || !other.column_type().is_fixed() {
            return RsValue::Some;
        }
        let nulls = d1.num_of_nulls > 0 || d2.num_of_nulls > 0;
        let (min1, max1, min2, max2) = (d1.min_i, d1.max_i, d2.min_i, d2.max_i);
        let res = match op.positive() {
            Operator::Eq => {
                if max1 < min2 || max2 < min1 {
                    RsValue::None
                } else if min1 == max1 && min2 == max2 && min1 == min2 {
                    RsValue::All
                } else {
                    let meet = match (&self.hist, &other.hist) {
                        (Some(a), Some(b)) => a.intersection(pack, min1, max1, b, pack2, min2, max2),
                        _                  => true,
                    };
                    if meet { RsValue::Some } else { RsValue::None }
                }
            }
            Operator::Less   => order_check(max1 < min2, min1 >= max2),
            Operator::LessEq => order_check(max1 <= min2, min1 > max2),
            Operator::More   => order_check(min1 > max2, max1 <= min2),
            Operator::MoreEq => order_check(min1 >= max2, max1 < min2),
            _                => RsValue::Some,
        };
        let res = if op.is_negated() { res.negate() } else { res };
        res.widen_if(nulls)
    }
}

fn order_check(all: bool, none: bool) -> RsValue {
    if all {
        RsValue::All
    } else if none {
        RsValue::None
    } else {
        RsValue::Some
    }
}
