//! PackOrderer：按包统计量给出可重启的包访问顺序
//!
//! 每个列维护一张 (排序键, 包号) 表：
//! - `MinAsc/MinDesc` 用包最小值，`MaxAsc/MaxDesc` 用包最大值
//! - `RangeSimilarity` 用 (max - min) / 2，遍历时围绕起点左右交替
//! - `Covering` 先按最小值升序，再贪心挑出尽快覆盖整个值域的包
//!
//! 只有前 `min(max_sorted_packs, size × pct / 100)` 项保持精确顺序，
//! 其余按包号排回自然顺序。多列时轮流推进，`visited` 位图保证每个包只出现一次。

use crate::common::{RsValue, PLUS_INF_64};
use crate::config::StorageConfig;

/// 排序所需的包级统计量
pub trait ColumnStats {
    fn num_packs(&self) -> usize;
    /// 定点列（整数 / 日期）才按统计量排序
    fn is_fixed(&self) -> bool;
    fn pack_min_int(&self, pack: usize) -> i64;
    fn pack_max_int(&self, pack: usize) -> i64;
    fn pack_null_only(&self, pack: usize) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    RangeSimilarity,
    MinAsc,
    MinDesc,
    MaxAsc,
    MaxDesc,
    /// 先访问能迅速覆盖整个值域的包
    Covering,
    NotSpecified,
}

/// 精确排序比例的权重
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderStat {
    pub neutral: usize,
    pub ordered: usize,
}

impl Default for OrderStat {
    fn default() -> Self { Self { neutral: 0, ordered: 1 } }
}

const INIT_VAL: isize = -1;
const END:      isize = -2;

type PackPair = (i64, usize);

#[derive(Debug, Clone)]
struct ColumnOrder {
    packs:         Vec<PackPair>,
    order:         OrderType,
    /// 无过滤且无法排序时直接按 0..dim_size 访问
    natural_order: bool,
    dim_size:      usize,
    cur:           isize,
    prev:          isize,
    /// 上一步是否向左
    lastly_left:   bool,
}

impl ColumnOrder {
    fn len(&self) -> isize {
        if self.natural_order { self.dim_size as isize } else { self.packs.len() as isize }
    }

    fn current(&self) -> Option<usize> {
        if self.cur < 0 {
            return None;
        }
        Some(if self.natural_order { self.cur as usize } else { self.packs[self.cur as usize].1 })
    }

    fn rewind(&mut self) {
        self.lastly_left = true;
        if !self.natural_order && self.packs.is_empty() {
            self.cur = END;
        } else {
            self.cur  = INIT_VAL;
            self.prev = INIT_VAL;
        }
    }

    fn next_pack(&mut self) {
        let size = self.len();
        if self.natural_order || self.order != OrderType::RangeSimilarity {
            if self.cur != END && self.cur < size - 1 {
                self.cur += 1;
            } else {
                self.cur = END;
            }
            return;
        }
        if self.cur == END {
            return;
        }
        if self.lastly_left {
            if self.prev < size - 1 {
                self.lastly_left = false;
                let tmp = self.cur;
                self.cur = self.prev + 1;
                self.prev = tmp;
            } else if self.cur > 0 {
                self.cur -= 1;
            } else {
                self.cur = END;
            }
        } else if self.prev > 0 {
            self.lastly_left = true;
            let tmp = self.cur;
            self.cur = self.prev - 1;
            self.prev = tmp;
        } else if self.cur < size - 1 {
            self.cur += 1;
        } else {
            self.cur = END;
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackOrderer {
    cols:              Vec<ColumnOrder>,
    cur_vc:            usize,
    visited:           Vec<u64>,
    ordered_up_to:     usize,
    packs_passed:      usize,
    sorted_percentage: f64,
    max_sorted_packs:  usize,
}

impl PackOrderer {
    /// 尚未初始化的空排序器
    pub fn empty(config: &StorageConfig) -> Self {
        Self {
            cols:              Vec::new(),
            cur_vc:            0,
            visited:           Vec::new(),
            ordered_up_to:     0,
            packs_passed:      0,
            sorted_percentage: config.sorted_percentage,
            max_sorted_packs:  config.max_sorted_packs,
        }
    }

    /// 单列排序器，已定位到第一个包
    pub fn new<C: ColumnStats + ?Sized>(
        col:    &C,
        order:  OrderType,
        filter: Option<&[RsValue]>,
        config: &StorageConfig,
    ) -> Self {
        let mut po = Self::empty(config);
        po.init(col, order, filter);
        po
    }

    pub fn initialized(&self) -> bool { !self.cols.is_empty() }

    /// 已初始化时返回 false
    pub fn init<C: ColumnStats + ?Sized>(&mut self, col: &C, order: OrderType, filter: Option<&[RsValue]>) -> bool {
        if self.initialized() {
            return false;
        }
        self.add_column(col, order, filter, OrderStat::default());
        true
    }

    /// 追加一列并重新定位到序列开头
    pub fn add_column<C: ColumnStats + ?Sized>(
        &mut self,
        col:    &C,
        order:  OrderType,
        filter: Option<&[RsValue]>,
        stat:   OrderStat,
    ) {
        let fixed = col.is_fixed();
        let mut packs: Vec<PackPair> = Vec::new();
        for pack in 0..col.num_packs() {
            if filter.is_some_and(|f| f.get(pack) == Some(&RsValue::None)) {
                continue;
            }
            if !fixed {
                if filter.is_none() {
                    break;
                }
                packs.push((pack as i64, pack));
                continue;
            }
            let key = if col.pack_null_only(pack) {
                PLUS_INF_64
            } else {
                let (min, max) = (col.pack_min_int(pack), col.pack_max_int(pack));
                match order {
                    OrderType::RangeSimilarity => ((max as i128 - min as i128) / 2) as i64,
                    OrderType::MinAsc | OrderType::MinDesc | OrderType::Covering => min,
                    OrderType::MaxAsc | OrderType::MaxDesc => max,
                    OrderType::NotSpecified => 0,
                }
            };
            packs.push((key, pack));
        }
        let natural_order = packs.is_empty() && filter.is_none();

        if fixed {
            match order {
                OrderType::RangeSimilarity | OrderType::MinAsc | OrderType::MaxAsc => packs.sort(),
                OrderType::MinDesc | OrderType::MaxDesc => {
                    packs.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
                }
                OrderType::Covering => reorder_for_covering(&mut packs, col),
                OrderType::NotSpecified => {}
            }
        }

        let weight = match stat.neutral + stat.ordered { 0 => 1, w => w };
        let pct = self.sorted_percentage / weight as f64;
        self.ordered_up_to = ((packs.len() as f64 * (pct / 100.0)) as usize).min(self.max_sorted_packs);
        let tail = self.ordered_up_to.min(packs.len());
        packs[tail..].sort_by_key(|p| p.1);

        self.cols.push(ColumnOrder {
            packs,
            order,
            natural_order,
            dim_size:    col.num_packs(),
            cur:         INIT_VAL,
            prev:        INIT_VAL,
            lastly_left: true,
        });
        let max_packs = self.cols.iter().map(|c| c.dim_size).max().unwrap_or(0);
        self.visited = vec![0u64; max_packs.div_ceil(64)];
        self.rewind();
    }

    fn is_visited(&self, pack: usize) -> bool { self.visited[pack / 64] >> (pack % 64) & 1 == 1 }

    fn set_visited(&mut self, pack: usize) { self.visited[pack / 64] |= 1 << (pack % 64); }

    /// 回到序列开头
    pub fn rewind(&mut self) {
        self.packs_passed = 0;
        self.visited.fill(0);
        for c in &mut self.cols {
            c.rewind();
        }
        if self.cols.is_empty() {
            return;
        }
        self.cur_vc = self.cols.len() - 1;
        self.advance();
    }

    /// 定位到与 `pack` 的区间中点最接近的位置（仅单列 RangeSimilarity）
    pub fn rewind_to_match<C: ColumnStats + ?Sized>(&mut self, col: &C, pack: usize) {
        debug_assert_eq!(self.cols.len(), 1, "rewind_to_match works on a single column");
        let Some(c) = self.cols.get_mut(self.cur_vc) else { return; };
        debug_assert_eq!(c.order, OrderType::RangeSimilarity);
        c.lastly_left = true;
        if !c.natural_order && c.packs.is_empty() {
            c.cur = END;
            return;
        }
        c.cur = if col.is_fixed() && !c.natural_order {
            let mid = if col.pack_null_only(pack) {
                i64::MIN
            } else {
                ((col.pack_max_int(pack) as i128 - col.pack_min_int(pack) as i128) / 2) as i64
            };
            let pos = c.packs.partition_point(|p| *p < (mid, 0));
            pos.min(c.packs.len() - 1) as isize
        } else {
            0
        };
        c.prev = c.cur;
    }

    /// operator++
    pub fn advance(&mut self) {
        let n = self.cols.len();
        if n == 0 {
            return;
        }
        self.packs_passed += 1;
        if n == 1 {
            self.cols[0].next_pack();
            return;
        }
        for _ in 0..n {
            self.cur_vc = (self.cur_vc + 1) % n;
            if self.cols[self.cur_vc].cur == END {
                continue;
            }
            loop {
                self.cols[self.cur_vc].next_pack();
                match self.cols[self.cur_vc].current() {
                    Some(p) if self.is_visited(p) => continue,
                    Some(p) => {
                        self.set_visited(p);
                        return;
                    }
                    None => break,
                }
            }
        }
    }

    pub fn current(&self) -> Option<usize> { self.cols.get(self.cur_vc)?.current() }

    pub fn is_valid(&self) -> bool { self.current().is_some() }

    /// 已越过精确排序部分
    pub fn naturally_ordered(&self) -> bool { self.packs_passed > self.ordered_up_to }

    pub fn ordered_up_to(&self) -> usize { self.ordered_up_to }
}

impl Iterator for PackOrderer {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let pack = self.current()?;
        self.advance();
        Some(pack)
    }
}

/// 贪心覆盖：每次从 min ≤ 已覆盖最大值的包中挑 max 最大者，余下部分按折半步长交错
fn reorder_for_covering<C: ColumnStats + ?Sized>(packs: &mut [PackPair], col: &C) {
    packs.sort();
    let n = packs.len();
    if n == 0 {
        return;
    }
    let max_of = |pack: usize| if col.pack_null_only(pack) { PLUS_INF_64 } else { col.pack_max_int(pack) };

    let mut j = 0usize;
    let mut i = 1usize;
    while i < n {
        let max_up_to_now = max_of(packs[j].1);
        if max_up_to_now == PLUS_INF_64 {
            break;
        }
        let mut i_max: Option<usize> = None;
        let mut best = max_up_to_now;
        while i < n && packs[i].0 <= max_up_to_now {
            let local_max = max_of(packs[i].1);
            if local_max > best {
                best = local_max;
                i_max = Some(i);
            }
            i += 1;
        }
        if i_max.is_none() && i < n {
            i_max = Some(i);
        }
        j += 1;
        if let Some(m) = i_max.filter(|&m| m > j) {
            packs.swap(j, m);
        }
    }

    let mut step = (n - j) / 2;
    while step > 1 && j < n - 1 {
        let mut k = j + step;
        while k < n {
            j += 1;
            packs.swap(j, k);
            k += step;
        }
        step /= 2;
    }
}
