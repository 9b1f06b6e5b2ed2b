//! PackOrderer 完整性：每个未被淘汰的包恰好访问一次

use std::collections::BTreeSet;
use olap_pack_storage::common::RsValue;
use olap_pack_storage::config::StorageConfig;
use olap_pack_storage::pack_orderer::{ColumnStats, OrderStat, OrderType, PackOrderer};
use proptest::collection::vec;
use proptest::prelude::*;

#[derive(Debug, Clone)]
struct Packs {
    stats: Vec<(i64, i64, bool)>,
    fixed: bool,
}

impl ColumnStats for Packs {
    fn num_packs(&self) -> usize { self.stats.len() }
    fn is_fixed(&self) -> bool { self.fixed }
    fn pack_min_int(&self, p: usize) -> i64 { self.stats[p].0 }
    fn pack_max_int(&self, p: usize) -> i64 { self.stats[p].1 }
    fn pack_null_only(&self, p: usize) -> bool { self.stats[p].2 }
}

fn order_type() -> impl Strategy<Value = OrderType> {
    prop_oneof![
        Just(OrderType::RangeSimilarity),
        Just(OrderType::MinAsc),
        Just(OrderType::MinDesc),
        Just(OrderType::MaxAsc),
        Just(OrderType::MaxDesc),
        Just(OrderType::Covering),
        Just(OrderType::NotSpecified),
    ]
}

fn pack_stat() -> impl Strategy<Value = (i64, i64, bool)> {
    (-1000i64..1000, 0i64..500, prop::bool::weighted(0.1)).prop_map(|(min, w, n)| (min, min + w, n))
}

fn column(len: usize) -> impl Strategy<Value = (Packs, Option<Vec<RsValue>>)> {
    let rs = prop_oneof![Just(RsValue::None), Just(RsValue::Some), Just(RsValue::All)];
    (
        vec(pack_stat(), len),
        prop::bool::weighted(0.85),
        prop::option::of(vec(rs, len)),
    )
        .prop_map(|(stats, fixed, filter)| (Packs { stats, fixed }, filter))
}

fn survivors(col: &Packs, filter: Option<&[RsValue]>) -> BTreeSet<usize> {
    (0..col.num_packs())
        .filter(|&p| filter.map_or(true, |f| f[p] != RsValue::None))
        .collect()
}

fn config() -> impl Strategy<Value = StorageConfig> {
    (1.0f64..=100.0, 1usize..50).prop_map(|(pct, max)| StorageConfig::default().with_sorted_percentage(pct, max))
}

fn assert_once(got: &[usize], want: &BTreeSet<usize>) -> Result<(), TestCaseError> {
    let set: BTreeSet<usize> = got.iter().copied().collect();
    prop_assert_eq!(set.len(), got.len(), "pack visited twice: {:?}", got);
    prop_assert_eq!(&set, want);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, failure_persistence: None, .. ProptestConfig::default() })]

    #[test]
    fn single_column_is_a_permutation(
        input in (0usize..120).prop_flat_map(column),
        order in order_type(),
        cfg in config(),
    ) {
        let (col, filter) = input;
        let mut po = PackOrderer::new(&col, order, filter.as_deref(), &cfg);
        let want = survivors(&col, filter.as_deref());
        let first: Vec<usize> = po.by_ref().collect();
        assert_once(&first, &want)?;

        po.rewind();
        let again: Vec<usize> = po.collect();
        prop_assert_eq!(first, again);
    }

    #[test]
    fn range_similarity_match_is_a_permutation(
        input in (1usize..80).prop_flat_map(column),
        target in pack_stat(),
        cfg in config(),
    ) {
        let (col, filter) = input;
        let col = Packs { fixed: true, ..col };
        let target = Packs { stats: vec![target], fixed: true };
        let mut po = PackOrderer::new(&col, OrderType::RangeSimilarity, filter.as_deref(), &cfg);
        po.rewind_to_match(&target, 0);
        let got: Vec<usize> = po.collect();
        assert_once(&got, &survivors(&col, filter.as_deref()))?;
    }

    #[test]
    fn multi_column_visits_union_once(
        cols in (0usize..60).prop_flat_map(|n| vec(column(n), 2..4)),
        orders in vec(order_type(), 4),
        cfg in config(),
    ) {
        let mut po = PackOrderer::empty(&cfg);
        let mut want = BTreeSet::new();
        for ((col, filter), order) in cols.iter().zip(&orders) {
            po.add_column(col, *order, filter.as_deref(), OrderStat { neutral: 1, ordered: 1 });
            want.extend(survivors(col, filter.as_deref()));
        }
        let got: Vec<usize> = po.collect();
        assert_once(&got, &want)?;
    }
}

#[test]
fn sorted_prefix_respects_min_order() {
    let col = Packs { stats: (0..10).rev().map(|i| (i * 10, i * 10 + 5, false)).collect(), fixed: true };
    let cfg = StorageConfig::default().with_sorted_percentage(50.0, 100);
    let po = PackOrderer::new(&col, OrderType::MinAsc, None, &cfg);
    assert_eq!(po.ordered_up_to(), 5);
    let got: Vec<_> = po.collect();
    assert_eq!(got, vec![9, 8, 7, 6, 5, 0, 1, 2, 3, 4]);
}
