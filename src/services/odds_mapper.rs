use rand::seq::IndexedRandom;
use rand::Rng;
use rust_decimal::{prelude::ToPrimitive, Decimal};

use crate::{
    constants::{RANGE_STEP_CENTS, ROLL_DOMAIN_MAX},
    error::{AppError, Result},
    models::{Case, CaseItem, OddRangeBucket, UserRole},
};

/// One item's slice of the cumulative odds line.
#[derive(Debug, Clone, PartialEq)]
pub struct OddsRange {
    pub item: CaseItem,
    pub range_start: Decimal,
    pub range_end: Decimal,
}

/// Cumulative ranges for a case, cheapest item first.
#[derive(Debug, Clone)]
pub struct OddsTable {
    ranges: Vec<OddsRange>,
    total: Decimal,
}

impl OddsTable {
    pub fn build(items: &[CaseItem]) -> Result<Self> {
        if items.is_empty() {
            return Err(AppError::InvalidOdds("case has no items".to_string()));
        }
        if let Some(item) = items.iter().find(|i| i.odd <= Decimal::ZERO) {
            return Err(AppError::InvalidOdds(format!(
                "item {} has a non-positive odd",
                item.item_id
            )));
        }
        if let Some(item) = items.iter().find(|i| i.value < Decimal::ZERO) {
            return Err(AppError::InvalidOdds(format!(
                "item {} has a negative value",
                item.item_id
            )));
        }

        let mut sorted = items.to_vec();
        // Stable: equal values keep configuration order.
        sorted.sort_by(|a, b| a.value.cmp(&b.value));

        let step = Decimal::new(RANGE_STEP_CENTS, 2);
        let mut ranges = Vec::with_capacity(sorted.len());
        let mut previous_end: Option<Decimal> = None;
        for item in sorted {
            let base = previous_end.unwrap_or(Decimal::ZERO);
            let range_start = previous_end.map_or(Decimal::ZERO, |end| end + step);
            let range_end = base + item.odd;
            previous_end = Some(range_end);
            ranges.push(OddsRange {
                item,
                range_start,
                range_end,
            });
        }

        Ok(Self {
            total: previous_end.unwrap_or(Decimal::ZERO),
            ranges,
        })
    }

    pub fn ranges(&self) -> &[OddsRange] {
        &self.ranges
    }

    pub fn total(&self) -> Decimal {
        self.total
    }

    pub fn items(&self) -> impl Iterator<Item = &CaseItem> {
        self.ranges.iter().map(|r| &r.item)
    }

    /// Projects a roll in (0, 100] onto `[0, total]`.
    pub fn scale(&self, roll: Decimal) -> Decimal {
        let domain = Decimal::from(ROLL_DOMAIN_MAX);
        if self.total == domain {
            roll
        } else {
            roll * self.total / domain
        }
    }

    pub fn resolve(&self, roll: Decimal) -> &CaseItem {
        let scaled = self.scale(roll);
        let range = self
            .ranges
            .iter()
            .find(|r| r.range_end >= scaled)
            .or_else(|| self.ranges.last());
        // `build` guarantees at least one range.
        match range {
            Some(r) => &r.item,
            None => unreachable!("odds table without ranges"),
        }
    }

    /// Resolves the roll at `position` within a batch, applying `policy`.
    pub fn resolve_with<R: Rng + ?Sized>(
        &self,
        roll: Decimal,
        position: usize,
        policy: &OddOverridePolicy,
        rng: &mut R,
    ) -> &CaseItem {
        match policy {
            OddOverridePolicy::RestrictedToRanges(buckets) if position == 0 => self
                .forced_item(buckets, rng)
                .unwrap_or_else(|| self.resolve(roll)),
            _ => self.resolve(roll),
        }
    }

    // Internal helper that picks an item inside a weighted price window.
    fn forced_item<R: Rng + ?Sized>(
        &self,
        buckets: &[OddRangeBucket],
        rng: &mut R,
    ) -> Option<&CaseItem> {
        let candidates: Vec<(&OddRangeBucket, Vec<&CaseItem>)> = buckets
            .iter()
            .filter(|b| b.odd > Decimal::ZERO)
            .map(|b| (b, self.items().filter(|i| b.contains(i.value)).collect::<Vec<_>>()))
            .filter(|(_, items)| !items.is_empty())
            .collect();

        if let Ok((_, items)) =
            candidates.choose_weighted(rng, |(bucket, _)| bucket.odd.to_f64().unwrap_or(0.0))
        {
            return items.choose(rng).copied();
        }

        let outside: Vec<&CaseItem> = self
            .items()
            .filter(|i| !buckets.iter().any(|b| b.contains(i.value)))
            .collect();
        outside.choose(rng).copied()
    }
}

/// How the first roll of a batch is resolved for a given opener.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum OddOverridePolicy {
    #[default]
    None,
    RestrictedToRanges(Vec<OddRangeBucket>),
}

impl OddOverridePolicy {
    pub fn for_opener(role: UserRole, case: &Case, enabled: bool) -> Self {
        if enabled && role == UserRole::Influencer && !case.influencer_ranges.is_empty() {
            Self::RestrictedToRanges(case.influencer_ranges.clone())
        } else {
            Self::None
        }
    }

    pub fn is_restricted(&self) -> bool {
        matches!(self, Self::RestrictedToRanges(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};
    use std::str::FromStr;
    use uuid::Uuid;

    fn dec(raw: &str) -> Decimal {
        Decimal::from_str(raw).unwrap()
    }

    fn item(name: &str, value: &str, odd: &str) -> CaseItem {
        CaseItem {
            item_id: Uuid::new_v4(),
            name: name.to_string(),
            value: dec(value),
            odd: dec(odd),
        }
    }

    #[test]
    fn fifty_fifty_example_resolves_both_halves() {
        let table =
            OddsTable::build(&[item("cheap", "1", "50"), item("rich", "100", "50")]).unwrap();
        assert_eq!(table.resolve(dec("25.000")).name, "cheap");
        assert_eq!(table.resolve(dec("75.000")).name, "rich");
        assert_eq!(table.ranges()[1].range_start, dec("50.01"));
        assert_eq!(table.ranges()[1].range_end, dec("100"));
    }

    #[test]
    fn items_are_sorted_by_value_stably() {
        let table = OddsTable::build(&[
            item("b", "5", "10"),
            item("a", "1", "30"),
            item("c", "5", "60"),
        ])
        .unwrap();
        let names: Vec<_> = table.items().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(table.ranges()[0].range_start, Decimal::ZERO);
        assert_eq!(table.ranges()[0].range_end, dec("30"));
        assert_eq!(table.ranges()[1].range_start, dec("30.01"));
        assert_eq!(table.ranges()[1].range_end, dec("40"));
        assert_eq!(table.ranges()[2].range_end, dec("100"));
    }

    #[test]
    fn every_roll_resolves_inside_the_partition() {
        let table = OddsTable::build(&[
            item("a", "1", "12.5"),
            item("b", "2", "37.5"),
            item("c", "9", "50"),
        ])
        .unwrap();
        let mut hits = [0u32; 3];
        for ticket in 1..=100_000i64 {
            let won = table.resolve(Decimal::new(ticket, 3));
            let idx = table.items().position(|i| i.item_id == won.item_id).unwrap();
            hits[idx] += 1;
        }
        assert_eq!(hits.iter().sum::<u32>(), 100_000);
        assert_eq!(hits, [12_500, 37_500, 50_000]);

        for pair in table.ranges().windows(2) {
            assert_eq!(pair[1].range_start, pair[0].range_end + dec("0.01"));
        }
    }

    #[test]
    fn boundaries_belong_to_the_lower_range_and_gaps_to_the_upper() {
        let table = OddsTable::build(&[item("a", "1", "50"), item("b", "2", "50")]).unwrap();
        assert_eq!(table.resolve(dec("50.000")).name, "a");
        assert_eq!(table.resolve(dec("50.005")).name, "b");
        assert_eq!(table.resolve(dec("100.000")).name, "b");
    }

    #[test]
    fn rolls_are_scaled_when_odds_do_not_total_100() {
        let table = OddsTable::build(&[item("a", "1", "1"), item("b", "2", "3")]).unwrap();
        assert_eq!(table.total(), dec("4"));
        // 25.000 scales to exactly 1.
        assert_eq!(table.resolve(dec("25.000")).name, "a");
        assert_eq!(table.resolve(dec("25.500")).name, "b");
        assert_eq!(table.resolve(dec("100.000")).name, "b");
    }

    #[test]
    fn values_past_the_last_range_clamp_to_last_item() {
        let table = OddsTable::build(&[item("a", "1", "50"), item("b", "2", "50")]).unwrap();
        assert_eq!(table.resolve(dec("150")).name, "b");
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        assert!(matches!(
            OddsTable::build(&[]).unwrap_err(),
            AppError::InvalidOdds(_)
        ));
        assert!(OddsTable::build(&[item("a", "1", "0")]).is_err());
        assert!(OddsTable::build(&[item("a", "1", "-5")]).is_err());
        assert!(OddsTable::build(&[item("a", "-1", "100")]).is_err());
    }

    #[test]
    fn override_forces_only_the_first_roll_into_a_window() {
        let table = OddsTable::build(&[
            item("low", "1", "90"),
            item("mid", "50", "9"),
            item("high", "500", "1"),
        ])
        .unwrap();
        let policy = OddOverridePolicy::RestrictedToRanges(vec![OddRangeBucket {
            odd: dec("1"),
            min_value: dec("40"),
            max_value: dec("60"),
        }]);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..20 {
            assert_eq!(table.resolve_with(dec("1.000"), 0, &policy, &mut rng).name, "mid");
        }
        assert_eq!(table.resolve_with(dec("1.000"), 1, &policy, &mut rng).name, "low");
        assert_eq!(
            table
                .resolve_with(dec("1.000"), 0, &OddOverridePolicy::None, &mut rng)
                .name,
            "low"
        );
    }

    #[test]
    fn override_falls_back_to_items_outside_every_window() {
        let table = OddsTable::build(&[item("low", "1", "90"), item("high", "500", "10")]).unwrap();
        let policy = OddOverridePolicy::RestrictedToRanges(vec![OddRangeBucket {
            odd: dec("1"),
            min_value: dec("0"),
            max_value: dec("10"),
        }]);
        // A window holding no item falls back to items outside every window.
        let empty_window = OddOverridePolicy::RestrictedToRanges(vec![OddRangeBucket {
            odd: dec("1"),
            min_value: dec("20"),
            max_value: dec("30"),
        }]);
        let mut rng = StdRng::seed_from_u64(11);
        assert_eq!(table.resolve_with(dec("99.000"), 0, &policy, &mut rng).name, "low");

        let mut seen = std::collections::HashSet::new();
        for _ in 0..50 {
            seen.insert(
                table
                    .resolve_with(dec("99.000"), 0, &empty_window, &mut rng)
                    .name
                    .clone(),
            );
        }
        assert!(seen.contains("low") && seen.contains("high"));
    }

    #[test]
    fn policy_applies_only_to_enabled_influencers_with_ranges() {
        let mut case = Case::new("box", dec("10"), vec![item("a", "1", "100")]);
        assert_eq!(
            OddOverridePolicy::for_opener(UserRole::Influencer, &case, true),
            OddOverridePolicy::None
        );
        case.influencer_ranges = vec![OddRangeBucket {
            odd: dec("1"),
            min_value: dec("0"),
            max_value: dec("5"),
        }];
        assert!(OddOverridePolicy::for_opener(UserRole::Influencer, &case, true).is_restricted());
        assert!(!OddOverridePolicy::for_opener(UserRole::Influencer, &case, false).is_restricted());
        assert!(!OddOverridePolicy::for_opener(UserRole::Regular, &case, true).is_restricted());
    }
}
