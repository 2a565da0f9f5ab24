use std::fmt;

use bitcoin::Amount;
use serde::{Deserialize, Serialize};

/// Confirmation-speed tier of a fee estimate, cheapest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeTargetCode {
    Economy,
    Low,
    Normal,
    High,
}

impl fmt::Display for FeeTargetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeeTargetCode::Economy => "economy",
            FeeTargetCode::Low => "low",
            FeeTargetCode::Normal => "normal",
            FeeTargetCode::High => "high",
        };
        f.write_str(name)
    }
}

pub const DEFAULT_FEE_TARGET: FeeTargetCode = FeeTargetCode::Normal;

/// One entry of the account's fee table: confirmation within `blocks`
/// blocks at `fee_rate_per_kb`, which stays `None` until the first
/// successful estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeTarget {
    pub blocks: u16,
    pub code: FeeTargetCode,
    pub fee_rate_per_kb: Option<Amount>,
}

/// The account's fee table. Must stay sorted by ascending tier; consumers
/// rely on that order.
pub fn default_targets() -> Vec<FeeTarget> {
    vec![
        FeeTarget {
            blocks: 25,
            code: FeeTargetCode::Economy,
            fee_rate_per_kb: None,
        },
        FeeTarget {
            blocks: 10,
            code: FeeTargetCode::Low,
            fee_rate_per_kb: None,
        },
        FeeTarget {
            blocks: 5,
            code: FeeTargetCode::Normal,
            fee_rate_per_kb: None,
        },
        FeeTarget {
            blocks: 2,
            code: FeeTargetCode::High,
            fee_rate_per_kb: None,
        },
    ]
}

/// Filter the table for presentation: targets without an estimate are
/// dropped, and when several targets collide on the same rate only the
/// cheapest tier is kept (paying the same rate buys the same confirmation
/// speed, so the more urgent label is redundant). The result is in
/// ascending tier order with strictly increasing rates.
///
/// The default is [`DEFAULT_FEE_TARGET`] when it survived the filter, the
/// cheapest retained tier otherwise, and `None` on an empty result.
pub fn filter_targets(targets: &[FeeTarget]) -> (Vec<FeeTarget>, Option<FeeTargetCode>) {
    let mut retained: Vec<FeeTarget> = Vec::new();
    for (index, target) in targets.iter().enumerate().rev() {
        let rate = match target.fee_rate_per_kb {
            Some(rate) => rate,
            None => continue,
        };
        let collides_with_cheaper = targets[..index]
            .iter()
            .any(|cheaper| cheaper.fee_rate_per_kb == Some(rate));
        if collides_with_cheaper {
            continue;
        }
        retained.push(*target);
    }
    retained.reverse();

    let default = if retained
        .iter()
        .any(|target| target.code == DEFAULT_FEE_TARGET)
    {
        Some(DEFAULT_FEE_TARGET)
    } else {
        retained.first().map(|target| target.code)
    };
    (retained, default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(rates: [Option<u64>; 4]) -> Vec<FeeTarget> {
        let mut targets = default_targets();
        for (target, rate) in targets.iter_mut().zip(rates) {
            target.fee_rate_per_kb = rate.map(Amount::from_sat);
        }
        targets
    }

    #[test]
    fn drops_unestimated_targets_and_colliding_rates() {
        let (filtered, default) =
            filter_targets(&table([Some(100), Some(100), Some(250), None]));

        let codes: Vec<FeeTargetCode> = filtered.iter().map(|t| t.code).collect();
        assert_eq!(codes, vec![FeeTargetCode::Economy, FeeTargetCode::Normal]);
        let rates: Vec<u64> = filtered
            .iter()
            .map(|t| t.fee_rate_per_kb.unwrap().to_sat())
            .collect();
        assert_eq!(rates, vec![100, 250]);
        assert_eq!(default, Some(FeeTargetCode::Normal));
    }

    #[test]
    fn default_falls_back_to_the_cheapest_retained_tier() {
        let (filtered, default) = filter_targets(&table([Some(50), None, None, None]));

        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].code, FeeTargetCode::Economy);
        assert_eq!(default, Some(FeeTargetCode::Economy));
    }

    #[test]
    fn colliding_rate_keeps_the_cheaper_tier() {
        let (filtered, _) = filter_targets(&table([None, Some(120), Some(120), Some(300)]));

        let codes: Vec<FeeTargetCode> = filtered.iter().map(|t| t.code).collect();
        assert_eq!(codes, vec![FeeTargetCode::Low, FeeTargetCode::High]);
    }

    #[test]
    fn rates_are_strictly_increasing_in_tier_order() {
        let (filtered, _) =
            filter_targets(&table([Some(10), Some(20), Some(20), Some(500)]));

        for pair in filtered.windows(2) {
            assert!(pair[0].fee_rate_per_kb.unwrap() < pair[1].fee_rate_per_kb.unwrap());
        }
        let codes: Vec<FeeTargetCode> = filtered.iter().map(|t| t.code).collect();
        assert_eq!(
            codes,
            vec![FeeTargetCode::Economy, FeeTargetCode::Low, FeeTargetCode::High]
        );
    }

    #[test]
    fn empty_table_has_no_default() {
        let (filtered, default) = filter_targets(&table([None, None, None, None]));
        assert!(filtered.is_empty());
        assert_eq!(default, None);
    }
}
