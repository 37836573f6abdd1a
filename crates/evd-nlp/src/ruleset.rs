//! Built-in fallback ruleset for A-share announcements.
//!
//! Used when no versioned ruleset has been activated. Patterns are plain
//! substrings matched case-insensitively; Chinese phrases match verbatim.

use evd_schemas::{EventPolarity, NlpRule};

pub const BUILTIN_RULESET_VERSION: &str = "builtin-v1";

fn rule(
    rule_id: &str,
    event_type: &str,
    polarity: EventPolarity,
    weight: f64,
    tag: &str,
    patterns: &[&str],
) -> NlpRule {
    NlpRule {
        rule_id: rule_id.to_string(),
        event_type: event_type.to_string(),
        polarity,
        weight,
        tag: tag.to_string(),
        patterns: patterns.iter().map(|p| p.to_string()).collect(),
    }
}

/// The built-in ruleset, in match-priority order.
pub fn builtin_ruleset() -> (String, Vec<NlpRule>) {
    let rules = vec![
        rule(
            "buyback",
            "share_buyback",
            EventPolarity::Positive,
            0.8,
            "buyback",
            &["回购", "buyback", "repurchase"],
        ),
        rule(
            "earnings_pre_increase",
            "earnings_pre_increase",
            EventPolarity::Positive,
            0.85,
            "earnings",
            &["业绩预增", "预计净利润增长", "净利润同比增长"],
        ),
        rule(
            "earnings_pre_decrease",
            "earnings_pre_decrease",
            EventPolarity::Negative,
            0.85,
            "earnings",
            &["业绩预减", "业绩预亏", "预计亏损", "净利润同比下降"],
        ),
        rule(
            "major_contract",
            "major_contract",
            EventPolarity::Positive,
            0.75,
            "contract",
            &["重大合同", "中标", "签订合同", "框架协议"],
        ),
        rule(
            "shareholder_reduction",
            "shareholder_reduction",
            EventPolarity::Negative,
            0.7,
            "holder_change",
            &["减持", "拟减持", "减持计划"],
        ),
        rule(
            "shareholder_increase",
            "shareholder_increase",
            EventPolarity::Positive,
            0.7,
            "holder_change",
            &["增持", "拟增持", "增持计划"],
        ),
        rule(
            "regulatory_investigation",
            "regulatory_investigation",
            EventPolarity::Negative,
            0.9,
            "regulatory",
            &["立案调查", "证监会调查", "监管函", "警示函"],
        ),
        rule(
            "restructuring_suspension",
            "restructuring",
            EventPolarity::Neutral,
            0.6,
            "restructuring",
            &["重大资产重组", "停牌", "筹划重组"],
        ),
        rule(
            "dividend",
            "dividend",
            EventPolarity::Positive,
            0.65,
            "dividend",
            &["分红", "派息", "利润分配", "现金股利"],
        ),
        rule(
            "share_pledge",
            "share_pledge",
            EventPolarity::Negative,
            0.6,
            "pledge",
            &["股份质押", "质押", "解除质押"],
        ),
    ];
    (BUILTIN_RULESET_VERSION.to_string(), rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_are_valid() {
        let (version, rules) = builtin_ruleset();
        assert_eq!(version, BUILTIN_RULESET_VERSION);
        assert!(!rules.is_empty());
        for rule in &rules {
            rule.validate().unwrap();
        }
    }

    #[test]
    fn builtin_rule_ids_are_unique() {
        let (_, rules) = builtin_ruleset();
        let mut ids: Vec<&str> = rules.iter().map(|r| r.rule_id.as_str()).collect();
        ids.sort_unstable();
        let before = ids.len();
        ids.dedup();
        assert_eq!(before, ids.len());
    }
}
