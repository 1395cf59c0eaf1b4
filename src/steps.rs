//! Static step catalog: the ordered message sequence of each segment.

use chrono::Duration;

use crate::model::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDefinition {
    pub segment: Segment,
    /// 1-based position within the segment.
    pub ordinal: u32,
    pub label: &'static str,
    /// Delay from the previous step, or from the triggering event for the first.
    pub delay_hours: i64,
    pub template: &'static str,
}

impl StepDefinition {
    pub fn delay(&self) -> Duration {
        Duration::hours(self.delay_hours)
    }
}

const fn step(
    segment: Segment,
    ordinal: u32,
    label: &'static str,
    delay_hours: i64,
    template: &'static str,
) -> StepDefinition {
    StepDefinition {
        segment,
        ordinal,
        label,
        delay_hours,
        template,
    }
}

const NOT_INTEGRATED: &[StepDefinition] = &[
    step(Segment::NotIntegrated, 1, "connect-1", 1, "connect_welcome"),
    step(Segment::NotIntegrated, 2, "connect-2", 48, "connect_benefits"),
    step(Segment::NotIntegrated, 3, "connect-3", 120, "connect_last_call"),
];

const ACTIVE_TRIAL: &[StepDefinition] = &[
    step(Segment::ActiveTrial, 1, "trial-1", 24, "trial_first_insights"),
    step(Segment::ActiveTrial, 2, "trial-2", 72, "trial_feature_tour"),
    step(Segment::ActiveTrial, 3, "trial-3", 96, "trial_ending_soon"),
];

const LAPSED: &[StepDefinition] = &[
    step(Segment::Lapsed, 1, "lapsed-1", 24, "winback_checkin"),
    step(Segment::Lapsed, 2, "lapsed-2", 96, "winback_progress"),
    step(Segment::Lapsed, 3, "lapsed-3", 168, "winback_offer"),
];

/// Steps of `segment` in send order.
pub fn steps_for(segment: Segment) -> &'static [StepDefinition] {
    match segment {
        Segment::NotIntegrated => NOT_INTEGRATED,
        Segment::ActiveTrial => ACTIVE_TRIAL,
        Segment::Lapsed => LAPSED,
    }
}

pub fn find_step(segment: Segment, ordinal: u32) -> Option<&'static StepDefinition> {
    steps_for(segment).iter().find(|s| s.ordinal == ordinal)
}

/// The step one position after `ordinal` in the segment's ordered list.
pub fn next_step(segment: Segment, ordinal: u32) -> Option<&'static StepDefinition> {
    let steps = steps_for(segment);
    let pos = steps.iter().position(|s| s.ordinal == ordinal)?;
    steps.get(pos + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_ordered_and_labels_are_unique() {
        for segment in Segment::ALL {
            let steps = steps_for(segment);
            assert!(!steps.is_empty());
            for (idx, s) in steps.iter().enumerate() {
                assert_eq!(s.segment, segment);
                assert_eq!(s.ordinal as usize, idx + 1);
                assert!(s.delay_hours > 0);
            }
            let mut labels: Vec<_> = steps.iter().map(|s| s.label).collect();
            labels.dedup();
            assert_eq!(labels.len(), steps.len());
        }
    }

    #[test]
    fn next_step_advances_one_position() {
        let second = next_step(Segment::ActiveTrial, 1).unwrap();
        assert_eq!(second.label, "trial-2");
        assert!(next_step(Segment::ActiveTrial, 3).is_none());
        assert!(next_step(Segment::ActiveTrial, 42).is_none());
    }

    #[test]
    fn find_step_by_ordinal() {
        assert_eq!(find_step(Segment::Lapsed, 3).unwrap().template, "winback_offer");
        assert!(find_step(Segment::Lapsed, 0).is_none());
    }
}
