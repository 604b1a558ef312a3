//! Cycle triggers.
//!
//! A trigger answers one question for the view process worker: may, must or
//! must not a cycle run now, and when could that answer change. Triggers are
//! combined with [`CombinedTrigger`].

use std::time::Duration;

use tokio::time::Instant;

use crate::cycle::CycleType;

/// How strongly a trigger wants a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eligibility {
    /// A cycle must not run
    Ineligible,
    /// A cycle may run if one was requested
    Eligible,
    /// A cycle must run
    Force,
}

/// Answer of [`ViewCycleTrigger::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerResult {
    /// Eligibility now
    pub eligibility: Eligibility,
    /// Cycle type hint, `None` leaves the choice to the process
    pub cycle_type: Option<CycleType>,
    /// Earliest instant at which the answer may change
    pub next_state_change: Option<Instant>,
}

impl TriggerResult {
    /// Eligible with no hint.
    pub fn eligible() -> Self {
        Self {
            eligibility: Eligibility::Eligible,
            cycle_type: None,
            next_state_change: None,
        }
    }

    /// Result with the given eligibility.
    pub fn with_eligibility(eligibility: Eligibility) -> Self {
        Self {
            eligibility,
            ..Self::eligible()
        }
    }

    /// Set the cycle type hint.
    pub fn hint(mut self, cycle_type: CycleType) -> Self {
        self.cycle_type = Some(cycle_type);
        self
    }

    /// Set the next state change.
    pub fn until(mut self, at: Instant) -> Self {
        self.next_state_change = Some(at);
        self
    }

    /// Merge two answers. Ineligible dominates, then Force; a full hint wins
    /// over a delta hint and the earlier state change is kept.
    pub fn combine(self, other: TriggerResult) -> Self {
        use Eligibility::*;
        let eligibility = match (self.eligibility, other.eligibility) {
            (Ineligible, _) | (_, Ineligible) => Ineligible,
            (Force, _) | (_, Force) => Force,
            _ => Eligible,
        };
        let cycle_type = match (self.cycle_type, other.cycle_type) {
            (Some(CycleType::Full), _) | (_, Some(CycleType::Full)) => Some(CycleType::Full),
            (a, b) => a.or(b),
        };
        let next_state_change = match (self.next_state_change, other.next_state_change) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            eligibility,
            cycle_type,
            next_state_change,
        }
    }
}

/// Decides when view cycles run.
pub trait ViewCycleTrigger: Send {
    /// Current answer.
    fn query(&self, now: Instant) -> TriggerResult;

    /// Called once a cycle of `cycle_type` triggered at `now` has completed.
    fn cycle_triggered(&mut self, now: Instant, cycle_type: CycleType);

    /// Called when a cycle triggered at `now` failed or was not executed.
    fn cycle_abandoned(&mut self, _now: Instant) {}
}

/// Always forces a cycle.
#[derive(Debug, Default)]
pub struct RunAsFastAsPossibleTrigger;

impl ViewCycleTrigger for RunAsFastAsPossibleTrigger {
    fn query(&self, _now: Instant) -> TriggerResult {
        TriggerResult::with_eligibility(Eligibility::Force)
    }

    fn cycle_triggered(&mut self, _now: Instant, _cycle_type: CycleType) {}
}

/// Keeps cycles between a minimum and a maximum period apart.
///
/// Before the minimum has elapsed a cycle is ineligible; once the maximum has
/// elapsed one is forced.
#[derive(Debug)]
pub struct RecomputationPeriodTrigger {
    min_period: Duration,
    max_period: Duration,
    created: Instant,
    last_cycle: Option<Instant>,
}

impl RecomputationPeriodTrigger {
    /// Trigger created at `now`. `max_period` is clamped to at least `min_period`.
    pub fn new(min_period: Duration, max_period: Duration, now: Instant) -> Self {
        Self {
            min_period,
            max_period: max_period.max(min_period),
            created: now,
            last_cycle: None,
        }
    }
}

impl ViewCycleTrigger for RecomputationPeriodTrigger {
    fn query(&self, now: Instant) -> TriggerResult {
        let Some(last) = self.last_cycle else {
            let force_at = self.created + self.max_period;
            if now >= force_at {
                return TriggerResult::with_eligibility(Eligibility::Force);
            }
            return TriggerResult::eligible().until(force_at);
        };
        let eligible_at = last + self.min_period;
        let force_at = last + self.max_period;
        if now < eligible_at {
            TriggerResult::with_eligibility(Eligibility::Ineligible).until(eligible_at)
        } else if now < force_at {
            TriggerResult::eligible().until(force_at)
        } else {
            TriggerResult::with_eligibility(Eligibility::Force)
        }
    }

    fn cycle_triggered(&mut self, now: Instant, _cycle_type: CycleType) {
        self.last_cycle = Some(now);
    }

    // Failed attempts still respect the minimum period before a retry
    fn cycle_abandoned(&mut self, now: Instant) {
        self.last_cycle = Some(now);
    }
}

/// Hints a full cycle after a number of consecutive delta cycles.
#[derive(Debug)]
pub struct SuccessiveDeltaLimitTrigger {
    max_deltas: u32,
    deltas: u32,
}

impl SuccessiveDeltaLimitTrigger {
    /// Full cycle after `max_deltas` deltas in a row.
    pub fn new(max_deltas: u32) -> Self {
        Self {
            max_deltas,
            deltas: 0,
        }
    }
}

impl ViewCycleTrigger for SuccessiveDeltaLimitTrigger {
    fn query(&self, _now: Instant) -> TriggerResult {
        let result = TriggerResult::eligible();
        if self.deltas >= self.max_deltas {
            result.hint(CycleType::Full)
        } else {
            result
        }
    }

    fn cycle_triggered(&mut self, _now: Instant, cycle_type: CycleType) {
        match cycle_type {
            CycleType::Full => self.deltas = 0,
            CycleType::Delta => self.deltas += 1,
        }
    }
}

/// Forces a full cycle at a fixed instant, used for compilation expiry.
#[derive(Debug, Default)]
pub struct FixedTimeTrigger {
    at: Option<Instant>,
}

impl FixedTimeTrigger {
    /// Unset trigger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire at `at`, replacing any earlier setting.
    pub fn set(&mut self, at: Instant) {
        self.at = Some(at);
    }

    /// Disarm.
    pub fn clear(&mut self) {
        self.at = None;
    }
}

impl ViewCycleTrigger for FixedTimeTrigger {
    fn query(&self, now: Instant) -> TriggerResult {
        match self.at {
            Some(at) if now >= at => {
                TriggerResult::with_eligibility(Eligibility::Force).hint(CycleType::Full)
            }
            Some(at) => TriggerResult::eligible().until(at),
            None => TriggerResult::eligible(),
        }
    }

    fn cycle_triggered(&mut self, now: Instant, _cycle_type: CycleType) {
        self.cycle_abandoned(now);
    }

    fn cycle_abandoned(&mut self, now: Instant) {
        if matches!(self.at, Some(at) if now >= at) {
            self.at = None;
        }
    }
}

/// Combination of triggers.
///
/// Ineligible dominates, then Force. A full hint from any member wins and the
/// next state change is the earliest of the members'.
#[derive(Default)]
pub struct CombinedTrigger {
    triggers: Vec<Box<dyn ViewCycleTrigger>>,
}

impl CombinedTrigger {
    /// Empty combination; always eligible.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member.
    pub fn add(&mut self, trigger: impl ViewCycleTrigger + 'static) {
        self.triggers.push(Box::new(trigger));
    }

    /// Builder-style [`add`](Self::add).
    pub fn with(mut self, trigger: impl ViewCycleTrigger + 'static) -> Self {
        self.add(trigger);
        self
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// True if there are no members.
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }
}

impl ViewCycleTrigger for CombinedTrigger {
    fn query(&self, now: Instant) -> TriggerResult {
        self.triggers
            .iter()
            .fold(TriggerResult::eligible(), |acc, t| acc.combine(t.query(now)))
    }

    fn cycle_triggered(&mut self, now: Instant, cycle_type: CycleType) {
        for trigger in &mut self.triggers {
            trigger.cycle_triggered(now, cycle_type);
        }
    }

    fn cycle_abandoned(&mut self, now: Instant) {
        for trigger in &mut self.triggers {
            trigger.cycle_abandoned(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_millis(1000);

    #[test]
    fn test_recomputation_period_windows() {
        let t0 = Instant::now();
        let mut trigger = RecomputationPeriodTrigger::new(MIN, MAX, t0);

        let first = trigger.query(t0);
        assert_eq!(first.eligibility, Eligibility::Eligible);
        assert_eq!(first.next_state_change, Some(t0 + MAX));
        assert_eq!(trigger.query(t0 + MAX).eligibility, Eligibility::Force);

        trigger.cycle_triggered(t0, CycleType::Full);
        let r = trigger.query(t0 + Duration::from_millis(50));
        assert_eq!(r.eligibility, Eligibility::Ineligible);
        assert_eq!(r.next_state_change, Some(t0 + MIN));
        assert_eq!(trigger.query(t0 + MIN).eligibility, Eligibility::Eligible);
        assert_eq!(trigger.query(t0 + MAX).eligibility, Eligibility::Force);
    }

    #[test]
    fn test_max_period_clamped_to_min() {
        let t0 = Instant::now();
        let mut trigger = RecomputationPeriodTrigger::new(MAX, MIN, t0);
        trigger.cycle_triggered(t0, CycleType::Full);
        assert_eq!(trigger.query(t0 + MIN).eligibility, Eligibility::Ineligible);
        assert_eq!(trigger.query(t0 + MAX).eligibility, Eligibility::Force);
    }

    #[test]
    fn test_successive_delta_limit() {
        let now = Instant::now();
        let mut trigger = SuccessiveDeltaLimitTrigger::new(2);
        assert_eq!(trigger.query(now).cycle_type, None);
        trigger.cycle_triggered(now, CycleType::Delta);
        trigger.cycle_triggered(now, CycleType::Delta);
        assert_eq!(trigger.query(now).cycle_type, Some(CycleType::Full));
        trigger.cycle_triggered(now, CycleType::Full);
        assert_eq!(trigger.query(now).cycle_type, None);
    }

    #[test]
    fn test_abandoned_cycles_not_counted_as_deltas() {
        let t0 = Instant::now();
        let mut combined = CombinedTrigger::new()
            .with(RecomputationPeriodTrigger::new(MIN, MAX, t0))
            .with(SuccessiveDeltaLimitTrigger::new(1));

        combined.cycle_abandoned(t0);
        combined.cycle_abandoned(t0);
        let r = combined.query(t0 + MIN);
        assert_eq!(r.eligibility, Eligibility::Eligible);
        assert_eq!(r.cycle_type, None);
        // The retry waits out the minimum period
        assert_eq!(combined.query(t0).eligibility, Eligibility::Ineligible);

        combined.cycle_triggered(t0 + MIN, CycleType::Delta);
        assert_eq!(combined.query(t0 + MAX).cycle_type, Some(CycleType::Full));
    }

    #[test]
    fn test_fixed_time_fires_once() {
        let t0 = Instant::now();
        let mut trigger = FixedTimeTrigger::new();
        assert_eq!(trigger.query(t0).eligibility, Eligibility::Eligible);

        trigger.set(t0 + MIN);
        assert_eq!(trigger.query(t0).next_state_change, Some(t0 + MIN));
        let fired = trigger.query(t0 + MIN);
        assert_eq!(fired.eligibility, Eligibility::Force);
        assert_eq!(fired.cycle_type, Some(CycleType::Full));

        trigger.cycle_triggered(t0 + MIN, CycleType::Full);
        assert_eq!(trigger.query(t0 + MAX).eligibility, Eligibility::Eligible);
    }

    #[test]
    fn test_combined_precedence() {
        let t0 = Instant::now();
        assert_eq!(CombinedTrigger::new().query(t0), TriggerResult::eligible());

        let mut period = RecomputationPeriodTrigger::new(MIN, MAX, t0);
        period.cycle_triggered(t0, CycleType::Full);
        let mut combined = CombinedTrigger::new()
            .with(RunAsFastAsPossibleTrigger)
            .with(period)
            .with(SuccessiveDeltaLimitTrigger::new(0));
        assert_eq!(combined.len(), 3);

        let r = combined.query(t0);
        assert_eq!(r.eligibility, Eligibility::Ineligible);
        assert_eq!(r.cycle_type, Some(CycleType::Full));
        assert_eq!(r.next_state_change, Some(t0 + MIN));

        assert_eq!(combined.query(t0 + MIN).eligibility, Eligibility::Force);
        combined.cycle_triggered(t0 + MIN, CycleType::Delta);
        assert_eq!(combined.query(t0 + MIN).eligibility, Eligibility::Ineligible);
    }
}
