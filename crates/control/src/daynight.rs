//! Day/night phases, the policy that gates controllers per phase, and the
//! wall clock they are evaluated against.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::controller::ControllerKind;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Day,
    Night,
    Morning,
    Afternoon,
    Evening,
}

impl Phase {
    /// Evaluation order of [`Schedule::phase_at`].
    pub const ALL: [Phase; 5] = [
        Phase::Day,
        Phase::Night,
        Phase::Morning,
        Phase::Afternoon,
        Phase::Evening,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Day => "day",
            Phase::Night => "night",
            Phase::Morning => "morning",
            Phase::Afternoon => "afternoon",
            Phase::Evening => "evening",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock time with minute resolution. `24:00` is accepted so a
/// window can end at midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub const END_OF_DAY: TimeOfDay = TimeOfDay { hour: 24, minute: 0 };

    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        let valid = (hour < 24 && minute < 60) || (hour == 24 && minute == 0);
        valid.then_some(Self { hour, minute })
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got {s:?}"))?;
        let hour = h.trim().parse().map_err(|_| format!("bad hour in {s:?}"))?;
        let minute = m.trim().parse().map_err(|_| format!("bad minute in {s:?}"))?;
        TimeOfDay::new(hour, minute).ok_or_else(|| format!("{s:?} is not a time of day"))
    }
}

/// A `start`–`end` window. Windows with `start > end` wrap over midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PhaseBounds {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

impl PhaseBounds {
    fn hours(start: u8, end: u8) -> Self {
        Self {
            start: TimeOfDay { hour: start, minute: 0 },
            end: TimeOfDay { hour: end, minute: 0 },
        }
    }

    /// `[start, end)` for a plain window, `[start, 24:00) ∪ [00:00, end]`
    /// for one that wraps.
    pub fn contains(&self, t: TimeOfDay) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// One entry of the enabling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Rule {
    pub phase: Phase,
    pub controller: ControllerKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Schedule {
    pub day: PhaseBounds,
    pub night: PhaseBounds,
    pub morning: PhaseBounds,
    pub afternoon: PhaseBounds,
    pub evening: PhaseBounds,
    pub rules: Vec<Rule>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            day: PhaseBounds::hours(8, 20),
            night: PhaseBounds::hours(20, 8),
            morning: PhaseBounds::hours(8, 12),
            afternoon: PhaseBounds::hours(12, 18),
            evening: PhaseBounds::hours(18, 24),
            rules: vec![
                Rule {
                    phase: Phase::Day,
                    controller: ControllerKind::Light,
                    enabled: true,
                },
                Rule {
                    phase: Phase::Night,
                    controller: ControllerKind::Light,
                    enabled: false,
                },
            ],
        }
    }
}

impl Schedule {
    pub fn bounds(&self, phase: Phase) -> PhaseBounds {
        match phase {
            Phase::Day => self.day,
            Phase::Night => self.night,
            Phase::Morning => self.morning,
            Phase::Afternoon => self.afternoon,
            Phase::Evening => self.evening,
        }
    }

    /// First phase, in [`Phase::ALL`] order, whose window contains `t`.
    pub fn phase_at(&self, t: TimeOfDay) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| self.bounds(*p).contains(t))
    }

    /// Every phase whose window contains `t`.
    pub fn phases_at(&self, t: TimeOfDay) -> Vec<Phase> {
        Phase::ALL
            .into_iter()
            .filter(|p| self.bounds(*p).contains(t))
            .collect()
    }

    /// Forced state for `kind` during `phase`. `None` means the policy says
    /// nothing, which callers treat as enabled.
    pub fn enabling(&self, phase: Phase, kind: ControllerKind) -> Option<bool> {
        self.rules
            .iter()
            .find(|r| r.phase == phase && r.controller == kind)
            .map(|r| r.enabled)
    }

    pub fn current_phase(&self, clock: &dyn Clock) -> Option<Phase> {
        self.phase_at(clock.time_of_day())
    }

    /// One line listing every window, for the startup log.
    pub fn describe(&self) -> String {
        Phase::ALL
            .iter()
            .map(|p| {
                let b = self.bounds(*p);
                format!("{p} {}-{}", b.start, b.end)
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Source of the current time of day.
pub trait Clock {
    fn time_of_day(&self) -> TimeOfDay;
    fn unix_timestamp(&self) -> i64;
}

/// System time shifted by a fixed UTC offset.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(utc_offset_hours: i8) -> Result<Self> {
        Ok(Self {
            offset: UtcOffset::from_hms(utc_offset_hours, 0, 0)?,
        })
    }

    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

impl Clock for SystemClock {
    fn time_of_day(&self) -> TimeOfDay {
        let now = self.now();
        TimeOfDay {
            hour: now.hour(),
            minute: now.minute(),
        }
    }

    fn unix_timestamp(&self) -> i64 {
        self.now().unix_timestamp()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;

    /// Clock the test moves by hand.
    pub(crate) struct ManualClock(pub(crate) Cell<TimeOfDay>);

    impl ManualClock {
        pub(crate) fn at(hour: u8, minute: u8) -> Self {
            Self(Cell::new(t(hour, minute)))
        }
    }

    impl Clock for ManualClock {
        fn time_of_day(&self) -> TimeOfDay {
            self.0.get()
        }

        fn unix_timestamp(&self) -> i64 {
            let now = self.0.get();
            1_700_000_000 + i64::from(now.hour) * 3600 + i64::from(now.minute) * 60
        }
    }

    pub(crate) fn t(hour: u8, minute: u8) -> TimeOfDay {
        TimeOfDay::new(hour, minute).unwrap()
    }

    #[test]
    fn night_wraps_over_midnight() {
        let s = Schedule::default();
        assert_eq!(s.phase_at(t(23, 0)), Some(Phase::Night));
        assert_eq!(s.phase_at(t(2, 0)), Some(Phase::Night));
        assert_eq!(s.phase_at(t(0, 0)), Some(Phase::Night));
        assert_ne!(s.phase_at(t(12, 0)), Some(Phase::Night));
    }

    #[test]
    fn day_wins_over_its_sub_phases() {
        let s = Schedule::default();
        assert_eq!(s.phase_at(t(12, 0)), Some(Phase::Day));
        assert_eq!(s.phase_at(t(8, 0)), Some(Phase::Day));
        assert_eq!(s.phase_at(t(19, 59)), Some(Phase::Day));
        assert_eq!(s.phase_at(t(20, 0)), Some(Phase::Night));
        assert_eq!(s.phases_at(t(12, 0)), vec![Phase::Day, Phase::Afternoon]);
        assert_eq!(s.phases_at(t(19, 0)), vec![Phase::Day, Phase::Evening]);
        assert_eq!(s.phases_at(t(22, 0)), vec![Phase::Night, Phase::Evening]);
    }

    #[test]
    fn plain_windows_are_half_open() {
        let b = PhaseBounds::hours(8, 12);
        assert!(b.contains(t(8, 0)));
        assert!(b.contains(t(11, 59)));
        assert!(!b.contains(t(12, 0)));
    }

    #[test]
    fn wrapping_windows_include_their_end() {
        let b = PhaseBounds::hours(20, 8);
        assert!(b.contains(t(20, 0)));
        assert!(b.contains(t(8, 0)));
        assert!(!b.contains(t(8, 1)));
        assert!(!b.contains(t(19, 59)));
    }

    #[test]
    fn gaps_between_windows_have_no_phase() {
        let s = Schedule {
            day: PhaseBounds::hours(9, 17),
            night: PhaseBounds::hours(22, 6),
            morning: PhaseBounds::hours(9, 12),
            afternoon: PhaseBounds::hours(12, 17),
            evening: PhaseBounds::hours(17, 21),
            rules: Vec::new(),
        };
        assert_eq!(s.phase_at(t(21, 30)), None);
        assert!(s.phases_at(t(7, 0)).is_empty());
    }

    #[test]
    fn policy_only_gates_light_by_default() {
        let s = Schedule::default();
        assert_eq!(s.enabling(Phase::Day, ControllerKind::Light), Some(true));
        assert_eq!(s.enabling(Phase::Night, ControllerKind::Light), Some(false));
        assert_eq!(s.enabling(Phase::Night, ControllerKind::Moisture), None);
        assert_eq!(s.enabling(Phase::Morning, ControllerKind::Light), None);
    }

    #[test]
    fn current_phase_reads_the_clock() {
        let s = Schedule::default();
        let clock = ManualClock::at(3, 15);
        assert_eq!(s.current_phase(&clock), Some(Phase::Night));
        clock.0.set(t(9, 0));
        assert_eq!(s.current_phase(&clock), Some(Phase::Day));
    }

    #[test]
    fn time_of_day_parses_and_rejects() {
        assert_eq!(TimeOfDay::try_from("07:30".to_string()), Ok(t(7, 30)));
        assert_eq!(
            TimeOfDay::try_from("24:00".to_string()),
            Ok(TimeOfDay::END_OF_DAY)
        );
        assert!(TimeOfDay::try_from("24:30".to_string()).is_err());
        assert!(TimeOfDay::try_from("7h".to_string()).is_err());
        assert_eq!(t(7, 5).to_string(), "07:05");
    }

    #[test]
    fn system_clock_rejects_impossible_offsets() {
        assert!(SystemClock::new(2).is_ok());
        assert!(SystemClock::new(30).is_err());
    }
}
