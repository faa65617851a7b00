//! Schedule generation for recurring check-in series.
//!
//! Slot 1 (the anchor) is derived from enrollment inputs; slot N is the
//! anchor shifted by `(N-1) * period`.  All calendar math happens in the
//! configured timezone and results are stored as UTC instants.

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};
use uuid::Uuid;

use checkin_config::{ScheduleConfig, WindowConfig};

use crate::error::{LifecycleError, Result};
use crate::schema::{Frequency, Slot, SlotStatus};

/// Parse a strict `HH:MM` time of day.
pub fn parse_hhmm(raw: &str) -> Result<NaiveTime> {
    let trimmed = raw.trim();
    let valid_shape = trimmed.len() == 5 && trimmed.as_bytes()[2] == b':';
    if !valid_shape {
        return Err(LifecycleError::InvalidInput(format!("time '{raw}' is not HH:MM")));
    }
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .map_err(|_| LifecycleError::InvalidInput(format!("time '{raw}' is not HH:MM")))
}

/// Acceptable submission window around a due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckInWindow {
    pub start_day_offset: i64,
    pub start_time: NaiveTime,
    pub end_day_offset: i64,
    pub end_time: NaiveTime,
}

impl CheckInWindow {
    pub fn from_config(config: &WindowConfig) -> Result<Self> {
        let window = Self {
            start_day_offset: config.start_day_offset,
            start_time: parse_hhmm(&config.start_time)?,
            end_day_offset: config.end_day_offset,
            end_time: parse_hhmm(&config.end_time)?,
        };
        window.validate()?;
        Ok(window)
    }

    /// A window must not open after it closes.
    pub fn validate(&self) -> Result<()> {
        if (self.start_day_offset, self.start_time) > (self.end_day_offset, self.end_time) {
            return Err(LifecycleError::InvalidInput(
                "check-in window starts after it ends".to_string(),
            ));
        }
        Ok(())
    }
}

/// Resolved schedule configuration injected into the generator and aligner.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub default_due_time: NaiveTime,
    pub timezone: Tz,
    pub window: CheckInWindow,
}

impl ScheduleSettings {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self> {
        let timezone = config.timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(timezone = %config.timezone, "unrecognised timezone; falling back to UTC");
            Tz::UTC
        });
        Ok(Self {
            default_due_time: parse_hhmm(&config.default_due_time)?,
            timezone,
            window: CheckInWindow::from_config(&config.window)?,
        })
    }

    /// Interpret `date` + `time` in the schedule timezone.
    ///
    /// Ambiguous local times (DST fall-back) take the earlier instant; times
    /// inside a DST gap move forward by the gap.
    pub fn combine(&self, date: NaiveDate, time: NaiveTime) -> Result<DateTime<Utc>> {
        let naive = date.and_time(time);
        let local = match self.timezone.from_local_datetime(&naive) {
            LocalResult::Single(t) => t,
            LocalResult::Ambiguous(earliest, _) => earliest,
            LocalResult::None => self
                .timezone
                .from_local_datetime(&(naive + Duration::hours(1)))
                .earliest()
                .ok_or_else(|| {
                    LifecycleError::InvalidInput(format!(
                        "{naive} does not exist in {}",
                        self.timezone
                    ))
                })?,
        };
        Ok(local.with_timezone(&Utc))
    }

    /// Calendar date of `instant` in the schedule timezone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    pub fn window_around(
        &self,
        due_date: NaiveDate,
        window: &CheckInWindow,
    ) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start_date = due_date + Duration::days(window.start_day_offset);
        let end_date = due_date + Duration::days(window.end_day_offset);
        let start = self.combine(start_date, window.start_time)?;
        let end = self.combine(end_date, window.end_time)?;
        Ok((start, end))
    }
}

/// Enrollment inputs for a new series.
#[derive(Debug, Clone)]
pub struct EnrollmentParams {
    pub client_id: String,
    pub form_id: String,
    pub coach_id: String,
    /// Defaults to "today" when absent.
    pub start_date: Option<NaiveDate>,
    /// Defaults to `start_date + 7 days` when absent.
    pub first_check_in_date: Option<NaiveDate>,
    /// `HH:MM`; defaults to the configured due time.
    pub due_time: Option<String>,
    pub frequency: Frequency,
    /// Number of planned slots.
    pub duration: i64,
    /// Overrides the configured default window.
    pub check_in_window: Option<CheckInWindow>,
}

#[derive(Debug, Clone)]
pub struct ScheduleGenerator {
    settings: ScheduleSettings,
}

impl ScheduleGenerator {
    pub fn new(settings: ScheduleSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ScheduleSettings {
        &self.settings
    }

    /// Compute slot 1 of a series.
    pub fn generate_anchor(&self, params: &EnrollmentParams, today: NaiveDate) -> Result<Slot> {
        if params.client_id.trim().is_empty() || params.form_id.trim().is_empty() {
            return Err(LifecycleError::InvalidInput(
                "clientId and formId are required".to_string(),
            ));
        }
        if params.duration <= 0 {
            return Err(LifecycleError::InvalidInput(format!(
                "duration must be positive, got {}",
                params.duration
            )));
        }
        let total = u32::try_from(params.duration)
            .map_err(|_| {
                LifecycleError::InvalidInput(format!("duration {} is too large", params.duration))
            })?;
        if params.frequency == Frequency::Once && total != 1 {
            return Err(LifecycleError::InvalidInput(format!(
                "a one-off series plans exactly 1 slot, got {total}"
            )));
        }

        let due_time = match &params.due_time {
            Some(raw) => parse_hhmm(raw)?,
            None => self.settings.default_due_time,
        };
        let start_date = params.start_date.unwrap_or(today);
        let first_date = params
            .first_check_in_date
            .unwrap_or(start_date + Duration::days(7));
        if first_date < start_date {
            return Err(LifecycleError::InvalidInput(format!(
                "first check-in {first_date} precedes program start {start_date}"
            )));
        }

        let window = params.check_in_window.unwrap_or(self.settings.window);
        window.validate()?;
        let due_at = self.settings.combine(first_date, due_time)?;
        let (window_start, window_end) = self.settings.window_around(first_date, &window)?;

        debug!(
            client = %params.client_id,
            form = %params.form_id,
            %due_at,
            total,
            frequency = params.frequency.slug(),
            "anchor slot generated"
        );

        Ok(Slot {
            slot_id: Uuid::new_v4().to_string(),
            client_id: params.client_id.clone(),
            form_id: params.form_id.clone(),
            coach_id: params.coach_id.clone(),
            sequence_number: 1,
            total_slots_planned: total,
            frequency: params.frequency,
            due_at,
            check_in_window_start: window_start,
            check_in_window_end: window_end,
            status: SlotStatus::Pending,
            linked_response_id: None,
            completed_at: None,
            score: None,
            last_alignment: None,
        })
    }

    /// Compute slot `n` of the series anchored at `anchor`.  The anchor's
    /// window offsets are carried over unchanged.
    pub fn generate_slot(&self, anchor: &Slot, n: u32) -> Result<Slot> {
        if n == 0 || n > anchor.total_slots_planned {
            return Err(LifecycleError::InvalidInput(format!(
                "slot {n} is outside 1..={}",
                anchor.total_slots_planned
            )));
        }
        if n == 1 {
            return Ok(anchor.clone());
        }
        let period = anchor.frequency.period_days().ok_or_else(|| {
            let frequency = anchor.frequency.slug();
            LifecycleError::InvalidInput(format!("{frequency} series has no slot {n}"))
        })?;

        let shift = Duration::days(period * (n as i64 - 1));
        Ok(Slot {
            slot_id: Uuid::new_v4().to_string(),
            sequence_number: n,
            due_at: anchor.due_at + shift,
            check_in_window_start: anchor.check_in_window_start + shift,
            check_in_window_end: anchor.check_in_window_end + shift,
            status: SlotStatus::Pending,
            linked_response_id: None,
            completed_at: None,
            score: None,
            last_alignment: None,
            ..anchor.clone()
        })
    }

    /// The slot following `slot`, or `None` once the plan is exhausted.
    pub fn generate_next(&self, slot: &Slot) -> Result<Option<Slot>> {
        if slot.sequence_number >= slot.total_slots_planned {
            return Ok(None);
        }
        let Some(period) = slot.frequency.period_days() else {
            return Ok(None);
        };
        let shift = Duration::days(period);
        Ok(Some(Slot {
            slot_id: Uuid::new_v4().to_string(),
            sequence_number: slot.sequence_number + 1,
            due_at: slot.due_at + shift,
            check_in_window_start: slot.check_in_window_start + shift,
            check_in_window_end: slot.check_in_window_end + shift,
            status: SlotStatus::Pending,
            linked_response_id: None,
            completed_at: None,
            score: None,
            ..slot.clone()
        }))
    }

    /// Every planned slot of a new series, anchor first.
    pub fn generate_series(
        &self,
        params: &EnrollmentParams,
        today: NaiveDate,
    ) -> Result<Vec<Slot>> {
        let anchor = self.generate_anchor(params, today)?;
        let mut slots = Vec::with_capacity(anchor.total_slots_planned as usize);
        for n in 2..=anchor.total_slots_planned {
            slots.push(self.generate_slot(&anchor, n)?);
        }
        slots.insert(0, anchor);
        Ok(slots)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Timelike};

    use super::*;

    fn generator() -> ScheduleGenerator {
        ScheduleGenerator::new(ScheduleSettings::from_config(&ScheduleConfig::default()).unwrap())
    }

    fn params(duration: i64) -> EnrollmentParams {
        EnrollmentParams {
            client_id: "client-1".into(),
            form_id: "form-1".into(),
            coach_id: "coach-1".into(),
            start_date: NaiveDate::from_ymd_opt(2025, 12, 29),
            first_check_in_date: None,
            due_time: None,
            frequency: Frequency::Weekly,
            duration,
            check_in_window: None,
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 12, 20).unwrap()
    }

    #[test]
    fn anchor_defaults_to_start_plus_seven_at_nine() {
        let slot = generator().generate_anchor(&params(4), today()).unwrap();
        assert_eq!(slot.due_at, Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap());
        assert_eq!(slot.sequence_number, 1);
        assert_eq!(slot.total_slots_planned, 4);
        assert_eq!(slot.status, SlotStatus::Pending);
        assert!(slot.linked_response_id.is_none());
    }

    #[test]
    fn missing_start_date_uses_today() {
        let mut p = params(1);
        p.start_date = None;
        let slot = generator().generate_anchor(&p, today()).unwrap();
        assert_eq!(slot.due_at, Utc.with_ymd_and_hms(2025, 12, 27, 9, 0, 0).unwrap());
    }

    #[test]
    fn explicit_first_date_and_due_time() {
        let mut p = params(2);
        p.first_check_in_date = NaiveDate::from_ymd_opt(2026, 1, 12);
        p.due_time = Some("17:45".into());
        let slot = generator().generate_anchor(&p, today()).unwrap();
        assert_eq!(slot.due_at, Utc.with_ymd_and_hms(2026, 1, 12, 17, 45, 0).unwrap());
    }

    #[test]
    fn default_window_surrounds_due_date() {
        let slot = generator().generate_anchor(&params(1), today()).unwrap();
        assert_eq!(slot.check_in_window_start, Utc.with_ymd_and_hms(2026, 1, 4, 0, 0, 0).unwrap());
        assert_eq!(slot.check_in_window_end, Utc.with_ymd_and_hms(2026, 1, 7, 23, 59, 0).unwrap());
    }

    #[test]
    fn injected_window_is_honoured() {
        let mut config = ScheduleConfig::default();
        config.window = WindowConfig {
            start_day_offset: 0,
            start_time: "06:00".into(),
            end_day_offset: 0,
            end_time: "21:00".into(),
        };
        let generator = ScheduleGenerator::new(ScheduleSettings::from_config(&config).unwrap());
        let slot = generator.generate_anchor(&params(1), today()).unwrap();
        assert_eq!(slot.check_in_window_start.hour(), 6);
        assert_eq!(slot.check_in_window_end.hour(), 21);
    }

    #[test]
    fn rejects_non_positive_duration() {
        for duration in [0, -3] {
            let err = generator().generate_anchor(&params(duration), today()).unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidInput(_)));
        }
    }

    #[test]
    fn rejects_unparseable_due_time() {
        for raw in ["9am", "25:00", "09-00", "9:00", ""] {
            let mut p = params(1);
            p.due_time = Some(raw.into());
            let err = generator().generate_anchor(&p, today()).unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidInput(_)), "{raw} should be rejected");
        }
    }

    #[test]
    fn rejects_first_check_in_before_start() {
        let mut p = params(1);
        p.first_check_in_date = NaiveDate::from_ymd_opt(2025, 12, 1);
        assert!(generator().generate_anchor(&p, today()).is_err());
    }

    #[test]
    fn once_series_plans_a_single_slot() {
        let mut p = params(3);
        p.frequency = Frequency::Once;
        assert!(generator().generate_anchor(&p, today()).is_err());
        p.duration = 1;
        let series = generator().generate_series(&p, today()).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn weekly_series_spacing_and_single_anchor() {
        let series = generator().generate_series(&params(6), today()).unwrap();
        assert_eq!(series.len(), 6);
        assert_eq!(series.iter().filter(|s| s.sequence_number == 1).count(), 1);
        let anchor = &series[0];
        for slot in &series {
            let n = slot.sequence_number as i64;
            assert_eq!(slot.due_at, anchor.due_at + Duration::days(7 * (n - 1)));
            assert_eq!(
                slot.check_in_window_end - slot.due_at,
                anchor.check_in_window_end - anchor.due_at
            );
            assert_eq!(slot.client_id, anchor.client_id);
        }
        let mut ids: Vec<&str> = series.iter().map(|s| s.slot_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);
    }

    #[test]
    fn generate_next_follows_period_until_plan_ends() {
        let g = generator();
        let anchor = g.generate_anchor(&params(2), today()).unwrap();
        let second = g.generate_next(&anchor).unwrap().unwrap();
        assert_eq!(second.sequence_number, 2);
        assert_eq!(second.due_at, anchor.due_at + Duration::days(7));
        assert!(g.generate_next(&second).unwrap().is_none());
    }

    #[test]
    fn fortnightly_period() {
        let mut p = params(3);
        p.frequency = Frequency::Fortnightly;
        let series = generator().generate_series(&p, today()).unwrap();
        assert_eq!(series[2].due_at - series[0].due_at, Duration::days(28));
    }

    #[test]
    fn generate_slot_bounds() {
        let g = generator();
        let anchor = g.generate_anchor(&params(3), today()).unwrap();
        assert!(g.generate_slot(&anchor, 0).is_err());
        assert!(g.generate_slot(&anchor, 4).is_err());
        assert_eq!(g.generate_slot(&anchor, 1).unwrap(), anchor);
    }

    #[test]
    fn timezone_combines_local_time() {
        let mut config = ScheduleConfig::default();
        config.timezone = "America/New_York".into();
        let settings = ScheduleSettings::from_config(&config).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let due = settings.combine(date, NaiveTime::from_hms_opt(9, 0, 0).unwrap()).unwrap();
        assert_eq!(due, Utc.with_ymd_and_hms(2026, 1, 5, 14, 0, 0).unwrap());
        assert_eq!(settings.local_date(due), NaiveDate::from_ymd_opt(2026, 1, 5).unwrap());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let mut config = ScheduleConfig::default();
        config.timezone = "Mars/Olympus_Mons".into();
        let settings = ScheduleSettings::from_config(&config).unwrap();
        assert_eq!(settings.timezone, Tz::UTC);
    }

    #[test]
    fn inverted_window_is_invalid() {
        let config = WindowConfig {
            start_day_offset: 2,
            start_time: "00:00".into(),
            end_day_offset: 1,
            end_time: "23:00".into(),
        };
        assert!(CheckInWindow::from_config(&config).is_err());
    }

    #[test]
    fn caller_window_is_checked_before_planning() {
        let mut p = params(3);
        p.check_in_window = Some(CheckInWindow {
            start_day_offset: 1,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_day_offset: 1,
            end_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        });
        let err = generator().generate_anchor(&p, today()).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidInput(_)));

        p.check_in_window = Some(CheckInWindow {
            start_day_offset: -1,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_day_offset: 0,
            end_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
        });
        assert!(generator().generate_anchor(&p, today()).is_ok());
    }
}
