use chrono::NaiveTime;
use serde::Serialize;

/// Hours charged for one unjustified absence. The charge is a two-bucket
/// step function of the session window, never a continuous duration.
pub const HALF_DAY_HOURS: f64 = 2.5;
pub const FULL_DAY_HOURS: f64 = 5.0;

/// Sessions up to this long charge the half-day rate.
const HALF_DAY_LIMIT_MINUTES: i64 = 3 * 60;

/// Every full 2.5h of unjustified absence costs half a point.
const ABSENCE_HOURS_PER_STEP: f64 = 2.5;
const ABSENCE_STEP_DEDUCTION: f64 = 0.5;

/// Every 4 late arrivals cost one full point.
const LATE_ARRIVALS_PER_STEP: i64 = 4;

const MAX_NOTE: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl AttendanceStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "present" => Some(Self::Present),
            "late" => Some(Self::Late),
            "absent" => Some(Self::Absent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Late => "late",
            Self::Absent => "absent",
        }
    }
}

/// Session times are stored as text. Accept both HH:MM and HH:MM:SS.
pub fn parse_session_time(s: &str) -> Option<NaiveTime> {
    let t = s.trim();
    NaiveTime::parse_from_str(t, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
        .ok()
}

/// 1-decimal half-up rounding used for disciplinary notes.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Absence-hour charge for one trainee outcome in one session.
///
/// Justified entries never charge hours, whatever their status. Lateness is
/// tracked by count, not hours. Statuses the daemon does not recognize charge
/// nothing; callers that care should reject them before storing.
pub fn absence_hours(
    status: &str,
    justified: bool,
    starts_at: NaiveTime,
    ends_at: NaiveTime,
) -> f64 {
    if justified {
        return 0.0;
    }
    match AttendanceStatus::parse(status) {
        Some(AttendanceStatus::Absent) => {
            let minutes = (ends_at - starts_at).num_minutes();
            if minutes <= HALF_DAY_LIMIT_MINUTES {
                HALF_DAY_HOURS
            } else {
                FULL_DAY_HOURS
            }
        }
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisciplinaryBreakdown {
    pub absence_deduction: f64,
    pub lateness_deduction: f64,
    pub note: f64,
}

/// Disciplinary note in [0, 20] from accumulated unjustified absence hours
/// and the late-arrival count.
pub fn disciplinary_breakdown(
    total_absence_hours: f64,
    late_arrival_count: i64,
) -> DisciplinaryBreakdown {
    let absence_deduction =
        (total_absence_hours / ABSENCE_HOURS_PER_STEP).floor() * ABSENCE_STEP_DEDUCTION;
    let lateness_deduction = if late_arrival_count > 0 {
        (late_arrival_count / LATE_ARRIVALS_PER_STEP) as f64
    } else {
        0.0
    };
    let note = round_off_1_decimal((MAX_NOTE - absence_deduction - lateness_deduction).max(0.0));
    DisciplinaryBreakdown {
        absence_deduction,
        lateness_deduction,
        note,
    }
}

#[allow(dead_code)]
pub fn disciplinary_note(total_absence_hours: f64, late_arrival_count: i64) -> f64 {
    disciplinary_breakdown(total_absence_hours, late_arrival_count).note
}
