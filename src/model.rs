use std::collections::HashMap;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only instant type inside the engine.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Wall-clock `date` + `time` as an instant. Dates carry no zone; everything
/// is interpreted in the business's local calendar.
pub fn instant(date: NaiveDate, time: NaiveTime) -> Ms {
    date.and_time(time).and_utc().timestamp_millis()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

/// Accepts `HH:MM` and `HH:MM:SS`.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

/// Hours as sent by clients (`1.5`) → whole minutes. `None` for non-positive
/// or non-finite input.
pub fn minutes_from_hours(hours: f64) -> Option<u32> {
    if !hours.is_finite() || hours <= 0.0 {
        return None;
    }
    let minutes = (hours * 60.0).round();
    if minutes < 1.0 || minutes > f64::from(u32::MAX) {
        return None;
    }
    Some(minutes as u32)
}

pub fn hours_from_minutes(minutes: u32) -> f64 {
    f64::from(minutes) / 60.0
}

mod hhmm {
    use chrono::NaiveTime;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&time.format("%H:%M"))
    }
}

// ── Collaborator records ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    /// Every non-terminal-cancelled booking occupies its time.
    pub fn blocks(self) -> bool {
        !matches!(self, BookingStatus::Cancelled)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

/// A booking row as returned by the booking data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub status: BookingStatus,
}

impl BookingRecord {
    pub fn span(&self) -> Span {
        Span::new(instant(self.date, self.start), instant(self.date, self.end))
    }
}

/// A service row as returned by the service catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: Ulid,
    pub name: String,
    pub base_price: f64,
    pub price_per_hour: f64,
}

// ── Schedule ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl BusinessHours {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Option<Self> {
        (open < close).then_some(Self { open, close })
    }

    /// Parses `08:00-18:00`.
    pub fn parse(s: &str) -> Option<Self> {
        let (open, close) = s.split_once('-')?;
        Self::new(parse_time(open)?, parse_time(close)?)
    }

    pub fn window_minutes(&self) -> u32 {
        ((self.close - self.open).num_minutes()).max(0) as u32
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

/// Business hours per weekday plus slot granularity.
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub default_hours: BusinessHours,
    pub granularity_minutes: u32,
    /// `None` marks the weekday closed.
    pub overrides: HashMap<Weekday, Option<BusinessHours>>,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            default_hours: BusinessHours::default(),
            granularity_minutes: 30,
            overrides: HashMap::new(),
        }
    }
}

impl Schedule {
    pub fn hours_on(&self, date: NaiveDate) -> Option<BusinessHours> {
        match self.overrides.get(&date.weekday()) {
            Some(over) => *over,
            None => Some(self.default_hours),
        }
    }

    /// Longest window of any open day; bounds the acceptable duration.
    pub fn longest_window_minutes(&self) -> u32 {
        self.overrides
            .values()
            .flatten()
            .map(BusinessHours::window_minutes)
            .chain(std::iter::once(self.default_hours.window_minutes()))
            .max()
            .unwrap_or(0)
    }
}

// ── Queries ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AvailabilityQuery {
    pub date: NaiveDate,
    pub service_id: Option<Ulid>,
    pub duration_minutes: u32,
    pub exclude_booking_id: Option<Ulid>,
}

impl AvailabilityQuery {
    pub fn new(date: NaiveDate, duration_minutes: u32) -> Self {
        Self {
            date,
            service_id: None,
            duration_minutes,
            exclude_booking_id: None,
        }
    }

    pub fn for_service(mut self, service_id: Ulid) -> Self {
        self.service_id = Some(service_id);
        self
    }

    pub fn excluding(mut self, booking_id: Ulid) -> Self {
        self.exclude_booking_id = Some(booking_id);
        self
    }
}

// ── Results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlot {
    #[serde(with = "hhmm")]
    pub time: NaiveTime,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub conflicting_bookings: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_slots: u32,
    pub available_slots: u32,
    pub booked_slots: u32,
    pub availability_percentage: f64,
}

impl Summary {
    /// One pass over resolved slots.
    pub fn of(slots: &[TimeSlot]) -> Self {
        let (total, available) = slots.iter().fold((0u32, 0u32), |(t, a), s| {
            (t + 1, a + u32::from(s.available))
        });
        Self {
            total_slots: total,
            available_slots: available,
            booked_slots: total - available,
            availability_percentage: percentage(available, total),
        }
    }
}

pub fn percentage(part: u32, total: u32) -> f64 {
    if total == 0 {
        0.0
    } else {
        f64::from(part) / f64::from(total) * 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub id: Ulid,
    pub name: String,
    pub base_price: f64,
    pub price_per_hour: f64,
    pub estimated_price: f64,
}

impl ServiceInfo {
    pub fn snapshot(service: &ServiceRecord, duration_minutes: u32) -> Self {
        Self {
            id: service.id,
            name: service.name.clone(),
            base_price: service.base_price,
            price_per_hour: service.price_per_hour,
            estimated_price: service.base_price
                + service.price_per_hour * hours_from_minutes(duration_minutes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResult {
    pub date: NaiveDate,
    pub service_id: Option<Ulid>,
    /// Hours.
    pub duration: f64,
    pub slots: Vec<TimeSlot>,
    pub summary: Summary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_info: Option<ServiceInfo>,
}

impl AvailabilityResult {
    /// First free slot in generator order.
    pub fn next_available(&self) -> Option<&TimeSlot> {
        self.slots.iter().find(|s| s.available)
    }
}

/// Day-level shading for calendar views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DateAvailability {
    pub date: NaiveDate,
    pub available: bool,
    pub available_slots: u32,
    pub total_slots: u32,
    pub availability_percentage: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl DateAvailability {
    pub fn from_summary(date: NaiveDate, summary: &Summary) -> Self {
        let reason = if summary.total_slots == 0 {
            Some("closed".to_string())
        } else if summary.available_slots == 0 {
            Some("fully booked".to_string())
        } else {
            None
        };
        Self {
            date,
            available: summary.available_slots > 0,
            available_slots: summary.available_slots,
            total_slots: summary.total_slots,
            availability_percentage: summary.availability_percentage,
            reason,
        }
    }
}
