//! Binary DATE, DATETIME and TIME values.
//!
//! The leading length byte selects the shape: 4 is a date, 7 and 11 a datetime without and with
//! microseconds, 9 and 13 a time without and with microseconds. Only the time shape carries a
//! sign byte. Any other length decodes to [`TemporalKind::Invalid`].

use bytes::BufMut;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::{Error, ErrorCode, Result};
use crate::protocol::wire::Reader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemporalKind {
    Date,
    DateTime,
    Time,
    #[default]
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Temporal {
    pub kind: TemporalKind,
    pub negative: bool,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl Temporal {
    pub fn date(year: u16, month: u8, day: u8) -> Self {
        Self {
            kind: TemporalKind::Date,
            year,
            month,
            day,
            ..Self::default()
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn datetime(
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    ) -> Self {
        Self {
            kind: TemporalKind::DateTime,
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
            ..Self::default()
        }
    }

    pub fn time(negative: bool, hour: u8, minute: u8, second: u8, microsecond: u32) -> Self {
        Self {
            kind: TemporalKind::Time,
            negative,
            hour,
            minute,
            second,
            microsecond,
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind != TemporalKind::Invalid
    }

    /// Value of the leading length byte, `None` for an invalid value.
    pub fn wire_len(&self) -> Option<u8> {
        let micros = if self.microsecond > 0 { 4 } else { 0 };
        match self.kind {
            TemporalKind::Date => Some(4),
            TemporalKind::DateTime => Some(7 + micros),
            TemporalKind::Time => Some(9 + micros),
            TemporalKind::Invalid => None,
        }
    }

    /// Writes the length byte and body, returning the number of bytes written.
    pub fn encode<B: BufMut + ?Sized>(&self, buf: &mut B) -> Result<usize> {
        let len = self.wire_len().ok_or_else(|| {
            Error::with_message(ErrorCode::InvalidValue, "Cannot encode an invalid temporal value")
        })?;
        buf.put_u8(len);
        if self.kind == TemporalKind::Time {
            buf.put_u8(u8::from(self.negative));
        }
        buf.put_u16_le(self.year);
        buf.put_u8(self.month);
        buf.put_u8(self.day);
        if self.kind != TemporalKind::Date {
            buf.put_u8(self.hour);
            buf.put_u8(self.minute);
            buf.put_u8(self.second);
            if self.microsecond > 0 {
                buf.put_u32_le(self.microsecond);
            }
        }
        Ok(1 + usize::from(len))
    }

    /// Reads one value. An unknown length byte yields an invalid value and leaves the body
    /// unread.
    #[track_caller]
    pub fn decode(reader: &mut Reader<'_>) -> Result<Self> {
        let len = reader.get_u8()?;
        let (kind, has_micros) = match len {
            4 => (TemporalKind::Date, false),
            7 | 11 => (TemporalKind::DateTime, len == 11),
            9 | 13 => (TemporalKind::Time, len == 13),
            _ => return Ok(Self::default()),
        };
        reader.ensure(usize::from(len))?;

        let mut value = Self {
            kind,
            ..Self::default()
        };
        if kind == TemporalKind::Time {
            value.negative = reader.get_u8()? != 0;
        }
        value.year = reader.get_u16()?;
        value.month = reader.get_u8()?;
        value.day = reader.get_u8()?;
        if kind != TemporalKind::Date {
            value.hour = reader.get_u8()?;
            value.minute = reader.get_u8()?;
            value.second = reader.get_u8()?;
        }
        if has_micros {
            value.microsecond = reader.get_u32()?;
        }
        Ok(value)
    }

    pub fn to_naive_date(&self) -> Option<NaiveDate> {
        match self.kind {
            TemporalKind::Date | TemporalKind::DateTime => NaiveDate::from_ymd_opt(
                i32::from(self.year),
                u32::from(self.month),
                u32::from(self.day),
            ),
            _ => None,
        }
    }

    pub fn to_naive_datetime(&self) -> Option<NaiveDateTime> {
        let date = self.to_naive_date()?;
        let time = NaiveTime::from_hms_micro_opt(
            u32::from(self.hour),
            u32::from(self.minute),
            u32::from(self.second),
            self.microsecond,
        )?;
        Some(date.and_time(time))
    }

    pub fn from_naive_time(negative: bool, time: NaiveTime) -> Self {
        Self::time(
            negative,
            time.hour() as u8,
            time.minute() as u8,
            time.second() as u8,
            time.nanosecond() / 1_000,
        )
    }
}

impl From<NaiveDate> for Temporal {
    fn from(date: NaiveDate) -> Self {
        Temporal::date(date.year() as u16, date.month() as u8, date.day() as u8)
    }
}

impl From<NaiveDateTime> for Temporal {
    fn from(dt: NaiveDateTime) -> Self {
        Temporal::datetime(
            dt.year() as u16,
            dt.month() as u8,
            dt.day() as u8,
            dt.hour() as u8,
            dt.minute() as u8,
            dt.second() as u8,
            dt.nanosecond() / 1_000,
        )
    }
}
