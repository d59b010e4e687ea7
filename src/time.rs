//! DOS date/time encoding used by directory entries.
//!
//! Relocation never invents new timestamps — every defrag/frag/error-inject
//! operation preserves whatever a directory entry already carries — so this
//! module only needs decode/encode, not a "current time" provider.

use chrono::{DateTime as ChronoDateTime, Datelike, Local, TimeZone, Timelike};

/// A DOS compatible date, as stored in a directory entry's date fields.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Date {
    /// Full year - [1980, 2107]
    pub year: u16,
    /// Month of the year - [1, 12]
    pub month: u16,
    /// Day of the month - [1, 31]
    pub day: u16,
}

impl Date {
    pub(crate) fn decode(dos_date: u16) -> Self {
        let (year, month, day) = ((dos_date >> 9) + 1980, (dos_date >> 5) & 0xF, dos_date & 0x1F);
        Date { year, month, day }
    }

    pub(crate) fn encode(&self) -> u16 {
        ((self.year - 1980) << 9) | (self.month << 5) | self.day
    }
}

/// A DOS compatible time, as stored in a directory entry's time fields.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Time {
    /// Hours after midnight - [0, 23]
    pub hour: u16,
    /// Minutes after the hour - [0, 59]
    pub min: u16,
    /// Seconds after the minute - [0, 59]
    pub sec: u16,
    /// Milliseconds after the second - [0, 999]
    pub millis: u16,
}

impl Time {
    pub(crate) fn decode(dos_time: u16, dos_time_hi_res: u8) -> Self {
        let hour = dos_time >> 11;
        let min = (dos_time >> 5) & 0x3F;
        let sec = (dos_time & 0x1F) * 2 + (dos_time_hi_res as u16) / 2;
        let millis = (dos_time_hi_res as u16 % 100) * 10;
        Time { hour, min, sec, millis }
    }

    pub(crate) fn encode(&self) -> (u16, u8) {
        let dos_time = (self.hour << 11) | (self.min << 5) | (self.sec / 2);
        let dos_time_hi_res = ((self.millis / 100) + (self.sec % 2) * 100) as u8;
        (dos_time, dos_time_hi_res)
    }
}

/// A DOS compatible date and time, combining a [`Date`] and a [`Time`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DateTime {
    pub date: Date,
    pub time: Time,
}

impl DateTime {
    pub(crate) fn decode(dos_date: u16, dos_time: u16, dos_time_hi_res: u8) -> Self {
        DateTime {
            date: Date::decode(dos_date),
            time: Time::decode(dos_time, dos_time_hi_res),
        }
    }
}

impl From<DateTime> for ChronoDateTime<Local> {
    fn from(date_time: DateTime) -> Self {
        Local
            .with_ymd_and_hms(
                date_time.date.year as i32,
                date_time.date.month as u32,
                date_time.date.day as u32,
                date_time.time.hour as u32,
                date_time.time.min as u32,
                date_time.time.sec as u32,
            )
            .single()
            .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap())
    }
}

impl From<ChronoDateTime<Local>> for DateTime {
    fn from(date_time: ChronoDateTime<Local>) -> Self {
        DateTime {
            date: Date {
                year: date_time.year() as u16,
                month: date_time.month() as u16,
                day: date_time.day() as u16,
            },
            time: Time {
                hour: date_time.hour() as u16,
                min: date_time.minute() as u16,
                sec: date_time.second() as u16,
                millis: (date_time.nanosecond() / 1_000_000) as u16,
            },
        }
    }
}
