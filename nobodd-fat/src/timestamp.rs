//! Decoding of packed FAT on-disk date/time fields.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};

/// Decode a packed FAT date field into a naive calendar date.
///
/// Bits 15-9: year offset from 1980. Bits 8-5: month (1-12). Bits 4-0: day
/// (1-31). Returns `None` for a field that doesn't decode to a real
/// calendar date (FAT does not guarantee this is always the case on
/// corrupted media).
pub fn decode_date(date: u16) -> Option<NaiveDate> {
    let year = 1980 + i32::from(date >> 9);
    let month = u32::from((date >> 5) & 0x0F);
    let day = u32::from(date & 0x1F);
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Decode a packed FAT time field (plus an optional tenths-of-a-second
/// field, only present on the creation timestamp) into a naive time.
///
/// Bits 15-11: hours. Bits 10-5: minutes. Bits 4-0: seconds / 2.
pub fn decode_time(time: u16, tenths: u8) -> Option<NaiveTime> {
    let hour = u32::from(time >> 11);
    let minute = u32::from((time >> 5) & 0x3F);
    let second = u32::from(time & 0x1F) * 2 + u32::from(tenths) / 100;
    let milli = (u32::from(tenths) % 100) * 10;
    NaiveTime::from_hms_milli_opt(hour, minute, second, milli)
}

/// Decode a `(date, time, tenths)` triple into a full timestamp, applying
/// `tz` (the `FatFileSystem`'s configured offset) or UTC if none was
/// configured.
pub fn decode_datetime(
    date: u16,
    time: u16,
    tenths: u8,
    tz: Option<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    let date = decode_date(date)?;
    let time = decode_time(time, tenths)?;
    let naive = NaiveDateTime::new(date, time);
    let offset = tz.unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    naive.and_local_timezone(offset).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_date() {
        // 2024-03-17: year offset 44, month 3, day 17
        let date = (44u16 << 9) | (3 << 5) | 17;
        assert_eq!(decode_date(date), NaiveDate::from_ymd_opt(2024, 3, 17));
    }

    #[test]
    fn decodes_known_time_with_tenths() {
        // 13:05:30.5 -> hour 13, min 5, sec/2=15, tenths=105 (0.5s extra => 100*1 +5)
        let time = (13u16 << 11) | (5 << 5) | 15;
        let t = decode_time(time, 105).unwrap();
        assert_eq!(t.format("%H:%M:%S%.3f").to_string(), "13:05:31.050");
    }

    #[test]
    fn defaults_to_utc_without_tz() {
        let date = (44u16 << 9) | (3 << 5) | 17;
        let time = (12u16 << 11) | (0 << 5) | 0;
        let dt = decode_datetime(date, time, 0, None).unwrap();
        assert_eq!(dt.offset().local_minus_utc(), 0);
    }
}
