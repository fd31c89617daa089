//! Timestamp codecs shared by the engines.
//!
//! FAT stores local-time DOS date/time words with 2-second resolution and a
//! 1980 epoch; NTFS stores 100-nanosecond ticks since 1601-01-01 UTC.

use chrono::{DateTime, Datelike, Local, LocalResult, NaiveDate, TimeZone, Timelike, Utc};

use super::filesystem::TimeZoneSpec;

/// 100-ns intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;

/// Decode a DOS date/time word pair. `tenths` carries 0–199 extra
/// centiseconds for creation times. Returns `None` for the unset (zero) date
/// or out-of-range fields.
pub fn decode_dos_datetime(
    date: u16,
    time: u16,
    tenths: u8,
    tz: TimeZoneSpec,
) -> Option<DateTime<Utc>> {
    if date == 0 {
        return None;
    }
    let day = (date & 0x1F) as u32;
    let month = ((date >> 5) & 0x0F) as u32;
    let year = ((date >> 9) & 0x7F) as i32 + 1980;
    let second = ((time & 0x1F) * 2) as u32 + (tenths / 100) as u32;
    let minute = ((time >> 5) & 0x3F) as u32;
    let hour = ((time >> 11) & 0x1F) as u32;
    let millis = (tenths % 100) as u32 * 10;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_milli_opt(hour, minute, second, millis)?;

    match tz {
        TimeZoneSpec::Utc => Some(Utc.from_utc_datetime(&naive)),
        TimeZoneSpec::Local => match Local.from_local_datetime(&naive) {
            LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => {
                Some(t.with_timezone(&Utc))
            }
            LocalResult::None => None,
        },
    }
}

/// Encode a timestamp as (date word, time word, creation tenths), clamping to
/// the representable 1980–2107 range and truncating to 2-second resolution.
pub fn encode_dos_datetime(when: DateTime<Utc>, tz: TimeZoneSpec) -> (u16, u16, u8) {
    let naive = match tz {
        TimeZoneSpec::Utc => when.naive_utc(),
        TimeZoneSpec::Local => when.with_timezone(&Local).naive_local(),
    };

    let year = naive.year().clamp(1980, 2107);
    let date = (((year - 1980) as u16) << 9)
        | ((naive.month() as u16) << 5)
        | naive.day() as u16;
    let time = ((naive.hour() as u16) << 11)
        | ((naive.minute() as u16) << 5)
        | (naive.second() as u16 / 2);
    let tenths = ((naive.second() % 2) * 100) as u8
        + (when.timestamp_subsec_millis() / 10).min(99) as u8;
    (date, time, tenths)
}

/// Convert an NTFS FILETIME (100-ns ticks since 1601-01-01 UTC) to a
/// timestamp. Zero and pre-Unix-epoch values decode to `None`.
pub fn decode_filetime(filetime: u64) -> Option<DateTime<Utc>> {
    if filetime == 0 {
        return None;
    }
    let since_unix = filetime.checked_sub(FILETIME_UNIX_OFFSET)?;
    let seconds = (since_unix / 10_000_000) as i64;
    let nanoseconds = ((since_unix % 10_000_000) * 100) as u32;
    Utc.timestamp_opt(seconds, nanoseconds).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dos_roundtrip() {
        let when = Utc.with_ymd_and_hms(2015, 6, 15, 13, 45, 30).unwrap();
        let (date, time, tenths) = encode_dos_datetime(when, TimeZoneSpec::Utc);
        let back = decode_dos_datetime(date, time, tenths, TimeZoneSpec::Utc).unwrap();
        assert_eq!(back, when);
    }

    #[test]
    fn test_dos_two_second_truncation() {
        let when = Utc.with_ymd_and_hms(2015, 6, 15, 13, 45, 31).unwrap();
        let (date, time, tenths) = encode_dos_datetime(when, TimeZoneSpec::Utc);
        // Odd second lands in the tenths byte, not the 2-second field.
        assert_eq!(time & 0x1F, 15);
        assert_eq!(tenths, 100);
        let back = decode_dos_datetime(date, time, tenths, TimeZoneSpec::Utc).unwrap();
        assert_eq!(back, when);
    }

    #[test]
    fn test_dos_epoch() {
        let back = decode_dos_datetime(0x0021, 0, 0, TimeZoneSpec::Utc).unwrap();
        assert_eq!(back, Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_dos_zero_date_is_unset() {
        assert!(decode_dos_datetime(0, 0x1234, 0, TimeZoneSpec::Utc).is_none());
    }

    #[test]
    fn test_dos_invalid_fields_rejected() {
        // Month 15.
        let date = (20 << 9) | (15 << 5) | 1;
        assert!(decode_dos_datetime(date, 0, 0, TimeZoneSpec::Utc).is_none());
    }

    #[test]
    fn test_filetime_unix_epoch() {
        let t = decode_filetime(FILETIME_UNIX_OFFSET).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_filetime_known_value() {
        // 127_395_145_250_000_000 ticks = 2004-09-13 UTC.
        let t = decode_filetime(127_395_145_250_000_000).unwrap();
        assert_eq!(t.year(), 2004);
        assert_eq!(t.month(), 9);
        assert_eq!(t.day(), 13);
    }

    #[test]
    fn test_filetime_zero_is_unset() {
        assert!(decode_filetime(0).is_none());
    }
}
