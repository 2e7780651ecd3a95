use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use tracing::debug;

/// Header id of the Info-ZIP "extended timestamp" extra field.
pub const EXTENDED_TIMESTAMP_TAG: u16 = 0x5455;

const FLAG_MODIFICATION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    ExtendedField,
    Legacy,
    Unknown,
}

impl TimeSource {
    pub fn label(self) -> &'static str {
        match self {
            Self::ExtendedField => "extended-field",
            Self::Legacy => "legacy",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedInstant {
    pub instant: DateTime<Utc>,
    pub source: TimeSource,
    /// Set when an extended field was present but could not be decoded.
    pub malformed_extra: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtraFieldError {
    #[error("extra field record at offset {offset} declares {declared} bytes but only {available} remain")]
    Truncated {
        offset: usize,
        declared: usize,
        available: usize,
    },
    #[error("extended timestamp record is empty")]
    EmptyPayload,
    #[error("modification flag set but payload is {len} bytes (need 5)")]
    MissingModification { len: usize },
    #[error("{0} trailing bytes after the last extra field record")]
    TrailingBytes(usize),
}

/// Walk the extra-field records and decode the modification time of the
/// extended-timestamp record, if any.
///
/// `Ok(None)` means no usable modification time is declared (no 0x5455
/// record, or the record does not set the modification flag).
pub fn parse_extended_mtime(extra: &[u8]) -> Result<Option<i64>, ExtraFieldError> {
    let mut offset = 0usize;
    while offset + 4 <= extra.len() {
        let tag = u16::from_le_bytes([extra[offset], extra[offset + 1]]);
        let size = u16::from_le_bytes([extra[offset + 2], extra[offset + 3]]) as usize;
        let start = offset + 4;
        let available = extra.len() - start;
        if size > available {
            return Err(ExtraFieldError::Truncated {
                offset,
                declared: size,
                available,
            });
        }
        let payload = &extra[start..start + size];

        if tag == EXTENDED_TIMESTAMP_TAG {
            let Some(&flags) = payload.first() else {
                return Err(ExtraFieldError::EmptyPayload);
            };
            if flags & FLAG_MODIFICATION == 0 {
                return Ok(None);
            }
            if payload.len() < 5 {
                return Err(ExtraFieldError::MissingModification { len: payload.len() });
            }
            let secs = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            return Ok(Some(i64::from(secs)));
        }

        offset = start + size;
    }

    if offset != extra.len() {
        return Err(ExtraFieldError::TrailingBytes(extra.len() - offset));
    }
    Ok(None)
}

/// Resolve the UTC instant of an archive entry.
///
/// The extended-timestamp field wins over the legacy DOS timestamp, which is
/// only second precision and carries no zone (read as UTC).
pub fn resolve(extra: &[u8], legacy: Option<NaiveDateTime>) -> ResolvedInstant {
    let mut malformed_extra = false;
    match parse_extended_mtime(extra) {
        Ok(Some(secs)) => {
            if let Some(instant) = DateTime::<Utc>::from_timestamp(secs, 0) {
                return ResolvedInstant {
                    instant,
                    source: TimeSource::ExtendedField,
                    malformed_extra,
                };
            }
        }
        Ok(None) => {}
        Err(err) => {
            debug!(%err, "ignoring malformed extended timestamp field");
            malformed_extra = true;
        }
    }

    match legacy {
        Some(naive) => ResolvedInstant {
            instant: naive.and_utc(),
            source: TimeSource::Legacy,
            malformed_extra,
        },
        None => ResolvedInstant {
            instant: DateTime::<Utc>::UNIX_EPOCH,
            source: TimeSource::Unknown,
            malformed_extra,
        },
    }
}

/// Convert the zip crate's DOS timestamp into a naive date-time.
pub fn legacy_from_zip(dt: zip::DateTime) -> Option<NaiveDateTime> {
    chrono::NaiveDate::from_ymd_opt(
        i32::from(dt.year()),
        u32::from(dt.month()),
        u32::from(dt.day()),
    )?
    .and_hms_opt(
        u32::from(dt.hour()),
        u32::from(dt.minute()),
        u32::from(dt.second()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn ut_record(flags: u8, stamps: &[u32]) -> Vec<u8> {
        let mut payload = vec![flags];
        for s in stamps {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        let mut out = EXTENDED_TIMESTAMP_TAG.to_le_bytes().to_vec();
        out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&payload);
        out
    }

    fn legacy() -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2020, 2, 2)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
    }

    #[test]
    fn extended_field_takes_precedence_over_legacy() {
        let extra = ut_record(0x03, &[1_704_499_205, 1_704_499_999]);
        let got = resolve(&extra, legacy());
        assert_eq!(got.source, TimeSource::ExtendedField);
        assert_eq!(
            got.instant,
            Utc.with_ymd_and_hms(2024, 1, 6, 0, 0, 5).unwrap()
        );
    }

    #[test]
    fn extended_field_found_after_other_records() {
        let mut extra = vec![0x01, 0x00, 0x04, 0x00, 0xaa, 0xbb, 0xcc, 0xdd];
        extra.extend(ut_record(0x01, &[86_400]));
        assert_eq!(parse_extended_mtime(&extra), Ok(Some(86_400)));
    }

    #[test]
    fn missing_field_falls_back_to_legacy_as_utc() {
        let got = resolve(&[], legacy());
        assert_eq!(got.source, TimeSource::Legacy);
        assert!(!got.malformed_extra);
        assert_eq!(
            got.instant,
            Utc.with_ymd_and_hms(2020, 2, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn modification_flag_unset_falls_back() {
        let extra = ut_record(0x02, &[1_000]);
        let got = resolve(&extra, legacy());
        assert_eq!(got.source, TimeSource::Legacy);
        assert!(!got.malformed_extra);
    }

    #[test]
    fn truncated_payload_is_malformed_and_falls_back() {
        // declares 5 bytes, carries 3
        let extra = vec![0x55, 0x54, 0x05, 0x00, 0x01, 0x10, 0x20];
        assert!(matches!(
            parse_extended_mtime(&extra),
            Err(ExtraFieldError::Truncated { .. })
        ));
        let got = resolve(&extra, legacy());
        assert_eq!(got.source, TimeSource::Legacy);
        assert!(got.malformed_extra);
    }

    #[test]
    fn flag_inconsistent_with_length_is_malformed() {
        let extra = vec![0x55, 0x54, 0x01, 0x00, 0x01];
        assert_eq!(
            parse_extended_mtime(&extra),
            Err(ExtraFieldError::MissingModification { len: 1 })
        );
    }

    #[test]
    fn nothing_usable_yields_epoch() {
        let got = resolve(&[0x00], None);
        assert_eq!(got.source, TimeSource::Unknown);
        assert_eq!(got.instant, DateTime::<Utc>::UNIX_EPOCH);
    }
}
