use chrono::{DateTime, Utc};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const FRACTION_SCALE: f64 = 4_294_967_296.0;

/// Generates an NTP64 timestamp for the current instant.
///
/// Seconds and fraction are derived from a single wall-clock read, so the two
/// halves can never straddle a second boundary.
///
/// ```
/// use twamp_suite::time::{now_ntp, NTP_UNIX_OFFSET};
/// let ts = now_ntp();
/// assert!((ts >> 32) as i64 > NTP_UNIX_OFFSET);
/// ```
pub fn now_ntp() -> u64 {
    datetime_to_ntp(Utc::now())
}

/// Converts a UTC instant into the 64-bit NTP fixed-point format.
pub fn datetime_to_ntp(date: DateTime<Utc>) -> u64 {
    let secs = (date.timestamp() + NTP_UNIX_OFFSET) as u32;
    let fraction = ((date.timestamp_subsec_nanos() as u64) << 32) / 1_000_000_000;

    ((secs as u64) << 32) | fraction
}

/// Converts an NTP64 timestamp back to a UTC instant.
///
/// The fraction is truncated to whole nanoseconds. Returns `None` for values
/// chrono cannot represent.
pub fn ntp_to_datetime(ntp: u64) -> Option<DateTime<Utc>> {
    let secs = (ntp >> 32) as i64 - NTP_UNIX_OFFSET;
    let nanos = (((ntp & 0xFFFF_FFFF) * 1_000_000_000) >> 32) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
}

/// Converts an NTP64 timestamp to fractional Unix seconds, for diagnostics.
pub fn ntp_to_unix_seconds(ntp: u64) -> f64 {
    let secs = (ntp >> 32) as i64 - NTP_UNIX_OFFSET;
    let fraction = (ntp & 0xFFFF_FFFF) as f64 / FRACTION_SCALE;
    secs as f64 + fraction
}

/// Signed difference `later - earlier` between two NTP64 timestamps, in nanoseconds.
pub fn ntp_diff_nanos(later: u64, earlier: u64) -> i64 {
    let delta = later.wrapping_sub(earlier) as i64 as i128;
    ((delta * 1_000_000_000) >> 32) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datetime_to_ntp_test() {
        const TEST_CASES: &[(i64, u32)] = &[(1_525_987, 0), (0, 0), (2_584_229, 151_000_000)];

        for &(secs, nanos) in TEST_CASES {
            let sample = DateTime::<Utc>::from_timestamp(secs, nanos).expect("Invalid timestamp");
            let test_val = datetime_to_ntp(sample);

            let expected_secs = secs + NTP_UNIX_OFFSET;
            let actual_secs = (test_val >> 32) as i64;
            assert_eq!(actual_secs, expected_secs, "Mismatch in seconds field");

            let ntp_frac = test_val as u32;
            let actual_nanos = ((ntp_frac as u64) * 1_000_000_000 / (1u64 << 32)) as u32;
            assert!(
                (nanos as i64 - actual_nanos as i64).abs() <= 1,
                "Mismatch in fractional nanos: expected {}, got {}",
                nanos,
                actual_nanos
            );
        }
    }

    #[test]
    fn half_second_is_half_fraction() {
        let sample = DateTime::<Utc>::from_timestamp(10, 500_000_000).unwrap();
        assert_eq!(datetime_to_ntp(sample) as u32, 0x8000_0000);
    }

    #[test]
    fn ntp_to_datetime_roundtrip_within_a_tick() {
        let sample = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let back = ntp_to_datetime(datetime_to_ntp(sample)).unwrap();

        assert_eq!(back.timestamp(), sample.timestamp());
        let drift = sample.timestamp_subsec_nanos() as i64 - back.timestamp_subsec_nanos() as i64;
        assert!((0..=1).contains(&drift), "drift of {} ns", drift);
    }

    #[test]
    fn now_roundtrips_through_unix_seconds() {
        let before = Utc::now();
        let ts = now_ntp();
        let after = Utc::now();

        let unix = ntp_to_unix_seconds(ts);
        let lo = before.timestamp() as f64 + before.timestamp_subsec_nanos() as f64 / 1e9;
        let hi = after.timestamp() as f64 + after.timestamp_subsec_nanos() as f64 / 1e9;
        assert!(unix >= lo - 1e-6 && unix <= hi + 1e-6);
    }

    #[test]
    fn unix_epoch_maps_to_offset() {
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let ts = datetime_to_ntp(epoch);
        assert_eq!(ts >> 32, NTP_UNIX_OFFSET as u64);
        assert_eq!(ntp_to_unix_seconds(ts), 0.0);
    }

    #[test]
    fn diff_nanos_signed() {
        let a = DateTime::<Utc>::from_timestamp(100, 0).unwrap();
        let b = DateTime::<Utc>::from_timestamp(100, 250_000_000).unwrap();
        let d = ntp_diff_nanos(datetime_to_ntp(b), datetime_to_ntp(a));
        assert!((d - 250_000_000).abs() <= 1);
        assert!((ntp_diff_nanos(datetime_to_ntp(a), datetime_to_ntp(b)) + 250_000_000).abs() <= 1);
    }
}
