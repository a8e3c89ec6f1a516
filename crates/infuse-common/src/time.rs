//! GPS epoch time handling.
//!
//! Devices timestamp packets in seconds since the GPS epoch (1980-01-06),
//! which runs ahead of UTC by the accumulated leap seconds. The 48-bit
//! "epoch time" format additionally carries 1/65536 s fractional resolution.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the unix and GPS epochs.
pub const GPS_UNIX_OFFSET: u64 = 315_964_800;
/// Leap seconds accumulated since the GPS epoch.
pub const UNIX_LEAP_SECONDS: u64 = 18;

/// Where a device sourced its time knowledge from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeSource {
    None = 0,
    Gnss = 1,
    Ntp = 2,
    Rpc = 3,
}

impl TimeSource {
    /// Flag bit set when time was recovered from retained memory after a reboot.
    pub const RECOVERED: u8 = 0x80;

    pub fn from_u8(value: u8) -> Option<(Self, bool)> {
        let recovered = value & Self::RECOVERED != 0;
        let source = match value & !Self::RECOVERED {
            0 => Self::None,
            1 => Self::Gnss,
            2 => Self::Ntp,
            3 => Self::Rpc,
            _ => return None,
        };
        Some((source, recovered))
    }
}

pub fn unix_time_from_gps_seconds(gps_seconds: u32) -> u64 {
    u64::from(gps_seconds) + GPS_UNIX_OFFSET - UNIX_LEAP_SECONDS
}

pub fn gps_seconds_from_unix(unix_seconds: u64) -> u32 {
    (unix_seconds - GPS_UNIX_OFFSET + UNIX_LEAP_SECONDS) as u32
}

/// GPS seconds right now, from the wall clock.
pub fn gps_seconds_now() -> u32 {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    gps_seconds_from_unix(unix)
}

/// Convert the 48-bit device epoch format (GPS seconds * 65536 + fraction)
/// to fractional unix seconds.
pub fn unix_time_from_epoch(epoch_time: u64) -> f64 {
    let whole = epoch_time / 65536;
    let partial = epoch_time % 65536;
    unix_time_from_gps_seconds(whole as u32) as f64 + (partial as f64 / 65536.0)
}

/// Convert fractional unix seconds to the 48-bit device epoch format.
pub fn epoch_time_from_unix(unix_time: f64) -> u64 {
    let whole = unix_time as u64;
    let frac = unix_time - whole as f64;
    (u64::from(gps_seconds_from_unix(whole)) * 65536) + (frac * 65536.0) as u64
}

/// Day index used to bucket key derivation: packets from the same UTC day
/// converge on the same derived key.
pub fn key_time_index(gps_seconds: u32) -> u32 {
    gps_seconds / 86_400
}

/// Human-readable UTC timestamp for logs and tables, second resolution.
pub fn utc_time_string(unix_time: f64) -> String {
    chrono::DateTime::from_timestamp(unix_time as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{unix_time}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gps_conversion_round_trips() {
        let unix = 1_700_000_000u64;
        let gps = gps_seconds_from_unix(unix);
        assert_eq!(unix_time_from_gps_seconds(gps), unix);
    }

    #[test]
    fn gps_epoch_is_offset_by_leap_seconds() {
        // At the GPS epoch itself the GPS clock reads the leap second count.
        assert_eq!(gps_seconds_from_unix(GPS_UNIX_OFFSET), UNIX_LEAP_SECONDS as u32);
    }

    #[test]
    fn epoch_time_carries_fraction() {
        let unix = 1_700_000_000.5f64;
        let epoch = epoch_time_from_unix(unix);
        assert_eq!(epoch % 65536, 32768);
        let back = unix_time_from_epoch(epoch);
        assert!((back - unix).abs() < 1.0 / 65536.0);
    }

    #[test]
    fn same_day_same_bucket() {
        let noon = 1_400_000_000u32;
        assert_eq!(key_time_index(noon), key_time_index(noon + 3600));
        assert_ne!(key_time_index(noon), key_time_index(noon + 86_400));
    }

    #[test]
    fn utc_string_is_stable() {
        assert_eq!(utc_time_string(1_700_000_000.0), "2023-11-14 22:13:20");
    }

    #[test]
    fn recovered_time_source_flag() {
        let (source, recovered) = TimeSource::from_u8(0x81).unwrap();
        assert_eq!(source, TimeSource::Gnss);
        assert!(recovered);
        assert!(TimeSource::from_u8(0x7F).is_none());
    }
}
