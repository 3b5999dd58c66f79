use anyhow::Result;
use mast_proto::GeoPoint;

use crate::mast::MastSnapshot;

pub fn check_entry_point(entry: GeoPoint) -> Result<()> {
    anyhow::ensure!(entry.is_valid(), "entry point coordinates invalid: lat={} lon={}", entry.lat, entry.lon);
    Ok(())
}

pub fn check_search(radius_m: f64, limit: usize) -> Result<()> {
    anyhow::ensure!(radius_m >= 50.0, "masts.radius_m too small");
    anyhow::ensure!(radius_m <= 50_000.0, "masts.radius_m too large for a single battery");
    anyhow::ensure!(limit >= 1, "masts.limit must be >= 1");
    Ok(())
}

pub fn check_snapshot(snap: &MastSnapshot) -> Result<()> {
    anyhow::ensure!(!snap.is_empty(), "mast snapshot has no usable records");
    Ok(())
}
