use mast_proto::GeoPoint;

use crate::geo::haversine_m;
use crate::mast::{MastRecord, MastSnapshot};

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub mast: MastRecord,
    pub distance_m: f64,
}

/// Masts strictly closer than `radius_m` to `point`, nearest first, at most `limit` of them.
pub fn find_closest(masts: &[MastRecord], point: GeoPoint, radius_m: f64, limit: usize) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = masts
        .iter()
        .filter_map(|m| {
            let d = haversine_m(point, m.position);
            (d < radius_m).then(|| Candidate { mast: m.clone(), distance_m: d })
        })
        .collect();
    out.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
    out.truncate(limit);
    out
}

impl MastSnapshot {
    pub fn find_closest(&self, point: GeoPoint, radius_m: f64, limit: usize) -> Vec<Candidate> {
        find_closest(self.masts(), point, radius_m, limit)
    }
}
