use anyhow::{Context, Result};
use mast_proto::GeoPoint;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

/// `{id, navn}` pair used by the mast database for service and technology types.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NamedCode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub navn: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MastRecord {
    pub station_id: String,
    pub position: GeoPoint,
    pub service: Option<NamedCode>,
    pub technology: Option<NamedCode>,
    pub street: Option<String>,
    pub house_no: Option<String>,
    pub postcode: Option<String>,
    pub municipality: Option<String>,
    pub commissioned: Option<String>,
    pub radius_m: Option<f64>,
    pub frequency_band: Option<String>,
}

// Wire shape of one entry in the snapshot (Danish field names, numbers as strings).
#[derive(Debug, Deserialize)]
struct RawMast {
    #[serde(default)]
    unik_station_navn: Option<String>,
    #[serde(default)]
    wgs84koordinat: Option<RawWgs84>,
    #[serde(default)]
    tjenesteart: Option<NamedCode>,
    #[serde(default)]
    teknologi: Option<NamedCode>,
    #[serde(default)]
    vejnavn: Option<RawStreet>,
    #[serde(default)]
    husnr: Option<String>,
    #[serde(default)]
    postnummer: Option<RawPostcode>,
    #[serde(default)]
    kommune: Option<RawMunicipality>,
    #[serde(default)]
    idriftsaettelsesdato: Option<String>,
    #[serde(default)]
    radius_i_meter: Option<String>,
    #[serde(default)]
    frekvensbaand: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawWgs84 {
    bredde: Option<String>,
    laengde: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStreet {
    navn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPostcode {
    nr: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMunicipality {
    kode: Option<String>,
}

impl RawMast {
    fn into_record(self) -> Option<MastRecord> {
        let coord = self.wgs84koordinat?;
        let lat: f64 = coord.bredde?.trim().parse().ok()?;
        let lon: f64 = coord.laengde?.trim().parse().ok()?;
        let position = GeoPoint::new(lat, lon);
        if !position.is_valid() {
            return None;
        }
        Some(MastRecord {
            station_id: self.unik_station_navn.unwrap_or_default(),
            position,
            service: self.tjenesteart,
            technology: self.teknologi,
            street: self.vejnavn.and_then(|v| v.navn),
            house_no: self.husnr,
            postcode: self.postnummer.and_then(|p| p.nr),
            municipality: self.kommune.and_then(|k| k.kode),
            commissioned: self.idriftsaettelsesdato,
            radius_m: self.radius_i_meter.and_then(|r| r.trim().parse().ok()),
            frequency_band: self.frekvensbaand,
        })
    }
}

/// Immutable set of masts loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct MastSnapshot {
    masts: Vec<MastRecord>,
    skipped: usize,
}

impl MastSnapshot {
    pub fn from_records(masts: Vec<MastRecord>) -> Self {
        Self { masts, skipped: 0 }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read mast snapshot {}", path.display()))?;
        let snap = Self::from_json_str(&s)
            .with_context(|| format!("parse mast snapshot {}", path.display()))?;
        info!("masts: loaded {} records from {} ({} skipped)", snap.masts.len(), path.display(), snap.skipped);
        Ok(snap)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let raw: Vec<RawMast> = serde_json::from_str(s).context("expected a JSON array of mast records")?;
        let mut masts = Vec::with_capacity(raw.len());
        let mut skipped = 0;
        for (i, r) in raw.into_iter().enumerate() {
            let name = r.unik_station_navn.clone().unwrap_or_default();
            match r.into_record() {
                Some(m) => masts.push(m),
                None => {
                    warn!("masts: skipping record #{} ({}): missing or invalid wgs84 coordinates", i, name);
                    skipped += 1;
                }
            }
        }
        Ok(Self { masts, skipped })
    }

    pub fn masts(&self) -> &[MastRecord] {
        &self.masts
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.masts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.masts.is_empty()
    }
}
