//! Core record types for the Bellrock beacon network
//!
//! Identifier types are fixed-size byte newtypes; records derive serde and
//! are persisted with postcard.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Persistent 8-byte device identifier, unique within one server.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub [u8; 8]);

impl Uid {
    /// Draw a fresh identifier from the system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", hex::encode(self.0))
    }
}

/// 16-byte anonymous token broadcast by a device: one AES-128 block of
/// `uid ‖ nonce` under the device key.
///
/// Successive tokens from the same device are unlinkable to anyone without
/// that key.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Aid(pub [u8; 16]);

impl Aid {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Aid({})", hex::encode(self.0))
    }
}

/// Per-device AES-128 key. Held only by the device and the server key store.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretKey([u8; 16]);

impl SecretKey {
    /// Draw a fresh key from the system CSPRNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Redacted so key material cannot leak through logs.
impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

// =============================================================================
// LOCATIONS
// =============================================================================

/// Quantization scale between degrees and the stored fixed-point grid.
const COARSE_SCALE: f64 = 1e4;

/// Latitude/longitude quantized to 1e-4 degrees (~10 m at street level).
///
/// The fixed-point representation keeps the type `Eq + Hash` so it can key
/// the co-location cache; accessors expose plain degrees.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CoarseLocation {
    lat_e4: i32,
    lon_e4: i32,
}

impl CoarseLocation {
    /// Project a precise position onto the coarse grid.
    pub fn from_degrees(lat: f64, lon: f64) -> Self {
        Self {
            lat_e4: (lat * COARSE_SCALE).round() as i32,
            lon_e4: (lon * COARSE_SCALE).round() as i32,
        }
    }

    pub fn lat(&self) -> f32 {
        (self.lat_e4 as f64 / COARSE_SCALE) as f32
    }

    pub fn lon(&self) -> f32 {
        (self.lon_e4 as f64 / COARSE_SCALE) as f32
    }
}

impl fmt::Debug for CoarseLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat(), self.lon())
    }
}

/// A time interval one user spent at one coarse location, tagged with the
/// serving cell tower.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLocation {
    /// Interval start, unix seconds. Invariant: `start_ts <= end_ts`.
    pub start_ts: u64,
    /// Interval end, unix seconds.
    pub end_ts: u64,
    /// Coarse position, derivable from `tower` when the tower is known.
    pub coarse: CoarseLocation,
    /// Serving cell at the time of the interval.
    pub tower: TowerKey,
}

impl UserLocation {
    /// Closed-interval intersection with `[s, e]`. Touching endpoints count.
    pub fn overlaps(&self, s: u64, e: u64) -> bool {
        self.start_ts <= e && self.end_ts >= s
    }
}

// =============================================================================
// CELL TOWER IDENTIFIER
// =============================================================================

const MCC_SHIFT: u64 = 54;
const MNC_SHIFT: u64 = 44;
const LAC_SHIFT: u64 = 28;

/// Packed 64-bit cell tower identifier.
///
/// Bit layout, most significant first: MCC(10) ‖ MNC(10) ‖ LAC(16) ‖ CID(28).
/// The layout is part of the persisted schema and must not change.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TowerKey(pub u64);

impl TowerKey {
    /// Pack the four fields, or `None` when a field exceeds its bit width.
    pub fn pack(mcc: u16, mnc: u16, lac: u16, cid: u32) -> Option<Self> {
        if mcc >= 1 << 10 || mnc >= 1 << 10 || cid >= 1 << 28 {
            return None;
        }
        Some(Self(
            (mcc as u64) << MCC_SHIFT
                | (mnc as u64) << MNC_SHIFT
                | (lac as u64) << LAC_SHIFT
                | cid as u64,
        ))
    }

    /// Mobile country code.
    pub fn mcc(&self) -> u16 {
        ((self.0 >> MCC_SHIFT) & 0x3ff) as u16
    }

    /// Mobile network code.
    pub fn mnc(&self) -> u16 {
        ((self.0 >> MNC_SHIFT) & 0x3ff) as u16
    }

    /// Location area code.
    pub fn lac(&self) -> u16 {
        ((self.0 >> LAC_SHIFT) & 0xffff) as u16
    }

    /// Cell identifier.
    pub fn cid(&self) -> u32 {
        (self.0 & 0x0fff_ffff) as u32
    }
}

impl fmt::Debug for TowerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TowerKey({}/{}/{}/{})",
            self.mcc(),
            self.mnc(),
            self.lac(),
            self.cid()
        )
    }
}

// =============================================================================
// OBSERVATIONS
// =============================================================================

/// A single sighting of an anonymous ID by a registered observer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    /// The device that heard the broadcast.
    pub observer: Uid,
    /// The token that was heard.
    pub aid: Aid,
    /// When it was heard, unix seconds.
    pub ts: u64,
    /// Precise observer latitude at the time of the sighting.
    pub lat: f64,
    /// Precise observer longitude.
    pub lon: f64,
    /// Optional place label supplied by the client.
    pub place: Option<String>,
    /// Back-filled once by the resolver; `None` until (and unless) resolved.
    pub resolved: Option<Uid>,
}

impl Observation {
    /// Coarse projection of the precise sighting position.
    pub fn coarse(&self) -> CoarseLocation {
        CoarseLocation::from_degrees(self.lat, self.lon)
    }
}

/// A chronologically ordered batch of observations from one observer, as
/// submitted by the client in one sync.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ObservationBatch {
    pub observer: Uid,
    pub observations: Vec<Observation>,
}

impl ObservationBatch {
    /// Inclusive time range spanned by the batch, `None` when empty.
    pub fn time_range(&self) -> Option<(u64, u64)> {
        let first = self.observations.first()?.ts;
        let last = self.observations.last()?.ts;
        Some((first.min(last), first.max(last)))
    }
}
