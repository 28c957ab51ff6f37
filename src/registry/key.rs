//! Session identity types
//!
//! A session is identified by the camera it reads from and the delivery
//! variant it produces.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Numeric camera identifier, as stored by the record store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for CameraId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(CameraId)
    }
}

impl From<u32> for CameraId {
    fn from(id: u32) -> Self {
        CameraId(id)
    }
}

/// Delivery format produced by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// Rolling segment files plus an index, served as plain files
    Segmented,
    /// Continuous byte stream pushed to open sockets
    #[serde(alias = "live")]
    LiveSocket,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Segmented => "segmented",
            Variant::LiveSocket => "live-socket",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "segmented" => Ok(Variant::Segmented),
            "live-socket" | "live" => Ok(Variant::LiveSocket),
            other => Err(format!("unknown variant: {}", other)),
        }
    }
}

/// Unique identifier for a session (camera + variant)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub camera: CameraId,
    pub variant: Variant,
}

impl SessionKey {
    pub fn new(camera: impl Into<CameraId>, variant: Variant) -> Self {
        Self {
            camera: camera.into(),
            variant,
        }
    }

    /// Key of the live-socket session for a camera
    pub fn live(camera: impl Into<CameraId>) -> Self {
        Self::new(camera, Variant::LiveSocket)
    }

    /// Key of the segmented session for a camera
    pub fn segmented(camera: impl Into<CameraId>) -> Self {
        Self::new(camera, Variant::Segmented)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.camera, self.variant)
    }
}
