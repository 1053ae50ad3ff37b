//! Boundary with the kernel mode-setting driver.
//!
//! Everything the catalog, the session and the transaction builder need from the kernel goes
//! through the [`Driver`] trait. [`Card`] implements it on top of an open DRM node; tests use
//! an in-memory fake.

mod card;
#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::io;

use serde::Serialize;

pub use card::Card;

use crate::catalog::PropertyInfo;
use crate::mode::ModeInfo;
use crate::transaction::{AtomicRequest, CommitFlags};

/// The four kinds of mode-setting objects. Ids are unique within a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Connector,
    Encoder,
    Crtc,
    Plane,
}

impl ObjectKind {
    /// In acquisition order. Release happens in reverse.
    pub const ALL: [ObjectKind; 4] = [Self::Connector, Self::Encoder, Self::Crtc, Self::Plane];

    /// Whether objects of this kind expose properties.
    pub fn has_properties(self) -> bool {
        !matches!(self, Self::Encoder)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connector => "connector",
            Self::Encoder => "encoder",
            Self::Crtc => "CRTC",
            Self::Plane => "plane",
        })
    }
}

/// Client capabilities requested when a device is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientCapability {
    /// Expose primary and cursor planes alongside overlays.
    UniversalPlanes,
    /// Enable the atomic mode-setting API.
    Atomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Connection {
    Connected,
    Disconnected,
    Unknown,
}

/// Raw capability data the driver reports for an object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DriverState {
    Connector {
        connection: Connection,
        modes: Vec<ModeInfo>,
        encoders: Vec<u32>,
        current_encoder: Option<u32>,
    },
    Encoder {
        crtc: Option<u32>,
        /// Bit `i` is set if the encoder can be driven by the `i`-th CRTC of the device.
        possible_crtcs: u32,
    },
    Crtc {
        mode: Option<ModeInfo>,
        framebuffer: Option<u32>,
    },
    Plane {
        crtc: Option<u32>,
        framebuffer: Option<u32>,
        possible_crtcs: u32,
        formats: Vec<u32>,
    },
}

impl DriverState {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::Connector { .. } => ObjectKind::Connector,
            Self::Encoder { .. } => ObjectKind::Encoder,
            Self::Crtc { .. } => ObjectKind::Crtc,
            Self::Plane { .. } => ObjectKind::Plane,
        }
    }
}

/// Operations the mode-setting core requires from the kernel driver.
///
/// Every call may block on the kernel. Nothing here is retried: failures are handed back to
/// the caller as they are.
pub trait Driver {
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()>;

    /// Ids of every object of `kind`, in driver order.
    fn object_ids(&self, kind: ObjectKind) -> io::Result<Vec<u32>>;

    fn get_object(&self, kind: ObjectKind, id: u32) -> io::Result<DriverState>;

    /// The `(property id, current value)` pairs attached to an object.
    fn get_properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<(u32, u64)>>;

    fn get_property_metadata(&self, property: u32) -> io::Result<PropertyInfo>;

    /// Stores `data` in a driver-side blob and returns the blob id.
    fn create_blob(&self, data: &[u8]) -> io::Result<u32>;

    fn destroy_blob(&self, blob: u32) -> io::Result<()>;

    /// Applies every property in `request`, or none of them.
    ///
    /// `user_data` is attached to the completion event the driver sends when `flags` asks
    /// for one.
    fn atomic_commit(
        &self,
        flags: CommitFlags,
        request: &AtomicRequest,
        user_data: u64,
    ) -> io::Result<()>;
}

impl<D: Driver + ?Sized> Driver for &D {
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        (**self).set_client_capability(cap, enable)
    }

    fn object_ids(&self, kind: ObjectKind) -> io::Result<Vec<u32>> {
        (**self).object_ids(kind)
    }

    fn get_object(&self, kind: ObjectKind, id: u32) -> io::Result<DriverState> {
        (**self).get_object(kind, id)
    }

    fn get_properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<(u32, u64)>> {
        (**self).get_properties(kind, id)
    }

    fn get_property_metadata(&self, property: u32) -> io::Result<PropertyInfo> {
        (**self).get_property_metadata(property)
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        (**self).create_blob(data)
    }

    fn destroy_blob(&self, blob: u32) -> io::Result<()> {
        (**self).destroy_blob(blob)
    }

    fn atomic_commit(
        &self,
        flags: CommitFlags,
        request: &AtomicRequest,
        user_data: u64,
    ) -> io::Result<()> {
        (**self).atomic_commit(flags, request, user_data)
    }
}
