//! [`Driver`] on top of an open DRM node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::Path;

use smithay::reexports::drm::control::{
    self, connector, crtc, encoder, plane, property, Device as ControlDevice, ResourceHandle,
};
use smithay::reexports::drm::{self, Device};
use tracing::trace;

use super::{ClientCapability, Connection, Driver, DriverState, ObjectKind};
use crate::catalog::{EnumEntry, PropertyInfo, PropertyMetadata};
use crate::mode::ModeInfo;
use crate::transaction::{AtomicRequest, CommitFlags};

/// An open `/dev/dri/card*` node.
#[derive(Debug)]
pub struct Card(File);

impl Card {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self(file))
    }
}

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// The catalog is a one-time snapshot, so connectors are probed when fetched. Without a probe
/// the kernel hands back whatever it cached, which is empty for a connector nobody probed yet.
const PROBE_CONNECTORS: bool = true;

impl Device for Card {}
impl ControlDevice for Card {}

fn handle<H: ResourceHandle>(id: u32) -> io::Result<H> {
    control::from_u32(id).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
}

fn ids<H: ResourceHandle>(handles: &[H]) -> Vec<u32> {
    handles.iter().map(|&h| h.into()).collect()
}

/// Bit `i` set for every `i`-th CRTC of the device accepted by `filter`.
fn crtc_mask(card: &Card, filter: control::CrtcListFilter) -> io::Result<u32> {
    let res = card.resource_handles()?;
    let accepted = res.filter_crtcs(filter);

    let mut mask = 0;
    for (i, crtc) in res.crtcs().iter().enumerate().take(32) {
        if accepted.contains(crtc) {
            mask |= 1 << i;
        }
    }
    Ok(mask)
}

impl From<control::Mode> for ModeInfo {
    fn from(mode: control::Mode) -> Self {
        let raw = drm_ffi::drm_mode_modeinfo::from(mode);
        Self {
            clock: raw.clock,
            hdisplay: raw.hdisplay,
            hsync_start: raw.hsync_start,
            hsync_end: raw.hsync_end,
            htotal: raw.htotal,
            hskew: raw.hskew,
            vdisplay: raw.vdisplay,
            vsync_start: raw.vsync_start,
            vsync_end: raw.vsync_end,
            vtotal: raw.vtotal,
            vscan: raw.vscan,
            vrefresh: raw.vrefresh,
            flags: raw.flags,
            type_: raw.type_,
            name: raw.name.map(|c| c as u8),
        }
    }
}

fn property_info(info: &property::Info) -> PropertyInfo {
    use property::ValueType;

    let metadata = match info.value_type() {
        ValueType::Unknown => PropertyMetadata::Unknown,
        ValueType::Boolean => PropertyMetadata::Boolean,
        ValueType::UnsignedRange(min, max) => PropertyMetadata::UnsignedRange { min, max },
        ValueType::SignedRange(min, max) => PropertyMetadata::SignedRange { min, max },
        ValueType::Enum(values) => {
            let (_, entries) = values.values();
            PropertyMetadata::Enum {
                entries: entries
                    .iter()
                    .map(|entry| EnumEntry {
                        value: entry.value(),
                        name: entry.name().to_string_lossy().into_owned(),
                    })
                    .collect(),
            }
        }
        ValueType::Bitmask => PropertyMetadata::Bitmask,
        ValueType::Blob => PropertyMetadata::Blob,
        ValueType::Connector => PropertyMetadata::Object {
            kind: Some(ObjectKind::Connector),
        },
        ValueType::Encoder => PropertyMetadata::Object {
            kind: Some(ObjectKind::Encoder),
        },
        ValueType::CRTC => PropertyMetadata::Object {
            kind: Some(ObjectKind::Crtc),
        },
        ValueType::Plane => PropertyMetadata::Object {
            kind: Some(ObjectKind::Plane),
        },
        ValueType::Object | ValueType::Framebuffer | ValueType::Property => {
            PropertyMetadata::Object { kind: None }
        }
    };

    PropertyInfo {
        name: info.name().to_string_lossy().into_owned(),
        metadata,
        mutable: info.mutable(),
        atomic: info.atomic(),
    }
}

// drm_mode_atomic from the kernel uapi. The drm crate's commit wrapper has no way to pass
// user_data, so the ioctl is issued directly.
#[repr(C)]
struct drm_mode_atomic {
    flags: u32,
    count_objs: u32,
    objs_ptr: u64,
    count_props_ptr: u64,
    props_ptr: u64,
    prop_values_ptr: u64,
    reserved: u64,
    user_data: u64,
}

const fn drm_iowr<T>(nr: u32) -> u32 {
    const IOC_READ_WRITE: u32 = 3;
    (IOC_READ_WRITE << 30) | ((size_of::<T>() as u32) << 16) | ((b'd' as u32) << 8) | nr
}

const DRM_IOCTL_MODE_ATOMIC: u32 = drm_iowr::<drm_mode_atomic>(0xbc);

fn ioctl<T>(fd: BorrowedFd<'_>, request: u32, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: arg is a live, exclusively borrowed uapi struct of the size encoded in
        // request.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, arg as *mut T) };
        if ret != -1 {
            return Ok(());
        }

        let err = io::Error::last_os_error();
        if !matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN)) {
            return Err(err);
        }
    }
}

impl Driver for Card {
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        let cap = match cap {
            ClientCapability::UniversalPlanes => drm::ClientCapability::UniversalPlanes,
            ClientCapability::Atomic => drm::ClientCapability::Atomic,
        };
        Device::set_client_capability(self, cap, enable)
    }

    fn object_ids(&self, kind: ObjectKind) -> io::Result<Vec<u32>> {
        let ids = match kind {
            ObjectKind::Connector => ids(self.resource_handles()?.connectors()),
            ObjectKind::Encoder => ids(self.resource_handles()?.encoders()),
            ObjectKind::Crtc => ids(self.resource_handles()?.crtcs()),
            ObjectKind::Plane => ids(&self.plane_handles()?),
        };
        Ok(ids)
    }

    fn get_object(&self, kind: ObjectKind, id: u32) -> io::Result<DriverState> {
        let state = match kind {
            ObjectKind::Connector => {
                let conn = handle::<connector::Handle>(id)?;
                let info = self.get_connector(conn, PROBE_CONNECTORS)?;
                let connection = match info.state() {
                    connector::State::Connected => Connection::Connected,
                    connector::State::Disconnected => Connection::Disconnected,
                    connector::State::Unknown => Connection::Unknown,
                };
                DriverState::Connector {
                    connection,
                    modes: info.modes().iter().map(|&m| ModeInfo::from(m)).collect(),
                    encoders: ids(info.encoders()),
                    current_encoder: info.current_encoder().map(u32::from),
                }
            }
            ObjectKind::Encoder => {
                let info = self.get_encoder(handle::<encoder::Handle>(id)?)?;
                DriverState::Encoder {
                    crtc: info.crtc().map(u32::from),
                    possible_crtcs: crtc_mask(self, info.possible_crtcs())?,
                }
            }
            ObjectKind::Crtc => {
                let info = self.get_crtc(handle::<crtc::Handle>(id)?)?;
                DriverState::Crtc {
                    mode: info.mode().map(ModeInfo::from),
                    framebuffer: info.framebuffer().map(u32::from),
                }
            }
            ObjectKind::Plane => {
                let info = self.get_plane(handle::<plane::Handle>(id)?)?;
                DriverState::Plane {
                    crtc: info.crtc().map(u32::from),
                    framebuffer: info.framebuffer().map(u32::from),
                    possible_crtcs: crtc_mask(self, info.possible_crtcs())?,
                    formats: info.formats().to_vec(),
                }
            }
        };
        Ok(state)
    }

    fn get_properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<(u32, u64)>> {
        let props = match kind {
            ObjectKind::Connector => {
                ControlDevice::get_properties(self, handle::<connector::Handle>(id)?)?
            }
            ObjectKind::Crtc => ControlDevice::get_properties(self, handle::<crtc::Handle>(id)?)?,
            ObjectKind::Plane => {
                ControlDevice::get_properties(self, handle::<plane::Handle>(id)?)?
            }
            // Encoders carry no properties.
            ObjectKind::Encoder => return Ok(Vec::new()),
        };

        Ok(props
            .into_iter()
            .map(|(prop, value)| (u32::from(prop), value))
            .collect())
    }

    fn get_property_metadata(&self, prop: u32) -> io::Result<PropertyInfo> {
        let info = self.get_property(handle::<property::Handle>(prop)?)?;
        Ok(property_info(&info))
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        let mut data = data.to_vec();
        let blob = drm_ffi::mode::create_property_blob(self.as_fd(), &mut data)?;
        Ok(blob.blob_id)
    }

    fn destroy_blob(&self, blob: u32) -> io::Result<()> {
        self.destroy_property_blob(u64::from(blob))
    }

    fn atomic_commit(
        &self,
        flags: CommitFlags,
        request: &AtomicRequest,
        user_data: u64,
    ) -> io::Result<()> {
        let req = request.grouped();
        if req.objects.is_empty() {
            trace!("skipping empty atomic commit");
            return Ok(());
        }

        let mut raw = drm_mode_atomic {
            flags: flags.bits(),
            count_objs: req.objects.len() as u32,
            objs_ptr: req.objects.as_ptr() as u64,
            count_props_ptr: req.counts.as_ptr() as u64,
            props_ptr: req.properties.as_ptr() as u64,
            prop_values_ptr: req.values.as_ptr() as u64,
            reserved: 0,
            user_data,
        };
        ioctl(self.as_fd(), DRM_IOCTL_MODE_ATOMIC, &mut raw)
    }
}
