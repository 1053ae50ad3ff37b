//! In-memory driver for tests, with failure injection.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Mutex;

use super::{ClientCapability, Connection, Driver, DriverState, ObjectKind};
use crate::catalog::{EnumEntry, PropertyInfo, PropertyMetadata};
use crate::mode::test_mode;
use crate::transaction::{AtomicRequest, CommitFlags, PropertyEntry};

/// A driver call to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    SetCapability(ClientCapability),
    ListObjects(ObjectKind),
    GetObject(ObjectKind, u32),
    GetProperties(ObjectKind, u32),
    GetPropertyMetadata(u32),
    CreateBlob,
    DestroyBlob(u32),
    Commit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommit {
    pub flags: CommitFlags,
    pub entries: Vec<PropertyEntry>,
    pub user_data: u64,
}

#[derive(Debug)]
struct FakeObject {
    kind: ObjectKind,
    id: u32,
    state: DriverState,
    properties: Vec<(u32, u64)>,
}

#[derive(Debug, Default)]
struct Inner {
    next_blob: u32,
    blobs: BTreeMap<u32, Vec<u8>>,
    destroyed: Vec<u32>,
    commits: Vec<RecordedCommit>,
    capabilities: Vec<(ClientCapability, bool)>,
    get_object_calls: HashMap<ObjectKind, usize>,
}

#[derive(Debug)]
pub struct FakeDriver {
    objects: Vec<FakeObject>,
    properties: Vec<(u32, PropertyInfo)>,
    failures: Mutex<HashSet<FailPoint>>,
    inner: Mutex<Inner>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            properties: Vec::new(),
            failures: Mutex::new(HashSet::new()),
            inner: Mutex::new(Inner {
                next_blob: 1,
                ..Default::default()
            }),
        }
    }

    /// One connector (10), one encoder (20), one CRTC (30) and one plane (40).
    pub fn reference() -> Self {
        let mut driver = Self::new();
        driver.add_connector(10, &["CRTC_ID"]);
        driver.add_encoder(20);
        driver.add_crtc(30, &["MODE_ID", "ACTIVE"]);
        driver.add_plane(40, &["FB_ID"]);
        driver
    }

    pub fn add_connector(&mut self, id: u32, props: &[&str]) {
        let state = DriverState::Connector {
            connection: Connection::Connected,
            modes: vec![
                test_mode(1920, 1080, 60, true),
                test_mode(1280, 720, 60, false),
            ],
            encoders: Vec::new(),
            current_encoder: None,
        };
        self.add_object(ObjectKind::Connector, id, state, props);
    }

    pub fn add_encoder(&mut self, id: u32) {
        let state = DriverState::Encoder {
            crtc: None,
            possible_crtcs: 0b1,
        };
        self.add_object(ObjectKind::Encoder, id, state, &[]);
    }

    pub fn add_crtc(&mut self, id: u32, props: &[&str]) {
        let state = DriverState::Crtc {
            mode: None,
            framebuffer: None,
        };
        self.add_object(ObjectKind::Crtc, id, state, props);
    }

    pub fn add_plane(&mut self, id: u32, props: &[&str]) {
        let state = DriverState::Plane {
            crtc: None,
            framebuffer: None,
            possible_crtcs: 0b1,
            formats: vec![u32::from_le_bytes(*b"XR24")],
        };
        self.add_object(ObjectKind::Plane, id, state, props);
    }

    fn add_object(&mut self, kind: ObjectKind, id: u32, state: DriverState, props: &[&str]) {
        let properties = props
            .iter()
            .map(|name| (self.register_property(name), 0))
            .collect();
        self.objects.push(FakeObject {
            kind,
            id,
            state,
            properties,
        });
    }

    /// Property ids are shared between objects, like in the kernel.
    fn register_property(&mut self, name: &str) -> u32 {
        if let Some((id, _)) = self.properties.iter().find(|(_, info)| info.name == name) {
            return *id;
        }

        let metadata = match name {
            "CRTC_ID" => PropertyMetadata::Object {
                kind: Some(ObjectKind::Crtc),
            },
            "FB_ID" => PropertyMetadata::Object { kind: None },
            "MODE_ID" => PropertyMetadata::Blob,
            "ACTIVE" => PropertyMetadata::Boolean,
            "type" => PropertyMetadata::Enum {
                entries: ["Overlay", "Primary", "Cursor"]
                    .into_iter()
                    .enumerate()
                    .map(|(value, name)| EnumEntry {
                        value: value as u64,
                        name: name.to_owned(),
                    })
                    .collect(),
            },
            _ => PropertyMetadata::UnsignedRange { min: 0, max: 1 },
        };

        let id = 1000 + self.properties.len() as u32;
        self.properties.push((
            id,
            PropertyInfo {
                name: name.to_owned(),
                metadata,
                mutable: true,
                atomic: false,
            },
        ));
        id
    }

    pub fn property_id(&self, name: &str) -> u32 {
        self.properties
            .iter()
            .find(|(_, info)| info.name == name)
            .map(|(id, _)| *id)
            .unwrap()
    }

    pub fn object_property_ids(&self, kind: ObjectKind, id: u32) -> Vec<u32> {
        self.object(kind, id)
            .unwrap()
            .properties
            .iter()
            .map(|(prop, _)| *prop)
            .collect()
    }

    pub fn fail_at(&self, point: FailPoint) {
        self.failures.lock().unwrap().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn live_blobs(&self) -> Vec<u32> {
        self.inner.lock().unwrap().blobs.keys().copied().collect()
    }

    pub fn blob_data(&self, blob: u32) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().blobs.get(&blob).cloned()
    }

    pub fn destroyed_blobs(&self) -> Vec<u32> {
        self.inner.lock().unwrap().destroyed.clone()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        self.inner.lock().unwrap().commits.clone()
    }

    pub fn capabilities(&self) -> Vec<(ClientCapability, bool)> {
        self.inner.lock().unwrap().capabilities.clone()
    }

    pub fn get_object_calls(&self, kind: ObjectKind) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get_object_calls
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    fn check(&self, point: FailPoint) -> io::Result<()> {
        if self.failures.lock().unwrap().contains(&point) {
            return Err(io::Error::other(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn object(&self, kind: ObjectKind, id: u32) -> io::Result<&FakeObject> {
        self.objects
            .iter()
            .find(|obj| obj.kind == kind && obj.id == id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

impl Driver for FakeDriver {
    fn set_client_capability(&self, cap: ClientCapability, enable: bool) -> io::Result<()> {
        self.check(FailPoint::SetCapability(cap))?;
        self.inner.lock().unwrap().capabilities.push((cap, enable));
        Ok(())
    }

    fn object_ids(&self, kind: ObjectKind) -> io::Result<Vec<u32>> {
        self.check(FailPoint::ListObjects(kind))?;
        Ok(self
            .objects
            .iter()
            .filter(|obj| obj.kind == kind)
            .map(|obj| obj.id)
            .collect())
    }

    fn get_object(&self, kind: ObjectKind, id: u32) -> io::Result<DriverState> {
        *self
            .inner
            .lock()
            .unwrap()
            .get_object_calls
            .entry(kind)
            .or_default() += 1;
        self.check(FailPoint::GetObject(kind, id))?;
        Ok(self.object(kind, id)?.state.clone())
    }

    fn get_properties(&self, kind: ObjectKind, id: u32) -> io::Result<Vec<(u32, u64)>> {
        self.check(FailPoint::GetProperties(kind, id))?;
        Ok(self.object(kind, id)?.properties.clone())
    }

    fn get_property_metadata(&self, property: u32) -> io::Result<PropertyInfo> {
        self.check(FailPoint::GetPropertyMetadata(property))?;
        self.properties
            .iter()
            .find(|(id, _)| *id == property)
            .map(|(_, info)| info.clone())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }

    fn create_blob(&self, data: &[u8]) -> io::Result<u32> {
        self.check(FailPoint::CreateBlob)?;
        let mut inner = self.inner.lock().unwrap();
        let blob = inner.next_blob;
        inner.next_blob += 1;
        inner.blobs.insert(blob, data.to_vec());
        Ok(blob)
    }

    fn destroy_blob(&self, blob: u32) -> io::Result<()> {
        self.check(FailPoint::DestroyBlob(blob))?;
        let mut inner = self.inner.lock().unwrap();
        if inner.blobs.remove(&blob).is_none() {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }
        inner.destroyed.push(blob);
        Ok(())
    }

    fn atomic_commit(
        &self,
        flags: CommitFlags,
        request: &AtomicRequest,
        user_data: u64,
    ) -> io::Result<()> {
        self.check(FailPoint::Commit)?;

        for entry in request.entries() {
            let known = self.objects.iter().any(|obj| {
                obj.id == entry.object
                    && obj.properties.iter().any(|(prop, _)| *prop == entry.property)
            });
            if !known {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
        }

        self.inner.lock().unwrap().commits.push(RecordedCommit {
            flags,
            entries: request.entries().to_vec(),
            user_data,
        });
        Ok(())
    }
}
