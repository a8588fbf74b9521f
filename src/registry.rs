//! Device enumeration and the single-open handle registry.
use std::ffi::CString;

use hidapi::{HidApi, HidDevice};
use pcsc::{Card, Context, Protocols, Scope, ShareMode};
use serde::Serialize;

use crate::error::{AgentError, Result};

/// Feitian Technologies vendor ID.
pub const FEITIAN_VID: u16 = 0x096e;

/// Product ids with known marketing names. Unknown products within the
/// vendor are still listed.
const KNOWN_PRODUCTS: &[(u16, &str)] = &[
    (0x0850, "ePass FIDO"),
    (0x0852, "ePass FIDO-NFC"),
    (0x0853, "BioPass FIDO2"),
    (0x0854, "BioPass FIDO2 Plus"),
    (0x0856, "ePass FIDO2-NFC"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum DeviceType {
    Hid,
    Ccid,
}

/// A device descriptor, produced on demand from OS enumeration. Identity is
/// stable across list calls as long as the underlying OS handle stays put;
/// reinsertion produces a new id.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub id: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_type: DeviceType,
    pub manufacturer: Option<String>,
    pub product_name: Option<String>,
    pub serial_number: Option<String>,
    pub path: String,
}

/// An open transport handle. At most one exists per process.
pub enum OpenHandle {
    Hid(HidDevice),
    Ccid(Card),
}

/// The single open-handle slot. The "at most one open" invariant is carried
/// by the type: an `Option`, not a map.
pub struct SingleOpen<T> {
    slot: Option<(String, T)>,
}

impl<T> SingleOpen<T> {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Opens `id` using `connect`, enforcing the slot discipline: re-opening
    /// the held id is an idempotent no-op, a different id fails with `BUSY`,
    /// and a failed connect leaves the slot empty.
    pub fn open_with(&mut self, id: &str, connect: impl FnOnce() -> Result<T>) -> Result<()> {
        if let Some((open_id, _)) = &self.slot {
            if open_id == id {
                debug!("device {id} already open");
                return Ok(());
            }
            return Err(AgentError::Busy {
                open: open_id.clone(),
                requested: id.to_string(),
            });
        }
        let handle = connect()?;
        self.slot = Some((id.to_string(), handle));
        Ok(())
    }

    /// Takes the handle out of the slot; `NOT_OPEN` when `id` is not the
    /// held id. State is unchanged on error.
    pub fn close(&mut self, id: &str) -> Result<T> {
        match &self.slot {
            Some((open_id, _)) if open_id == id => {
                let (_, handle) = self.slot.take().expect("open handle");
                Ok(handle)
            }
            _ => Err(AgentError::NotOpen(id.to_string())),
        }
    }

    /// Borrows the held handle for `id`.
    pub fn get(&self, id: &str) -> Result<&T> {
        match &self.slot {
            Some((open_id, handle)) if open_id == id => Ok(handle),
            _ => Err(AgentError::NotOpen(id.to_string())),
        }
    }

    /// Borrows the held handle regardless of id.
    pub fn current(&self) -> Option<&(String, T)> {
        self.slot.as_ref()
    }

    pub fn take(&mut self) -> Option<(String, T)> {
        self.slot.take()
    }
}

/// Owns enumeration backends and the single open-handle slot.
pub struct DeviceRegistry {
    hid_api: HidApi,
    pcsc_ctx: Context,
    open: SingleOpen<OpenHandle>,
}

impl DeviceRegistry {
    /// Acquires the HID API and PC/SC context for the life of the process.
    pub fn new() -> Result<Self> {
        let hid_api = HidApi::new()?;
        let pcsc_ctx = Context::establish(Scope::User)?;
        Ok(Self {
            hid_api,
            pcsc_ctx,
            open: SingleOpen::new(),
        })
    }

    /// Enumerates attached Feitian devices over both transports.
    pub fn list(&mut self) -> Result<Vec<Device>> {
        let mut devices = self.enumerate_hid()?;
        devices.extend(self.enumerate_ccid());
        info!("enumerated {} device(s)", devices.len());
        Ok(devices)
    }

    fn enumerate_hid(&mut self) -> Result<Vec<Device>> {
        self.hid_api.refresh_devices()?;

        let mut infos: Vec<_> = self
            .hid_api
            .device_list()
            .filter(|d| d.vendor_id() == FEITIAN_VID)
            .filter(|d| {
                // Skip obvious keyboard/mouse interfaces; keep everything
                // else, including unknown usage pages.
                !(d.usage_page() == 0x01 && (d.usage() == 0x02 || d.usage() == 0x06))
            })
            .collect();
        infos.sort_by(|a, b| a.path().cmp(b.path()));

        Ok(infos
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let product_name = d
                    .product_string()
                    .map(str::to_string)
                    .or_else(|| known_product_name(d.product_id()));
                let device = Device {
                    id: format!("hid_{}", i + 1),
                    vendor_id: d.vendor_id(),
                    product_id: d.product_id(),
                    device_type: DeviceType::Hid,
                    manufacturer: d.manufacturer_string().map(str::to_string),
                    product_name,
                    serial_number: d.serial_number().map(str::to_string),
                    path: d.path().to_string_lossy().into_owned(),
                };
                debug!(
                    "HID {}: VID {:04x} PID {:04x} usage {:04x}:{:04x} at {}",
                    device.id,
                    device.vendor_id,
                    device.product_id,
                    d.usage_page(),
                    d.usage(),
                    device.path
                );
                device
            })
            .collect())
    }

    fn enumerate_ccid(&self) -> Vec<Device> {
        // A machine without a running PC/SC service still has working HID
        // enumeration, so CCID failures degrade to an empty list.
        let readers = match self.pcsc_ctx.list_readers_owned() {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to list PC/SC readers: {e}");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = readers
            .iter()
            .map(|r| r.to_string_lossy().into_owned())
            .filter(|name| {
                let n = name.to_lowercase();
                n.contains("feitian") || n.contains("epass") || n.contains("biopass")
            })
            .collect();
        names.sort();

        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                debug!("CCID reader: {name}");
                Device {
                    id: format!("ccid_{}", i + 1),
                    vendor_id: FEITIAN_VID,
                    product_id: 0,
                    device_type: DeviceType::Ccid,
                    manufacturer: Some("Feitian Technologies".to_string()),
                    product_name: Some(name.clone()),
                    serial_number: None,
                    path: name,
                }
            })
            .collect()
    }

    /// Opens the transport for `device_id`. Re-opening the already-open id
    /// succeeds idempotently; any other id while one is open fails with
    /// `BUSY` (before the id is even resolved). A failed open leaves no
    /// handle registered.
    pub fn open(&mut self, device_id: &str) -> Result<()> {
        if let Some((open_id, _)) = self.open.current() {
            if open_id == device_id {
                debug!("device {device_id} already open");
                return Ok(());
            }
            return Err(AgentError::Busy {
                open: open_id.clone(),
                requested: device_id.to_string(),
            });
        }

        let device = self
            .list()?
            .into_iter()
            .find(|d| d.id == device_id)
            .ok_or_else(|| AgentError::NotFound(device_id.to_string()))?;

        let hid_api = &self.hid_api;
        let pcsc_ctx = &self.pcsc_ctx;
        self.open.open_with(device_id, || {
            info!("opening {} ({:?})", device.id, device.device_type);
            match device.device_type {
                DeviceType::Hid => {
                    let path = CString::new(device.path.as_bytes())
                        .map_err(|_| AgentError::NotFound(device_id.to_string()))?;
                    // Open by path first; it stays correct when a product
                    // exposes several interfaces. VID/PID is the fallback.
                    let dev = match hid_api.open_path(&path) {
                        Ok(dev) => dev,
                        Err(e) => {
                            debug!("open by path failed ({e}), trying VID/PID");
                            hid_api.open(device.vendor_id, device.product_id)?
                        }
                    };
                    Ok(OpenHandle::Hid(dev))
                }
                DeviceType::Ccid => {
                    let reader = CString::new(device.path.as_bytes())
                        .map_err(|_| AgentError::NotFound(device_id.to_string()))?;
                    let card = pcsc_ctx.connect(&reader, ShareMode::Shared, Protocols::ANY)?;
                    Ok(OpenHandle::Ccid(card))
                }
            }
        })?;
        info!("opened {device_id}");
        Ok(())
    }

    /// Releases the open handle. Closing a non-open id returns `NOT_OPEN`
    /// and does not alter state.
    pub fn close(&mut self, device_id: &str) -> Result<()> {
        let handle = self.open.close(device_id)?;
        release(handle);
        info!("closed {device_id}");
        Ok(())
    }

    /// Runs `f` against the open HID handle for `device_id`.
    pub fn with_hid<R>(
        &self,
        device_id: &str,
        f: impl FnOnce(&HidDevice) -> Result<R>,
    ) -> Result<R> {
        match self.open.get(device_id)? {
            OpenHandle::Hid(dev) => f(dev),
            OpenHandle::Ccid(_) => Err(AgentError::DeviceTypeMismatch {
                id: device_id.to_string(),
                expected: "HID",
            }),
        }
    }

    /// Runs `f` against the open card for `device_id`.
    pub fn with_card<R>(&self, device_id: &str, f: impl FnOnce(&Card) -> Result<R>) -> Result<R> {
        match self.open.get(device_id)? {
            OpenHandle::Ccid(card) => f(card),
            OpenHandle::Hid(_) => Err(AgentError::DeviceTypeMismatch {
                id: device_id.to_string(),
                expected: "CCID",
            }),
        }
    }

    /// The transport kind of the open handle for `device_id`, if open.
    pub fn open_device_type(&self, device_id: &str) -> Result<DeviceType> {
        match self.open.get(device_id)? {
            OpenHandle::Hid(_) => Ok(DeviceType::Hid),
            OpenHandle::Ccid(_) => Ok(DeviceType::Ccid),
        }
    }

    /// Runs `f` against the currently open HID handle, whatever its id.
    /// Protocol commands operate on "the open device".
    pub fn with_open_hid<R>(&self, f: impl FnOnce(&HidDevice) -> Result<R>) -> Result<R> {
        match self.open.current() {
            Some((_, OpenHandle::Hid(dev))) => f(dev),
            Some((id, OpenHandle::Ccid(_))) => Err(AgentError::DeviceTypeMismatch {
                id: id.clone(),
                expected: "HID",
            }),
            None => Err(AgentError::NotOpen(String::new())),
        }
    }

    /// Runs `f` against the currently open card, whatever its id.
    pub fn with_open_card<R>(&self, f: impl FnOnce(&Card) -> Result<R>) -> Result<R> {
        match self.open.current() {
            Some((_, OpenHandle::Ccid(card))) => f(card),
            Some((id, OpenHandle::Hid(_))) => Err(AgentError::DeviceTypeMismatch {
                id: id.clone(),
                expected: "CCID",
            }),
            None => Err(AgentError::NotOpen(String::new())),
        }
    }

    /// Closes everything on the way out.
    pub fn shutdown(&mut self) {
        if let Some((id, handle)) = self.open.take() {
            info!("releasing {id} at shutdown");
            release(handle);
        }
    }
}

fn release(handle: OpenHandle) {
    match handle {
        OpenHandle::Hid(_) => {}
        OpenHandle::Ccid(card) => {
            if let Err((_, e)) = card.disconnect(pcsc::Disposition::LeaveCard) {
                warn!("card disconnect failed: {e}");
            }
        }
    }
}

fn known_product_name(pid: u16) -> Option<String> {
    KNOWN_PRODUCTS
        .iter()
        .find(|(p, _)| *p == pid)
        .map(|(_, name)| name.to_string())
}
