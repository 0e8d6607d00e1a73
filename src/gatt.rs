//! Remote GATT services.

use dbus::{
    nonblock::{Proxy, SyncConnection},
    Path,
};
use std::{fmt, sync::Arc};
use uuid::Uuid;

use crate::{
    all_dbus_objects, device, Address, Device, Error, ErrorKind, Result, SessionInner, SERVICE_NAME, TIMEOUT,
};

pub(crate) const SERVICE_INTERFACE: &str = "org.bluez.GattService1";

/// GATT session with one remote device.
///
/// A session is scoped to the same identity as the [Device](crate::Device)
/// it was created from. Construction via [Device::gatt](crate::Device::gatt)
/// resolves the remote service set before the session is handed out; every
/// call produces a fresh, independently initialized session.
pub struct GattSession {
    inner: Arc<SessionInner>,
    dbus_path: Path<'static>,
    adapter_name: Arc<String>,
    address: Address,
    services: Vec<Service>,
}

impl fmt::Debug for GattSession {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "GattSession {{ adapter_name: {}, address: {}, services: {} }}",
            &self.adapter_name,
            &self.address,
            self.services.len()
        )
    }
}

impl GattSession {
    pub(crate) fn new(inner: Arc<SessionInner>, adapter_name: Arc<String>, address: Address) -> Result<Self> {
        Ok(Self {
            inner,
            dbus_path: Device::dbus_path(&adapter_name, address)?,
            adapter_name,
            address,
            services: Vec::new(),
        })
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, &self.dbus_path, TIMEOUT, &*self.inner.connection)
    }

    dbus_interface!();
    dbus_default_interface!(device::INTERFACE);

    /// Resolves the remote service set.
    ///
    /// Must complete before the session is considered usable. Fails with
    /// [ErrorKind::ServicesUnresolved] when the device is not connected or
    /// service discovery has not finished.
    pub(crate) async fn initialize(&mut self) -> Result<()> {
        let resolved: bool = self.get_opt_property("ServicesResolved").await?.unwrap_or(false);
        if !resolved {
            return Err(Error::new(ErrorKind::ServicesUnresolved));
        }

        let mut services = Vec::new();
        for (path, interfaces) in all_dbus_objects(&self.inner.connection).await? {
            match Service::parse_dbus_path(&path) {
                Some((adapter, device_address, id))
                    if adapter == *self.adapter_name
                        && device_address == self.address
                        && interfaces.contains_key(SERVICE_INTERFACE) =>
                {
                    services.push(Service::new(self.inner.clone(), self.adapter_name.clone(), self.address, id)?);
                }
                _ => (),
            }
        }
        services.sort_by_key(|service| service.id());
        self.services = services;
        Ok(())
    }

    /// The resolved remote GATT services.
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// The resolved remote GATT service with the specified UUID.
    pub async fn service(&self, uuid: Uuid) -> Result<Service> {
        for service in &self.services {
            if service.uuid().await? == uuid {
                return Ok(service.clone());
            }
        }
        Err(Error::new(ErrorKind::NotFound))
    }
}

// ===========================================================================================
// Service
// ===========================================================================================

/// Interface to a remote GATT service.
#[derive(Clone)]
pub struct Service {
    inner: Arc<SessionInner>,
    dbus_path: Path<'static>,
    adapter_name: Arc<String>,
    device_address: Address,
    id: u16,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Service {{ adapter_name: {}, device_address: {}, id: {} }}",
            self.adapter_name(),
            self.device_address(),
            self.id()
        )
    }
}

impl Service {
    pub(crate) fn new(
        inner: Arc<SessionInner>, adapter_name: Arc<String>, device_address: Address, id: u16,
    ) -> Result<Self> {
        Ok(Self {
            inner,
            dbus_path: Self::dbus_path(&adapter_name, device_address, id)?,
            adapter_name,
            device_address,
            id,
        })
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, &self.dbus_path, TIMEOUT, &*self.inner.connection)
    }

    pub(crate) fn dbus_path(adapter_name: &str, device_address: Address, id: u16) -> Result<Path<'static>> {
        let device_path = Device::dbus_path(adapter_name, device_address)?;
        Ok(Path::new(format!("{}/service{:04x}", device_path, id)).unwrap())
    }

    pub(crate) fn parse_dbus_path_prefix<'a>(path: &'a Path) -> Option<((&'a str, Address, u16), &'a str)> {
        match Device::parse_dbus_path_prefix(path) {
            Some(((adapter_name, device_address), p)) => match p.strip_prefix("/service") {
                Some(p) => {
                    let sep = p.find('/').unwrap_or(p.len());
                    match u16::from_str_radix(&p[0..sep], 16) {
                        Ok(id) => Some(((adapter_name, device_address, id), &p[sep..])),
                        Err(_) => None,
                    }
                }
                None => None,
            },
            None => None,
        }
    }

    pub(crate) fn parse_dbus_path<'a>(path: &'a Path) -> Option<(&'a str, Address, u16)> {
        match Self::parse_dbus_path_prefix(path) {
            Some((v, "")) => Some(v),
            _ => None,
        }
    }

    /// The Bluetooth adapter name.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// The Bluetooth device address of the remote device this service belongs to.
    pub fn device_address(&self) -> Address {
        self.device_address
    }

    /// The local identifier for this service.
    ///
    /// It may change when the device is next discovered and is not related
    /// to the service UUID.
    pub fn id(&self) -> u16 {
        self.id
    }

    dbus_interface!();
    dbus_default_interface!(SERVICE_INTERFACE);

    /// The UUID of this service.
    pub async fn uuid(&self) -> Result<Uuid> {
        let uuid: String = self.get_property("UUID").await?;
        uuid.parse().map_err(|_| Error::new(ErrorKind::Internal(crate::InternalErrorKind::InvalidValue)))
    }

    /// Whether this is a primary service.
    pub async fn primary(&self) -> Result<bool> {
        self.get_property("Primary").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_path_roundtrip() {
        let addr = Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
        let path = Service::dbus_path("hci0", addr, 0x000c).unwrap();
        assert_eq!(&*path, "/org/bluez/hci0/dev_00_1A_7D_DA_71_13/service000c");
        assert_eq!(Service::parse_dbus_path(&path), Some(("hci0", addr, 0x000c)));

        let char_path =
            Path::new("/org/bluez/hci0/dev_00_1A_7D_DA_71_13/service000c/char000d").unwrap();
        assert_eq!(Service::parse_dbus_path(&char_path), None);
        assert_eq!(
            Service::parse_dbus_path_prefix(&char_path),
            Some((("hci0", addr, 0x000c), "/char000d"))
        );

        let device_path = Path::new("/org/bluez/hci0/dev_00_1A_7D_DA_71_13").unwrap();
        assert_eq!(Service::parse_dbus_path(&device_path), None);
    }
}
