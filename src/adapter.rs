//! Bluetooth adapter.

use dbus::{
    nonblock::{Proxy, SyncConnection},
    Path,
};
use std::{fmt, sync::Arc};

use crate::{
    all_dbus_objects, device, Address, Device, Error, ErrorKind, Result, SessionInner, SERVICE_NAME, TIMEOUT,
};

pub(crate) const INTERFACE: &str = "org.bluez.Adapter1";
pub(crate) const PREFIX: &str = "/org/bluez/";
pub(crate) const DEFAULT_NAME: &str = "hci0";

/// Interface to a Bluetooth adapter.
///
/// The adapter owns the remote device objects: use [Adapter::device] to
/// obtain an interface to a device of known address and
/// [Adapter::device_addresses] to enumerate the devices BlueZ currently
/// knows about.
#[derive(Clone)]
pub struct Adapter {
    inner: Arc<SessionInner>,
    dbus_path: Path<'static>,
    name: Arc<String>,
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        write!(f, "Adapter {{ name: {} }}", self.name())
    }
}

impl Adapter {
    /// Create Bluetooth adapter interface for adapter with specified name.
    pub(crate) fn new(inner: Arc<SessionInner>, name: &str) -> Result<Self> {
        Ok(Self { inner, dbus_path: Self::dbus_path(name)?, name: Arc::new(name.to_string()) })
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, &self.dbus_path, TIMEOUT, &*self.inner.connection)
    }

    pub(crate) fn dbus_path(adapter_name: &str) -> Result<Path<'static>> {
        Path::new(format!("{}{}", PREFIX, adapter_name))
            .map_err(|_| Error::new(ErrorKind::InvalidName(adapter_name.to_string())))
    }

    pub(crate) fn parse_dbus_path_prefix<'a>(path: &'a Path) -> Option<(&'a str, &'a str)> {
        match path.strip_prefix(PREFIX) {
            Some(p) => {
                let sep = p.find('/').unwrap_or(p.len());
                Some((&p[0..sep], &p[sep..]))
            }
            None => None,
        }
    }

    pub(crate) fn parse_dbus_path<'a>(path: &'a Path) -> Option<&'a str> {
        match Self::parse_dbus_path_prefix(path) {
            Some((v, "")) => Some(v),
            _ => None,
        }
    }

    /// The Bluetooth adapter name.
    ///
    /// For example `hci0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bluetooth addresses of known Bluetooth devices.
    pub async fn device_addresses(&self) -> Result<Vec<Address>> {
        let mut addrs = Vec::new();
        for (path, interfaces) in all_dbus_objects(&self.inner.connection).await? {
            match Device::parse_dbus_path(&path) {
                Some((adapter, addr))
                    if adapter == *self.name && interfaces.contains_key(device::INTERFACE) =>
                {
                    addrs.push(addr)
                }
                _ => (),
            }
        }
        Ok(addrs)
    }

    /// Get interface to Bluetooth device of specified address.
    pub fn device(&self, address: Address) -> Result<Device> {
        Device::new(self.inner.clone(), self.name.clone(), address)
    }

    dbus_interface!();
    dbus_default_interface!(INTERFACE);

    /// The Bluetooth device address of the adapter.
    pub async fn address(&self) -> Result<Address> {
        let address: String = self.get_property("Address").await?;
        Ok(address.parse()?)
    }

    /// Indicates whether the adapter is powered on.
    pub async fn is_powered(&self) -> Result<bool> {
        self.get_property("Powered").await
    }

    /// Indicates that a device discovery procedure is active.
    pub async fn is_discovering(&self) -> Result<bool> {
        self.get_property("Discovering").await
    }

    /// Starts device discovery.
    ///
    /// Discovered devices appear in [Adapter::device_addresses] and remain
    /// known to BlueZ for a daemon-controlled period after discovery stops.
    pub async fn start_discovery(&self) -> Result<()> {
        self.call_method("StartDiscovery", ()).await
    }

    /// Stops device discovery.
    pub async fn stop_discovery(&self) -> Result<()> {
        self.call_method("StopDiscovery", ()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_path_parsing() {
        let path = Path::new("/org/bluez/hci0").unwrap();
        assert_eq!(Adapter::parse_dbus_path(&path), Some("hci0"));

        let nested = Path::new("/org/bluez/hci0/dev_00_1A_7D_DA_71_13").unwrap();
        assert_eq!(Adapter::parse_dbus_path(&nested), None);
        assert_eq!(Adapter::parse_dbus_path_prefix(&nested), Some(("hci0", "/dev_00_1A_7D_DA_71_13")));

        let other = Path::new("/org/freedesktop/other").unwrap();
        assert_eq!(Adapter::parse_dbus_path(&other), None);
    }

    #[test]
    fn adapter_path_construction() {
        assert_eq!(&*Adapter::dbus_path("hci1").unwrap(), "/org/bluez/hci1");
        assert!(Adapter::dbus_path("hci-0").is_err());
    }
}
