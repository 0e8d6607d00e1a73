//! Remote Bluetooth device.

use dbus::{
    arg::{prop_cast, PropMap, RefArg, Variant},
    nonblock::{Proxy, SyncConnection},
    Path,
};
use futures::{channel::mpsc, Stream, StreamExt};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use uuid::Uuid;

use crate::{
    gatt::GattSession, session::PropertyEvent, variant, Adapter, Address, AddressType, Result, SessionInner,
    SERVICE_NAME, TIMEOUT,
};

pub(crate) const INTERFACE: &str = "org.bluez.Device1";

/// Interface to a remote Bluetooth device.
///
/// A device is bound to a fixed identity (adapter name and device address)
/// at construction and addresses exactly one `org.bluez.Device1` object for
/// its entire lifetime.
///
/// Property accessors are *best effort*: they never fail. A read that the
/// bus rejects, times out or cannot answer is logged as a warning naming
/// the property and the device address, and replaced by the property's
/// default value. Only [Device::connect] reports transport failures, since
/// it gates a stateful session.
#[derive(Clone)]
pub struct Device {
    inner: Arc<SessionInner>,
    dbus_path: Path<'static>,
    adapter_name: Arc<String>,
    address: Address,
    connectivity: Arc<ConnectivityTracker>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> std::fmt::Result {
        write!(f, "Device {{ adapter_name: {}, address: {} }}", self.adapter_name(), self.address())
    }
}

impl Device {
    /// Create Bluetooth device interface for device of specified address on specified adapter.
    pub(crate) fn new(inner: Arc<SessionInner>, adapter_name: Arc<String>, address: Address) -> Result<Self> {
        Ok(Self {
            inner,
            dbus_path: Self::dbus_path(&adapter_name, address)?,
            adapter_name,
            address,
            connectivity: Arc::new(ConnectivityTracker::new()),
        })
    }

    fn proxy(&self) -> Proxy<'_, &SyncConnection> {
        Proxy::new(SERVICE_NAME, &self.dbus_path, TIMEOUT, &*self.inner.connection)
    }

    pub(crate) fn dbus_path(adapter_name: &str, address: Address) -> Result<Path<'static>> {
        let adapter_path = Adapter::dbus_path(adapter_name)?;
        Ok(Path::new(format!("{}/dev_{}", adapter_path, address.to_string().replace(':', "_"))).unwrap())
    }

    pub(crate) fn parse_dbus_path_prefix<'a>(path: &'a Path) -> Option<((&'a str, Address), &'a str)> {
        match Adapter::parse_dbus_path_prefix(path) {
            Some((adapter_name, p)) => match p.strip_prefix("/dev_") {
                Some(p) => {
                    let sep = p.find('/').unwrap_or(p.len());
                    match p[0..sep].replace('_', ":").parse::<Address>() {
                        Ok(addr) => Some(((adapter_name, addr), &p[sep..])),
                        Err(_) => None,
                    }
                }
                None => None,
            },
            None => None,
        }
    }

    pub(crate) fn parse_dbus_path<'a>(path: &'a Path) -> Option<(&'a str, Address)> {
        match Self::parse_dbus_path_prefix(path) {
            Some((v, "")) => Some(v),
            _ => None,
        }
    }

    /// The Bluetooth adapter name.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// The Bluetooth device address of the remote device.
    ///
    /// BlueZ identifies devices by address, so this is part of the fixed
    /// identity and always available without a bus round-trip.
    pub fn address(&self) -> Address {
        self.address
    }

    dbus_interface!();
    dbus_default_interface!(INTERFACE);

    // ===========================================================================================
    // Best-effort property accessors
    // ===========================================================================================

    /// The Bluetooth remote name, or an empty string when unavailable.
    ///
    /// The remote name cannot be changed; prefer [Device::alias] when
    /// displaying the device.
    pub async fn name(&self) -> String {
        recover(self.get_opt_property("Name").await, "Name", self.address, String::new())
    }

    /// The name alias for the remote device, or an empty string when unavailable.
    pub async fn alias(&self) -> String {
        recover(self.get_opt_property("Alias").await, "Alias", self.address, String::new())
    }

    /// The Bluetooth device address type, or [None] when unavailable.
    pub async fn address_type(&self) -> Option<AddressType> {
        let raw: String =
            recover(self.get_opt_property("AddressType").await, "AddressType", self.address, String::new());
        if raw.is_empty() {
            return None;
        }
        match raw.parse() {
            Ok(address_type) => Some(address_type),
            Err(_) => {
                log::warn!("device {} reports unknown address type {}", self.address, raw);
                None
            }
        }
    }

    /// Received signal strength indicator of the remote device in dBm,
    /// or 0 when unavailable.
    pub async fn rssi(&self) -> i16 {
        recover(self.get_opt_property("RSSI").await, "RSSI", self.address, 0)
    }

    /// Advertised transmitted power level in dBm, or 0 when unavailable.
    pub async fn tx_power(&self) -> i16 {
        recover(self.get_opt_property("TxPower").await, "TxPower", self.address, 0)
    }

    /// UUIDs of the services available on the remote device, in bus order.
    ///
    /// Empty when unavailable.
    pub async fn uuids(&self) -> Vec<Uuid> {
        let raw: Vec<String> =
            recover(self.get_opt_property("UUIDs").await, "UUIDs", self.address, Vec::new());
        raw.into_iter()
            .filter_map(|uuid| match uuid.parse() {
                Ok(uuid) => Some(uuid),
                Err(_) => {
                    log::warn!("device {} advertises invalid service UUID {}", self.address, uuid);
                    None
                }
            })
            .collect()
    }

    /// Manufacturer specific advertisement data, keyed by manufacturer id.
    ///
    /// Empty when unavailable.
    pub async fn manufacturer_data(&self) -> HashMap<u16, Vec<u8>> {
        let raw: HashMap<u16, Variant<Box<dyn RefArg + 'static>>> = recover(
            self.get_opt_property("ManufacturerData").await,
            "ManufacturerData",
            self.address,
            HashMap::new(),
        );
        variant::byte_dict(&raw)
    }

    /// Advertising data of the remote device, keyed by data type.
    ///
    /// Empty when unavailable.
    pub async fn advertising_data(&self) -> HashMap<u8, Vec<u8>> {
        let raw: HashMap<u8, Variant<Box<dyn RefArg + 'static>>> = recover(
            self.get_opt_property("AdvertisingData").await,
            "AdvertisingData",
            self.address,
            HashMap::new(),
        );
        variant::byte_dict(&raw)
    }

    /// Service advertisement data, keyed by service UUID.
    ///
    /// Empty when unavailable.
    pub async fn service_data(&self) -> HashMap<Uuid, Vec<u8>> {
        let raw: HashMap<String, Variant<Box<dyn RefArg + 'static>>> = recover(
            self.get_opt_property("ServiceData").await,
            "ServiceData",
            self.address,
            HashMap::new(),
        );
        variant::uuid_byte_dict(&raw)
    }

    /// Indicates if the remote device is paired. False when unavailable.
    pub async fn is_paired(&self) -> bool {
        recover(self.get_opt_property("Paired").await, "Paired", self.address, false)
    }

    /// Indicates if the remote device is currently connected. False when unavailable.
    pub async fn is_connected(&self) -> bool {
        recover(self.get_opt_property("Connected").await, "Connected", self.address, false)
    }

    /// Human-readable label for the device of the form `"<name> [<address>]"`.
    ///
    /// The name is resolved before formatting; when unavailable the brackets
    /// carry the address alone.
    pub async fn display_label(&self) -> String {
        format_label(&self.name().await, self.address)
    }

    // ===========================================================================================
    // Methods
    // ===========================================================================================

    async fn best_effort_call(&self, method: &str) -> bool {
        settle(self.call_method(method, ()).await, method, self.address)
    }

    /// Initiates pairing with the remote device.
    ///
    /// Returns whether the pairing call succeeded; a failure is logged and
    /// reported as false. In-flight pairing is not tracked here: BlueZ
    /// rejects overlapping attempts itself.
    pub async fn pair(&self) -> bool {
        self.best_effort_call("Pair").await
    }

    /// Cancels a pairing operation initiated by [Device::pair].
    ///
    /// Returns whether the call succeeded; a failure is logged and reported
    /// as false.
    pub async fn cancel_pairing(&self) -> bool {
        self.best_effort_call("CancelPairing").await
    }

    /// Connects all auto-connectable profiles of the remote device.
    ///
    /// The connectivity monitor is installed before the connect call is
    /// issued, so no transition is missed; a monitor that is already live
    /// is reused. Unlike the property accessors, a transport failure here
    /// propagates to the caller.
    pub async fn connect(&self) -> Result<()> {
        if !self.connectivity.is_active().await {
            let events = self.inner.property_events(self.dbus_path.clone()).await?;
            self.connectivity.install(self.address, events).await;
        }
        self.call_method("Connect", ()).await
    }

    /// Gracefully disconnects all connected profiles and terminates the
    /// low-level connection.
    ///
    /// Returns whether the disconnect call succeeded; a failure is logged
    /// and reported as false. The connectivity monitor is torn down
    /// regardless of the call's outcome, so this is also safe to call when
    /// no monitor is installed.
    pub async fn disconnect(&self) -> bool {
        let ok = self.best_effort_call("Disconnect").await;
        self.connectivity.clear().await;
        ok
    }

    /// Connectivity transitions of the remote device.
    ///
    /// Events are delivered in order to a single consumer: the first call
    /// yields the stream, subsequent calls yield [None]. Events flow only
    /// while a monitor installed by [Device::connect] is live.
    pub async fn connectivity_events(&self) -> Option<impl Stream<Item = ConnectivityEvent>> {
        self.connectivity.take_events().await
    }

    /// Creates and initializes a GATT session for the remote device.
    ///
    /// Each call produces a new, independently initialized session. The
    /// device must be connected with its services resolved.
    pub async fn gatt(&self) -> Result<GattSession> {
        let mut session = GattSession::new(self.inner.clone(), self.adapter_name.clone(), self.address)?;
        session.initialize().await?;
        Ok(session)
    }
}

fn format_label(name: &str, address: Address) -> String {
    format!("{} [{}]", name, address)
}

/// Reports the outcome of a best-effort method call as a boolean,
/// logging a warning naming the method and the device on failure.
fn settle(call: Result<()>, method: &str, address: Address) -> bool {
    match call {
        Ok(()) => true,
        Err(err) => {
            log::warn!("calling {} on device {} failed: {}", method, address, err);
            false
        }
    }
}

/// Substitutes the default value for a failed or absent property read,
/// logging a warning naming the property and the device.
fn recover<T>(read: Result<Option<T>>, property: &str, address: Address, default: T) -> T {
    match read {
        Ok(Some(value)) => value,
        Ok(None) => {
            log::warn!("property {} of device {} is not present, substituting default", property, address);
            default
        }
        Err(err) => {
            log::warn!("reading property {} of device {} failed: {}, substituting default", property, address, err);
            default
        }
    }
}

/// Connectivity transition of a remote Bluetooth device.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectivityEvent {
    /// The device became connected.
    Connected,
    /// The device became disconnected.
    Disconnected,
}

/// Extracts the connectivity transition from a property-change batch, if any.
fn connectivity_event(changed: &PropMap) -> Option<ConnectivityEvent> {
    prop_cast::<bool>(changed, "Connected").map(|connected| {
        if *connected {
            ConnectivityEvent::Connected
        } else {
            ConnectivityEvent::Disconnected
        }
    })
}

/// Connectivity monitoring state of one device.
///
/// Holds the single-consumer event channel and at most one live monitor
/// task demultiplexing property-change notifications into connectivity
/// events.
struct ConnectivityTracker {
    event_tx: mpsc::UnboundedSender<ConnectivityEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectivityEvent>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectivityTracker {
    fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded();
        Self { event_tx, event_rx: Mutex::new(Some(event_rx)), monitor: Mutex::new(None) }
    }

    /// Whether a live monitor is installed.
    async fn is_active(&self) -> bool {
        matches!(&*self.monitor.lock().await, Some(task) if !task.is_finished())
    }

    /// Installs a monitor fed by the given notification stream.
    ///
    /// Returns false without installing when a live monitor already exists,
    /// making repeated installation attempts idempotent.
    async fn install(
        &self, address: Address, events: impl Stream<Item = PropertyEvent> + Send + Unpin + 'static,
    ) -> bool {
        let mut monitor = self.monitor.lock().await;
        if let Some(task) = &*monitor {
            if !task.is_finished() {
                return false;
            }
        }

        let tx = self.event_tx.clone();
        *monitor = Some(tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if event.interface != INTERFACE {
                    continue;
                }
                if let Some(change) = connectivity_event(&event.changed) {
                    log::trace!("Device {} connectivity changed: {:?}", address, change);
                    if tx.unbounded_send(change).is_err() {
                        break;
                    }
                }
            }
        }));
        true
    }

    /// Tears down the monitor. Safe to call when none is installed.
    async fn clear(&self) {
        if let Some(task) = self.monitor.lock().await.take() {
            task.abort();
        }
    }

    /// Takes the single-consumer event receiver.
    async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectivityEvent>> {
        self.event_rx.lock().await.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> Address {
        Address::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13])
    }

    fn changed(entries: Vec<(&str, Box<dyn RefArg + 'static>)>) -> PropMap {
        entries.into_iter().map(|(name, value)| (name.to_string(), Variant(value))).collect()
    }

    #[test]
    fn recover_passes_through_values() {
        assert_eq!(recover(Ok(Some(-42_i16)), "RSSI", addr(), 0), -42);
    }

    #[test]
    fn recover_substitutes_default_when_absent() {
        assert_eq!(recover(Ok(None), "RSSI", addr(), 0), 0);
        assert_eq!(recover::<String>(Ok(None), "Name", addr(), String::new()), "");
    }

    #[test]
    fn recover_substitutes_default_on_error() {
        let err = crate::Error::new(crate::ErrorKind::Failed);
        assert!(!recover(Err(err), "Paired", addr(), false));
    }

    #[test]
    fn settle_reports_success() {
        assert!(settle(Ok(()), "Pair", addr()));
    }

    #[test]
    fn settle_reports_method_failure_as_false() {
        let rejected = crate::Error::new(crate::ErrorKind::AuthenticationFailed);
        assert!(!settle(Err(rejected), "Pair", addr()));

        let not_ready = crate::Error::new(crate::ErrorKind::NotReady);
        assert!(!settle(Err(not_ready), "CancelPairing", addr()));
    }

    #[test]
    fn connectivity_event_demux() {
        let up = changed(vec![("Connected", Box::new(true))]);
        assert_eq!(connectivity_event(&up), Some(ConnectivityEvent::Connected));

        let down = changed(vec![("Connected", Box::new(false))]);
        assert_eq!(connectivity_event(&down), Some(ConnectivityEvent::Disconnected));

        let unrelated = changed(vec![("RSSI", Box::new(-60_i16))]);
        assert_eq!(connectivity_event(&unrelated), None);

        let mixed = changed(vec![("RSSI", Box::new(-60_i16)), ("Connected", Box::new(true))]);
        assert_eq!(connectivity_event(&mixed), Some(ConnectivityEvent::Connected));
    }

    #[test]
    fn label_contains_name_and_address() {
        assert_eq!(format_label("Speaker", addr()), "Speaker [00:1A:7D:DA:71:13]");
        assert_eq!(format_label("", addr()), " [00:1A:7D:DA:71:13]");
    }

    #[test]
    fn device_path_roundtrip() {
        let path = Device::dbus_path("hci0", addr()).unwrap();
        assert_eq!(&*path, "/org/bluez/hci0/dev_00_1A_7D_DA_71_13");
        assert_eq!(Device::parse_dbus_path(&path), Some(("hci0", addr())));

        let service = Path::new("/org/bluez/hci0/dev_00_1A_7D_DA_71_13/service000c").unwrap();
        assert_eq!(Device::parse_dbus_path(&service), None);
        assert_eq!(Device::parse_dbus_path_prefix(&service), Some((("hci0", addr()), "/service000c")));
    }

    fn property_event(entries: Vec<(&str, Box<dyn RefArg + 'static>)>) -> PropertyEvent {
        PropertyEvent { interface: INTERFACE.to_string(), changed: changed(entries) }
    }

    #[tokio::test]
    async fn monitor_emits_connectivity_transitions_in_order() {
        let tracker = ConnectivityTracker::new();
        let (tx, rx) = mpsc::unbounded();
        assert!(tracker.install(addr(), rx).await);

        tx.unbounded_send(property_event(vec![("Connected", Box::new(true))])).unwrap();
        tx.unbounded_send(property_event(vec![("RSSI", Box::new(-60_i16))])).unwrap();
        tx.unbounded_send(property_event(vec![("Connected", Box::new(false))])).unwrap();

        let mut events = tracker.take_events().await.unwrap();
        assert_eq!(events.next().await, Some(ConnectivityEvent::Connected));
        assert_eq!(events.next().await, Some(ConnectivityEvent::Disconnected));
    }

    #[tokio::test]
    async fn monitor_ignores_foreign_interfaces() {
        let tracker = ConnectivityTracker::new();
        let (tx, rx) = mpsc::unbounded();
        assert!(tracker.install(addr(), rx).await);

        let foreign = PropertyEvent {
            interface: "org.bluez.MediaControl1".to_string(),
            changed: changed(vec![("Connected", Box::new(true))]),
        };
        tx.unbounded_send(foreign).unwrap();
        tx.unbounded_send(property_event(vec![("Connected", Box::new(true))])).unwrap();

        let mut events = tracker.take_events().await.unwrap();
        // first delivered event is from Device1, the foreign one was dropped
        assert_eq!(events.next().await, Some(ConnectivityEvent::Connected));
        assert!(matches!(events.try_next(), Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn monitor_installation_is_idempotent() {
        let tracker = ConnectivityTracker::new();
        let (_tx1, rx1) = mpsc::unbounded::<PropertyEvent>();
        let (_tx2, rx2) = mpsc::unbounded::<PropertyEvent>();

        assert!(tracker.install(addr(), rx1).await);
        assert!(tracker.is_active().await);
        assert!(!tracker.install(addr(), rx2).await);

        tracker.clear().await;
        assert!(!tracker.is_active().await);

        let (_tx3, rx3) = mpsc::unbounded::<PropertyEvent>();
        assert!(tracker.install(addr(), rx3).await);
    }

    #[tokio::test]
    async fn cleared_monitor_emits_no_further_events() {
        let tracker = ConnectivityTracker::new();
        let (tx, rx) = mpsc::unbounded();
        assert!(tracker.install(addr(), rx).await);

        tx.unbounded_send(property_event(vec![("Connected", Box::new(true))])).unwrap();
        let mut events = tracker.take_events().await.unwrap();
        assert_eq!(events.next().await, Some(ConnectivityEvent::Connected));

        tracker.clear().await;
        tx.unbounded_send(property_event(vec![("Connected", Box::new(false))])).unwrap();
        assert!(matches!(events.try_next(), Err(_) | Ok(None)));
    }

    #[tokio::test]
    async fn events_stream_has_a_single_consumer() {
        let tracker = ConnectivityTracker::new();
        assert!(tracker.take_events().await.is_some());
        assert!(tracker.take_events().await.is_none());
    }
}
