//! Bluetooth session.

use dbus::{
    arg::{PropMap, Variant},
    message::SignalArgs,
    nonblock::{stdintf::org_freedesktop_dbus::PropertiesPropertiesChanged, SyncConnection},
    strings::BusName,
    Message, Path,
};
use dbus_tokio::connection;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use lazy_static::lazy_static;
use std::{
    collections::HashMap,
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::{
    select,
    task::{spawn_blocking, JoinHandle},
};

use crate::{adapter, all_dbus_objects, Adapter, Error, ErrorKind, InternalErrorKind, Result, SERVICE_NAME};

/// Shared state of all objects in a Bluetooth session.
pub(crate) struct SessionInner {
    pub connection: Arc<SyncConnection>,
    pub event_sub_tx: mpsc::Sender<SubscriptionReq>,
    dbus_task: JoinHandle<connection::IOResourceError>,
}

impl SessionInner {
    /// Subscribe to property-change notifications for the object at the given path.
    pub async fn property_events(
        &self, path: Path<'static>,
    ) -> Result<mpsc::UnboundedReceiver<PropertyEvent>> {
        PropertyEvent::subscribe(&mut self.event_sub_tx.clone(), path).await
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // documentation for dbus_tokio::connection::IOResource indicates it is abortable
        self.dbus_task.abort();
    }
}

/// Bluetooth session.
///
/// Encapsulates a connection to the system Bluetooth daemon.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "Session {{ {} }}", self.inner.connection.unique_name())
    }
}

impl Session {
    /// Create a new Bluetooth session.
    ///
    /// This establishes a connection to the system Bluetooth daemon over D-Bus.
    pub async fn new() -> Result<Self> {
        let (resource, connection) = spawn_blocking(connection::new_system_sync).await??;
        let dbus_task = tokio::spawn(resource);
        log::trace!("Connected to D-Bus with unique name {}", &connection.unique_name());

        let (event_sub_tx, event_sub_rx) = mpsc::channel(1);
        PropertyEvent::handle_connection(connection.clone(), event_sub_rx).await?;

        Ok(Self { inner: Arc::new(SessionInner { connection, event_sub_tx, dbus_task }) })
    }

    /// Create an interface to the default Bluetooth adapter.
    ///
    /// If `hci0` is present it is used as the default adapter.
    /// Otherwise the adapter that is first by lexicographic sorting is used.
    ///
    /// If the system has no Bluetooth adapter an error with
    /// [ErrorKind::NotFound] is returned.
    pub async fn default_adapter(&self) -> Result<Adapter> {
        let mut names = self.adapter_names().await?;
        if names.iter().any(|name| name == adapter::DEFAULT_NAME) {
            self.adapter(adapter::DEFAULT_NAME)
        } else {
            names.sort();
            match names.first() {
                Some(name) => self.adapter(name),
                None => Err(Error::new(ErrorKind::NotFound)),
            }
        }
    }

    /// Enumerate connected Bluetooth adapters and return their names.
    pub async fn adapter_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for (path, interfaces) in all_dbus_objects(&self.inner.connection).await? {
            match Adapter::parse_dbus_path(&path) {
                Some(name) if interfaces.contains_key(adapter::INTERFACE) => {
                    names.push(name.to_string());
                }
                _ => (),
            }
        }
        Ok(names)
    }

    /// Create an interface to the Bluetooth adapter with the specified name.
    pub fn adapter(&self, adapter_name: &str) -> Result<Adapter> {
        Adapter::new(self.inner.clone(), adapter_name)
    }
}

/// A batched property-change notification for one D-Bus object.
#[derive(Debug)]
pub(crate) struct PropertyEvent {
    /// The remote interface whose properties changed.
    pub interface: String,
    /// Changed property names with their new values.
    pub changed: PropMap,
}

impl Clone for PropertyEvent {
    fn clone(&self) -> Self {
        Self {
            interface: self.interface.clone(),
            changed: self.changed.iter().map(|(k, v)| (k.clone(), Variant(v.0.box_clone()))).collect(),
        }
    }
}

/// Property-change subscription request.
pub(crate) struct SubscriptionReq {
    path: Path<'static>,
    tx: mpsc::UnboundedSender<PropertyEvent>,
    ready_tx: oneshot::Sender<()>,
}

impl PropertyEvent {
    /// Spawns a task that routes property-change signals for the specified connection.
    pub(crate) async fn handle_connection(
        connection: Arc<SyncConnection>, mut sub_rx: mpsc::Receiver<SubscriptionReq>,
    ) -> Result<()> {
        lazy_static! {
            static ref SERVICE_NAME_BUS: BusName<'static> = BusName::new(SERVICE_NAME).unwrap();
            static ref SERVICE_NAME_REF: Option<&'static BusName<'static>> = Some(&SERVICE_NAME_BUS);
        }

        let (msg_tx, mut msg_rx) = mpsc::unbounded();
        let handle_msg = move |msg: Message| {
            let _ = msg_tx.unbounded_send(msg);
            true
        };

        let rule = PropertiesPropertiesChanged::match_rule(*SERVICE_NAME_REF, None);
        let msg_match = connection.add_match(rule).await?.msg_cb(handle_msg);

        tokio::spawn(async move {
            log::trace!("Starting property event loop for {}", &connection.unique_name());

            let mut subs: HashMap<String, Vec<mpsc::UnboundedSender<PropertyEvent>>> = HashMap::new();

            loop {
                select! {
                    msg_opt = msg_rx.next() => {
                        match msg_opt {
                            Some(msg) => {
                                if let (Some(object), Some(PropertiesPropertiesChanged { interface_name, changed_properties, .. })) =
                                    (msg.path(), PropertiesPropertiesChanged::from_message(&msg))
                                {
                                    if let Some(path_subs) = subs.get_mut(&*object) {
                                        let event = PropertyEvent {
                                            interface: interface_name,
                                            changed: changed_properties,
                                        };
                                        log::trace!("Property event for {}: {:?}", &object, &event);
                                        path_subs.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
                                        if path_subs.is_empty() {
                                            subs.remove(&*object);
                                        }
                                    }
                                }
                            }
                            None => break,
                        }
                    },
                    sub_opt = sub_rx.next() => {
                        match sub_opt {
                            Some(SubscriptionReq { path, tx, ready_tx }) => {
                                log::trace!("Adding property event subscription for {}", &path);
                                let _ = ready_tx.send(());
                                subs.entry(path.to_string()).or_default().push(tx);
                            }
                            None => break,
                        }
                    }
                }
            }

            let _ = connection.remove_match(msg_match.token()).await;
            log::trace!("Terminated property event loop for {}", &connection.unique_name());
        });

        Ok(())
    }

    /// Subscribe to property-change notifications for the specified path.
    pub(crate) async fn subscribe(
        sub_tx: &mut mpsc::Sender<SubscriptionReq>, path: Path<'static>,
    ) -> Result<mpsc::UnboundedReceiver<PropertyEvent>> {
        let (tx, rx) = mpsc::unbounded();
        let (ready_tx, ready_rx) = oneshot::channel();
        sub_tx
            .send(SubscriptionReq { path, tx, ready_tx })
            .await
            .map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        ready_rx.await.map_err(|_| Error::new(ErrorKind::Internal(InternalErrorKind::DBusConnectionLost)))?;
        Ok(rx)
    }
}
