//! Notifications from the remote peer, and the loop that applies them to an [`ObjectTree`].

use std::{pin::pin, sync::Arc};

use futures_util::StreamExt;
use zbus::{
    fdo::{InterfacesAdded, InterfacesRemoved, ObjectManagerProxy, PropertiesChanged},
    MatchRule, Message, MessageStream, MessageType,
};

use crate::{path::Path, wire, Error, Holder, InterfaceSet, ObjectTree, Result, Session};

/// A decoded `ObjectManager` or `Properties` signal.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// `org.freedesktop.DBus.ObjectManager.InterfacesAdded`.
    InterfacesAdded {
        path: Path,
        /// `a{sa{sv}}`: interface names mapped to their properties.
        interfaces: Holder,
    },
    /// `org.freedesktop.DBus.ObjectManager.InterfacesRemoved`.
    InterfacesRemoved {
        path: Path,
        interfaces: InterfaceSet,
    },
    /// `org.freedesktop.DBus.Properties.PropertiesChanged`, emitted by the object at `path`.
    PropertiesChanged {
        path: Path,
        interface: String,
        /// `a{sv}` of new values.
        changed: Holder,
        /// Array of the names of properties whose values are no longer current.
        invalidated: Holder,
    },
}

impl Signal {
    /// Returns the path of the object the signal is about.
    pub fn path(&self) -> &Path {
        match self {
            Self::InterfacesAdded { path, .. }
            | Self::InterfacesRemoved { path, .. }
            | Self::PropertiesChanged { path, .. } => path,
        }
    }

    /// Decodes one of the supported signals.
    ///
    /// Returns `Ok(None)` for any other message.
    pub fn from_message(message: &Arc<Message>) -> Result<Option<Self>> {
        if let Some(added) = InterfacesAdded::from_message(message.clone()) {
            let args = added.args().map_err(Error::from)?;
            let mut interfaces = Holder::dict();
            for (name, properties) in &args.interfaces_and_properties {
                interfaces.dict_append(*name, wire::decode_properties(properties)?);
            }
            interfaces.sort_dict();
            return Ok(Some(Self::InterfacesAdded {
                path: Path::new(args.object_path.as_str())?,
                interfaces,
            }));
        }

        if let Some(removed) = InterfacesRemoved::from_message(message.clone()) {
            let args = removed.args().map_err(Error::from)?;
            return Ok(Some(Self::InterfacesRemoved {
                path: Path::new(args.object_path.as_str())?,
                interfaces: InterfaceSet::named(args.interfaces.iter().copied()),
            }));
        }

        if let Some(changed) = PropertiesChanged::from_message(message.clone()) {
            let args = changed.args().map_err(Error::from)?;
            let Some(path) = message.path() else {
                return Err(Error::other("PropertiesChanged signal without a path"));
            };
            let mut invalidated = Holder::array();
            for name in &args.invalidated_properties {
                invalidated.array_append(*name);
            }
            return Ok(Some(Self::PropertiesChanged {
                path: Path::new(path.as_str())?,
                interface: args.interface_name.to_string(),
                changed: wire::decode_properties(&args.changed_properties)?,
                invalidated,
            }));
        }

        Ok(None)
    }
}

/// Loads the objects currently exported below `manager` into `tree`.
///
/// This is the non-blocking counterpart of [`ObjectTree::load_managed_objects`], safe to call from
/// any async runtime. Objects and properties that can't be represented are logged and skipped.
///
/// # Errors
///
/// Fails if the `GetManagedObjects` call fails.
pub async fn sync(session: &Session, tree: &ObjectTree, manager: &Path) -> Result<()> {
    let proxy = ObjectManagerProxy::builder(session.conn())
        .destination(tree.bus().name())
        .map_err(Error::from)?
        .path(manager.as_str())
        .map_err(Error::from)?
        .build()
        .await
        .map_err(Error::from)?;
    let managed = proxy
        .get_managed_objects()
        .await
        .map_err(Error::send_failed)?;

    let mut objects = Holder::dict();
    for (path, interfaces) in &managed {
        let path = match Path::new(path.as_str()) {
            Ok(path) => path,
            Err(e) => {
                log::warn!("skipping managed object: {}", e);
                continue;
            }
        };

        let mut decoded = Holder::dict();
        for (name, properties) in interfaces {
            let name = name.to_string();
            let mut props = Holder::dict();
            for (key, value) in properties {
                match wire::decode(value) {
                    Ok(value) => props.dict_append(key.as_str(), value),
                    Err(e) => log::warn!("skipping {} of {} at {}: {}", key, name, path, e),
                }
            }
            props.sort_dict();
            decoded.dict_append(name, props);
        }
        decoded.sort_dict();
        objects.dict_append(path, decoded);
    }

    tree.add_managed_objects(&objects);
    Ok(())
}

/// Keeps `tree` synchronized with the remote peer until the connection goes away.
///
/// Subscribes to every signal sent by the tree's bus name, then loads the objects currently
/// exported below `manager` (see [`sync`]) and applies incoming signals in the order they arrive.
/// Failures to apply a single signal are logged and do not end the loop.
///
/// # Errors
///
/// Returns an error if subscribing or the initial load fails, and once the signal stream ends.
pub async fn watch(session: &Session, tree: &ObjectTree, manager: &Path) -> Result<()> {
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(tree.bus().name())
        .map_err(Error::from)?
        .build();
    let stream = MessageStream::for_match_rule(rule, session.conn(), None)
        .await
        .map_err(Error::from)?;

    sync(session, tree, manager).await?;

    let mut stream = pin!(stream);
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                log::warn!("error on signal stream: {}", e);
                continue;
            }
        };

        match Signal::from_message(&message) {
            Ok(Some(signal)) => {
                if let Err(e) = tree.handle(&signal) {
                    log::error!("failed to apply signal for {}: {}", signal.path(), e);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("failed to decode signal: {}", e),
        }
    }

    Err(Error::from("signal stream ended"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use zbus::{
        zvariant::{ObjectPath, Value},
        MessageBuilder,
    };

    use super::*;

    #[test]
    fn interfaces_added() {
        let mut props: HashMap<&str, Value<'_>> = HashMap::new();
        props.insert("Alias", Value::from("thermometer"));
        props.insert("RSSI", Value::I16(-60));
        let mut interfaces = HashMap::new();
        interfaces.insert("org.bluez.Device1", props);

        let message = MessageBuilder::signal("/", "org.freedesktop.DBus.ObjectManager", "InterfacesAdded")
            .unwrap()
            .build(&(ObjectPath::try_from("/org/bluez/hci0/dev_00").unwrap(), interfaces))
            .unwrap();

        let Some(Signal::InterfacesAdded { path, interfaces }) =
            Signal::from_message(&Arc::new(message)).unwrap()
        else {
            panic!("not decoded as InterfacesAdded");
        };
        assert_eq!(path.as_str(), "/org/bluez/hci0/dev_00");
        let device = interfaces.dict_get(&"org.bluez.Device1".to_string()).unwrap();
        assert_eq!(
            device.dict_get(&"RSSI".to_string()).unwrap().get::<i16>().unwrap(),
            -60
        );
        assert_eq!(
            device.dict_get(&"Alias".to_string()).unwrap().get::<String>().unwrap(),
            "thermometer"
        );
    }

    #[test]
    fn interfaces_removed() {
        let message = MessageBuilder::signal("/", "org.freedesktop.DBus.ObjectManager", "InterfacesRemoved")
            .unwrap()
            .build(&(
                ObjectPath::try_from("/org/bluez/hci0").unwrap(),
                vec!["org.bluez.Adapter1", "org.bluez.Battery1"],
            ))
            .unwrap();

        assert_eq!(
            Signal::from_message(&Arc::new(message)).unwrap(),
            Some(Signal::InterfacesRemoved {
                path: Path::new("/org/bluez/hci0").unwrap(),
                interfaces: InterfaceSet::named(["org.bluez.Adapter1", "org.bluez.Battery1"]),
            })
        );
    }

    #[test]
    fn properties_changed() {
        let mut changed: HashMap<&str, Value<'_>> = HashMap::new();
        changed.insert("Percentage", Value::U8(42));
        let message = MessageBuilder::signal(
            "/org/bluez/hci0/dev_00",
            "org.freedesktop.DBus.Properties",
            "PropertiesChanged",
        )
        .unwrap()
        .build(&("org.bluez.Battery1", changed, vec!["Voltage"]))
        .unwrap();

        let mut expected = Holder::dict();
        expected.dict_append("Percentage", 42u8);
        assert_eq!(
            Signal::from_message(&Arc::new(message)).unwrap(),
            Some(Signal::PropertiesChanged {
                path: Path::new("/org/bluez/hci0/dev_00").unwrap(),
                interface: "org.bluez.Battery1".to_string(),
                changed: expected,
                invalidated: Holder::create(vec!["Voltage"]),
            })
        );
    }

    #[cfg(not(feature = "tokio"))]
    #[test]
    fn initial_sync() {
        use crate::{connection::peer, Bus, Interface, InterfaceExt, Registry};

        let (_server, session) = peer::connect();
        let bus = Bus::from_session(&session, "org.example", Arc::new(Registry::new()));
        let tree = ObjectTree::new(bus).unwrap();
        pollster::block_on(sync(&session, &tree, &Path::root())).unwrap();

        let iface = tree
            .interface_get(&Path::new("/obj").unwrap(), "org.example.Thing")
            .unwrap();
        assert!(iface.is_loaded());
        assert_eq!(iface.get::<u8>("Level").unwrap(), 7);
        assert!(tree.path_get(&Path::new("/obj/empty").unwrap()).is_none());
    }

    #[test]
    fn other_signals() {
        let message = MessageBuilder::signal("/", "org.example.Thing", "Ping")
            .unwrap()
            .build(&())
            .unwrap();
        assert_eq!(Signal::from_message(&Arc::new(message)).unwrap(), None);
    }
}
