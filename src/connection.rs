//! The transport seam between the object tree and the bus.

use zbus::zvariant::{Structure, StructureBuilder};

use crate::{path::Path, wire, Error, Holder, Result, Session};

/// A method call addressed to an object on the bus.
///
/// Arguments are [`Holder`]s paired with the D-Bus signature they are sent as.
#[derive(Debug, Clone)]
pub struct MethodCall {
    bus_name: String,
    path: Path,
    interface: String,
    method: String,
    arguments: Vec<(Holder, String)>,
}

impl MethodCall {
    pub fn new(
        bus_name: impl Into<String>,
        path: Path,
        interface: impl Into<String>,
        method: impl Into<String>,
    ) -> Self {
        Self {
            bus_name: bus_name.into(),
            path,
            interface: interface.into(),
            method: method.into(),
            arguments: Vec::new(),
        }
    }

    /// Appends an argument that will be encoded as `signature`.
    pub fn append_argument(&mut self, value: impl Into<Holder>, signature: impl Into<String>) {
        self.arguments.push((value.into(), signature.into()));
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arguments(&self) -> &[(Holder, String)] {
        &self.arguments
    }
}

/// Something that can deliver a [`MethodCall`] and wait for its reply.
///
/// [`Session`] implements this on top of a zbus connection; tests substitute their own.
pub trait Connection: Send + Sync {
    /// Sends `call` and blocks until the reply arrives.
    ///
    /// A reply without a body is returned as an empty [`Holder::none`], a single return value as
    /// itself, and multiple return values as an array of them.
    ///
    /// # Errors
    ///
    /// Implementations must report every failure of the round-trip (including error replies) as
    /// [`Error::send_failed`].
    fn send_with_reply_and_block(&self, call: &MethodCall) -> Result<Holder>;
}

/// Calls are made through zbus' blocking API. They must not be made from a thread that is
/// driving an async runtime: with the `tokio` feature this panics, and with the default executor it
/// stalls the calling task. Use `spawn_blocking` or a dedicated thread instead.
impl Connection for Session {
    fn send_with_reply_and_block(&self, call: &MethodCall) -> Result<Holder> {
        log::trace!(
            "calling {}.{} on {}:{}",
            call.interface,
            call.method,
            call.bus_name,
            call.path
        );

        let reply = if call.arguments.is_empty() {
            self.blocking.call_method(
                Some(call.bus_name.as_str()),
                call.path.as_str(),
                Some(call.interface.as_str()),
                call.method.as_str(),
                &(),
            )
        } else {
            let mut body = StructureBuilder::new();
            for (value, signature) in &call.arguments {
                body = body.append_field(wire::encode(value, signature)?);
            }
            self.blocking.call_method(
                Some(call.bus_name.as_str()),
                call.path.as_str(),
                Some(call.interface.as_str()),
                call.method.as_str(),
                &body.build(),
            )
        };
        let reply = reply.map_err(Error::send_failed)?;

        // Replies of void methods carry no signature header at all.
        match reply.body_signature() {
            Ok(signature) if !signature.as_str().is_empty() => {}
            Ok(_) | Err(zbus::Error::NoBodySignature) => return Ok(Holder::none()),
            Err(e) => return Err(Error::send_failed(e)),
        }
        let body: Structure<'_> = reply.body().map_err(Error::send_failed)?;
        match body.fields() {
            [single] => wire::decode(single),
            fields => {
                let mut values = Holder::array();
                for field in fields {
                    values.array_append(wire::decode(field)?);
                }
                Ok(values)
            }
        }
    }
}


/// A peer served over a socket pair, for exercising [`Session`] without a bus daemon.
#[cfg(all(test, not(feature = "tokio")))]
pub(crate) mod peer {
    use std::{collections::HashMap, os::unix::net::UnixStream};

    use zbus::{
        dbus_interface,
        zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
        ConnectionBuilder, Guid,
    };

    use crate::Session;

    struct Thing {
        level: u8,
    }

    #[dbus_interface(name = "org.example.Thing")]
    impl Thing {
        fn add(&self, a: i32, b: i32) -> i32 {
            a + b
        }

        fn divide(&self, a: i32, b: i32) -> (i32, i32) {
            (a / b, a % b)
        }

        fn reset(&mut self) {
            self.level = 0;
        }

        #[dbus_interface(property)]
        fn level(&self) -> u8 {
            self.level
        }

        #[dbus_interface(property)]
        fn set_level(&mut self, level: u8) {
            self.level = level;
        }
    }

    type ManagedObjects = HashMap<OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>>;

    struct Manager;

    #[dbus_interface(name = "org.freedesktop.DBus.ObjectManager")]
    impl Manager {
        fn get_managed_objects(&self) -> ManagedObjects {
            let mut thing = HashMap::new();
            thing.insert("Level".to_string(), OwnedValue::from(Value::from(7u8)));
            let mut interfaces = HashMap::new();
            interfaces.insert("org.example.Thing".to_string(), thing);

            let mut objects = ManagedObjects::new();
            objects.insert(object_path("/obj"), interfaces);
            objects.insert(object_path("/obj/empty"), HashMap::new());
            objects
        }
    }

    fn object_path(path: &str) -> OwnedObjectPath {
        ObjectPath::try_from(path).unwrap().into()
    }

    /// Returns the serving end, which must be kept alive, and a [`Session`] connected to it.
    ///
    /// The peer exports `org.example.Thing` (property `Level`, initially 7) at `/obj` and an
    /// object manager at `/`.
    pub(crate) fn connect() -> (zbus::Connection, Session) {
        let (server, client) = UnixStream::pair().unwrap();
        let guid = Guid::generate();
        let server = ConnectionBuilder::unix_stream(server)
            .server(&guid)
            .p2p()
            .serve_at("/obj", Thing { level: 7 })
            .unwrap()
            .serve_at("/", Manager)
            .unwrap()
            .build();
        let client = ConnectionBuilder::unix_stream(client).p2p().build();
        let (server, client) =
            pollster::block_on(futures_util::future::try_join(server, client)).unwrap();
        (server, Session::from_connection(client))
    }
}
