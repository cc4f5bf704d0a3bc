//! A live, typed mirror of a remote D-Bus object tree.
//!
//! Services like BlueZ or NetworkManager publish a whole hierarchy of objects through
//! `org.freedesktop.DBus.ObjectManager`. This crate keeps a local copy of such a hierarchy up to
//! date and lets applications plug in their own types for the objects ([`Proxy`]) and interfaces
//! ([`Interface`]) they care about.
//!
//! The moving parts:
//!
//! - [`Holder`] is a self-describing D-Bus value, used for properties and method arguments.
//! - [`Path`] is a validated object path with the ancestry queries the tree needs.
//! - [`Registry`] maps interface names and path patterns to user-supplied constructors.
//! - [`ObjectTree`] owns the root [`Proxy`] and applies `InterfacesAdded`, `InterfacesRemoved` and
//!   `PropertiesChanged` notifications ([`Signal`]) to it.
//!
//! [`signal::watch`] wires all of this up to a real bus connection ([`Session`]).

mod connection;
mod error;
pub mod holder;
mod interface;
pub mod path;
mod proxy;
mod registry;
pub mod signal;
mod tree;
pub mod wire;

use std::{any::Any, sync::Arc};

pub use connection::{Connection, MethodCall};
pub use error::{Error, Result};
pub use holder::{Holder, HolderType};
pub use interface::{Interface, InterfaceBase, InterfaceExt, OpaqueInterface};
pub use path::Path;
pub use proxy::{InterfaceSet, OpaqueProxy, Proxy, ProxyBase};
pub use registry::{InterfaceRegistry, ProxyRegistry, Registry};
pub use signal::Signal;
pub use tree::ObjectTree;

/// A cloneable handle to a D-Bus connection.
///
/// [`Session`] implements [`Connection`] by issuing blocking calls over the same connection that
/// [`signal::watch`] uses to receive notifications. Those blocking calls (every remote operation of
/// an [`Interface`], and [`ObjectTree::load_managed_objects`]) must be made off the async runtime's
/// threads.
#[derive(Clone)]
pub struct Session {
    conn: zbus::Connection,
    blocking: zbus::blocking::Connection,
}

impl Session {
    /// Creates a new connection to the system bus.
    pub async fn new() -> Result<Self> {
        Ok(Self::from_connection(
            zbus::Connection::system().await.map_err(Error::from)?,
        ))
    }

    /// Creates a new connection to the session bus.
    pub async fn new_session_bus() -> Result<Self> {
        Ok(Self::from_connection(
            zbus::Connection::session().await.map_err(Error::from)?,
        ))
    }

    /// Wraps an existing zbus connection.
    pub fn from_connection(conn: zbus::Connection) -> Self {
        Self {
            blocking: conn.clone().into(),
            conn,
        }
    }

    pub fn conn(&self) -> &zbus::Connection {
        &self.conn
    }
}

/// A remote peer on the bus, as seen by the object tree.
///
/// Bundles the [`Connection`] used to reach the peer, its well-known bus name, and the
/// [`Registry`] that decides which types materialize its objects. Every [`Proxy`] and
/// [`Interface`] in a tree holds a clone.
#[derive(Clone)]
pub struct Bus {
    connection: Arc<dyn Connection>,
    name: String,
    registry: Arc<Registry>,
}

impl Bus {
    pub fn new(
        connection: Arc<dyn Connection>,
        name: impl Into<String>,
        registry: Arc<Registry>,
    ) -> Self {
        Self {
            connection,
            name: name.into(),
            registry,
        }
    }

    /// Creates a [`Bus`] that talks to the peer `name` through `session`.
    pub fn from_session(session: &Session, name: impl Into<String>, registry: Arc<Registry>) -> Self {
        Self::new(Arc::new(session.clone()), name, registry)
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Returns the bus name of the remote peer.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

/// Upcasting to [`Any`], so that trait objects of user types can be downcast again.
///
/// Implemented for every eligible type; there is no need to implement it by hand.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

pub(crate) fn downcast<T: Any + Send + Sync, U: AsAny + ?Sized>(value: Arc<U>) -> Option<Arc<T>> {
    value.into_any().downcast::<T>().ok()
}
