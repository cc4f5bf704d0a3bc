use std::sync::Arc;

use crate::{
    downcast, path::Path, Bus, Holder, Interface, InterfaceSet, MethodCall, Proxy, Result, Signal,
};

const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// A live mirror of the objects a remote peer exports.
///
/// The tree starts out with just its root node and grows as interfaces are announced, either by
/// [`ObjectTree::load_managed_objects`] or by [`Signal`]s passed to [`ObjectTree::handle`].
///
/// Mutations of the tree should come from a single place (typically [`crate::signal::watch`]), so
/// that they are applied in the order the remote peer sent them. Lookups and property accessors can
/// be used from any thread.
pub struct ObjectTree {
    bus: Bus,
    root: Arc<dyn Proxy>,
}

impl ObjectTree {
    /// Creates a tree containing only the root node `/`, constructed through the bus' registry.
    pub fn new(bus: Bus) -> Result<Self> {
        let root = bus.registry().proxies().create(&bus, &Path::root())?;
        Ok(Self { bus, root })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn root(&self) -> &Arc<dyn Proxy> {
        &self.root
    }

    /// See [`Proxy::path_add`].
    pub fn path_add(&self, path: &Path, interfaces: &Holder) -> Result<()> {
        self.root.path_add(path, interfaces)
    }

    /// See [`Proxy::path_remove`].
    pub fn path_remove(&self, path: &Path, interfaces: &InterfaceSet) {
        self.root.path_remove(path, interfaces)
    }

    /// Returns the node at `path`, or `None` if it is not in the tree.
    pub fn path_get(&self, path: &Path) -> Option<Arc<dyn Proxy>> {
        if path.is_root() {
            return Some(self.root.clone());
        }
        self.root.descendant(path)
    }

    /// Returns the node at `path` if it exists and is of type `T`.
    pub fn path_get_casted<T: Proxy>(&self, path: &Path) -> Option<Arc<T>> {
        downcast(self.path_get(path)?)
    }

    /// Returns the interface `name` of the node at `path`.
    pub fn interface_get(&self, path: &Path, name: &str) -> Option<Arc<dyn Interface>> {
        self.path_get(path)?.interface_get(name)
    }

    /// Returns the interface `name` of the node at `path` if it is of type `T`.
    pub fn interface_get_casted<T: Interface>(&self, path: &Path, name: &str) -> Option<Arc<T>> {
        downcast(self.interface_get(path, name)?)
    }

    /// Applies a notification received from the remote peer.
    ///
    /// Property changes for objects or interfaces that aren't in the tree are ignored.
    pub fn handle(&self, signal: &Signal) -> Result<()> {
        match signal {
            Signal::InterfacesAdded { path, interfaces } => {
                log::trace!("interfaces added at {}", path);
                self.path_add(path, interfaces)
            }
            Signal::InterfacesRemoved { path, interfaces } => {
                log::trace!("interfaces removed at {}: {:?}", path, interfaces);
                self.path_remove(path, interfaces);
                Ok(())
            }
            Signal::PropertiesChanged {
                path,
                interface,
                changed,
                invalidated,
            } => {
                match self.interface_get(path, interface) {
                    Some(iface) => iface.signal_property_changed(changed, invalidated),
                    None => log::trace!("ignoring property change of unknown {} at {}", interface, path),
                }
                Ok(())
            }
        }
    }

    /// Fetches every object below `manager` with `GetManagedObjects` and adds it to the tree.
    ///
    /// Objects without interfaces, and objects that fail to materialize, are skipped. This is a
    /// blocking call; from async code use [`crate::signal::sync`].
    ///
    /// # Errors
    ///
    /// Fails if the call itself fails.
    pub fn load_managed_objects(&self, manager: &Path) -> Result<()> {
        let call = MethodCall::new(
            self.bus.name(),
            manager.clone(),
            OBJECT_MANAGER_INTERFACE,
            "GetManagedObjects",
        );
        let objects = self.bus.connection().send_with_reply_and_block(&call)?;
        self.add_managed_objects(&objects);
        Ok(())
    }

    /// Adds every object of an `a{oa{sa{sv}}}` dictionary, skipping the ones that fail.
    pub(crate) fn add_managed_objects(&self, objects: &Holder) {
        log::debug!("{} reports {} managed objects", self.bus.name(), objects.len());
        for (path, interfaces) in objects.dict_iter::<Path>() {
            if interfaces.is_empty() {
                continue;
            }
            if let Err(e) = self.path_add(&path, interfaces) {
                log::warn!("skipping {}: {}", path, e);
            }
        }
    }

    /// Renders the whole tree for diagnostics.
    pub fn represent(&self) -> String {
        self.root.represent()
    }
}
