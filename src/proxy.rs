//! Nodes of the mirrored object tree.
//!
//! Every object path known to the tree is represented by a [`Proxy`]. A proxy owns the
//! [`Interface`]s announced at its path and the proxies one element below it, so the tree is
//! owned strictly from the root downwards. Nodes are created on demand when an interface is
//! announced somewhere below them, and pruned again once they have neither interfaces nor children.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    downcast, path::Path, AsAny, Bus, Error, Holder, Interface, OpaqueInterface, Result,
};

/// A selection of interfaces to remove from a [`Proxy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceSet {
    All,
    Named(Vec<String>),
}

impl InterfaceSet {
    pub fn named<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Named(names.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Named(names) => names.iter().any(|n| n == name),
        }
    }
}

/// State shared by every [`Proxy`] implementation.
pub struct ProxyBase {
    bus: Bus,
    path: Path,
    valid: AtomicBool,
    node: Mutex<Node>,
}

#[derive(Default)]
struct Node {
    // Keyed by the path element the child adds to this node's path.
    children: BTreeMap<String, Arc<dyn Proxy>>,
    interfaces: BTreeMap<String, Arc<dyn Interface>>,
}

impl ProxyBase {
    pub fn new(bus: &Bus, path: Path) -> Self {
        Self {
            bus: bus.clone(),
            path,
            valid: AtomicBool::new(true),
            node: Mutex::new(Node::default()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the direct children of this node, ordered by path.
    pub fn children(&self) -> Vec<Arc<dyn Proxy>> {
        self.lock().children.values().cloned().collect()
    }

    /// Returns the direct child whose path ends in `element`.
    pub fn child(&self, element: &str) -> Option<Arc<dyn Proxy>> {
        self.lock().children.get(element).cloned()
    }

    /// Returns the direct children that are of type `T`.
    pub fn children_casted<T: Proxy>(&self) -> Vec<Arc<T>> {
        self.children().into_iter().filter_map(downcast::<T, _>).collect()
    }

    pub fn child_count(&self) -> usize {
        self.lock().children.len()
    }

    /// Returns the interfaces of this node, ordered by name.
    pub fn interfaces(&self) -> Vec<Arc<dyn Interface>> {
        self.lock().interfaces.values().cloned().collect()
    }

    /// Returns the interface `name` if it exists and is of type `T`.
    pub fn interface_casted<T: Interface>(&self, name: &str) -> Option<Arc<T>> {
        let iface = self.lock().interfaces.get(name).cloned()?;
        downcast(iface)
    }

    pub fn interface_count(&self) -> usize {
        self.lock().interfaces.len()
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Node> {
        self.node.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A node of the object tree.
///
/// Implementors embed a [`ProxyBase`]. The hooks [`Proxy::on_child_created`] and
/// [`Proxy::on_child_removed`] are invoked without any lock held.
pub trait Proxy: AsAny {
    fn base(&self) -> &ProxyBase;

    /// Invoked after a new direct child was created and populated.
    fn on_child_created(&self, child: &Arc<dyn Proxy>) {
        let _ = child;
    }

    /// Invoked after a direct child was pruned from the tree.
    fn on_child_removed(&self, child: &Arc<dyn Proxy>) {
        let _ = child;
    }

    fn path(&self) -> &Path {
        self.base().path()
    }

    /// Returns `false` once this node has been pruned from its tree.
    fn is_valid(&self) -> bool {
        self.base().valid.load(Ordering::SeqCst)
    }

    /// Returns `true` if this node has neither interfaces nor children.
    fn is_empty(&self) -> bool {
        let node = self.base().lock();
        node.children.is_empty() && node.interfaces.is_empty()
    }

    fn interface_get(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.base().lock().interfaces.get(name).cloned()
    }

    /// Loads an `a{sa{sv}}` dictionary of interfaces and their properties into this node.
    ///
    /// Interfaces that already exist are loaded again with the new properties. New ones are
    /// constructed through the [`InterfaceRegistry`][crate::InterfaceRegistry], falling back to an
    /// [`OpaqueInterface`].
    fn interfaces_load(&self, interfaces: &Holder) -> Result<()> {
        let base = self.base();
        for (name, properties) in interfaces.dict_iter::<String>() {
            if let Some(existing) = self.interface_get(&name) {
                existing.load(properties);
                continue;
            }

            let bus = base.bus();
            let iface = match bus.registry().interfaces().create(&name, bus, base.path(), properties) {
                Some(result) => result?,
                None => {
                    let iface: Arc<dyn Interface> =
                        Arc::new(OpaqueInterface::new(bus, base.path().clone(), name.as_str()));
                    iface.load(properties);
                    iface
                }
            };
            log::debug!("added {} at {}", name, base.path());
            base.lock().interfaces.insert(name, iface);
        }
        Ok(())
    }

    /// Unloads and drops the selected interfaces of this node.
    fn interfaces_unload(&self, interfaces: &InterfaceSet) {
        let removed: Vec<Arc<dyn Interface>> = {
            let mut node = self.base().lock();
            match interfaces {
                InterfaceSet::All => std::mem::take(&mut node.interfaces).into_values().collect(),
                InterfaceSet::Named(names) => names
                    .iter()
                    .filter_map(|name| node.interfaces.remove(name))
                    .collect(),
            }
        };

        for iface in removed {
            log::debug!("removed {} at {}", iface.name(), self.path());
            iface.unload();
        }
    }

    /// Returns the node at `path` below this one.
    ///
    /// Walks down one element at a time. Returns `None` if `path` is this node itself, does not
    /// lie below it, or any node on the way is missing.
    fn descendant(&self, path: &Path) -> Option<Arc<dyn Proxy>> {
        let element = path.next_child_strip(self.path())?;
        let child = self.base().child(element)?;
        if child.path() == path {
            Some(child)
        } else {
            child.descendant(path)
        }
    }

    /// Adds interfaces to the node at `path`, creating it and any missing nodes on the way.
    ///
    /// `interfaces` is an `a{sa{sv}}` dictionary as carried by `InterfacesAdded`. Nodes are
    /// created through the [`ProxyRegistry`][crate::ProxyRegistry].
    ///
    /// # Errors
    ///
    /// Fails if `path` does not lie at or below this node, or if a registered constructor fails.
    ///
    /// Nodes created by the call that end up empty, because `interfaces` is empty or construction
    /// failed, are removed again without notifying [`Proxy::on_child_removed`].
    fn path_add(&self, path: &Path, interfaces: &Holder) -> Result<()> {
        if path == self.path() {
            return self.interfaces_load(interfaces);
        }

        let base = self.base();
        let Some(element) = path.next_child_strip(self.path()) else {
            return Err(Error::other(format!("{} does not lie below {}", path, self.path())));
        };

        if let Some(child) = base.child(element) {
            return child.path_add(path, interfaces);
        }

        let child_path = self.path().join(element)?;
        let child = base.bus().registry().proxies().create(base.bus(), &child_path)?;
        base.lock().children.insert(element.to_string(), child.clone());
        log::debug!("created {}", child_path);

        let result = child.path_add(path, interfaces);
        if child.is_empty() {
            base.lock().children.remove(element);
            child.base().invalidate();
            log::debug!("dropped {}, nothing was added to it", child_path);
        } else {
            self.on_child_created(&child);
        }
        result
    }

    /// Removes interfaces from the node at `path`, then prunes every node on the way that is left
    /// empty.
    ///
    /// This node itself is never pruned by its own call. Paths that aren't in the tree are
    /// ignored.
    fn path_remove(&self, path: &Path, interfaces: &InterfaceSet) {
        if path == self.path() {
            self.interfaces_unload(interfaces);
            return;
        }

        let base = self.base();
        let Some(element) = path.next_child_strip(self.path()) else {
            return;
        };
        let Some(child) = base.child(element) else {
            log::trace!("{} is not in the tree", path);
            return;
        };

        child.path_remove(path, interfaces);
        if child.is_empty() {
            base.lock().children.remove(element);
            child.base().invalidate();
            log::debug!("pruned {}", child.path());
            self.on_child_removed(&child);
        }
    }

    /// Renders this node and everything below it, with its interfaces, for diagnostics.
    fn represent(&self) -> String {
        let base = self.base();
        let mut out = format!("{}\n", base.path());
        for iface in base.interfaces() {
            out.push_str(&format!("  - {}\n", iface.name()));
        }
        for child in base.children() {
            for line in child.represent().lines() {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

/// The [`Proxy`] used for paths without a registered constructor.
pub struct OpaqueProxy {
    base: ProxyBase,
}

impl OpaqueProxy {
    pub fn new(bus: &Bus, path: Path) -> Self {
        Self {
            base: ProxyBase::new(bus, path),
        }
    }
}

impl Proxy for OpaqueProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::mock::MockConnection, interface::tests::Recorder, InterfaceExt, Registry,
    };

    /// Records the paths of created and removed children.
    struct Root {
        base: ProxyBase,
        events: Mutex<Vec<String>>,
    }

    impl Root {
        fn new(bus: &Bus) -> Arc<Self> {
            Arc::new(Self {
                base: ProxyBase::new(bus, Path::root()),
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Proxy for Root {
        fn base(&self) -> &ProxyBase {
            &self.base
        }

        fn on_child_created(&self, child: &Arc<dyn Proxy>) {
            self.events.lock().unwrap().push(format!("+{}", child.path()));
        }

        fn on_child_removed(&self, child: &Arc<dyn Proxy>) {
            self.events.lock().unwrap().push(format!("-{}", child.path()));
        }
    }

    struct Adapter {
        base: ProxyBase,
    }

    impl Proxy for Adapter {
        fn base(&self) -> &ProxyBase {
            &self.base
        }
    }

    struct Device {
        base: ProxyBase,
    }

    impl Proxy for Device {
        fn base(&self) -> &ProxyBase {
            &self.base
        }
    }

    fn p(s: &str) -> Path {
        Path::new(s).unwrap()
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_interface("org.example.Thing", |bus, path, _| {
            Ok(Recorder::new(bus, path.clone(), "org.example.Thing"))
        });
        registry
            .register_proxy("/org/bluez/hci*", |bus, path| {
                Ok(Adapter {
                    base: ProxyBase::new(bus, path.clone()),
                })
            })
            .unwrap();
        registry
            .register_proxy("/org/bluez/hci*/dev_*", |bus, path| {
                Ok(Device {
                    base: ProxyBase::new(bus, path.clone()),
                })
            })
            .unwrap();
        registry
    }

    fn announce(entries: &[(&str, &[(&str, Holder)])]) -> Holder {
        let mut interfaces = Holder::dict();
        for (name, props) in entries {
            let mut dict = Holder::dict();
            for (prop, value) in props.iter() {
                dict.dict_append(*prop, value.clone());
            }
            interfaces.dict_append(*name, dict);
        }
        interfaces
    }

    #[test]
    fn add_creates_path() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(
            &p("/a/b"),
            &announce(&[("org.example.Thing", &[("X", Holder::create(3u32))])]),
        )
        .unwrap();

        let a = root.descendant(&p("/a")).unwrap();
        assert!(a.base().interfaces().is_empty());
        let b = root.descendant(&p("/a/b")).unwrap();
        assert_eq!(b.path(), &p("/a/b"));

        let iface = b.interface_get("org.example.Thing").unwrap();
        assert!(iface.is_loaded());
        assert_eq!(iface.get::<u32>("X").unwrap(), 3);
        assert!(b.base().interface_casted::<Recorder>("org.example.Thing").is_some());
        assert!(b.interface_get("org.example.Other").is_none());

        assert_eq!(root.events(), ["+/a"]);
        assert!(root.descendant(&p("/a/c")).is_none());
        assert!(root.descendant(&p("/")).is_none());
    }

    #[test]
    fn unregistered_interface_is_opaque() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(
            &p("/a"),
            &announce(&[("org.example.Other", &[("Y", Holder::create("y"))])]),
        )
        .unwrap();
        let a = root.descendant(&p("/a")).unwrap();
        let iface = a.base().interface_casted::<OpaqueInterface>("org.example.Other").unwrap();
        assert_eq!(iface.get::<String>("Y").unwrap(), "y");
    }

    #[test]
    fn add_existing_reloads() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(
            &p("/a"),
            &announce(&[("org.example.Thing", &[("X", Holder::create(1u8))])]),
        )
        .unwrap();
        let first = root.descendant(&p("/a")).unwrap().interface_get("org.example.Thing").unwrap();

        root.path_add(
            &p("/a"),
            &announce(&[("org.example.Thing", &[("Y", Holder::create(2u8))])]),
        )
        .unwrap();
        let second = root.descendant(&p("/a")).unwrap().interface_get("org.example.Thing").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.get::<u8>("X").unwrap(), 1);
        assert_eq!(second.get::<u8>("Y").unwrap(), 2);
        assert_eq!(root.events(), ["+/a"]);
    }

    #[test]
    fn remove_prunes_upwards() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(&p("/a/b/c"), &announce(&[("org.example.Thing", &[])]))
            .unwrap();
        let c = root.descendant(&p("/a/b/c")).unwrap();
        let iface = c.interface_get("org.example.Thing").unwrap();

        root.path_remove(&p("/a/b/c"), &InterfaceSet::named(["org.example.Thing"]));

        assert!(root.descendant(&p("/a/b/c")).is_none());
        assert!(root.descendant(&p("/a")).is_none());
        assert!(root.is_empty());
        assert!(root.is_valid());
        assert!(!c.is_valid());
        assert!(!iface.is_loaded());
        assert_eq!(root.events(), ["+/a", "-/a"]);
    }

    #[test]
    fn remove_keeps_nonempty_nodes() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(
            &p("/a"),
            &announce(&[("org.example.Thing", &[]), ("org.example.Other", &[])]),
        )
        .unwrap();
        root.path_add(&p("/a/b"), &announce(&[("org.example.Thing", &[])]))
            .unwrap();

        root.path_remove(&p("/a"), &InterfaceSet::named(["org.example.Thing"]));
        let a = root.descendant(&p("/a")).unwrap();
        assert_eq!(a.base().interface_count(), 1);

        root.path_remove(&p("/a"), &InterfaceSet::All);
        let a = root.descendant(&p("/a")).unwrap();
        assert_eq!(a.base().interface_count(), 0);
        assert_eq!(a.base().child_count(), 1);

        root.path_remove(&p("/a/b"), &InterfaceSet::All);
        assert!(root.descendant(&p("/a")).is_none());

        // Unknown paths are ignored.
        root.path_remove(&p("/x/y"), &InterfaceSet::All);
        assert_eq!(root.events(), ["+/a", "-/a"]);
    }

    #[test]
    fn typed_children() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);
        let thing = announce(&[("org.example.Thing", &[])]);

        root.path_add(&p("/org/bluez/hci0"), &thing).unwrap();
        root.path_add(&p("/org/bluez/hci0/dev_11"), &thing).unwrap();
        root.path_add(&p("/org/bluez/hci0/dev_22"), &thing).unwrap();
        root.path_add(&p("/org/bluez/hci0/other"), &thing).unwrap();

        let bluez = root.descendant(&p("/org/bluez")).unwrap();
        assert_eq!(bluez.base().children_casted::<Adapter>().len(), 1);
        assert!(bluez.base().children_casted::<Device>().is_empty());

        let adapter = root.descendant(&p("/org/bluez/hci0")).unwrap();
        let devices = adapter.base().children_casted::<Device>();
        let paths: Vec<&str> = devices.iter().map(|d| d.path().as_str()).collect();
        assert_eq!(paths, ["/org/bluez/hci0/dev_11", "/org/bluez/hci0/dev_22"]);
        assert_eq!(adapter.base().children_casted::<Adapter>().len(), 1);
        assert_eq!(adapter.base().child_count(), 3);
    }

    #[test]
    fn failed_add_drops_new_nodes() {
        let mut registry = registry();
        registry.register_interface::<Recorder, _>("org.example.Broken", |_, _, _| {
            Err(Error::other("refusing"))
        });
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry));
        let root = Root::new(&bus);

        root.path_add(&p("/a"), &announce(&[("org.example.Thing", &[])]))
            .unwrap();
        let err = root
            .path_add(&p("/a/b/c"), &announce(&[("org.example.Broken", &[])]))
            .unwrap_err();
        assert!(err.is_construction_failed());

        assert!(root.descendant(&p("/a/b")).is_none());
        assert!(root.descendant(&p("/a")).is_some());
        assert_eq!(root.events(), ["+/a"]);
    }

    #[test]
    fn add_without_interfaces_leaves_no_nodes() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);

        root.path_add(&p("/a/b"), &Holder::dict()).unwrap();
        assert!(root.descendant(&p("/a")).is_none());
        assert_eq!(root.base().child_count(), 0);
        assert!(root.events().is_empty());

        root.path_add(&p("/a"), &announce(&[("org.example.Thing", &[])]))
            .unwrap();
        root.path_add(&p("/a/b/c"), &Holder::dict()).unwrap();
        assert!(root.descendant(&p("/a/b")).is_none());
        assert_eq!(root.events(), ["+/a"]);
    }

    #[test]
    fn add_outside_subtree() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let node = OpaqueProxy::new(&bus, p("/a"));
        node.path_add(&p("/b/c"), &Holder::dict()).unwrap_err();
    }

    #[test]
    fn represent() {
        let conn = MockConnection::failing();
        let bus = conn.bus(Arc::new(registry()));
        let root = Root::new(&bus);
        root.path_add(&p("/a/b"), &announce(&[("org.example.Thing", &[])]))
            .unwrap();

        assert_eq!(root.represent(), "/\n  /a\n    /a/b\n      - org.example.Thing\n");
    }
}
