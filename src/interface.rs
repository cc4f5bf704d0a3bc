//! Cached D-Bus interfaces.
//!
//! An [`Interface`] mirrors one D-Bus interface of one remote object. It keeps the last known value
//! of every property it has seen, merged from the initial `InterfacesAdded` announcement, from
//! `PropertiesChanged` signals, and from explicit refreshes.
//!
//! Types implementing [`Interface`] embed an [`InterfaceBase`] and may override
//! [`Interface::property_changed`] to react to property updates. The hook is always invoked after
//! the property cache has been updated and its lock released, so it may freely read the cache
//! again.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

use crate::{
    holder::FromHolder, path::Path, AsAny, Bus, Error, Holder, MethodCall, Result,
};

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// State shared by every [`Interface`] implementation.
pub struct InterfaceBase {
    bus: Bus,
    path: Path,
    name: String,
    loaded: AtomicBool,
    cache: Mutex<PropertyCache>,
}

#[derive(Default)]
struct PropertyCache {
    values: BTreeMap<String, Holder>,
    // `false` once invalidated by the remote, until the next successful fetch.
    valid: BTreeMap<String, bool>,
}

impl PropertyCache {
    fn is_known(&self, name: &str) -> bool {
        self.values.contains_key(name) || self.valid.contains_key(name)
    }
}

impl InterfaceBase {
    /// Creates the state of the interface `name` at `path`, in the unloaded state.
    pub fn new(bus: &Bus, path: Path, name: impl Into<String>) -> Self {
        Self {
            bus: bus.clone(),
            path,
            name: name.into(),
            loaded: AtomicBool::new(false),
            cache: Mutex::new(PropertyCache::default()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the D-Bus interface name, eg. `org.bluez.Device1`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the cached value of a property, if it was ever observed.
    pub fn property(&self, name: &str) -> Option<Holder> {
        self.lock().values.get(name).cloned()
    }

    /// Returns whether the cached value of a property is current.
    ///
    /// A property is not valid if it was never observed, or if the remote object invalidated it
    /// and it hasn't been fetched since.
    pub fn property_valid(&self, name: &str) -> bool {
        self.lock().valid.get(name).copied().unwrap_or(false)
    }

    /// Returns the names of all cached properties.
    pub fn property_names(&self) -> Vec<String> {
        self.lock().values.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, PropertyCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn properties_call(&self, method: &str) -> MethodCall {
        let mut call = MethodCall::new(
            self.bus.name(),
            self.path.clone(),
            PROPERTIES_INTERFACE,
            method,
        );
        call.append_argument(self.name.as_str(), "s");
        call
    }
}

/// A D-Bus interface instance at a specific object path.
pub trait Interface: AsAny {
    fn base(&self) -> &InterfaceBase;

    /// Invoked once per updated property, after the cache reflects the update.
    ///
    /// Does nothing by default.
    fn property_changed(&self, name: &str) {
        let _ = name;
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn path(&self) -> &Path {
        self.base().path()
    }

    /// Merges a `a{sv}` dictionary of properties into the cache and marks the interface loaded.
    ///
    /// Every merged property becomes valid, and [`Interface::property_changed`] is invoked once per
    /// property name, in the order they appear in `properties`.
    fn load(&self, properties: &Holder) {
        let base = self.base();
        let mut updated: Vec<String> = Vec::new();
        {
            let mut cache = base.lock();
            for (name, value) in properties.dict_iter::<String>() {
                cache.values.insert(name.clone(), value.clone());
                cache.valid.insert(name.clone(), true);
                if !updated.contains(&name) {
                    updated.push(name);
                }
            }
            base.loaded.store(true, Ordering::SeqCst);
        }

        for name in &updated {
            self.property_changed(name);
        }
    }

    /// Marks the interface as unloaded, typically because the remote object dropped it.
    ///
    /// The cached properties stay readable.
    fn unload(&self) {
        self.base().loaded.store(false, Ordering::SeqCst);
    }

    fn is_loaded(&self) -> bool {
        self.base().loaded.load(Ordering::SeqCst)
    }

    /// Fetches the current value of a property from the remote object.
    ///
    /// Does nothing if the interface is unloaded or the property was never observed. Failures are
    /// logged and swallowed, leaving the cached value in place and marking it valid: the usual
    /// cause is that the remote object was removed while the call was in flight, and the removal
    /// signal will follow.
    fn property_refresh(&self, name: &str) {
        if !self.is_loaded() {
            return;
        }

        let base = self.base();
        let changed = {
            let mut cache = base.lock();
            if !cache.is_known(name) {
                return;
            }

            match self.property_get(name) {
                Ok(latest) => {
                    cache.valid.insert(name.to_string(), true);
                    if cache.values.get(name) != Some(&latest) {
                        cache.values.insert(name.to_string(), latest);
                        true
                    } else {
                        false
                    }
                }
                Err(e) => {
                    if e.is_send_failed() {
                        log::debug!("refreshing {} of {} at {} failed: {}", name, base.name, base.path, e);
                    } else {
                        log::warn!("refreshing {} of {} at {} failed: {}", name, base.name, base.path, e);
                    }
                    cache.valid.insert(name.to_string(), true);
                    false
                }
            }
        };

        if changed {
            self.property_changed(name);
        }
    }

    /// Applies a `PropertiesChanged` notification.
    ///
    /// `changed` is a `a{sv}` dictionary of new values, `invalidated` an array of property names
    /// whose values are no longer current (their last known value stays cached). Ignored while the
    /// interface is unloaded.
    fn signal_property_changed(&self, changed: &Holder, invalidated: &Holder) {
        if !self.is_loaded() {
            log::trace!("ignoring property change of unloaded {} at {}", self.name(), self.path());
            return;
        }

        let base = self.base();
        let mut updated: Vec<String> = Vec::new();
        {
            let mut cache = base.lock();
            for (name, value) in changed.dict_iter::<String>() {
                cache.values.insert(name.clone(), value.clone());
                cache.valid.insert(name.clone(), true);
                if !updated.contains(&name) {
                    updated.push(name);
                }
            }
            for name in invalidated.array_iter().filter_map(|h| h.get::<String>().ok()) {
                cache.valid.insert(name, false);
            }
        }

        for name in &updated {
            self.property_changed(name);
        }
    }

    /// Calls `org.freedesktop.DBus.Properties.Get` for a property of this interface.
    ///
    /// The cache is not touched.
    fn property_get(&self, name: &str) -> Result<Holder> {
        let mut call = self.base().properties_call("Get");
        call.append_argument(name, "s");
        self.call(&call)
    }

    /// Calls `org.freedesktop.DBus.Properties.GetAll` for this interface.
    ///
    /// Returns the `a{sv}` dictionary of all properties. The cache is not touched.
    fn property_get_all(&self) -> Result<Holder> {
        let call = self.base().properties_call("GetAll");
        self.call(&call)
    }

    /// Calls `org.freedesktop.DBus.Properties.Set` for a property of this interface.
    ///
    /// The cache is not updated: the new value arrives through a later change notification or
    /// refresh.
    fn property_set(&self, name: &str, value: Holder) -> Result<()> {
        let base = self.base();
        let mut call = base.properties_call("Set");
        call.append_argument(name, "s");
        call.append_argument(value, "v");

        let _cache = base.lock();
        self.call(&call)?;
        Ok(())
    }

    /// Fetches every property from the remote object and [`load`][Interface::load]s them.
    fn reload(&self) -> Result<()> {
        let properties = self.property_get_all()?;
        self.load(&properties);
        Ok(())
    }

    /// Creates a call of `method` on this interface of the remote object.
    fn create_method_call(&self, method: &str) -> MethodCall {
        let base = self.base();
        MethodCall::new(base.bus.name(), base.path.clone(), base.name.as_str(), method)
    }

    /// Sends a method call and waits for the reply.
    fn call(&self, call: &MethodCall) -> Result<Holder> {
        self.base().bus.connection().send_with_reply_and_block(call)
    }
}

/// Typed property accessors, available on every [`Interface`].
pub trait InterfaceExt: Interface {
    /// Returns the cached value of a property.
    ///
    /// # Errors
    ///
    /// Fails if the property was never observed, or if it does not hold a `T`.
    fn get<T: FromHolder>(&self, name: &str) -> Result<T> {
        let base = self.base();
        let cache = base.lock();
        match cache.values.get(name) {
            Some(value) => value.get(),
            None => Err(Error::not_found(format!(
                "property `{}` of {} at {}",
                name, base.name, base.path
            ))),
        }
    }

    /// Refreshes a property from the remote object, then returns its cached value.
    fn refresh_and_get<T: FromHolder>(&self, name: &str) -> Result<T> {
        self.property_refresh(name);
        self.get(name)
    }

    /// Sets a property on the remote object.
    ///
    /// See [`Interface::property_set`].
    fn set<T: Into<Holder>>(&self, name: &str, value: T) -> Result<()> {
        self.property_set(name, value.into())
    }
}

impl<I: Interface + ?Sized> InterfaceExt for I {}

/// The [`Interface`] used for interface names without a registered constructor.
///
/// It caches properties like any other interface but reacts to nothing.
pub struct OpaqueInterface {
    base: InterfaceBase,
}

impl OpaqueInterface {
    pub fn new(bus: &Bus, path: Path, name: impl Into<String>) -> Self {
        Self {
            base: InterfaceBase::new(bus, path, name),
        }
    }
}

impl Interface for OpaqueInterface {
    fn base(&self) -> &InterfaceBase {
        &self.base
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{connection::mock::MockConnection, Registry};

    /// Records every `property_changed` call together with the value cached at that time.
    pub(crate) struct Recorder {
        base: InterfaceBase,
        pub(crate) seen: Mutex<Vec<(String, Option<Holder>)>>,
    }

    impl Recorder {
        pub(crate) fn new(bus: &Bus, path: Path, name: &str) -> Self {
            Self {
                base: InterfaceBase::new(bus, path, name),
                seen: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn seen(&self) -> Vec<(String, Option<Holder>)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Interface for Recorder {
        fn base(&self) -> &InterfaceBase {
            &self.base
        }

        fn property_changed(&self, name: &str) {
            // Reading the cache here deadlocks unless the lock was released first.
            let value = self.base.property(name);
            self.seen.lock().unwrap().push((name.to_string(), value));
        }
    }

    fn recorder(conn: &Arc<MockConnection>) -> Recorder {
        let bus = conn.bus(Arc::new(Registry::new()));
        Recorder::new(&bus, Path::new("/org/example/obj").unwrap(), "org.example.Thing")
    }

    fn props(entries: &[(&str, Holder)]) -> Holder {
        let mut dict = Holder::dict();
        for (name, value) in entries {
            dict.dict_append(*name, value.clone());
        }
        dict
    }

    #[test]
    fn load() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        assert!(!iface.is_loaded());

        iface.load(&props(&[
            ("Name", Holder::create("sensor")),
            ("Level", Holder::create(80u8)),
        ]));

        assert!(iface.is_loaded());
        assert_eq!(iface.get::<String>("Name").unwrap(), "sensor");
        assert_eq!(iface.get::<u8>("Level").unwrap(), 80);
        assert!(iface.base().property_valid("Level"));
        assert_eq!(
            iface.seen(),
            [
                ("Name".to_string(), Some(Holder::create("sensor"))),
                ("Level".to_string(), Some(Holder::create(80u8))),
            ]
        );
        assert!(conn.calls().is_empty());

        iface.unload();
        assert!(!iface.is_loaded());
        assert_eq!(iface.get::<u8>("Level").unwrap(), 80);
    }

    #[test]
    fn typed_get() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        iface.load(&props(&[("Level", Holder::create(80u8))]));

        assert!(iface.get::<String>("Level").unwrap_err().is_wrong_variant_type());
        assert!(iface.get::<u8>("Missing").unwrap_err().is_not_found());
    }

    #[test]
    fn signal_property_changed() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        iface.load(&Holder::dict());

        iface.signal_property_changed(&props(&[("X", Holder::create(5i32))]), &Holder::array());
        assert_eq!(iface.seen(), [("X".to_string(), Some(Holder::create(5i32)))]);
        assert_eq!(iface.get::<i32>("X").unwrap(), 5);
    }

    #[test]
    fn invalidation() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        iface.load(&props(&[("RSSI", Holder::create(-40i16))]));
        iface.seen.lock().unwrap().clear();

        iface.signal_property_changed(&Holder::dict(), &Holder::create(vec!["RSSI"]));
        assert!(!iface.base().property_valid("RSSI"));
        assert_eq!(iface.get::<i16>("RSSI").unwrap(), -40);
        assert!(iface.seen().is_empty());
    }

    #[test]
    fn signal_ignored_when_unloaded() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);

        iface.signal_property_changed(&props(&[("X", Holder::create(5i32))]), &Holder::array());
        assert!(iface.seen().is_empty());
        assert!(iface.base().property("X").is_none());
    }

    #[test]
    fn refresh_swallows_send_failure() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        iface.load(&props(&[("Level", Holder::create(80u8))]));
        iface.signal_property_changed(&Holder::dict(), &Holder::create(vec!["Level"]));
        iface.seen.lock().unwrap().clear();

        iface.property_refresh("Level");

        assert_eq!(conn.methods(), ["org.freedesktop.DBus.Properties.Get"]);
        assert_eq!(iface.get::<u8>("Level").unwrap(), 80);
        assert!(iface.base().property_valid("Level"));
        assert!(iface.seen().is_empty());
    }

    #[test]
    fn refresh_updates_changed_value() {
        let conn = MockConnection::new(|call| {
            assert_eq!(call.method(), "Get");
            assert_eq!(call.arguments()[0].0, Holder::create("org.example.Thing"));
            assert_eq!(call.arguments()[1].0, Holder::create("Level"));
            Ok(Holder::create(75u8))
        });
        let iface = recorder(&conn);
        iface.load(&props(&[("Level", Holder::create(80u8))]));
        iface.seen.lock().unwrap().clear();

        assert_eq!(iface.refresh_and_get::<u8>("Level").unwrap(), 75);
        assert_eq!(iface.seen(), [("Level".to_string(), Some(Holder::create(75u8)))]);

        // Same value again: no notification.
        iface.property_refresh("Level");
        assert_eq!(iface.seen().len(), 1);
        assert_eq!(conn.calls().len(), 2);
    }

    #[test]
    fn refresh_noop() {
        let conn = MockConnection::new(|_| Ok(Holder::create(1u8)));
        let iface = recorder(&conn);

        // Unloaded.
        iface.property_refresh("Level");
        assert!(conn.calls().is_empty());

        // Never observed.
        iface.load(&Holder::dict());
        iface.property_refresh("Level");
        assert!(conn.calls().is_empty());
        assert!(iface.base().property("Level").is_none());
    }

    #[test]
    fn set_leaves_cache() {
        let conn = MockConnection::new(|_| Ok(Holder::none()));
        let iface = recorder(&conn);
        iface.load(&props(&[("Alias", Holder::create("old"))]));

        iface.set("Alias", "new").unwrap();

        let calls = conn.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].interface(), "org.freedesktop.DBus.Properties");
        assert_eq!(calls[0].method(), "Set");
        assert_eq!(calls[0].arguments()[2], (Holder::create("new"), "v".to_string()));
        assert_eq!(iface.get::<String>("Alias").unwrap(), "old");
    }

    #[test]
    fn set_propagates_failure() {
        let conn = MockConnection::failing();
        let iface = recorder(&conn);
        assert!(iface.set("Alias", "new").unwrap_err().is_send_failed());
    }

    #[test]
    fn reload() {
        let conn = MockConnection::new(|call| {
            assert_eq!(call.method(), "GetAll");
            let mut all = Holder::dict();
            all.dict_append("Powered", true);
            Ok(all)
        });
        let iface = recorder(&conn);
        iface.reload().unwrap();
        assert!(iface.is_loaded());
        assert!(iface.get::<bool>("Powered").unwrap());
    }

    #[test]
    fn method_call() {
        let conn = MockConnection::new(|call| {
            assert_eq!(call.bus_name(), "org.example");
            assert_eq!(call.interface(), "org.example.Thing");
            Ok(Holder::create(call.arguments()[0].0.get::<u32>()? * 2))
        });
        let iface = recorder(&conn);
        let mut call = iface.create_method_call("Double");
        call.append_argument(21u32, "u");
        assert_eq!(iface.call(&call).unwrap(), Holder::create(42u32));
    }
}
