//! Constructor tables for [`Interface`] and [`Proxy`] types.
//!
//! A [`Registry`] is assembled once at start-up, before the object tree is built, and shared
//! immutably afterwards:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use busmirror::{InterfaceBase, Interface, Registry, OpaqueProxy, Result};
//! struct Battery {
//!     base: InterfaceBase,
//! }
//!
//! impl Interface for Battery {
//!     fn base(&self) -> &InterfaceBase {
//!         &self.base
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let mut registry = Registry::new();
//! registry.register_interface("org.bluez.Battery1", |bus, path, _props| {
//!     Ok(Battery { base: InterfaceBase::new(bus, path.clone(), "org.bluez.Battery1") })
//! });
//! registry.register_proxy("/org/bluez/hci*/dev_*", |bus, path| {
//!     Ok(OpaqueProxy::new(bus, path.clone()))
//! })?;
//! let registry = Arc::new(registry);
//! # Ok(()) }
//! ```

use std::{collections::HashMap, sync::Arc};

use crate::{path::Path, Bus, Error, Holder, Interface, OpaqueProxy, Proxy, Result};

type InterfaceCtor = Box<dyn Fn(&Bus, &Path, &Holder) -> Result<Arc<dyn Interface>> + Send + Sync>;
type ProxyCtor = Box<dyn Fn(&Bus, &Path) -> Result<Arc<dyn Proxy>> + Send + Sync>;

/// Maps D-Bus interface names to [`Interface`] constructors.
#[derive(Default)]
pub struct InterfaceRegistry {
    ctors: HashMap<String, InterfaceCtor>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for the interface `name`.
    ///
    /// The constructor receives the bus, the object path and the initial `a{sv}` properties.
    /// Registering the same name again replaces the previous constructor.
    pub fn register<T, F>(&mut self, name: impl Into<String>, ctor: F)
    where
        T: Interface,
        F: Fn(&Bus, &Path, &Holder) -> Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let ctor: InterfaceCtor = Box::new(move |bus: &Bus, path: &Path, properties: &Holder| {
            Ok(Arc::new(ctor(bus, path, properties)?) as Arc<dyn Interface>)
        });
        if self.ctors.insert(name.clone(), ctor).is_some() {
            log::debug!("replaced interface constructor for {}", name);
        } else {
            log::debug!("registered interface constructor for {}", name);
        }
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    /// Constructs the interface `name` at `path` and loads `properties` into it.
    ///
    /// Returns `None` if no constructor is registered for `name`. A failing constructor is
    /// reported as a construction failure.
    pub fn create(
        &self,
        name: &str,
        bus: &Bus,
        path: &Path,
        properties: &Holder,
    ) -> Option<Result<Arc<dyn Interface>>> {
        let ctor = self.ctors.get(name)?;
        let result = match ctor(bus, path, properties) {
            Ok(iface) => {
                iface.load(properties);
                Ok(iface)
            }
            Err(e) => Err(Error::construction_failed(
                format!("interface {} at {}", name, path),
                e,
            )),
        };
        Some(result)
    }
}

/// Maps object path patterns to [`Proxy`] constructors.
///
/// A pattern is written like an object path. Each of its elements matches the element at the same
/// depth of a path, either exactly or, if the pattern element ends with `*`, by prefix. A pattern
/// matches every path at or below the paths it describes, except the root pattern `/`, which only
/// matches the root itself.
///
/// When several patterns match, the one with the most elements wins, then the one with the most
/// exactly matched elements.
#[derive(Default)]
pub struct ProxyRegistry {
    entries: Vec<ProxyEntry>,
}

struct ProxyEntry {
    pattern: String,
    elements: Vec<PatternElement>,
    ctor: ProxyCtor,
}

#[derive(Debug, PartialEq)]
enum PatternElement {
    Exact(String),
    Prefix(String),
}

impl PatternElement {
    fn matches(&self, element: &str) -> bool {
        match self {
            Self::Exact(exact) => element == exact,
            Self::Prefix(prefix) => element.starts_with(prefix.as_str()),
        }
    }
}

impl ProxyEntry {
    fn matches(&self, path: &Path) -> bool {
        let elements = path.split_elements();
        if self.elements.is_empty() {
            return elements.is_empty();
        }
        elements.len() >= self.elements.len()
            && self
                .elements
                .iter()
                .zip(&elements)
                .all(|(pattern, element)| pattern.matches(element))
    }

    fn rank(&self) -> (usize, usize) {
        let exact = self
            .elements
            .iter()
            .filter(|e| matches!(e, PatternElement::Exact(_)))
            .count();
        (self.elements.len(), exact)
    }
}

fn parse_pattern(pattern: &str) -> Result<Vec<PatternElement>> {
    let path = Path::new(pattern)?;
    let mut elements = Vec::new();
    for element in path.split_elements() {
        match element.strip_suffix('*') {
            Some(prefix) if prefix.contains('*') => {
                return Err(Error::other(format!(
                    "invalid proxy pattern `{}`: `*` is only allowed at the end of an element",
                    pattern
                )))
            }
            Some(prefix) => elements.push(PatternElement::Prefix(prefix.to_string())),
            None if element.contains('*') => {
                return Err(Error::other(format!(
                    "invalid proxy pattern `{}`: `*` is only allowed at the end of an element",
                    pattern
                )))
            }
            None => elements.push(PatternElement::Exact(element.to_string())),
        }
    }
    Ok(elements)
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the constructor for proxies at paths matching `pattern`.
    ///
    /// Registering the same pattern again replaces the previous constructor.
    ///
    /// # Errors
    ///
    /// Fails if `pattern` is not a valid object path, or uses `*` anywhere but at the end of an
    /// element.
    pub fn register<T, F>(&mut self, pattern: &str, ctor: F) -> Result<()>
    where
        T: Proxy,
        F: Fn(&Bus, &Path) -> Result<T> + Send + Sync + 'static,
    {
        let elements = parse_pattern(pattern)?;
        let ctor: ProxyCtor = Box::new(move |bus: &Bus, path: &Path| {
            Ok(Arc::new(ctor(bus, path)?) as Arc<dyn Proxy>)
        });
        let entry = ProxyEntry {
            pattern: pattern.to_string(),
            elements,
            ctor,
        };

        match self.entries.iter_mut().find(|e| e.pattern == pattern) {
            Some(existing) => {
                log::debug!("replaced proxy constructor for {}", pattern);
                *existing = entry;
            }
            None => {
                log::debug!("registered proxy constructor for {}", pattern);
                self.entries.push(entry);
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, pattern: &str) -> bool {
        self.entries.iter().any(|e| e.pattern == pattern)
    }

    /// Constructs the proxy for `path`, using the best matching pattern or else an
    /// [`OpaqueProxy`].
    pub fn create(&self, bus: &Bus, path: &Path) -> Result<Arc<dyn Proxy>> {
        let best = self
            .entries
            .iter()
            .filter(|e| e.matches(path))
            .max_by_key(|e| e.rank());

        match best {
            Some(entry) => {
                log::trace!("creating proxy for {} from pattern {}", path, entry.pattern);
                (entry.ctor)(bus, path)
                    .map_err(|e| Error::construction_failed(format!("proxy at {}", path), e))
            }
            None => Ok(Arc::new(OpaqueProxy::new(bus, path.clone()))),
        }
    }
}

/// The interface and proxy constructors used to materialize an object tree.
#[derive(Default)]
pub struct Registry {
    interfaces: InterfaceRegistry,
    proxies: ProxyRegistry,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interfaces(&self) -> &InterfaceRegistry {
        &self.interfaces
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    /// See [`InterfaceRegistry::register`].
    pub fn register_interface<T, F>(&mut self, name: impl Into<String>, ctor: F) -> &mut Self
    where
        T: Interface,
        F: Fn(&Bus, &Path, &Holder) -> Result<T> + Send + Sync + 'static,
    {
        self.interfaces.register(name, ctor);
        self
    }

    /// See [`ProxyRegistry::register`].
    pub fn register_proxy<T, F>(&mut self, pattern: &str, ctor: F) -> Result<&mut Self>
    where
        T: Proxy,
        F: Fn(&Bus, &Path) -> Result<T> + Send + Sync + 'static,
    {
        self.proxies.register(pattern, ctor)?;
        Ok(self)
    }
}
