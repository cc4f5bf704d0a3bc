//! Mirrors the BlueZ object tree and logs battery level changes of connected devices.

use std::sync::Arc;

use busmirror::{
    signal, Bus, Interface, InterfaceBase, InterfaceExt, ObjectTree, Path, Proxy, ProxyBase,
    Registry, Session,
};

const BATTERY: &str = "org.bluez.Battery1";

struct Battery {
    base: InterfaceBase,
}

impl Battery {
    fn percentage(&self) -> busmirror::Result<u8> {
        self.get("Percentage")
    }
}

impl Interface for Battery {
    fn base(&self) -> &InterfaceBase {
        &self.base
    }

    fn property_changed(&self, name: &str) {
        if name == "Percentage" {
            match self.percentage() {
                Ok(level) => log::info!("{}: battery at {}%", self.path(), level),
                Err(e) => log::warn!("{}: unreadable battery level: {}", self.path(), e),
            }
        }
    }
}

struct Adapter {
    base: ProxyBase,
}

impl Proxy for Adapter {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn on_child_created(&self, child: &Arc<dyn Proxy>) {
        log::info!("{}: found {}", self.path(), child.path());
    }

    fn on_child_removed(&self, child: &Arc<dyn Proxy>) {
        log::info!("{}: lost {}", self.path(), child.path());
    }
}

/// A device, or anything below one.
struct Device {
    base: ProxyBase,
}

impl Proxy for Device {
    fn base(&self) -> &ProxyBase {
        &self.base
    }
}

#[pollster::main]
async fn main() -> busmirror::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let mut registry = Registry::new();
    registry.register_interface(BATTERY, |bus, path, _| {
        Ok(Battery {
            base: InterfaceBase::new(bus, path.clone(), BATTERY),
        })
    });
    registry
        .register_proxy("/org/bluez/hci*", |bus, path| {
            Ok(Adapter {
                base: ProxyBase::new(bus, path.clone()),
            })
        })?
        .register_proxy("/org/bluez/hci*/dev_*", |bus, path| {
            Ok(Device {
                base: ProxyBase::new(bus, path.clone()),
            })
        })?;

    let session = Session::new().await?;
    let bus = Bus::from_session(&session, "org.bluez", Arc::new(registry));
    let tree = ObjectTree::new(bus)?;

    signal::watch(&session, &tree, &Path::root()).await
}
