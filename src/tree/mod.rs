//! Hierarchical device configuration tree
//!
//! A [`ConfigNode`] is a borrowed view of one item in the device's
//! parameter hierarchy. Nothing is cached: children and siblings are
//! fetched from the driver each time they are asked for, so enumeration
//! restarts from [`ConfigNode::first`] and reflects whatever order the
//! device reports.
//!
//! ```text
//! root
//!  ├── main
//!  │    ├── centerfreq   number  Hz
//!  │    ├── spanfreq     number  Hz
//!  │    └── transgain    number  dB
//!  ├── device
//!  │    ├── receiverchannel  enum  Rx1;Rx2;...
//!  │    └── outputformat     enum  iq;spectra;...
//!  └── calibration
//!       └── ...
//! ```
//!
//! Paths are `/` separated and matched segment by segment against child
//! names, case-sensitive and exact.

pub mod info;

pub use info::{ConfigInfo, ConfigType};

use crate::device::{ConfigHandle, Device, Driver};
use crate::error::DeviceError;
use crate::status::Status;

/// Borrowed handle to a config item
pub struct ConfigNode<'a, D: Driver> {
    device: &'a Device<D>,
    handle: ConfigHandle,
}

impl<'a, D: Driver> Clone for ConfigNode<'a, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, D: Driver> Copy for ConfigNode<'a, D> {}

impl<'a, D: Driver> std::fmt::Debug for ConfigNode<'a, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigNode").field("handle", &self.handle).finish()
    }
}

impl<'a, D: Driver> ConfigNode<'a, D> {
    pub(crate) fn new(device: &'a Device<D>, handle: ConfigHandle) -> Self {
        Self { device, handle }
    }

    pub fn handle(&self) -> ConfigHandle {
        self.handle
    }

    fn driver(&self) -> &'a D {
        self.device.driver()
    }

    fn wrap(&self, reply: (Status, Option<ConfigHandle>)) -> Option<ConfigNode<'a, D>> {
        match reply {
            (status, Some(handle)) if status.is_ok() => Some(ConfigNode::new(self.device, handle)),
            _ => None,
        }
    }

    // --- Navigation ---

    /// First child of a group; `None` for leaves and empty groups
    pub fn first(&self) -> Option<ConfigNode<'a, D>> {
        self.wrap(self.driver().config_first(self.handle))
    }

    /// Next sibling; `None` at the end of the list
    pub fn next(&self) -> Option<ConfigNode<'a, D>> {
        self.wrap(self.driver().config_next(self.handle))
    }

    /// Lazy iterator over the direct children
    pub fn children(&self) -> Children<'a, D> {
        Children { next: self.first() }
    }

    /// Resolve a `/` separated path relative to this node
    ///
    /// Each segment must equal a child name exactly. Returns `None` at the
    /// first segment without a match; an empty segment never matches.
    pub fn find(&self, path: &str) -> Option<ConfigNode<'a, D>> {
        let mut node = *self;
        for segment in path.split('/') {
            if segment.is_empty() {
                return None;
            }
            node = node
                .children()
                .find(|child| child.name().map_or(false, |name| name == segment))?;
        }
        Some(node)
    }

    /// Depth-first listing of every item below this node with its path
    pub fn walk(&self) -> Result<Vec<(String, ConfigInfo)>, DeviceError> {
        let mut items = Vec::new();
        self.walk_into("", &mut items)?;
        Ok(items)
    }

    fn walk_into(&self, prefix: &str, items: &mut Vec<(String, ConfigInfo)>) -> Result<(), DeviceError> {
        for child in self.children() {
            let info = child.info()?;
            let path = if prefix.is_empty() {
                info.name.clone()
            } else {
                format!("{}/{}", prefix, info.name)
            };
            let is_group = info.is_group();
            items.push((path.clone(), info));
            if is_group {
                child.walk_into(&path, items)?;
            }
        }
        Ok(())
    }

    // --- Metadata ---

    pub fn name(&self) -> Result<String, DeviceError> {
        let (status, name) = self.driver().config_name(self.handle);
        self.device.check_config(status, "ConfigGetName")?;
        Ok(name)
    }

    pub fn info(&self) -> Result<ConfigInfo, DeviceError> {
        let (status, info) = self.driver().config_info(self.handle);
        self.device.check_config(status, "ConfigGetInfo")?;
        Ok(info)
    }

    pub fn config_type(&self) -> Result<ConfigType, DeviceError> {
        Ok(self.info()?.config_type)
    }

    // --- Value access ---
    //
    // Setters return the driver's status so an adjusted or disabled value
    // is visible to the caller; values are never clamped here.

    pub fn get_float(&self) -> Result<f64, DeviceError> {
        let (status, value) = self.driver().config_get_float(self.handle);
        self.device.check_config(status, "ConfigGetFloat")?;
        Ok(value)
    }

    pub fn set_float(&self, value: f64) -> Result<Status, DeviceError> {
        let status = self.driver().config_set_float(self.handle, value);
        self.device.check_config(status, "ConfigSetFloat")
    }

    pub fn get_string(&self) -> Result<String, DeviceError> {
        let (status, value) = self.driver().config_get_string(self.handle);
        self.device.check_config(status, "ConfigGetString")?;
        Ok(value)
    }

    pub fn set_string(&self, value: &str) -> Result<Status, DeviceError> {
        let status = self.driver().config_set_string(self.handle, value);
        self.device.check_config(status, "ConfigSetString")
    }

    pub fn get_integer(&self) -> Result<i64, DeviceError> {
        let (status, value) = self.driver().config_get_integer(self.handle);
        self.device.check_config(status, "ConfigGetInteger")?;
        Ok(value)
    }

    pub fn set_integer(&self, value: i64) -> Result<Status, DeviceError> {
        let status = self.driver().config_set_integer(self.handle, value);
        self.device.check_config(status, "ConfigSetInteger")
    }

    /// Current value rendered for display; `None` for groups and blobs
    pub fn display_value(&self) -> Result<Option<String>, DeviceError> {
        let value = match self.config_type()? {
            ConfigType::Number => {
                let info = self.info()?;
                let value = self.get_float()?;
                if info.unit.is_empty() {
                    value.to_string()
                } else {
                    format!("{} {}", value, info.unit)
                }
            }
            ConfigType::Bool => (self.get_integer()? != 0).to_string(),
            ConfigType::Enum | ConfigType::String => self.get_string()?,
            ConfigType::Group | ConfigType::Blob | ConfigType::Other => return Ok(None),
        };
        Ok(Some(value))
    }
}

/// Iterator over the children of a group, fetched one sibling at a time
pub struct Children<'a, D: Driver> {
    next: Option<ConfigNode<'a, D>>,
}

impl<'a, D: Driver> Iterator for Children<'a, D> {
    type Item = ConfigNode<'a, D>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = current.next();
        Some(current)
    }
}
