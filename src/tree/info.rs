//! Metadata attached to a config item

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of value a config item holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    #[default]
    Other,
    Group,
    Blob,
    Number,
    Bool,
    Enum,
    String,
}

impl ConfigType {
    pub fn from_raw(value: i32) -> Self {
        match value {
            1 => ConfigType::Group,
            2 => ConfigType::Blob,
            3 => ConfigType::Number,
            4 => ConfigType::Bool,
            5 => ConfigType::Enum,
            6 => ConfigType::String,
            _ => ConfigType::Other,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            ConfigType::Other => 0,
            ConfigType::Group => 1,
            ConfigType::Blob => 2,
            ConfigType::Number => 3,
            ConfigType::Bool => 4,
            ConfigType::Enum => 5,
            ConfigType::String => 6,
        }
    }
}

impl fmt::Display for ConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigType::Other => "other",
            ConfigType::Group => "group",
            ConfigType::Blob => "blob",
            ConfigType::Number => "number",
            ConfigType::Bool => "bool",
            ConfigType::Enum => "enum",
            ConfigType::String => "string",
        };
        f.write_str(name)
    }
}

/// Full metadata record for a config item
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub name: String,
    pub title: String,
    #[serde(rename = "type")]
    pub config_type: ConfigType,
    /// Numeric bounds, meaningful for number and enum items
    pub min: f64,
    pub max: f64,
    pub step: f64,
    pub unit: String,
    /// Serialized choice list, `;` separated
    pub options: String,
    /// Bit `i` set means choice `i` is currently unavailable
    pub disabled_options: u64,
}

impl ConfigInfo {
    pub fn group(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            config_type: ConfigType::Group,
            ..Default::default()
        }
    }

    pub fn number(name: impl Into<String>, title: impl Into<String>, min: f64, max: f64, step: f64, unit: &str) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            config_type: ConfigType::Number,
            min,
            max,
            step,
            unit: unit.to_string(),
            ..Default::default()
        }
    }

    /// Enumerated choice item; bounds index the option list
    pub fn choice(name: impl Into<String>, title: impl Into<String>, options: &[&str]) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            config_type: ConfigType::Enum,
            min: 0.0,
            max: options.len().saturating_sub(1) as f64,
            step: 1.0,
            options: options.join(";"),
            ..Default::default()
        }
    }

    pub fn text(name: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: title.into(),
            config_type: ConfigType::String,
            ..Default::default()
        }
    }

    pub fn is_group(&self) -> bool {
        self.config_type == ConfigType::Group
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.config_type, ConfigType::Number | ConfigType::Enum | ConfigType::Bool)
    }

    /// Value lies inside `[min, max]`
    pub fn in_range(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    pub fn option_list(&self) -> Vec<&str> {
        if self.options.is_empty() {
            return Vec::new();
        }
        self.options.split(';').collect()
    }

    pub fn option_index(&self, option: &str) -> Option<usize> {
        self.option_list().iter().position(|o| *o == option)
    }

    pub fn is_option_disabled(&self, index: usize) -> bool {
        index < 64 && self.disabled_options & (1u64 << index) != 0
    }

    pub fn enabled_options(&self) -> Vec<&str> {
        self.option_list()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !self.is_option_disabled(*i))
            .map(|(_, o)| o)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_codes() {
        for raw in 0..7 {
            assert_eq!(ConfigType::from_raw(raw).raw(), raw);
        }
        assert_eq!(ConfigType::from_raw(42), ConfigType::Other);
    }

    #[test]
    fn test_options() {
        let mut info = ConfigInfo::choice("receiverchannel", "Receiver Channel", &["Rx1", "Rx2", "Rx1+Rx2"]);
        info.disabled_options = 0b010;

        assert_eq!(info.option_list(), vec!["Rx1", "Rx2", "Rx1+Rx2"]);
        assert_eq!(info.option_index("Rx1+Rx2"), Some(2));
        assert_eq!(info.option_index("rx1"), None);
        assert!(info.is_option_disabled(1));
        assert_eq!(info.enabled_options(), vec!["Rx1", "Rx1+Rx2"]);
        assert_eq!(info.max, 2.0);
    }

    #[test]
    fn test_empty_options() {
        let info = ConfigInfo::text("serial", "Serial");
        assert!(info.option_list().is_empty());
        assert!(!info.is_numeric());
    }
}
