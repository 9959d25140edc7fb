//! Device resolution
//!
//! Configured device ids always win. Without configuration every device the
//! account reports is processed.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::DetectorError;
use crate::plugins::{Session, TrackerPlugin};
use crate::types::DeviceDescriptor;

/// Reconciles configured device ids with discovered devices
pub struct DeviceResolver<'a> {
    plugin: &'a dyn TrackerPlugin,
}

impl<'a> DeviceResolver<'a> {
    pub fn new(plugin: &'a dyn TrackerPlugin) -> Self {
        Self { plugin }
    }

    /// Final device set for a run, in configuration or discovery order
    pub fn resolve(
        &self,
        session: &Session,
        configured: &[String],
    ) -> Result<Vec<DeviceDescriptor>, DetectorError> {
        let explicit = dedup_ids(configured.iter().map(String::as_str));
        if !explicit.is_empty() {
            return Ok(self.describe(session, explicit));
        }

        let discovered = self.plugin.list_devices(session)?;
        let mut seen = HashSet::new();
        let devices: Vec<DeviceDescriptor> = discovered
            .into_iter()
            .filter(|d| seen.insert(d.id.clone()))
            .collect();

        if devices.is_empty() {
            return Err(DetectorError::NoDevicesFound(format!(
                "no {} devices configured or discovered on the account",
                self.plugin.vendor()
            )));
        }
        debug!(count = devices.len(), "discovered devices");
        Ok(devices)
    }

    /// Descriptors for the configured ids alone, named by id
    pub fn configured(&self, configured: &[String]) -> Vec<DeviceDescriptor> {
        dedup_ids(configured.iter().map(String::as_str))
            .into_iter()
            .map(|id| DeviceDescriptor::new(id.clone(), id, self.plugin.vendor()))
            .collect()
    }

    /// Descriptors for explicit ids, borrowing display names from discovery
    fn describe(&self, session: &Session, ids: Vec<String>) -> Vec<DeviceDescriptor> {
        let names: HashMap<String, String> = match self.plugin.list_devices(session) {
            Ok(devices) => devices.into_iter().map(|d| (d.id, d.display_name)).collect(),
            Err(e) => {
                warn!(error = %e, "device discovery failed, using configured ids as names");
                HashMap::new()
            }
        };

        ids.into_iter()
            .map(|id| {
                let name = names.get(&id).cloned().unwrap_or_else(|| id.clone());
                DeviceDescriptor::new(id, name, self.plugin.vendor())
            })
            .collect()
    }
}

/// Trimmed, non-empty ids with duplicates removed, first occurrence kept
fn dedup_ids<'s>(ids: impl Iterator<Item = &'s str>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.map(str::trim)
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::types::{RawSample, Vendor};
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    struct Account {
        devices: Result<Vec<DeviceDescriptor>, String>,
    }

    impl TrackerPlugin for Account {
        fn vendor(&self) -> Vendor {
            Vendor::Emfit
        }

        fn notification_title(&self) -> &'static str {
            "test"
        }

        fn authenticate(&self, _: &Credentials) -> Result<Session, DetectorError> {
            Ok(Session::new("t"))
        }

        fn list_devices(&self, _: &Session) -> Result<Vec<DeviceDescriptor>, DetectorError> {
            self.devices
                .clone()
                .map_err(DetectorError::TransientFetch)
        }

        fn fetch_metrics(
            &self,
            _: &Session,
            _: &str,
            _: NaiveDate,
            _: NaiveDate,
        ) -> Result<Vec<RawSample>, DetectorError> {
            Ok(Vec::new())
        }
    }

    fn device(id: &str, name: &str) -> DeviceDescriptor {
        DeviceDescriptor::new(id, name, Vendor::Emfit)
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_explicit_ids_win() {
        let plugin = Account {
            devices: Ok(vec![device("1", "Bedroom"), device("2", "Guest")]),
        };
        let resolved = DeviceResolver::new(&plugin)
            .resolve(&Session::new("t"), &ids(&["2", "9"]))
            .unwrap();
        assert_eq!(resolved, vec![device("2", "Guest"), device("9", "9")]);
    }

    #[test]
    fn test_explicit_ids_survive_discovery_failure() {
        let plugin = Account {
            devices: Err("timeout".into()),
        };
        let resolved = DeviceResolver::new(&plugin)
            .resolve(&Session::new("t"), &ids(&[" 7 ", "7", ""]))
            .unwrap();
        assert_eq!(resolved, vec![device("7", "7")]);

        let offline = DeviceResolver::new(&plugin).configured(&ids(&["3", "3", "4"]));
        assert_eq!(offline, vec![device("3", "3"), device("4", "4")]);
    }

    #[test]
    fn test_discovery_when_unconfigured() {
        let plugin = Account {
            devices: Ok(vec![device("1", "A"), device("2", "B"), device("1", "A again")]),
        };
        let resolved = DeviceResolver::new(&plugin)
            .resolve(&Session::new("t"), &[])
            .unwrap();
        assert_eq!(resolved, vec![device("1", "A"), device("2", "B")]);
    }

    #[test]
    fn test_empty_account_is_no_devices_found() {
        let plugin = Account { devices: Ok(Vec::new()) };
        let err = DeviceResolver::new(&plugin)
            .resolve(&Session::new("t"), &ids(&["  "]))
            .unwrap_err();
        assert!(matches!(err, DetectorError::NoDevicesFound(_)));
    }

    #[test]
    fn test_discovery_error_propagates_when_unconfigured() {
        let plugin = Account {
            devices: Err("rate limited".into()),
        };
        let err = DeviceResolver::new(&plugin)
            .resolve(&Session::new("t"), &[])
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
