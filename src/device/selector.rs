//! Device selection for sharded runs.
//!
//! The selector turns "what the user asked for" plus "what is connected"
//! into an ordered list of device ids. Position `i` in the list is the
//! device bound to shard `i`, so the list is computed once, before any shard
//! starts, and never mutated afterwards.

use tracing::debug;

use super::{Device, DeviceError, DeviceResult, Platform, WEB_DEVICE_ID};
use crate::plan::ExecutionPlan;

/// Resolves the devices shards will be bound to.
///
/// # Example
///
/// ```
/// use flowshard::device::{Device, DeviceSelector, Platform};
/// use flowshard::plan::{ExecutionPlan, FlowRef, FlowSequence, WorkspaceConfig};
///
/// let plan = ExecutionPlan::new(
///     vec![FlowRef::new("a.yaml")],
///     FlowSequence::default(),
///     WorkspaceConfig::default(),
/// );
/// let connected = vec![
///     Device::new("emulator-5554", Platform::Android),
///     Device::new("8A1B-SIM", Platform::Ios),
/// ];
///
/// let ids = DeviceSelector::select(&plan, &[], Some(Platform::Ios), &connected).unwrap();
/// assert_eq!(ids, vec!["8A1B-SIM".to_string()]);
/// ```
pub struct DeviceSelector;

impl DeviceSelector {
    /// Returns device ids ordered to align 1:1 with shard indices.
    ///
    /// - Web-only plans get the reserved [`WEB_DEVICE_ID`].
    /// - Explicitly requested ids must all be connected; they're returned in
    ///   the requested order.
    /// - Otherwise every connected device matching `platform` is returned
    ///   (all devices when `platform` is `None`), in connection order.
    ///
    /// # Errors
    ///
    /// - [`DeviceError::NotConnected`] if any requested id is missing. No
    ///   partial selection is returned.
    /// - [`DeviceError::NoDevices`] if nothing matches.
    pub fn select(
        plan: &ExecutionPlan,
        requested: &[String],
        platform: Option<Platform>,
        connected: &[Device],
    ) -> DeviceResult<Vec<String>> {
        if plan.is_web_only() || platform == Some(Platform::Web) {
            debug!("Web-only plan, using synthetic device {}", WEB_DEVICE_ID);
            return Ok(vec![WEB_DEVICE_ID.to_string()]);
        }

        if !requested.is_empty() {
            let mut selected = Vec::with_capacity(requested.len());
            for id in requested {
                if !connected.iter().any(|d| &d.id == id) {
                    return Err(DeviceError::NotConnected(id.clone()));
                }
                if !selected.contains(id) {
                    selected.push(id.clone());
                }
            }
            return Ok(selected);
        }

        let selected: Vec<String> = connected
            .iter()
            .filter(|d| platform.is_none_or(|p| d.platform == p))
            .map(|d| d.id.clone())
            .collect();

        if selected.is_empty() {
            return Err(DeviceError::NoDevices(platform));
        }

        debug!("Selected {} connected devices", selected.len());
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{FlowRef, FlowSequence, WorkspaceConfig};

    fn plan() -> ExecutionPlan {
        ExecutionPlan::new(
            vec![FlowRef::new("a.yaml"), FlowRef::new("b.yaml")],
            FlowSequence::default(),
            WorkspaceConfig::default(),
        )
    }

    fn connected() -> Vec<Device> {
        vec![
            Device::new("emulator-5554", Platform::Android),
            Device::new("SIM-1", Platform::Ios),
            Device::new("emulator-5556", Platform::Android),
        ]
    }

    #[test]
    fn test_select_all_connected() {
        let ids = DeviceSelector::select(&plan(), &[], None, &connected()).unwrap();
        assert_eq!(ids, vec!["emulator-5554", "SIM-1", "emulator-5556"]);
    }

    #[test]
    fn test_select_platform_filter() {
        let ids = DeviceSelector::select(&plan(), &[], Some(Platform::Android), &connected()).unwrap();
        assert_eq!(ids, vec!["emulator-5554", "emulator-5556"]);
    }

    #[test]
    fn test_select_requested_in_order() {
        let requested = vec!["emulator-5556".to_string(), "SIM-1".to_string()];
        let ids = DeviceSelector::select(&plan(), &requested, None, &connected()).unwrap();
        assert_eq!(ids, requested);
    }

    #[test]
    fn test_select_requested_missing_fails_fast() {
        let requested = vec!["SIM-1".to_string(), "pixel-9".to_string()];
        let err = DeviceSelector::select(&plan(), &requested, None, &connected()).unwrap_err();
        assert!(matches!(err, DeviceError::NotConnected(id) if id == "pixel-9"));
    }

    #[test]
    fn test_select_no_matching_devices() {
        let only_android = vec![Device::new("emulator-5554", Platform::Android)];
        let err = DeviceSelector::select(&plan(), &[], Some(Platform::Ios), &only_android).unwrap_err();
        assert!(matches!(err, DeviceError::NoDevices(Some(Platform::Ios))));
    }

    #[test]
    fn test_select_web_only_plan_uses_synthetic_device() {
        let web = plan().with_flows(vec![FlowRef::new("w.yaml").with_platform(Platform::Web)]);
        let ids = DeviceSelector::select(&web, &[], None, &[]).unwrap();
        assert_eq!(ids, vec![WEB_DEVICE_ID]);
    }
}
