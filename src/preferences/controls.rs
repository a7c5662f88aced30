//! Projection between preferences and live UI controls

use crate::sync::PreferenceValue;

/// A set of UI controls addressed by preference key
///
/// Hosts implement this for their widget tree. Keys the surface has no
/// control for are ignored on apply and return `None` on read.
pub trait ControlSurface {
    /// Push `value` into the control bound to `key`. Returns `false` if none exists.
    fn apply(&mut self, key: &str, value: &PreferenceValue) -> bool;

    /// Current value of the control bound to `key`
    fn read(&self, key: &str) -> Option<PreferenceValue>;
}

/// Plain map of controls, used by headless hosts and tests
impl ControlSurface for std::collections::BTreeMap<String, PreferenceValue> {
    fn apply(&mut self, key: &str, value: &PreferenceValue) -> bool {
        self.insert(key.to_string(), value.clone());
        true
    }

    fn read(&self, key: &str) -> Option<PreferenceValue> {
        self.get(key).cloned()
    }
}
