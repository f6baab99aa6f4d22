//! Feature subscription state tracking.
//!
//! Each optional subscription the client can hold on its transport (C2D
//! messages, direct methods, desired-property updates) moves through:
//!
//! ```text
//! Disabled -> Enabling -> Enabled -> Disabling -> Disabled
//!               |                       |
//!               +-- failure: Disabled   +-- failure: Enabled
//! ```
//!
//! A feature is `Enabled` only while the transport subscription is believed
//! active. Disconnect recovery flips `Enabled` back to `Disabled` before
//! re-enabling, so a second disconnect arriving mid-recovery finds nothing to
//! restore.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
};

/// An optional transport subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Cloud-to-device messages.
    C2d,
    /// Direct methods.
    Methods,
    /// Twin desired-property update notifications.
    TwinDesiredProperties,
}

impl Feature {
    pub const ALL: [Feature; 3] = [
        Feature::C2d,
        Feature::Methods,
        Feature::TwinDesiredProperties,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Feature::C2d => "c2d",
            Feature::Methods => "methods",
            Feature::TwinDesiredProperties => "twin_desired_properties",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a feature is in its enable/disable lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeatureState {
    #[default]
    Disabled,
    /// An enable operation is in flight.
    Enabling,
    Enabled,
    /// A disable operation is in flight.
    Disabling,
}

impl FeatureState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureState::Disabled => "Disabled",
            FeatureState::Enabling => "Enabling",
            FeatureState::Enabled => "Enabled",
            FeatureState::Disabling => "Disabling",
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, FeatureState::Enabled)
    }

    /// True while an enable or disable operation is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, FeatureState::Enabling | FeatureState::Disabling)
    }
}

impl fmt::Display for FeatureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ticket for a started transition.
///
/// Carries the epoch the transition began in; `close()` bumps the epoch so a
/// transition that completes after close cannot resurrect a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub feature: Feature,
    epoch: u64,
}

struct Switch {
    state: Mutex<FeatureState>,
    // serializes enable/disable transitions of one feature
    gate: tokio::sync::Mutex<()>,
}

impl Switch {
    fn new() -> Self {
        Self {
            state: Mutex::new(FeatureState::Disabled),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FeatureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// State of every feature plus the per-feature transition gates.
pub(crate) struct FeatureSwitches {
    c2d: Switch,
    methods: Switch,
    twin: Switch,
    epoch: AtomicU64,
}

impl FeatureSwitches {
    pub fn new() -> Self {
        Self {
            c2d: Switch::new(),
            methods: Switch::new(),
            twin: Switch::new(),
            epoch: AtomicU64::new(0),
        }
    }

    fn switch(&self, feature: Feature) -> &Switch {
        match feature {
            Feature::C2d => &self.c2d,
            Feature::Methods => &self.methods,
            Feature::TwinDesiredProperties => &self.twin,
        }
    }

    pub fn state(&self, feature: Feature) -> FeatureState {
        *self.switch(feature).lock()
    }

    fn set(&self, feature: Feature, next: FeatureState) {
        *self.switch(feature).lock() = next;
    }

    /// Waits until no other transition of `feature` is running.
    pub async fn gate(&self, feature: Feature) -> tokio::sync::MutexGuard<'_, ()> {
        self.switch(feature).gate.lock().await
    }

    /// Moves `feature` from `from` to the in-flight state `via`.
    ///
    /// Returns `None` (and changes nothing) when the feature is not in `from`.
    pub fn begin(&self, feature: Feature, from: FeatureState, via: FeatureState) -> Option<Transition> {
        let mut state = self.switch(feature).lock();
        if *state != from {
            return None;
        }
        *state = via;
        Some(Transition {
            feature,
            epoch: self.epoch.load(Ordering::SeqCst),
        })
    }

    /// Commits the outcome of a transition unless the switches were reset
    /// since it began. Returns whether the outcome was applied.
    pub fn finish(&self, transition: Transition, outcome: FeatureState) -> bool {
        if self.epoch.load(Ordering::SeqCst) != transition.epoch {
            return false;
        }
        self.set(transition.feature, outcome);
        true
    }

    /// Flips every `Enabled` feature to `Disabled` and returns them.
    pub fn take_enabled(&self) -> Vec<Feature> {
        Feature::ALL
            .into_iter()
            .filter(|feature| {
                self.begin(*feature, FeatureState::Enabled, FeatureState::Disabled)
                    .is_some()
            })
            .collect()
    }

    /// Forces every feature to `Disabled` and invalidates in-flight transitions.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        for feature in Feature::ALL {
            self.set(feature, FeatureState::Disabled);
        }
    }
}

impl fmt::Debug for FeatureSwitches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeatureSwitches")
            .field("c2d", &self.state(Feature::C2d))
            .field("methods", &self.state(Feature::Methods))
            .field("twin", &self.state(Feature::TwinDesiredProperties))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_state_as_str() {
        assert_eq!(FeatureState::Disabled.as_str(), "Disabled");
        assert_eq!(FeatureState::Enabling.as_str(), "Enabling");
        assert_eq!(FeatureState::Enabled.to_string(), "Enabled");
        assert_eq!(FeatureState::Disabling.to_string(), "Disabling");
    }

    #[test]
    fn test_feature_state_predicates() {
        assert!(FeatureState::Enabled.is_enabled());
        assert!(!FeatureState::Enabling.is_enabled());
        assert!(FeatureState::Enabling.is_transitioning());
        assert!(FeatureState::Disabling.is_transitioning());
        assert!(!FeatureState::Disabled.is_transitioning());
    }

    #[test]
    fn test_begin_requires_expected_state() {
        let switches = FeatureSwitches::new();
        let t = switches
            .begin(Feature::C2d, FeatureState::Disabled, FeatureState::Enabling)
            .expect("disabled feature can start enabling");
        assert_eq!(switches.state(Feature::C2d), FeatureState::Enabling);

        // second enable while the first is in flight does nothing
        assert!(switches
            .begin(Feature::C2d, FeatureState::Disabled, FeatureState::Enabling)
            .is_none());

        assert!(switches.finish(t, FeatureState::Enabled));
        assert_eq!(switches.state(Feature::C2d), FeatureState::Enabled);
        assert_eq!(switches.state(Feature::Methods), FeatureState::Disabled);
    }

    #[test]
    fn test_take_enabled_flips_only_enabled_features() {
        let switches = FeatureSwitches::new();
        for feature in [Feature::C2d, Feature::TwinDesiredProperties] {
            let t = switches
                .begin(feature, FeatureState::Disabled, FeatureState::Enabling)
                .unwrap();
            switches.finish(t, FeatureState::Enabled);
        }
        switches.begin(Feature::Methods, FeatureState::Disabled, FeatureState::Enabling);

        let taken = switches.take_enabled();
        assert_eq!(taken, vec![Feature::C2d, Feature::TwinDesiredProperties]);
        assert_eq!(switches.state(Feature::C2d), FeatureState::Disabled);
        assert_eq!(switches.state(Feature::Methods), FeatureState::Enabling);

        // nothing left to take on a second pass
        assert!(switches.take_enabled().is_empty());
    }

    #[test]
    fn test_reset_invalidates_in_flight_transition() {
        let switches = FeatureSwitches::new();
        let t = switches
            .begin(Feature::Methods, FeatureState::Disabled, FeatureState::Enabling)
            .unwrap();

        switches.reset();

        assert!(!switches.finish(t, FeatureState::Enabled));
        assert_eq!(switches.state(Feature::Methods), FeatureState::Disabled);
    }
}
