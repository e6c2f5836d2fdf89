//! Input-device sampling for the uplink.
//!
//! The device itself is an external capability behind [`InputDevice`].
//! Each tick its raw state is turned into an immutable
//! [`ControllerSample`] (deadzone applied to the stick axes only) and
//! handed to a [`SampleSink`].

mod sampler;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::DeviceError;

pub use sampler::{ControllerSampler, SampleSink, SamplerConfig};

// ── Raw device state ─────────────────────────────────────────────

/// Axis indices of the Xbox 360 layout.
pub mod axis {
    pub const LEFT_X: usize = 0;
    pub const LEFT_Y: usize = 1;
    pub const RIGHT_X: usize = 2;
    pub const RIGHT_Y: usize = 3;
    pub const LEFT_TRIGGER: usize = 4;
    pub const RIGHT_TRIGGER: usize = 5;
}

/// Trigger value when the axis is absent.
pub const TRIGGER_RELEASED: f64 = -1.0;

/// One poll of a device, in its own index space.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawInputState {
    /// Analog axes, each in [-1, 1].
    pub axes: Vec<f64>,
    pub buttons: Vec<bool>,
    /// Directional pads, each component in {-1, 0, 1}.
    pub hats: Vec<(i8, i8)>,
}

/// Anything that can be polled for controller state.
pub trait InputDevice: Send + 'static {
    fn read(&mut self) -> Result<RawInputState, DeviceError>;

    fn name(&self) -> &str {
        "input device"
    }
}

/// A device that always reports a centred controller.
///
/// Used where no physical device is attached.
#[derive(Debug, Clone)]
pub struct NeutralDevice {
    buttons: usize,
}

impl NeutralDevice {
    pub fn new() -> Self {
        Self {
            buttons: ButtonMap::xbox().len(),
        }
    }
}

impl Default for NeutralDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl InputDevice for NeutralDevice {
    fn read(&mut self) -> Result<RawInputState, DeviceError> {
        Ok(RawInputState {
            axes: vec![0.0, 0.0, 0.0, 0.0, TRIGGER_RELEASED, TRIGGER_RELEASED],
            buttons: vec![false; self.buttons],
            hats: vec![(0, 0)],
        })
    }

    fn name(&self) -> &str {
        "neutral"
    }
}

// ── Filtering ────────────────────────────────────────────────────

/// `0.0` when `|value| < deadzone`, otherwise `value` unchanged.
pub fn apply_deadzone(value: f64, deadzone: f64) -> f64 {
    if value.abs() < deadzone { 0.0 } else { value }
}

// ── ButtonMap ────────────────────────────────────────────────────

/// Button index → wire name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButtonMap {
    names: Vec<String>,
}

impl ButtonMap {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The Xbox 360 layout.
    pub fn xbox() -> Self {
        Self::new([
            "a_button",
            "b_button",
            "x_button",
            "y_button",
            "lb_button",
            "rb_button",
            "back_button",
            "start_button",
            "xbox_button",
            "left_stick_button",
            "right_stick_button",
        ])
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name for button `index`, if mapped.
    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Mapped names in index order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Wire key of a raw button.
fn raw_button_key(index: usize) -> String {
    format!("button_{index}")
}

impl Default for ButtonMap {
    fn default() -> Self {
        Self::xbox()
    }
}

// ── ControllerSample ─────────────────────────────────────────────

/// One uplink message. Built once per tick and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerSample {
    pub left_stick_x: f64,
    pub left_stick_y: f64,
    pub right_stick_x: f64,
    pub right_stick_y: f64,
    /// -1 released, 1 fully pressed.
    pub left_trigger: f64,
    pub right_trigger: f64,
    pub dpad_x: i8,
    pub dpad_y: i8,
    /// Every raw button, keyed `button_<i>`.
    pub buttons: BTreeMap<String, bool>,
    /// Mapped buttons, serialized as top-level keys (`a_button`, ...).
    #[serde(flatten)]
    pub named_buttons: BTreeMap<String, bool>,
    /// Capture time, float seconds since the Unix epoch.
    pub timestamp: f64,
}

impl ControllerSample {
    /// Filter a raw poll into a sample.
    ///
    /// Missing stick axes read as centred, missing triggers as
    /// released, a missing hat as `(0, 0)`, and a mapped button the
    /// device lacks as not pressed.
    pub fn from_raw(
        raw: &RawInputState,
        deadzone: f64,
        buttons: &ButtonMap,
        timestamp: f64,
    ) -> Self {
        let stick = |i: usize| apply_deadzone(raw.axes.get(i).copied().unwrap_or(0.0), deadzone);
        let trigger = |i: usize| raw.axes.get(i).copied().unwrap_or(TRIGGER_RELEASED);
        let (dpad_x, dpad_y) = raw.hats.first().copied().unwrap_or((0, 0));

        Self {
            left_stick_x: stick(axis::LEFT_X),
            left_stick_y: stick(axis::LEFT_Y),
            right_stick_x: stick(axis::RIGHT_X),
            right_stick_y: stick(axis::RIGHT_Y),
            left_trigger: trigger(axis::LEFT_TRIGGER),
            right_trigger: trigger(axis::RIGHT_TRIGGER),
            dpad_x: dpad_x.signum(),
            dpad_y: dpad_y.signum(),
            buttons: raw
                .buttons
                .iter()
                .enumerate()
                .map(|(i, pressed)| (raw_button_key(i), *pressed))
                .collect(),
            named_buttons: buttons
                .names()
                .enumerate()
                .map(|(i, name)| (name.to_string(), raw.buttons.get(i).copied().unwrap_or(false)))
                .collect(),
            timestamp,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
