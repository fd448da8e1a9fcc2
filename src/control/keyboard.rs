//! Keyboard teleoperation input.
//!
//! Raw key-down/key-up events arrive from a blocking capture device on its
//! own OS thread and are bridged into the cooperative side through one
//! mutex-guarded state slot: the set of currently pressed keys plus a queue
//! of edge-triggered actions. The control loop reads the latest state without
//! ever blocking on the device.
//!
//! Axis bindings follow the Mode-2 transmitter layout the operators already
//! fly with: W/S throttle, A/D yaw, arrow keys pitch and roll.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use crate::config::KeyboardConfig;
use crate::control::{ControlVector, ModeManager};

/// A key identifier as delivered by the capture device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Char(char),
    Up,
    Down,
    Left,
    Right,
    Space,
}

/// Raw input event: one key transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    pub key: Key,
    pub pressed: bool,
}

/// Discrete action fired exactly once per key-down transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    EmergencyStop,
    ArmTakeoff,
    Land,
    ToggleTracking,
}

/// Key-to-function bindings.
#[derive(Debug, Clone)]
pub struct KeyBindings {
    pub throttle_up: Key,
    pub throttle_down: Key,
    pub yaw_left: Key,
    pub yaw_right: Key,
    pub pitch_forward: Key,
    pub pitch_back: Key,
    pub roll_left: Key,
    pub roll_right: Key,
    pub emergency_stop: Key,
    pub arm_takeoff: Key,
    pub land: Key,
    pub toggle_tracking: Key,
    pub quit: Key,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            throttle_up: Key::Char('w'),
            throttle_down: Key::Char('s'),
            yaw_left: Key::Char('a'),
            yaw_right: Key::Char('d'),
            pitch_forward: Key::Up,
            pitch_back: Key::Down,
            roll_left: Key::Left,
            roll_right: Key::Right,
            emergency_stop: Key::Space,
            arm_takeoff: Key::Char('t'),
            land: Key::Char('l'),
            // 'g' for "go tracking"; 't' is taken by takeoff
            toggle_tracking: Key::Char('g'),
            quit: Key::Char('q'),
        }
    }
}

impl KeyBindings {
    fn action_for(&self, key: Key) -> Option<Action> {
        if key == self.quit {
            Some(Action::Quit)
        } else if key == self.emergency_stop {
            Some(Action::EmergencyStop)
        } else if key == self.arm_takeoff {
            Some(Action::ArmTakeoff)
        } else if key == self.land {
            Some(Action::Land)
        } else if key == self.toggle_tracking {
            Some(Action::ToggleTracking)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct KeyState {
    pressed: HashSet<Key>,
    actions: VecDeque<Action>,
}

pub struct KeyboardController {
    config: KeyboardConfig,
    bindings: KeyBindings,
    state: Mutex<KeyState>,
    mode: Arc<ModeManager>,
}

impl KeyboardController {
    pub fn new(config: KeyboardConfig, bindings: KeyBindings, mode: Arc<ModeManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            bindings,
            state: Mutex::new(KeyState::default()),
            mode,
        })
    }

    /// Spawn the capture thread: drains the device's event channel until the
    /// sending side disconnects.
    pub fn spawn_capture(self: &Arc<Self>, events: Receiver<KeyEvent>) -> thread::JoinHandle<()> {
        let controller = Arc::clone(self);
        thread::spawn(move || {
            for event in events.iter() {
                controller.process_event(event);
            }
            log::debug!("keyboard capture thread exiting (device channel closed)");
        })
    }

    /// Apply one key transition.
    ///
    /// Key auto-repeat shows up as repeated key-down events for a key already
    /// in the pressed set; those repeats fire no action.
    pub fn process_event(&self, event: KeyEvent) {
        {
            let mut state = self.state.lock();
            if event.pressed {
                let newly_pressed = state.pressed.insert(event.key);
                if newly_pressed {
                    if let Some(action) = self.bindings.action_for(event.key) {
                        state.actions.push_back(action);
                    }
                }
            } else {
                state.pressed.remove(&event.key);
            }
        }
        // Outside the lock: every processed input counts as manual activity.
        self.mode.notify_manual_activity();
    }

    /// Map the current pressed-key set to a control vector. Opposing keys on
    /// the same axis cancel to zero.
    pub fn get_input(&self) -> ControlVector {
        let state = self.state.lock();
        let pressed = |key: Key| state.pressed.contains(&key);

        let s = self.config.sensitivity;
        let ts = self.config.throttle_sensitivity;
        let b = &self.bindings;

        let axis = |positive: Key, negative: Key, scale: f64| {
            let mut v = 0.0;
            if pressed(positive) {
                v += scale;
            }
            if pressed(negative) {
                v -= scale;
            }
            v
        };

        ControlVector::new(
            axis(b.pitch_forward, b.pitch_back, s),
            axis(b.roll_right, b.roll_left, s),
            axis(b.throttle_up, b.throttle_down, ts),
            axis(b.yaw_right, b.yaw_left, s),
        )
    }

    /// Pop the oldest pending edge action, if any.
    pub fn poll_action(&self) -> Option<Action> {
        self.state.lock().actions.pop_front()
    }
}
