//! Server-side consumption of `CONTROL_EVENT` packets (spec.md §6.2 direction
//! C→S; the client-side half of C9 — coordinate mapping and encoding — lives
//! in the controller crate). This supplements spec.md's component table,
//! which only describes C9 from the client's encoding side: the server must
//! still turn received control events into real input, and `original_source`
//! fully specifies that half via its `ControlEventCallback`.

use mirror_wire::ControlEventPayload;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InjectError {
    #[error("input backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("failed to inject event: {0}")]
    InjectFailed(String),
}

pub trait InputInjector: Send {
    fn inject(&mut self, event: &ControlEventPayload) -> Result<(), InjectError>;
}

/// Discards every event; used when no input backend is configured (e.g. a
/// view-only mirroring session) so the session loop has a uniform seam.
pub struct NullInjector;

impl InputInjector for NullInjector {
    fn inject(&mut self, _event: &ControlEventPayload) -> Result<(), InjectError> {
        Ok(())
    }
}

#[cfg(feature = "gst-x11-backend")]
pub use linux_uinput::LinuxInputInjector;

#[cfg(feature = "gst-x11-backend")]
mod linux_uinput {
    use super::{InjectError, InputInjector};
    use input_linux::sys::input_event;
    use input_linux::{
        AbsoluteAxis, AbsoluteEvent, AbsoluteInfo, AbsoluteInfoSetup, EventKind, EventTime, InputId, Key, KeyEvent,
        KeyState, RelativeAxis, RelativeEvent, SynchronizeEvent, UInputHandle,
    };
    use mirror_wire::ControlEventPayload;
    use std::fs::{File, OpenOptions};
    use std::os::fd::AsRawFd;
    use tracing::debug;

    const ABS_MAX: i32 = 65535;

    /// Virtual keyboard + absolute-positioned mouse backed by `/dev/uinput`,
    /// carried from the teacher's `agent::input::InputInjector` and
    /// generalized from mouse/key/scroll-only events to the spec's full
    /// touch/key/scroll/app/system event set: touch down/move/up map onto
    /// the absolute-mouse device's left button + ABS_X/ABS_Y exactly the way
    /// the teacher maps browser pointer events.
    pub struct LinuxInputInjector {
        keyboard: UInputHandle<File>,
        mouse: UInputHandle<File>,
        scroll_accum_x: f64,
        scroll_accum_y: f64,
        screen_width: u32,
        screen_height: u32,
    }

    impl LinuxInputInjector {
        pub fn new(screen_width: u32, screen_height: u32) -> Result<Self, InjectError> {
            let keyboard = Self::create_keyboard()?;
            let mouse = Self::create_mouse()?;
            debug!("input injector initialized");
            Ok(Self {
                keyboard,
                mouse,
                scroll_accum_x: 0.0,
                scroll_accum_y: 0.0,
                screen_width: screen_width.max(1),
                screen_height: screen_height.max(1),
            })
        }

        fn open_uinput() -> Result<File, InjectError> {
            OpenOptions::new()
                .write(true)
                .open("/dev/uinput")
                .map_err(|e| InjectError::BackendUnavailable(format!("open /dev/uinput: {e}")))
        }

        fn create_keyboard() -> Result<UInputHandle<File>, InjectError> {
            let file = Self::open_uinput()?;
            let handle = UInputHandle::new(file);
            handle.set_evbit(EventKind::Key).map_err(io_err)?;
            handle.set_evbit(EventKind::Synchronize).map_err(io_err)?;
            for code in 1..=248u16 {
                if let Ok(key) = Key::from_code(code) {
                    handle.set_keybit(key).map_err(io_err)?;
                }
            }
            let id = InputId { bustype: 0x03, vendor: 0x1234, product: 0x5678, version: 1 };
            handle.create(&id, b"mirrorctl Virtual Keyboard\0", 0, &[]).map_err(io_err)?;
            Ok(handle)
        }

        fn create_mouse() -> Result<UInputHandle<File>, InjectError> {
            let file = Self::open_uinput()?;
            let handle = UInputHandle::new(file);
            handle.set_evbit(EventKind::Key).map_err(io_err)?;
            handle.set_evbit(EventKind::Absolute).map_err(io_err)?;
            handle.set_evbit(EventKind::Relative).map_err(io_err)?;
            handle.set_evbit(EventKind::Synchronize).map_err(io_err)?;
            handle.set_keybit(Key::ButtonLeft).map_err(io_err)?;
            handle.set_keybit(Key::ButtonTouch).map_err(io_err)?;
            handle.set_absbit(AbsoluteAxis::X).map_err(io_err)?;
            handle.set_absbit(AbsoluteAxis::Y).map_err(io_err)?;
            handle.set_relbit(RelativeAxis::Wheel).map_err(io_err)?;
            handle.set_relbit(RelativeAxis::HorizontalWheel).map_err(io_err)?;

            let abs_x = AbsoluteInfoSetup {
                axis: AbsoluteAxis::X,
                info: AbsoluteInfo { value: 0, minimum: 0, maximum: ABS_MAX, fuzz: 0, flat: 0, resolution: 0 },
            };
            let abs_y = AbsoluteInfoSetup {
                axis: AbsoluteAxis::Y,
                info: AbsoluteInfo { value: 0, minimum: 0, maximum: ABS_MAX, fuzz: 0, flat: 0, resolution: 0 },
            };
            let id = InputId { bustype: 0x03, vendor: 0x1234, product: 0x5679, version: 1 };
            handle.create(&id, b"mirrorctl Virtual Touch/Mouse\0", 0, &[abs_x, abs_y]).map_err(io_err)?;
            Ok(handle)
        }

        fn normalize_to_abs(&self, coord: i32, axis_max: u32) -> i32 {
            let clamped = coord.clamp(0, axis_max as i32);
            ((clamped as i64 * ABS_MAX as i64) / axis_max.max(1) as i64) as i32
        }

        fn move_to(&mut self, x: i32, y: i32) -> Result<(), InjectError> {
            let abs_x = self.normalize_to_abs(x, self.screen_width);
            let abs_y = self.normalize_to_abs(y, self.screen_height);
            let time = EventTime::default();
            let events: [input_event; 3] = [
                AbsoluteEvent::new(time, AbsoluteAxis::X, abs_x).into_event().into_raw(),
                AbsoluteEvent::new(time, AbsoluteAxis::Y, abs_y).into_event().into_raw(),
                SynchronizeEvent::report(time).into_event().into_raw(),
            ];
            self.mouse.write(&events).map_err(io_err)
        }

        fn set_touch(&mut self, down: bool) -> Result<(), InjectError> {
            let time = EventTime::default();
            let events = [
                KeyEvent::new(time, Key::ButtonTouch, KeyState::pressed(down)).into_event().into_raw(),
                KeyEvent::new(time, Key::ButtonLeft, KeyState::pressed(down)).into_event().into_raw(),
                SynchronizeEvent::report(time).into_event().into_raw(),
            ];
            self.mouse.write(&events).map_err(io_err)
        }

        fn key(&mut self, key_code: u32, pressed: bool) -> Result<(), InjectError> {
            let code = u16::try_from(key_code).map_err(|_| InjectError::InjectFailed(format!("key code out of range: {key_code}")))?;
            let key = Key::from_code(code).map_err(|_| InjectError::InjectFailed(format!("invalid key code: {key_code}")))?;
            let time = EventTime::default();
            let events = [
                KeyEvent::new(time, key, KeyState::pressed(pressed)).into_event().into_raw(),
                SynchronizeEvent::report(time).into_event().into_raw(),
            ];
            self.keyboard.write(&events).map_err(io_err)
        }

        fn scroll(&mut self, delta_x: f32, delta_y: f32) -> Result<(), InjectError> {
            self.scroll_accum_x += delta_x as f64 / 30.0;
            self.scroll_accum_y += delta_y as f64 / 30.0;
            let notches_x = self.scroll_accum_x as i32;
            let notches_y = self.scroll_accum_y as i32;
            self.scroll_accum_x -= notches_x as f64;
            self.scroll_accum_y -= notches_y as f64;
            if notches_x == 0 && notches_y == 0 {
                return Ok(());
            }
            let time = EventTime::default();
            let mut events = Vec::with_capacity(3);
            if notches_x != 0 {
                events.push(RelativeEvent::new(time, RelativeAxis::HorizontalWheel, notches_x).into_event().into_raw());
            }
            if notches_y != 0 {
                events.push(RelativeEvent::new(time, RelativeAxis::Wheel, notches_y).into_event().into_raw());
            }
            events.push(SynchronizeEvent::report(time).into_event().into_raw());
            self.mouse.write(&events).map_err(io_err)
        }
    }

    fn io_err(e: std::io::Error) -> InjectError {
        InjectError::InjectFailed(e.to_string())
    }

    impl InputInjector for LinuxInputInjector {
        fn inject(&mut self, event: &ControlEventPayload) -> Result<(), InjectError> {
            match *event {
                ControlEventPayload::TouchDown { x, y, .. } => {
                    self.move_to(x, y)?;
                    self.set_touch(true)
                }
                ControlEventPayload::TouchMove { x, y, .. } => self.move_to(x, y),
                ControlEventPayload::TouchUp { x, y, .. } => {
                    self.move_to(x, y)?;
                    self.set_touch(false)
                }
                ControlEventPayload::KeyDown { key_code, .. } => self.key(key_code, true),
                ControlEventPayload::KeyUp { key_code, .. } => self.key(key_code, false),
                ControlEventPayload::Scroll { delta_x, delta_y, .. } => self.scroll(delta_x, delta_y),
                // App launch/close and system commands are shell-level operations
                // out of scope for the uinput backend; the server session logs
                // and drops them (device-side OS shell invocation is an external
                // collaborator per spec.md §1).
                ControlEventPayload::AppLaunch { .. }
                | ControlEventPayload::AppClose { .. }
                | ControlEventPayload::SystemCommand { .. } => Ok(()),
            }
        }
    }

    // Keeps `AsRawFd` reachable without an unused-import warning when the
    // feature is compiled but the fd isn't otherwise inspected.
    #[allow(dead_code)]
    fn _assert_as_raw_fd<T: AsRawFd>(_: &T) {}
}
