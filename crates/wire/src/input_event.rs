//! CONTROL_EVENT (0x06) sub-types and their JSON-encoded payloads.
//!
//! The sub-type tag travels in [`crate::packets::ControlEventEnvelope`]; the
//! JSON body shape lives here, one variant per `InputEventType`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InputEventType {
    TouchDown = 0,
    TouchUp = 1,
    TouchMove = 2,
    KeyDown = 3,
    KeyUp = 4,
    Scroll = 5,
    AppLaunch = 6,
    AppClose = 7,
    SystemCommand = 8,
}

impl InputEventType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::TouchDown,
            1 => Self::TouchUp,
            2 => Self::TouchMove,
            3 => Self::KeyDown,
            4 => Self::KeyUp,
            5 => Self::Scroll,
            6 => Self::AppLaunch,
            7 => Self::AppClose,
            8 => Self::SystemCommand,
            _ => return None,
        })
    }
}

/// A single control event, already mapped to device coordinates where
/// applicable. Carries its own producer timestamp (nanoseconds, monotonic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEventPayload {
    TouchDown {
        pointer_id: u32,
        x: i32,
        y: i32,
        pressure: f32,
        timestamp_ns: u64,
    },
    TouchUp {
        pointer_id: u32,
        x: i32,
        y: i32,
        timestamp_ns: u64,
    },
    TouchMove {
        pointer_id: u32,
        x: i32,
        y: i32,
        pressure: f32,
        timestamp_ns: u64,
    },
    KeyDown {
        key_code: u32,
        scan_code: u32,
        meta_state: u32,
        timestamp_ns: u64,
    },
    KeyUp {
        key_code: u32,
        scan_code: u32,
        meta_state: u32,
        timestamp_ns: u64,
    },
    Scroll {
        x: i32,
        y: i32,
        delta_x: f32,
        delta_y: f32,
        timestamp_ns: u64,
    },
    AppLaunch {
        package_name: String,
        timestamp_ns: u64,
    },
    AppClose {
        package_name: String,
        timestamp_ns: u64,
    },
    SystemCommand {
        command: String,
        timestamp_ns: u64,
    },
}

impl ControlEventPayload {
    pub fn event_type(&self) -> InputEventType {
        match self {
            Self::TouchDown { .. } => InputEventType::TouchDown,
            Self::TouchUp { .. } => InputEventType::TouchUp,
            Self::TouchMove { .. } => InputEventType::TouchMove,
            Self::KeyDown { .. } => InputEventType::KeyDown,
            Self::KeyUp { .. } => InputEventType::KeyUp,
            Self::Scroll { .. } => InputEventType::Scroll,
            Self::AppLaunch { .. } => InputEventType::AppLaunch,
            Self::AppClose { .. } => InputEventType::AppClose,
            Self::SystemCommand { .. } => InputEventType::SystemCommand,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(buf: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(buf)
    }
}

/// Maps a client-widget pixel coordinate to a device coordinate, preserving
/// the aspect-ratio letterbox the client draws the video inside.
///
/// `display_rect` is `(dx, dy, dw, dh)`: the video's drawn rectangle within
/// the widget. `video_size` is `(Vw, Vh)`, the native frame size. A zero-area
/// `display_rect` or `video_size` (no video laid out yet) passes the point
/// through unchanged rather than dividing by zero.
pub fn map_to_device_coords(
    point: (i32, i32),
    display_rect: (i32, i32, i32, i32),
    video_size: (u32, u32),
) -> (i32, i32) {
    let (px, py) = point;
    let (dx, dy, dw, dh) = display_rect;
    let (vw, vh) = video_size;
    if dw == 0 || dh == 0 || vw == 0 || vh == 0 {
        return point;
    }
    let device_x = ((px - dx) as i64 * vw as i64) / dw as i64;
    let device_y = ((py - dy) as i64 * vh as i64) / dh as i64;
    (device_x as i32, device_y as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_mapping_identity_when_unscaled() {
        let device = map_to_device_coords((100, 200), (0, 0, 1080, 2400), (1080, 2400));
        assert_eq!(device, (100, 200));
    }

    #[test]
    fn coordinate_mapping_passes_through_on_empty_rect() {
        let point = (42, 84);
        assert_eq!(map_to_device_coords(point, (0, 0, 0, 0), (0, 0)), point);
    }

    #[test]
    fn coordinate_mapping_literal_scenario() {
        // video 1080x1920 in a 540x960 widget-filling rect; click at (270, 480).
        let device = map_to_device_coords((270, 480), (0, 0, 540, 960), (1080, 1920));
        assert_eq!(device, (540, 960));
    }

    #[test]
    fn coordinate_mapping_scales_and_offsets() {
        // Widget 1000x1000, video letterboxed into a 500x1000 rect at x=250.
        let device = map_to_device_coords((250, 500), (250, 0, 500, 1000), (1080, 2400));
        assert_eq!(device, (0, 1200));
    }

    #[test]
    fn touch_down_roundtrips_through_json() {
        let e = ControlEventPayload::TouchDown {
            pointer_id: 0,
            x: 42,
            y: 84,
            pressure: 1.0,
            timestamp_ns: 123,
        };
        let bytes = e.to_json().unwrap();
        let decoded = ControlEventPayload::from_json(&bytes).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(decoded.event_type(), InputEventType::TouchDown);
    }

    #[test]
    fn app_launch_roundtrips_through_json() {
        let e = ControlEventPayload::AppLaunch {
            package_name: "com.example.app".into(),
            timestamp_ns: 1,
        };
        let bytes = e.to_json().unwrap();
        let decoded = ControlEventPayload::from_json(&bytes).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn event_type_tag_matches_variant() {
        let scroll = ControlEventPayload::Scroll {
            x: 0,
            y: 0,
            delta_x: 0.0,
            delta_y: -1.0,
            timestamp_ns: 0,
        };
        assert_eq!(scroll.event_type(), InputEventType::Scroll);
    }
}
