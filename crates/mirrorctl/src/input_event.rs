//! Client-side half of the input event path (spec.md §4.9): map widget
//! pixel coordinates to device coordinates and encode the result as a
//! `CONTROL_EVENT` envelope. The server-side consumption of these events
//! (injection into the device's input stack) lives in
//! `mirrorctl-server::input_inject`.

use mirror_wire::{map_to_device_coords, ControlEventEnvelope, ControlEventPayload, PacketError};

/// The client widget's current video layout, updated whenever the widget
/// resizes or a new `METADATA`/`VIDEO_CONFIG` changes the native picture
/// size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayGeometry {
    /// `(dx, dy, dw, dh)`: the video's drawn rectangle within the widget.
    pub display_rect: (i32, i32, i32, i32),
    /// `(Vw, Vh)`: the native decoded frame size.
    pub video_size: (u32, u32),
}

/// Builds [`ControlEventPayload`]s from raw widget-space input, applying the
/// coordinate mapping. The caller is responsible for sending at most one
/// pointer-down before a pointer-up per `pointer_id` (spec.md §4.9) — this
/// is a documented ordering invariant the caller must uphold, not a
/// runtime-enforced one, matching the teacher's light-touch validation
/// style elsewhere in this protocol.
pub struct InputEncoder {
    geometry: DisplayGeometry,
}

impl InputEncoder {
    pub fn new(geometry: DisplayGeometry) -> Self {
        Self { geometry }
    }

    pub fn set_geometry(&mut self, geometry: DisplayGeometry) {
        self.geometry = geometry;
    }

    fn map(&self, widget_point: (i32, i32)) -> (i32, i32) {
        map_to_device_coords(widget_point, self.geometry.display_rect, self.geometry.video_size)
    }

    pub fn touch_down(&self, pointer_id: u32, widget_point: (i32, i32), pressure: f32, timestamp_ns: u64) -> ControlEventPayload {
        let (x, y) = self.map(widget_point);
        ControlEventPayload::TouchDown { pointer_id, x, y, pressure, timestamp_ns }
    }

    pub fn touch_move(&self, pointer_id: u32, widget_point: (i32, i32), pressure: f32, timestamp_ns: u64) -> ControlEventPayload {
        let (x, y) = self.map(widget_point);
        ControlEventPayload::TouchMove { pointer_id, x, y, pressure, timestamp_ns }
    }

    pub fn touch_up(&self, pointer_id: u32, widget_point: (i32, i32), timestamp_ns: u64) -> ControlEventPayload {
        let (x, y) = self.map(widget_point);
        ControlEventPayload::TouchUp { pointer_id, x, y, timestamp_ns }
    }

    pub fn key_down(&self, key_code: u32, scan_code: u32, meta_state: u32, timestamp_ns: u64) -> ControlEventPayload {
        ControlEventPayload::KeyDown { key_code, scan_code, meta_state, timestamp_ns }
    }

    pub fn key_up(&self, key_code: u32, scan_code: u32, meta_state: u32, timestamp_ns: u64) -> ControlEventPayload {
        ControlEventPayload::KeyUp { key_code, scan_code, meta_state, timestamp_ns }
    }

    pub fn scroll(&self, widget_point: (i32, i32), delta_x: f32, delta_y: f32, timestamp_ns: u64) -> ControlEventPayload {
        let (x, y) = self.map(widget_point);
        ControlEventPayload::Scroll { x, y, delta_x, delta_y, timestamp_ns }
    }

    pub fn app_launch(&self, package_name: String, timestamp_ns: u64) -> ControlEventPayload {
        ControlEventPayload::AppLaunch { package_name, timestamp_ns }
    }

    pub fn app_close(&self, package_name: String, timestamp_ns: u64) -> ControlEventPayload {
        ControlEventPayload::AppClose { package_name, timestamp_ns }
    }

    pub fn system_command(&self, command: String, timestamp_ns: u64) -> ControlEventPayload {
        ControlEventPayload::SystemCommand { command, timestamp_ns }
    }
}

/// Wraps a payload into the wire envelope (sub-type tag + JSON body) ready
/// to be framed as a `CONTROL_EVENT` packet.
pub fn encode_envelope(payload: &ControlEventPayload) -> Result<ControlEventEnvelope, PacketError> {
    let data = payload.to_json().map_err(|e| PacketError::InvalidJson(e.to_string()))?;
    Ok(ControlEventEnvelope { sub_type: payload.event_type() as u8, data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_down_maps_the_literal_scenario() {
        let encoder = InputEncoder::new(DisplayGeometry {
            display_rect: (0, 0, 540, 960),
            video_size: (1080, 1920),
        });
        let event = encoder.touch_down(0, (270, 480), 1.0, 123);
        assert_eq!(event, ControlEventPayload::TouchDown { pointer_id: 0, x: 540, y: 960, pressure: 1.0, timestamp_ns: 123 });
    }

    #[test]
    fn app_launch_and_system_command_pass_through_unmapped() {
        let encoder = InputEncoder::new(DisplayGeometry::default());
        assert_eq!(
            encoder.app_launch("com.example.app".into(), 1),
            ControlEventPayload::AppLaunch { package_name: "com.example.app".into(), timestamp_ns: 1 }
        );
        assert_eq!(
            encoder.system_command("lock".into(), 2),
            ControlEventPayload::SystemCommand { command: "lock".into(), timestamp_ns: 2 }
        );
    }

    #[test]
    fn encode_envelope_roundtrips_through_json() {
        let encoder = InputEncoder::new(DisplayGeometry {
            display_rect: (0, 0, 1, 1),
            video_size: (1, 1),
        });
        let payload = encoder.key_down(4, 30, 0, 99);
        let envelope = encode_envelope(&payload).unwrap();
        assert_eq!(envelope.sub_type, payload.event_type() as u8);
        let decoded = ControlEventPayload::from_json(&envelope.data).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn set_geometry_updates_subsequent_mappings() {
        let mut encoder = InputEncoder::new(DisplayGeometry::default());
        assert_eq!(encoder.touch_up(0, (5, 5), 0), ControlEventPayload::TouchUp { pointer_id: 0, x: 5, y: 5, timestamp_ns: 0 });
        encoder.set_geometry(DisplayGeometry { display_rect: (0, 0, 540, 960), video_size: (1080, 1920) });
        assert_eq!(encoder.touch_up(0, (270, 480), 0), ControlEventPayload::TouchUp { pointer_id: 0, x: 540, y: 960, timestamp_ns: 0 });
    }
}
