//! Shared driver surface.

use crate::Rgb;

/// Uniform surface a driver exposes to the host: static metadata plus the
/// "set these LEDs to these colors" entry point.
pub(crate) trait RgbDriver {
    /// Human-readable device location (IP, bus, ...).
    fn location(&self) -> String;

    /// Device or group name.
    fn name(&self) -> String;

    /// Firmware/protocol version, if the device exposes one.
    fn version(&self) -> String {
        String::new()
    }

    /// Manufacturer name, if the device exposes one.
    fn manufacturer(&self) -> String {
        String::new()
    }

    /// Stable device identifier, if the device exposes one.
    fn unique_id(&self) -> String {
        String::new()
    }

    /// Number of individually addressable LEDs or zones.
    fn led_count(&self) -> usize;

    /// Push one color per LED. Must be called with exactly `led_count()`
    /// colors; delivery is best-effort.
    fn set_color(&mut self, colors: &[Rgb]);
}
