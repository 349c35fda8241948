//! Logitech G915 lighting control.
//!
//! The keyboard speaks HID++ 2.0: every capability is a numbered firmware
//! feature whose runtime index has to be discovered through the root feature
//! before it can be addressed. Lighting writes are buffered by the firmware
//! and only displayed once a commit report lands.

use std::error::Error;

use bytes::{BufMut, BytesMut};

use crate::driver::RgbDriver;
use crate::{Mode, Rgb};

pub(crate) const LOGITECH_VID: u16 = 0x046d;
pub(crate) const G915_PID_WIRED: u16 = 0xc33e;
pub(crate) const G915_PID_RECEIVER: u16 = 0xc541;

/// Function byte of the commit report; firmware applies buffered writes
/// atomically when it sees this.
const COMMIT_BYTE: u8 = 0x7f;

/// Per-call HID read/write timeout in milliseconds.
const READ_TIMEOUT_MS: i32 = 300;

const REPORT_ID_LONG: u8 = 0x11;
const REPORT_ID_VERY_LONG: u8 = 0x12;
const LONG_REPORT_SIZE: usize = 20;
const VERY_LONG_REPORT_SIZE: usize = 64;

/// Routing byte: wired devices answer directly, wireless ones sit behind the
/// LIGHTSPEED receiver's first device slot.
const DEVICE_IDX_WIRED: u8 = 0xff;
const DEVICE_IDX_RECEIVER: u8 = 0x01;

/// Software ID tag carried in the low nibble of the function byte.
const SW_ID: u8 = 0x01;

/// Firmware feature pages addressed by this driver.
const PAGE_KEYBOARD_LAYOUT: u16 = 0x4522;
const PAGE_BRIGHTNESS: u16 = 0x8040;
const PAGE_COLOR_EFFECTS: u16 = 0x8071;
const PAGE_PER_KEY_LIGHTING: u16 = 0x8081;

/// Root feature (index 0) function that resolves a page to its index.
const ROOT_GET_FEATURE: u8 = 0x00;

/// 0x8040 function setting the global lighting brightness.
const SET_BRIGHTNESS: u8 = 0x01;

/// 0x8071 function selecting a zone effect.
const SET_ZONE_EFFECT: u8 = 0x01;

/// 0x8081 function updating a single key.
const SET_SINGLE_LED: u8 = 0x06;

/// Mode reports go to each lighting zone in turn.
const ZONE_TAGS: [u8; 5] = [
    0x00, // Keyboard
    0x01, // Logo
    0x02, // Multimedia
    0x03, // G-keys
    0x04, // Modifiers
];

/// Zone bitmask values for direct per-LED frames.
pub(crate) const DIRECT_ZONE_KEYBOARD: u8 = 0x01;
pub(crate) const DIRECT_ZONE_MEDIA: u8 = 0x02;
pub(crate) const DIRECT_ZONE_LOGO: u8 = 0x10;
pub(crate) const DIRECT_ZONE_INDICATORS: u8 = 0x40;

const DIRECT_ZONES: [u8; 4] =
    [DIRECT_ZONE_KEYBOARD, DIRECT_ZONE_MEDIA, DIRECT_ZONE_LOGO, DIRECT_ZONE_INDICATORS];

pub(crate) const FRAME_TYPE_LITTLE: u8 = 0x1f;
pub(crate) const FRAME_TYPE_BIG: u8 = 0x6f;

/// Largest direct payload that still fits a long report after its 4-byte
/// header; anything bigger needs a very-long report.
const LITTLE_FRAME_MAX: usize = LONG_REPORT_SIZE - 4;

/// Effect speeds; smaller is faster.
pub(crate) const SPEED_SLOWEST: u16 = 0xc8;
pub(crate) const SPEED_NORMAL: u16 = 0x32;
pub(crate) const SPEED_FASTEST: u16 = 0x0a;

/// Pick the direct frame type tag for a payload size.
pub(crate) fn direct_frame_type(payload_len: usize) -> u8 {
    if payload_len <= LITTLE_FRAME_MAX {
        FRAME_TYPE_LITTLE
    } else {
        FRAME_TYPE_BIG
    }
}

/// Convert a lighting mode to its G915 protocol tag.
fn mode_bytes(mode: Mode) -> u8 {
    match mode {
        Mode::Off => 0x00,
        Mode::Static => 0x01,
        Mode::Breathing => 0x02,
        Mode::Cycle => 0x03,
        Mode::Wave => 0x04,
        Mode::Direct => 0x05,
    }
}

/// Synchronous HID transport the controller drives.
///
/// Implemented for `hidapi::HidDevice`; tests substitute a recording fake.
pub(crate) trait HidTransport {
    /// Write one report; returns the number of bytes accepted.
    fn send_report(&self, data: &[u8]) -> Result<usize, Box<dyn Error>>;

    /// Read one report with a bounded timeout.
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, Box<dyn Error>>;

    /// Device serial number, when the transport can provide one.
    fn serial(&self) -> Option<String> {
        None
    }
}

impl HidTransport for hidapi::HidDevice {
    fn send_report(&self, data: &[u8]) -> Result<usize, Box<dyn Error>> {
        Ok(self.write(data)?)
    }

    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, Box<dyn Error>> {
        Ok(self.read_timeout(buf, timeout_ms)?)
    }

    fn serial(&self) -> Option<String> {
        self.get_serial_number_string().ok().flatten()
    }
}

/// Driver for one G915 keyboard.
pub(crate) struct G915Controller<T: HidTransport> {
    transport: T,
    device_index: u8,
    #[allow(dead_code)]
    feature_4522_idx: u8,
    feature_8040_idx: u8,
    feature_8071_idx: u8,
    feature_8081_idx: u8,
}

impl<T: HidTransport> G915Controller<T> {
    /// Open the controller and discover the runtime feature indices.
    pub fn new(transport: T, wired: bool) -> Result<Self, Box<dyn Error>> {
        let device_index = if wired { DEVICE_IDX_WIRED } else { DEVICE_IDX_RECEIVER };

        let mut controller = Self {
            transport,
            device_index,
            feature_4522_idx: 0,
            feature_8040_idx: 0,
            feature_8071_idx: 0,
            feature_8081_idx: 0,
        };

        controller.feature_4522_idx = controller.feature_index(PAGE_KEYBOARD_LAYOUT)?;
        controller.feature_8040_idx = controller.feature_index(PAGE_BRIGHTNESS)?;
        controller.feature_8071_idx = controller.feature_index(PAGE_COLOR_EFFECTS)?;
        controller.feature_8081_idx = controller.feature_index(PAGE_PER_KEY_LIGHTING)?;

        Ok(controller)
    }

    /// Best-effort device serial.
    pub fn serial_string(&self) -> String {
        self.transport.serial().unwrap_or_default()
    }

    /// Start a long feature report addressed to a feature index/function.
    fn feature_report(&self, feature_idx: u8, function: u8, params: &[u8]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LONG_REPORT_SIZE);

        buf.put_u8(REPORT_ID_LONG);
        buf.put_u8(self.device_index);
        buf.put_u8(feature_idx);
        buf.put_u8((function << 4) | SW_ID);
        buf.put_slice(params);
        buf.resize(LONG_REPORT_SIZE, 0);

        buf
    }

    /// Resolve a feature page to its runtime index via the root feature.
    fn feature_index(&self, page: u16) -> Result<u8, Box<dyn Error>> {
        let request = self.feature_report(0x00, ROOT_GET_FEATURE, &page.to_be_bytes());
        self.transport.send_report(&request)?;

        let mut response = [0u8; LONG_REPORT_SIZE];
        let read = self.transport.read_report(&mut response, READ_TIMEOUT_MS)?;
        if read < 5 {
            return Err(format!("no response discovering feature page {page:#06x}").into());
        }

        Ok(response[4])
    }

    /// Apply a lighting mode to every zone. Color bytes should be zero for
    /// modes that do not take a color.
    pub fn set_mode(&self, mode: Mode, speed: u16, color: Rgb) {
        for zone in ZONE_TAGS {
            self.send_mode(zone, mode_bytes(mode), speed, color);
        }
    }

    fn send_mode(&self, zone: u8, mode: u8, speed: u16, color: Rgb) {
        let [speed_hi, speed_lo] = speed.to_be_bytes();

        let report = self.feature_report(
            self.feature_8071_idx,
            SET_ZONE_EFFECT,
            &[zone, mode, color.r, color.g, color.b, speed_hi, speed_lo],
        );

        // Best-effort: a short or timed-out write is not retried.
        let _ = self.transport.send_report(&report);
    }

    /// Set the global lighting brightness.
    pub fn set_brightness(&self, brightness: u8) {
        let report = self.feature_report(self.feature_8040_idx, SET_BRIGHTNESS, &[brightness]);

        let _ = self.transport.send_report(&report);
    }

    /// Switch every zone to direct mode so per-LED frames are displayed.
    pub fn initialize_direct(&self) {
        for zone in ZONE_TAGS {
            self.send_mode(zone, mode_bytes(Mode::Direct), 0, Rgb { r: 0, g: 0, b: 0 });
        }
    }

    /// Send a raw per-LED frame: zone bitmask + color payload behind the
    /// frame-type tag. Little frames ride a long report, big frames a
    /// very-long report.
    pub fn set_direct(&self, frame_type: u8, frame_data: &[u8]) {
        let (report_id, size) = if frame_type == FRAME_TYPE_LITTLE {
            (REPORT_ID_LONG, LONG_REPORT_SIZE)
        } else {
            (REPORT_ID_VERY_LONG, VERY_LONG_REPORT_SIZE)
        };

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(report_id);
        buf.put_u8(self.device_index);
        buf.put_u8(self.feature_8081_idx);
        buf.put_u8(frame_type);

        let take = frame_data.len().min(size - 4);
        buf.put_slice(&frame_data[..take]);
        buf.resize(size, 0);

        let _ = self.transport.send_report(&buf);
    }

    /// Minimal single-key update for latency-sensitive feedback.
    pub fn send_single_led(&self, keycode: u8, color: Rgb) {
        let report = self.feature_report(
            self.feature_8081_idx,
            SET_SINGLE_LED,
            &[keycode, color.r, color.g, color.b],
        );

        let _ = self.transport.send_report(&report);
    }

    /// Apply all buffered lighting writes atomically.
    pub fn commit(&self) {
        let mut buf = BytesMut::with_capacity(LONG_REPORT_SIZE);

        buf.put_u8(REPORT_ID_LONG);
        buf.put_u8(self.device_index);
        buf.put_u8(self.feature_8081_idx);
        buf.put_u8(COMMIT_BYTE);
        buf.resize(LONG_REPORT_SIZE, 0);

        let _ = self.transport.send_report(&buf);
    }
}

impl<T: HidTransport> RgbDriver for G915Controller<T> {
    fn location(&self) -> String {
        "HID".into()
    }

    fn name(&self) -> String {
        "Logitech G915 Keyboard".into()
    }

    fn manufacturer(&self) -> String {
        "Logitech".into()
    }

    fn unique_id(&self) -> String {
        self.serial_string()
    }

    fn led_count(&self) -> usize {
        DIRECT_ZONES.len()
    }

    fn set_color(&mut self, colors: &[Rgb]) {
        let mut frame_data = BytesMut::with_capacity(DIRECT_ZONES.len() * 4);

        for (mask, color) in DIRECT_ZONES.into_iter().zip(colors) {
            frame_data.put_slice(&[mask, color.r, color.g, color.b]);
        }

        self.set_direct(direct_frame_type(frame_data.len()), &frame_data);
        self.commit();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    /// Records every report and answers root feature queries with an index
    /// derived from the requested page.
    struct FakeTransport {
        sent: RefCell<Vec<Vec<u8>>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self { sent: RefCell::new(Vec::new()) }
        }
    }

    impl HidTransport for FakeTransport {
        fn send_report(&self, data: &[u8]) -> Result<usize, Box<dyn Error>> {
            self.sent.borrow_mut().push(data.to_vec());
            Ok(data.len())
        }

        fn read_report(&self, buf: &mut [u8], _timeout_ms: i32) -> Result<usize, Box<dyn Error>> {
            let sent = self.sent.borrow();
            let request = sent.last().cloned().unwrap_or_default();

            let index = match u16::from_be_bytes([request[4], request[5]]) {
                0x4522 => 0x0a,
                0x8040 => 0x0b,
                0x8071 => 0x0c,
                0x8081 => 0x0d,
                _ => 0x00,
            };

            buf[..5].copy_from_slice(&[0x11, request[1], 0x00, request[3], index]);
            Ok(buf.len())
        }

        fn serial(&self) -> Option<String> {
            Some("0123-ABCD".into())
        }
    }

    fn controller(wired: bool) -> G915Controller<FakeTransport> {
        G915Controller::new(FakeTransport::new(), wired).unwrap()
    }

    fn sent(controller: &G915Controller<FakeTransport>) -> Vec<Vec<u8>> {
        controller.transport.sent.borrow().clone()
    }

    #[test]
    fn discovery_queries_root_once_per_page() {
        let controller = controller(true);
        let sent = sent(&controller);

        assert_eq!(sent.len(), 4);
        for report in &sent {
            // Root feature index 0, function 0.
            assert_eq!(report[2], 0x00);
            assert_eq!(report[3], SW_ID);
        }

        assert_eq!(controller.feature_4522_idx, 0x0a);
        assert_eq!(controller.feature_8040_idx, 0x0b);
        assert_eq!(controller.feature_8071_idx, 0x0c);
        assert_eq!(controller.feature_8081_idx, 0x0d);
    }

    #[test]
    fn device_index_follows_connection_type() {
        assert_eq!(controller(true).device_index, 0xff);
        assert_eq!(controller(false).device_index, 0x01);
    }

    #[test]
    fn set_mode_addresses_every_zone() {
        let controller = controller(true);
        let before = sent(&controller).len();

        controller.set_mode(Mode::Breathing, SPEED_NORMAL, Rgb { r: 0x80, g: 0x40, b: 0x20 });

        let sent = sent(&controller);
        let reports = &sent[before..];
        assert_eq!(reports.len(), 5);

        for (zone, report) in ZONE_TAGS.iter().zip(reports) {
            assert_eq!(report.len(), 20);
            assert_eq!(report[2], 0x0c); // 0x8071 feature index
            assert_eq!(report[4], *zone);
            assert_eq!(report[5], 0x02); // breathing
            assert_eq!(&report[6..9], &[0x80, 0x40, 0x20]);
            assert_eq!(&report[9..11], &SPEED_NORMAL.to_be_bytes());
        }
    }

    #[test]
    fn commit_sends_exactly_one_commit_report() {
        let controller = controller(true);

        controller.set_mode(Mode::Static, 0, Rgb { r: 1, g: 2, b: 3 });
        let before = sent(&controller).len();

        controller.commit();

        let sent = sent(&controller);
        assert_eq!(sent.len(), before + 1);

        let commit = sent.last().unwrap();
        assert_eq!(commit[2], 0x0d); // 0x8081 feature index
        assert_eq!(commit[3], 0x7f);
        assert!(commit[4..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn initialize_direct_selects_direct_mode_everywhere() {
        let controller = controller(true);
        let before = sent(&controller).len();

        controller.initialize_direct();

        let sent = sent(&controller);
        let reports = &sent[before..];
        assert_eq!(reports.len(), 5);
        for report in reports {
            assert_eq!(report[5], 0x05); // direct
        }
    }

    #[test]
    fn direct_frame_type_threshold() {
        assert_eq!(direct_frame_type(0), FRAME_TYPE_LITTLE);
        assert_eq!(direct_frame_type(16), FRAME_TYPE_LITTLE);
        assert_eq!(direct_frame_type(17), FRAME_TYPE_BIG);
        assert_eq!(direct_frame_type(60), FRAME_TYPE_BIG);
    }

    #[test]
    fn little_direct_frames_use_long_reports() {
        let controller = controller(true);
        controller.set_direct(FRAME_TYPE_LITTLE, &[DIRECT_ZONE_LOGO, 0xff, 0x00, 0x00]);

        let sent = sent(&controller);
        let report = sent.last().unwrap();
        assert_eq!(report.len(), 20);
        assert_eq!(report[0], 0x11);
        assert_eq!(report[3], FRAME_TYPE_LITTLE);
        assert_eq!(&report[4..8], &[DIRECT_ZONE_LOGO, 0xff, 0x00, 0x00]);
    }

    #[test]
    fn big_direct_frames_use_very_long_reports() {
        let controller = controller(true);
        let payload = [0xab; 32];
        controller.set_direct(FRAME_TYPE_BIG, &payload);

        let sent = sent(&controller);
        let report = sent.last().unwrap();
        assert_eq!(report.len(), 64);
        assert_eq!(report[0], 0x12);
        assert_eq!(report[3], FRAME_TYPE_BIG);
        assert_eq!(&report[4..36], &payload);
        assert!(report[36..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn brightness_report_addresses_the_brightness_feature() {
        let controller = controller(true);
        controller.set_brightness(0x64);

        let sent = sent(&controller);
        let report = sent.last().unwrap();
        assert_eq!(report[2], 0x0b); // 0x8040 feature index
        assert_eq!(report[4], 0x64);
    }

    #[test]
    fn single_led_report_carries_keycode_and_color() {
        let controller = controller(false);
        controller.send_single_led(0x29, Rgb { r: 0x11, g: 0x22, b: 0x33 });

        let sent = sent(&controller);
        let report = sent.last().unwrap();
        assert_eq!(report[1], 0x01); // receiver routing byte
        assert_eq!(report[2], 0x0d);
        assert_eq!(&report[4..8], &[0x29, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn set_color_sends_one_direct_frame_and_commit() {
        let mut controller = controller(true);
        let before = sent(&controller).len();

        let colors = [
            Rgb { r: 1, g: 2, b: 3 },
            Rgb { r: 4, g: 5, b: 6 },
            Rgb { r: 7, g: 8, b: 9 },
            Rgb { r: 10, g: 11, b: 12 },
        ];
        controller.set_color(&colors);

        let sent = sent(&controller);
        let reports = &sent[before..];
        assert_eq!(reports.len(), 2);

        // 4 zones x 4 bytes fits a little frame.
        assert_eq!(reports[0][3], FRAME_TYPE_LITTLE);
        assert_eq!(&reports[0][4..8], &[DIRECT_ZONE_KEYBOARD, 1, 2, 3]);
        assert_eq!(reports[1][3], 0x7f);
    }

    #[test]
    fn serial_comes_from_the_transport() {
        let controller = controller(true);
        assert_eq!(controller.serial_string(), "0123-ABCD");
        assert_eq!(controller.unique_id(), "0123-ABCD");
    }
}
