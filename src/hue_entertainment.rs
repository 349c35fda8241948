//! Philips Hue Entertainment streaming driver.
//!
//! The Entertainment mode protocol is documented at
//! https://developers.meethue.com/develop/hue-entertainment/hue-entertainment-api/.
//! Color updates go over a DTLS-PSK channel to UDP port 2100 on the bridge;
//! the session is opened and closed through the bridge's normal REST API.

use std::error::Error;
use std::io::{self, Read, Write};
use std::net::UdpSocket;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use openssl::ssl::{HandshakeError, Ssl, SslContext, SslMethod, SslVerifyMode};

use crate::driver::RgbDriver;
use crate::hue_bridge::{BridgeControl, GroupTopology};
use crate::Rgb;

/// UDP port of the bridge's Entertainment endpoint.
const HUE_ENTERTAINMENT_PORT: u16 = 2100;

/// Fixed frame header: "HueStream" + version + sequence + reserved bytes.
const HUE_ENTERTAINMENT_HEADER_SIZE: usize = 16;

/// Per-light record: type + 16-bit id + three 16-bit color channels.
const HUE_ENTERTAINMENT_LIGHT_SIZE: usize = 9;

/// Cipher the bridge accepts for the PSK handshake.
const HUE_PSK_CIPHER: &str = "PSK-AES128-GCM-SHA256";

/// Decode a hex string into its bytes.
///
/// Odd-length or non-hex input is out of contract; malformed pairs are
/// skipped rather than reported.
pub(crate) fn hex_to_bytes(hex: &str) -> Vec<u8> {
    hex.as_bytes()
        .chunks(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .filter_map(|pair| u8::from_str_radix(pair, 16).ok())
        .collect()
}

/// Entertainment mode message buffer.
///
/// Allocated once per session with one slot per group light; color updates
/// mutate the slots in place and the whole buffer is sent as a single
/// datagram.
pub(crate) struct EntertainmentFrame {
    buf: BytesMut,
    light_count: usize,
}

impl EntertainmentFrame {
    /// Build a frame with the header and light id slots filled in and all
    /// color channels dark.
    pub fn new(light_ids: &[u16]) -> Self {
        let size = HUE_ENTERTAINMENT_HEADER_SIZE + light_ids.len() * HUE_ENTERTAINMENT_LIGHT_SIZE;
        let mut buf = BytesMut::with_capacity(size);

        // Protocol name.
        buf.put_slice(b"HueStream");

        // Version major/minor.
        buf.put_u8(0x01);
        buf.put_u8(0x00);

        // Sequence ID (unused).
        buf.put_u8(0x00);

        // Reserved.
        buf.put_u16(0x0000);

        // Color space (RGB).
        buf.put_u8(0x00);

        // Reserved.
        buf.put_u8(0x00);

        for id in light_ids {
            // Type (light).
            buf.put_u8(0x00);

            // Light ID, big-endian.
            buf.put_u16(*id);

            // Color channels start dark.
            buf.put_slice(&[0; 6]);
        }

        Self { buf, light_count: light_ids.len() }
    }

    /// Rewrite the color slots, one color per light in group order.
    ///
    /// Each 8-bit channel is duplicated into both bytes of its 16-bit field.
    /// Surplus colors are ignored; missing colors leave the previous slot
    /// values in place.
    pub fn set_colors(&mut self, colors: &[Rgb]) {
        for (light_idx, color) in colors.iter().take(self.light_count).enumerate() {
            let slot =
                HUE_ENTERTAINMENT_HEADER_SIZE + light_idx * HUE_ENTERTAINMENT_LIGHT_SIZE + 3;

            self.buf[slot] = color.r;
            self.buf[slot + 1] = color.r;
            self.buf[slot + 2] = color.g;
            self.buf[slot + 3] = color.g;
            self.buf[slot + 4] = color.b;
            self.buf[slot + 5] = color.b;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn light_count(&self) -> usize {
        self.light_count
    }
}

/// Encrypted channel the session streams frames over.
pub(crate) trait StreamingChannel {
    /// Send one whole frame; delivery is fire-and-forget.
    fn send_frame(&mut self, frame: &[u8]);

    /// Close the channel from the client side (close-notify).
    fn close(&mut self);
}

/// Connected UDP socket adapter for the DTLS stream.
#[derive(Debug)]
struct UdpChannel(UdpSocket);

impl Read for UdpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.recv(buf)
    }
}

impl Write for UdpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// DTLS-PSK channel to the bridge's Entertainment endpoint.
pub(crate) struct DtlsChannel {
    stream: openssl::ssl::SslStream<UdpChannel>,
}

impl DtlsChannel {
    /// Connect to `<ip>:2100` and run the PSK handshake to completion.
    ///
    /// The PSK is the hex-decoded client key, the identity is the bridge
    /// username. The handshake is retried for as long as the transport only
    /// reports that it would block on read or write; any other failure is
    /// fatal for the session.
    pub fn connect(ip: &str, username: &str, client_key: &str) -> Result<Self, Box<dyn Error>> {
        let mut builder = SslContext::builder(SslMethod::dtls())?;
        builder.set_cipher_list(HUE_PSK_CIPHER)?;

        // The PSK handshake carries no certificate to verify.
        builder.set_verify(SslVerifyMode::NONE);

        let psk = hex_to_bytes(client_key);
        let identity = username.as_bytes().to_vec();
        builder.set_psk_client_callback(move |_ssl, _hint, identity_buf, psk_buf| {
            if identity.len() + 1 > identity_buf.len() || psk.len() > psk_buf.len() {
                return Ok(0);
            }

            identity_buf[..identity.len()].copy_from_slice(&identity);
            identity_buf[identity.len()] = 0;
            psk_buf[..psk.len()].copy_from_slice(&psk);

            Ok(psk.len())
        });

        let ssl = Ssl::new(&builder.build())?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((ip, HUE_ENTERTAINMENT_PORT))?;

        // Bounded reads so DTLS retransmission gets a chance to run.
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let mut result = ssl.connect(UdpChannel(socket));
        let stream = loop {
            match result {
                Ok(stream) => break stream,
                Err(HandshakeError::WouldBlock(mid)) => result = mid.handshake(),
                Err(err) => return Err(format!("entertainment handshake failed: {err}").into()),
            }
        };

        Ok(Self { stream })
    }
}

impl StreamingChannel for DtlsChannel {
    fn send_frame(&mut self, frame: &[u8]) {
        // A dropped datagram just means the next update wins.
        let _ = self.stream.ssl_write(frame);
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown();
    }
}

/// An open Entertainment streaming session for one group.
///
/// Construction signals the bridge to start streaming, then brings up the
/// encrypted channel; dropping the session closes the channel before telling
/// the bridge to stop.
pub(crate) struct EntertainmentSession<B: BridgeControl, C: StreamingChannel> {
    bridge: B,
    topology: GroupTopology,
    location: String,
    frame: EntertainmentFrame,
    channel: C,
}

impl<B: BridgeControl, C: StreamingChannel> EntertainmentSession<B, C> {
    /// Open a session: one start-streaming signal over the normal API, then
    /// the frame buffer, then the encrypted channel.
    pub fn new<F>(
        bridge: B,
        topology: GroupTopology,
        bridge_ip: &str,
        connect: F,
    ) -> Result<Self, Box<dyn Error>>
    where
        F: FnOnce() -> Result<C, Box<dyn Error>>,
    {
        bridge.start_streaming(&topology.id)?;

        let frame = EntertainmentFrame::new(&topology.light_ids);

        // The bridge only opens port 2100 once streaming is active, so the
        // channel comes up last. Roll the streaming flag back if it fails.
        let channel = match connect() {
            Ok(channel) => channel,
            Err(err) => {
                let _ = bridge.stop_streaming(&topology.id);
                return Err(err);
            },
        };

        Ok(Self {
            bridge,
            location: format!("IP: {bridge_ip}"),
            topology,
            frame,
            channel,
        })
    }

    /// Group name as configured on the bridge.
    pub fn group_name(&self) -> &str {
        &self.topology.name
    }
}

impl<B: BridgeControl, C: StreamingChannel> Drop for EntertainmentSession<B, C> {
    fn drop(&mut self) {
        // Close-notify before the stop signal; the bridge can otherwise
        // block waiting on the stream side.
        self.channel.close();
        let _ = self.bridge.stop_streaming(&self.topology.id);
    }
}

impl<B: BridgeControl, C: StreamingChannel> RgbDriver for EntertainmentSession<B, C> {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn name(&self) -> String {
        self.topology.name.clone()
    }

    fn led_count(&self) -> usize {
        self.frame.light_count()
    }

    fn set_color(&mut self, colors: &[Rgb]) {
        self.frame.set_colors(colors);
        self.channel.send_frame(self.frame.as_bytes());
    }
}
