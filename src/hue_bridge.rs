//! Philips Hue bridge REST client.
//!
//! Covers only what the Entertainment session needs from the bridge's normal
//! (non-streaming) API: the group topology snapshot and the imperative
//! start/stop-streaming toggles. Everything latency-sensitive goes over the
//! encrypted UDP channel instead.

use std::error::Error;
use std::time::Duration;

use serde_json::{json, Value};

/// Control calls issued over the bridge's normal API channel.
///
/// Split out as a trait so session construction and teardown can be exercised
/// without a physical bridge.
pub(crate) trait BridgeControl {
    /// Tell the bridge to open the Entertainment UDP endpoint for a group.
    fn start_streaming(&self, group_id: &str) -> Result<(), Box<dyn Error>>;

    /// Tell the bridge to close the Entertainment endpoint again.
    fn stop_streaming(&self, group_id: &str) -> Result<(), Box<dyn Error>>;
}

/// Read-only snapshot of an entertainment group, captured once at session
/// construction. The light order here fixes the frame slot order.
#[derive(Debug, Clone)]
pub(crate) struct GroupTopology {
    pub id: String,
    pub name: String,
    pub light_ids: Vec<u16>,
}

/// Handle to a Hue bridge's REST API.
pub(crate) struct HueBridge {
    ip: String,
    username: String,
    client_key: String,
    http: reqwest::blocking::Client,
}

impl HueBridge {
    pub fn new(ip: &str, username: &str, client_key: &str) -> Result<Self, Box<dyn Error>> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            ip: ip.into(),
            username: username.into(),
            client_key: client_key.into(),
            http,
        })
    }

    /// Bridge IP address.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Whitelisted API username; doubles as the DTLS PSK identity.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Hex-encoded entertainment client key.
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    fn group_url(&self, group_id: &str) -> String {
        format!("http://{}/api/{}/groups/{}", self.ip, self.username, group_id)
    }

    /// Fetch the group name and its ordered member light IDs.
    pub fn group(&self, group_id: &str) -> Result<GroupTopology, Box<dyn Error>> {
        let body: Value = self.http.get(self.group_url(group_id)).send()?.json()?;

        let name = body["name"].as_str().unwrap_or_default().to_string();

        let mut light_ids = Vec::new();
        for light in body["lights"].as_array().map(Vec::as_slice).unwrap_or_default() {
            let id = light
                .as_str()
                .and_then(|id| id.parse::<u16>().ok())
                .ok_or_else(|| format!("malformed light id in group {group_id}"))?;
            light_ids.push(id);
        }

        Ok(GroupTopology { id: group_id.into(), name, light_ids })
    }

    /// Flip the group's `stream.active` flag.
    fn set_streaming(&self, group_id: &str, active: bool) -> Result<(), Box<dyn Error>> {
        let body = json!({ "stream": { "active": active } });

        let response = self.http.put(self.group_url(group_id)).json(&body).send()?;
        if !response.status().is_success() {
            return Err(format!("bridge rejected streaming toggle: {}", response.status()).into());
        }

        Ok(())
    }
}

impl BridgeControl for HueBridge {
    fn start_streaming(&self, group_id: &str) -> Result<(), Box<dyn Error>> {
        self.set_streaming(group_id, true)
    }

    fn stop_streaming(&self, group_id: &str) -> Result<(), Box<dyn Error>> {
        self.set_streaming(group_id, false)
    }
}
