//! Peripheral Command Protocol
//!
//! Commands written to a peripheral are short ASCII strings terminated by
//! `;`. Replies use the same framing, with `:` separating fields.

use anyhow::Result;
use tracing::trace;

/// Frame terminator
pub const TERMINATOR: u8 = b';';

/// Highest vibration level the firmware accepts
pub const MAX_VIBRATION_LEVEL: u8 = 20;

/// Peripheral commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralCommand {
    /// Set vibration strength (0 stops)
    Vibrate(u8),
    /// Query battery level; also sent as the liveness ping
    Battery,
    /// Query model, firmware version and address
    DeviceType,
    /// Turn the peripheral off
    PowerOff,
}

impl PeripheralCommand {
    /// Encode into a framed payload
    pub fn encode(&self) -> Vec<u8> {
        let body = match self {
            Self::Vibrate(level) => format!("Vibrate:{}", (*level).min(MAX_VIBRATION_LEVEL)),
            Self::Battery => "Battery".to_string(),
            Self::DeviceType => "DeviceType".to_string(),
            Self::PowerOff => "PowerOff".to_string(),
        };
        let mut frame = body.into_bytes();
        frame.push(TERMINATOR);
        frame
    }
}

/// Payload sent by the heartbeat to check a link is alive
pub fn ping_frame() -> Vec<u8> {
    PeripheralCommand::Battery.encode()
}

/// Strip the terminator and return the fields of a reply frame
pub fn split_reply(frame: &[u8]) -> Result<Vec<String>> {
    trace!("Raw reply: {:02X?}", frame);

    let text = std::str::from_utf8(frame)
        .map_err(|_| anyhow::anyhow!("Reply is not valid ASCII"))?
        .trim();
    let body = text
        .strip_suffix(';')
        .ok_or_else(|| anyhow::anyhow!("Reply is missing terminator: {:?}", text))?;

    if body.is_empty() {
        anyhow::bail!("Empty reply");
    }

    Ok(body.split(':').map(str::to_string).collect())
}

/// Parse a battery reply such as `85;`
pub fn parse_battery(frame: &[u8]) -> Result<u8> {
    let fields = split_reply(frame)?;
    let level: u8 = fields[0]
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid battery level: {}", fields[0]))?;
    if level > 100 {
        anyhow::bail!("Battery level out of range: {}", level);
    }
    Ok(level)
}
