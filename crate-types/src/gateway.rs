use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::guild::UnavailableGuild;
use crate::ids::GuildId;
use crate::user::User;

/// gateway opcodes (protocol version 9)
pub mod op {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RESUME: u8 = 6;
    pub const RECONNECT: u8 = 7;
    pub const REQUEST_GUILD_MEMBERS: u8 = 8;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// gateway intents the archiver identifies with
pub mod intents {
    pub const GUILDS: u64 = 1 << 0;
    pub const GUILD_MEMBERS: u64 = 1 << 1;
    pub const GUILD_MESSAGES: u64 = 1 << 9;
    pub const GUILD_MESSAGE_REACTIONS: u64 = 1 << 10;

    pub const ARCHIVER: u64 = GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | GUILD_MESSAGE_REACTIONS;
}

/// the envelope every gateway frame decodes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: u8, d: Value) -> GatewayPayload {
        GatewayPayload {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: ConnectionProperties,
    pub intents: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        ConnectionProperties {
            os: std::env::consts::OS.to_owned(),
            browser: "hagfish".to_owned(),
            device: "hagfish".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    pub guild_id: GuildId,
    pub query: String,
    pub limit: u64,
}

/// the first dispatch of a fresh session
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub v: u8,
    pub user: User,
    pub session_id: String,
    pub resume_gateway_url: Option<String>,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// what to do about a transport close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// reconnect after a short delay, keeping resume state
    Reconnect,
    /// credentials were rejected; drop the account
    AuthFailed,
    /// surface as a fatal close error
    Fatal,
}

/// classify a close code received from the transport
///
/// 1000 is only terminal when we sent it ourselves (the destroy path);
/// the connection owner handles that case before consulting this table.
pub fn close_behavior(code: u16) -> CloseBehavior {
    match code {
        4004 => CloseBehavior::AuthFailed,
        c if c < 4000 => CloseBehavior::Reconnect,
        c if (4000..4010).contains(&c) => CloseBehavior::Reconnect,
        _ => CloseBehavior::Fatal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_policy() {
        assert_eq!(close_behavior(1001), CloseBehavior::Reconnect);
        assert_eq!(close_behavior(4000), CloseBehavior::Reconnect);
        assert_eq!(close_behavior(4009), CloseBehavior::Reconnect);
        assert_eq!(close_behavior(4004), CloseBehavior::AuthFailed);
        assert_eq!(close_behavior(4010), CloseBehavior::Fatal);
        assert_eq!(close_behavior(4014), CloseBehavior::Fatal);
    }

    #[test]
    fn payload_envelope_roundtrip() {
        let raw = r#"{"op":0,"d":{"a":1},"s":42,"t":"MESSAGE_CREATE"}"#;
        let p: GatewayPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(p.op, op::DISPATCH);
        assert_eq!(p.s, Some(42));
        assert_eq!(p.t.as_deref(), Some("MESSAGE_CREATE"));
    }
}
