//! Text commands carried in `REQUEST` payloads and helpers for their `RESPONSE` bodies.
//!
//! Commands are comma separated ASCII tokens terminated by a null byte. Empty tokens are dropped
//! when a command is rendered, so an absent node name does not leave an empty field behind.

use std::fmt;

use crate::types::Version;
use crate::{NatNetError, Result};

/// Asset kind used by subscription commands.
pub const RIGID_BODY: &str = "RigidBody";

/// How a subscription command names its asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetRef {
    Name(String),
    Id(i32),
}

impl From<&str> for AssetRef {
    fn from(name: &str) -> Self {
        AssetRef::Name(name.to_string())
    }
}

impl From<i32> for AssetRef {
    fn from(id: i32) -> Self {
        AssetRef::Id(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Responds with the current frame rate as `f32`.
    FrameRate,
    /// Responds with `i32` 0 on success.
    SetProperty { node: Option<String>, name: String, value: String },
    GetProperty { node: Option<String>, name: String },
    EnableAsset(String),
    DisableAsset(String),
    Subscribe { kind: String, asset: AssetRef },
    SubscribeAll { kind: String },
    Unsubscribe { kind: String, asset: AssetRef },
    ClearNameSubscriptions,
    ClearIdSubscriptions,
    Bitstream(Version),
    /// Anything this crate does not model, passed through verbatim.
    Raw(String),
}

fn tokenize(tokens: &[&str]) -> String {
    tokens.iter().filter(|t| !t.is_empty()).copied().collect::<Vec<_>>().join(",")
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Command::FrameRate => "FrameRate".to_string(),
            Command::SetProperty { node, name, value } => {
                tokenize(&["SetProperty", node.as_deref().unwrap_or(""), name, value])
            }
            Command::GetProperty { node, name } => {
                tokenize(&["GetProperty", node.as_deref().unwrap_or(""), name])
            }
            Command::EnableAsset(name) => tokenize(&["EnableAsset", name]),
            Command::DisableAsset(name) => tokenize(&["DisableAsset", name]),
            Command::Subscribe { kind, asset: AssetRef::Name(name) } => {
                tokenize(&["SubscribeToData", kind, name])
            }
            Command::Subscribe { kind, asset: AssetRef::Id(id) } => {
                tokenize(&["SubscribeByID", kind, &id.to_string()])
            }
            Command::SubscribeAll { kind } => tokenize(&["SubscribeToData", kind, "all"]),
            Command::Unsubscribe { kind, asset: AssetRef::Name(name) } => {
                tokenize(&["SubscribeToData", kind, name, "None"])
            }
            Command::Unsubscribe { kind, asset: AssetRef::Id(id) } => {
                tokenize(&["SubscribeByID", kind, &id.to_string(), "None"])
            }
            Command::ClearNameSubscriptions => "SubscribeToData".to_string(),
            Command::ClearIdSubscriptions => "SubscribeByID".to_string(),
            Command::Bitstream(version) => format!("Bitstream,{}.{}", version.major, version.minor),
            Command::Raw(text) => text.clone(),
        };
        f.write_str(&text)
    }
}

impl Command {
    /// Null-terminated request payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_string().into_bytes();
        bytes.push(0);
        bytes
    }

    /// Parses a request payload; unknown or ill-formed commands come back as [`Command::Raw`].
    pub fn parse(payload: &[u8]) -> Command {
        let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let text = String::from_utf8_lossy(&payload[..end]).into_owned();
        let tokens: Vec<&str> = text.split(',').map(str::trim).collect();
        let owned = |s: &str| s.to_string();
        let parsed = match tokens.as_slice() {
            ["FrameRate"] => Some(Command::FrameRate),
            ["SetProperty", node, name, value] => Some(Command::SetProperty {
                node: Some(owned(node)),
                name: owned(name),
                value: owned(value),
            }),
            ["SetProperty", name, value] => {
                Some(Command::SetProperty { node: None, name: owned(name), value: owned(value) })
            }
            ["GetProperty", node, name] => {
                Some(Command::GetProperty { node: Some(owned(node)), name: owned(name) })
            }
            ["GetProperty", name] => Some(Command::GetProperty { node: None, name: owned(name) }),
            ["EnableAsset", name] => Some(Command::EnableAsset(owned(name))),
            ["DisableAsset", name] => Some(Command::DisableAsset(owned(name))),
            ["SubscribeToData"] => Some(Command::ClearNameSubscriptions),
            ["SubscribeByID"] => Some(Command::ClearIdSubscriptions),
            ["SubscribeToData", kind, "all"] => Some(Command::SubscribeAll { kind: owned(kind) }),
            ["SubscribeToData", kind, name] => {
                Some(Command::Subscribe { kind: owned(kind), asset: AssetRef::Name(owned(name)) })
            }
            ["SubscribeToData", kind, name, "None"] => {
                Some(Command::Unsubscribe { kind: owned(kind), asset: AssetRef::Name(owned(name)) })
            }
            ["SubscribeByID", kind, id] => id
                .parse()
                .ok()
                .map(|id| Command::Subscribe { kind: owned(kind), asset: AssetRef::Id(id) }),
            ["SubscribeByID", kind, id, "None"] => id
                .parse()
                .ok()
                .map(|id| Command::Unsubscribe { kind: owned(kind), asset: AssetRef::Id(id) }),
            ["Bitstream", version] => version.parse().ok().map(Command::Bitstream),
            _ => None,
        };
        parsed.unwrap_or(Command::Raw(text))
    }
}

/// Reads the `i32` status code most commands answer with.
pub fn response_status(payload: &[u8]) -> Result<i32> {
    let bytes = payload.get(..4).ok_or_else(|| {
        NatNetError::malformed("response", format!("expected i32 status, got {} bytes", payload.len()))
    })?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Reads the `f32` frame rate answer to [`Command::FrameRate`].
pub fn response_f32(payload: &[u8]) -> Result<f32> {
    let bytes = payload.get(..4).ok_or_else(|| {
        NatNetError::malformed("response", format!("expected f32, got {} bytes", payload.len()))
    })?;
    Ok(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_commands() {
        let cases = [
            (Command::FrameRate, "FrameRate"),
            (
                Command::SetProperty { node: None, name: "Master Rate".into(), value: "120".into() },
                "SetProperty,Master Rate,120",
            ),
            (
                Command::GetProperty { node: Some("RB0".into()), name: "Enabled".into() },
                "GetProperty,RB0,Enabled",
            ),
            (Command::Subscribe { kind: RIGID_BODY.into(), asset: "RB0".into() }, "SubscribeToData,RigidBody,RB0"),
            (Command::Subscribe { kind: RIGID_BODY.into(), asset: 3.into() }, "SubscribeByID,RigidBody,3"),
            (Command::SubscribeAll { kind: RIGID_BODY.into() }, "SubscribeToData,RigidBody,all"),
            (
                Command::Unsubscribe { kind: RIGID_BODY.into(), asset: "RB0".into() },
                "SubscribeToData,RigidBody,RB0,None",
            ),
            (Command::Unsubscribe { kind: RIGID_BODY.into(), asset: 3.into() }, "SubscribeByID,RigidBody,3,None"),
            (Command::ClearNameSubscriptions, "SubscribeToData"),
            (Command::Bitstream(Version::new(3, 1)), "Bitstream,3.1"),
            (Command::EnableAsset("RB0".into()), "EnableAsset,RB0"),
        ];
        for (command, text) in cases {
            assert_eq!(command.to_string(), text);
            assert_eq!(Command::parse(&command.to_bytes()), command, "{text}");
        }
    }

    #[test]
    fn empty_tokens_are_dropped() {
        let command = Command::SetProperty { node: Some(String::new()), name: "Master Rate".into(), value: "60".into() };
        assert_eq!(command.to_string(), "SetProperty,Master Rate,60");
    }

    #[test]
    fn unknown_text_is_raw() {
        assert_eq!(Command::parse(b"TimelinePlay\0"), Command::Raw("TimelinePlay".into()));
        assert_eq!(Command::parse(b"SubscribeByID,RigidBody,abc"), Command::Raw("SubscribeByID,RigidBody,abc".into()));
    }

    #[test]
    fn response_scalars() {
        assert_eq!(response_status(&0i32.to_le_bytes()).expect("status"), 0);
        assert_eq!(response_f32(&120.0f32.to_le_bytes()).expect("rate"), 120.0);
        assert!(response_status(&[1]).is_err());
    }
}
