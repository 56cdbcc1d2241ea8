//! The text control channel: a minimal string protocol riding the
//! transport's text frames. Commands carry no resource id; replies are
//! JSON objects sent back on the same channel.

use std::str::FromStr;

use serde::Serialize;
use strum::EnumString;

use crate::proto::PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "UPPERCASE")]
enum Verb {
    Set,
    Get,
    Stats,
    Ping,
    Pong,
    Help,
}

/// One parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `SET UUID <v>` — the client publishes its session identity.
    SetUuid(String),
    /// `SET LOGLEVEL <v>` — change the active log filter (egress only).
    SetLogLevel(String),
    GetStatus,
    GetInfo,
    GetVersion,
    Stats,
    Ping,
    /// Liveness ack; never answered.
    Pong,
    Help,
    Unknown(String),
}

/// Parses one text frame: strips an optional leading `/` or `CMD `,
/// splits on whitespace, uppercases the verb.
pub fn parse(line: &str) -> Command {
    let line = line.trim();
    let line = line.strip_prefix('/').unwrap_or(line);
    let line = line.strip_prefix("CMD ").unwrap_or(line);
    let mut parts = line.split_whitespace();
    let Some(raw_verb) = parts.next() else {
        return Command::Unknown(String::new());
    };
    let verb = raw_verb.to_ascii_uppercase();
    match Verb::from_str(&verb) {
        Ok(Verb::Set) => {
            let target = parts.next().map(str::to_ascii_uppercase);
            let value = parts.next().map(str::to_owned);
            match (target.as_deref(), value) {
                (Some("UUID"), Some(v)) => Command::SetUuid(v),
                (Some("LOGLEVEL"), Some(v)) => Command::SetLogLevel(v),
                _ => Command::Unknown(line.to_owned()),
            }
        }
        Ok(Verb::Get) => match parts.next().map(|a| a.to_ascii_uppercase()).as_deref() {
            Some("STATUS") => Command::GetStatus,
            Some("INFO") => Command::GetInfo,
            Some("VERSION") => Command::GetVersion,
            _ => Command::Unknown(line.to_owned()),
        },
        Ok(Verb::Stats) => Command::Stats,
        Ok(Verb::Ping) => Command::Ping,
        Ok(Verb::Pong) => Command::Pong,
        Ok(Verb::Help) => Command::Help,
        Err(_) => Command::Unknown(raw_verb.to_owned()),
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> CommandResponse {
        CommandResponse {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: serde_json::Value) -> CommandResponse {
        CommandResponse {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> CommandResponse {
        CommandResponse {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn render(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"success":false,"message":"render failed"}"#.to_owned())
    }
}

/// Snapshot a peer hands to [`respond`] for the informational verbs.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub role: &'static str,
    pub started_at_millis: i64,
    pub uptime_secs: u64,
    pub sessions: usize,
    pub streams: usize,
    pub reconnects: u64,
}

const HELP_TEXT: &str = "commands: SET UUID <v> | SET LOGLEVEL <v> | GET STATUS | GET INFO | \
     GET VERSION | STATS | PING | PONG | HELP";

/// Builds the reply for a command. Returns `None` for commands that get
/// no reply (`PONG`) and for `SET UUID`, whose effect and reply belong
/// to the session layer.
pub fn respond(command: &Command, cx: &CommandContext) -> Option<CommandResponse> {
    let response = match command {
        Command::SetUuid(_) | Command::Pong => return None,
        Command::SetLogLevel(level) => match crate::config::set_log_filter(level) {
            Ok(()) => CommandResponse::ok(format!("log level set to {level}")),
            Err(e) => CommandResponse::fail(format!("invalid log level: {e}")),
        },
        Command::GetStatus => CommandResponse::ok_with(
            "connected",
            serde_json::json!({ "status": "connected" }),
        ),
        Command::GetInfo => CommandResponse::ok_with(
            "info",
            serde_json::json!({
                "role": cx.role,
                "timestamp": chrono::Utc::now().timestamp_millis(),
                "started_at": cx.started_at_millis,
                "uptime": cx.uptime_secs,
            }),
        ),
        Command::GetVersion => CommandResponse::ok_with(
            "version",
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "protocol": PROTOCOL_VERSION,
            }),
        ),
        Command::Stats => CommandResponse::ok_with(
            "stats",
            serde_json::json!({
                "uptime": cx.uptime_secs,
                "sessions": cx.sessions,
                "streams": cx.streams,
                "reconnects": cx.reconnects,
            }),
        ),
        Command::Ping => CommandResponse::ok_with(
            "PONG",
            serde_json::json!({ "timestamp": chrono::Utc::now().timestamp_millis() }),
        ),
        Command::Help => CommandResponse::ok(HELP_TEXT),
        Command::Unknown(verb) => {
            CommandResponse::fail(format!("Unknown command: {verb}"))
        }
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cx() -> CommandContext {
        CommandContext {
            role: "egress",
            started_at_millis: 0,
            uptime_secs: 12,
            sessions: 1,
            streams: 3,
            reconnects: 0,
        }
    }

    #[test]
    fn parses_verbs_with_optional_prefixes() {
        assert_eq!(parse("PING"), Command::Ping);
        assert_eq!(parse("/ping"), Command::Ping);
        assert_eq!(parse("CMD PING"), Command::Ping);
        assert_eq!(parse("get status"), Command::GetStatus);
        assert_eq!(parse("GET  VERSION"), Command::GetVersion);
        assert_eq!(
            parse("SET UUID 0123456789abcdef0123456789abcdef"),
            Command::SetUuid("0123456789abcdef0123456789abcdef".into())
        );
        assert_eq!(
            parse("set loglevel debug"),
            Command::SetLogLevel("debug".into())
        );
    }

    #[test]
    fn unknown_verbs_fail_gracefully() {
        let Command::Unknown(_) = parse("FROBNICATE now") else {
            panic!("expected unknown command");
        };
        let reply = respond(&parse("FROBNICATE"), &cx()).unwrap();
        assert!(!reply.success);
        assert!(reply.message.starts_with("Unknown command"));
    }

    #[test]
    fn ping_reply_is_parseable_pong() {
        let reply = respond(&Command::Ping, &cx()).unwrap();
        let json: serde_json::Value = serde_json::from_str(&reply.render()).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["message"], "PONG");
        assert!(json["data"]["timestamp"].is_i64());
    }

    #[test]
    fn pong_and_set_uuid_are_not_answered_here() {
        assert!(respond(&Command::Pong, &cx()).is_none());
        assert!(respond(&Command::SetUuid("u".into()), &cx()).is_none());
    }

    #[test]
    fn incomplete_set_is_unknown() {
        assert!(matches!(parse("SET UUID"), Command::Unknown(_)));
        assert!(matches!(parse("SET"), Command::Unknown(_)));
        assert!(matches!(parse(""), Command::Unknown(_)));
    }
}
