//! Wire frames exchanged with WebSocket clients.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Reject;

/* ── inbound ── */

/// Raw `{type, data}` frame, before the type is resolved.
#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub room_id: String,
    pub creator_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddToQueue {
    pub room_id: String,
    pub user_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVote {
    pub room_id: String,
    pub user_id: String,
    pub stream_id: String,
    pub vote: Vote,
}

/// Anything other than `"upvote"` withdraws the vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    #[serde(rename = "upvote")]
    Upvote,
    #[serde(rename = "downvote")]
    #[serde(other)]
    Downvote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    JoinRoom(JoinRoom),
    LeaveRoom,
    AddToQueue(AddToQueue),
    CastVote(CastVote),
}

impl Inbound {
    pub fn parse(raw: &str) -> Result<Self, Reject> {
        let frame: RawFrame = serde_json::from_str(raw).map_err(|_| Reject::Malformed)?;
        let data = frame.data;
        let msg = match frame.kind.as_str() {
            "join-room"    => serde_json::from_value(data).map(Inbound::JoinRoom),
            "leave-room"   => Ok(Inbound::LeaveRoom),
            "add-to-queue" => serde_json::from_value(data).map(Inbound::AddToQueue),
            "cast-vote"    => serde_json::from_value(data).map(Inbound::CastVote),
            other          => return Err(Reject::UnknownMessageType(other.to_string())),
        };
        msg.map_err(|_| Reject::Malformed)
    }
}

/* ── outbound ── */

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    Error {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    Joined {
        room_id: String,
    },
}

impl Outbound {
    pub fn to_text(&self) -> String {
        // plain enum of strings, cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl From<&Reject> for Outbound {
    fn from(r: &Reject) -> Self {
        Outbound::Error { message: r.to_string() }
    }
}

/// Change signals carried over the fanout channel and relayed to members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Notice {
    NewVote,
    NewStream,
}

impl Notice {
    pub fn to_text(self) -> String {
        serde_json::to_string(&self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_room_is_parsed() {
        let raw = r#"{"type":"join-room","data":{"roomId":"r1","creatorId":"c","userId":"u"}}"#;
        let msg = Inbound::parse(raw).unwrap();
        assert_eq!(
            msg,
            Inbound::JoinRoom(JoinRoom {
                room_id: "r1".into(),
                creator_id: "c".into(),
                user_id: "u".into(),
            })
        );
    }

    #[test]
    fn any_non_upvote_counts_as_downvote() {
        for (word, expected) in [("upvote", Vote::Upvote), ("downvote", Vote::Downvote), ("meh", Vote::Downvote)] {
            let raw = format!(
                r#"{{"type":"cast-vote","data":{{"roomId":"r","userId":"u","streamId":"s","vote":"{word}"}}}}"#
            );
            match Inbound::parse(&raw).unwrap() {
                Inbound::CastVote(v) => assert_eq!(v.vote, expected, "vote word {word}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_type_is_rejected_explicitly() {
        let err = Inbound::parse(r#"{"type":"skip-song","data":{}}"#).unwrap_err();
        assert_eq!(err, Reject::UnknownMessageType("skip-song".into()));
        assert_eq!(err.to_string(), "Unknown message type: skip-song");
    }

    #[test]
    fn broken_frames_are_malformed() {
        assert_eq!(Inbound::parse("not json").unwrap_err(), Reject::Malformed);
        assert_eq!(
            Inbound::parse(r#"{"type":"add-to-queue","data":{"roomId":"r"}}"#).unwrap_err(),
            Reject::Malformed
        );
    }

    #[test]
    fn leave_room_needs_no_data() {
        assert_eq!(Inbound::parse(r#"{"type":"leave-room"}"#).unwrap(), Inbound::LeaveRoom);
    }

    #[test]
    fn outbound_frames_match_wire_shape() {
        let err = Outbound::from(&Reject::QueueFull).to_text();
        assert_eq!(err, r#"{"type":"error","message":"Queue is full"}"#);

        let joined = Outbound::Joined { room_id: "r1".into() }.to_text();
        assert_eq!(joined, r#"{"type":"joined","roomId":"r1"}"#);

        assert_eq!(Notice::NewVote.to_text(), r#"{"type":"new-vote"}"#);
        assert_eq!(Notice::NewStream.to_text(), r#"{"type":"new-stream"}"#);
    }
}
