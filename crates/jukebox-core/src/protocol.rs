use crate::cache::CacheStatistics;
use crate::queue::{EntryId, QueueEntry};
use crate::service::QueueSnapshot;
use serde::{Deserialize, Serialize};

/// Bump when the wire format changes in a breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest JSON body either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Messages sent from a control client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Queue a URL or search query. `play_next` puts it at the front.
    Enqueue {
        query: String,
        requester: String,
        #[serde(default)]
        play_next: bool,
    },
    Skip,
    Stop,
    Start,
    ClearQueue,
    GetQueue,
    CacheStats,
    ClearCache,
}

/// Messages sent from the daemon to control clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent on connect.
    Hello {
        protocol_version: u32,
        queue: QueueSnapshot,
    },
    Queue {
        queue: QueueSnapshot,
    },
    Enqueued {
        entry: QueueEntry,
    },
    TitleResolved {
        entry_id: EntryId,
        title: String,
    },
    CacheStats {
        stats: CacheStatistics,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    /// 4-byte big-endian length followed by the JSON body.
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = u32::try_from(json.len())?;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Size of the complete frame at the front of `data`, header included.
    /// `Ok(None)` while more bytes are needed; an error for a header
    /// announcing more than [`MAX_FRAME_LEN`].
    pub fn frame_len(data: &[u8]) -> anyhow::Result<Option<usize>> {
        let Some(header) = data.get(..4) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_LEN {
            anyhow::bail!("Frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
        }
        Ok((data.len() >= 4 + len).then_some(4 + len))
    }

    /// Decodes one frame from the front of `data`, returning the message and
    /// the number of bytes consumed.
    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(total) = Self::frame_len(data)? else {
            anyhow::bail!("Insufficient data for message");
        };
        let msg: Self = serde_json::from_slice(&data[4..total])?;
        Ok((msg, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_encode_decode() {
        let msg = Message::Command(Command::Enqueue {
            query: "https://youtu.be/dQw4w9WgXcQ".into(),
            requester: "alice".into(),
            play_next: true,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::Enqueue { query, requester, play_next }) => {
                assert_eq!(query, "https://youtu.be/dQw4w9WgXcQ");
                assert_eq!(requester, "alice");
                assert!(play_next);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_play_next_defaults_to_false() {
        let json = br#"{"cmd":"Enqueue","query":"lofi","requester":"bob"}"#;
        let mut frame = (json.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(json);
        match Message::decode(&frame).unwrap().0 {
            Message::Command(Command::Enqueue { play_next, .. }) => assert!(!play_next),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_is_rejected() {
        let encoded = Message::Command(Command::Skip).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_bad_frame_can_be_skipped() {
        let json = br#"{"cmd":"Bogus"}"#;
        let mut buf = (json.len() as u32).to_be_bytes().to_vec();
        buf.extend_from_slice(json);
        buf.extend(Message::Command(Command::Skip).encode().unwrap());

        assert!(Message::decode(&buf).is_err());
        let bad = Message::frame_len(&buf).unwrap().unwrap();
        assert_eq!(bad, 4 + json.len());
        let (next, _) = Message::decode(&buf[bad..]).unwrap();
        assert!(matches!(next, Message::Command(Command::Skip)));
    }

    #[test]
    fn test_oversized_header_is_rejected() {
        let header = u32::MAX.to_be_bytes();
        assert!(Message::frame_len(&header).is_err());
        assert!(Message::frame_len(&header[..3]).unwrap().is_none());
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = Message::Command(Command::Stop).encode().unwrap();
        buf.extend(Message::Command(Command::GetQueue).encode().unwrap());
        let (first, used) = Message::decode(&buf).unwrap();
        assert!(matches!(first, Message::Command(Command::Stop)));
        let (second, _) = Message::decode(&buf[used..]).unwrap();
        assert!(matches!(second, Message::Command(Command::GetQueue)));
    }
}
