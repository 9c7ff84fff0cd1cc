use dashmap::DashMap;
use parley_proto::{normalize_room_code, Frame, UserInfo};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors the registry reports back to the offending connection only.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid join request: {0}")]
    InvalidJoinRequest(&'static str),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

/// One participant of a room. The transport handle is the sender half of
/// the connection's writer task; replacing it is how a reconnection with
/// the same id takes over the slot.
struct Participant {
    name: String,
    is_initiator: bool,
    tx: mpsc::UnboundedSender<Frame>,
}

#[derive(Default)]
struct Room {
    participants: HashMap<String, Participant>,
}

/// Outcome of an accepted join, for the connection handler's session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinSummary {
    /// Normalized room code the participant was filed under.
    pub room_code: String,
    pub is_initiator: bool,
    /// False when the join replaced an existing participant's transport.
    pub newly_added: bool,
}

/// Owns all room state and every send toward participants.
///
/// Rooms live in a `DashMap`; joins, leaves, and relays on the same room go
/// through its entry lock, so a participant removed mid-relay is never sent
/// to. Sends are fire-and-forget unbounded-channel writes and a failure for
/// one recipient never affects the others.
pub struct Registry {
    rooms: DashMap<String, Room>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    /// Add a participant to a room, creating the room if needed.
    ///
    /// The first participant of an empty room becomes the initiator. A join
    /// carrying an id already present in the room replaces that
    /// participant's transport (reconnection): the stored role is kept and
    /// no join notifications are re-sent. New additions are announced both
    /// ways with `user_joined`.
    pub fn join(
        &self,
        room_code: &str,
        user: &UserInfo,
        tx: mpsc::UnboundedSender<Frame>,
    ) -> Result<JoinSummary, RelayError> {
        if room_code.trim().is_empty() {
            return Err(RelayError::InvalidJoinRequest("roomId must not be empty"));
        }
        if user.id.trim().is_empty() {
            return Err(RelayError::InvalidJoinRequest("user id must not be empty"));
        }
        if user.name.trim().is_empty() {
            return Err(RelayError::InvalidJoinRequest(
                "display name must not be empty",
            ));
        }

        let room_code = normalize_room_code(room_code);
        let mut room = self.rooms.entry(room_code.clone()).or_default();

        if let Some(existing) = room.participants.get_mut(&user.id) {
            debug!(room = %room_code, user = %user.id, "reconnection, replacing transport");
            existing.tx = tx.clone();
            let summary = JoinSummary {
                room_code: room_code.clone(),
                is_initiator: existing.is_initiator,
                newly_added: false,
            };
            let _ = tx.send(Frame::RoomJoined {
                room_id: room_code,
                is_initiator: summary.is_initiator,
            });
            return Ok(summary);
        }

        let is_initiator = room.participants.is_empty();
        room.participants.insert(
            user.id.clone(),
            Participant {
                name: user.name.clone(),
                is_initiator,
                tx: tx.clone(),
            },
        );
        info!(room = %room_code, user = %user.id, initiator = is_initiator, "participant joined");

        let _ = tx.send(Frame::RoomJoined {
            room_id: room_code.clone(),
            is_initiator,
        });

        // Announce both ways, once per actual addition.
        for (other_id, other) in &room.participants {
            if other_id == &user.id {
                continue;
            }
            let _ = other.tx.send(Frame::UserJoined {
                user: user.clone(),
                room_id: room_code.clone(),
            });
            let _ = tx.send(Frame::UserJoined {
                user: UserInfo {
                    id: other_id.clone(),
                    name: other.name.clone(),
                },
                room_id: room_code.clone(),
            });
        }

        Ok(JoinSummary {
            room_code,
            is_initiator,
            newly_added: true,
        })
    }

    /// Forward a negotiation frame unchanged to every other participant of
    /// the room. An unknown room or sender means the frame raced a
    /// departure; it is dropped without error.
    pub fn relay(&self, room_code: &str, sender_id: &str, frame: Frame) {
        let room_code = normalize_room_code(room_code);
        let Some(room) = self.rooms.get(&room_code) else {
            debug!(room = %room_code, kind = frame.kind(), "relay to unknown room dropped");
            return;
        };
        if !room.participants.contains_key(sender_id) {
            debug!(room = %room_code, sender = %sender_id, "relay from unknown sender dropped");
            return;
        }
        for (id, participant) in &room.participants {
            if id == sender_id {
                continue;
            }
            if participant.tx.send(frame.clone()).is_err() {
                warn!(room = %room_code, recipient = %id, "relay send failed, transport gone");
            }
        }
    }

    /// Remove a participant, notify the remainder, and delete the room the
    /// moment it empties.
    pub fn leave(&self, room_code: &str, user_id: &str) {
        let room_code = normalize_room_code(room_code);

        if let Some(mut room) = self.rooms.get_mut(&room_code) {
            if room.participants.remove(user_id).is_some() {
                info!(room = %room_code, user = %user_id, "participant left");
                for participant in room.participants.values() {
                    let _ = participant.tx.send(Frame::UserLeft {
                        user_id: user_id.to_string(),
                        room_id: room_code.clone(),
                    });
                }
                // The survivor becomes the initiator for the next pairing.
                if room.participants.len() == 1 {
                    for participant in room.participants.values_mut() {
                        participant.is_initiator = true;
                    }
                }
            }
        }

        // Atomic check-and-remove: a join can repopulate the room between
        // the guard release above and this call, in which case the room
        // must survive.
        if self
            .rooms
            .remove_if(&room_code, |_, room| room.participants.is_empty())
            .is_some()
        {
            debug!(room = %room_code, "room removed, no participants remain");
        }
    }

    /// Like [`Registry::leave`], but only if the participant's stored
    /// transport is still `tx`. A reconnection replaces the transport, so
    /// the replaced socket's eventual close must not evict the freshly
    /// reconnected participant. (The original server deleted by id on any
    /// close; with transport replacement the guard is required.)
    pub fn leave_connection(
        &self,
        room_code: &str,
        user_id: &str,
        tx: &mpsc::UnboundedSender<Frame>,
    ) {
        let normalized = normalize_room_code(room_code);
        let current = self
            .rooms
            .get(&normalized)
            .and_then(|room| {
                room.participants
                    .get(user_id)
                    .map(|p| p.tx.same_channel(tx))
            })
            .unwrap_or(false);
        if current {
            self.leave(&normalized, user_id);
        } else {
            debug!(room = %normalized, user = %user_id, "stale connection close ignored");
        }
    }

    #[cfg(test)]
    fn room_size(&self, room_code: &str) -> usize {
        self.rooms
            .get(&normalize_room_code(room_code))
            .map(|r| r.participants.len())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn initiator_count(&self, room_code: &str) -> usize {
        self.rooms
            .get(&normalize_room_code(room_code))
            .map(|r| {
                r.participants
                    .values()
                    .filter(|p| p.is_initiator)
                    .count()
            })
            .unwrap_or(0)
    }
}
