//! Wire protocol shared by the signaling relay and the session controller.

mod frame;
mod room;

pub use frame::{parse_frame, Frame, UserInfo, WireError};
pub use room::{generate_participant_id, generate_room_code, normalize_room_code, ROOM_CODE_LEN};
