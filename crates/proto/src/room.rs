use rand::Rng;
use uuid::Uuid;

/// Room codes are fixed-length alphanumeric, compared case-insensitively.
pub const ROOM_CODE_LEN: usize = 6;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Canonical form of a room code: trimmed and uppercased. Used both as the
/// registry lookup key and as the key-derivation input.
pub fn normalize_room_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Generate a fresh room code. The code doubles as the only secret the key
/// derivation sees, so its entropy is the protection against an outsider
/// joining the room.
pub fn generate_room_code() -> String {
    let mut rng = rand::thread_rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Generate a unique participant id for this client session.
pub fn generate_participant_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_code_has_fixed_length_and_alphabet() {
        let code = generate_room_code();
        assert_eq!(code.len(), ROOM_CODE_LEN);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
    }

    #[test]
    fn normalization_is_case_insensitive() {
        assert_eq!(normalize_room_code(" abc123 "), "ABC123");
        assert_eq!(normalize_room_code("ABC123"), "ABC123");
    }

    #[test]
    fn participant_ids_are_unique() {
        assert_ne!(generate_participant_id(), generate_participant_id());
    }
}
