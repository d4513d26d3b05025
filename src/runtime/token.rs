//! Event token encoding for mio registrations.
//!
//! Each registered connection is addressed by its arena [`Key`]. The key is
//! packed into the mio token so a readiness event for a connection that was
//! closed (and whose slot was reused) decodes to a stale key and is ignored.

use crate::runtime::pool::Key;
use mio::Token;

/// Token of the worker's listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token of the worker's stop waker.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// What a readiness event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Listener,
    Waker,
    Connection(Key),
}

// Keys pack generation and index into one usize.
const _: () = assert!(usize::BITS >= 64, "event tokens require a 64-bit target");

/// Pack a connection key into a token.
pub fn encode(key: Key) -> Token {
    Token(((key.generation as usize) << 32) | key.index as usize)
}

/// Decode an event token.
pub fn decode(token: Token) -> EventSource {
    match token {
        LISTENER_TOKEN => EventSource::Listener,
        WAKER_TOKEN => EventSource::Waker,
        Token(raw) => EventSource::Connection(Key {
            index: (raw & 0xFFFF_FFFF) as u32,
            generation: (raw >> 32) as u32,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::pool::Arena;

    #[test]
    fn test_token_round_trip() {
        let key = Key {
            index: 7,
            generation: 3,
        };
        assert_eq!(decode(encode(key)), EventSource::Connection(key));
        assert_eq!(decode(LISTENER_TOKEN), EventSource::Listener);
        assert_eq!(decode(WAKER_TOKEN), EventSource::Waker);

        let key = Key {
            index: u32::MAX - 2,
            generation: u32::MAX,
        };
        assert_eq!(decode(encode(key)), EventSource::Connection(key));
    }

    #[test]
    fn test_stale_token() {
        let mut arena = Arena::new(4);

        let t1 = encode(arena.insert("first").unwrap());
        let EventSource::Connection(k1) = decode(t1) else {
            panic!("expected connection token");
        };
        arena.remove(k1);

        // Slot reused; the old token no longer resolves.
        let t2 = encode(arena.insert("second").unwrap());
        assert_ne!(t1, t2);
        assert!(arena.get(k1).is_none());
        let EventSource::Connection(k2) = decode(t2) else {
            panic!("expected connection token");
        };
        assert_eq!(arena.get(k2), Some(&"second"));
    }
}
