//! Fuzz target for message payload parsing.
//!
//! Every payload that decodes must encode again without panicking, and
//! the re-encoded form must decode to the same message.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run message_decode -- -max_total_time=300
//! ```

#![no_main]
use libfuzzer_sys::fuzz_target;
use tether_proto::ssh::message::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode(data) {
        let encoded = message.encode();
        let reparsed = Message::decode(&encoded).expect("re-encoded message must parse");
        assert_eq!(message, reparsed);
    }
});
