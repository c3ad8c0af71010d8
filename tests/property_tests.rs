//! Property-based tests for logpipe using proptest

use logpipe::appenders::network::{encode_frame, Frame, FrameReader};
use logpipe::appenders::FileSink;
use logpipe::core::{CoalescingState, Encoding, Offer};
use logpipe::prelude::*;
use proptest::prelude::*;
use std::io::Cursor;
use std::sync::Arc;

fn any_level() -> impl Strategy<Value = LogLevel> {
    prop_oneof![
        Just(LogLevel::NotSet),
        Just(LogLevel::Debug),
        Just(LogLevel::Info),
        Just(LogLevel::Warning),
        Just(LogLevel::Error),
        Just(LogLevel::Fatal),
        Just(LogLevel::Exception),
        Just(LogLevel::NoLog),
    ]
}

// ============================================================================
// LogLevel Tests
// ============================================================================

proptest! {
    /// Symbol and numeric forms both roundtrip
    #[test]
    fn test_log_level_roundtrip(level in any_level()) {
        let parsed: LogLevel = level.to_str().parse().unwrap();
        prop_assert_eq!(level, parsed);
        prop_assert_eq!(LogLevel::from_u8(level.as_u8()), Some(level));
    }

    /// Ordering follows the numeric values
    #[test]
    fn test_log_level_ordering(a in any_level(), b in any_level()) {
        prop_assert_eq!(a.cmp(&b), a.as_u8().cmp(&b.as_u8()));
    }

    /// Only multiples of ten up to 70 are levels
    #[test]
    fn test_log_level_from_arbitrary_u8(value in any::<u8>()) {
        let expected = value % 10 == 0 && value <= 70;
        prop_assert_eq!(LogLevel::from_u8(value).is_some(), expected);
    }
}

// ============================================================================
// Encoding Tests
// ============================================================================

proptest! {
    /// Single-byte encodings emit one byte per character
    #[test]
    fn test_single_byte_encodings_preserve_length(text in ".*") {
        let chars = text.chars().count();
        prop_assert_eq!(Encoding::Latin1.encode(&text).len(), chars);
        prop_assert_eq!(Encoding::Ascii.encode(&text).len(), chars);
    }

    /// ASCII text is unchanged by every encoding
    #[test]
    fn test_ascii_text_is_unchanged(text in "[ -~]*") {
        for encoding in [Encoding::Utf8, Encoding::Latin1, Encoding::Ascii] {
            prop_assert_eq!(encoding.encode(&text), text.as_bytes().to_vec());
        }
    }
}

// ============================================================================
// Coalescing Tests
// ============================================================================

proptest! {
    /// Every held repeat is accounted for by exactly one flushed count
    #[test]
    fn test_coalescing_accounts_for_every_repeat(
        keys in prop::collection::vec(0u8..3, 0..200),
        max in 1u32..6,
    ) {
        let total = keys.len() as u64;
        let mut state = CoalescingState::new(max);
        let mut emitted = 0u64;
        let mut held = 0u64;
        let mut flushed_repeats = 0u64;

        for key in keys {
            let entry = LogEntry::new("prop", LogLevel::Info, format!("message {}", key));
            match state.offer(key.to_string(), entry, false) {
                Offer::Emit(_) => emitted += 1,
                Offer::Held { .. } => held += 1,
                Offer::FlushThenEmit { flushed, .. } => {
                    prop_assert!(flushed.count >= 2 && flushed.count <= max);
                    flushed_repeats += u64::from(flushed.count - 1);
                    emitted += 1;
                }
            }
            prop_assert!(state.repeat_count() <= max);
        }
        if let (Some(flushed), _) = state.take_pending() {
            flushed_repeats += u64::from(flushed.count - 1);
        }

        prop_assert_eq!(held, flushed_repeats);
        prop_assert_eq!(emitted + held, total);
        prop_assert!(!state.is_pending());
    }
}

// ============================================================================
// Wire Format Tests
// ============================================================================

proptest! {
    /// A stream of frames decodes to the same entries in order
    #[test]
    fn test_frame_stream_decodes_in_order(
        messages in prop::collection::vec(".*", 1..20),
        level in any_level(),
    ) {
        let entries: Vec<LogEntry> = messages
            .iter()
            .map(|m| {
                LogEntry::new("wire", level, m.clone())
                    .with_time(1_700_000_000.25)
                    .with_attrs(Attributes::new().with("len", m.len() as i64))
            })
            .collect();
        let mut stream = Vec::new();
        for entry in &entries {
            stream.extend(encode_frame(entry).unwrap());
        }

        let mut reader = FrameReader::new(Cursor::new(stream));
        for expected in &entries {
            match reader.next_frame().unwrap() {
                Frame::Entry(decoded) => prop_assert_eq!(&decoded, expected),
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }
        prop_assert!(matches!(reader.next_frame().unwrap(), Frame::Closed));
    }
}

// ============================================================================
// Rotation Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// No file outgrows the size limit when lines fit into it
    #[test]
    fn test_rotation_respects_size_limit(
        lengths in prop::collection::vec(1usize..60, 1..80),
        background in any::<bool>(),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop.log");
        let max_size = 100u64;
        let policy = RotationPolicy::new(max_size, 2).unwrap();
        let mut sink = FileSink::open(&path, policy, Arc::new(LogConfig::default())).unwrap();

        for len in lengths {
            let outcome = sink.append(&"x".repeat(len), background);
            prop_assert!(outcome.errors.is_empty());
            prop_assert!(sink.written_size() <= max_size);
        }
        sink.close().unwrap();

        let mut name = path.as_os_str().to_owned();
        name.push(".3");
        prop_assert!(!std::path::Path::new(&name).exists());
        prop_assert!(std::fs::metadata(&path).unwrap().len() <= max_size);
    }
}
