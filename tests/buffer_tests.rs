//! Tests for the chunked byte queue

use childmux::buffer::MemBuffer;

#[cfg(test)]
mod consume_tests {
    use super::*;

    #[test]
    fn test_append_then_consume_returns_same_bytes() {
        let mut buf = MemBuffer::new();
        buf.append(b"hello world".to_vec());

        let out = buf.take(11);
        assert_eq!(out.as_deref(), Some(&b"hello world"[..]));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_consume_spans_chunks() {
        let mut buf = MemBuffer::new();
        buf.append(&b"abc"[..]);
        buf.append(&b"def"[..]);
        buf.append(&b"ghi"[..]);
        assert_eq!(buf.size(), 9);

        assert_eq!(buf.take(4).as_deref(), Some(&b"abcd"[..]));
        assert_eq!(buf.front(), Some(&b"ef"[..]), "Head chunk keeps its offset");
        assert_eq!(buf.take_all(), b"efghi");
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn test_consume_more_than_available_fails_untouched() {
        let mut buf = MemBuffer::new();
        buf.append(&b"short"[..]);

        assert!(buf.take(6).is_none());
        assert_eq!(buf.size(), 5, "Failed consume must not drop bytes");
        assert!(buf.discard(5));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_append_is_ignored() {
        let mut buf = MemBuffer::new();
        buf.append(Vec::new());
        assert!(buf.front().is_none());
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn test_unconsume_restores_front_byte() {
        let mut buf = MemBuffer::new();
        buf.append(&b"xyz"[..]);
        assert!(buf.discard(1));

        buf.unconsume(b'x');
        assert_eq!(buf.size(), 3);
        assert_eq!(buf.take_all(), b"xyz");

        buf.unconsume(b'!');
        assert_eq!(buf.take_all(), b"!");
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut buf = MemBuffer::new();
        buf.append(&b"abc"[..]);
        buf.discard(1);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.front().is_none());
    }
}

#[cfg(test)]
mod scan_line_tests {
    use super::*;

    #[test]
    fn test_scan_line_stops_at_newline_without_consuming() {
        let mut buf = MemBuffer::new();
        buf.append(&b"abc\ndef"[..]);

        let mut line = Vec::new();
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"abc");
        assert_eq!(buf.size(), 7, "Scanning must not consume");

        buf.discard(line.len() + 1);
        assert_eq!(buf.front(), Some(&b"def"[..]));
        assert!(!buf.scan_line(&mut line), "No terminator yet");
        assert!(line.is_empty(), "Failed scan leaves output empty");

        buf.append(&b"\n"[..]);
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"def");
    }

    #[test]
    fn test_scan_line_across_chunk_boundary() {
        let mut buf = MemBuffer::new();
        buf.append(&b"par"[..]);
        buf.append(&b"tial li"[..]);
        buf.append(&b"ne\nrest"[..]);

        let mut line = Vec::new();
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"partial line");
    }

    #[test]
    fn test_scan_line_respects_head_offset() {
        let mut buf = MemBuffer::new();
        buf.append(&b"one\ntwo\n"[..]);
        buf.discard(4);

        let mut line = Vec::new();
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"two");
    }

    #[test]
    fn test_embedded_nul_terminates_line_and_keeps_tail() {
        let mut buf = MemBuffer::new();
        buf.append(&b"ab\0cd\n"[..]);

        let mut line = Vec::new();
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"ab");

        buf.discard(line.len() + 1);
        assert!(buf.scan_line(&mut line));
        assert_eq!(line, b"cd", "Bytes after the NUL stay buffered");
    }
}
