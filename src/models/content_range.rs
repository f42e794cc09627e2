//! Content-Range header parsing for the upload protocol.
//!
//! Two header shapes drive the protocol on the upload URL:
//!
//! - `bytes */<total>` is a status probe asking how far the upload got
//! - `bytes <from>-<to>/<total>` is a chunk carrying that byte range
//!
//! The grammar is strict: plain decimal digits, single separators, no
//! whitespace games. Anything else is answered with 422 so broken clients
//! fail loudly instead of corrupting an upload.

/// Parsed `Content-Range` header of an upload request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes */<total>`: resume query, empty body
    Status { total: u64 },
    /// `bytes <from>-<to>/<total>`: chunk body covering the range
    Chunk(ChunkRange),
}

/// Byte range of a single chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// First byte offset covered by this chunk (inclusive)
    pub from: u64,
    /// Last byte offset covered by this chunk (inclusive)
    pub to: u64,
    /// Declared total size of the upload
    pub total: u64,
}

impl ChunkRange {
    /// Number of bytes this chunk declares
    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// Whether this chunk completes the upload
    pub fn is_final(&self) -> bool {
        self.to + 1 == self.total
    }
}

impl ContentRange {
    /// Parse an upload `Content-Range` header.
    ///
    /// Returns `None` for anything that does not match the protocol grammar,
    /// including ranges that are internally inconsistent (`from > to`,
    /// `to >= total`).
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.strip_prefix("bytes ")?;
        let (range, total) = rest.split_once('/')?;
        let total = parse_decimal(total)?;

        if range == "*" {
            return Some(Self::Status { total });
        }

        let (from, to) = range.split_once('-')?;
        let from = parse_decimal(from)?;
        let to = parse_decimal(to)?;

        if from > to || to >= total {
            return None;
        }

        Some(Self::Chunk(ChunkRange { from, to, total }))
    }
}

/// Parse a plain decimal number; rejects signs, whitespace and empty input
fn parse_decimal(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        assert_eq!(
            ContentRange::parse("bytes */20"),
            Some(ContentRange::Status { total: 20 })
        );
        assert_eq!(
            ContentRange::parse("bytes */0"),
            Some(ContentRange::Status { total: 0 })
        );
    }

    #[test]
    fn test_parse_chunk() {
        assert_eq!(
            ContentRange::parse("bytes 0-4/15"),
            Some(ContentRange::Chunk(ChunkRange {
                from: 0,
                to: 4,
                total: 15
            }))
        );
        assert_eq!(
            ContentRange::parse("bytes 10-14/15"),
            Some(ContentRange::Chunk(ChunkRange {
                from: 10,
                to: 14,
                total: 15
            }))
        );
    }

    #[test]
    fn test_chunk_len_and_final() {
        let chunk = ChunkRange {
            from: 5,
            to: 9,
            total: 15,
        };
        assert_eq!(chunk.len(), 5);
        assert!(!chunk.is_final());

        let last = ChunkRange {
            from: 10,
            to: 14,
            total: 15,
        };
        assert!(last.is_final());
    }

    #[test]
    fn test_rejects_malformed() {
        for header in [
            "",
            "bytes",
            "bytes ",
            "bytes */",
            "bytes /20",
            "bytes *-*/20",
            "bytes 0-4",
            "bytes 0-4/15 ",
            " bytes 0-4/15",
            "bytes  0-4/15",
            "Bytes 0-4/15",
            "bytes +0-4/15",
            "bytes 0-+4/15",
            "bytes 0-4/+15",
            "bytes a-b/c",
            "bytes 0x1-4/15",
            "bytes 18446744073709551616-18446744073709551617/18446744073709551618",
        ] {
            assert!(ContentRange::parse(header).is_none(), "accepted {header:?}");
        }
    }

    #[test]
    fn test_rejects_inconsistent_ranges() {
        // from > to
        assert!(ContentRange::parse("bytes 5-4/10").is_none());
        // to beyond the declared total
        assert!(ContentRange::parse("bytes 0-10/10").is_none());
        assert!(ContentRange::parse("bytes 0-11/10").is_none());
    }
}
