use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// when a snapshot was observed, and how
///
/// stored as `(millis << 1) | realtime`. the low bit distinguishes events
/// seen live on the gateway from states recovered by history pagination.
/// zero means "existed at creation / unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timing(pub i64);

impl Timing {
    pub const UNKNOWN: Timing = Timing(0);

    pub fn new(millis: i64, realtime: bool) -> Timing {
        Timing((millis << 1) | i64::from(realtime))
    }

    pub fn now(realtime: bool) -> Timing {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Timing::new(millis, realtime)
    }

    pub fn millis(self) -> i64 {
        self.0 >> 1
    }

    pub fn is_realtime(self) -> bool {
        self.0 & 1 == 1
    }

    pub fn into_inner(self) -> i64 {
        self.0
    }
}

/// an avatar/icon hash in the compact form the database stores
///
/// hashes matching `(a_)?[0-9a-f]{32}` pack into 17 bytes: one flag byte
/// (1 = animated) followed by the 16 raw hash bytes. anything else is kept
/// as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageHash {
    Compact([u8; 17]),
    Text(String),
}

impl ImageHash {
    pub fn parse(hash: &str) -> ImageHash {
        let (animated, hex) = match hash.strip_prefix("a_") {
            Some(rest) => (true, rest),
            None => (false, hash),
        };
        if hex.len() != 32 {
            return ImageHash::Text(hash.to_owned());
        }
        let mut out = [0u8; 17];
        out[0] = u8::from(animated);
        for (i, chunk) in hex.as_bytes().chunks_exact(2).enumerate() {
            let hi = hex_nibble(chunk[0]);
            let lo = hex_nibble(chunk[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out[1 + i] = (hi << 4) | lo,
                _ => return ImageHash::Text(hash.to_owned()),
            }
        }
        ImageHash::Compact(out)
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            ImageHash::Compact(bytes) => Some(bytes),
            ImageHash::Text(_) => None,
        }
    }
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_packs_realtime_flag() {
        let t = Timing::new(1000, true);
        assert_eq!(t.into_inner(), 2001);
        assert_eq!(t.millis(), 1000);
        assert!(t.is_realtime());

        let t = Timing::new(1000, false);
        assert_eq!(t.into_inner(), 2000);
        assert!(!t.is_realtime());
    }

    #[test]
    fn timing_orders_by_millis_first() {
        assert!(Timing::new(2, false) > Timing::new(1, true));
        assert!(Timing::new(1, true) > Timing::new(1, false));
    }

    #[test]
    fn image_hash_compacts() {
        let h = ImageHash::parse("a_0123456789abcdef0123456789abcdef");
        let ImageHash::Compact(bytes) = h else {
            panic!("expected compact form");
        };
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..5], &[0x01, 0x23, 0x45, 0x67]);
    }

    #[test]
    fn image_hash_falls_back_to_text() {
        assert_eq!(
            ImageHash::parse("clyde"),
            ImageHash::Text("clyde".to_owned())
        );
        // uppercase hex is not the expected pattern
        assert!(matches!(
            ImageHash::parse("0123456789ABCDEF0123456789ABCDEF"),
            ImageHash::Text(_)
        ));
    }
}
