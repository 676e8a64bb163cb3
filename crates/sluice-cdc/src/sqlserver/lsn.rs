//! Log sequence numbers
//!
//! SQL Server uses 10-byte binary LSNs consisting of:
//! - VLF sequence number (4 bytes)
//! - Log block offset (4 bytes)
//! - Slot number (2 bytes)
//!
//! Byte-wise comparison of the binary form is the log order. A database
//! function returning `NULL` is modelled as [`Lsn::NULL`], which sorts before
//! every concrete position.

use super::error::SqlServerError;
use std::fmt;
use std::str::FromStr;

const LSN_LEN: usize = 10;

/// Position in the SQL Server transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(Option<[u8; LSN_LEN]>);

impl Lsn {
    /// Missing position (SQL `NULL`).
    pub const NULL: Lsn = Lsn(None);

    /// Lowest concrete position.
    pub const ZERO: Lsn = Lsn(Some([0u8; LSN_LEN]));

    /// Highest concrete position.
    pub const MAX: Lsn = Lsn(Some([0xFF; LSN_LEN]));

    pub fn new(bytes: [u8; LSN_LEN]) -> Self {
        Self(Some(bytes))
    }

    /// Build from the `VLF:Offset:Slot` components.
    pub fn from_parts(vlf: u32, offset: u32, slot: u16) -> Self {
        let mut bytes = [0u8; LSN_LEN];
        bytes[..4].copy_from_slice(&vlf.to_be_bytes());
        bytes[4..8].copy_from_slice(&offset.to_be_bytes());
        bytes[8..].copy_from_slice(&slot.to_be_bytes());
        Self::new(bytes)
    }

    /// Build from a binary column value; `None` maps to [`Lsn::NULL`].
    pub fn from_bytes(bytes: Option<&[u8]>) -> Result<Self, SqlServerError> {
        match bytes {
            None => Ok(Self::NULL),
            Some(b) => {
                let arr: [u8; LSN_LEN] = b.try_into().map_err(|_| {
                    SqlServerError::InvalidLsn(format!(
                        "Expected {} bytes, got {}",
                        LSN_LEN,
                        b.len()
                    ))
                })?;
                Ok(Self::new(arr))
            }
        }
    }

    /// Parse the 20-character hex form.
    pub fn from_hex(hex: &str) -> Result<Self, SqlServerError> {
        if hex.len() != LSN_LEN * 2 {
            return Err(SqlServerError::InvalidLsn(format!(
                "LSN hex must be {} characters, got {}",
                LSN_LEN * 2,
                hex.len()
            )));
        }
        let bytes = hex::decode(hex)
            .map_err(|e| SqlServerError::InvalidLsn(format!("Invalid hex: {}", e)))?;
        Self::from_bytes(Some(&bytes))
    }

    /// 20-character hex form, `None` for NULL.
    pub fn to_hex(&self) -> Option<String> {
        self.0.map(hex::encode)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.0.as_ref().map(|b| b.as_slice())
    }

    /// Whether this is a concrete position.
    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }

    /// The next position, computed locally.
    ///
    /// NULL stays NULL and [`Lsn::MAX`] saturates.
    pub fn increment(&self) -> Lsn {
        let Some(mut bytes) = self.0 else {
            return Lsn::NULL;
        };
        for byte in bytes.iter_mut().rev() {
            let (next, overflow) = byte.overflowing_add(1);
            *byte = next;
            if !overflow {
                return Lsn::new(bytes);
            }
        }
        Lsn::MAX
    }

    fn parts(bytes: &[u8; LSN_LEN]) -> (u32, u32, u16) {
        let vlf = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let offset = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let slot = u16::from_be_bytes([bytes[8], bytes[9]]);
        (vlf, offset, slot)
    }
}

impl From<[u8; LSN_LEN]> for Lsn {
    fn from(bytes: [u8; LSN_LEN]) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            None => f.write_str("NULL"),
            Some(bytes) => {
                let (vlf, offset, slot) = Self::parts(bytes);
                write!(f, "{:08x}:{:08x}:{:04x}", vlf, offset, slot)
            }
        }
    }
}

impl FromStr for Lsn {
    type Err = SqlServerError;

    /// Accepts `NULL`, `VLF:Offset:Slot` or 20 hex characters.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("null") {
            return Ok(Lsn::NULL);
        }
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [vlf, offset, slot] if vlf.len() == 8 && offset.len() == 8 && slot.len() == 4 => {
                Self::from_hex(&format!("{}{}{}", vlf, offset, slot))
            }
            [hex] => Self::from_hex(hex),
            _ => Err(SqlServerError::InvalidLsn(format!("Invalid LSN '{}'", s))),
        }
    }
}

// ============================================================================
// Transaction log position
// ============================================================================

/// Commit position of a transaction plus the position of one change in it.
///
/// Ordered by commit LSN, then change LSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxLogPosition {
    pub commit_lsn: Lsn,
    /// `__$seqval` of the change; NULL when the whole transaction is done
    pub change_lsn: Lsn,
}

impl TxLogPosition {
    pub const NULL: TxLogPosition = TxLogPosition {
        commit_lsn: Lsn::NULL,
        change_lsn: Lsn::NULL,
    };

    pub fn new(commit_lsn: Lsn, change_lsn: Lsn) -> Self {
        Self {
            commit_lsn,
            change_lsn,
        }
    }

    /// Position at a commit with no change inside it yet.
    pub fn at_commit(commit_lsn: Lsn) -> Self {
        Self::new(commit_lsn, Lsn::NULL)
    }

    pub fn is_available(&self) -> bool {
        self.commit_lsn.is_available() && self.change_lsn.is_available()
    }
}

impl fmt::Display for TxLogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.commit_lsn, self.change_lsn)
    }
}

impl FromStr for TxLogPosition {
    type Err = SqlServerError;

    /// Parses the `commit(change)` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (commit, rest) = s
            .split_once('(')
            .ok_or_else(|| SqlServerError::InvalidLsn(format!("Invalid position '{}'", s)))?;
        let change = rest
            .strip_suffix(')')
            .ok_or_else(|| SqlServerError::InvalidLsn(format!("Invalid position '{}'", s)))?;
        Ok(Self::new(commit.parse()?, change.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        assert!(Lsn::NULL < Lsn::ZERO);
        assert!(Lsn::ZERO < Lsn::from_parts(0, 0, 1));
        assert!(!Lsn::NULL.is_available());
        assert!(Lsn::ZERO.is_available());
        assert_eq!(Lsn::NULL.as_bytes(), None);
    }

    #[test]
    fn test_lsn_hex_and_display() {
        let lsn = Lsn::from_hex("0000002a00000f380003").unwrap();
        assert_eq!(lsn, Lsn::from_parts(0x2a, 0xf38, 3));
        assert_eq!(lsn.to_string(), "0000002a:00000f38:0003");
        assert_eq!(lsn.to_hex().as_deref(), Some("0000002a00000f380003"));
        assert_eq!("0000002a:00000f38:0003".parse::<Lsn>().unwrap(), lsn);
        assert_eq!("NULL".parse::<Lsn>().unwrap(), Lsn::NULL);
        assert_eq!(Lsn::NULL.to_string(), "NULL");

        assert!(Lsn::from_hex("abc").is_err());
        assert!(Lsn::from_bytes(Some(&[1, 2, 3])).is_err());
        assert_eq!(Lsn::from_bytes(None).unwrap(), Lsn::NULL);
    }

    #[test]
    fn test_increment_carries() {
        assert_eq!(
            Lsn::from_parts(1, 2, 0xFFFF).increment(),
            Lsn::from_parts(1, 3, 0)
        );
        assert_eq!(Lsn::from_parts(0, 0, 7).increment(), Lsn::from_parts(0, 0, 8));
        assert_eq!(Lsn::NULL.increment(), Lsn::NULL);
        assert_eq!(Lsn::MAX.increment(), Lsn::MAX);
    }

    #[test]
    fn test_position_ordering_and_round_trip() {
        let a = TxLogPosition::new(Lsn::from_parts(0, 1, 0), Lsn::from_parts(0, 5, 0));
        let b = TxLogPosition::new(Lsn::from_parts(0, 2, 0), Lsn::from_parts(0, 1, 0));
        let c = TxLogPosition::new(Lsn::from_parts(0, 1, 0), Lsn::from_parts(0, 6, 0));
        assert!(a < b);
        assert!(a < c);
        assert!(c < b);

        let text = a.to_string();
        assert_eq!(text.parse::<TxLogPosition>().unwrap(), a);

        let open = TxLogPosition::at_commit(Lsn::from_parts(0, 1, 0));
        assert!(!open.is_available());
        assert_eq!(open.to_string().parse::<TxLogPosition>().unwrap(), open);
    }
}
