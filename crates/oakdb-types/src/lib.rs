//! Core identifier types shared by every OakDB subsystem.
//!
//! Everything here is a plain newtype with no behavior beyond construction,
//! comparison, display, and byte encoding. Heavier machinery (pages, logs,
//! locks) lives in the subsystem crates.

pub mod limits;
pub mod mach;

use std::fmt;

use limits::{FIL_ADDR_SIZE, FIL_NULL};

// ---------------------------------------------------------------------------
// Space / page identity
// ---------------------------------------------------------------------------

/// Identifier of a tablespace. Space 0 is the system tablespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// The system tablespace: space header, transaction system page, and
    /// rollback segments live here.
    pub const SYSTEM: Self = Self(0);
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A page number within one tablespace. Page 0 holds the space header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PageNo(pub u32);

impl PageNo {
    /// The "no page" marker used in prev/next links and file addresses.
    pub const NULL: Self = Self(FIL_NULL);

    /// Whether this is the null page marker.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == FIL_NULL
    }
}

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fully qualified page identity: (space, page-no).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    pub space: SpaceId,
    pub page_no: PageNo,
}

impl PageId {
    #[inline]
    #[must_use]
    pub const fn new(space: SpaceId, page_no: PageNo) -> Self {
        Self { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page_no)
    }
}

/// A byte address inside a tablespace: page number plus offset within the
/// page. Serialized as 6 bytes (page-no(4), offset(2)) in list nodes and
/// segment headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileAddr {
    pub page_no: PageNo,
    pub offset: u16,
}

impl FileAddr {
    /// The null address: page `FIL_NULL`, offset 0.
    pub const NULL: Self = Self {
        page_no: PageNo::NULL,
        offset: 0,
    };

    #[inline]
    #[must_use]
    pub const fn new(page_no: PageNo, offset: u16) -> Self {
        Self { page_no, offset }
    }

    /// Whether this is the null address.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.page_no.is_null()
    }

    /// Decode from 6 bytes at `off`.
    #[must_use]
    pub fn read(buf: &[u8], off: usize) -> Self {
        Self {
            page_no: PageNo(mach::read_u32(buf, off)),
            offset: mach::read_u16(buf, off + 4),
        }
    }

    /// Encode into 6 bytes at `off`.
    pub fn write(self, buf: &mut [u8], off: usize) {
        mach::write_u32(buf, off, self.page_no.0);
        mach::write_u16(buf, off + 4, self.offset);
    }
}

const _: () = assert!(FIL_ADDR_SIZE == 6);

// ---------------------------------------------------------------------------
// Log / transaction identity
// ---------------------------------------------------------------------------

/// Log sequence number: a byte position in the logical redo log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    pub const ZERO: Self = Self(0);

    /// Advance by `n` bytes.
    #[inline]
    #[must_use]
    pub const fn add(self, n: u64) -> Self {
        Self(self.0 + n)
    }

    /// The low 32 bits, stored in the page trailer as a torn-write check.
    #[inline]
    #[must_use]
    pub const fn low32(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, assigned from a monotone counter at the
/// transaction's first write. Id 0 is never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct TrxId(pub u64);

impl TrxId {
    /// Marker for "no transaction" (freshly initialized system columns).
    pub const ZERO: Self = Self(0);
}

impl fmt::Display for TrxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-transaction monotone sequence number of an undo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct UndoNo(pub u64);

/// Identifier of an index (one B+ tree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct IndexId(pub u64);

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a table (a clustered index plus its secondaries).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TableId(pub u64);

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record in a page's heap-allocation order. Heap 0 is the
/// infimum, heap 1 the supremum; user records start at 2. This is the
/// within-page identity used by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct HeapNo(pub u16);

impl HeapNo {
    pub const INFIMUM: Self = Self(0);
    pub const SUPREMUM: Self = Self(1);
    /// First heap number available to user records.
    pub const FIRST_USER: Self = Self(2);
}

impl fmt::Display for HeapNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Roll pointer
// ---------------------------------------------------------------------------

/// Compressed reference from a clustered-index record to the undo record
/// holding its previous version.
///
/// Bit layout (low to high): offset(16), page-no(32), rseg-id(7),
/// insert-flag(1). The all-zero value means "no previous version".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct RollPtr(pub u64);

impl RollPtr {
    /// No previous version (record inserted by a transaction whose undo has
    /// been purged, or a freshly bootstrapped record).
    pub const ZERO: Self = Self(0);

    /// Build a roll pointer from its parts.
    #[must_use]
    pub fn new(is_insert: bool, rseg_id: u8, page_no: PageNo, offset: u16) -> Self {
        debug_assert!(rseg_id < 128, "rseg id must fit 7 bits");
        let mut v = u64::from(offset);
        v |= u64::from(page_no.0) << 16;
        v |= u64::from(rseg_id & 0x7F) << 48;
        if is_insert {
            v |= 1 << 55;
        }
        Self(v)
    }

    /// Whether this points at an insert-undo record (previous version does
    /// not exist; the row was born with this version).
    #[inline]
    #[must_use]
    pub const fn is_insert(self) -> bool {
        self.0 & (1 << 55) != 0
    }

    /// Rollback segment id.
    #[inline]
    #[must_use]
    pub const fn rseg_id(self) -> u8 {
        ((self.0 >> 48) & 0x7F) as u8
    }

    /// Undo page number within the rollback segment's space.
    #[inline]
    #[must_use]
    pub const fn page_no(self) -> PageNo {
        PageNo((self.0 >> 16) as u32)
    }

    /// Byte offset of the undo record within its page.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u16 {
        self.0 as u16
    }

    /// Whether this is the null roll pointer.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

// ---------------------------------------------------------------------------
// Tagged enums
// ---------------------------------------------------------------------------

/// Page type tag stored in the common page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PageType {
    /// Freshly allocated, contents undefined.
    Allocated = 0,
    /// B+ tree node.
    Index = 1,
    /// Undo log page.
    UndoLog = 2,
    /// Segment inode page.
    SegInode = 3,
    /// Tablespace header (page 0 of each space).
    SpaceHeader = 4,
    /// Extent descriptor page.
    ExtentDescriptor = 5,
    /// Insert-buffer bitmap. Reserved: the change buffer is disabled and
    /// pages of this type are never written.
    IbufBitmap = 6,
    /// Transaction system page.
    TrxSystem = 7,
    /// Externally stored blob column overflow.
    BlobOverflow = 8,
}

impl PageType {
    /// Parse from the on-disk tag.
    #[must_use]
    pub const fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::Allocated),
            1 => Some(Self::Index),
            2 => Some(Self::UndoLog),
            3 => Some(Self::SegInode),
            4 => Some(Self::SpaceHeader),
            5 => Some(Self::ExtentDescriptor),
            6 => Some(Self::IbufBitmap),
            7 => Some(Self::TrxSystem),
            8 => Some(Self::BlobOverflow),
            _ => None,
        }
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Whether a consistent read view is held for the whole transaction
    /// (as opposed to one per statement).
    #[inline]
    #[must_use]
    pub const fn view_per_transaction(self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Serializable)
    }

    /// Whether locking reads take next-key locks (record + preceding gap).
    #[inline]
    #[must_use]
    pub const fn uses_gap_locks(self) -> bool {
        matches!(self, Self::RepeatableRead | Self::Serializable)
    }
}
