use std::fmt;

use snafu::Snafu;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use zerocopy::byteorder::big_endian::U32;

/// Errors when walking the header extension area.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum WalkError {
    #[snafu(display(
        "extension at offset {offset} declares {declared} payload bytes but only {available} remain"
    ))]
    TruncatedExtension {
        offset: usize,
        declared: usize,
        available: usize,
    },

    #[snafu(display("extension area ended without an end-of-area record"))]
    MissingTerminator,
}

type Result<T, E = WalkError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub(crate) struct ExtHeaderRaw {
    type_id: U32,
    size: U32,
}

const EXT_HEADER_SIZE: usize = size_of::<ExtHeaderRaw>();

/// Record payloads pad out so the next record header lands on an 8-byte
/// boundary.
const fn padded_size(size: usize) -> usize {
    (size + 7) & !7
}

/// One decoded header extension record.
///
/// The payload is an owned copy of the on-disk bytes; records stay valid
/// after the buffer they were walked from is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct ExtensionRecord {
    type_id: u32,
    data: Vec<u8>,
}

impl ExtensionRecord {
    /// Creates a record from a raw type tag and payload bytes.
    pub fn new(type_id: u32, data: Vec<u8>) -> Self {
        Self { type_id, data }
    }

    /// Returns the raw 32-bit type tag.
    #[must_use]
    pub const fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Returns the parsed extension type.
    #[must_use]
    pub const fn extension_type(&self) -> ExtensionType {
        ExtensionType::from_u32(self.type_id)
    }

    /// Returns the declared payload length in bytes.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Returns the payload bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Known header extension type tags.
///
/// Tags only name what a payload carries; payloads themselves stay opaque
/// bytes here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ExtensionType {
    /// End of the extension area; terminates the walk, never surfaced as a
    /// record.
    EndOfArea,
    /// Backing file format name string.
    BackingFileFormat,
    /// Feature name table.
    FeatureNameTable,
    /// Bitmaps extension.
    Bitmaps,
    /// Full disk encryption header pointer.
    EncryptionHeader,
    /// External data file name string.
    ExternalDataFile,
    /// Unrecognized extension type.
    Unknown(u32),
}

impl ExtensionType {
    /// Returns the raw numeric type tag.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::EndOfArea => 0x0000_0000,
            Self::BackingFileFormat => 0xE279_2ACA,
            Self::FeatureNameTable => 0x6803_F857,
            Self::Bitmaps => 0x2385_2875,
            Self::EncryptionHeader => 0x0537_BE77,
            Self::ExternalDataFile => 0x4441_5441,
            Self::Unknown(raw) => raw,
        }
    }

    /// Converts a raw numeric type tag into an [`ExtensionType`].
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            0x0000_0000 => Self::EndOfArea,
            0xE279_2ACA => Self::BackingFileFormat,
            0x6803_F857 => Self::FeatureNameTable,
            0x2385_2875 => Self::Bitmaps,
            0x0537_BE77 => Self::EncryptionHeader,
            0x4441_5441 => Self::ExternalDataFile,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ExtensionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EndOfArea => "end of area",
            Self::BackingFileFormat => "backing file format",
            Self::FeatureNameTable => "feature name table",
            Self::Bitmaps => "bitmaps",
            Self::EncryptionHeader => "encryption header",
            Self::ExternalDataFile => "external data file",
            Self::Unknown(_) => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// Iterator over header extension records.
///
/// Walks the extension area by cursor over an immutable byte slice, copying
/// each payload out as it goes. The walk ends at the end-of-area record;
/// running out of area first yields [`WalkError::MissingTerminator`]. After
/// the terminator or an error the iterator is fused.
#[must_use = "iterators are lazy and do nothing unless consumed"]
pub struct Extensions<'a> {
    area: &'a [u8],
    cursor: usize,
    done: bool,
}

impl<'a> Extensions<'a> {
    /// Creates a walker over the raw extension area bytes.
    pub const fn new(area: &'a [u8]) -> Self {
        Self {
            area,
            cursor: 0,
            done: false,
        }
    }
}

impl fmt::Debug for Extensions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions")
            .field("cursor", &self.cursor)
            .field("area_len", &self.area.len())
            .finish_non_exhaustive()
    }
}

impl Iterator for Extensions<'_> {
    type Item = Result<ExtensionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let rest = self.area.get(self.cursor..).unwrap_or(&[]);

        // Fewer than 8 bytes cannot hold another record header; the area is
        // spent without an end-of-area record having shown up.
        let Ok((raw, payload)) = ExtHeaderRaw::read_from_prefix(rest) else {
            self.done = true;
            return Some(Err(WalkError::MissingTerminator));
        };

        if raw.type_id.get() == 0 {
            self.done = true;
            return None;
        }

        let declared = raw.size.get() as usize;
        if payload.len() < declared {
            self.done = true;
            return Some(Err(WalkError::TruncatedExtension {
                offset: self.cursor,
                declared,
                available: payload.len(),
            }));
        }

        let data = payload[..declared].to_vec();
        self.cursor += EXT_HEADER_SIZE + padded_size(declared);

        Some(Ok(ExtensionRecord {
            type_id: raw.type_id.get(),
            data,
        }))
    }
}

/// Walks a complete extension area, collecting records in on-disk order.
///
/// # Errors
///
/// Returns [`WalkError::TruncatedExtension`] if a record declares more
/// payload than the area holds, or [`WalkError::MissingTerminator`] if the
/// area ends before an end-of-area record.
pub fn walk_extensions(area: &[u8]) -> Result<Vec<ExtensionRecord>> {
    Extensions::new(area).collect()
}
