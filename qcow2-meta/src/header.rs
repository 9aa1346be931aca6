use std::fmt;

use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::big_endian::{U32, U64},
};

/// Errors when reading a qcow2 header.
#[derive(Debug, snafu::Snafu)]
#[non_exhaustive]
pub enum ReadError {
    #[snafu(display("image is too small to hold a qcow2 header"))]
    TooSmall,
    #[snafu(display("invalid qcow2 magic"))]
    InvalidMagic,

    #[snafu(display("unsupported qcow2 version {version}"))]
    UnsupportedVersion { version: u32 },

    #[snafu(display("declared header length {length} is shorter than the version 3 header"))]
    InvalidHeaderLength { length: u32 },
}

type Result<T, E = ReadError> = std::result::Result<T, E>;

/// The qcow2 magic, `QFI\xfb` read as a big-endian word.
pub const QCOW2_MAGIC: u32 = 0x514649FB;

/// Size of the fixed version 2 header region.
pub const V2_HEADER_SIZE: usize = 72;

/// Size of the fixed header region including the version 3 fields.
pub const V3_HEADER_SIZE: usize = 104;

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct HeaderRaw {
    pub magic: U32,                   // 0x00 - 0x514649FB
    pub version: U32,                 // 0x04 - 2 or 3
    pub backing_file_offset: U64,     // 0x08 - offset of the backing file name
    pub backing_file_size: U32,       // 0x10 - length of the backing file name
    pub cluster_bits: U32,            // 0x14 - log2 of the cluster size
    pub size: U64,                    // 0x18 - virtual disk size in bytes
    pub crypt_method: U32,            // 0x20 - 0 = none, 1 = AES, 2 = LUKS
    pub l1_size: U32,                 // 0x24 - number of L1 table entries
    pub l1_table_offset: U64,         // 0x28 - offset of the active L1 table
    pub refcount_table_offset: U64,   // 0x30 - offset of the refcount table
    pub refcount_table_clusters: U32, // 0x38 - clusters occupied by the refcount table
    pub nb_snapshots: U32,            // 0x3C - number of snapshots
    pub snapshots_offset: U64,        // 0x40 - offset of the snapshot table
                                      // 0x48 - end of the version 2 header
}

#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct V3FieldsRaw {
    pub incompatible_features: U64, // 0x48 - features the reader must support
    pub compatible_features: U64,   // 0x50 - optional features
    pub autoclear_features: U64,    // 0x58 - features to clear on rewrite
    pub refcount_order: U32,        // 0x60 - log2 of the refcount entry width in bits
    pub header_length: U32,         // 0x64 - total header length in bytes
                                    // 0x68 - end of the version 3 header
}

/// Encryption method declared by the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CryptMethod {
    None,
    Aes,
    Luks,
    /// Unrecognized method value.
    Unknown(u32),
}

impl CryptMethod {
    /// Returns the raw numeric method value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Aes => 1,
            Self::Luks => 2,
            Self::Unknown(raw) => raw,
        }
    }

    /// Converts a raw numeric method value into a [`CryptMethod`].
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Self::None,
            1 => Self::Aes,
            2 => Self::Luks,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for CryptMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Aes => write!(f, "AES"),
            Self::Luks => write!(f, "LUKS"),
            Self::Unknown(raw) => write!(f, "unknown (0x{raw:X})"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IncompatibleFeatures(u64);

bitflags::bitflags! {
    impl IncompatibleFeatures: u64 {
        const DIRTY = 1 << 0;
        const CORRUPT = 1 << 1;
        const EXTERNAL_DATA_FILE = 1 << 2;
        const COMPRESSION_TYPE = 1 << 3;
        const EXTENDED_L2 = 1 << 4;
    }
}

impl fmt::Display for IncompatibleFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = [
            (Self::DIRTY.bits(), "dirty bit"),
            (Self::CORRUPT.bits(), "corrupt bit"),
            (Self::EXTERNAL_DATA_FILE.bits(), "external data file"),
            (Self::COMPRESSION_TYPE.bits(), "compression type"),
            (Self::EXTENDED_L2.bits(), "extended L2 entries"),
        ];
        write_feature_bits(f, self.bits(), Self::all().bits(), &known)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompatibleFeatures(u64);

bitflags::bitflags! {
    impl CompatibleFeatures: u64 {
        const LAZY_REFCOUNTS = 1 << 0;
    }
}

impl fmt::Display for CompatibleFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = [(Self::LAZY_REFCOUNTS.bits(), "lazy refcounts")];
        write_feature_bits(f, self.bits(), Self::all().bits(), &known)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AutoclearFeatures(u64);

bitflags::bitflags! {
    impl AutoclearFeatures: u64 {
        const BITMAPS = 1 << 0;
        const RAW_EXTERNAL_DATA = 1 << 1;
    }
}

impl fmt::Display for AutoclearFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let known = [
            (Self::BITMAPS.bits(), "bitmaps"),
            (Self::RAW_EXTERNAL_DATA.bits(), "raw external data"),
        ];
        write_feature_bits(f, self.bits(), Self::all().bits(), &known)
    }
}

/// Lists the named bits set in `bits`, then any leftover unknown bits as hex.
fn write_feature_bits(
    f: &mut fmt::Formatter<'_>,
    bits: u64,
    known_mask: u64,
    known: &[(u64, &str)],
) -> fmt::Result {
    if bits == 0 {
        return write!(f, "(none)");
    }

    let mut first = true;
    let mut write_flag = |f: &mut fmt::Formatter<'_>, name: &str| -> fmt::Result {
        if !first {
            write!(f, ", ")?;
        }
        first = false;
        write!(f, "{}", name)
    };

    for &(flag, name) in known {
        if bits & flag != 0 {
            write_flag(f, name)?;
        }
    }

    let unknown = bits & !known_mask;
    if unknown != 0 {
        write_flag(f, &format!("unknown bits 0x{unknown:X}"))?;
    }

    Ok(())
}

/// Decoded qcow2 image header.
///
/// Version 3 fields exist only on the [`Header::V3`] variant; a version 2
/// image cannot present them at all. Fields shared by both versions are
/// reachable through the accessor methods.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Header {
    V2(HeaderV2),
    V3(HeaderV3),
}

/// Fixed fields of a version 2 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderV2 {
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: CryptMethod,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
}

/// Fixed fields of a version 3 header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderV3 {
    pub backing_file_offset: u64,
    pub backing_file_size: u32,
    pub cluster_bits: u32,
    pub size: u64,
    pub crypt_method: CryptMethod,
    pub l1_size: u32,
    pub l1_table_offset: u64,
    pub refcount_table_offset: u64,
    pub refcount_table_clusters: u32,
    pub nb_snapshots: u32,
    pub snapshots_offset: u64,
    pub incompatible_features: IncompatibleFeatures,
    pub compatible_features: CompatibleFeatures,
    pub autoclear_features: AutoclearFeatures,
    pub refcount_order: u32,
    pub header_length: u32,
}

impl HeaderV2 {
    fn from_raw(raw: &HeaderRaw) -> Self {
        Self {
            backing_file_offset: raw.backing_file_offset.get(),
            backing_file_size: raw.backing_file_size.get(),
            cluster_bits: raw.cluster_bits.get(),
            size: raw.size.get(),
            crypt_method: CryptMethod::from_u32(raw.crypt_method.get()),
            l1_size: raw.l1_size.get(),
            l1_table_offset: raw.l1_table_offset.get(),
            refcount_table_offset: raw.refcount_table_offset.get(),
            refcount_table_clusters: raw.refcount_table_clusters.get(),
            nb_snapshots: raw.nb_snapshots.get(),
            snapshots_offset: raw.snapshots_offset.get(),
        }
    }
}

impl HeaderV3 {
    fn from_raw(fixed: &HeaderRaw, v3: &V3FieldsRaw) -> Self {
        Self {
            backing_file_offset: fixed.backing_file_offset.get(),
            backing_file_size: fixed.backing_file_size.get(),
            cluster_bits: fixed.cluster_bits.get(),
            size: fixed.size.get(),
            crypt_method: CryptMethod::from_u32(fixed.crypt_method.get()),
            l1_size: fixed.l1_size.get(),
            l1_table_offset: fixed.l1_table_offset.get(),
            refcount_table_offset: fixed.refcount_table_offset.get(),
            refcount_table_clusters: fixed.refcount_table_clusters.get(),
            nb_snapshots: fixed.nb_snapshots.get(),
            snapshots_offset: fixed.snapshots_offset.get(),
            incompatible_features: IncompatibleFeatures::from_bits_retain(
                v3.incompatible_features.get(),
            ),
            compatible_features: CompatibleFeatures::from_bits_retain(v3.compatible_features.get()),
            autoclear_features: AutoclearFeatures::from_bits_retain(v3.autoclear_features.get()),
            refcount_order: v3.refcount_order.get(),
            header_length: v3.header_length.get(),
        }
    }
}

impl Header {
    /// Parses a qcow2 header from raw bytes.
    ///
    /// Consumes the 72-byte fixed region, or 104 bytes when the version
    /// field says 3. Extension records after the header are not read here.
    ///
    /// # Errors
    ///
    /// Returns an error if the data is too small, has an invalid magic
    /// number, declares a version other than 2 or 3, or (version 3)
    /// declares a total header length shorter than the fixed fields.
    pub fn read(raw: &[u8]) -> Result<Self> {
        // Check size first so the fixed region reads without a bound check.
        snafu::ensure!(raw.len() >= V2_HEADER_SIZE, TooSmallSnafu);

        let (fixed, rest) = HeaderRaw::read_from_prefix(raw).map_err(|_| TooSmallSnafu.build())?;

        // Check magic before anything else; a wrong magic means this is not
        // a qcow2 image, whatever the remaining bytes say.
        snafu::ensure!(fixed.magic.get() == QCOW2_MAGIC, InvalidMagicSnafu);

        match fixed.version.get() {
            2 => Ok(Self::V2(HeaderV2::from_raw(&fixed))),
            3 => {
                let (v3, _) =
                    V3FieldsRaw::read_from_prefix(rest).map_err(|_| TooSmallSnafu.build())?;

                let length = v3.header_length.get();
                snafu::ensure!(
                    length as usize >= V3_HEADER_SIZE,
                    InvalidHeaderLengthSnafu { length }
                );

                Ok(Self::V3(HeaderV3::from_raw(&fixed, &v3)))
            }
            version => UnsupportedVersionSnafu { version }.fail(),
        }
    }

    /// Returns the qcow2 version, 2 or 3.
    #[must_use]
    pub const fn version(&self) -> u32 {
        match self {
            Self::V2(_) => 2,
            Self::V3(_) => 3,
        }
    }

    /// Returns the total header length in bytes.
    ///
    /// Fixed at 72 for version 2; the decoded `header_length` field for
    /// version 3. The extension area starts at this file offset.
    #[must_use]
    pub const fn header_length(&self) -> u32 {
        match self {
            Self::V2(_) => V2_HEADER_SIZE as u32,
            Self::V3(header) => header.header_length,
        }
    }

    /// Returns the offset of the backing file name, zero when absent.
    #[must_use]
    pub const fn backing_file_offset(&self) -> u64 {
        match self {
            Self::V2(header) => header.backing_file_offset,
            Self::V3(header) => header.backing_file_offset,
        }
    }

    /// Returns the length of the backing file name in bytes.
    #[must_use]
    pub const fn backing_file_size(&self) -> u32 {
        match self {
            Self::V2(header) => header.backing_file_size,
            Self::V3(header) => header.backing_file_size,
        }
    }

    /// Returns `true` if the image declares a backing file.
    #[must_use]
    pub const fn has_backing_file(&self) -> bool {
        self.backing_file_offset() != 0
    }

    /// Returns log2 of the cluster size.
    #[must_use]
    pub const fn cluster_bits(&self) -> u32 {
        match self {
            Self::V2(header) => header.cluster_bits,
            Self::V3(header) => header.cluster_bits,
        }
    }

    /// Returns the cluster size in bytes, or `None` if `cluster_bits` does
    /// not fit a 64-bit size.
    #[must_use]
    pub const fn cluster_size(&self) -> Option<u64> {
        1u64.checked_shl(self.cluster_bits())
    }

    /// Returns the virtual disk size in bytes.
    #[must_use]
    pub const fn virtual_size(&self) -> u64 {
        match self {
            Self::V2(header) => header.size,
            Self::V3(header) => header.size,
        }
    }

    /// Returns the declared encryption method.
    #[must_use]
    pub const fn crypt_method(&self) -> CryptMethod {
        match self {
            Self::V2(header) => header.crypt_method,
            Self::V3(header) => header.crypt_method,
        }
    }

    /// Returns the number of L1 table entries.
    #[must_use]
    pub const fn l1_size(&self) -> u32 {
        match self {
            Self::V2(header) => header.l1_size,
            Self::V3(header) => header.l1_size,
        }
    }

    /// Returns the offset of the active L1 table.
    #[must_use]
    pub const fn l1_table_offset(&self) -> u64 {
        match self {
            Self::V2(header) => header.l1_table_offset,
            Self::V3(header) => header.l1_table_offset,
        }
    }

    /// Returns the offset of the refcount table.
    #[must_use]
    pub const fn refcount_table_offset(&self) -> u64 {
        match self {
            Self::V2(header) => header.refcount_table_offset,
            Self::V3(header) => header.refcount_table_offset,
        }
    }

    /// Returns the number of clusters the refcount table occupies.
    #[must_use]
    pub const fn refcount_table_clusters(&self) -> u32 {
        match self {
            Self::V2(header) => header.refcount_table_clusters,
            Self::V3(header) => header.refcount_table_clusters,
        }
    }

    /// Returns the number of snapshots in the image.
    #[must_use]
    pub const fn nb_snapshots(&self) -> u32 {
        match self {
            Self::V2(header) => header.nb_snapshots,
            Self::V3(header) => header.nb_snapshots,
        }
    }

    /// Returns the offset of the snapshot table.
    #[must_use]
    pub const fn snapshots_offset(&self) -> u64 {
        match self {
            Self::V2(header) => header.snapshots_offset,
            Self::V3(header) => header.snapshots_offset,
        }
    }
}
