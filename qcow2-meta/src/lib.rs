//! A library for parsing QCOW2 disk image headers and header extensions.
//!
//! QCOW2 is the copy-on-write disk image format used by QEMU. This crate
//! decodes the fixed header (versions 2 and 3) and the header extension
//! records that follow it into plain owned values. Cluster data, refcount
//! structures and snapshot tables stay untouched; only the metadata at the
//! front of the image gets read.
//!
//! # Features
//!
//! - Parse version 2 and version 3 headers into typed fields
//! - Walk the header extension area and collect records with owned payloads
//! - Decode feature bitmasks and the declared encryption method
//!
//! # Example
//!
//! ```no_run
//! use qcow2_meta::Qcow2Meta;
//!
//! // Read the front of an image from any byte source
//! let bytes = std::fs::read("disk.qcow2").unwrap();
//! let image = Qcow2Meta::read(&bytes).unwrap();
//!
//! // Access header information
//! println!("Version: {}", image.header().version());
//! println!("Virtual size: {} bytes", image.header().virtual_size());
//!
//! // Iterate over extension records
//! for record in image.extensions() {
//!     println!("Extension 0x{:08X}: {} bytes", record.type_id(), record.size());
//! }
//! ```
//!
//! # References
//!
//! - [QEMU qcow2 image format](https://gitlab.com/qemu-project/qemu/-/blob/master/docs/interop/qcow2.txt)

use self::extension::ExtensionRecord;
use self::header::Header;
use snafu::{ResultExt, Snafu};

use open_error::*;

pub mod extension;
pub mod header;

/// A parsed qcow2 image header together with its extension records.
///
/// Everything in here is an owned copy; the struct stays valid after the
/// buffer it was read from is gone.
///
/// Reference: <https://gitlab.com/qemu-project/qemu/-/blob/master/docs/interop/qcow2.txt>
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Qcow2Meta {
    header: Header,
    extensions: Vec<ExtensionRecord>,
}

impl Qcow2Meta {
    /// Reads the header and walks the extension area of a raw image.
    ///
    /// `raw` must start at byte 0 of the image and should cover at least the
    /// first cluster. The walk never reaches past the end of the slice.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use qcow2_meta::Qcow2Meta;
    ///
    /// # fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let bytes = std::fs::read("disk.qcow2")?;
    /// let image = Qcow2Meta::read(&bytes)?;
    /// println!("Cluster bits: {}", image.header().cluster_bits());
    /// println!("Extensions: {}", image.extension_count());
    /// # Ok(())
    /// # }
    /// ```
    pub fn read(raw: &[u8]) -> Result<Self, OpenError> {
        let header = Header::read(raw).context(ReadHeaderFailedSnafu)?;

        let start = header.header_length() as usize;
        snafu::ensure!(
            raw.len() >= start,
            TooSmallSnafu {
                header_length: header.header_length(),
            }
        );

        // Old images put the backing file name directly after the header,
        // leaving no room for records. Nothing to walk in that case.
        let end = extension_area_end(&header, raw.len());
        let extensions = if start < end {
            extension::walk_extensions(&raw[start..end]).context(InvalidExtensionAreaSnafu)?
        } else {
            Vec::new()
        };

        Ok(Self { header, extensions })
    }

    /// Returns the decoded header.
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the decoded extension records in on-disk order.
    #[must_use]
    pub fn extensions(&self) -> &[ExtensionRecord] {
        &self.extensions
    }

    /// Returns the number of extension records.
    #[must_use]
    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }
}

/// Upper bound of the extension area within `raw`.
///
/// The area runs up to the backing file name when one is present, otherwise
/// to the end of the first cluster, and never past the available bytes.
fn extension_area_end(header: &Header, available: usize) -> usize {
    let bound = if header.backing_file_offset() != 0 {
        header.backing_file_offset()
    } else {
        header.cluster_size().unwrap_or(available as u64)
    };

    bound.min(available as u64) as usize
}

#[derive(Debug, Snafu)]
#[snafu(module)]
#[non_exhaustive]
pub enum OpenError {
    #[snafu(display("invalid qcow2 header"))]
    ReadHeaderFailed { source: header::ReadError },

    #[snafu(display("image is smaller than its declared header length of {header_length} bytes"))]
    TooSmall { header_length: u32 },

    #[snafu(display("invalid header extension area"))]
    InvalidExtensionArea { source: extension::WalkError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{ExtensionType, WalkError};
    use crate::header::{HeaderRaw, QCOW2_MAGIC, ReadError, V3FieldsRaw};
    use zerocopy::IntoBytes;
    use zerocopy::byteorder::big_endian::{U32, U64};

    fn v2_image(cluster_bits: u32) -> Vec<u8> {
        let raw = HeaderRaw {
            magic: U32::new(QCOW2_MAGIC),
            version: U32::new(2),
            backing_file_offset: U64::new(0),
            backing_file_size: U32::new(0),
            cluster_bits: U32::new(cluster_bits),
            size: U64::new(1 << 20),
            crypt_method: U32::new(0),
            l1_size: U32::new(1),
            l1_table_offset: U64::new(0x400),
            refcount_table_offset: U64::new(0x200),
            refcount_table_clusters: U32::new(1),
            nb_snapshots: U32::new(0),
            snapshots_offset: U64::new(0),
        };

        let mut image = raw.as_bytes().to_vec();
        image.resize(1 << cluster_bits, 0);
        image
    }

    fn v3_image(cluster_bits: u32) -> Vec<u8> {
        let mut image = v2_image(cluster_bits);
        image[7] = 3;

        let extra = V3FieldsRaw {
            incompatible_features: U64::new(0),
            compatible_features: U64::new(0),
            autoclear_features: U64::new(0),
            refcount_order: U32::new(4),
            header_length: U32::new(104),
        };
        image[72..104].copy_from_slice(extra.as_bytes());
        image
    }

    fn put_record(image: &mut [u8], offset: usize, type_id: u32, payload: &[u8]) {
        image[offset..offset + 4].copy_from_slice(&type_id.to_be_bytes());
        image[offset + 4..offset + 8].copy_from_slice(&(payload.len() as u32).to_be_bytes());
        image[offset + 8..offset + 8 + payload.len()].copy_from_slice(payload);
    }

    #[test]
    fn v2_image_with_zeroed_area_has_no_extensions() {
        let image = v2_image(9);

        let meta = Qcow2Meta::read(&image).unwrap();
        assert_eq!(meta.header().version(), 2);
        assert_eq!(meta.extension_count(), 0);
        assert!(meta.extensions().is_empty());
    }

    #[test]
    fn v2_image_can_carry_extensions() {
        let mut image = v2_image(9);
        put_record(&mut image, 72, 0xE279_2ACA, b"raw");

        let meta = Qcow2Meta::read(&image).unwrap();
        assert_eq!(meta.extension_count(), 1);
        assert_eq!(
            meta.extensions()[0].extension_type(),
            ExtensionType::BackingFileFormat
        );
        assert_eq!(meta.extensions()[0].data(), b"raw");
    }

    #[test]
    fn v3_image_extensions_start_at_header_length() {
        let mut image = v3_image(9);
        put_record(&mut image, 104, 0x6803_F857, &[0u8; 16]);

        let meta = Qcow2Meta::read(&image).unwrap();
        assert_eq!(meta.extension_count(), 1);
        assert_eq!(
            meta.extensions()[0].extension_type(),
            ExtensionType::FeatureNameTable
        );
    }

    #[test]
    fn backing_file_name_bounds_the_area() {
        // The backing file name sits right after the header, so the area
        // between them is empty and never walked.
        let mut image = v2_image(9);
        image[8..16].copy_from_slice(&72u64.to_be_bytes());
        image[16..20].copy_from_slice(&8u32.to_be_bytes());
        image[72..80].copy_from_slice(b"base.raw");

        let meta = Qcow2Meta::read(&image).unwrap();
        assert!(meta.header().has_backing_file());
        assert_eq!(meta.extension_count(), 0);
    }

    #[test]
    fn area_stops_short_of_the_backing_file_name() {
        let mut image = v2_image(9);
        put_record(&mut image, 72, 0xE279_2ACA, b"raw");
        // Terminator at 88, name at 96. Walking past the name would see
        // garbage instead of a record header.
        image[96..100].copy_from_slice(b"base");
        image[8..16].copy_from_slice(&96u64.to_be_bytes());
        image[16..20].copy_from_slice(&4u32.to_be_bytes());

        let meta = Qcow2Meta::read(&image).unwrap();
        assert_eq!(meta.extension_count(), 1);
    }

    #[test]
    fn oversized_cluster_bits_walks_the_available_buffer() {
        // A cluster size that does not fit in u64 degrades the area bound
        // to the end of the buffer.
        let mut image = v3_image(9);
        image[20..24].copy_from_slice(&64u32.to_be_bytes());
        put_record(&mut image, 104, 0xE279_2ACA, b"qcow2");

        let meta = Qcow2Meta::read(&image).unwrap();
        assert_eq!(meta.header().cluster_size(), None);
        assert_eq!(meta.extension_count(), 1);
        assert_eq!(meta.extensions()[0].data(), b"qcow2");
    }

    #[test]
    fn header_only_buffer_has_no_extensions() {
        let image = v3_image(9);

        let meta = Qcow2Meta::read(&image[..104]).unwrap();
        assert_eq!(meta.extension_count(), 0);
    }

    #[test]
    fn header_errors_pass_through() {
        let err = Qcow2Meta::read(&[0u8; 16]).unwrap_err();
        assert!(matches!(
            err,
            OpenError::ReadHeaderFailed {
                source: ReadError::TooSmall
            }
        ));
    }

    #[test]
    fn declared_header_length_beyond_the_buffer_is_too_small() {
        let mut image = v3_image(9);
        image[100..104].copy_from_slice(&4096u32.to_be_bytes());

        let err = Qcow2Meta::read(&image[..104]).unwrap_err();
        assert!(matches!(
            err,
            OpenError::TooSmall {
                header_length: 4096
            }
        ));
    }

    #[test]
    fn walk_errors_pass_through() {
        let mut image = v3_image(9);
        // A record that declares more payload than the first cluster holds.
        put_record(&mut image, 104, 0x2385_2875, &[]);
        image[108..112].copy_from_slice(&0xFFFF_u32.to_be_bytes());

        let err = Qcow2Meta::read(&image).unwrap_err();
        assert!(matches!(
            err,
            OpenError::InvalidExtensionArea {
                source: WalkError::TruncatedExtension { .. }
            }
        ));
    }

    #[test]
    fn unterminated_area_is_an_error() {
        let mut image = v3_image(9);
        for offset in (104..512).step_by(8) {
            put_record(&mut image, offset, 0x0BAD_F00D, &[]);
        }

        let err = Qcow2Meta::read(&image).unwrap_err();
        assert!(matches!(
            err,
            OpenError::InvalidExtensionArea {
                source: WalkError::MissingTerminator
            }
        ));
    }
}
