//! Library for opening QCOW2 images from disk.
//!
//! This crate backs the `qcow2-meta-util` command line tool. It adds the
//! file handling around [`qcow2_meta`]: opening an image path, mapping it
//! into memory and decoding the header and extension records.
//!
//! # Example
//!
//! ```no_run
//! let image = qcow2_meta_util::open_image("disk.qcow2".as_ref())
//!     .expect("failed to open image");
//!
//! println!("Version: {}", image.header().version());
//! ```

use snafu::{ResultExt, Snafu};
use std::path::Path;

/// Errors that can occur when opening an image from disk.
#[derive(Debug, Snafu)]
pub enum OpenImageError {
    #[snafu(display("failed to open file"))]
    OpenFile { source: std::io::Error },

    #[snafu(display("failed to memory map file"))]
    MmapFile { source: std::io::Error },

    #[snafu(display("failed to parse image"))]
    ParseImage { source: qcow2_meta::OpenError },
}

/// Opens a qcow2 image from disk using a memory-mapped read.
///
/// This is a convenience function that opens the file, maps it into memory,
/// and decodes the header and extension records. The returned
/// [`Qcow2Meta`](qcow2_meta::Qcow2Meta) owns all of its data; the mapping
/// only lives for the duration of the parse.
///
/// This function uses `unsafe` internally to create the memory map. The
/// file must not be truncated by another process while this call runs; the
/// mapping is dropped before it returns.
pub fn open_image(path: &Path) -> Result<qcow2_meta::Qcow2Meta, OpenImageError> {
    let file = std::fs::File::open(path).context(OpenFileSnafu)?;

    let raw = unsafe { memmap2::Mmap::map(&file).context(MmapFileSnafu)? };

    qcow2_meta::Qcow2Meta::read(&raw).context(ParseImageSnafu)
}
