mod cli;

use clap::Parser;
use cli::{Cli, Command};
use qcow2_meta::Qcow2Meta;
use qcow2_meta::header::Header;
use snafu::{ResultExt, Snafu};
use std::path::{Path, PathBuf};

/// Top-level application errors for qcow2-meta-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open image '{}'", path.display()))]
    OpenImage {
        path: PathBuf,
        source: qcow2_meta_util::OpenImageError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Info { image_paths } => cmd_info(&image_paths),
        Command::Extensions { image_path } => cmd_extensions(&image_path),
    }
}

fn cmd_info(paths: &[PathBuf]) -> Result<()> {
    for (num, path) in paths.iter().enumerate() {
        if num > 0 {
            println!();
        }

        let image = qcow2_meta_util::open_image(path).context(OpenImageSnafu { path })?;
        print_info(path, &image);
    }

    Ok(())
}

fn print_info(path: &Path, image: &Qcow2Meta) {
    let header = image.header();

    println!("Image: {}", path.display());
    println!();
    println!("Version:          {}", header.version());
    println!("Virtual Size:     {} bytes", header.virtual_size());
    match header.cluster_size() {
        Some(size) => println!("Cluster Size:     {} bytes (2^{})", size, header.cluster_bits()),
        None => println!("Cluster Size:     invalid (2^{})", header.cluster_bits()),
    }
    println!("Encryption:       {}", header.crypt_method());
    if header.has_backing_file() {
        println!(
            "Backing File:     {} bytes at 0x{:X}",
            header.backing_file_size(),
            header.backing_file_offset()
        );
    } else {
        println!("Backing File:     (none)");
    }
    println!(
        "L1 Table:         {} entries at 0x{:X}",
        header.l1_size(),
        header.l1_table_offset()
    );
    println!(
        "Refcount Table:   {} clusters at 0x{:X}",
        header.refcount_table_clusters(),
        header.refcount_table_offset()
    );
    println!(
        "Snapshots:        {} at 0x{:X}",
        header.nb_snapshots(),
        header.snapshots_offset()
    );
    println!("Header Length:    {} bytes", header.header_length());

    if let Header::V3(v3) = header {
        println!(
            "Incompatible:     0x{:X} ({})",
            v3.incompatible_features.bits(),
            v3.incompatible_features
        );
        println!(
            "Compatible:       0x{:X} ({})",
            v3.compatible_features.bits(),
            v3.compatible_features
        );
        println!(
            "Autoclear:        0x{:X} ({})",
            v3.autoclear_features.bits(),
            v3.autoclear_features
        );
        println!("Refcount Order:   {}", v3.refcount_order);
    }

    println!("Extensions:       {}", image.extension_count());
    for record in image.extensions() {
        println!(
            "  0x{:08X}  {}  ({} bytes)",
            record.type_id(),
            record.extension_type(),
            record.size()
        );
    }
}

fn cmd_extensions(path: &Path) -> Result<()> {
    let image = qcow2_meta_util::open_image(path).context(OpenImageSnafu { path })?;

    println!("Header extensions in {}:", path.display());
    println!("{:>6}  {:>10}  {:>10}  {:<20}  Data", "Index", "Tag", "Size", "Type");
    println!("{:-<6}  {:-<10}  {:-<10}  {:-<20}  {:-<26}", "", "", "", "", "");

    for (index, record) in image.extensions().iter().enumerate() {
        println!(
            "{:>6}  0x{:08X}  {:>10}  {:<20}  {}",
            index,
            record.type_id(),
            record.size(),
            record.extension_type().to_string(),
            preview(record.data())
        );
    }

    if image.extensions().is_empty() {
        println!("(none)");
    }

    Ok(())
}

/// Renders the first payload bytes, with anything non-printable as a dot.
fn preview(data: &[u8]) -> String {
    let mut out: String = data
        .iter()
        .take(24)
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();

    if data.len() > 24 {
        out.push_str("...");
    }

    out
}
