use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "qcow2-meta-util")]
#[command(about = "QCOW2 image header inspector", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display header information for one or more images
    Info {
        /// Paths to the image files
        #[arg(value_name = "IMAGE", required = true)]
        image_paths: Vec<PathBuf>,
    },

    /// List header extensions in an image
    Extensions {
        /// Path to the image file
        #[arg(value_name = "IMAGE")]
        image_path: PathBuf,
    },
}
