//! machlink - incremental Mach-O linker tooling.
//!
//! The linker core is driven as a library by the compiler frontend; this
//! binary exposes the standalone maintenance commands: ad-hoc signing of
//! existing binaries and load-command inspection.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use machlink::image::parse::sign_in_place;
use machlink::image::{Emit, Image};
use machlink::macho::LoadCommand;

/// Incremental Mach-O linker tooling.
#[derive(Parser, Debug)]
#[command(name = "machlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1", global = true)]
    verbosity: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add or refresh an ad-hoc code signature on a Mach-O binary
    Sign {
        /// The binary to sign in place
        binary: PathBuf,
    },

    /// Print the header and load commands of a Mach-O binary
    Info {
        /// The binary to inspect
        binary: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    match cli.command {
        Commands::Sign { binary } => {
            sign_in_place(&binary)
                .with_context(|| format!("failed to sign {}", binary.display()))?;
            println!("signed {}", binary.display());
        }

        Commands::Info { binary } => {
            let file = std::fs::File::open(&binary)
                .with_context(|| format!("failed to open {}", binary.display()))?;
            let emit = Emit {
                directory: binary
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."))
                    .to_path_buf(),
                sub_path: binary
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            };
            let image = Image::parse_from_file(file, emit)
                .with_context(|| format!("failed to parse {}", binary.display()))?;
            print_info(&image);
        }
    }

    Ok(())
}

fn print_info(image: &Image) {
    if let Some(header) = image.mach_header() {
        println!(
            "header: cputype {:#x} filetype {:#x} ncmds {} sizeofcmds {} flags {:#x}",
            header.cputype, header.filetype, header.ncmds, header.sizeofcmds, header.flags
        );
    }

    for (index, cmd) in image.commands().iter().enumerate() {
        match cmd {
            LoadCommand::Segment(segment) => {
                println!(
                    "{:3}: segment {:<12} vm {:#x}+{:#x} file {:#x}+{:#x}",
                    index,
                    segment.inner.name(),
                    segment.inner.vmaddr,
                    segment.inner.vmsize,
                    segment.inner.fileoff,
                    segment.inner.filesize
                );
                for section in &segment.sections {
                    println!(
                        "       section {:<12} addr {:#x}+{:#x} off {:#x}",
                        section.name(),
                        section.addr,
                        section.size,
                        section.offset
                    );
                }
            }
            LoadCommand::Symtab(symtab) => println!(
                "{:3}: symtab {} symbols at {:#x}, strings {:#x}+{:#x}",
                index, symtab.nsyms, symtab.symoff, symtab.stroff, symtab.strsize
            ),
            LoadCommand::Dysymtab(dysymtab) => println!(
                "{:3}: dysymtab locals {}..{} extdef {}..{} undef {}..{}",
                index,
                dysymtab.ilocalsym,
                dysymtab.ilocalsym + dysymtab.nlocalsym,
                dysymtab.iextdefsym,
                dysymtab.iextdefsym + dysymtab.nextdefsym,
                dysymtab.iundefsym,
                dysymtab.iundefsym + dysymtab.nundefsym
            ),
            LoadCommand::DyldInfo(dyld_info) => println!(
                "{:3}: dyld info, export trie {:#x}+{:#x}",
                index, dyld_info.export_off, dyld_info.export_size
            ),
            LoadCommand::Dylinker(path_cmd) => println!(
                "{:3}: dylinker {}",
                index,
                String::from_utf8_lossy(path_cmd.path())
            ),
            LoadCommand::Dylib(path_cmd) => println!(
                "{:3}: dylib {}",
                index,
                String::from_utf8_lossy(path_cmd.path())
            ),
            LoadCommand::Main(main_cmd) => {
                println!("{:3}: main, entry offset {:#x}", index, main_cmd.entryoff)
            }
            LoadCommand::VersionMin(version_min) => {
                println!("{:3}: version min {:#x}", index, version_min.version)
            }
            LoadCommand::SourceVersion(_) => println!("{:3}: source version", index),
            LoadCommand::Uuid(_) => println!("{:3}: uuid", index),
            LoadCommand::LinkeditData(data_cmd) => println!(
                "{:3}: linkedit data (cmd {:#x}) {:#x}+{:#x}",
                index, data_cmd.cmd, data_cmd.dataoff, data_cmd.datasize
            ),
            LoadCommand::Raw(bytes) => {
                println!("{:3}: unparsed command ({} bytes)", index, bytes.len())
            }
        }
    }
}
