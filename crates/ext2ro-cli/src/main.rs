#![forbid(unsafe_code)]
//! `ext2ro`: inspect, browse and mount ext2 images without writing to them.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use ext2ro::{FileType, FsOps, InodeAttr, InodeNumber, OpenOptions, Volume};
use ext2ro_fuse::MountOptions;
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Bytes requested per `read` call by `cat`.
const CAT_CHUNK: u32 = 64 * 1024;

#[derive(Debug, Parser)]
#[command(name = "ext2ro", version, about = "Read-only access to ext2 filesystem images")]
struct Cli {
    /// Open the image without geometry and feature checks.
    #[arg(long, global = true)]
    skip_validation: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace). `RUST_LOG` wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the superblock summary and volume geometry.
    Inspect {
        image: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// List a directory.
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a file's content to stdout.
    Cat { image: PathBuf, path: String },
    /// Print inode attributes.
    Stat {
        image: PathBuf,
        path: String,
        #[arg(long)]
        json: bool,
    },
    /// Print a symbolic link's target.
    Readlink { image: PathBuf, path: String },
    /// Mount the image read-only via FUSE and serve until unmounted.
    Mount {
        image: PathBuf,
        mountpoint: PathBuf,
        #[arg(long)]
        allow_other: bool,
        #[arg(long)]
        no_auto_unmount: bool,
    },
}

#[derive(Debug, Serialize)]
struct InspectOutput {
    volume_name: String,
    uuid: String,
    last_mounted: String,
    rev_level: u32,
    state: u16,
    block_size: u32,
    blocks_count: u32,
    free_blocks_count: u32,
    reserved_blocks_count: u32,
    inodes_count: u32,
    free_inodes_count: u32,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    groups_count: u32,
    volume_size: u64,
    features_compat: Vec<&'static str>,
    features_incompat: Vec<&'static str>,
    features_ro_compat: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct ListEntry {
    ino: InodeNumber,
    kind: FileType,
    name: String,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(error) = run(cli) {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let options = OpenOptions {
        skip_validation: cli.skip_validation,
    };
    let stdout = io::stdout();
    let mut out = stdout.lock();

    match cli.command {
        Command::Inspect { image, json } => {
            inspect(&open_volume(&image, &options)?, json, &mut out)
        }
        Command::Ls { image, path, json } => {
            list(&open_volume(&image, &options)?, &path, json, &mut out)
        }
        Command::Cat { image, path } => cat(&open_volume(&image, &options)?, &path, &mut out),
        Command::Stat { image, path, json } => {
            stat(&open_volume(&image, &options)?, &path, json, &mut out)
        }
        Command::Readlink { image, path } => {
            readlink(&open_volume(&image, &options)?, &path, &mut out)
        }
        Command::Mount {
            image,
            mountpoint,
            allow_other,
            no_auto_unmount,
        } => {
            drop(out);
            mount_cmd(&image, &mountpoint, &options, allow_other, !no_auto_unmount)
        }
    }
}

fn open_volume(image: &Path, options: &OpenOptions) -> Result<Volume> {
    Volume::open_with_options(image, options)
        .with_context(|| format!("failed to open ext2 image: {}", image.display()))
}

fn resolve(vol: &Volume, path: &str) -> Result<InodeNumber> {
    let (ino, _) = vol
        .resolve_path(path)
        .with_context(|| format!("cannot resolve {path}"))?;
    Ok(ino)
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let mut s = String::with_capacity(36);
    for (i, byte) in uuid.iter().enumerate() {
        if matches!(i, 4 | 6 | 8 | 10) {
            s.push('-');
        }
        s.push_str(&format!("{byte:02x}"));
    }
    s
}

fn feature_list(names: &[&str]) -> String {
    if names.is_empty() {
        "(none)".to_owned()
    } else {
        names.join(" ")
    }
}

fn inspect(vol: &Volume, json: bool, out: &mut impl Write) -> Result<()> {
    let sb = vol.superblock();
    let geo = vol.geometry();
    let output = InspectOutput {
        volume_name: sb.volume_name.clone(),
        uuid: format_uuid(&sb.uuid),
        last_mounted: sb.last_mounted.clone(),
        rev_level: sb.rev_level,
        state: sb.state,
        block_size: geo.block_size,
        blocks_count: geo.blocks_count,
        free_blocks_count: sb.free_blocks_count,
        reserved_blocks_count: sb.reserved_blocks_count,
        inodes_count: geo.inodes_count,
        free_inodes_count: sb.free_inodes_count,
        first_data_block: sb.first_data_block,
        blocks_per_group: geo.blocks_per_group,
        inodes_per_group: geo.inodes_per_group,
        inode_size: geo.inode_size,
        groups_count: geo.groups_count,
        volume_size: geo.volume_size,
        features_compat: sb.feature_compat.describe(),
        features_incompat: sb.feature_incompat.describe(),
        features_ro_compat: sb.feature_ro_compat.describe(),
    };

    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        )?;
        return Ok(());
    }

    writeln!(out, "ext2ro inspector")?;
    writeln!(out, "volume_name: {}", output.volume_name)?;
    writeln!(out, "uuid: {}", output.uuid)?;
    writeln!(out, "last_mounted: {}", output.last_mounted)?;
    writeln!(out, "rev_level: {}", output.rev_level)?;
    writeln!(out, "state: {}", output.state)?;
    writeln!(out, "block_size: {}", output.block_size)?;
    writeln!(
        out,
        "blocks: {} ({} free, {} reserved)",
        output.blocks_count, output.free_blocks_count, output.reserved_blocks_count
    )?;
    writeln!(
        out,
        "inodes: {} ({} free)",
        output.inodes_count, output.free_inodes_count
    )?;
    writeln!(out, "first_data_block: {}", output.first_data_block)?;
    writeln!(out, "blocks_per_group: {}", output.blocks_per_group)?;
    writeln!(out, "inodes_per_group: {}", output.inodes_per_group)?;
    writeln!(out, "inode_size: {}", output.inode_size)?;
    writeln!(out, "groups_count: {}", output.groups_count)?;
    writeln!(out, "volume_size: {}", output.volume_size)?;
    writeln!(out, "features_compat: {}", feature_list(&output.features_compat))?;
    writeln!(
        out,
        "features_incompat: {}",
        feature_list(&output.features_incompat)
    )?;
    writeln!(
        out,
        "features_ro_compat: {}",
        feature_list(&output.features_ro_compat)
    )?;
    Ok(())
}

fn kind_char(kind: FileType) -> char {
    match kind {
        FileType::RegularFile => '-',
        FileType::Directory => 'd',
        FileType::Symlink => 'l',
        FileType::BlockDevice => 'b',
        FileType::CharDevice => 'c',
        FileType::Fifo => 'p',
        FileType::Socket => 's',
    }
}

fn list(vol: &Volume, path: &str, json: bool, out: &mut impl Write) -> Result<()> {
    let ino = resolve(vol, path)?;
    let mut entries = Vec::new();
    let mut cookie = 0;
    loop {
        let page = vol
            .readdir(ino, cookie)
            .with_context(|| format!("cannot list {path}"))?;
        let Some(last) = page.last() else { break };
        cookie = last.offset;
        entries.extend(page.into_iter().map(|entry| ListEntry {
            ino: entry.ino,
            kind: entry.kind,
            name: entry.name_str(),
        }));
    }

    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&entries).context("serialize output")?
        )?;
        return Ok(());
    }
    for entry in &entries {
        writeln!(out, "{} {:>8} {}", kind_char(entry.kind), entry.ino, entry.name)?;
    }
    Ok(())
}

fn cat(vol: &Volume, path: &str, out: &mut impl Write) -> Result<()> {
    let ino = resolve(vol, path)?;
    let mut offset = 0_u64;
    loop {
        let chunk = vol
            .read(ino, offset, CAT_CHUNK)
            .with_context(|| format!("cannot read {path} at offset {offset}"))?;
        if chunk.is_empty() {
            break;
        }
        out.write_all(&chunk)?;
        offset += chunk.len() as u64;
    }
    out.flush()?;
    Ok(())
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

fn stat(vol: &Volume, path: &str, json: bool, out: &mut impl Write) -> Result<()> {
    let ino = resolve(vol, path)?;
    let attr: InodeAttr = vol
        .getattr(ino)
        .with_context(|| format!("cannot stat {path}"))?;

    if json {
        writeln!(
            out,
            "{}",
            serde_json::to_string_pretty(&attr).context("serialize output")?
        )?;
        return Ok(());
    }
    writeln!(out, "path: {path}")?;
    writeln!(out, "inode: {}", attr.ino)?;
    writeln!(out, "kind: {:?}", attr.kind)?;
    writeln!(out, "size: {}", attr.size)?;
    writeln!(out, "blocks: {}", attr.blocks)?;
    writeln!(out, "mode: {:04o}", attr.perm)?;
    writeln!(out, "links: {}", attr.nlink)?;
    writeln!(out, "uid: {}", attr.uid)?;
    writeln!(out, "gid: {}", attr.gid)?;
    if matches!(attr.kind, FileType::CharDevice | FileType::BlockDevice) {
        writeln!(out, "rdev: {:#x}", attr.rdev)?;
    }
    writeln!(out, "atime: {}", unix_secs(attr.atime))?;
    writeln!(out, "mtime: {}", unix_secs(attr.mtime))?;
    writeln!(out, "ctime: {}", unix_secs(attr.ctime))?;
    Ok(())
}

fn readlink(vol: &Volume, path: &str, out: &mut impl Write) -> Result<()> {
    let ino = resolve(vol, path)?;
    let target = vol
        .readlink(ino)
        .with_context(|| format!("cannot read link {path}"))?;
    out.write_all(&target)?;
    out.write_all(b"\n")?;
    Ok(())
}

fn mount_cmd(
    image: &Path,
    mountpoint: &Path,
    options: &OpenOptions,
    allow_other: bool,
    auto_unmount: bool,
) -> Result<()> {
    let vol = open_volume(image, options)?;
    let geo = vol.geometry();
    eprintln!(
        "Mounting ext2 image (block_size={}, blocks={}, groups={}) read-only at {}",
        geo.block_size,
        geo.blocks_count,
        geo.groups_count,
        mountpoint.display()
    );

    let opts = MountOptions {
        allow_other,
        auto_unmount,
        fs_name: image.display().to_string(),
    };
    info!(
        target: "ext2ro::cli",
        image = %image.display(),
        mountpoint = %mountpoint.display(),
        allow_other,
        auto_unmount,
        "mounting"
    );
    let metrics = ext2ro_fuse::mount(Box::new(vol), mountpoint, &opts)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;
    info!(
        target: "ext2ro::cli",
        requests = metrics.requests_total,
        failed = metrics.requests_err,
        bytes_read = metrics.bytes_read,
        "unmounted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use ext2ro_harness::{Geometry, ImageBuilder};
    use tempfile::NamedTempFile;

    fn image_file() -> NamedTempFile {
        let mut builder = ImageBuilder::new(Geometry::new(1024));
        let greeting = builder.add_file(InodeNumber::ROOT, "greeting.txt", b"hello world\n");
        builder.set_attrs(greeting, 1000, 100, 1_700_000_000);
        let docs = builder.add_dir(InodeNumber::ROOT, "docs");
        let body: Vec<u8> = (0..200_000_u32).map(|i| (i % 251) as u8).collect();
        builder.add_file(docs, "big.bin", &body);
        builder.add_symlink(InodeNumber::ROOT, "hello", b"greeting.txt");
        let file = NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), builder.build().bytes).expect("write image");
        file
    }

    fn open(file: &NamedTempFile) -> Volume {
        open_volume(file.path(), &OpenOptions::default()).expect("open")
    }

    fn text(out: Vec<u8>) -> String {
        String::from_utf8(out).expect("utf-8 output")
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_flags_parse_after_the_subcommand() {
        let cli = Cli::try_parse_from(["ext2ro", "ls", "disk.img", "-vv", "--skip-validation"])
            .expect("parse");
        assert_eq!(cli.verbose, 2);
        assert!(cli.skip_validation);
        match cli.command {
            Command::Ls { path, json, .. } => {
                assert_eq!(path, "/");
                assert!(!json);
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["ext2ro", "mount", "disk.img", "/mnt", "--no-auto-unmount"])
            .expect("parse");
        assert!(matches!(
            cli.command,
            Command::Mount {
                allow_other: false,
                no_auto_unmount: true,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["ext2ro", "cat", "disk.img"]).is_err());
    }

    #[test]
    fn inspect_reports_geometry() {
        let file = image_file();
        let vol = open(&file);

        let mut out = Vec::new();
        inspect(&vol, false, &mut out).expect("inspect");
        let report = text(out);
        assert!(report.contains("volume_name: ext2ro-test"));
        assert!(report.contains("block_size: 1024"));
        assert!(report.contains("uuid: 01020304-0506-0708-090a-0b0c0d0e0f10"));
        assert!(report.contains("features_incompat: FILETYPE"));

        let mut out = Vec::new();
        inspect(&vol, true, &mut out).expect("inspect json");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["block_size"], 1024);
        assert_eq!(value["groups_count"], 1);
        assert_eq!(value["features_incompat"][0], "FILETYPE");
    }

    #[test]
    fn ls_lists_entries_in_disk_order() {
        let file = image_file();
        let vol = open(&file);

        let mut out = Vec::new();
        list(&vol, "/", false, &mut out).expect("ls");
        let names: Vec<String> = text(out)
            .lines()
            .map(|line| line.rsplit(' ').next().unwrap_or_default().to_owned())
            .collect();
        assert_eq!(names, vec![".", "..", "greeting.txt", "docs", "hello"]);

        let mut out = Vec::new();
        list(&vol, "/docs", true, &mut out).expect("ls json");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value[2]["name"], "big.bin");
        assert_eq!(value[2]["kind"], "RegularFile");

        let err = list(&vol, "/greeting.txt", false, &mut Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("cannot list /greeting.txt"));
    }

    #[test]
    fn cat_streams_whole_files() {
        let file = image_file();
        let vol = open(&file);

        let mut out = Vec::new();
        cat(&vol, "/greeting.txt", &mut out).expect("cat");
        assert_eq!(out, b"hello world\n");

        let mut out = Vec::new();
        cat(&vol, "/docs/big.bin", &mut out).expect("cat big");
        assert_eq!(out.len(), 200_000);
        assert!(out.iter().enumerate().all(|(i, b)| *b == (i % 251) as u8));

        let err = cat(&vol, "/docs", &mut Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("is a directory"));
        let err = cat(&vol, "/missing", &mut Vec::new()).unwrap_err();
        assert!(format!("{err:#}").contains("cannot resolve /missing"));
    }

    #[test]
    fn stat_and_readlink() {
        let file = image_file();
        let vol = open(&file);

        let mut out = Vec::new();
        stat(&vol, "/greeting.txt", false, &mut out).expect("stat");
        let report = text(out);
        assert!(report.contains("size: 12"));
        assert!(report.contains("uid: 1000"));
        assert!(report.contains("mtime: 1700000000"));

        let mut out = Vec::new();
        stat(&vol, "/docs", true, &mut out).expect("stat json");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("json");
        assert_eq!(value["kind"], "Directory");
        assert_eq!(value["nlink"], 2);

        let mut out = Vec::new();
        readlink(&vol, "/hello", &mut out).expect("readlink");
        assert_eq!(out, b"greeting.txt\n");
        assert!(readlink(&vol, "/greeting.txt", &mut Vec::new()).is_err());
    }

    #[test]
    fn mount_rejects_an_empty_mountpoint() {
        let file = image_file();
        let err = mount_cmd(
            file.path(),
            Path::new(""),
            &OpenOptions::default(),
            false,
            true,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("FUSE mount failed"));
    }

    #[test]
    fn open_failure_names_the_image() {
        let file = NamedTempFile::new().expect("tempfile");
        std::fs::write(file.path(), vec![0_u8; 4096]).expect("write");
        let err = open_volume(file.path(), &OpenOptions::default()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to open ext2 image"));
    }
}
