mod cli;

use clap::Parser;
use cli::{Cli, Command, ImageArgs};
use dmg_hfs::hfs::FileStat;
use dmg_hfs::hfs::filesystem::apple_to_unix_time;
use dmg_hfs::reader::ReaderCursor;
use dmg_hfs_util::{ConsoleProgress, Image, OpenOptions, SilentProgress, VolumeExtractor};
use snafu::{ResultExt, Snafu};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Top-level application errors for dmg-hfs-util.
#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to open image '{}'", path.display()))]
    OpenImage {
        path: PathBuf,
        source: dmg_hfs_util::OpenImageError,
    },

    #[snafu(display("{path}"))]
    Volume {
        path: String,
        source: dmg_hfs::hfs::Error,
    },

    #[snafu(display("failed to read {path}"))]
    ReadFile {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("failed to write to standard output"))]
    WriteOutput { source: std::io::Error },

    #[snafu(display("failed to extract volume"))]
    Extract {
        source: dmg_hfs_util::ExtractError,
    },

    #[snafu(display("failed to get current directory"))]
    GetCurrentDir { source: std::io::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[snafu::report]
fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Command::Info { image } => cmd_info(&image),
        Command::Ls { image, path } => cmd_ls(&image, &path),
        Command::Cat { image, path } => cmd_cat(&image, &path),
        Command::Stat { image, path } => cmd_stat(&image, &path),
        Command::Xattr { image, path, name } => cmd_xattr(&image, &path, name.as_deref()),
        Command::Extract {
            image,
            output,
            force,
            quiet,
        } => cmd_extract(&image, output.as_deref(), force, quiet),
    }
}

fn open(args: &ImageArgs) -> Result<Image> {
    let mut options = OpenOptions {
        partition: args.partition,
        ..OpenOptions::default()
    };

    if let Some(blocks) = args.file_cache {
        options.volume.file_cache_blocks = blocks;
    }

    if let Some(blocks) = args.tree_cache {
        options.volume.tree_cache_blocks = blocks;
    }

    let path = &args.image;

    if args.mmap {
        unsafe { dmg_hfs_util::open_image_mmap(path, &options).context(OpenImageSnafu { path }) }
    } else {
        dmg_hfs_util::open_image(path, &options).context(OpenImageSnafu { path })
    }
}

fn cmd_info(args: &ImageArgs) -> Result<()> {
    let image = open(args)?;
    let fs = image.filesystem();
    let volume = fs.volume();
    let (total, free) = fs.usage();

    println!("Image: {}", args.image.display());
    println!();

    match image.disk() {
        Some(disk) => {
            println!("Container:      UDIF (version {})", disk.trailer().version());
            println!("Partitions:");

            for (i, partition) in disk.partitions().iter().enumerate() {
                let marker = if Some(i) == image.partition_index() { '*' } else { ' ' };

                println!(
                    "  {marker}{i:>3}  {:<20}  {:<24}  offset 0x{:X}, {} bytes",
                    partition.kind, partition.name, partition.offset, partition.size
                );
            }
        }
        None => println!("Container:      none (raw volume)"),
    }

    println!();
    println!("Volume:         {}", if fs.is_hfsx() { "HFSX" } else { "HFS+" });
    println!("Block Size:     {} bytes", volume.block_size());
    println!("Size:           {} bytes", total);
    println!("Free:           {} bytes", free);
    println!("Files:          {}", volume.file_count());
    println!("Folders:        {}", volume.folder_count());
    // The volume header stores its creation date in local time.
    println!("Created:        {} (local)", apple_to_unix_time(volume.create_date()));

    if volume.embedded_offset() != 0 {
        println!("HFS Wrapper:    volume at 0x{:X}", volume.embedded_offset());
    }

    if fs.catalog().is_case_sensitive() {
        println!("Names:          case-sensitive");
    }

    Ok(())
}

/// Formats a mode like `ls -l` does.
fn mode_string(stat: &FileStat) -> String {
    let kind = match stat.mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '-',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);

    for shift in [6, 3, 0] {
        let bits = (stat.mode >> shift) & 7;
        out.push(if bits & 4 != 0 { 'r' } else { '-' });
        out.push(if bits & 2 != 0 { 'w' } else { '-' });
        out.push(if bits & 1 != 0 { 'x' } else { '-' });
    }

    out
}

fn cmd_ls(args: &ImageArgs, path: &str) -> Result<()> {
    let image = open(args)?;
    let entries = image
        .filesystem()
        .list_directory(path)
        .context(VolumeSnafu { path })?;

    for (name, stat) in entries {
        println!(
            "{}  {:>5} {:>5}  {:>12}  {}",
            mode_string(&stat),
            stat.uid,
            stat.gid,
            stat.size,
            name
        );
    }

    Ok(())
}

fn cmd_cat(args: &ImageArgs, path: &str) -> Result<()> {
    let image = open(args)?;
    let reader = image.filesystem().open_file(path).context(VolumeSnafu { path })?;
    let mut cursor = ReaderCursor::new(reader);
    let mut stdout = std::io::stdout().lock();

    std::io::copy(&mut cursor, &mut stdout).context(ReadFileSnafu { path })?;
    stdout.flush().context(WriteOutputSnafu)?;

    Ok(())
}

fn cmd_stat(args: &ImageArgs, path: &str) -> Result<()> {
    let image = open(args)?;
    let stat = image.filesystem().stat(path).context(VolumeSnafu { path })?;

    println!("Path:       {path}");
    println!("ID:         {}", stat.id);
    println!("Mode:       {} ({:o})", mode_string(&stat), stat.mode);
    println!("Owner:      {}:{}", stat.uid, stat.gid);
    println!("Size:       {} bytes", stat.size);
    println!("Blocks:     {}", stat.blocks);

    if stat.rdev != 0 {
        println!("Device:     {:#x}", stat.rdev);
    }

    // Seconds since the Unix epoch.
    println!("Accessed:   {}", stat.atime);
    println!("Modified:   {}", stat.mtime);
    println!("Changed:    {}", stat.ctime);
    println!("Created:    {}", stat.birthtime);

    Ok(())
}

fn cmd_xattr(args: &ImageArgs, path: &str, name: Option<&str>) -> Result<()> {
    let image = open(args)?;
    let fs = image.filesystem();

    let Some(name) = name else {
        for name in fs.list_xattr(path).context(VolumeSnafu { path })? {
            println!("{name}");
        }

        return Ok(());
    };

    let value = fs.get_xattr(path, name).context(VolumeSnafu { path })?;

    match std::str::from_utf8(&value) {
        Ok(text) if !text.contains('\0') => println!("{text}"),
        _ => {
            for (i, chunk) in value.chunks(16).enumerate() {
                let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{:08x}  {}", i * 16, hex.join(" "));
            }
        }
    }

    Ok(())
}

fn cmd_extract(args: &ImageArgs, output: Option<&Path>, force: bool, quiet: bool) -> Result<()> {
    let image = open(args)?;

    // Use the image's file name as default output directory name.
    let output_dir = match output {
        Some(path) => path.to_path_buf(),
        None => {
            let stem = args
                .image
                .file_stem()
                .map_or_else(|| "volume".into(), |s| s.to_os_string());

            std::env::current_dir().context(GetCurrentDirSnafu)?.join(stem)
        }
    };

    if !quiet {
        println!(
            "Extracting {} to {}...",
            args.image.display(),
            output_dir.display()
        );
    }

    let start = std::time::Instant::now();

    // Extract based on verbosity.
    if quiet {
        let extractor = VolumeExtractor::new(image.filesystem(), SilentProgress, force);
        extractor.extract(&output_dir).context(ExtractSnafu)?;
    } else {
        let extractor = VolumeExtractor::new(image.filesystem(), ConsoleProgress::new(), force);
        extractor.extract(&output_dir).context(ExtractSnafu)?;
    }

    let elapsed = start.elapsed();

    if !quiet {
        println!("Done in {:.2}s.", elapsed.as_secs_f64());
    }

    Ok(())
}
