//! Extract the volumes of a UBI image from a raw flash dump.
//!
//! Every named volume in the image's volume table is written to its own file, named by prefixing
//! the volume name (by default, `rootfs` becomes `dmp_rootfs`).

use anyhow::{Context, Result};
use clap::Parser;

use std::fs::File;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use ubidump::ubi::{
    extract_volumes, plan_volumes, scan_image, BlockContent, DirSink, ExtractSummary, ScanResult,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The raw flash dump to read
    image: PathBuf,

    /// Prefix for the name of each volume's output file
    #[clap(long, default_value = "dmp_")]
    prefix: String,

    /// Directory to write the volumes into
    #[clap(long, default_value = ".")]
    output_dir: PathBuf,

    /// Print a summary of every eraseblock and volume found, without writing anything
    #[clap(long)]
    list: bool,

    /// Don't display progress
    #[clap(long)]
    quiet: bool,
}

fn print_overview(result: &ScanResult) {
    for block in &result.blocks {
        let vid = &block.vid;
        let content = match &block.content {
            BlockContent::VolumeTable(_) => "volume table".to_string(),
            BlockContent::Data(data) => format!("{:?}, {} bytes", vid.volume_type(), data.len()),
        };
        println!(
            "{:#010x} => vol {:#x} lnum {:4} ec {:4}: {content}",
            block.offset, vid.vol_id, vid.lnum, block.ec.ec
        );
    }

    for failure in &result.failures {
        println!("{:#010x} => unreadable: {}", failure.offset, failure.error);
    }
}

fn format_ranges(ranges: &[RangeInclusive<u64>]) -> String {
    if ranges.is_empty() {
        return "none".to_string();
    }

    let ranges: Vec<_> = ranges
        .iter()
        .map(|x| match x.start() == x.end() {
            true => x.start().to_string(),
            false => format!("{}-{}", x.start(), x.end()),
        })
        .collect();
    ranges.join(", ")
}

fn print_volumes(result: &ScanResult) -> Result<()> {
    let table = result
        .volume_table()
        .context("no volume table found in image")?;

    for volume in plan_volumes(&result.blocks, table) {
        let vol_type = match volume.record.volume_type() {
            Some(x) => format!("{x:?}"),
            None => format!("type {}", volume.record.vol_type),
        };
        println!(
            "Volume {:3} {:16} {vol_type:8} reserved PEBs: {:5} blocks: {:5} missing: {}",
            volume.vol_id,
            volume.name(),
            volume.record.reserved_pebs,
            volume.block_count,
            format_ranges(&volume.missing_ranges()),
        );
    }

    Ok(())
}

fn extract(args: &Cli, result: &ScanResult) -> Result<ExtractSummary> {
    let table = result
        .volume_table()
        .context("no volume table found in image")?;

    let mut sink = DirSink::new(&args.output_dir, &args.prefix);
    Ok(extract_volumes(&result.blocks, table, &mut sink))
}

fn print_summary(args: &Cli, summary: &ExtractSummary) {
    let sink = DirSink::new(&args.output_dir, &args.prefix);
    for report in &summary.written {
        let path = sink
            .path_for(report.volume.name())
            .map(|x| x.display().to_string())
            .unwrap_or_default();
        println!(
            "[+] {path}: {} bytes from {} of {} blocks",
            report.bytes_written, report.fragments, report.volume.block_count
        );
    }

    for (volume, error) in &summary.failed {
        eprintln!("[-] Volume {} ({}): {error:#}", volume.vol_id, volume.name());
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    if !args.quiet {
        howudoin::init(howudoin::consumers::TermLine::default());
    }

    let file = File::open(&args.image).with_context(|| args.image.display().to_string())?;
    let mut result = scan_image(file);

    let summary = match args.list {
        true => None,
        false => Some(extract(&args, &result)),
    };

    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    println!(
        "{} eraseblocks found ({} unreadable)",
        result.blocks.len() + result.failures.len(),
        result.failures.len()
    );

    let failed_volumes = match summary {
        None => {
            print_overview(&result);
            print_volumes(&result)?;
            0
        }
        Some(summary) => {
            let summary = summary?;
            print_summary(&args, &summary);
            summary.failed.len()
        }
    };

    if let Some(error) = result.fatal.take() {
        return Err(error).context(format!("reading {}", args.image.display()));
    }
    anyhow::ensure!(failed_volumes == 0, "{failed_volumes} volume(s) could not be written");

    Ok(())
}

#[test]
fn test_format_ranges() {
    assert_eq!(format_ranges(&[]), "none");
    assert_eq!(format_ranges(&[1..=1, 6..=0xFFFF_FFFE]), "1, 6-4294967294");
}
