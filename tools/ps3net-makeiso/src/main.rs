#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use ps3net_fs::VirtualIso;

const COPY_BUFFER: usize = 1 << 20;

#[derive(Debug, Parser)]
#[command(name = "ps3net-makeiso")]
#[command(
    about = "Build an ISO9660 + Joliet image from a directory tree",
    long_about = None
)]
struct Cli {
    /// Path to the directory to make an ISO from.
    directory: PathBuf,

    /// Path to the output image (will be overwritten if it already exists).
    target: PathBuf,

    /// Enable PS3 mode: stamp the disc metadata sectors expected by a
    /// console, using PS3_GAME/PARAM.SFO from the directory.
    #[arg(long)]
    ps3_mode: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut iso = VirtualIso::build(&cli.directory, cli.ps3_mode)
        .with_context(|| format!("build image from {}", cli.directory.display()))?;

    let mut out = File::create(&cli.target)
        .with_context(|| format!("create {}", cli.target.display()))?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut offset = 0u64;
    loop {
        let n = iso.read_at(offset, &mut buf).context("read image")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write image")?;
        offset += n as u64;
    }
    out.flush().context("flush image")?;

    println!("Wrote {} ({} bytes)", cli.target.display(), offset);
    Ok(())
}
