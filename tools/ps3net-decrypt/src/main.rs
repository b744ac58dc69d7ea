#![forbid(unsafe_code)]

use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use ps3net_fs::{decode_key_file, probe_3k3y, EncryptedIso, PlainFile, ThreeK3yProbe};

const COPY_BUFFER: usize = 1 << 20;

#[derive(Debug, Parser)]
#[command(name = "ps3net-decrypt")]
#[command(about = "Decrypt Redump and 3k3y PS3 disc images to plain ISOs", version)]
struct Cli {
    #[command(subcommand)]
    command: DecryptCommand,
}

#[derive(Debug, Subcommand)]
enum DecryptCommand {
    /// Decrypt a Redump image using its key file.
    Redump {
        /// Path to the Redump image to decrypt.
        image: PathBuf,
        /// Path to the key file (32 hex characters).
        key: PathBuf,
        /// Path to the output image. Must not already exist.
        output: PathBuf,
    },
    /// Decrypt a 3k3y image; the key is embedded in the fingerprint block.
    #[command(name = "3k3y")]
    ThreeK3y {
        /// Path to the 3k3y image to decrypt.
        image: PathBuf,
        /// Path to the output image. Must not already exist.
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        DecryptCommand::Redump { image, key, output } => {
            let raw = std::fs::read(&key)
                .with_context(|| format!("read key file {}", key.display()))?;
            let data1 = decode_key_file(&raw).context("decode key file")?;
            decrypt_to(&image, &data1, &output)
        }
        DecryptCommand::ThreeK3y { image, output } => {
            let file = PlainFile::open(&image)
                .with_context(|| format!("open image {}", image.display()))?;
            let data1 = match probe_3k3y(&file).context("probe image")? {
                ThreeK3yProbe::Encrypted { data1 } => data1,
                ThreeK3yProbe::MaskedOnly => bail!("image is not encrypted"),
                ThreeK3yProbe::NotThreeK3y => bail!("not a 3k3y image"),
            };
            decrypt_to(&image, &data1, &output)
        }
    }
}

fn decrypt_to(image: &Path, data1: &[u8; 16], output: &Path) -> anyhow::Result<()> {
    let file = PlainFile::open(image)
        .with_context(|| format!("open image {}", image.display()))?;
    // The region map header is cleared in the output so players treat the
    // result as a plain image.
    let iso = EncryptedIso::new(file, data1, true).context("parse encrypted image")?;

    let mut out = File::options()
        .write(true)
        .create_new(true)
        .open(output)
        .with_context(|| format!("create output {} (must not exist)", output.display()))?;

    println!("Decrypting image {} ...", image.display());

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut offset = 0u64;
    loop {
        let n = iso.read_at(offset, &mut buf).context("read image")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).context("write output")?;
        offset += n as u64;
    }
    out.flush().context("flush output")?;

    println!("Wrote {} ({} bytes)", output.display(), offset);
    Ok(())
}
