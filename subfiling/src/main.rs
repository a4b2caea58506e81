// vim: tw=80
use std::{
    io::{self, Write},
    path::PathBuf,
    process::exit,
};

use clap::{crate_version, Parser};
use serde_derive::Serialize;
use subfiling_core::{
    config::{ConfigFile, SubfilingConfig},
    file::{config_path, remove_files},
    stripe::StripeGeometry,
    Error,
    Result,
};
use tracing_subscriber::EnvFilter;

/// Where to look for a file's subfiles and configuration file
#[derive(Parser, Clone, Debug, Default)]
struct Prefixes {
    /// Directory containing the subfiles, if not the logical file's
    #[clap(long)]
    subfile_prefix: Option<PathBuf>,
    /// Directory containing the configuration file, if not the subfiles'
    #[clap(long)]
    config_prefix:  Option<PathBuf>,
}

impl Prefixes {
    fn config(&self) -> SubfilingConfig {
        SubfilingConfig {
            subfile_prefix: self.subfile_prefix.clone(),
            config_prefix: self.config_prefix.clone(),
            ..Default::default()
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Print a subfiled file's striping configuration
struct Info {
    #[clap(flatten)]
    prefixes: Prefixes,
    /// Path to the logical file
    file:     PathBuf,
}

impl Info {
    fn main(self) -> Result<()> {
        let path = config_path(&self.file, &self.prefixes.config())?;
        let cf = ConfigFile::read(&path)?.ok_or_else(|| {
            eprintln!("No configuration file at {}", path.display());
            Error::ENOENT
        })?;
        let s = serde_yaml_ng::to_string(&cf)
            .map_err(Error::unhandled_error)?;
        io::stdout().write_all(s.as_bytes())?;
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
struct MapRow {
    ioc:            usize,
    subfile:        usize,
    subfile_offset: u64,
    logical_offset: u64,
    len:            u64,
}

#[derive(Parser, Clone, Debug)]
/// Show how a logical byte range is divided among subfiles
struct Map {
    /// Stripe size in bytes
    #[clap(short, long, required(true))]
    stripe_size: u64,
    /// Number of subfiles
    #[clap(short = 'n', long, required(true))]
    subfiles:    usize,
    /// Number of I/O concentrators.  Defaults to the number of subfiles.
    #[clap(short, long)]
    iocs:        Option<usize>,
    /// Print YAML instead of a table
    #[clap(short, long)]
    yaml:        bool,
    /// Logical offset of the range
    offset:      u64,
    /// Length of the range
    len:         u64,
}

impl Map {
    fn rows(&self) -> Result<Vec<MapRow>> {
        let geometry = StripeGeometry::new(self.stripe_size, self.subfiles)?;
        let iocs = self.iocs.unwrap_or(self.subfiles);
        if iocs == 0 || iocs > self.subfiles {
            eprintln!("There must be between 1 and {} IOCs", self.subfiles);
            return Err(Error::EINVAL);
        }
        Ok(geometry.split(self.offset, self.len)
            .into_iter()
            .map(|seg| MapRow {
                ioc: seg.subfile % iocs,
                subfile: seg.subfile,
                subfile_offset: seg.subfile_offset,
                logical_offset: seg.logical_offset,
                len: seg.len
            }).collect())
    }

    fn main(self) -> Result<()> {
        let rows = self.rows()?;
        if self.yaml {
            let s = serde_yaml_ng::to_string(&rows)
                .map_err(Error::unhandled_error)?;
            io::stdout().write_all(s.as_bytes())?;
            return Ok(());
        }
        let stdout = io::stdout();
        let mut buf = io::BufWriter::new(stdout.lock());
        writeln!(buf, "{:>5} {:>7} {:>14} {:>14} {:>10}",
                 "IOC", "SUBFILE", "SUBFILE_OFFSET", "LOGICAL_OFFSET", "LENGTH")?;
        for r in rows {
            writeln!(buf, "{:>5} {:>7} {:>14} {:>14} {:>10}",
                     r.ioc, r.subfile, r.subfile_offset, r.logical_offset,
                     r.len)?;
        }
        buf.flush()?;
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Delete a subfiled file, including its subfiles and configuration file
struct Rm {
    #[clap(flatten)]
    prefixes: Prefixes,
    #[clap(required(true))]
    files:    Vec<PathBuf>,
}

impl Rm {
    fn main(self) -> Result<()> {
        let config = self.prefixes.config();
        for file in self.files.iter() {
            remove_files(file, &config).inspect_err(|e| {
                eprintln!("Cannot remove {}: {:?}", file.display(), e);
            })?;
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Info(Info),
    Map(Map),
    Rm(Rm),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli: Cli = Cli::parse();
    let r = match cli.cmd {
        SubCommand::Info(info) => info.main(),
        SubCommand::Map(map) => map.main(),
        SubCommand::Rm(rm) => rm.main(),
    };
    if let Err(e) = r {
        tracing::debug!("{e:?}");
        exit(i32::from(e));
    }
}
