// vim: tw=80
//! User-facing configuration, environment overrides, and the on-disk
//! configuration file that records a file's striping parameters.

use serde_derive::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::Write as _,
    fs,
    io,
    path::{Path, PathBuf},
};
use crate::{
    topology::IocSelection,
    types::*,
    util::num_digits,
};

/// Default stripe size: 32 MiB
pub const DEFAULT_STRIPE_SIZE: u64 = 32 * 1024 * 1024;

/// Default number of worker tasks per I/O concentrator
pub const DEFAULT_THREAD_POOL_SIZE: usize = 4;

/// Names of the environment variables that may override the configuration
pub mod env_var {
    pub const STRIPE_SIZE: &str = "H5FD_SUBFILING_STRIPE_SIZE";
    pub const IOC_PER_NODE: &str = "H5FD_SUBFILING_IOC_PER_NODE";
    pub const IOC_SELECTION_CRITERIA: &str =
        "H5FD_SUBFILING_IOC_SELECTION_CRITERIA";
    pub const SUBFILE_PREFIX: &str = "H5FD_SUBFILING_SUBFILE_PREFIX";
    pub const CONFIG_FILE_PREFIX: &str = "H5FD_SUBFILING_CONFIG_FILE_PREFIX";
    pub const THREAD_POOL_SIZE: &str = "H5FD_IOC_THREAD_POOL_SIZE";
}

/// A snapshot of environment variables.
///
/// It's read once when a file is opened.  Tests can construct one directly
/// instead of modifying the process environment.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Env {
    vars: HashMap<String, String>
}

impl Env {
    /// Capture the current process environment
    pub fn from_process() -> Self {
        std::env::vars().collect()
    }

    /// Return a variable's value, treating empty values as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Parse a variable as an integer, in either decimal or `0x` hexadecimal
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(parse_int)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Env {
    fn from_iter<I: IntoIterator<Item=(K, V)>>(iter: I) -> Self {
        let vars = iter.into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Env{vars}
    }
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s))
    };
    let v = if let Some(hex) = digits.strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };
    Some(if neg { -v } else { v })
}

/// Parameters for opening a subfiled file.
///
/// Fields left as `None` take their values from the file's configuration file
/// when opening an existing file, or from the defaults when creating one.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SubfilingConfig {
    /// Size in bytes of each stripe
    pub stripe_size: Option<u64>,
    /// Number of subfiles.  Defaults to the number of I/O concentrators.
    pub stripe_count: Option<usize>,
    pub ioc_selection: IocSelection,
    /// Number of worker tasks on each I/O concentrator
    pub thread_pool_size: usize,
    /// Directory for the subfiles.  Defaults to the logical file's directory.
    pub subfile_prefix: Option<PathBuf>,
    /// Directory for the configuration file.  Defaults to `subfile_prefix`.
    pub config_prefix: Option<PathBuf>,
}

impl Default for SubfilingConfig {
    fn default() -> Self {
        SubfilingConfig {
            stripe_size: None,
            stripe_count: None,
            ioc_selection: IocSelection::default(),
            thread_pool_size: DEFAULT_THREAD_POOL_SIZE,
            subfile_prefix: None,
            config_prefix: None
        }
    }
}

impl SubfilingConfig {
    pub fn stripe_size(&self) -> u64 {
        self.stripe_size.unwrap_or(DEFAULT_STRIPE_SIZE)
    }

    /// Apply environment overrides.
    ///
    /// The stripe size may only be overridden when creating a file, because an
    /// existing file's stripe size is recorded in its configuration file.
    pub fn with_env(mut self, env: &Env, create: bool, comm_size: usize)
        -> Result<Self>
    {
        if create {
            if let Some(ss) = env.get_int(env_var::STRIPE_SIZE) {
                if ss > 0 {
                    self.stripe_size = Some(ss as u64);
                }
            }
        }
        self.ioc_selection = self.selection_from_env(env, comm_size)?;
        if let Some(n) = env.get_int(env_var::THREAD_POOL_SIZE) {
            if n > 0 {
                self.thread_pool_size = n as usize;
            }
        }
        if let Some(p) = env.get(env_var::SUBFILE_PREFIX) {
            self.subfile_prefix = Some(PathBuf::from(p));
        }
        if let Some(p) = env.get(env_var::CONFIG_FILE_PREFIX) {
            self.config_prefix = Some(PathBuf::from(p));
        }
        Ok(self)
    }

    /// The selection criteria variable is either `<code>:<value>` or just
    /// `<value>`, which applies to the configured policy.  An unusable value
    /// falls back to one IOC per node.
    fn selection_from_env(&self, env: &Env, comm_size: usize)
        -> Result<IocSelection>
    {
        let mut code = self.ioc_selection.code();
        let mut valstr = None;
        if let Some(criteria) = env.get(env_var::IOC_SELECTION_CRITERIA) {
            match criteria.split_once(':') {
                Some((c, v)) => {
                    code = parse_int(c).ok_or(Error::EINVAL)?;
                    valstr = Some(v);
                }
                None => valstr = Some(criteria)
            }
        }
        let default_value = if code == self.ioc_selection.code() {
            self.ioc_selection.value()
        } else {
            1
        };
        match IocSelection::from_code(code, default_value)? {
            IocSelection::OnePerNode(mut per_node) => {
                if comm_size > 1 {
                    if let Some(n) = env.get_int(env_var::IOC_PER_NODE) {
                        if n > 0 {
                            per_node = n as usize;
                        }
                    }
                }
                Ok(IocSelection::OnePerNode(per_node))
            },
            sel => {
                let value = match valstr {
                    None => Some(sel.value() as i64),
                    Some(v) => parse_int(v)
                };
                match value {
                    Some(v) if v > 0 => IocSelection::from_code(code, v as usize),
                    _ => Ok(IocSelection::OnePerNode(1))
                }
            }
        }
    }
}

/// Name of one subfile.  `idx` is 1-based.
pub fn subfile_name(base: &str, file_id: u64, idx: usize, count: usize)
    -> String
{
    let width = num_digits(count);
    format!("{}.subfile_{}_{:0width$}_of_{}", base, file_id, idx, count,
            width = width)
}

/// Name of a file's configuration file
pub fn config_file_name(base: &str, file_id: u64) -> String {
    format!("{}.subfile_{}.config", base, file_id)
}

/// The final path component of `path`, as a string
pub fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_owned)
        .ok_or(Error::EINVAL)
}

/// Contents of a configuration file
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ConfigFile {
    pub stripe_size: u64,
    pub aggregator_count: usize,
    pub subfile_count: usize,
    pub hdf5_file: PathBuf,
    pub subfile_dir: PathBuf,
    pub subfiles: Vec<String>,
}

impl ConfigFile {
    pub fn new(
        stripe_size: u64,
        aggregator_count: usize,
        subfile_count: usize,
        hdf5_file: &Path,
        subfile_dir: &Path,
        file_id: u64
    ) -> Result<Self>
    {
        let base = base_name(hdf5_file)?;
        let subfiles = (1..=subfile_count)
            .map(|i| subfile_name(&base, file_id, i, subfile_count))
            .collect();
        Ok(ConfigFile {
            stripe_size,
            aggregator_count,
            subfile_count,
            hdf5_file: hdf5_file.to_owned(),
            subfile_dir: subfile_dir.to_owned(),
            subfiles
        })
    }

    pub fn render(&self) -> String {
        let mut s = String::new();
        // Writing to a String can't fail
        let _ = writeln!(s, "stripe_size={}", self.stripe_size);
        let _ = writeln!(s, "aggregator_count={}", self.aggregator_count);
        let _ = writeln!(s, "subfile_count={}", self.subfile_count);
        let _ = writeln!(s, "hdf5_file={}", self.hdf5_file.display());
        let _ = writeln!(s, "subfile_dir={}", self.subfile_dir.display());
        for name in self.subfiles.iter() {
            let _ = writeln!(s, "{}", name);
        }
        s
    }

    /// Parse a configuration file.  The stripe size and subfile count are
    /// mandatory, and must be positive.
    pub fn parse(s: &str) -> Result<Self> {
        let mut stripe_size = None;
        let mut subfile_count = None;
        let mut aggregator_count = 0;
        let mut hdf5_file = PathBuf::new();
        let mut subfile_dir = PathBuf::new();
        let mut subfiles = Vec::new();
        for line in s.lines().filter(|l| !l.is_empty()) {
            match line.split_once('=') {
                Some(("stripe_size", v)) => {
                    stripe_size = parse_int(v).filter(|&v| v > 0);
                    if stripe_size.is_none() {
                        return Err(Error::EINVAL);
                    }
                }
                Some(("subfile_count", v)) => {
                    subfile_count = parse_int(v).filter(|&v| v > 0);
                    if subfile_count.is_none() {
                        return Err(Error::EINVAL);
                    }
                }
                Some(("aggregator_count", v)) => {
                    aggregator_count = v.trim().parse()
                        .map_err(|_| Error::EINVAL)?;
                }
                Some(("hdf5_file", v)) => hdf5_file = PathBuf::from(v),
                Some(("subfile_dir", v)) => subfile_dir = PathBuf::from(v),
                _ => subfiles.push(line.to_owned())
            }
        }
        Ok(ConfigFile {
            stripe_size: stripe_size.ok_or(Error::EINVAL)? as u64,
            aggregator_count,
            subfile_count: subfile_count.ok_or(Error::EINVAL)? as usize,
            hdf5_file,
            subfile_dir,
            subfiles
        })
    }

    /// Read a configuration file, returning `None` if it doesn't exist
    pub fn read(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(s) => Self::parse(&s).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into())
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.render()).map_err(Error::from)
    }
}

// LCOV_EXCL_STOP
