//! Walks the partition tree, pruning by directory level.
//!
//! The tree is `<base>/<year>/<pid>/<mid>/<files>`; a filter sees each
//! level's name and can cut whole subtrees before any file names are
//! parsed. Filters are plain structs with closed-over state rather than a
//! class hierarchy; [`LocalKeyFilter`] is the one the query path uses to
//! expand a `(pid, mid, hosts)` constraint into the concrete identity keys
//! present on disk.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

use tally_protocol::{HostAddr, LocalKey, StatId};

use super::writer::TAG_GAUGE;

/// Level-by-level predicates for a partition walk. The three directory
/// hooks prune subtrees; `accept_file` sees every surviving file name.
pub trait ScanFilter {
    fn accept_year(&mut self, _name: &str) -> bool {
        true
    }

    fn accept_product(&mut self, name: &str) -> bool;

    fn accept_module(&mut self, name: &str) -> bool;

    fn accept_file(&mut self, name: &str);
}

/// Walk the whole tree under `base` through `filter`. A missing base
/// directory is an empty store, not an error.
pub fn scan(base: &Path, filter: &mut dyn ScanFilter) -> io::Result<()> {
    let years = match fs::read_dir(base) {
        Ok(years) => years,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    for year in years.flatten() {
        let year_name = year.file_name();
        let Some(year_name) = year_name.to_str() else {
            continue;
        };
        if !is_dir(&year) || !filter.accept_year(year_name) {
            continue;
        }

        for product in fs::read_dir(year.path())?.flatten() {
            let product_name = product.file_name();
            let Some(product_name) = product_name.to_str() else {
                continue;
            };
            if !is_dir(&product) || !filter.accept_product(product_name) {
                continue;
            }

            for module in fs::read_dir(product.path())?.flatten() {
                let module_name = module.file_name();
                let Some(module_name) = module_name.to_str() else {
                    continue;
                };
                if !is_dir(&module) || !filter.accept_module(module_name) {
                    continue;
                }

                for file in fs::read_dir(module.path())?.flatten() {
                    let file_name = file.file_name();
                    let Some(file_name) = file_name.to_str() else {
                        continue;
                    };
                    filter.accept_file(file_name);
                }
            }
        }
    }

    Ok(())
}

fn is_dir(entry: &fs::DirEntry) -> bool {
    entry.file_type().map(|t| t.is_dir()).unwrap_or(false)
}

/// Collects every [`LocalKey`] whose gauge files match a `(pid, mid,
/// hosts)` constraint; zero means any, an empty host set means any host.
pub struct LocalKeyFilter<'a> {
    pid: u16,
    mid: u16,
    hosts: Option<&'a HashSet<HostAddr>>,
    pub keys: HashSet<LocalKey>,
}

impl<'a> LocalKeyFilter<'a> {
    pub fn new(pid: u16, mid: u16, hosts: Option<&'a HashSet<HostAddr>>) -> Self {
        LocalKeyFilter {
            pid,
            mid,
            hosts,
            keys: HashSet::new(),
        }
    }

    /// `MG_<pid>_<mid>_<iid>_<host>_<freq>.bin` → key, or `None` for
    /// anything that does not parse cleanly.
    fn parse_name(name: &str) -> Option<LocalKey> {
        let rest = name.strip_prefix(TAG_GAUGE)?.strip_prefix('_')?;
        let rest = rest.strip_suffix(".bin")?;

        let mut parts = rest.split('_');
        let pid = u16::from_str_radix(parts.next()?, 16).ok()?;
        let mid = u16::from_str_radix(parts.next()?, 16).ok()?;
        let iid = u16::from_str_radix(parts.next()?, 16).ok()?;
        let host: HostAddr = parts.next()?.parse().ok()?;
        parts.next()?; // frequency suffix
        if parts.next().is_some() {
            return None;
        }

        Some(LocalKey::new(host, StatId::new(pid, mid, iid)))
    }
}

impl ScanFilter for LocalKeyFilter<'_> {
    fn accept_product(&mut self, name: &str) -> bool {
        self.pid == 0 || u16::from_str_radix(name, 16).is_ok_and(|pid| pid == self.pid)
    }

    fn accept_module(&mut self, name: &str) -> bool {
        self.mid == 0 || u16::from_str_radix(name, 16).is_ok_and(|mid| mid == self.mid)
    }

    fn accept_file(&mut self, name: &str) {
        let Some(key) = Self::parse_name(name) else {
            debug!(message = "skipping unparseable file name", name);
            return;
        };
        if let Some(hosts) = self.hosts {
            if !hosts.contains(&key.host) {
                return;
            }
        }
        self.keys.insert(key);
    }
}
