use anyhow::{Context as _, Result};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Command;

/// Keeps an external packet-filter set in sync with the set of live peers.
///
/// Implementations must be idempotent in intent: adding a present address or
/// removing an absent one is not an error worth failing over.
pub trait RouteSink: Send {
    /// Marks `addr` as a reachable mesh peer. A failure here aborts the
    /// peer endpoint's setup.
    fn add(&mut self, addr: IpAddr) -> Result<()>;

    /// Marks `addr` as unreachable again.
    fn remove(&mut self, addr: IpAddr) -> Result<()>;
}

/// [`RouteSink`] backed by the `ipset` command-line tool.
pub struct IpsetCli {
    program: PathBuf,
    set_name: String,
}

impl IpsetCli {
    pub fn new(set_name: impl Into<String>) -> Self {
        Self::with_program("ipset", set_name)
    }

    /// Substitutes the binary to invoke; tests point this at stand-ins.
    fn with_program(program: impl Into<PathBuf>, set_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            set_name: set_name.into(),
        }
    }

    fn argv(&self, op: &str, addr: IpAddr) -> [String; 3] {
        [op.to_owned(), self.set_name.clone(), addr.to_string()]
    }

    fn run(&self, op: &str, addr: IpAddr) -> Result<()> {
        let status = Command::new(&self.program)
            .args(self.argv(op, addr))
            .status()
            .with_context(|| format!("Failed to invoke `ipset {op} {}`", self.set_name))?;

        // A mismatch (entry already present / already gone) is not fatal.
        if !status.success() {
            tracing::warn!(%addr, set = %self.set_name, "`ipset {op}` exited with {status}");
        }

        Ok(())
    }
}

impl RouteSink for IpsetCli {
    fn add(&mut self, addr: IpAddr) -> Result<()> {
        self.run("add", addr)
    }

    fn remove(&mut self, addr: IpAddr) -> Result<()> {
        self.run("del", addr)
    }
}
