use anyhow::{Context as _, Result};
use clap::Parser;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{FromRawFd as _, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tun::Tun;
use tunmesh::{Config, Eventloop, Handle, IpsetCli};

/// Userspace L3 mesh forwarder.
///
/// Bridges a local TUN device with a full mesh of TCP links: one link per
/// peer pair, initiated by whichever side has the lower address. A kernel
/// ipset is kept in sync with the peers that are actually connected.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Name of the TUN device to create.
    #[arg(long, env = "TUNMESH_TUN_NAME", default_value = "tm0", conflicts_with = "tun_fd")]
    tun_name: String,

    /// Use an already-configured TUN file descriptor instead of creating a
    /// device.
    #[arg(long, env = "TUNMESH_TUN_FD")]
    tun_fd: Option<RawFd>,

    /// File listing one peer host per line. SIGHUP reloads it.
    #[arg(long, env = "TUNMESH_PEER_FILE")]
    peer_file: PathBuf,

    /// Our own mesh address within IPv4.
    #[arg(long, env = "TUNMESH_IPV4_ADDRESS")]
    ipv4_address: Option<Ipv4Addr>,

    /// Our own mesh address within IPv6.
    #[arg(long, env = "TUNMESH_IPV6_ADDRESS")]
    ipv6_address: Option<Ipv6Addr>,

    /// The TCP port every node of the mesh listens on and dials.
    #[arg(long, env = "TUNMESH_PORT", default_value_t = 3066)]
    port: u16,

    /// Name of the kernel ipset tracking reachable peers.
    #[arg(long, env = "TUNMESH_IPSET_NAME", default_value = "tunmesh")]
    ipset_name: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    match try_main(cli) {
        Ok(()) => {
            tracing::info!("Goodbye!");

            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{e:#}");

            ExitCode::FAILURE
        }
    }
}

fn try_main(cli: Cli) -> Result<()> {
    anyhow::ensure!(
        cli.ipv4_address.is_some() || cli.ipv6_address.is_some(),
        "at least one of --ipv4-address and --ipv6-address is required"
    );

    let tun = match cli.tun_fd {
        // Safety: The caller asserted via the CLI that this is an open TUN fd we now own.
        Some(fd) => Tun::from_fd(unsafe { OwnedFd::from_raw_fd(fd) })
            .context("Failed to adopt TUN fd")?,
        None => Tun::create(&cli.tun_name).context("Failed to create TUN device")?,
    };

    tracing::info!(device = %tun.name(), "TUN device ready");

    let config = Config {
        peer_file: cli.peer_file,
        self_v4: cli.ipv4_address,
        self_v6: cli.ipv6_address,
        port: cli.port,
    };

    let (mut eventloop, handle) =
        Eventloop::new(config, tun, Box::new(IpsetCli::new(cli.ipset_name)))?;

    install_signal_handlers(handle)?;

    tracing::info!(port = cli.port, "Joining mesh");

    eventloop.run()
}

fn install_signal_handlers(handle: Handle) -> Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

    let reload = handle.clone();
    // Safety: `request_reload` only touches an atomic and an eventfd write,
    // both async-signal-safe.
    unsafe { signal_hook::low_level::register(SIGHUP, move || reload.request_reload()) }
        .context("Failed to install SIGHUP handler")?;

    for signal in [SIGINT, SIGTERM] {
        let stop = handle.clone();
        // Safety: as above.
        unsafe { signal_hook::low_level::register(signal, move || stop.request_stop()) }
            .context("Failed to install stop signal handler")?;
    }

    Ok(())
}
