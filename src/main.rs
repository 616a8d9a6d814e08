use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use migratectl::{
    MigrateError, Result,
    cim::CimConnection,
    config::{ToolConfig, parse_host_port},
    logger,
    migration::{self, MigrationSettings, PollOptions, VirtType},
};
use tracing::warn;

#[derive(Parser)]
#[command(name = "migratectl")]
#[command(about = "Validate and trigger live migration of a guest via CIM/WBEM")]
#[command(version = "0.1.0")]
struct Cli {
    /// Name of the guest to migrate
    guest: Option<String>,

    /// URL of the source CIMOM to connect to (host:port)
    #[arg(short = 's', long = "src-url")]
    src_url: Option<String>,

    /// URL of the target CIMOM to connect to (host:port)
    #[arg(short = 't', long = "target-url")]
    target_url: Option<String>,

    /// Namespace (default is root/virt)
    #[arg(short = 'N', long = "ns")]
    namespace: Option<String>,

    /// Auth username for the CIMOM on the source system
    #[arg(short = 'u', long = "user")]
    user: Option<String>,

    /// Auth password for the CIMOM on the source system
    #[arg(short = 'p', long = "pass")]
    password: Option<String>,

    /// Virtualization type [ Xen | KVM ]
    #[arg(short = 'v', long = "virt-type")]
    virt_type: Option<String>,

    /// Migration type: [ live | resume | restart | other ]
    #[arg(long = "migration-type")]
    migration_type: Option<String>,

    /// Disable migration pre-check
    #[arg(long = "disable-check")]
    disable_check: bool,

    /// Give up polling after this many seconds (default: wait indefinitely)
    #[arg(long = "timeout", value_name = "SECS")]
    timeout: Option<u64>,

    /// Path to a TOML file with connection defaults
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "migratectl=debug");
        }
    }
    logger::init_logger();

    if let Err(err) = run(cli) {
        println!("{}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) if path.exists() => ToolConfig::from_file(path)?,
        Some(path) => {
            warn!("config file not found at {}, using defaults", path.display());
            ToolConfig::default()
        }
        None => ToolConfig::default(),
    };

    let guest = cli.guest.ok_or(MigrateError::MissingGuest)?;
    let virt_raw = cli.virt_type.ok_or(MigrateError::MissingVirtType)?;
    let virt = VirtType::parse(&virt_raw)?;

    let src_url = cli.src_url.unwrap_or(config.src_url);
    let target_url = cli.target_url.unwrap_or(config.target_url);
    let namespace = cli.namespace.unwrap_or(config.namespace);
    let user = cli.user.or(config.user);
    let password = cli.password.or(config.password);

    // Ports are accepted in both URLs but only the hostnames are used; the
    // connection falls back to the CIMOM default port.
    let (src_host, _src_port) = parse_host_port(&src_url);
    let (target_host, _target_port) = parse_host_port(&target_url);

    let conn = CimConnection::new(&src_host, &namespace, user, password);

    let guest_ref = migration::guest_ref(&guest, virt);

    let settings_mof = match &cli.migration_type {
        Some(migration_type) => Some(MigrationSettings::new(migration_type, virt).to_mof()),
        None => {
            println!("Using default MigrationSettingData");
            None
        }
    };

    if !cli.disable_check {
        migration::check_migratable(&conn, &guest_ref, &target_host, settings_mof.as_deref(), virt)?;
    }

    println!("Migrating {}.. this will take some time.", guest);

    let job_ref =
        migration::migrate_to_host(&conn, &guest_ref, &target_host, settings_mof.as_deref(), virt)?;

    // Ctrl-C during the wait aborts the poll gracefully instead of killing
    // the process; the migration itself keeps running remotely.
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.store(true, Ordering::SeqCst))
            .map_err(|err| MigrateError::Config(format!("cannot install signal handler: {}", err)))?;
    }

    let options = PollOptions {
        timeout: cli.timeout.map(Duration::from_secs),
        ..PollOptions::default()
    };

    let status = migration::poll_job(&conn, &job_ref, &cancel, options)?;
    println!("Migrate job succeeded: {}", status);
    Ok(())
}
