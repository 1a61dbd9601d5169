use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use fuser::MountOption;

use drivebox::config::Config;
use drivebox::fs::content::ContentCache;
use drivebox::fs::DriveBoxFS;
use drivebox::graph::{Auth, GraphClient};

fn main() -> ExitCode {
    let mount_point = match std::env::args_os().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: drivebox <mountpoint>");
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_env(mount_point) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::new()
        .parse_filters(&config.log_level)
        .init();

    let auth = match Auth::from_file(&config.auth_file()) {
        Ok(auth) => auth,
        Err(err) => {
            log::error!(
                "Could not load auth tokens from {}: {}. Run the authentication flow first.",
                config.auth_file().display(),
                err
            );
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            log::error!("Could not start async runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let content = match ContentCache::open(&config.db_file()) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            log::error!("Could not open cache database: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let client = Arc::new(GraphClient::new(auth));
    let filesystem = match DriveBoxFS::new(client, content, rt.handle().clone()) {
        Ok(filesystem) => filesystem,
        Err(err) => {
            log::error!("Could not initialize filesystem: {}", err);
            return ExitCode::FAILURE;
        }
    };
    filesystem.start_poller(config.poll_interval);

    let options = [
        MountOption::FSName("drivebox".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    log::info!("Mounting drivebox at {}.", config.mount_point.display());
    match fuser::mount2(filesystem, &config.mount_point, &options) {
        Ok(()) => {
            log::info!("Filesystem unmounted cleanly.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            log::error!("FUSE mount error: {}", err);
            ExitCode::FAILURE
        }
    }
}
