//! Gateway entry point: CLI parsing, PID-file/signal lifecycle, and wiring the config
//! store, dispatcher, logger, and reload worker into a `pingora_core::server::Server`
//! (spec §6).

mod config;
mod core;
mod logging;
mod plugin;
mod proxy;
mod service;
mod utils;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use pingora::server::configuration::Opt;
use pingora::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use config::Config;
use core::{ConfigStore, ReloadWorker, Snapshot};
use logging::Logger;
use service::http::HttpService;

const PID_FILE: &str = "/tmp/gateway.pid";
const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONF_PATH: &str = "./config/config.yaml";

fn print_help() {
    println!(
        "gateway-go {VERSION}\n\n\
         Usage: gateway-go [OPTIONS]\n\n\
         Options:\n\
         \x20 -c <path>              Configuration file path (default: {DEFAULT_CONF_PATH})\n\
         \x20 -t                     Validate configuration and exit\n\
         \x20 -s <reload|stop|quit>  Send a signal to the running instance via its PID file\n\
         \x20 -v                     Print version and exit\n\
         \x20 -h                     Print this help and exit"
    );
}

/// Reads the PID file and delivers the signal that corresponds to `action` (spec §6):
/// `reload` -> SIGHUP, `stop` -> SIGTERM (graceful), `quit` -> SIGINT (fast).
fn send_signal(action: &str) -> ExitCode {
    let sig = match action {
        "reload" => libc::SIGHUP,
        "stop" => libc::SIGTERM,
        "quit" => libc::SIGINT,
        other => {
            eprintln!("unknown signal action '{other}', expected reload|stop|quit");
            return ExitCode::FAILURE;
        }
    };

    let pid_str = match fs::read_to_string(PID_FILE) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to read PID file {PID_FILE}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let pid: libc::pid_t = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("invalid PID in {PID_FILE}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rc = unsafe { libc::kill(pid, sig) };
    if rc != 0 {
        eprintln!("failed to signal process {pid}: {}", std::io::Error::last_os_error());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn write_pid_file() {
    let pid = std::process::id();
    if let Err(e) = fs::write(PID_FILE, pid.to_string()) {
        log::warn!("failed to write PID file {PID_FILE}: {e}");
    }
}

fn remove_pid_file() {
    let _ = fs::remove_file(PID_FILE);
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // `-s`/`-v` aren't pingora's own `Opt` flags, so they're scanned for up front - handing
    // the full argv to `Opt::parse_args()` with one of these present would fail to parse.
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-v" | "--version" => {
                println!("gateway-go {VERSION}");
                return ExitCode::SUCCESS;
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "-s" => {
                let Some(action) = iter.next() else {
                    eprintln!("-s requires an argument: reload|stop|quit");
                    return ExitCode::FAILURE;
                };
                return send_signal(action);
            }
            _ => {}
        }
    }

    let opt = Opt::parse_args();
    let conf_path = opt
        .conf
        .clone()
        .unwrap_or_else(|| DEFAULT_CONF_PATH.to_string());

    let gateway_config = match Config::load_from_yaml(&conf_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load configuration from {conf_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    if opt.test {
        println!("configuration at {conf_path} is valid");
        return ExitCode::SUCCESS;
    }

    let (snapshot, _retired) = match Snapshot::build(&gateway_config, plugin::registry(), None) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to build initial configuration snapshot: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = Arc::new(ConfigStore::new(snapshot));

    // `Config` doesn't derive `Clone` (`ServerConf`'s own `Clone`-ness isn't relied upon);
    // grab what's needed from `server`/`log` before `gateway_config.pingora` is moved below.
    let port = gateway_config.server.port;
    let logger = Logger::new(gateway_config.log.clone());
    logger.init_env_logger();

    write_pid_file();

    let http_service = HttpService::new(store.clone());

    let mut pingsix_server = Server::new_with_opt_and_conf(Some(opt), gateway_config.pingora);

    let mut proxy_service =
        http_proxy_service_with_name(&pingsix_server.configuration, http_service, "gateway-go");
    proxy_service.add_tcp(&format!("0.0.0.0:{port}"));

    pingsix_server.bootstrap();
    pingsix_server.add_service(proxy_service);
    pingsix_server.add_service(logger);
    pingsix_server.add_service(ReloadWorker::new(
        PathBuf::from(&conf_path),
        store,
        plugin::registry(),
    ));

    log::info!("gateway-go {VERSION} starting on port {port}");
    pingsix_server.run_forever();

    remove_pid_file();
    ExitCode::SUCCESS
}
