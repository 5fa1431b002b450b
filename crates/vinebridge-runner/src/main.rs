//! Runner binary. Spawned under Wine by the vinebridge shim.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use vinebridge_runner::PluginBridge;

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = env::args_os().skip(1);
    let (Some(plugin_path), Some(socket_path)) = (args.next(), args.next()) else {
        eprintln!("usage: vinebridge-runner <plugin.dll> <socket path>");
        return ExitCode::FAILURE;
    };

    match PluginBridge::run(&PathBuf::from(plugin_path), &PathBuf::from(socket_path)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(%e, "bridge session failed");
            ExitCode::FAILURE
        }
    }
}
