use std::sync::Arc;

use clap::Parser;

use serterm::console;
use serterm::device;
use serterm::input::{self, HotKeySlot, PumpConfig};
use serterm::options::{self, Cli, ColorArg};
use serterm::print;
use serterm::session::Session;
use serterm::socket;

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();

    if cli.list_devices {
        device::port::list_devices();
        return;
    }
    if let Some(color) = &cli.color {
        if matches!(options::parse_color(color), Ok(ColorArg::List)) {
            print::list_colors();
            return;
        }
    }

    let opts = match options::resolve(&cli) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("Error: {message}");
            std::process::exit(1);
        }
    };

    print::init(opts.color, opts.mute);

    let interactive = console::is_interactive();

    if interactive {
        if let Err(e) = console::configure_stdin() {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
    if let Err(e) = console::configure_stdout(interactive) {
        console::restore_all();
        eprintln!("Error: {e}");
        std::process::exit(1);
    }

    let hotkey = Arc::new(HotKeySlot::new());
    let device_fd_cell = input::new_device_fd_cell();
    let input_rx = input::spawn_pump(
        PumpConfig {
            interactive,
            prefix_enabled: opts.prefix_enabled && interactive,
            prefix_code: opts.prefix_code,
        },
        hotkey.clone(),
        device_fd_cell.clone(),
    );

    let socket_hub = match &opts.socket {
        Some(spec) => match socket::configure(spec).await {
            Ok(hub) => Some(hub),
            Err(e) => {
                console::restore_all();
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    let mut session = Session::new(
        opts,
        interactive,
        input_rx,
        hotkey,
        device_fd_cell,
        socket_hub,
    );
    let code = session.run().await;

    console::restore_all();
    std::process::exit(code);
}
