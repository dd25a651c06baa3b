use std::sync::Arc;

use clap::Parser;

use eventd::config::Config;
use eventd::constants::EVENTD_DEFAULT_CONFIG_FILE;
use eventd::daemon::start::start_eventd_daemon;


/// Distributes CMDB change events to subscribers.
#[derive(clap::Parser)]
#[command(version)]
struct Args {
    /// Override the path to the config file
    #[arg(
        short, long,
        value_name = "FILE",
        default_value = EVENTD_DEFAULT_CONFIG_FILE,
    )]
    config: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match Config::create(&args.config) {
        Ok(config) => {
            if let Err(e) = start_eventd_daemon(Arc::new(config), None).await {
                eprintln!("eventd failed: {e}");
                ::std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("{e}");
            ::std::process::exit(1);
        }
    }
}
