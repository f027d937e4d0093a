use clap::Parser;
use log::LevelFilter;
use watdbg::log::{StderrLogger, LOGGER_SWITCHER};
use watdbg::server;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on.
    #[clap(long, default_value = "127.0.0.1:8379")]
    listen: String,

    /// Exit after the first client connection ends.
    #[clap(long)]
    oneshot: bool,

    /// Increase log verbosity (repeatable).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    LOGGER_SWITCHER.switch(StderrLogger, filter);

    server::serve(&args.listen, args.oneshot)
}
