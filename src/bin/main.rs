//! Command-line entry point for the `torrentula` single-torrent client.

use std::{fs, path::PathBuf, process::ExitCode};

use clap::Parser;
use torrentula_rs::{
    conf::{Conf, PieceSelection},
    engine::Client,
    metainfo::Metainfo,
};

/// Download (and optionally seed) a single torrent.
#[derive(Parser, Debug)]
#[command(name = "torrentula", version, about)]
struct Args {
    /// Path to the `.torrent` file to download.
    #[arg(long = "torr")]
    torrent: PathBuf,

    /// Directory to download the file into (and seed from).
    #[arg(long = "dest")]
    dest: PathBuf,

    /// TCP port to listen for inbound peer connections on.
    #[arg(long, default_value_t = torrentula_rs::conf::DEFAULT_PORT)]
    port: u16,

    /// Discard any previous partial download and bitfield before starting.
    #[arg(long)]
    clean: bool,

    /// Keep seeding the completed file after the download finishes.
    #[arg(long)]
    seed: bool,

    /// Verified-completion percentage (0-100) at which endgame mode begins.
    #[arg(long, default_value_t = 95.0)]
    endgame: f64,

    /// Use the rarest-first piece selection strategy.
    #[arg(long, conflicts_with_all = ["random", "propshare"])]
    rarest: bool,

    /// Use the uniformly random piece selection strategy.
    #[arg(long, conflicts_with_all = ["rarest", "propshare"])]
    random: bool,

    /// Use the proportional-share piece selection strategy.
    #[arg(long, conflicts_with_all = ["rarest", "random"])]
    propshare: bool,

    /// Increase log verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> torrentula_rs::Result<()> {
    if !args.dest.is_dir() {
        fs::create_dir_all(&args.dest)?;
    }

    let raw = fs::read(&args.torrent)?;
    let metainfo = Metainfo::from_bytes(&raw)?;

    let mut conf = Conf::new(args.dest);
    conf.engine.port = args.port;
    conf.torrent.clean = args.clean;
    conf.torrent.seed_after_completion = args.seed;
    conf.torrent.endgame_threshold = args.endgame;
    conf.torrent.piece_selection = if args.rarest {
        PieceSelection::RarestFirst
    } else if args.random {
        PieceSelection::Random
    } else if args.propshare {
        PieceSelection::ProportionalShare
    } else {
        PieceSelection::Default
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let mut client = Client::new(conf, metainfo).await?;
        client.run().await
    })
}
