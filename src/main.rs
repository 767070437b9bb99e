use anyhow::Result;
use clap::Parser;

mod cli;
mod controller;
mod display;
mod engine;
mod input;
mod payload;
mod port;
mod probe;
mod proto;
mod reader;
mod report;
mod stats;

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = cli::Cli::parse();
    match args.cmd {
        cli::Cmd::Run(opts) => controller::run(opts),
        cli::Cmd::Probe(opts) => probe::run(opts),
    }
}
