use std::process;

use clap::Parser;

#[macro_use]
extern crate log;

fn main() {
    let cli = parser::Cli::parse();
    if let Err(e) = cli.serialize() {
        warn!("failed to serialize command line arguments: {e}");
    }

    if let Err(e) = radseq_assemble_cli::run(&cli) {
        error!("{e:#}");
        process::exit(1);
    }
}
