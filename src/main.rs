//! The `spoolctl` command line binary.

#![allow(missing_docs)]
#![allow(clippy::missing_docs_in_private_items)]

use clap::Parser;
use spoolctl::cli::Cli;

fn main() {
    let cli = Cli::parse();

    match spoolctl::run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:?}", anyhow::Error::from(err));
            std::process::exit(2);
        }
    }
}
