//! The `terrarun` binary.

use clap::Parser;
use terrarun::cli::{execute, Opts};

fn main() {
    let opts = Opts::parse();
    let code = match execute(opts) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("terrarun: {err}");
            1
        }
    };
    std::process::exit(code);
}
