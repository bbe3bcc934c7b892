use clap::Parser as ClapParser;
use ctf_ir::Reader;
use std::path::PathBuf;
use tracing::error;

/// CTF trace reader example
#[derive(Debug, clap::Parser)]
struct Opts {
    /// Trace directory (containing a `metadata` file and `stream_<n>` files)
    pub trace: PathBuf,
}

fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let reader = match Reader::open(&opts.trace) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    let streams = match reader.read_all() {
        Ok(s) => s,
        Err(e) => {
            error!("{e}");
            return;
        }
    };

    for stream in streams {
        for (ts, event) in stream.events {
            println!("stream {} @ {ts:?}: {} {:#?}", stream.stream_id, event.class_name, event.payload);
        }
    }
}
