use clap::Parser as ClapParser;
use ctf_ir::{Error, Reader};
use std::path::PathBuf;
use tokio::fs::File;
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tracing::error;

/// CTF trace async reader example
#[derive(Debug, clap::Parser)]
struct Opts {
    /// Trace directory (containing a `metadata` file and `stream_<n>` files)
    pub trace: PathBuf,

    /// Which stream file to decode
    pub stream_id: u32,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();

    let reader = Reader::open(&opts.trace)?;
    let decoder = reader.into_packet_decoder();

    let stream_path = opts.trace.join(format!("stream_{}", opts.stream_id));
    let file = File::open(&stream_path).await.map_err(Error::Io)?;

    let mut framed = FramedRead::new(file, decoder);

    while let Some(value) = framed.next().await {
        let packet = match value {
            Ok(p) => p,
            Err(e) => {
                error!("{e}");
                break;
            }
        };
        println!("{:#?}", packet.context);
        for (ts, event) in packet.events {
            println!("  @ {ts:?}: {} {:#?}", event.class_name, event.payload);
        }
    }

    Ok(())
}
