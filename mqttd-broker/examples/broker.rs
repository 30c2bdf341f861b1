#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;

use mqttd_broker::{Broker, DomainDef, DomainSettings};

#[derive(StructOpt, Debug)]
#[structopt(name = "broker", about = "a single-domain MQTT 3.1/3.1.1 broker")]
struct Opt {
    /// The address to listen on.
    #[structopt(short, long, default_value = "0.0.0.0:1883")]
    listen: String,

    /// Root directory for persistent session storage.
    #[structopt(short, long)]
    storage: Option<PathBuf>,

    /// Maximum concurrent connections; 0 is unlimited.
    #[structopt(short, long, default_value = "0")]
    conn_limit: usize,

    /// Largest accepted publish in bytes; 0 is unlimited.
    #[structopt(short, long, default_value = "0")]
    message_size_limit: usize,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    let mut settings = DomainSettings::default();
    settings.conn_limit = opt.conn_limit;
    settings.message_size_limit = opt.message_size_limit;

    let mut builder = Broker::builder()
        .domain(DomainDef::new("default").settings(settings))
        .anonymous("default");
    if let Some(storage) = opt.storage {
        builder = builder.storage_root(storage);
    }

    let broker = builder.start()?;
    let addr = broker.listen(&opt.listen)?;
    info!("serving MQTT on {}", addr);

    loop {
        thread::sleep(Duration::from_secs(60));
        debug!("{} connections", broker.connection_count());
    }
}
