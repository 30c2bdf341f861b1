#[macro_use]
extern crate log;

use std::process;
use std::time::Duration;

use anyhow::Result;
use structopt::StructOpt;

use mqttd_client::{Client, ClientOptions, QoS};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sub_client",
    about = "an MQTT 3.1/3.1.1 client for subscribing to topics"
)]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// The id to use for this client.
    #[structopt(short, long)]
    id: Option<String>,

    /// The number of seconds between PING commands keeping the connection alive.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u16,

    /// Disconnect and reconnect with the same session state.
    #[structopt(short = "c", long)]
    disable_clean_session: bool,

    /// Provide a username to be used for authenticating with the broker.
    #[structopt(short, long)]
    username: Option<String>,

    /// Provide a password to be used for authenticating with the broker.
    #[structopt(short = "P", long)]
    password: Option<String>,

    /// The maximum QoS to request for the subscriptions.
    #[structopt(short, long, default_value = "0")]
    qos: u8,

    /// The topic filters to subscribe to.
    topics: Vec<String>,
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();

    if opt.topics.is_empty() {
        eprintln!("at least one topic filter is required");
        process::exit(1);
    }

    let qos = match opt.qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        other => {
            eprintln!("invalid QoS {}", other);
            process::exit(1);
        }
    };

    let mut options = match opt.id {
        Some(id) => ClientOptions::new(id),
        None => ClientOptions::anonymous(),
    };
    options = options
        .clean_session(!opt.disable_clean_session)
        .keep_alive(opt.keep_alive);
    if let (Some(username), Some(password)) = (opt.username, opt.password) {
        options = options.credentials(username, password.into_bytes());
    }

    let client = Client::connect(&opt.host, opt.port, options)?;
    info!("connected as `{}`", client.client_id());

    for topic in &opt.topics {
        let granted = client.subscribe(topic, qos)?;
        info!("subscribed to `{}`: {:?}", topic, granted);
    }

    loop {
        match client.recv(Duration::from_secs(60))? {
            Some(msg) => println!("{} {}", msg.topic, String::from_utf8_lossy(&msg.payload)),
            None => trace!("no message within the window"),
        }
    }
}
