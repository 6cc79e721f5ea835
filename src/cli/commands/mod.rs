use clap::{
    Arg, ArgAction, ColorChoice, Command,
    builder::styling::{AnsiColor, Effects, Styles},
};

pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    Command::new("db_replicator")
        .about("Logical database replication engine with configurable consistency")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(built_info::GIT_COMMIT_HASH.unwrap_or(env!("CARGO_PKG_VERSION")))
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port for the monitoring endpoints")
                .default_value("9433")
                .env("DB_REPLICATOR_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("primary-dsn")
                .long("primary-dsn")
                .help("Connection string of the primary database")
                .default_value("postgresql://postgres@localhost:5432/postgres")
                .env("DB_REPLICATOR_PRIMARY_DSN")
                .value_name("DSN"),
        )
        .arg(
            Arg::new("replica")
                .long("replica")
                .help("Replica as NAME=DSN; repeat the flag for each replica")
                .env("DB_REPLICATOR_REPLICAS")
                .value_name("NAME=DSN")
                .value_delimiter(',') // split CLI and env values by comma
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .help("Acknowledgement mode: synchronous, semi_sync or asynchronous")
                .default_value("asynchronous")
                .env("DB_REPLICATOR_MODE"),
        )
        .arg(
            Arg::new("min-replicas-sync")
                .long("min-replicas-sync")
                .help("Acks required per write in semi_sync mode")
                .default_value("1")
                .env("DB_REPLICATOR_MIN_REPLICAS_SYNC")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("queue-capacity")
                .long("queue-capacity")
                .help("Bounded per-replica event queue size")
                .default_value("10000")
                .env("DB_REPLICATOR_QUEUE_CAPACITY")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("ack-timeout-ms")
                .long("ack-timeout-ms")
                .help("Per-replica acknowledgement timeout in milliseconds")
                .default_value("5000")
                .env("DB_REPLICATOR_ACK_TIMEOUT_MS")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Increase verbosity, -vv for debug")
                .action(ArgAction::Count),
        )
}
