use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{Instrument, info};

use mariadb_wire::{ClientConfig, Connection, span_command, telemetry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short = 'P', long, default_value_t = 3306)]
    port: u16,

    #[arg(short, long)]
    user: Option<String>,

    #[arg(short, long)]
    password: Option<String>,

    /// Default schema
    #[arg(short = 'D', long)]
    database: Option<String>,

    /// YAML file with client settings
    #[arg(long)]
    config: Option<String>,

    /// Extra option as `key=value`, may be repeated
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    /// Statement to run; without it the server is pinged
    #[arg(short = 'e', long)]
    query: Option<String>,

    /// Trace every packet
    #[arg(short, long)]
    verbose: bool,
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => ClientConfig::default(),
    };
    if let Some(user) = &args.user {
        config.user = user.clone();
    }
    if let Some(password) = &args.password {
        config.password = Some(password.clone());
    }
    if let Some(database) = &args.database {
        config.database = Some(database.clone());
    }
    for option in &args.options {
        let Some((key, value)) = option.split_once('=') else {
            bail!("option '{option}' is not in key=value form");
        };
        config.set_by_name(key.trim(), value.trim())?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.verbose)?;

    let config = build_config(&args)?;
    let mut conn = Connection::connect_tcp(&args.host, args.port, config)
        .await
        .with_context(|| format!("connecting to {}:{}", args.host, args.port))?;
    info!(
        version = conn.server_version().unwrap_or_default(),
        thread_id = conn.thread_id().unwrap_or_default(),
        "connected"
    );

    match &args.query {
        Some(sql) => run_query(&mut conn, sql).instrument(span_command!("query")).await?,
        None => {
            conn.ping().instrument(span_command!("ping")).await?;
            println!("server is alive");
        }
    }

    conn.close().await?;
    Ok(())
}

async fn run_query(conn: &mut Connection<tokio::net::TcpStream>, sql: &str) -> Result<()> {
    let Some(mut rs) = conn.query(sql).await? else {
        println!(
            "affected rows: {}\tlast insert id: {}",
            conn.affected_rows(),
            conn.last_insert_id()
        );
        return Ok(());
    };

    let header: Vec<String> = (0..rs.column_count())
        .map(|i| String::from_utf8_lossy(rs.column_name(i).unwrap_or_default()).into_owned())
        .collect();
    println!("{}", header.join("\t"));

    while rs.fetch_row(conn).await? {
        let row: Vec<String> = rs
            .fields()
            .map(|field| match field {
                Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
                None => "NULL".to_string(),
            })
            .collect();
        println!("{}", row.join("\t"));
    }
    info!(rows = rs.row_count(), warnings = conn.warning_count(), "query finished");
    Ok(())
}
