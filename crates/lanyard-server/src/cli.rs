use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "lanyard-server", about = "Lanyard chat and voice gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/lanyard.toml")]
    pub config: String,

    /// Print a gateway token for the given roster user id and exit
    #[arg(long, value_name = "USER_ID")]
    pub issue_token: Option<i64>,
}
