use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "adv-lab",
    about = "BLE advertising throughput experiment over an EZ-Serial command link"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Run the advertising throughput experiment
    Run(RunOpts),
    /// Query module identity and advertising setup, change nothing
    Probe(ProbeOpts),
}

#[derive(Args, Debug, Clone)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub dev: String,
    /// Baud rate
    #[arg(long, default_value_t = 115_200)]
    pub baud: u32,
    /// Enable RTS/CTS
    #[arg(long, default_value_t = false)]
    pub rtscts: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Advertised device name
    #[arg(long, default_value = "advlab")]
    pub name: String,
    /// Seconds between advertising payload refreshes
    #[arg(long, default_value_t = 5.0)]
    pub payload_update_interval: f64,
    /// Status display refresh rate in Hz
    #[arg(long, default_value_t = 30.0)]
    pub display_refresh_rate: f64,
    /// Initial advertising interval in milliseconds
    #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u32).range(20..=10_240))]
    pub adv_interval_ms: u32,
    /// Interval step applied per s/f keypress, in milliseconds
    #[arg(long, default_value_t = 500)]
    pub adv_interval_jump: u32,
    /// Measurement round window in seconds
    #[arg(long, default_value_t = 30.0)]
    pub round_secs: f64,
    /// Smallest generated payload in bytes (AD structure included)
    #[arg(long, default_value_t = 50)]
    pub payload_min: usize,
    /// Largest generated payload in bytes
    #[arg(long, default_value_t = 200)]
    pub payload_max: usize,
    /// Response timeout per command attempt, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
    /// Retries after a response timeout
    #[arg(long, default_value_t = 2)]
    pub retries: u32,
    /// Prefix for the CSV result files
    #[arg(long, default_value = "advlab")]
    pub out: String,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeOpts {
    #[command(flatten)]
    pub ser: SerialOpts,
    /// Response timeout in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub timeout_ms: u64,
}
