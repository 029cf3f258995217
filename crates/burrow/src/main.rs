mod burrow;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "burrow",
    version,
    about = "Burrow - reverse tunnel server exposing local HTTP services on public hostnames"
)]
struct Cli {
    /// Path to Burrow config file (.toml/.yaml/.yml). If omitted, uses BURROW_CONFIG; then auto-detects burrow.toml > burrow.yaml > burrow.yml from CWD; then falls back to the OS default path (Linux: /etc/burrow/burrow.toml; others: user config dir).
    #[arg(long, env = "BURROW_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    burrow::run(cli.config).await
}
