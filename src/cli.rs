use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "empresa-fabric", about = "Company scraping fabric: proxy pool, gates, breaker, prober, orchestrator")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a batch of companies and run it to completion, printing the
    /// final status object as JSON.
    Submit {
        /// Path to a JSON file of `[{registration_id, url?, trade_name?, city?}]`
        #[arg(short, long)]
        input: String,

        /// Comma-separated proxy endpoints (http://host:port, socks5://host:port)
        #[arg(short, long, value_delimiter = ',')]
        proxies: Vec<String>,

        /// Number of worker tasks draining the batch queue
        #[arg(short = 'n', long, default_value = "8")]
        workers: usize,
    },
    /// Run a single demo crawl against one company URL and print the
    /// resulting pages/fail-reason, using an in-memory candidate source
    /// and result sink.
    Demo {
        /// Candidate URL to scrape
        #[arg(short, long)]
        url: String,

        /// Comma-separated proxy endpoints
        #[arg(short, long, value_delimiter = ',')]
        proxies: Vec<String>,
    },
    /// Print the fabric's recognised configuration keys and their defaults.
    ShowConfig,
}
