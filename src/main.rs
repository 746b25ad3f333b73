//! Log Decompressor
//!
//! Expands binary log files written by `nanolog` back into text.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use nanolog::{DecodeError, LogReader};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "decompressor")]
#[command(about = "Render nanolog binary log files as text")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every record, one line each
    Decompress {
        /// Log file to read
        file: PathBuf,
        /// Write the text here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the log sites recorded in the file
    Dictionary {
        /// Log file to read
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let (writer, _guard) = tracing_appender::non_blocking(io::stderr());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(writer)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Decompress { file, output } => decompress(file, output),
        Commands::Dictionary { file } => dictionary(file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "decompression failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn decompress(file: PathBuf, output: Option<PathBuf>) -> Result<(), DecodeError> {
    let mut reader = LogReader::open(&file)?;
    let mut out: Box<dyn Write> = match output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let result = reader.decompress_to(&mut out);
    // Whatever was rendered before a fatal error is still worth keeping.
    out.flush()?;
    eprintln!("{}", reader.summary());
    result.map(|_| ())
}

fn dictionary(file: PathBuf) -> Result<(), DecodeError> {
    let mut reader = LogReader::open(&file)?;
    let sites = reader.read_dictionary()?;
    let mut out = BufWriter::new(io::stdout().lock());
    for site in &sites {
        let args: Vec<String> = site.arg_types.iter().map(|t| t.to_string()).collect();
        writeln!(
            out,
            "{:>6} {:<7} {} \"{}\" ({})",
            site.id,
            site.severity.as_str(),
            site.source_location,
            site.format_string,
            args.join(", ")
        )?;
    }
    out.flush()?;
    eprintln!("{} log sites", sites.len());
    Ok(())
}
